//! Flashbots relay adapter
//!
//! `eth_sendBundle` authenticated with `X-Flashbots-Signature`: the relay's
//! auth wallet signs the hex keccak256 of the request body (EIP-191) and the
//! header carries `<address>:<signature>`. The auth wallet only identifies the
//! searcher for reputation; it never holds funds.

use super::jsonrpc::JsonRpcTransport;
use super::{Inclusion, RelayClient, RelayReceipt};
use crate::bundle::SignedBundle;
use crate::error::{ConfigError, RelayError};
use crate::logging::LogEmoji;
use crate::provider::ChainProvider;
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::H256;
use ethers::utils::keccak256;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

const SIGNATURE_HEADER: &str = "X-Flashbots-Signature";
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct FlashbotsRelay {
    name: String,
    transport: JsonRpcTransport,
    auth_wallet: LocalWallet,
    /// Receipt source for inclusion watching; acceptance only when absent
    inclusion_watch: Option<Arc<dyn ChainProvider>>,
}

impl FlashbotsRelay {
    pub fn new(
        name: impl Into<String>,
        url: &str,
        auth_wallet: LocalWallet,
        client: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            name: name.into(),
            transport: JsonRpcTransport::new(client, url)?,
            auth_wallet,
            inclusion_watch: None,
        })
    }

    pub fn with_inclusion_watch(mut self, provider: Arc<dyn ChainProvider>) -> Self {
        self.inclusion_watch = Some(provider);
        self
    }

    async fn signature_header(&self, body: &str) -> Result<HeaderMap, RelayError> {
        let digest = format!("0x{}", hex::encode(keccak256(body.as_bytes())));
        let signature = self
            .auth_wallet
            .sign_message(digest.as_bytes())
            .await
            .map_err(|e| RelayError::Authentication {
                message: format!("auth signing failed: {}", e),
            })?;

        let value = format!("{:?}:0x{}", self.auth_wallet.address(), signature);
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&value).map_err(|e| RelayError::Authentication {
                message: format!("invalid signature header: {}", e),
            })?,
        );
        Ok(headers)
    }

    /// Poll for the bundle's last transaction until it lands or the deadline
    /// passes. Runs after the relay took the bundle, so provider trouble here
    /// only ends the watch and is never a relay failure.
    async fn watch_inclusion(
        &self,
        provider: &Arc<dyn ChainProvider>,
        bundle: &SignedBundle,
        deadline: Instant,
    ) -> Option<u64> {
        let tx_hash = bundle.tx_hashes.last().copied()?;

        let poll = async {
            loop {
                match provider.transaction_block(tx_hash).await {
                    Ok(Some(block_number)) => return Some(block_number),
                    Ok(None) => {}
                    Err(e) if e.is_transient() => {
                        debug!(relay = %self.name, "receipt poll failed: {}", e)
                    }
                    Err(e) => {
                        warn!(relay = %self.name, "receipt watch abandoned: {}", e);
                        return None;
                    }
                }
                tokio::time::sleep_until((Instant::now() + RECEIPT_POLL_INTERVAL).min(deadline)).await;
                if Instant::now() >= deadline {
                    return None;
                }
            }
        };
        timeout_at(deadline, poll).await.ok().flatten()
    }
}

#[async_trait]
impl RelayClient for FlashbotsRelay {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_bundle(
        &self,
        bundle: &SignedBundle,
        deadline: Instant,
    ) -> Result<RelayReceipt, RelayError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RelayError::Timeout);
        }

        let body = self.transport.encode("eth_sendBundle", bundle.send_bundle_params());
        let headers = self.signature_header(&body).await?;

        debug!(
            relay = %self.name,
            bundle_hash = ?bundle.bundle_hash,
            target_block = bundle.target_block(),
            "{} Sending eth_sendBundle",
            LogEmoji::NETWORK
        );
        let result = self.transport.post(body, headers, remaining).await?;
        let bundle_hash = parse_bundle_hash(&result).or(Some(bundle.bundle_hash));

        let Some(provider) = &self.inclusion_watch else {
            return Ok(RelayReceipt {
                bundle_hash,
                inclusion: Inclusion::Accepted,
            });
        };

        let inclusion = match self.watch_inclusion(provider, bundle, deadline).await {
            Some(block_number) => {
                info!(relay = %self.name, block_number, "{} Bundle included", LogEmoji::SUCCESS);
                Inclusion::Included { block_number }
            }
            None => {
                debug!(relay = %self.name, bundle_hash = ?bundle_hash, "accepted, inclusion not observed before deadline");
                Inclusion::Accepted
            }
        };
        Ok(RelayReceipt {
            bundle_hash,
            inclusion,
        })
    }
}

/// `{"bundleHash": "0x.."}` as returned by Flashbots and most builders
pub(crate) fn parse_bundle_hash(result: &Value) -> Option<H256> {
    result
        .get("bundleHash")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}
