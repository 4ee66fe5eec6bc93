//! Plain block-builder endpoint (`eth_sendBundle`, optional bearer key)

use super::flashbots::parse_bundle_hash;
use super::jsonrpc::JsonRpcTransport;
use super::{Inclusion, RelayClient, RelayReceipt};
use crate::bundle::SignedBundle;
use crate::error::{ConfigError, RelayError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tokio::time::Instant;
use tracing::debug;

pub struct BuilderRelay {
    name: String,
    transport: JsonRpcTransport,
    api_key: Option<String>,
}

impl BuilderRelay {
    pub fn new(
        name: impl Into<String>,
        url: &str,
        api_key: Option<String>,
        client: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            name: name.into(),
            transport: JsonRpcTransport::new(client, url)?,
            api_key,
        })
    }

    fn headers(&self) -> Result<HeaderMap, RelayError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|e| {
                RelayError::Authentication {
                    message: format!("invalid api key header: {}", e),
                }
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl RelayClient for BuilderRelay {
    fn name(&self) -> &str {
        &self.name
    }

    /// Builders only acknowledge receipt; inclusion is never reported here
    async fn submit_bundle(
        &self,
        bundle: &SignedBundle,
        deadline: Instant,
    ) -> Result<RelayReceipt, RelayError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RelayError::Timeout);
        }

        let result = self
            .transport
            .call("eth_sendBundle", bundle.send_bundle_params(), self.headers()?, remaining)
            .await?;
        debug!(relay = %self.name, url = %self.transport.url(), "bundle accepted by builder");

        Ok(RelayReceipt {
            bundle_hash: parse_bundle_hash(&result).or(Some(bundle.bundle_hash)),
            inclusion: Inclusion::Accepted,
        })
    }
}
