//! # Chain Provider - Nonce and Fee Data Source
//!
//! ## Purpose
//!
//! Narrow view of the chain RPC that the engine depends on: confirmed account
//! nonces for ledger resync, recent fee history for the gas oracle, and receipt
//! lookups for relay inclusion watching. The trait keeps the engine testable
//! without a node; `EthersChainProvider` is the production implementation.
//!
//! ## Architecture Role
//!
//! ```text
//! Chain RPC ──→ [ChainProvider] ──→ NonceManager (resync)
//!                     │       └───→ GasPriceOracle (fee history)
//!                     └───────────→ FlashbotsRelay (inclusion watch)
//! ```

use crate::error::{ConfigError, ProviderError};
use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError as EthersProviderError};
use ethers::types::{Address, BlockNumber, H256, U256};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Reward percentile requested per block; the median tip is the sample
const MEDIAN_TIP_PERCENTILE: f64 = 50.0;

/// Fee data of one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockFeeSample {
    pub block_number: u64,
    pub base_fee_per_gas: U256,
    pub priority_fee_per_gas: U256,
}

/// Fee history response reduced to what the oracle consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeHistory {
    /// Oldest block first
    pub samples: Vec<BlockFeeSample>,
    /// Base fee of the block after the newest sample
    pub next_base_fee: U256,
}

#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Transaction count of `account` at the latest block
    async fn confirmed_nonce(&self, account: Address) -> Result<u64, ProviderError>;

    /// Fee samples for the most recent `block_count` blocks
    async fn fee_history(&self, block_count: u64) -> Result<FeeHistory, ProviderError>;

    async fn block_number(&self) -> Result<u64, ProviderError>;

    /// Block a transaction was mined in, if any
    async fn transaction_block(&self, tx_hash: H256) -> Result<Option<u64>, ProviderError>;
}

/// `ChainProvider` over an ethers HTTP provider with a pooled client
pub struct EthersChainProvider {
    provider: Provider<Http>,
    request_timeout: Duration,
}

impl EthersChainProvider {
    pub fn new(rpc_url: &str, request_timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(5)
            .timeout(request_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()?;

        let url: Url = rpc_url.parse()?;
        let provider = Provider::new(Http::new_with_client(url, client));

        Ok(Self {
            provider,
            request_timeout,
        })
    }

    async fn bounded<T, F>(&self, request: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, EthersProviderError>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_provider_error(&e)),
            Err(_) => Err(ProviderError::Timeout(self.request_timeout)),
        }
    }
}

#[async_trait]
impl ChainProvider for EthersChainProvider {
    async fn confirmed_nonce(&self, account: Address) -> Result<u64, ProviderError> {
        let count = self
            .bounded(
                self.provider
                    .get_transaction_count(account, Some(BlockNumber::Latest.into())),
            )
            .await?;
        u256_to_u64(count, "transaction count")
    }

    async fn fee_history(&self, block_count: u64) -> Result<FeeHistory, ProviderError> {
        let history = self
            .bounded(self.provider.fee_history(
                block_count,
                BlockNumber::Latest,
                &[MEDIAN_TIP_PERCENTILE],
            ))
            .await?;

        let oldest = u256_to_u64(history.oldest_block, "oldest block")?;
        let blocks = history.gas_used_ratio.len();
        if blocks == 0 || history.base_fee_per_gas.len() < blocks {
            return Err(ProviderError::invalid_response(format!(
                "fee history covers {} blocks with {} base fees",
                blocks,
                history.base_fee_per_gas.len()
            )));
        }

        let samples: Vec<BlockFeeSample> = (0..blocks)
            .map(|i| BlockFeeSample {
                block_number: oldest + i as u64,
                base_fee_per_gas: history.base_fee_per_gas[i],
                priority_fee_per_gas: history
                    .reward
                    .get(i)
                    .and_then(|rewards| rewards.first())
                    .copied()
                    .unwrap_or_default(),
            })
            .collect();

        let next_base_fee = history
            .base_fee_per_gas
            .get(blocks)
            .copied()
            .unwrap_or(samples[blocks - 1].base_fee_per_gas);

        debug!(blocks, oldest, "fetched fee history");
        Ok(FeeHistory {
            samples,
            next_base_fee,
        })
    }

    async fn block_number(&self) -> Result<u64, ProviderError> {
        let number = self.bounded(self.provider.get_block_number()).await?;
        Ok(number.as_u64())
    }

    async fn transaction_block(&self, tx_hash: H256) -> Result<Option<u64>, ProviderError> {
        let receipt = self
            .bounded(self.provider.get_transaction_receipt(tx_hash))
            .await?;
        Ok(receipt.and_then(|r| r.block_number).map(|n| n.as_u64()))
    }
}

fn u256_to_u64(value: U256, what: &str) -> Result<u64, ProviderError> {
    if value > U256::from(u64::MAX) {
        return Err(ProviderError::invalid_response(format!(
            "{} {} overflows u64",
            what, value
        )));
    }
    Ok(value.as_u64())
}

fn classify_provider_error(error: &EthersProviderError) -> ProviderError {
    let message = error.to_string();
    let lowered = message.to_ascii_lowercase();

    if lowered.contains("401")
        || lowered.contains("403")
        || lowered.contains("unauthorized")
        || lowered.contains("forbidden")
    {
        ProviderError::Authentication { message }
    } else if matches!(error, EthersProviderError::SerdeJson(_))
        || lowered.contains("deserialization")
    {
        ProviderError::InvalidResponse { message }
    } else {
        ProviderError::Transport { message }
    }
}
