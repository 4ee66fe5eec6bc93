//! # Relay Adapters - Bundle Delivery Backends
//!
//! ## Purpose
//!
//! One capability interface, `RelayClient::submit_bundle`, over a closed set of
//! backends. Each adapter owns its authentication and maps backend responses
//! and failures into `RelayReceipt` / classified `RelayError`.
//!
//! ## Integration Points
//!
//! - **Flashbots**: `eth_sendBundle` with `X-Flashbots-Signature`, optional receipt watching
//! - **Builder**: plain `eth_sendBundle`, optional bearer key
//! - **Scripted**: deterministic outcomes for tests and dry runs
//!
//! ## Architecture Role
//!
//! ```text
//! BundleSubmitter ──submit_bundle(bundle, deadline)──→ [RelayBackend]
//!                                                      ├─ FlashbotsRelay ─→ JsonRpcTransport
//!                                                      ├─ BuilderRelay ───→ JsonRpcTransport
//!                                                      └─ ScriptedRelay
//! ```

mod builder;
mod flashbots;
pub mod jsonrpc;
mod scripted;

pub use builder::BuilderRelay;
pub use flashbots::FlashbotsRelay;
pub use scripted::{ScriptedOutcome, ScriptedRelay};

use crate::bundle::SignedBundle;
use crate::config::{RelayEndpointConfig, RelayKind};
use crate::error::{ConfigError, RelayError};
use crate::provider::ChainProvider;
use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::H256;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How far a relay got with the bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Inclusion {
    Included { block_number: u64 },
    /// Simulated and accepted, inclusion not (yet) observed
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayReceipt {
    pub bundle_hash: Option<H256>,
    pub inclusion: Inclusion,
}

#[async_trait]
pub trait RelayClient: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one signed bundle. Must not run past `deadline`.
    async fn submit_bundle(
        &self,
        bundle: &SignedBundle,
        deadline: Instant,
    ) -> Result<RelayReceipt, RelayError>;
}

/// Every relay backend the engine knows about
pub enum RelayBackend {
    Flashbots(FlashbotsRelay),
    Builder(BuilderRelay),
    Scripted(ScriptedRelay),
}

impl RelayBackend {
    /// Build a network backend from its endpoint config. Credentials are read
    /// from the environment variable the endpoint names.
    pub fn from_config(
        endpoint: &RelayEndpointConfig,
        provider: Arc<dyn ChainProvider>,
        client: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        let credential = match &endpoint.credential_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                ConfigError::invalid(format!(
                    "relay '{}' credential variable {} is not set",
                    endpoint.name, var
                ))
            })?),
            None => None,
        };

        match endpoint.kind {
            RelayKind::Flashbots => {
                let key = credential.ok_or_else(|| {
                    ConfigError::invalid(format!("relay '{}' needs an auth key", endpoint.name))
                })?;
                let wallet: LocalWallet = key.trim().parse().map_err(|e| {
                    ConfigError::invalid(format!("relay '{}' auth key: {}", endpoint.name, e))
                })?;
                let mut relay =
                    FlashbotsRelay::new(endpoint.name.clone(), &endpoint.url, wallet, client)?;
                if endpoint.watch_inclusion {
                    relay = relay.with_inclusion_watch(provider);
                }
                Ok(Self::Flashbots(relay))
            }
            RelayKind::Builder => Ok(Self::Builder(BuilderRelay::new(
                endpoint.name.clone(),
                &endpoint.url,
                credential,
                client,
            )?)),
        }
    }

    /// Shared HTTP client for all network relays
    pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ConfigError> {
        Ok(reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .timeout(timeout)
            .tcp_nodelay(true)
            .build()?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Flashbots(_) => "flashbots",
            Self::Builder(_) => "builder",
            Self::Scripted(_) => "scripted",
        }
    }
}

impl From<ScriptedRelay> for RelayBackend {
    fn from(relay: ScriptedRelay) -> Self {
        Self::Scripted(relay)
    }
}

#[async_trait]
impl RelayClient for RelayBackend {
    fn name(&self) -> &str {
        match self {
            Self::Flashbots(relay) => relay.name(),
            Self::Builder(relay) => relay.name(),
            Self::Scripted(relay) => relay.name(),
        }
    }

    async fn submit_bundle(
        &self,
        bundle: &SignedBundle,
        deadline: Instant,
    ) -> Result<RelayReceipt, RelayError> {
        match self {
            Self::Flashbots(relay) => relay.submit_bundle(bundle, deadline).await,
            Self::Builder(relay) => relay.submit_bundle(bundle, deadline).await,
            Self::Scripted(relay) => relay.submit_bundle(bundle, deadline).await,
        }
    }
}
