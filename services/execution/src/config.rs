//! # Execution Configuration - Engine Parameter Management
//!
//! ## Purpose
//!
//! Runtime parameters for every execution component: gas sampling and
//! profitability policy, nonce reservation TTL and in-flight window, per-relay
//! timeout/retry/circuit-breaker settings, relay endpoints and logging. Loaded
//! from TOML or JSON files with environment variable overrides and validated
//! before any component is built.
//!
//! ## Architecture Role
//!
//! ```text
//! Config File (TOML/JSON) → [ExecutionConfig] → GasPriceOracle / GasManager
//!        ↓                        ↓               NonceManager
//! Environment Overrides    validate()            BundleSubmitter + CircuitBreaker
//!                                                 RelayBackend set / ExecutionEngine
//! ```

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;
use crate::types::Urgency;
use anyhow::{bail, Context};
use ethers::types::{Address, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Complete configuration for the execution service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub provider: ProviderConfig,
    pub gas: GasConfig,
    pub nonce: NonceConfig,
    pub submitter: SubmitterConfig,
    pub engine: EngineConfig,
    pub relays: Vec<RelayEndpointConfig>,
    pub logging: LoggingConfig,
}

/// Chain RPC connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub rpc_url: String,
    pub request_timeout_ms: u64,
    pub chain_id: u64,
}

/// Gas sampling and profitability policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    /// Blocks requested per fee history call
    pub sample_blocks: u64,
    /// Blocks kept in the rolling window
    pub window_blocks: usize,
    pub refresh_interval_ms: u64,
    /// Estimates older than this are stale
    pub staleness_threshold_ms: u64,
    pub percentiles: UrgencyPercentiles,
    /// max_fee_per_gas = next_base_fee * headroom + priority fee
    pub base_fee_headroom: Decimal,
    /// Lowest tip the profitability floor assumes
    pub min_priority_fee_wei: u64,
    pub stale_policy: StalePolicy,
    pub retry: RetryPolicy,
}

/// Priority fee percentile per urgency level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrgencyPercentiles {
    pub low: f64,
    pub normal: f64,
    pub aggressive: f64,
}

impl UrgencyPercentiles {
    pub fn for_urgency(&self, urgency: Urgency) -> f64 {
        match urgency {
            Urgency::Low => self.low,
            Urgency::Normal => self.normal,
            Urgency::Aggressive => self.aggressive,
        }
    }
}

/// What the gas manager does with a stale estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StalePolicy {
    Reject,
    /// Accept, but raise the fee caps by `bump_percent`
    AllowWithBump { bump_percent: u32 },
}

/// Nonce ledger behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    pub reservation_ttl_ms: u64,
    /// Maximum outstanding slots (reserved, committed or gap) per account
    pub max_inflight: usize,
    /// Ledgers older than this are resynced before the next reservation
    pub resync_interval_ms: u64,
    /// TTL sweep and periodic resync cadence of the maintenance task
    pub maintenance_interval_ms: u64,
    pub retry: RetryPolicy,
}

/// Relay racing behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitterConfig {
    /// Upper bound for one relay call (further capped by the deadline)
    pub relay_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Only inclusion counts as success; otherwise simulation acceptance does too
    pub require_inclusion: bool,
}

/// Engine-level options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub urgency: Urgency,
    /// Remembered opportunity ids are forgotten after this window
    pub dedupe_window_ms: u64,
    /// Accounts synced at startup and shown in diagnostics
    pub accounts: Vec<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    Flashbots,
    Builder,
}

/// One relay endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEndpointConfig {
    pub name: String,
    pub kind: RelayKind,
    pub url: String,
    /// Poll receipts after acceptance until the call deadline
    #[serde(default)]
    pub watch_inclusion: bool,
    /// Environment variable holding the relay credential
    /// (Flashbots auth key, or builder API key)
    #[serde(default)]
    pub credential_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            request_timeout_ms: 2_000,
            chain_id: 1,
        }
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            sample_blocks: 10,
            window_blocks: 40,
            refresh_interval_ms: 2_000,
            staleness_threshold_ms: 24_000, // two mainnet slots
            percentiles: UrgencyPercentiles::default(),
            base_fee_headroom: dec!(2.0),
            min_priority_fee_wei: 100_000_000, // 0.1 gwei
            stale_policy: StalePolicy::Reject,
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for UrgencyPercentiles {
    fn default() -> Self {
        Self {
            low: 50.0,
            normal: 90.0,
            aggressive: 99.0,
        }
    }
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_ms: 30_000,
            max_inflight: 16,
            resync_interval_ms: 60_000,
            maintenance_interval_ms: 1_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            relay_timeout_ms: 2_000,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            require_inclusion: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            urgency: Urgency::Normal,
            dedupe_window_ms: 600_000,
            accounts: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl GasConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    pub fn min_priority_fee(&self) -> U256 {
        U256::from(self.min_priority_fee_wei)
    }

    /// Headroom as an integer per-mille factor for U256 math
    pub fn headroom_permille(&self) -> u64 {
        (self.base_fee_headroom * dec!(1000)).to_u64().unwrap_or(1000)
    }
}

impl NonceConfig {
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_millis(self.reservation_ttl_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

impl SubmitterConfig {
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }
}

impl EngineConfig {
    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }
}

impl ExecutionConfig {
    /// Load from a TOML file, or JSON when the extension is `.json`
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .with_context(|| format!("Invalid JSON config {}", path.display()))?,
            _ => toml::from_str(&contents)
                .with_context(|| format!("Invalid TOML config {}", path.display()))?,
        };
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(rpc_url) = std::env::var("MEV_RPC_URL") {
            self.provider.rpc_url = rpc_url;
        }

        if let Some(value) = env_parse::<u64>("MEV_RELAY_TIMEOUT_MS") {
            self.submitter.relay_timeout_ms = value;
        }

        if let Some(value) = env_parse::<u32>("MEV_MAX_RETRIES") {
            self.submitter.retry.max_attempts = value;
        }

        if let Some(value) = env_parse::<Urgency>("MEV_URGENCY") {
            self.engine.urgency = value;
        }

        if let Some(value) = env_parse::<u64>("MEV_NONCE_TTL_MS") {
            self.nonce.reservation_ttl_ms = value;
        }

        if let Some(value) = env_parse::<usize>("MEV_MAX_INFLIGHT") {
            self.nonce.max_inflight = value;
        }

        if let Some(value) = env_parse::<u64>("MEV_GAS_STALENESS_MS") {
            self.gas.staleness_threshold_ms = value;
        }

        if let Ok(level) = std::env::var("MEV_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let toml = toml::to_string_pretty(self)?;
        std::fs::write(path, toml)?;
        Ok(())
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.provider.request_timeout_ms == 0 {
            bail!("provider.request_timeout_ms must be positive");
        }

        if self.gas.sample_blocks == 0 || self.gas.window_blocks == 0 {
            bail!("gas.sample_blocks and gas.window_blocks must be positive");
        }

        for (name, p) in [
            ("low", self.gas.percentiles.low),
            ("normal", self.gas.percentiles.normal),
            ("aggressive", self.gas.percentiles.aggressive),
        ] {
            if !(p > 0.0 && p <= 100.0) {
                bail!("gas.percentiles.{} must be in (0, 100], got {}", name, p);
            }
        }

        if self.gas.base_fee_headroom < Decimal::ONE {
            bail!("gas.base_fee_headroom must be >= 1.0");
        }

        if self.gas.staleness_threshold_ms == 0 {
            bail!("gas.staleness_threshold_ms must be positive");
        }

        if self.nonce.max_inflight == 0 {
            bail!("nonce.max_inflight must be positive");
        }

        if self.nonce.reservation_ttl_ms == 0 {
            bail!("nonce.reservation_ttl_ms must be positive");
        }

        if self.submitter.relay_timeout_ms == 0 {
            bail!("submitter.relay_timeout_ms must be positive");
        }

        // A reservation must outlive the relay call that may broadcast it
        if self.nonce.reservation_ttl_ms < self.submitter.relay_timeout_ms {
            bail!(
                "nonce.reservation_ttl_ms ({}) must be >= submitter.relay_timeout_ms ({})",
                self.nonce.reservation_ttl_ms,
                self.submitter.relay_timeout_ms
            );
        }

        if self.submitter.retry.max_attempts == 0 {
            bail!("submitter.retry.max_attempts must be at least 1");
        }

        if self.submitter.circuit_breaker.failure_threshold == 0 {
            bail!("submitter.circuit_breaker.failure_threshold must be positive");
        }

        if self.relays.is_empty() {
            bail!("at least one relay must be configured");
        }

        let mut names = HashSet::new();
        for relay in &self.relays {
            if !names.insert(relay.name.as_str()) {
                bail!("duplicate relay name '{}'", relay.name);
            }
            if let Err(e) = relay.url.parse::<url::Url>() {
                bail!("relay '{}' has invalid url: {}", relay.name, e);
            }
            if relay.kind == RelayKind::Flashbots && relay.credential_env.is_none() {
                bail!("flashbots relay '{}' needs credential_env for its auth key", relay.name);
            }
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
