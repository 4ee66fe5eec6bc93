//! Error types for the bundle execution engine
//!
//! Every error knows its own class. Retry loops only look at `is_transient()`,
//! the engine only looks at `is_fatal()` and `is_deterministic()`.

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the chain RPC provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Provider request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider transport error: {message}")]
    Transport { message: String },

    #[error("Provider authentication failed: {message}")]
    Authentication { message: String },

    #[error("Invalid provider response: {message}")]
    InvalidResponse { message: String },
}

impl ProviderError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

/// Gas pricing and profitability failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GasError {
    #[error("No fee samples available")]
    NoSamples,

    #[error("Gas sampling failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Gas estimate is stale ({age_ms}ms old)")]
    StaleEstimate { age_ms: u64 },

    #[error("Unprofitable: price ceiling {price_ceiling} wei below floor {price_floor} wei")]
    Unprofitable { price_ceiling: U256, price_floor: U256 },

    #[error("Invalid opportunity: {message}")]
    InvalidOpportunity { message: String },
}

/// Nonce reservation ledger failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NonceError {
    #[error("Nonce resync failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("In-flight nonce window exhausted for {account:?} (max {max_inflight})")]
    WindowExhausted { account: Address, max_inflight: usize },

    #[error("Account {account:?} must be resynced before new reservations")]
    ResyncRequired { account: Address },

    #[error("Account {account:?} has no nonce ledger")]
    UnknownAccount { account: Address },

    #[error("No reservation {nonce} for {account:?} matches this token")]
    UnknownReservation { account: Address, nonce: u64 },

    #[error("Nonce {nonce} for {account:?} superseded by confirmed nonce {confirmed}")]
    Superseded {
        account: Address,
        nonce: u64,
        confirmed: u64,
    },

    #[error("Nonce {nonce} was already released")]
    AlreadyReleased { nonce: u64 },

    #[error("Nonce {nonce} was already committed")]
    AlreadyCommitted { nonce: u64 },

    #[error("Reservation for nonce {nonce} on {account:?} expired")]
    Expired { account: Address, nonce: u64 },
}

/// Relay submission failures, classified for the retry policy
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayError {
    #[error("Relay call timed out")]
    Timeout,

    #[error("Relay connection error: {message}")]
    Connection { message: String },

    #[error("Bundle simulation reverted: {message}")]
    SimulationReverted { message: String },

    #[error("Bundle rejected: {message}")]
    Rejected { message: String },

    #[error("Nonce too low: {message}")]
    NonceTooLow { message: String },

    #[error("Relay authentication failed: {message}")]
    Authentication { message: String },

    #[error("Invalid relay response: {message}")]
    InvalidResponse { message: String },

    #[error("Circuit breaker is OPEN for relay {relay}")]
    CircuitOpen { relay: String },
}

impl RelayError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub fn reverted(message: impl Into<String>) -> Self {
        Self::SimulationReverted {
            message: message.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    /// Worth another attempt after backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connection { .. })
    }

    /// Same bundle, same answer: never retried
    pub fn is_deterministic(&self) -> bool {
        matches!(
            self,
            Self::SimulationReverted { .. } | Self::Rejected { .. } | Self::NonceTooLow { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

/// Transaction signing failures (always fatal for the opportunity)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    #[error("No signing key for account {account:?}")]
    MissingKey { account: Address },

    #[error("Signing failed for {account:?}: {message}")]
    Signing { account: Address, message: String },
}

/// Invalid component construction parameters
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {message}")]
    Invalid { message: String },

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}
