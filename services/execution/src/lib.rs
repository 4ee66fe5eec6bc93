//! # Torq MEV Execution - Bundle Execution Engine
//!
//! ## Purpose
//!
//! Turns detected opportunities into signed transaction bundles and lands them
//! through private relays. Owns the three pieces of shared state that make
//! concurrent bundle submission safe: a fee oracle with a profitability gate,
//! a per-account nonce reservation ledger, and per-relay circuit breakers.
//!
//! ## Integration Points
//!
//! - **Input**: `Opportunity` records from strategy services
//! - **Chain RPC**: `ChainProvider` for fee history, confirmed nonces and receipts
//! - **Relays**: Flashbots-style and builder `eth_sendBundle` endpoints
//! - **Output**: one terminal `ExecutionResult` per opportunity
//!
//! ## Architecture Role
//!
//! ```text
//! Opportunity → [ExecutionEngine] ──→ GasManager ──→ GasPriceOracle ──→ ChainProvider
//!                     │          ──→ NonceManager ─────────────────────↗
//!                     │          ──→ BundleSigner
//!                     └──────────→ BundleSubmitter ──→ [CircuitBreaker] ──→ RelayBackend × N
//!                                        │
//!                                 first inclusion wins, rest cancelled
//! ```
//!
//! ## Performance Profile
//!
//! - **Gas decision**: in-memory, no RPC on the hot path once the window is warm
//! - **Nonce reservation**: per-account lock, no cross-account contention
//! - **Relay race**: parallel fan-out bounded by the opportunity deadline

pub mod bundle;
pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod gas;
pub mod logging;
pub mod nonce;
pub mod provider;
pub mod relay;
pub mod retry;
pub mod signer;
pub mod submitter;
pub mod testing;
pub mod types;

pub use bundle::{Bundle, BundleBuilder, BundleTransaction, SignedBundle};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use config::ExecutionConfig;
pub use engine::{
    EngineComponents, EngineStats, ExecutionEngine, ExecutionPhase, ExecutionReason,
    ExecutionResult, ExecutionStatus,
};
pub use error::{ConfigError, GasError, NonceError, ProviderError, RelayError, SignerError};
pub use gas::{FeeSchedule, GasEstimate, GasManager, GasPriceOracle};
pub use nonce::{AccountNonceState, NonceEvent, NonceManager, NonceReservation};
pub use provider::{ChainProvider, EthersChainProvider};
pub use relay::{RelayBackend, RelayClient, RelayReceipt};
pub use retry::RetryPolicy;
pub use signer::{BundleSigner, WalletSigner};
pub use submitter::{AggregatedResult, BundleSubmissionResult, BundleSubmitter, SubmissionStatus};
pub use types::{Opportunity, TargetCall, Urgency};
