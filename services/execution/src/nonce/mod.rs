//! # Nonce Management - Exactly-Once Nonce Reservation
//!
//! ## Purpose
//!
//! Hands out nonces so that no two execution tasks ever sign with the same
//! (account, nonce) pair, releases them when a bundle fails, and reconciles
//! the ledger with the chain when external activity moves an account.
//!
//! ## Architecture Role
//!
//! ```text
//! ExecutionEngine ──reserve/commit/release──→ [NonceManager]
//!                                                  │ DashMap<Address, Mutex<ledger>>
//!                                                  │   one critical section per account
//! ChainProvider ←──── resync (confirmed nonce) ────┤
//!                                                  └──→ broadcast<NonceEvent> (drift, gaps, TTL)
//! ```
//!
//! Accounts never contend with each other; calls on one account are
//! serialized, so allocation order equals call order.

mod manager;
mod state;

pub use manager::NonceManager;
pub use state::{
    AccountNonceState, CommitOutcome, NonceReservation, ReservationId, ReservationStatus,
    ResyncReport,
};

use ethers::types::Address;
use serde::Serialize;

/// Ledger changes worth surfacing to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NonceEvent {
    /// Reserved nonces were consumed on chain by someone else
    Drift {
        account: Address,
        invalidated: Vec<u64>,
        confirmed: u64,
    },
    /// Chain nonce moved past everything this engine tracked
    ExternalAdvance { account: Address, from: u64, to: u64 },
    GapRecorded { account: Address, nonce: u64 },
    GapResolved { account: Address, nonce: u64 },
    ReservationExpired {
        account: Address,
        nonce: u64,
        id: ReservationId,
    },
    /// Provider reported a lower nonce than the ledger base
    ChainBehind {
        account: Address,
        confirmed: u64,
        tracked: u64,
    },
}

impl NonceEvent {
    pub fn account(&self) -> Address {
        match self {
            Self::Drift { account, .. }
            | Self::ExternalAdvance { account, .. }
            | Self::GapRecorded { account, .. }
            | Self::GapResolved { account, .. }
            | Self::ReservationExpired { account, .. }
            | Self::ChainBehind { account, .. } => *account,
        }
    }
}
