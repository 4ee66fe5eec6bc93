//! Per-account nonce ledger
//!
//! Pure state: no locking, no I/O. `NonceManager` owns one ledger per account
//! behind that account's mutex and feeds it chain reads.
//!
//! The ledger is a contiguous run of slots starting at the last confirmed
//! on-chain nonce. A slot is live (Reserved/Committed) or a gap
//! (Released/Expired). The next nonce is always `base + slots`.

use super::NonceEvent;
use crate::error::NonceError;
use ethers::types::{Address, H256};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Unique token identity. Distinguishes two reservations that reused the same nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ReservationId(pub u64);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Committed,
    Released,
    Expired,
    /// Consumed on chain by a transaction this engine never committed
    Invalidated,
}

impl ReservationStatus {
    pub fn is_gap(&self) -> bool {
        matches!(self, Self::Released | Self::Expired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceReservation {
    pub id: ReservationId,
    pub account: Address,
    pub nonce: u64,
    pub status: ReservationStatus,
    #[serde(skip)]
    pub created_at: Instant,
    #[serde(skip)]
    pub ttl: Duration,
    pub tx_hash: Option<H256>,
}

impl NonceReservation {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.created_at + self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed,
    /// Same token committed twice
    AlreadyCommitted,
    /// Committed, but a gap sits below it; the account is marked for resync
    CommittedBehindGap,
}

/// What a resync changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub account: Address,
    pub previous_base: u64,
    pub confirmed: u64,
    /// Reserved nonces consumed by someone else
    pub invalidated: Vec<u64>,
    /// Committed nonces now confirmed and pruned
    pub confirmed_commits: usize,
    pub events: Vec<NonceEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountNonceState {
    pub account: Address,
    pub last_synced_on_chain_nonce: u64,
    /// Outstanding slots keyed by nonce; contiguous from `last_synced_on_chain_nonce`
    pub reservations: BTreeMap<u64, NonceReservation>,
    #[serde(skip)]
    pub last_sync_time: Instant,
    /// Set by drift or a commit above a gap; blocks reservations until resynced
    pub needs_resync: bool,
    pub drift_count: u64,
}

impl AccountNonceState {
    pub fn new(account: Address, confirmed: u64, now: Instant) -> Self {
        Self {
            account,
            last_synced_on_chain_nonce: confirmed,
            reservations: BTreeMap::new(),
            last_sync_time: now,
            needs_resync: false,
            drift_count: 0,
        }
    }

    pub fn next_nonce(&self) -> u64 {
        self.last_synced_on_chain_nonce + self.reservations.len() as u64
    }

    /// Reserved or committed slots
    pub fn outstanding(&self) -> usize {
        self.reservations
            .values()
            .filter(|r| !r.status.is_gap())
            .count()
    }

    /// Released or expired slots below the top of the ledger
    pub fn gaps(&self) -> Vec<u64> {
        self.reservations
            .values()
            .filter(|r| r.status.is_gap())
            .map(|r| r.nonce)
            .collect()
    }

    pub fn reserve(
        &mut self,
        id: ReservationId,
        ttl: Duration,
        max_inflight: usize,
        now: Instant,
    ) -> Result<NonceReservation, NonceError> {
        if self.needs_resync {
            return Err(NonceError::ResyncRequired {
                account: self.account,
            });
        }
        if self.reservations.len() >= max_inflight {
            return Err(NonceError::WindowExhausted {
                account: self.account,
                max_inflight,
            });
        }

        let reservation = NonceReservation {
            id,
            account: self.account,
            nonce: self.next_nonce(),
            status: ReservationStatus::Reserved,
            created_at: now,
            ttl,
            tx_hash: None,
        };
        self.reservations.insert(reservation.nonce, reservation.clone());
        Ok(reservation)
    }

    fn lookup_mut(
        &mut self,
        id: ReservationId,
        nonce: u64,
    ) -> Result<&mut NonceReservation, NonceError> {
        let account = self.account;
        let confirmed = self.last_synced_on_chain_nonce;
        match self.reservations.get_mut(&nonce) {
            Some(entry) if entry.id == id => Ok(entry),
            None if nonce < confirmed => Err(NonceError::Superseded {
                account,
                nonce,
                confirmed,
            }),
            _ => Err(NonceError::UnknownReservation { account, nonce }),
        }
    }

    pub fn commit(
        &mut self,
        id: ReservationId,
        nonce: u64,
        tx_hash: H256,
    ) -> Result<CommitOutcome, NonceError> {
        let account = self.account;
        let entry = self.lookup_mut(id, nonce)?;
        match entry.status {
            ReservationStatus::Committed => return Ok(CommitOutcome::AlreadyCommitted),
            ReservationStatus::Released => return Err(NonceError::AlreadyReleased { nonce }),
            ReservationStatus::Expired => {
                // The transaction may still land; only the chain can tell now
                self.needs_resync = true;
                return Err(NonceError::Expired { account, nonce });
            }
            ReservationStatus::Invalidated => {
                return Err(NonceError::Superseded {
                    account,
                    nonce,
                    confirmed: self.last_synced_on_chain_nonce,
                })
            }
            ReservationStatus::Reserved => {
                entry.status = ReservationStatus::Committed;
                entry.tx_hash = Some(tx_hash);
            }
        }

        let behind_gap = self
            .reservations
            .range(..nonce)
            .any(|(_, r)| r.status.is_gap());
        if behind_gap {
            self.needs_resync = true;
            Ok(CommitOutcome::CommittedBehindGap)
        } else {
            Ok(CommitOutcome::Committed)
        }
    }

    pub fn release(&mut self, id: ReservationId, nonce: u64) -> Result<Vec<NonceEvent>, NonceError> {
        let account = self.account;
        let entry = self.lookup_mut(id, nonce)?;
        match entry.status {
            ReservationStatus::Reserved => {}
            ReservationStatus::Committed => return Err(NonceError::AlreadyCommitted { nonce }),
            ReservationStatus::Released | ReservationStatus::Invalidated => {
                return Err(NonceError::AlreadyReleased { nonce })
            }
            ReservationStatus::Expired => return Err(NonceError::Expired { account, nonce }),
        }

        entry.status = ReservationStatus::Released;
        let mut events = Vec::new();
        let freed = self.trim_trailing_gaps(&[nonce], &mut events);
        if !freed.contains(&nonce) {
            events.push(NonceEvent::GapRecorded { account, nonce });
        }
        Ok(events)
    }

    /// Mark reservations past their TTL as expired. The holder may still have
    /// broadcast, so expired slots keep their nonce until the next reconcile
    /// reads the chain.
    pub fn expire(&mut self, now: Instant) -> Vec<NonceEvent> {
        let account = self.account;
        let mut events = Vec::new();

        for entry in self.reservations.values_mut() {
            if entry.status == ReservationStatus::Reserved && entry.is_expired_at(now) {
                entry.status = ReservationStatus::Expired;
                events.push(NonceEvent::ReservationExpired {
                    account,
                    nonce: entry.nonce,
                    id: entry.id,
                });
                events.push(NonceEvent::GapRecorded {
                    account,
                    nonce: entry.nonce,
                });
            }
        }
        if !events.is_empty() {
            self.needs_resync = true;
        }
        events
    }

    /// Drop gap slots from the top so their nonces are handed out again.
    /// Gaps in `fresh` were created by the current call and are not reported.
    fn trim_trailing_gaps(&mut self, fresh: &[u64], events: &mut Vec<NonceEvent>) -> Vec<u64> {
        let mut freed = Vec::new();
        while let Some(entry) = self.reservations.last_entry() {
            if !entry.get().status.is_gap() {
                break;
            }
            let nonce = *entry.key();
            entry.remove();
            if !fresh.contains(&nonce) {
                events.push(NonceEvent::GapResolved {
                    account: self.account,
                    nonce,
                });
            }
            freed.push(nonce);
        }
        freed
    }

    /// Re-reserve the lowest gap, for a filler transaction
    pub fn backfill(
        &mut self,
        id: ReservationId,
        ttl: Duration,
        now: Instant,
    ) -> Option<(NonceReservation, NonceEvent)> {
        let nonce = self
            .reservations
            .values()
            .find(|r| r.status.is_gap())
            .map(|r| r.nonce)?;

        let reservation = NonceReservation {
            id,
            account: self.account,
            nonce,
            status: ReservationStatus::Reserved,
            created_at: now,
            ttl,
            tx_hash: None,
        };
        self.reservations.insert(nonce, reservation.clone());
        Some((
            reservation,
            NonceEvent::GapResolved {
                account: self.account,
                nonce,
            },
        ))
    }

    /// Reconcile against the confirmed transaction count read from chain
    pub fn reconcile(&mut self, confirmed: u64, now: Instant) -> ResyncReport {
        let account = self.account;
        let previous_base = self.last_synced_on_chain_nonce;
        let previous_next = self.next_nonce();
        let mut report = ResyncReport {
            account,
            previous_base,
            confirmed,
            invalidated: Vec::new(),
            confirmed_commits: 0,
            events: Vec::new(),
        };

        self.last_sync_time = now;
        self.needs_resync = false;

        if confirmed < previous_base {
            if self.reservations.is_empty() {
                self.last_synced_on_chain_nonce = confirmed;
            } else {
                report.events.push(NonceEvent::ChainBehind {
                    account,
                    confirmed,
                    tracked: previous_base,
                });
                self.trim_trailing_gaps(&[], &mut report.events);
            }
            return report;
        }

        let remaining = self.reservations.split_off(&confirmed);
        let consumed = std::mem::replace(&mut self.reservations, remaining);

        for (nonce, entry) in consumed {
            match entry.status {
                ReservationStatus::Committed => report.confirmed_commits += 1,
                ReservationStatus::Reserved | ReservationStatus::Invalidated => {
                    report.invalidated.push(nonce)
                }
                ReservationStatus::Released | ReservationStatus::Expired => {
                    report.events.push(NonceEvent::GapResolved { account, nonce })
                }
            }
        }

        if !report.invalidated.is_empty() {
            self.drift_count += 1;
            report.events.push(NonceEvent::Drift {
                account,
                invalidated: report.invalidated.clone(),
                confirmed,
            });
        }
        if confirmed > previous_next {
            report.events.push(NonceEvent::ExternalAdvance {
                account,
                from: previous_next,
                to: confirmed,
            });
        }

        self.last_synced_on_chain_nonce = confirmed;
        // Expired slots the chain did not consume are free again
        self.trim_trailing_gaps(&[], &mut report.events);
        report
    }

    /// Structural invariants, checked by tests
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut expected = self.last_synced_on_chain_nonce;
        for (nonce, entry) in &self.reservations {
            if *nonce != expected || entry.nonce != expected {
                return Err(format!("slot {} breaks contiguity (expected {})", nonce, expected));
            }
            if entry.status == ReservationStatus::Invalidated {
                return Err(format!("invalidated slot {} kept in ledger", nonce));
            }
            expected += 1;
        }
        if let Some(last) = self.reservations.values().next_back() {
            // Expired slots wait at the top for the resync that frees them
            let awaiting_resync = last.status == ReservationStatus::Expired && self.needs_resync;
            if last.status.is_gap() && !awaiting_resync {
                return Err(format!("trailing gap at {}", last.nonce));
            }
        }
        Ok(())
    }
}
