//! # Execution Engine - Opportunity to Bundle Pipeline
//!
//! ## Purpose
//!
//! Drives each opportunity through an explicit state machine: profitability
//! gate, all-or-nothing nonce reservation, bundle build and signing, relay race,
//! then commit or release. Every path ends in a typed `ExecutionResult`; no
//! failure escapes as a raw error, so batch callers never special-case items.
//!
//! ## Integration Points
//!
//! - **Input**: `Opportunity` records from the strategy layer
//! - **Gas**: `GasManager::evaluate` (fails fast before any nonce is taken)
//! - **Nonces**: `NonceManager` reserve / commit / release / flag_drift
//! - **Signing**: injected `BundleSigner`
//! - **Relays**: `BundleSubmitter` over the configured `RelayBackend`s
//!
//! ## Architecture Role
//!
//! ```text
//! Pending ──gas ok──→ GasChecked ──nonces──→ NonceReserved ──signed──→ Submitted
//!    │                    │                       │                       │
//!    └── Failed ←─────────┴── Failed ←────────────┴── Aborted             ├─→ Included (commit)
//!                                                                         ├─→ Failed   (release)
//!                         deadline at any phase ──→ Expired (release)     └─→ Expired  (release)
//! ```
//!
//! ## Performance Profile
//!
//! - **Concurrency**: one task per opportunity; only same-account reservations serialize
//! - **Deadline**: every await is bounded by the opportunity deadline
//! - **Isolation**: components are injected, engines share no global state

use crate::bundle::BundleBuilder;
use crate::config::{EngineConfig, ExecutionConfig};
use crate::error::{ConfigError, GasError, NonceError};
use crate::gas::{FeeSchedule, GasManager, GasPriceOracle};
use crate::logging::LogEmoji;
use crate::nonce::{AccountNonceState, NonceManager, NonceReservation, ResyncReport};
use crate::provider::ChainProvider;
use crate::relay::RelayBackend;
use crate::signer::BundleSigner;
use crate::submitter::{
    AggregatedResult, BundleSubmissionResult, BundleSubmitter, FailureReason, SubmissionOutcome,
};
use crate::types::{wei_to_eth, Opportunity, Urgency};
use crate::{log_error, log_execution, log_profit};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::{Address, H256};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Lifecycle phase of one opportunity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Pending,
    GasChecked,
    NonceReserved,
    Submitted,
    Included,
    Failed,
    Expired,
    Aborted,
}

impl ExecutionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Included | Self::Failed | Self::Expired | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Included,
    Failed,
    Expired,
    Aborted,
}

impl From<ExecutionStatus> for ExecutionPhase {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Included => Self::Included,
            ExecutionStatus::Failed => Self::Failed,
            ExecutionStatus::Expired => Self::Expired,
            ExecutionStatus::Aborted => Self::Aborted,
        }
    }
}

/// Machine-readable cause of a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionReason {
    Included,
    InvalidOpportunity,
    DuplicateOpportunity,
    Unprofitable,
    StaleGasEstimate,
    GasUnavailable,
    NonceUnavailable,
    BundleBuildFailed,
    SigningFailed,
    ProviderAuthFailed,
    RelayAuthFailed,
    RelayRejected,
    NonceDrift,
    NotIncluded,
    RelaysUnavailable,
    DeadlineElapsed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTransition {
    pub from: ExecutionPhase,
    pub to: ExecutionPhase,
    /// Milliseconds since the engine took the opportunity
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommittedNonce {
    pub account: Address,
    pub nonce: u64,
    pub tx_hash: H256,
}

/// Terminal, immutable record of one opportunity
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub opportunity_id: String,
    pub strategy_id: String,
    pub status: ExecutionStatus,
    pub reason: ExecutionReason,
    pub detail: Option<String>,
    pub committed_nonces: Vec<CommittedNonce>,
    pub relay_results: Vec<BundleSubmissionResult>,
    pub transitions: Vec<PhaseTransition>,
    pub fee_schedule: Option<FeeSchedule>,
    pub bundle_hash: Option<H256>,
    pub block_number: Option<u64>,
    #[serde(serialize_with = "duration_ms")]
    pub elapsed: Duration,
}

fn duration_ms<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

impl ExecutionResult {
    pub fn is_included(&self) -> bool {
        self.status == ExecutionStatus::Included
    }

    pub fn relay_result(&self, relay: &str) -> Option<&BundleSubmissionResult> {
        self.relay_results.iter().find(|r| r.relay == relay)
    }

    pub fn phases(&self) -> Vec<ExecutionPhase> {
        let mut phases = vec![ExecutionPhase::Pending];
        phases.extend(self.transitions.iter().map(|t| t.to));
        phases
    }
}

/// Engine counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub submitted: u64,
    pub included: u64,
    pub failed: u64,
    pub expired: u64,
    pub aborted: u64,
    pub duplicates: u64,
    /// Expected profit of included opportunities, in ETH
    pub profit_captured_eth: Decimal,
}

/// Everything the engine needs, built by the caller
#[derive(Clone)]
pub struct EngineComponents {
    pub gas: Arc<GasManager>,
    pub nonces: Arc<NonceManager>,
    pub submitter: Arc<BundleSubmitter>,
    pub signer: Arc<dyn BundleSigner>,
    pub relays: Vec<Arc<RelayBackend>>,
}

impl EngineComponents {
    /// Production wiring from config. Relays come from the endpoint list.
    pub fn from_config(
        config: &ExecutionConfig,
        provider: Arc<dyn ChainProvider>,
        signer: Arc<dyn BundleSigner>,
    ) -> Result<Self, ConfigError> {
        let oracle = Arc::new(GasPriceOracle::new(Arc::clone(&provider), config.gas.clone()));
        let client = RelayBackend::http_client(config.submitter.relay_timeout())?;
        let relays = config
            .relays
            .iter()
            .map(|endpoint| {
                RelayBackend::from_config(endpoint, Arc::clone(&provider), client.clone())
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            gas: Arc::new(GasManager::new(oracle)),
            nonces: Arc::new(NonceManager::new(provider, config.nonce.clone())),
            submitter: Arc::new(BundleSubmitter::new(config.submitter.clone())),
            signer,
            relays,
        })
    }
}

/// Per-opportunity phase tracker
struct Lifecycle {
    phase: ExecutionPhase,
    started: Instant,
    transitions: Vec<PhaseTransition>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            phase: ExecutionPhase::Pending,
            started: Instant::now(),
            transitions: Vec::new(),
        }
    }

    fn advance(&mut self, to: ExecutionPhase) {
        debug_assert!(!self.phase.is_terminal(), "transition out of terminal phase");
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            at_ms: self.started.elapsed().as_millis() as u64,
        });
        self.phase = to;
    }
}

/// Partial record carried into `finish`
#[derive(Default)]
struct Progress {
    fee_schedule: Option<FeeSchedule>,
    committed_nonces: Vec<CommittedNonce>,
    relay_results: Vec<BundleSubmissionResult>,
    bundle_hash: Option<H256>,
    block_number: Option<u64>,
}

pub struct ExecutionEngine {
    components: EngineComponents,
    config: EngineConfig,
    seen: DashMap<String, Instant>,
    stats: Mutex<EngineStats>,
}

impl ExecutionEngine {
    pub fn new(components: EngineComponents, config: EngineConfig) -> Self {
        Self {
            components,
            config,
            seen: DashMap::new(),
            stats: Mutex::new(EngineStats::default()),
        }
    }

    pub fn components(&self) -> &EngineComponents {
        &self.components
    }

    pub fn urgency(&self) -> Urgency {
        self.config.urgency
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().clone()
    }

    /// Diagnostics view of one account's nonce ledger
    pub async fn get_account_state(&self, account: Address) -> Option<AccountNonceState> {
        self.components.nonces.get_account_state(account).await
    }

    /// Load the nonce ledger of every configured account up front so the
    /// first opportunity does not pay for the chain read
    pub async fn sync_accounts(&self) -> Vec<Result<ResyncReport, NonceError>> {
        let mut reports = Vec::with_capacity(self.config.accounts.len());
        for account in &self.config.accounts {
            let report = self.components.nonces.resync(*account).await;
            if let Err(e) = &report {
                warn!(account = ?account, "Initial nonce sync failed: {}", e);
            }
            reports.push(report);
        }
        reports
    }

    /// Start the gas refresher and nonce maintenance tasks
    pub fn spawn_background_tasks(
        &self,
        gas_refresh: Duration,
        nonce_maintenance: Duration,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.components.gas.oracle().spawn_refresh(gas_refresh),
            self.components.nonces.spawn_maintenance(nonce_maintenance),
        ]
    }

    /// Run many opportunities concurrently; one result per input, same order
    pub async fn submit_batch(&self, opportunities: Vec<Opportunity>) -> Vec<ExecutionResult> {
        futures::future::join_all(opportunities.into_iter().map(|opp| self.submit(opp))).await
    }

    fn claim_id(&self, id: &str) -> bool {
        let window = self.config.dedupe_window();
        self.seen.retain(|_, seen_at| seen_at.elapsed() < window);
        match self.seen.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }

    /// Take one opportunity to a terminal result
    pub async fn submit(&self, opportunity: Opportunity) -> ExecutionResult {
        let mut lifecycle = Lifecycle::new();
        let mut progress = Progress::default();

        if !self.claim_id(&opportunity.id) {
            self.stats.lock().duplicates += 1;
            return self.finish(
                &opportunity,
                lifecycle,
                progress,
                ExecutionStatus::Failed,
                ExecutionReason::DuplicateOpportunity,
                Some("opportunity id already submitted".to_string()),
            );
        }
        self.stats.lock().submitted += 1;

        if let Err(message) = opportunity.validate() {
            return self.finish(
                &opportunity,
                lifecycle,
                progress,
                ExecutionStatus::Failed,
                ExecutionReason::InvalidOpportunity,
                Some(message),
            );
        }
        if opportunity.is_expired() {
            return self.expire(&opportunity, lifecycle, progress);
        }

        // Pending → GasChecked
        let urgency = self.config.urgency;
        let fees = match timeout_at(
            opportunity.deadline,
            self.components.gas.evaluate(&opportunity, urgency),
        )
        .await
        {
            Err(_) => return self.expire(&opportunity, lifecycle, progress),
            Ok(Err(e)) => {
                let (status, reason) = classify_gas_error(&e);
                return self.finish(&opportunity, lifecycle, progress, status, reason, Some(e.to_string()));
            }
            Ok(Ok(fees)) => fees,
        };
        progress.fee_schedule = Some(fees.clone());
        lifecycle.advance(ExecutionPhase::GasChecked);

        // GasChecked → NonceReserved, all or nothing
        let reservations = match self.reserve_all(&opportunity).await {
            Ok(reservations) => reservations,
            Err(failure) => {
                let (status, reason, detail) = match failure {
                    None => return self.expire(&opportunity, lifecycle, progress),
                    Some(NonceError::Provider(e)) if e.is_fatal() => (
                        ExecutionStatus::Aborted,
                        ExecutionReason::ProviderAuthFailed,
                        e.to_string(),
                    ),
                    Some(e) => (
                        ExecutionStatus::Failed,
                        ExecutionReason::NonceUnavailable,
                        e.to_string(),
                    ),
                };
                return self.finish(&opportunity, lifecycle, progress, status, reason, Some(detail));
            }
        };
        lifecycle.advance(ExecutionPhase::NonceReserved);

        // NonceReserved → Submitted
        let bundle = match BundleBuilder::for_opportunity(&opportunity, &reservations, &fees) {
            Ok(builder) => builder.build(),
            Err(message) => {
                self.release_all(&reservations).await;
                return self.finish(
                    &opportunity,
                    lifecycle,
                    progress,
                    ExecutionStatus::Aborted,
                    ExecutionReason::BundleBuildFailed,
                    Some(message),
                );
            }
        };
        let signed = match self.components.signer.sign_bundle(bundle) {
            Ok(signed) => signed,
            Err(e) => {
                self.release_all(&reservations).await;
                warn!(opportunity_id = %opportunity.id, "{} Signing failed: {}", LogEmoji::ERROR, e);
                return self.finish(
                    &opportunity,
                    lifecycle,
                    progress,
                    ExecutionStatus::Aborted,
                    ExecutionReason::SigningFailed,
                    Some(e.to_string()),
                );
            }
        };
        progress.bundle_hash = Some(signed.bundle_hash);

        if opportunity.is_expired() {
            self.release_all(&reservations).await;
            return self.expire(&opportunity, lifecycle, progress);
        }
        lifecycle.advance(ExecutionPhase::Submitted);

        log_execution!(
            "Submitting {} ({} txs, max cost {} ETH) to {} relays",
            opportunity.id,
            signed.raw_transactions.len(),
            fees.max_cost_eth(),
            self.components.relays.len()
        );
        let aggregated = self
            .components
            .submitter
            .submit(&signed, &self.components.relays, opportunity.deadline)
            .await;
        progress.relay_results = aggregated.results.clone();

        match &aggregated.outcome {
            SubmissionOutcome::Success {
                bundle_hash,
                block_number,
                ..
            } => {
                progress.bundle_hash = bundle_hash.or(progress.bundle_hash);
                progress.block_number = *block_number;

                let tx_hashes: HashMap<(Address, u64), H256> = signed
                    .bundle
                    .transactions
                    .iter()
                    .zip(&signed.tx_hashes)
                    .map(|(tx, hash)| ((tx.from, tx.nonce), *hash))
                    .collect();
                let (committed, commit_failures) = self.commit_all(&reservations, &tx_hashes).await;
                progress.committed_nonces = committed;
                let detail = (!commit_failures.is_empty())
                    .then(|| format!("nonce commit failed: {}", commit_failures.join("; ")));

                self.finish(
                    &opportunity,
                    lifecycle,
                    progress,
                    ExecutionStatus::Included,
                    ExecutionReason::Included,
                    detail,
                )
            }
            SubmissionOutcome::Failure { reason } => {
                self.release_all(&reservations).await;
                let (status, reason, detail) = self.classify_failure(&opportunity, *reason, &aggregated).await;
                self.finish(&opportunity, lifecycle, progress, status, reason, detail)
            }
        }
    }

    /// One reservation per call, in call order, held at least until the
    /// deadline. `Err(None)` means the deadline hit.
    async fn reserve_all(
        &self,
        opportunity: &Opportunity,
    ) -> Result<Vec<NonceReservation>, Option<NonceError>> {
        let mut reservations = Vec::with_capacity(opportunity.calls.len());

        for call in &opportunity.calls {
            let attempt = timeout_at(
                opportunity.deadline,
                self.components.nonces.reserve_until(call.from, opportunity.deadline),
            )
            .await;

            let failure = match attempt {
                Ok(Ok(reservation)) => {
                    reservations.push(reservation);
                    continue;
                }
                Ok(Err(e)) => Some(e),
                Err(_) => None,
            };

            if !reservations.is_empty() {
                debug!(
                    opportunity_id = %opportunity.id,
                    taken = reservations.len(),
                    "Releasing partial nonce reservations"
                );
            }
            self.release_all(&reservations).await;
            return Err(failure);
        }
        Ok(reservations)
    }

    /// Release in reverse so the highest nonce goes first and nothing is left as a gap
    async fn release_all(&self, reservations: &[NonceReservation]) {
        for reservation in reservations.iter().rev() {
            if let Err(e) = self.components.nonces.release(reservation).await {
                debug!(
                    account = ?reservation.account,
                    nonce = reservation.nonce,
                    "Release skipped: {}",
                    e
                );
            }
        }
    }

    /// Commit every reservation of an included bundle. A slot that cannot be
    /// committed leaves the ledger out of step with the chain, so its account
    /// is flagged for resync and the failure is returned for the result.
    async fn commit_all(
        &self,
        reservations: &[NonceReservation],
        tx_hashes: &HashMap<(Address, u64), H256>,
    ) -> (Vec<CommittedNonce>, Vec<String>) {
        let mut committed = Vec::with_capacity(reservations.len());
        let mut failures = Vec::new();

        for reservation in reservations {
            let outcome = match tx_hashes.get(&(reservation.account, reservation.nonce)) {
                Some(tx_hash) => self
                    .components
                    .nonces
                    .commit(reservation, *tx_hash)
                    .await
                    .map(|_| *tx_hash)
                    .map_err(|e| e.to_string()),
                None => Err("no signed transaction for the reservation".to_string()),
            };

            match outcome {
                Ok(tx_hash) => committed.push(CommittedNonce {
                    account: reservation.account,
                    nonce: reservation.nonce,
                    tx_hash,
                }),
                Err(message) => {
                    warn!(
                        account = ?reservation.account,
                        nonce = reservation.nonce,
                        "{} Included bundle could not commit its nonce: {}",
                        LogEmoji::WARNING,
                        message
                    );
                    self.components.nonces.flag_drift(reservation.account).await;
                    failures.push(format!("{:?}/{}: {}", reservation.account, reservation.nonce, message));
                }
            }
        }
        (committed, failures)
    }

    async fn classify_failure(
        &self,
        opportunity: &Opportunity,
        reason: FailureReason,
        aggregated: &AggregatedResult,
    ) -> (ExecutionStatus, ExecutionReason, Option<String>) {
        let first_error = aggregated.errors().next().map(|e| e.to_string());

        if aggregated.has_nonce_too_low() {
            for account in &opportunity.accounts {
                self.components.nonces.flag_drift(*account).await;
            }
            return (ExecutionStatus::Failed, ExecutionReason::NonceDrift, first_error);
        }
        if aggregated.has_fatal_error() {
            let detail = aggregated
                .errors()
                .find(|e| e.is_fatal())
                .map(|e| e.to_string());
            return (ExecutionStatus::Aborted, ExecutionReason::RelayAuthFailed, detail);
        }
        match reason {
            FailureReason::DeadlineElapsed => (
                ExecutionStatus::Expired,
                ExecutionReason::DeadlineElapsed,
                Some("deadline passed before any relay succeeded".to_string()),
            ),
            FailureReason::NotIncluded => (
                ExecutionStatus::Failed,
                ExecutionReason::NotIncluded,
                Some("relays accepted the bundle without inclusion".to_string()),
            ),
            FailureReason::AllFailed if aggregated.all_rejected() => {
                (ExecutionStatus::Failed, ExecutionReason::RelayRejected, first_error)
            }
            FailureReason::AllFailed => {
                (ExecutionStatus::Failed, ExecutionReason::RelaysUnavailable, first_error)
            }
        }
    }

    fn expire(
        &self,
        opportunity: &Opportunity,
        lifecycle: Lifecycle,
        progress: Progress,
    ) -> ExecutionResult {
        self.finish(
            opportunity,
            lifecycle,
            progress,
            ExecutionStatus::Expired,
            ExecutionReason::DeadlineElapsed,
            Some("deadline passed".to_string()),
        )
    }

    fn finish(
        &self,
        opportunity: &Opportunity,
        mut lifecycle: Lifecycle,
        progress: Progress,
        status: ExecutionStatus,
        reason: ExecutionReason,
        detail: Option<String>,
    ) -> ExecutionResult {
        lifecycle.advance(status.into());

        {
            let mut stats = self.stats.lock();
            match status {
                ExecutionStatus::Included => {
                    stats.included += 1;
                    stats.profit_captured_eth += wei_to_eth(opportunity.expected_profit);
                }
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Expired => stats.expired += 1,
                ExecutionStatus::Aborted => stats.aborted += 1,
            }
        }

        match status {
            ExecutionStatus::Included => log_profit!(
                "{} included in block {:?}, expected profit {} ETH",
                opportunity.id,
                progress.block_number,
                wei_to_eth(opportunity.expected_profit)
            ),
            ExecutionStatus::Aborted => log_error!(
                "Execution of {} aborted ({:?}): {}",
                opportunity.id,
                reason,
                detail.as_deref().unwrap_or("")
            ),
            _ => debug!(
                opportunity_id = %opportunity.id,
                ?status,
                ?reason,
                detail = detail.as_deref().unwrap_or(""),
                "Execution finished"
            ),
        }

        ExecutionResult {
            opportunity_id: opportunity.id.clone(),
            strategy_id: opportunity.strategy_id.clone(),
            status,
            reason,
            detail,
            committed_nonces: progress.committed_nonces,
            relay_results: progress.relay_results,
            transitions: lifecycle.transitions,
            fee_schedule: progress.fee_schedule,
            bundle_hash: progress.bundle_hash,
            block_number: progress.block_number,
            elapsed: lifecycle.started.elapsed(),
        }
    }
}

fn classify_gas_error(error: &GasError) -> (ExecutionStatus, ExecutionReason) {
    match error {
        GasError::Unprofitable { .. } => (ExecutionStatus::Failed, ExecutionReason::Unprofitable),
        GasError::StaleEstimate { .. } => (ExecutionStatus::Failed, ExecutionReason::StaleGasEstimate),
        GasError::InvalidOpportunity { .. } => {
            (ExecutionStatus::Failed, ExecutionReason::InvalidOpportunity)
        }
        GasError::Provider(e) if e.is_fatal() => {
            (ExecutionStatus::Aborted, ExecutionReason::ProviderAuthFailed)
        }
        GasError::Provider(_) | GasError::NoSamples => {
            (ExecutionStatus::Failed, ExecutionReason::GasUnavailable)
        }
    }
}
