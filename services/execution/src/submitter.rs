//! # Bundle Submitter - Deadline-Bounded Relay Race
//!
//! ## Purpose
//!
//! Sends one signed bundle to every configured relay at once and returns as
//! soon as one of them succeeds, dropping the remaining calls. Each relay gets
//! its own retry loop for transient failures and its own circuit breaker.
//!
//! ## Architecture Role
//!
//! ```text
//!                       ┌─ breaker ─→ retry ─→ relay A ─┐
//! SignedBundle ──→ [submit] ─ breaker ─→ retry ─→ relay B ─┼─→ first success wins
//!                       └─ breaker ─→ retry ─→ relay C ─┘    others cancelled
//!                                 every call bounded by min(relay timeout, deadline)
//! ```
//!
//! ## Performance Profile
//!
//! - **Fan-out**: all relays polled concurrently on the caller's task (`FuturesUnordered`)
//! - **Cancellation**: losers are dropped the moment a winner reports; dropped
//!   half-open trials release their breaker slot
//! - **Deadline**: nothing outlives the opportunity deadline

use crate::bundle::SignedBundle;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::SubmitterConfig;
use crate::error::RelayError;
use crate::logging::LogEmoji;
use crate::relay::{Inclusion, RelayBackend, RelayClient, RelayReceipt};
use crate::retry::retry_async;
use ethers::types::H256;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Included,
    /// Simulated and accepted without observed inclusion
    Accepted,
    /// Deterministic refusal (revert, rejection, nonce too low)
    Rejected,
    TimedOut,
    /// Transport, authentication or circuit-open failure
    Error,
    /// Dropped because another relay won
    Cancelled,
}

/// Per-relay outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleSubmissionResult {
    pub relay: String,
    pub status: SubmissionStatus,
    pub bundle_hash: Option<H256>,
    pub block_number: Option<u64>,
    pub error: Option<RelayError>,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    DeadlineElapsed,
    AllFailed,
    /// Relays accepted the bundle but none reported inclusion
    NotIncluded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Success {
        relay: String,
        bundle_hash: Option<H256>,
        block_number: Option<u64>,
    },
    Failure {
        reason: FailureReason,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResult {
    pub outcome: SubmissionOutcome,
    /// One entry per relay, in the order the relays were given
    pub results: Vec<BundleSubmissionResult>,
    pub elapsed: Duration,
}

impl AggregatedResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SubmissionOutcome::Success { .. })
    }

    pub fn errors(&self) -> impl Iterator<Item = &RelayError> {
        self.results.iter().filter_map(|r| r.error.as_ref())
    }

    pub fn has_fatal_error(&self) -> bool {
        self.errors().any(RelayError::is_fatal)
    }

    pub fn has_nonce_too_low(&self) -> bool {
        self.errors()
            .any(|e| matches!(e, RelayError::NonceTooLow { .. }))
    }

    /// Every relay refused deterministically
    pub fn all_rejected(&self) -> bool {
        !self.results.is_empty()
            && self
                .results
                .iter()
                .all(|r| r.status == SubmissionStatus::Rejected)
    }

    pub fn winner(&self) -> Option<&BundleSubmissionResult> {
        match &self.outcome {
            SubmissionOutcome::Success { relay, .. } => {
                self.results.iter().find(|r| &r.relay == relay)
            }
            SubmissionOutcome::Failure { .. } => None,
        }
    }
}

/// Races bundles across relays; owns the per-relay breakers
pub struct BundleSubmitter {
    config: SubmitterConfig,
    breakers: CircuitBreakerRegistry,
}

impl BundleSubmitter {
    pub fn new(config: SubmitterConfig) -> Self {
        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
        Self { config, breakers }
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    fn is_success(&self, receipt: &RelayReceipt) -> bool {
        match receipt.inclusion {
            Inclusion::Included { .. } => true,
            Inclusion::Accepted => !self.config.require_inclusion,
        }
    }

    /// One relay's retry loop behind its breaker
    async fn drive_relay(
        &self,
        relay: &RelayBackend,
        bundle: &SignedBundle,
        deadline: Instant,
        attempts: &AtomicU32,
    ) -> Result<RelayReceipt, RelayError> {
        let breaker = self.breakers.get(relay.name());
        let relay_timeout = self.config.relay_timeout();

        retry_async(
            &self.config.retry,
            Some(deadline),
            RelayError::is_transient,
            |attempt| {
                let breaker = Arc::clone(&breaker);
                async move {
                    let permit = breaker.try_acquire()?;
                    attempts.store(attempt, Ordering::SeqCst);

                    let call_deadline = (Instant::now() + relay_timeout).min(deadline);
                    let result = match timeout_at(
                        call_deadline,
                        relay.submit_bundle(bundle, call_deadline),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(RelayError::Timeout),
                    };

                    match &result {
                        // Deterministic refusals come from a healthy relay
                        Err(e) if !e.is_deterministic() => permit.record_failure(),
                        _ => permit.record_success(),
                    }
                    if let Err(e) = &result {
                        debug!(relay = relay.name(), attempt, error = %e, "relay attempt failed");
                    }
                    result
                }
            },
        )
        .await
    }

    /// Race `bundle` across `relays` until one succeeds or `deadline` passes
    pub async fn submit(
        &self,
        bundle: &SignedBundle,
        relays: &[Arc<RelayBackend>],
        deadline: Instant,
    ) -> AggregatedResult {
        let started = Instant::now();
        let mut slots: Vec<Option<BundleSubmissionResult>> = vec![None; relays.len()];
        let mut winner: Option<usize> = None;
        let mut deadline_hit = false;
        // Outlives the race so cut-off relays still report their attempts
        let attempts: Vec<AtomicU32> = relays.iter().map(|_| AtomicU32::new(0)).collect();

        {
            let attempts = &attempts;
            let mut pending: FuturesUnordered<_> = relays
                .iter()
                .enumerate()
                .map(|(index, relay)| async move {
                    let call_started = Instant::now();
                    let result = self
                        .drive_relay(relay, bundle, deadline, &attempts[index])
                        .await;
                    (index, result, call_started.elapsed())
                })
                .collect();

            let expiry = sleep_until(deadline);
            tokio::pin!(expiry);

            loop {
                tokio::select! {
                    biased;
                    next = pending.next() => {
                        let Some((index, result, elapsed)) = next else { break };
                        let success = matches!(&result, Ok(receipt) if self.is_success(receipt));
                        slots[index] = Some(to_submission_result(
                            relays[index].name(),
                            result,
                            attempts[index].load(Ordering::SeqCst),
                            elapsed,
                        ));
                        if success {
                            winner = Some(index);
                            break;
                        }
                    }
                    _ = &mut expiry => {
                        deadline_hit = true;
                        break;
                    }
                }
            }
            // Dropping `pending` cancels every relay call still in flight
        }

        let results: Vec<BundleSubmissionResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| BundleSubmissionResult {
                    relay: relays[index].name().to_string(),
                    status: if winner.is_some() {
                        SubmissionStatus::Cancelled
                    } else {
                        SubmissionStatus::TimedOut
                    },
                    bundle_hash: None,
                    block_number: None,
                    error: if winner.is_some() {
                        None
                    } else {
                        Some(RelayError::Timeout)
                    },
                    attempts: attempts[index].load(Ordering::SeqCst),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            })
            .collect();

        let outcome = match winner {
            Some(index) => {
                let won = &results[index];
                info!(
                    relay = %won.relay,
                    block_number = ?won.block_number,
                    elapsed_ms = won.elapsed_ms,
                    "{} Bundle landed via {}",
                    LogEmoji::SUCCESS,
                    won.relay
                );
                SubmissionOutcome::Success {
                    relay: won.relay.clone(),
                    bundle_hash: won.bundle_hash,
                    block_number: won.block_number,
                }
            }
            None => {
                let reason = if results
                    .iter()
                    .any(|r| r.status == SubmissionStatus::Accepted)
                {
                    FailureReason::NotIncluded
                } else if deadline_hit || Instant::now() >= deadline {
                    FailureReason::DeadlineElapsed
                } else {
                    FailureReason::AllFailed
                };
                warn!(
                    bundle_hash = ?bundle.bundle_hash,
                    ?reason,
                    relays = relays.len(),
                    "{} Bundle submission failed",
                    LogEmoji::ERROR
                );
                SubmissionOutcome::Failure { reason }
            }
        };

        AggregatedResult {
            outcome,
            results,
            elapsed: started.elapsed(),
        }
    }
}

fn to_submission_result(
    relay: &str,
    result: Result<RelayReceipt, RelayError>,
    attempts: u32,
    elapsed: Duration,
) -> BundleSubmissionResult {
    let elapsed_ms = elapsed.as_millis() as u64;
    match result {
        Ok(receipt) => {
            let (status, block_number) = match receipt.inclusion {
                Inclusion::Included { block_number } => {
                    (SubmissionStatus::Included, Some(block_number))
                }
                Inclusion::Accepted => (SubmissionStatus::Accepted, None),
            };
            BundleSubmissionResult {
                relay: relay.to_string(),
                status,
                bundle_hash: receipt.bundle_hash,
                block_number,
                error: None,
                attempts,
                elapsed_ms,
            }
        }
        Err(error) => {
            let status = if error.is_deterministic() {
                SubmissionStatus::Rejected
            } else if error == RelayError::Timeout {
                SubmissionStatus::TimedOut
            } else {
                SubmissionStatus::Error
            };
            BundleSubmissionResult {
                relay: relay.to_string(),
                status,
                bundle_hash: None,
                block_number: None,
                error: Some(error),
                attempts,
                elapsed_ms,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::relay::{ScriptedOutcome, ScriptedRelay};
    use crate::retry::RetryPolicy;
    use crate::testing;

    fn submitter(max_attempts: u32, require_inclusion: bool) -> BundleSubmitter {
        BundleSubmitter::new(SubmitterConfig {
            relay_timeout_ms: 2_000,
            retry: RetryPolicy::new(max_attempts, Duration::from_millis(100), Duration::from_secs(1)),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout_ms: 5_000,
            },
            require_inclusion,
        })
    }

    fn backends(relays: &[ScriptedRelay]) -> Vec<Arc<RelayBackend>> {
        relays
            .iter()
            .map(|r| Arc::new(RelayBackend::from(r.clone())))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_per_relay() {
        let flaky = ScriptedRelay::new("flaky")
            .fail_after(Duration::from_millis(10), RelayError::connection("reset"))
            .fail_after(Duration::from_millis(10), RelayError::Timeout)
            .include_after(Duration::from_millis(10), 12);
        let submitter = submitter(3, true);
        let bundle = testing::signed_bundle(12);

        let result = submitter
            .submit(&bundle, &backends(&[flaky.clone()]), Instant::now() + Duration::from_secs(5))
            .await;

        assert!(result.is_success());
        assert_eq!(result.results[0].attempts, 3);
        assert_eq!(result.results[0].block_number, Some(12));
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deterministic_rejection_not_retried() {
        let reverting = ScriptedRelay::new("reverting")
            .fail_after(Duration::from_millis(10), RelayError::reverted("execution reverted"));
        let submitter = submitter(5, true);

        let result = submitter
            .submit(
                &testing::signed_bundle(1),
                &backends(&[reverting.clone()]),
                Instant::now() + Duration::from_secs(5),
            )
            .await;

        assert_eq!(result.outcome, SubmissionOutcome::Failure { reason: FailureReason::AllFailed });
        assert_eq!(result.results[0].status, SubmissionStatus::Rejected);
        assert_eq!(result.results[0].attempts, 1);
        assert!(result.all_rejected());
        assert_eq!(reverting.calls(), 1);
        // Rejection is not a relay fault
        assert_eq!(submitter.breakers().state("reverting"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptance_counts_when_inclusion_not_required() {
        let relay = ScriptedRelay::new("builder").then(Duration::from_millis(5), ScriptedOutcome::Accept);
        let lenient = submitter(1, false);
        let result = lenient
            .submit(&testing::signed_bundle(1), &backends(&[relay]), Instant::now() + Duration::from_secs(1))
            .await;
        assert!(result.is_success());

        let relay = ScriptedRelay::new("builder").then(Duration::from_millis(5), ScriptedOutcome::Accept);
        let strict = submitter(1, true);
        let result = strict
            .submit(&testing::signed_bundle(1), &backends(&[relay]), Instant::now() + Duration::from_secs(1))
            .await;
        assert_eq!(result.outcome, SubmissionOutcome::Failure { reason: FailureReason::NotIncluded });
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_call_bounded_by_relay_timeout() {
        let slow = ScriptedRelay::new("slow")
            .include_after(Duration::from_secs(10), 1)
            .include_after(Duration::from_secs(10), 1);
        let submitter = submitter(2, true);
        let start = Instant::now();

        let result = submitter
            .submit(&testing::signed_bundle(1), &backends(&[slow.clone()]), start + Duration::from_secs(3))
            .await;

        // 2s timeout, 100ms backoff, second call cut at the 3s deadline
        assert_eq!(result.outcome, SubmissionOutcome::Failure { reason: FailureReason::DeadlineElapsed });
        assert_eq!(slow.calls(), 2);
        assert_eq!(slow.cancelled(), 2);
        assert_eq!(Instant::now() - start, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits() {
        let down = ScriptedRelay::new("down")
            .otherwise(Duration::from_millis(1), ScriptedOutcome::Fail(RelayError::connection("refused")));
        let submitter = submitter(3, true);
        let relays = backends(&[down.clone()]);

        let first = submitter
            .submit(&testing::signed_bundle(1), &relays, Instant::now() + Duration::from_secs(5))
            .await;
        assert_eq!(first.results[0].attempts, 3);
        assert_eq!(submitter.breakers().state("down"), CircuitState::Open);

        let second = submitter
            .submit(&testing::signed_bundle(1), &relays, Instant::now() + Duration::from_secs(1))
            .await;
        assert!(matches!(second.results[0].error, Some(RelayError::CircuitOpen { .. })));
        assert_eq!(second.results[0].status, SubmissionStatus::Error);
        assert_eq!(down.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_responses_open_breaker() {
        let garbled = ScriptedRelay::new("garbled").otherwise(
            Duration::from_millis(5),
            ScriptedOutcome::Fail(RelayError::invalid_response("result missing")),
        );
        let submitter = BundleSubmitter::new(SubmitterConfig {
            relay_timeout_ms: 2_000,
            retry: RetryPolicy::none(),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout_ms: 5_000,
            },
            require_inclusion: true,
        });
        let relays = backends(&[garbled.clone()]);

        for _ in 0..2 {
            let result = submitter
                .submit(&testing::signed_bundle(1), &relays, Instant::now() + Duration::from_secs(1))
                .await;
            assert_eq!(result.results[0].status, SubmissionStatus::Error);
        }
        assert_eq!(submitter.breakers().state("garbled"), CircuitState::Open);
        assert_eq!(garbled.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cut_relay_reports_its_attempts() {
        let stuck = ScriptedRelay::new("stuck")
            .fail_after(Duration::from_millis(10), RelayError::connection("reset"))
            .hang();
        let submitter = submitter(3, true);

        let result = submitter
            .submit(
                &testing::signed_bundle(1),
                &backends(&[stuck.clone()]),
                Instant::now() + Duration::from_millis(500),
            )
            .await;

        assert_eq!(result.outcome, SubmissionOutcome::Failure { reason: FailureReason::DeadlineElapsed });
        assert_eq!(result.results[0].status, SubmissionStatus::TimedOut);
        // Failed once, then cut off mid second attempt
        assert_eq!(result.results[0].attempts, 2);
        assert_eq!(stuck.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptance_outranks_deadline_in_failure_reason() {
        let relay = ScriptedRelay::new("builder").then(Duration::from_millis(5), ScriptedOutcome::Accept);
        let stuck = ScriptedRelay::new("stuck").hang();
        let strict = submitter(1, true);

        let result = strict
            .submit(
                &testing::signed_bundle(1),
                &backends(&[relay, stuck]),
                Instant::now() + Duration::from_millis(300),
            )
            .await;

        assert_eq!(result.outcome, SubmissionOutcome::Failure { reason: FailureReason::NotIncluded });
        assert_eq!(result.results[0].status, SubmissionStatus::Accepted);
        assert_eq!(result.results[1].status, SubmissionStatus::TimedOut);
        assert_eq!(result.results[1].attempts, 1);
    }
}
