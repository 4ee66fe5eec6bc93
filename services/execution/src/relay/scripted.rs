//! Deterministic relay for fault injection
//!
//! Plays back a queue of (delay, outcome) steps, one per call, and counts
//! calls that were dropped before their step finished.

use super::{Inclusion, RelayClient, RelayReceipt};
use crate::bundle::SignedBundle;
use crate::error::RelayError;
use async_trait::async_trait;
use ethers::types::H256;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Include { block_number: u64 },
    Accept,
    Fail(RelayError),
    /// Never answers
    Hang,
}

#[derive(Debug, Clone)]
struct ScriptStep {
    delay: Duration,
    outcome: ScriptedOutcome,
}

#[derive(Debug, Default)]
struct ScriptState {
    steps: Mutex<VecDeque<ScriptStep>>,
    fallback: Mutex<Option<ScriptStep>>,
    submitted: Mutex<Vec<H256>>,
    calls: AtomicU32,
    completed: AtomicU32,
    cancelled: AtomicU32,
}

/// Cheap to clone; clones share the script and counters
#[derive(Debug, Clone)]
pub struct ScriptedRelay {
    name: String,
    state: Arc<ScriptState>,
}

struct CancelGuard<'a> {
    state: &'a ScriptState,
    finished: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ScriptedRelay {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(ScriptState::default()),
        }
    }

    /// Queue the answer for the next unscripted call
    pub fn then(self, delay: Duration, outcome: ScriptedOutcome) -> Self {
        self.state.steps.lock().push_back(ScriptStep { delay, outcome });
        self
    }

    /// Answer used once the queue is empty
    pub fn otherwise(self, delay: Duration, outcome: ScriptedOutcome) -> Self {
        *self.state.fallback.lock() = Some(ScriptStep { delay, outcome });
        self
    }

    pub fn include_after(self, delay: Duration, block_number: u64) -> Self {
        self.then(delay, ScriptedOutcome::Include { block_number })
    }

    pub fn fail_after(self, delay: Duration, error: RelayError) -> Self {
        self.then(delay, ScriptedOutcome::Fail(error))
    }

    pub fn hang(self) -> Self {
        self.then(Duration::ZERO, ScriptedOutcome::Hang)
    }

    pub fn calls(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u32 {
        self.state.completed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> u32 {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Bundle hashes received, in call order
    pub fn submitted(&self) -> Vec<H256> {
        self.state.submitted.lock().clone()
    }

    fn next_step(&self) -> ScriptStep {
        if let Some(step) = self.state.steps.lock().pop_front() {
            return step;
        }
        self.state.fallback.lock().clone().unwrap_or(ScriptStep {
            delay: Duration::ZERO,
            outcome: ScriptedOutcome::Fail(RelayError::connection("script exhausted")),
        })
    }
}

#[async_trait]
impl RelayClient for ScriptedRelay {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_bundle(
        &self,
        bundle: &SignedBundle,
        _deadline: Instant,
    ) -> Result<RelayReceipt, RelayError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state.submitted.lock().push(bundle.bundle_hash);
        let step = self.next_step();

        let mut guard = CancelGuard {
            state: &self.state,
            finished: false,
        };
        if step.outcome == ScriptedOutcome::Hang {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(step.delay).await;
        guard.finished = true;
        self.state.completed.fetch_add(1, Ordering::SeqCst);

        let bundle_hash = Some(bundle.bundle_hash);
        match step.outcome {
            ScriptedOutcome::Include { block_number } => Ok(RelayReceipt {
                bundle_hash,
                inclusion: Inclusion::Included { block_number },
            }),
            ScriptedOutcome::Accept => Ok(RelayReceipt {
                bundle_hash,
                inclusion: Inclusion::Accepted,
            }),
            ScriptedOutcome::Fail(error) => Err(error),
            ScriptedOutcome::Hang => Err(RelayError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test(start_paused = true)]
    async fn test_plays_script_in_order() {
        let relay = ScriptedRelay::new("scripted")
            .fail_after(Duration::from_millis(10), RelayError::Timeout)
            .include_after(Duration::from_millis(20), 7);
        let bundle = testing::signed_bundle(7);
        let deadline = Instant::now() + Duration::from_secs(1);

        assert_eq!(relay.submit_bundle(&bundle, deadline).await, Err(RelayError::Timeout));
        let receipt = relay.submit_bundle(&bundle, deadline).await.unwrap();
        assert_eq!(receipt.inclusion, Inclusion::Included { block_number: 7 });
        assert!(relay.submit_bundle(&bundle, deadline).await.unwrap_err().is_transient());
        assert_eq!(relay.calls(), 3);
        assert_eq!(relay.submitted().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_cancelled_calls() {
        let relay = ScriptedRelay::new("slow").include_after(Duration::from_secs(10), 1);
        let bundle = testing::signed_bundle(1);

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            relay.submit_bundle(&bundle, Instant::now() + Duration::from_secs(20)),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(relay.cancelled(), 1);
        assert_eq!(relay.completed(), 0);
    }
}
