//! Multi-relay race and circuit breaker behaviour through the public submitter

use mev_execution::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use mev_execution::config::SubmitterConfig;
use mev_execution::error::RelayError;
use mev_execution::provider::ChainProvider;
use mev_execution::relay::{FlashbotsRelay, RelayBackend, ScriptedRelay};
use mev_execution::retry::RetryPolicy;
use mev_execution::submitter::{BundleSubmitter, FailureReason, SubmissionOutcome, SubmissionStatus};
use mev_execution::testing::{self, JsonRpcStub, MockChainProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn backends(relays: &[&ScriptedRelay]) -> Vec<Arc<RelayBackend>> {
    relays
        .iter()
        .map(|relay| Arc::new(RelayBackend::from((*relay).clone())))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_first_inclusion_wins_and_cancels_the_rest() {
    let a = ScriptedRelay::new("A").include_after(Duration::from_millis(100), 500);
    let b = ScriptedRelay::new("B").include_after(Duration::from_millis(30), 500);
    let c = ScriptedRelay::new("C").hang();
    let submitter = BundleSubmitter::new(SubmitterConfig::default());
    let bundle = testing::signed_bundle(500);

    let started = Instant::now();
    let result = submitter
        .submit(&bundle, &backends(&[&a, &b, &c]), started + Duration::from_secs(2))
        .await;

    assert_eq!(started.elapsed(), Duration::from_millis(30));
    assert_eq!(
        result.outcome,
        SubmissionOutcome::Success {
            relay: "B".to_string(),
            bundle_hash: Some(bundle.bundle_hash),
            block_number: Some(500),
        }
    );
    assert_eq!(result.winner().unwrap().relay, "B");

    let statuses: Vec<_> = result.results.iter().map(|r| (r.relay.as_str(), r.status)).collect();
    assert_eq!(
        statuses,
        vec![
            ("A", SubmissionStatus::Cancelled),
            ("B", SubmissionStatus::Included),
            ("C", SubmissionStatus::Cancelled),
        ]
    );
    assert_eq!(a.cancelled(), 1);
    assert_eq!(c.cancelled(), 1);
    assert_eq!(b.completed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_then_recovers() {
    let config = SubmitterConfig {
        retry: RetryPolicy::none(),
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout_ms: 1_000,
        },
        ..SubmitterConfig::default()
    };
    let submitter = BundleSubmitter::new(config);
    let relay = ScriptedRelay::new("flaky")
        .fail_after(Duration::from_millis(5), RelayError::connection("reset"))
        .fail_after(Duration::from_millis(5), RelayError::connection("reset"))
        .include_after(Duration::from_millis(5), 9);
    let relays = backends(&[&relay]);
    let bundle = testing::signed_bundle(9);
    let deadline = || Instant::now() + Duration::from_secs(1);

    for _ in 0..2 {
        let result = submitter.submit(&bundle, &relays, deadline()).await;
        assert_eq!(result.results[0].status, SubmissionStatus::Error);
    }
    assert_eq!(submitter.breakers().state("flaky"), CircuitState::Open);

    let short_circuited = submitter.submit(&bundle, &relays, deadline()).await;
    assert_eq!(
        short_circuited.results[0].error,
        Some(RelayError::CircuitOpen {
            relay: "flaky".to_string()
        })
    );
    assert_eq!(relay.calls(), 2);

    tokio::time::advance(Duration::from_millis(1_000)).await;
    let recovered = submitter.submit(&bundle, &relays, deadline()).await;
    assert!(recovered.is_success());
    assert_eq!(relay.calls(), 3);
    assert_eq!(submitter.breakers().state("flaky"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_before_any_answer() {
    let slow = ScriptedRelay::new("slow").include_after(Duration::from_secs(5), 1);
    let submitter = BundleSubmitter::new(SubmitterConfig {
        relay_timeout_ms: 10_000,
        ..SubmitterConfig::default()
    });
    let bundle = testing::signed_bundle(1);

    let result = submitter
        .submit(&bundle, &backends(&[&slow]), Instant::now() + Duration::from_millis(300))
        .await;

    assert!(!result.is_success());
    assert_eq!(result.results[0].status, SubmissionStatus::TimedOut);
    assert_eq!(slow.cancelled(), 1);
    assert!(result.elapsed <= Duration::from_millis(300));
}

#[tokio::test]
async fn test_unobserved_inclusion_leaves_breaker_closed() {
    let bundle_hash = ethers::types::H256::repeat_byte(0x11);
    let stub = JsonRpcStub::serve(serde_json::json!({ "bundleHash": bundle_hash }))
        .await
        .unwrap();
    let provider: Arc<dyn ChainProvider> = Arc::new(MockChainProvider::new());
    let relay = FlashbotsRelay::new("flashbots", &stub.url, testing::wallet(3), reqwest::Client::new())
        .unwrap()
        .with_inclusion_watch(provider);
    let relays = vec![Arc::new(RelayBackend::Flashbots(relay))];

    let submitter = BundleSubmitter::new(SubmitterConfig {
        relay_timeout_ms: 300,
        retry: RetryPolicy::none(),
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout_ms: 60_000,
        },
        require_inclusion: true,
    });
    let bundle = testing::signed_bundle(77);

    for _ in 0..2 {
        let result = submitter
            .submit(&bundle, &relays, Instant::now() + Duration::from_secs(2))
            .await;
        assert_eq!(
            result.outcome,
            SubmissionOutcome::Failure {
                reason: FailureReason::NotIncluded
            }
        );
        assert_eq!(result.results[0].status, SubmissionStatus::Accepted);
        assert_eq!(result.results[0].error, None);
        assert_eq!(result.results[0].attempts, 1);
    }

    assert_eq!(submitter.breakers().state("flashbots"), CircuitState::Closed);
    assert_eq!(stub.requests(), 2);
}
