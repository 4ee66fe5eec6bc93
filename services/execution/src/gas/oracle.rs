use super::{nearest_rank, GasEstimate};
use crate::config::GasConfig;
use crate::error::{GasError, ProviderError};
use crate::logging::LogEmoji;
use crate::provider::{BlockFeeSample, ChainProvider};
use crate::retry::retry_async;
use crate::types::Urgency;
use ethers::types::U256;
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Snapshot of recent blocks, replaced wholesale on every refresh
#[derive(Debug)]
struct FeeWindow {
    samples: VecDeque<BlockFeeSample>,
    next_base_fee: U256,
    sampled_at: Instant,
}

impl FeeWindow {
    fn latest_block(&self) -> u64 {
        self.samples.back().map(|s| s.block_number).unwrap_or_default()
    }
}

/// Rolling-window fee oracle shared by every execution task
pub struct GasPriceOracle {
    provider: Arc<dyn ChainProvider>,
    config: GasConfig,
    window: RwLock<Option<Arc<FeeWindow>>>,
    source_unreachable: AtomicBool,
    /// Serializes refreshes so an on-demand fill does not race the background task
    refresh_lock: tokio::sync::Mutex<()>,
}

impl GasPriceOracle {
    pub fn new(provider: Arc<dyn ChainProvider>, config: GasConfig) -> Self {
        Self {
            provider,
            config,
            window: RwLock::new(None),
            source_unreachable: AtomicBool::new(false),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &GasConfig {
        &self.config
    }

    /// One sampling round. On failure the previous window is kept and flagged.
    pub async fn refresh(&self) -> Result<(), GasError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<(), GasError> {
        let provider = Arc::clone(&self.provider);
        let blocks = self.config.sample_blocks;

        let fetched = retry_async(
            &self.config.retry,
            None,
            ProviderError::is_transient,
            |_| {
                let provider = Arc::clone(&provider);
                async move { provider.fee_history(blocks).await }
            },
        )
        .await;

        let history = match fetched {
            Ok(history) => history,
            Err(e) => {
                if !self.source_unreachable.swap(true, Ordering::SeqCst) {
                    warn!("{} Fee source unreachable, serving last-known estimate: {}", LogEmoji::WARNING, e);
                }
                return Err(GasError::Provider(e));
            }
        };

        if history.samples.is_empty() {
            return Err(GasError::NoSamples);
        }

        let previous = self.window.read().clone();
        let mut merged: BTreeMap<u64, BlockFeeSample> = previous
            .iter()
            .flat_map(|w| w.samples.iter().cloned())
            .map(|s| (s.block_number, s))
            .collect();
        for sample in history.samples {
            merged.insert(sample.block_number, sample);
        }

        let keep = self.config.window_blocks.max(1);
        let skip = merged.len().saturating_sub(keep);
        let samples: VecDeque<BlockFeeSample> = merged.into_values().skip(skip).collect();

        let window = FeeWindow {
            samples,
            next_base_fee: history.next_base_fee,
            sampled_at: Instant::now(),
        };
        debug!(
            latest_block = window.latest_block(),
            blocks = window.samples.len(),
            next_base_fee = %window.next_base_fee,
            "{} Fee window refreshed",
            LogEmoji::GAS
        );

        *self.window.write() = Some(Arc::new(window));
        if self.source_unreachable.swap(false, Ordering::SeqCst) {
            info!("{} Fee source reachable again", LogEmoji::SUCCESS);
        }
        Ok(())
    }

    /// Estimate for `urgency`. Only an empty oracle samples on demand; once a
    /// window exists the background refresher owns freshness.
    pub async fn get_estimate(&self, urgency: Urgency) -> Result<GasEstimate, GasError> {
        if self.window.read().is_none() {
            let _guard = self.refresh_lock.lock().await;
            if self.window.read().is_none() {
                if let Err(e) = self.refresh_locked().await {
                    if self.window.read().is_none() {
                        return Err(e);
                    }
                }
            }
        }
        self.current_estimate(urgency).ok_or(GasError::NoSamples)
    }

    /// Estimate from the current window without touching the provider
    pub fn current_estimate(&self, urgency: Urgency) -> Option<GasEstimate> {
        let window = self.window.read().clone()?;

        let mut tips: Vec<U256> = window
            .samples
            .iter()
            .map(|s| s.priority_fee_per_gas)
            .collect();
        let percentile = self.config.percentiles.for_urgency(urgency);
        let priority_fee = nearest_rank(&mut tips, percentile)?;

        let base_fee = window.next_base_fee;
        let max_fee_per_gas = base_fee
            .saturating_mul(U256::from(self.config.headroom_permille()))
            / U256::from(1000u64)
            + priority_fee;

        let stale = self.source_unreachable.load(Ordering::SeqCst)
            || window.sampled_at.elapsed() > self.config.staleness_threshold();

        Some(GasEstimate {
            urgency,
            base_fee,
            priority_fee,
            max_fee_per_gas,
            sampled_block: window.latest_block(),
            sample_timestamp: window.sampled_at,
            stale,
        })
    }

    pub fn is_source_reachable(&self) -> bool {
        !self.source_unreachable.load(Ordering::SeqCst)
    }

    pub fn window_len(&self) -> usize {
        self.window.read().as_ref().map(|w| w.samples.len()).unwrap_or(0)
    }

    /// Start the single background refresher
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let oracle = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = oracle.refresh().await {
                    debug!("Background fee refresh failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::testing::MockChainProvider;
    use crate::types::gwei;

    fn config() -> GasConfig {
        GasConfig {
            window_blocks: 5,
            staleness_threshold_ms: 10_000,
            retry: RetryPolicy::none(),
            ..GasConfig::default()
        }
    }

    fn samples(start: u64, tips_gwei: &[u64]) -> Vec<BlockFeeSample> {
        tips_gwei
            .iter()
            .enumerate()
            .map(|(i, tip)| BlockFeeSample {
                block_number: start + i as u64,
                base_fee_per_gas: gwei(40),
                priority_fee_per_gas: gwei(*tip),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_percentile_per_urgency() {
        let provider = Arc::new(MockChainProvider::new());
        provider.set_fee_history(samples(100, &[1, 2, 3, 4, 5]), gwei(45));
        let oracle = GasPriceOracle::new(provider, config());

        let low = oracle.get_estimate(Urgency::Low).await.unwrap();
        let aggressive = oracle.get_estimate(Urgency::Aggressive).await.unwrap();

        assert_eq!(low.priority_fee, gwei(3));
        assert_eq!(aggressive.priority_fee, gwei(5));
        // 45 * 2.0 + 5
        assert_eq!(aggressive.max_fee_per_gas, gwei(95));
        assert_eq!(aggressive.sampled_block, 104);
        assert!(!aggressive.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_dedupes_and_trims() {
        let provider = Arc::new(MockChainProvider::new());
        provider.set_fee_history(samples(100, &[1, 1, 1]), gwei(45));
        let oracle = GasPriceOracle::new(provider.clone(), config());
        oracle.refresh().await.unwrap();

        // Overlaps blocks 101-102 and extends to 105
        provider.set_fee_history(samples(101, &[9, 9, 9, 9, 9]), gwei(45));
        oracle.refresh().await.unwrap();

        assert_eq!(oracle.window_len(), 5);
        let estimate = oracle.get_estimate(Urgency::Low).await.unwrap();
        assert_eq!(estimate.priority_fee, gwei(9));
        assert_eq!(estimate.sampled_block, 105);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_source_serves_stale_estimate() {
        let provider = Arc::new(MockChainProvider::new());
        provider.set_fee_history(samples(1, &[2, 2, 2]), gwei(45));
        let oracle = GasPriceOracle::new(provider.clone(), config());
        oracle.refresh().await.unwrap();

        provider.set_offline(true);
        assert!(oracle.refresh().await.is_err());

        let estimate = oracle.get_estimate(Urgency::Normal).await.unwrap();
        assert!(estimate.stale);
        assert_eq!(estimate.priority_fee, gwei(2));
        assert!(!oracle.is_source_reachable());

        provider.set_offline(false);
        oracle.refresh().await.unwrap();
        assert!(!oracle.get_estimate(Urgency::Normal).await.unwrap().stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimate_goes_stale_with_age() {
        let provider = Arc::new(MockChainProvider::new());
        provider.set_fee_history(samples(1, &[2]), gwei(45));
        let oracle = GasPriceOracle::new(provider, config());
        oracle.refresh().await.unwrap();

        tokio::time::advance(Duration::from_millis(9_000)).await;
        assert!(!oracle.current_estimate(Urgency::Normal).unwrap().stale);

        tokio::time::advance(Duration::from_millis(2_000)).await;
        assert!(oracle.current_estimate(Urgency::Normal).unwrap().stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_window_and_no_source_fails() {
        let provider = Arc::new(MockChainProvider::new());
        provider.set_offline(true);
        let oracle = GasPriceOracle::new(provider, config());

        assert!(matches!(
            oracle.get_estimate(Urgency::Normal).await,
            Err(GasError::Provider(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresher_keeps_window_fresh() {
        let provider = Arc::new(MockChainProvider::new());
        provider.set_fee_history(samples(1, &[2]), gwei(45));
        let oracle = Arc::new(GasPriceOracle::new(provider.clone(), config()));

        let handle = oracle.spawn_refresh(Duration::from_millis(1_000));
        tokio::time::sleep(Duration::from_millis(30_500)).await;

        assert!(!oracle.current_estimate(Urgency::Normal).unwrap().stale);
        assert!(provider.fee_calls() >= 30);
        handle.abort();
    }
}
