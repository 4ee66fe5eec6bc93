use super::{GasEstimate, GasPriceOracle};
use crate::config::{GasConfig, StalePolicy};
use crate::error::GasError;
use crate::logging::LogEmoji;
use crate::types::{wei_to_eth, Opportunity, Urgency};
use ethers::types::U256;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fee caps chosen for one bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeSchedule {
    /// Sum of the bundle's call gas limits
    pub gas_limit: u64,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    /// Worst-case spend: max_fee_per_gas * gas_limit
    pub max_cost: U256,
    /// Highest per-gas price that stays profitable and within budget
    pub price_ceiling: U256,
    pub estimate: GasEstimate,
}

impl FeeSchedule {
    pub fn max_cost_eth(&self) -> Decimal {
        wei_to_eth(self.max_cost)
    }
}

/// Profitability gate on top of the oracle
pub struct GasManager {
    oracle: Arc<GasPriceOracle>,
    config: GasConfig,
}

impl GasManager {
    pub fn new(oracle: Arc<GasPriceOracle>) -> Self {
        let config = oracle.config().clone();
        Self { oracle, config }
    }

    pub fn oracle(&self) -> &Arc<GasPriceOracle> {
        &self.oracle
    }

    /// Choose fee caps for `opportunity`, or refuse it.
    ///
    /// The ceiling is the highest price where `expected_profit - price * gas_limit > 0`
    /// and `price * gas_limit <= max_gas_budget` both hold. The floor is the
    /// next base fee plus the minimum tip; a ceiling below the floor can never
    /// be profitable.
    pub async fn evaluate(
        &self,
        opportunity: &Opportunity,
        urgency: Urgency,
    ) -> Result<FeeSchedule, GasError> {
        let gas_limit = opportunity.total_gas_limit();
        if gas_limit == 0 {
            return Err(GasError::InvalidOpportunity {
                message: "bundle has zero total gas limit".to_string(),
            });
        }

        let estimate = self.oracle.get_estimate(urgency).await?;
        let (mut max_fee, mut priority_fee) = (estimate.max_fee_per_gas, estimate.priority_fee);

        if estimate.stale {
            let age_ms = estimate.age().as_millis() as u64;
            match self.config.stale_policy {
                StalePolicy::Reject => {
                    warn!(
                        opportunity_id = %opportunity.id,
                        age_ms,
                        "{} Refusing stale gas estimate",
                        LogEmoji::GAS
                    );
                    return Err(GasError::StaleEstimate { age_ms });
                }
                StalePolicy::AllowWithBump { bump_percent } => {
                    max_fee = bump(max_fee, bump_percent);
                    priority_fee = bump(priority_fee, bump_percent);
                    debug!(
                        opportunity_id = %opportunity.id,
                        bump_percent,
                        "Using stale gas estimate with fee bump"
                    );
                }
            }
        }

        let limit = U256::from(gas_limit);
        let profit_ceiling = if opportunity.expected_profit.is_zero() {
            U256::zero()
        } else {
            (opportunity.expected_profit - 1) / limit
        };
        let budget_ceiling = opportunity.max_gas_budget / limit;
        let price_ceiling = profit_ceiling.min(budget_ceiling);

        let min_tip = self.config.min_priority_fee();
        let price_floor = estimate.base_fee.saturating_add(min_tip);

        if price_ceiling < price_floor {
            debug!(
                opportunity_id = %opportunity.id,
                %price_ceiling,
                %price_floor,
                "Opportunity cannot cover gas"
            );
            return Err(GasError::Unprofitable {
                price_ceiling,
                price_floor,
            });
        }

        let max_fee_per_gas = max_fee.max(price_floor).min(price_ceiling);
        let headroom_for_tip = max_fee_per_gas.saturating_sub(estimate.base_fee);
        let max_priority_fee_per_gas = priority_fee.max(min_tip).min(headroom_for_tip);

        let schedule = FeeSchedule {
            gas_limit,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            max_cost: max_fee_per_gas.saturating_mul(limit),
            price_ceiling,
            estimate,
        };

        debug!(
            opportunity_id = %opportunity.id,
            urgency = %urgency,
            max_fee = %schedule.max_fee_per_gas,
            tip = %schedule.max_priority_fee_per_gas,
            max_cost_eth = %schedule.max_cost_eth(),
            "{} Gas approved",
            LogEmoji::GAS
        );
        Ok(schedule)
    }
}

fn bump(value: U256, percent: u32) -> U256 {
    value.saturating_mul(U256::from(100u64 + percent as u64)) / U256::from(100u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::BlockFeeSample;
    use crate::retry::RetryPolicy;
    use crate::testing::{self, MockChainProvider};
    use crate::types::gwei;
    use ethers::utils::parse_ether;
    use std::time::Duration;

    fn manager(provider: Arc<MockChainProvider>, stale_policy: StalePolicy) -> GasManager {
        let config = GasConfig {
            staleness_threshold_ms: 5_000,
            stale_policy,
            retry: RetryPolicy::none(),
            ..GasConfig::default()
        };
        GasManager::new(Arc::new(GasPriceOracle::new(provider, config)))
    }

    fn provider_with_fees(base_gwei: u64, tip_gwei: u64) -> Arc<MockChainProvider> {
        let provider = Arc::new(MockChainProvider::new());
        provider.set_fee_history(
            vec![BlockFeeSample {
                block_number: 1,
                base_fee_per_gas: gwei(base_gwei),
                priority_fee_per_gas: gwei(tip_gwei),
            }],
            gwei(base_gwei),
        );
        provider
    }

    #[tokio::test(start_paused = true)]
    async fn test_approves_profitable_opportunity() {
        let gas = manager(provider_with_fees(45, 10), StalePolicy::Reject);
        let opp = testing::opportunity("opp-1", testing::account(0), 500_000);

        let schedule = gas.evaluate(&opp, Urgency::Normal).await.unwrap();

        assert_eq!(schedule.max_fee_per_gas, gwei(100));
        assert_eq!(schedule.max_priority_fee_per_gas, gwei(10));
        assert_eq!(schedule.max_cost, parse_ether("0.05").unwrap());
        // budget 0.2 ETH over 500k gas
        assert_eq!(schedule.price_ceiling, gwei(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caps_fee_at_budget_ceiling() {
        let gas = manager(provider_with_fees(100, 50), StalePolicy::Reject);
        let opp = testing::opportunity("opp-2", testing::account(0), 1_000_000)
            .with_profit(parse_ether("1").unwrap(), parse_ether("0.2").unwrap());

        let schedule = gas.evaluate(&opp, Urgency::Aggressive).await.unwrap();

        // estimate 250 gwei, budget allows 200
        assert_eq!(schedule.max_fee_per_gas, gwei(200));
        assert_eq!(schedule.max_priority_fee_per_gas, gwei(50));
        assert!(schedule.max_cost <= opp.max_gas_budget);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_unprofitable() {
        let gas = manager(provider_with_fees(45, 10), StalePolicy::Reject);
        let opp = testing::opportunity("opp-3", testing::account(0), 500_000)
            .with_profit(parse_ether("0.01").unwrap(), parse_ether("1").unwrap());

        assert!(matches!(
            gas.evaluate(&opp, Urgency::Normal).await,
            Err(GasError::Unprofitable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_estimate_policy() {
        let provider = provider_with_fees(45, 10);
        let strict = manager(provider.clone(), StalePolicy::Reject);
        let lenient = manager(provider.clone(), StalePolicy::AllowWithBump { bump_percent: 20 });
        strict.oracle().refresh().await.unwrap();
        lenient.oracle().refresh().await.unwrap();

        tokio::time::advance(Duration::from_millis(6_000)).await;
        let opp = testing::opportunity("opp-4", testing::account(0), 500_000);

        assert!(matches!(
            strict.evaluate(&opp, Urgency::Normal).await,
            Err(GasError::StaleEstimate { .. })
        ));

        let schedule = lenient.evaluate(&opp, Urgency::Normal).await.unwrap();
        assert!(schedule.estimate.stale);
        assert_eq!(schedule.max_fee_per_gas, gwei(120));
        assert_eq!(schedule.max_priority_fee_per_gas, gwei(12));
    }
}
