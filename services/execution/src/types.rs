//! Opportunity model consumed by the execution engine

use ethers::types::{Address, Bytes, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Wei per gwei
pub const GWEI: u64 = 1_000_000_000;

/// How hard to bid for inclusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    Aggressive,
}

impl Urgency {
    pub const ALL: [Urgency; 3] = [Urgency::Low, Urgency::Normal, Urgency::Aggressive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Urgency::Low),
            "normal" => Ok(Urgency::Normal),
            "aggressive" | "high" => Ok(Urgency::Aggressive),
            other => Err(format!("unknown urgency '{}'", other)),
        }
    }
}

/// One on-chain call the opportunity needs executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCall {
    /// Sending account (must be listed in the opportunity's accounts)
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: u64,
}

/// A detected opportunity handed over by the strategy layer.
///
/// The engine takes it by value, so it cannot change once submitted.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub id: String,
    pub strategy_id: String,
    /// Calls in bundle order
    pub calls: Vec<TargetCall>,
    /// Expected profit in wei before gas
    pub expected_profit: U256,
    /// Hard cap on total gas spend in wei
    pub max_gas_budget: U256,
    /// Block the bundle targets
    pub target_block: u64,
    /// Wall-clock point after which the opportunity is worthless
    pub deadline: Instant,
    /// Accounts whose nonces the bundle consumes
    pub accounts: Vec<Address>,
}

impl Opportunity {
    pub fn new(id: impl Into<String>, strategy_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            strategy_id: strategy_id.into(),
            calls: Vec::new(),
            expected_profit: U256::zero(),
            max_gas_budget: U256::zero(),
            target_block: 0,
            deadline: Instant::now(),
            accounts: Vec::new(),
        }
    }

    pub fn with_call(mut self, call: TargetCall) -> Self {
        if !self.accounts.contains(&call.from) {
            self.accounts.push(call.from);
        }
        self.calls.push(call);
        self
    }

    pub fn with_profit(mut self, expected_profit: U256, max_gas_budget: U256) -> Self {
        self.expected_profit = expected_profit;
        self.max_gas_budget = max_gas_budget;
        self
    }

    pub fn with_deadline(mut self, target_block: u64, deadline: Instant) -> Self {
        self.target_block = target_block;
        self.deadline = deadline;
        self
    }

    pub fn total_gas_limit(&self) -> u64 {
        self.calls
            .iter()
            .fold(0u64, |acc, call| acc.saturating_add(call.gas_limit))
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Structural checks the engine runs before any gas or nonce work
    pub fn validate(&self) -> Result<(), String> {
        if self.calls.is_empty() {
            return Err("opportunity has no target calls".to_string());
        }
        if self.accounts.is_empty() {
            return Err("opportunity lists no accounts".to_string());
        }
        let accounts: HashSet<&Address> = self.accounts.iter().collect();
        if accounts.len() != self.accounts.len() {
            return Err("opportunity lists an account twice".to_string());
        }
        for (index, call) in self.calls.iter().enumerate() {
            if call.gas_limit == 0 {
                return Err(format!("call {} has zero gas limit", index));
            }
            if !accounts.contains(&call.from) {
                return Err(format!(
                    "call {} sender {:?} is not an involved account",
                    index, call.from
                ));
            }
        }
        Ok(())
    }
}

pub fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::from(GWEI)
}

/// Wei to ETH for reporting. Saturates above the decimal range.
pub fn wei_to_eth(wei: U256) -> Decimal {
    if wei.bits() > 96 {
        return Decimal::MAX;
    }
    Decimal::from_i128_with_scale(wei.low_u128() as i128, 18).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn call(from: Address, gas_limit: u64) -> TargetCall {
        TargetCall {
            from,
            to: Address::repeat_byte(0xee),
            data: Bytes::from(vec![0x01, 0x02]),
            value: U256::zero(),
            gas_limit,
        }
    }

    #[test]
    fn test_with_call_tracks_accounts_once() {
        let a = Address::repeat_byte(0xaa);
        let opp = Opportunity::new("opp-1", "arb")
            .with_call(call(a, 100_000))
            .with_call(call(a, 50_000));

        assert_eq!(opp.accounts, vec![a]);
        assert_eq!(opp.total_gas_limit(), 150_000);
        assert!(opp.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_foreign_sender() {
        let mut opp = Opportunity::new("opp-2", "arb").with_call(call(Address::repeat_byte(1), 21_000));
        opp.accounts = vec![Address::repeat_byte(2)];

        let err = opp.validate().unwrap_err();
        assert!(err.contains("not an involved account"));
    }

    #[test]
    fn test_validate_rejects_zero_gas() {
        let opp = Opportunity::new("opp-3", "arb").with_call(call(Address::repeat_byte(1), 0));
        assert!(opp.validate().unwrap_err().contains("zero gas limit"));
    }

    #[test]
    fn test_wei_to_eth() {
        assert_eq!(wei_to_eth(ethers::utils::parse_ether("0.5").unwrap()), dec!(0.5));
        assert_eq!(wei_to_eth(gwei(1)), dec!(0.000000001));
        assert_eq!(wei_to_eth(U256::MAX), Decimal::MAX);
    }

    #[test]
    fn test_urgency_parse() {
        assert_eq!("AGGRESSIVE".parse::<Urgency>().unwrap(), Urgency::Aggressive);
        assert_eq!("low".parse::<Urgency>().unwrap(), Urgency::Low);
        assert!("panic".parse::<Urgency>().is_err());
    }
}
