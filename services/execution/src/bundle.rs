//! Bundle construction for MEV transactions

use crate::gas::FeeSchedule;
use crate::nonce::NonceReservation;
use crate::types::Opportunity;
use ethers::types::{Address, Bytes, H256, U256, U64};
use ethers::utils::keccak256;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Unsigned transaction within a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleTransaction {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    pub nonce: u64,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Bundle of transactions for atomic execution
#[derive(Debug, Clone, Serialize)]
pub struct Bundle {
    pub transactions: Vec<BundleTransaction>,
    pub target_block: u64,
    pub max_timestamp: Option<u64>,
    pub min_timestamp: Option<u64>,
    pub reverting_hashes: Vec<H256>,
    pub metadata: HashMap<String, String>,
}

/// Builder for constructing MEV bundles
pub struct BundleBuilder {
    bundle: Bundle,
}

impl BundleBuilder {
    pub fn new(target_block: u64) -> Self {
        Self {
            bundle: Bundle {
                transactions: Vec::new(),
                target_block,
                max_timestamp: None,
                min_timestamp: None,
                reverting_hashes: Vec::new(),
                metadata: HashMap::new(),
            },
        }
    }

    /// One transaction per call, nonces taken in order from the reservations
    /// of each call's sender, fee caps from the schedule.
    pub fn for_opportunity(
        opportunity: &Opportunity,
        reservations: &[NonceReservation],
        fees: &FeeSchedule,
    ) -> Result<Self, String> {
        let mut per_account: HashMap<Address, std::vec::IntoIter<u64>> = HashMap::new();
        for account in &opportunity.accounts {
            let mut nonces: Vec<u64> = reservations
                .iter()
                .filter(|r| r.account == *account)
                .map(|r| r.nonce)
                .collect();
            nonces.sort_unstable();
            per_account.insert(*account, nonces.into_iter());
        }

        let mut builder = Self::new(opportunity.target_block)
            .add_metadata("opportunity_id", &opportunity.id)
            .add_metadata("strategy_id", &opportunity.strategy_id);

        for (index, call) in opportunity.calls.iter().enumerate() {
            let nonce = per_account
                .get_mut(&call.from)
                .and_then(|nonces| nonces.next())
                .ok_or_else(|| format!("no reserved nonce left for call {}", index))?;

            builder = builder.add_transaction(BundleTransaction {
                from: call.from,
                to: call.to,
                data: call.data.clone(),
                value: call.value,
                gas_limit: call.gas_limit,
                nonce,
                max_fee_per_gas: fees.max_fee_per_gas,
                max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            });
        }
        Ok(builder)
    }

    pub fn add_transaction(mut self, tx: BundleTransaction) -> Self {
        self.bundle.transactions.push(tx);
        self
    }

    pub fn set_timestamp_range(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.bundle.min_timestamp = min;
        self.bundle.max_timestamp = max;
        self
    }

    pub fn allow_reverting(mut self, tx_hash: H256) -> Self {
        self.bundle.reverting_hashes.push(tx_hash);
        self
    }

    pub fn add_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.bundle.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Bundle {
        self.bundle
    }
}

impl Bundle {
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn estimate_gas(&self) -> u64 {
        self.transactions.iter().map(|tx| tx.gas_limit).sum()
    }

    pub fn opportunity_id(&self) -> Option<&str> {
        self.metadata.get("opportunity_id").map(String::as_str)
    }
}

/// Bundle with every transaction signed and RLP-encoded
#[derive(Debug, Clone, Serialize)]
pub struct SignedBundle {
    pub bundle: Bundle,
    pub raw_transactions: Vec<Bytes>,
    pub tx_hashes: Vec<H256>,
    /// keccak256 over the concatenated transaction hashes
    pub bundle_hash: H256,
}

impl SignedBundle {
    pub fn new(bundle: Bundle, raw_transactions: Vec<Bytes>) -> Self {
        let tx_hashes: Vec<H256> = raw_transactions
            .iter()
            .map(|raw| H256::from(keccak256(raw)))
            .collect();
        let concatenated: Vec<u8> = tx_hashes.iter().flat_map(|h| h.as_bytes().to_vec()).collect();
        let bundle_hash = H256::from(keccak256(concatenated));
        Self {
            bundle,
            raw_transactions,
            tx_hashes,
            bundle_hash,
        }
    }

    pub fn target_block(&self) -> u64 {
        self.bundle.target_block
    }

    /// `eth_sendBundle` params object
    pub fn send_bundle_params(&self) -> Value {
        let mut params = json!({
            "txs": self.raw_transactions,
            "blockNumber": U64::from(self.bundle.target_block),
        });
        if let Some(min) = self.bundle.min_timestamp {
            params["minTimestamp"] = json!(min);
        }
        if let Some(max) = self.bundle.max_timestamp {
            params["maxTimestamp"] = json!(max);
        }
        if !self.bundle.reverting_hashes.is_empty() {
            params["revertingTxHashes"] = json!(self.bundle.reverting_hashes);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::{ReservationId, ReservationStatus};
    use crate::testing;
    use std::time::Duration;
    use tokio::time::Instant;

    fn reservation(account: Address, nonce: u64) -> NonceReservation {
        NonceReservation {
            id: ReservationId(nonce),
            account,
            nonce,
            status: ReservationStatus::Reserved,
            created_at: Instant::now(),
            ttl: Duration::from_secs(30),
            tx_hash: None,
        }
    }

    #[test]
    fn test_for_opportunity_assigns_nonces_in_call_order() {
        let a = testing::account(0);
        let opp = testing::opportunity("opp-1", a, 100_000)
            .with_call(testing::call(a, 50_000));
        let fees = testing::fee_schedule(150_000);

        let bundle = BundleBuilder::for_opportunity(
            &opp,
            &[reservation(a, 8), reservation(a, 7)],
            &fees,
        )
        .unwrap()
        .build();

        let nonces: Vec<u64> = bundle.transactions.iter().map(|t| t.nonce).collect();
        assert_eq!(nonces, vec![7, 8]);
        assert_eq!(bundle.estimate_gas(), 150_000);
        assert_eq!(bundle.opportunity_id(), Some("opp-1"));
    }

    #[test]
    fn test_for_opportunity_needs_a_nonce_per_call() {
        let a = testing::account(0);
        let opp = testing::opportunity("opp-2", a, 100_000).with_call(testing::call(a, 1));
        let fees = testing::fee_schedule(100_001);

        assert!(BundleBuilder::for_opportunity(&opp, &[reservation(a, 1)], &fees).is_err());
    }

    #[test]
    fn test_send_bundle_params_shape() {
        let bundle = BundleBuilder::new(0x10)
            .set_timestamp_range(Some(1), None)
            .allow_reverting(H256::repeat_byte(3))
            .build();
        let signed = SignedBundle::new(bundle, vec![Bytes::from(vec![0xde, 0xad])]);

        let params = signed.send_bundle_params();
        assert_eq!(params["txs"][0], "0xdead");
        assert_eq!(params["blockNumber"], "0x10");
        assert_eq!(params["minTimestamp"], 1);
        assert!(params.get("maxTimestamp").is_none());
        assert_eq!(params["revertingTxHashes"].as_array().unwrap().len(), 1);
        assert_eq!(signed.tx_hashes[0], H256::from(keccak256([0xdeu8, 0xad])));
    }
}
