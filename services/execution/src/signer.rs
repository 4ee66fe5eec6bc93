//! Transaction signing for bundles
//!
//! Key custody lives outside the engine; `WalletSigner` just holds the
//! `LocalWallet`s it was handed, one per sending account.

use crate::bundle::{Bundle, SignedBundle};
use crate::error::SignerError;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest};
use std::collections::HashMap;
use tracing::debug;

pub trait BundleSigner: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Sign every transaction in bundle order
    fn sign_bundle(&self, bundle: Bundle) -> Result<SignedBundle, SignerError>;
}

/// EIP-1559 signer over local wallets
pub struct WalletSigner {
    chain_id: u64,
    wallets: HashMap<Address, LocalWallet>,
}

impl WalletSigner {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            wallets: HashMap::new(),
        }
    }

    pub fn with_wallet(mut self, wallet: LocalWallet) -> Self {
        self.add_wallet(wallet);
        self
    }

    pub fn add_wallet(&mut self, wallet: LocalWallet) {
        let wallet = wallet.with_chain_id(self.chain_id);
        self.wallets.insert(wallet.address(), wallet);
    }

    pub fn accounts(&self) -> Vec<Address> {
        self.wallets.keys().copied().collect()
    }
}

impl BundleSigner for WalletSigner {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn sign_bundle(&self, bundle: Bundle) -> Result<SignedBundle, SignerError> {
        let mut raw_transactions = Vec::with_capacity(bundle.transactions.len());

        for tx in &bundle.transactions {
            let wallet = self
                .wallets
                .get(&tx.from)
                .ok_or(SignerError::MissingKey { account: tx.from })?;

            let request = Eip1559TransactionRequest::new()
                .from(tx.from)
                .to(tx.to)
                .data(tx.data.clone())
                .value(tx.value)
                .gas(tx.gas_limit)
                .nonce(tx.nonce)
                .max_fee_per_gas(tx.max_fee_per_gas)
                .max_priority_fee_per_gas(tx.max_priority_fee_per_gas)
                .chain_id(self.chain_id);
            let typed = TypedTransaction::Eip1559(request);

            let signature = wallet
                .sign_transaction_sync(&typed)
                .map_err(|e| SignerError::Signing {
                    account: tx.from,
                    message: e.to_string(),
                })?;
            raw_transactions.push(Bytes::from(typed.rlp_signed(&signature).to_vec()));
        }

        let signed = SignedBundle::new(bundle, raw_transactions);
        debug!(
            bundle_hash = ?signed.bundle_hash,
            txs = signed.raw_transactions.len(),
            "Bundle signed"
        );
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleBuilder, BundleTransaction};
    use crate::testing;
    use crate::types::gwei;
    use ethers::types::{Signature, U256};
    use ethers::utils::rlp::Rlp;

    fn transfer(from: Address, nonce: u64) -> BundleTransaction {
        BundleTransaction {
            from,
            to: Address::repeat_byte(0x42),
            data: Bytes::default(),
            value: U256::from(1u64),
            gas_limit: 21_000,
            nonce,
            max_fee_per_gas: gwei(100),
            max_priority_fee_per_gas: gwei(2),
        }
    }

    #[test]
    fn test_signs_and_recovers_sender() {
        let wallet = testing::wallet(0);
        let from = wallet.address();
        let signer = WalletSigner::new(1).with_wallet(wallet);

        let bundle = BundleBuilder::new(100)
            .add_transaction(transfer(from, 42))
            .build();
        let signed = signer.sign_bundle(bundle).unwrap();

        assert_eq!(signed.raw_transactions.len(), 1);
        let raw = &signed.raw_transactions[0];
        assert_eq!(raw[0], 0x02, "EIP-1559 envelope");

        let (decoded, signature): (TypedTransaction, Signature) =
            TypedTransaction::decode_signed(&Rlp::new(raw.as_ref())).unwrap();
        assert_eq!(decoded.nonce(), Some(&U256::from(42u64)));
        assert_eq!(signature.recover(decoded.sighash()).unwrap(), from);
    }

    #[test]
    fn test_missing_key_is_fatal_error() {
        let signer = WalletSigner::new(1).with_wallet(testing::wallet(0));
        let stranger = Address::repeat_byte(0x77);
        let bundle = BundleBuilder::new(1).add_transaction(transfer(stranger, 0)).build();

        assert_eq!(
            signer.sign_bundle(bundle).unwrap_err(),
            SignerError::MissingKey { account: stranger }
        );
    }

    #[test]
    fn test_distinct_nonces_give_distinct_hashes() {
        let wallet = testing::wallet(1);
        let from = wallet.address();
        let signer = WalletSigner::new(1).with_wallet(wallet);

        let bundle = BundleBuilder::new(1)
            .add_transaction(transfer(from, 0))
            .add_transaction(transfer(from, 1))
            .build();
        let signed = signer.sign_bundle(bundle).unwrap();

        assert_ne!(signed.tx_hashes[0], signed.tx_hashes[1]);
    }
}
