//! Test doubles and fixtures
//!
//! Exposed publicly so integration tests and dry-run tooling can build an
//! engine without a node or live relays.

use crate::bundle::{BundleBuilder, BundleTransaction, SignedBundle};
use crate::config::{EngineConfig, ExecutionConfig};
use crate::engine::{EngineComponents, ExecutionEngine};
use crate::error::ProviderError;
use crate::gas::{FeeSchedule, GasEstimate, GasManager, GasPriceOracle};
use crate::nonce::NonceManager;
use crate::provider::{BlockFeeSample, ChainProvider, FeeHistory};
use crate::relay::{RelayBackend, ScriptedRelay};
use crate::signer::{BundleSigner, WalletSigner};
use crate::submitter::BundleSubmitter;
use crate::types::{gwei, Opportunity, TargetCall, Urgency};
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::parse_ether;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const TEST_CHAIN_ID: u64 = 1;

/// In-memory chain
#[derive(Debug, Default)]
pub struct MockChainProvider {
    nonces: Mutex<HashMap<Address, u64>>,
    fee_history: Mutex<Option<FeeHistory>>,
    block_number: Mutex<u64>,
    included: Mutex<HashMap<H256, u64>>,
    failing_nonce_accounts: Mutex<HashSet<Address>>,
    forced_error: Mutex<Option<ProviderError>>,
    offline: AtomicBool,
    nonce_calls: AtomicU32,
    fee_calls: AtomicU32,
}

impl MockChainProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_nonce(&self, account: Address, nonce: u64) {
        self.nonces.lock().insert(account, nonce);
    }

    pub fn set_fee_history(&self, samples: Vec<BlockFeeSample>, next_base_fee: U256) {
        if let Some(last) = samples.last() {
            let mut block = self.block_number.lock();
            *block = (*block).max(last.block_number);
        }
        *self.fee_history.lock() = Some(FeeHistory {
            samples,
            next_base_fee,
        });
    }

    /// Every call fails with a transport error while offline
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every call fails with `error` from now on
    pub fn fail_with(&self, error: ProviderError) {
        *self.forced_error.lock() = Some(error);
    }

    /// Nonce lookups for `account` fail with a transport error
    pub fn fail_nonce_for(&self, account: Address) {
        self.failing_nonce_accounts.lock().insert(account);
    }

    pub fn set_block_number(&self, block_number: u64) {
        *self.block_number.lock() = block_number;
    }

    pub fn include_transaction(&self, tx_hash: H256, block_number: u64) {
        self.included.lock().insert(tx_hash, block_number);
    }

    pub fn nonce_calls(&self) -> u32 {
        self.nonce_calls.load(Ordering::SeqCst)
    }

    pub fn fee_calls(&self) -> u32 {
        self.fee_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), ProviderError> {
        if let Some(error) = self.forced_error.lock().clone() {
            return Err(error);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::transport("mock provider offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainProvider for MockChainProvider {
    async fn confirmed_nonce(&self, account: Address) -> Result<u64, ProviderError> {
        self.nonce_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if self.failing_nonce_accounts.lock().contains(&account) {
            return Err(ProviderError::transport("nonce lookup refused"));
        }
        Ok(self.nonces.lock().get(&account).copied().unwrap_or(0))
    }

    async fn fee_history(&self, block_count: u64) -> Result<FeeHistory, ProviderError> {
        self.fee_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let history = self
            .fee_history
            .lock()
            .clone()
            .ok_or_else(|| ProviderError::invalid_response("no fee history configured"))?;

        let keep = (block_count as usize).min(history.samples.len());
        let skip = history.samples.len() - keep;
        Ok(FeeHistory {
            samples: history.samples[skip..].to_vec(),
            next_base_fee: history.next_base_fee,
        })
    }

    async fn block_number(&self) -> Result<u64, ProviderError> {
        self.check_available()?;
        Ok(*self.block_number.lock())
    }

    async fn transaction_block(&self, tx_hash: H256) -> Result<Option<u64>, ProviderError> {
        self.check_available()?;
        Ok(self.included.lock().get(&tx_hash).copied())
    }
}

/// Deterministic wallet `i`
pub fn wallet(i: u64) -> LocalWallet {
    let key = H256::from_low_u64_be(i + 1);
    match LocalWallet::from_bytes(key.as_bytes()) {
        Ok(wallet) => wallet.with_chain_id(TEST_CHAIN_ID),
        Err(e) => panic!("fixture key {} is invalid: {}", i, e),
    }
}

pub fn account(i: u64) -> Address {
    wallet(i).address()
}

pub fn call(from: Address, gas_limit: u64) -> TargetCall {
    TargetCall {
        from,
        to: Address::repeat_byte(0xee),
        data: Bytes::from(vec![0x12, 0x34, 0x56, 0x78]),
        value: U256::zero(),
        gas_limit,
    }
}

/// 0.5 ETH expected profit, 0.2 ETH gas budget, 12s deadline
pub fn opportunity(id: &str, from: Address, gas_limit: u64) -> Opportunity {
    let profit = parse_ether("0.5").unwrap_or_default();
    let budget = parse_ether("0.2").unwrap_or_default();
    Opportunity::new(id, "test-strategy")
        .with_call(call(from, gas_limit))
        .with_profit(profit, budget)
        .with_deadline(101, Instant::now() + Duration::from_secs(12))
}

/// 45 gwei base, 10 gwei tip, doubled base headroom
pub fn fee_schedule(gas_limit: u64) -> FeeSchedule {
    let max_fee = gwei(100);
    FeeSchedule {
        gas_limit,
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: gwei(10),
        max_cost: max_fee * U256::from(gas_limit),
        price_ceiling: gwei(400),
        estimate: GasEstimate {
            urgency: Urgency::Normal,
            base_fee: gwei(45),
            priority_fee: gwei(10),
            max_fee_per_gas: max_fee,
            sampled_block: 100,
            sample_timestamp: Instant::now(),
            stale: false,
        },
    }
}

/// One signed transfer targeting `target_block`. The nonce follows the
/// block so bundles for different blocks hash differently.
pub fn signed_bundle(target_block: u64) -> SignedBundle {
    let from = account(0);
    let fees = fee_schedule(21_000);
    let bundle = BundleBuilder::new(target_block)
        .add_transaction(BundleTransaction {
            from,
            to: account(1),
            data: Bytes::new(),
            value: U256::from(1u64),
            gas_limit: 21_000,
            nonce: target_block,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
        })
        .build();

    match WalletSigner::new(TEST_CHAIN_ID)
        .with_wallet(wallet(0))
        .sign_bundle(bundle)
    {
        Ok(signed) => signed,
        Err(e) => panic!("fixture bundle failed to sign: {}", e),
    }
}

/// Fee history with one sample per block at fixed base fee and tip
pub fn fee_samples(first_block: u64, blocks: u64, base_gwei: u64, tip_gwei: u64) -> Vec<BlockFeeSample> {
    (first_block..first_block + blocks)
        .map(|block_number| BlockFeeSample {
            block_number,
            base_fee_per_gas: gwei(base_gwei),
            priority_fee_per_gas: gwei(tip_gwei),
        })
        .collect()
}

/// Local HTTP endpoint that answers every JSON-RPC POST with a fixed `result`
pub struct JsonRpcStub {
    pub url: String,
    requests: Arc<AtomicU32>,
    server: JoinHandle<()>,
}

impl JsonRpcStub {
    pub async fn serve(result: serde_json::Value) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}", listener.local_addr()?);
        let requests = Arc::new(AtomicU32::new(0));
        let body = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "result": result }).to_string();

        let counter = Arc::clone(&requests);
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                let body = body.clone();
                tokio::spawn(async move {
                    if answer_json_rpc(stream, &body).await.is_ok() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        Ok(Self {
            url,
            requests,
            server,
        })
    }

    /// Requests answered so far
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for JsonRpcStub {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn answer_json_rpc(mut stream: TcpStream, body: &str) -> std::io::Result<()> {
    let mut request = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..read]);

        let Some(header_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if request.len() >= header_end + 4 + content_length {
            break;
        }
    }

    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Engine over a mock chain with accounts 0-3 at nonce 42
pub struct TestHarness {
    pub provider: Arc<MockChainProvider>,
    pub engine: ExecutionEngine,
}

impl TestHarness {
    pub fn new(relays: &[ScriptedRelay]) -> Self {
        Self::with_config(relays, ExecutionConfig::default())
    }

    pub fn with_config(relays: &[ScriptedRelay], config: ExecutionConfig) -> Self {
        let provider = Arc::new(MockChainProvider::new());
        provider.set_fee_history(fee_samples(91, 10, 45, 10), gwei(45));

        let mut signer = WalletSigner::new(TEST_CHAIN_ID);
        for i in 0..4 {
            provider.set_nonce(account(i), 42);
            signer.add_wallet(wallet(i));
        }

        let chain: Arc<dyn ChainProvider> = provider.clone();
        let oracle = Arc::new(GasPriceOracle::new(Arc::clone(&chain), config.gas.clone()));
        let components = EngineComponents {
            gas: Arc::new(GasManager::new(oracle)),
            nonces: Arc::new(NonceManager::new(chain, config.nonce.clone())),
            submitter: Arc::new(BundleSubmitter::new(config.submitter.clone())),
            signer: Arc::new(signer),
            relays: relays
                .iter()
                .cloned()
                .map(|relay| Arc::new(RelayBackend::from(relay)))
                .collect(),
        };
        let engine_config = EngineConfig {
            accounts: (0..4).map(account).collect(),
            ..config.engine
        };

        Self {
            provider,
            engine: ExecutionEngine::new(components, engine_config),
        }
    }
}
