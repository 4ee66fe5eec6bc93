//! Bundle execution service and diagnostics
//!
//! Usage:
//!   mev_executor init-config --output config/execution.toml
//!   mev_executor gas --config config/execution.toml
//!   mev_executor nonce --config config/execution.toml [--account 0xabc...]
//!   mev_executor submit --config config/execution.toml --file opportunities.json

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ethers::signers::LocalWallet;
use ethers::types::{Address, Bytes, U256};
use mev_execution::config::{ExecutionConfig, LoggingConfig};
use mev_execution::engine::{EngineComponents, ExecutionEngine};
use mev_execution::logging::{init_tracing, LogEmoji};
use mev_execution::provider::{ChainProvider, EthersChainProvider};
use mev_execution::signer::WalletSigner;
use mev_execution::types::{Opportunity, TargetCall, Urgency};
use mev_execution::{log_metrics, log_success, GasPriceOracle, NonceManager};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

/// Comma separated hex private keys of the sending accounts
const SIGNER_KEYS_ENV: &str = "MEV_SIGNER_KEYS";

#[derive(Parser, Debug)]
#[command(name = "mev_executor")]
#[command(about = "Torq MEV bundle execution engine")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable JSON logging format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default configuration file
    InitConfig {
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Sample fee history and print estimates for every urgency
    Gas {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Resync nonce ledgers against the chain (default: the configured accounts)
    Nonce {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        account: Option<Address>,
    },
    /// Execute opportunities from a JSON file and print the results
    Submit {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct CallInput {
    from: Address,
    to: Address,
    #[serde(default)]
    data: Bytes,
    /// Decimal wei
    #[serde(default)]
    value: Option<String>,
    gas_limit: u64,
}

#[derive(Debug, Deserialize)]
struct OpportunityInput {
    id: String,
    strategy_id: String,
    calls: Vec<CallInput>,
    /// Decimal wei
    expected_profit: String,
    /// Decimal wei
    max_gas_budget: String,
    target_block: u64,
    /// Relative to load time
    deadline_ms: u64,
}

impl OpportunityInput {
    fn into_opportunity(self, loaded_at: Instant) -> Result<Opportunity> {
        let mut opportunity = Opportunity::new(self.id, self.strategy_id)
            .with_profit(parse_wei(&self.expected_profit)?, parse_wei(&self.max_gas_budget)?)
            .with_deadline(
                self.target_block,
                loaded_at + Duration::from_millis(self.deadline_ms),
            );
        for call in self.calls {
            let value = match &call.value {
                Some(value) => parse_wei(value)?,
                None => U256::zero(),
            };
            opportunity = opportunity.with_call(TargetCall {
                from: call.from,
                to: call.to,
                data: call.data,
                value,
                gas_limit: call.gas_limit,
            });
        }
        Ok(opportunity)
    }
}

fn parse_wei(value: &str) -> Result<U256> {
    U256::from_dec_str(value.trim()).with_context(|| format!("invalid wei amount '{}'", value))
}

fn load_config(path: Option<&PathBuf>) -> Result<ExecutionConfig> {
    let mut config = match path {
        Some(path) => ExecutionConfig::from_file(path)?,
        None => ExecutionConfig::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn chain_provider(config: &ExecutionConfig) -> Result<Arc<dyn ChainProvider>> {
    let provider = EthersChainProvider::new(&config.provider.rpc_url, config.provider.request_timeout())
        .with_context(|| format!("Failed to create provider for {}", config.provider.rpc_url))?;
    Ok(Arc::new(provider))
}

fn signer_from_env(chain_id: u64) -> Result<WalletSigner> {
    let keys = std::env::var(SIGNER_KEYS_ENV)
        .with_context(|| format!("{} must list the sending account keys", SIGNER_KEYS_ENV))?;

    let mut signer = WalletSigner::new(chain_id);
    for key in keys.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        let wallet: LocalWallet = key.parse().context("invalid signer key")?;
        signer.add_wallet(wallet);
    }
    if signer.accounts().is_empty() {
        bail!("{} holds no keys", SIGNER_KEYS_ENV);
    }
    Ok(signer)
}

fn init_logging(args: &Args, mut logging: LoggingConfig) -> Result<()> {
    if let Some(level) = &args.log_level {
        logging.level = level.clone();
    }
    logging.json |= args.json_logs;
    init_tracing(&logging)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The template has no relays yet, so it is written without validation
    if let Command::InitConfig { output } = &args.command {
        init_logging(&args, LoggingConfig::default())?;
        ExecutionConfig::default().save_to_file(output)?;
        log_success!("Default configuration written to {}", output.display());
        return Ok(());
    }

    let config_path = match &args.command {
        Command::Gas { config } | Command::Nonce { config, .. } | Command::Submit { config, .. } => {
            config.clone()
        }
        Command::InitConfig { .. } => None,
    };
    let mut config = load_config(config_path.as_ref())?;
    init_logging(&args, config.logging.clone())?;

    match args.command {
        Command::InitConfig { .. } => {}
        Command::Gas { .. } => {
            let oracle = GasPriceOracle::new(chain_provider(&config)?, config.gas.clone());
            oracle.refresh().await.context("Fee history sampling failed")?;
            for urgency in Urgency::ALL {
                let estimate = oracle.get_estimate(urgency).await?;
                println!("{}", serde_json::to_string(&estimate)?);
            }
            info!("{} Sampled {} blocks", LogEmoji::GAS, oracle.window_len());
        }
        Command::Nonce { account, .. } => {
            let accounts = match account {
                Some(account) => vec![account],
                None => config.engine.accounts.clone(),
            };
            if accounts.is_empty() {
                bail!("no --account given and engine.accounts is empty");
            }
            let nonces = NonceManager::new(chain_provider(&config)?, config.nonce.clone());
            for account in accounts {
                let report = nonces.resync(account).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Command::Submit { file, .. } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let inputs: Vec<OpportunityInput> = serde_json::from_str(&contents)
                .with_context(|| format!("Invalid opportunity file {}", file.display()))?;

            let provider = chain_provider(&config)?;
            let signer = Arc::new(signer_from_env(config.provider.chain_id)?);
            if config.engine.accounts.is_empty() {
                config.engine.accounts = signer.accounts();
            }
            let components = EngineComponents::from_config(&config, provider, signer)?;
            if components.relays.is_empty() {
                bail!("no relays configured");
            }
            let engine = ExecutionEngine::new(components, config.engine.clone());
            let synced = engine.sync_accounts().await;
            info!(
                "{} Nonce ledgers ready for {}/{} accounts",
                LogEmoji::NONCE,
                synced.iter().filter(|r| r.is_ok()).count(),
                synced.len()
            );
            let tasks = engine.spawn_background_tasks(
                config.gas.refresh_interval(),
                config.nonce.maintenance_interval(),
            );

            let loaded_at = Instant::now();
            let opportunities = inputs
                .into_iter()
                .map(|input| input.into_opportunity(loaded_at))
                .collect::<Result<Vec<_>>>()?;
            info!("{} Executing {} opportunities", LogEmoji::EXECUTE, opportunities.len());

            for result in engine.submit_batch(opportunities).await {
                if let Some(detail) = &result.detail {
                    if !result.is_included() {
                        error!(opportunity_id = %result.opportunity_id, "{}", detail);
                    }
                }
                println!("{}", serde_json::to_string(&result)?);
            }

            let stats = engine.stats();
            log_metrics!(
                "included {}/{}, failed {}, expired {}, aborted {} (profit {} ETH)",
                stats.included,
                stats.submitted,
                stats.failed,
                stats.expired,
                stats.aborted,
                stats.profit_captured_eth
            );
            for task in tasks {
                task.abort();
            }
        }
    }

    Ok(())
}
