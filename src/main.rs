use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bdk_wallet::bitcoin::Amount;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use payout_psbt::allocation::{allocate_over, eligible_recipients, parse_address, RecipientProfile};
use payout_psbt::audit::{AuditSink, SqliteAuditStore};
use payout_psbt::config::{get_config_path, Config, Network};
use payout_psbt::ecc;
use payout_psbt::esplora::EsploraClient;
use payout_psbt::fee::{FeeEstimator, FeeTier};
use payout_psbt::keys::{KeySource, ScriptType};
use payout_psbt::psbt::{psbt_from_base64, KeySigner};
use payout_psbt::{PayoutRequest, PayoutService, RunOutcome, RunReport};

/// Build, sign and broadcast Bitcoin payout transactions
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured network (mainnet, testnet, signet, regtest)
    #[arg(short, long, global = true)]
    network: Option<Network>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct KeyArgs {
    /// Mnemonic, WIF or 64-char hex private key
    #[arg(long, env = "PAYOUT_SIGNING_KEY", hide_env_values = true)]
    key: String,

    /// BIP39 passphrase
    #[arg(long, env = "PAYOUT_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Show the funding address for each script type
    Derive {
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Fetch the current fee rate
    Fee {
        #[arg(long)]
        tier: Option<FeeTier>,
    },
    /// Compute a payout allocation without building a transaction
    Allocate {
        /// Pool size in sats
        #[arg(long)]
        pool: u64,
        /// JSON file with recipient profiles
        #[arg(long)]
        recipients: PathBuf,
        /// Weight basis, e.g. total supply (defaults to the sum of weights)
        #[arg(long)]
        basis: Option<u64>,
    },
    /// Pay a pool out to recipients in one transaction
    Payout {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(long, default_value = "p2wpkh")]
        script_type: ScriptType,
        #[arg(long)]
        pool: u64,
        #[arg(long)]
        recipients: PathBuf,
        #[arg(long)]
        basis: Option<u64>,
        /// Actually broadcast. Without this the transaction is only built.
        #[arg(long)]
        broadcast: bool,
    },
    /// Send an amount to a single address
    Send {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(long, default_value = "p2wpkh")]
        script_type: ScriptType,
        #[arg(long)]
        to: String,
        /// Amount in sats
        #[arg(long)]
        amount: u64,
        #[arg(long)]
        broadcast: bool,
    },
    /// Finalize a signed base64 PSBT (inline or a file path)
    Finalize {
        psbt: String,
        #[arg(long)]
        broadcast: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => get_config_path()?,
    };
    let mut config = Config::load_from(&config_path)?;
    if let Some(network) = args.network {
        config.network = network;
    }
    config.validate().context("Invalid configuration")?;

    let network = config.network.to_bitcoin_network();
    let secp = ecc::init();

    match args.command {
        Command::Derive { key } => {
            let source = KeySource::detect(&key.key, key.passphrase.as_deref());
            for wallet in source.derive_all(secp, network)? {
                let path = wallet
                    .derivation_path()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<14} {:<22} {}", wallet.script_type().as_str(), path, wallet.address());
            }
        }
        Command::Fee { tier } => {
            let client = Arc::new(esplora_client(&config)?);
            let estimator = FeeEstimator::new(client, config.fee_timeout(), config.fallback_fee_rate);
            let estimate = estimator.estimate(tier.unwrap_or(config.fee_tier)).await;
            println!(
                "{} sat/vB ({} tier, from {})",
                estimate.rate_sat_vb, estimate.tier, estimate.source
            );
        }
        Command::Allocate {
            pool,
            recipients,
            basis,
        } => {
            let recipients = eligible_recipients(&load_profiles(&recipients)?, network);
            let plan = allocate_over(Amount::from_sat(pool), &recipients, basis, &config.dust_policy)?;
            for payout in &plan.payouts {
                println!(
                    "{:<24} {:>12} sats  {}",
                    payout.recipient_key,
                    payout.amount.to_sat(),
                    payout.destination
                );
            }
            if !plan.dropped.is_empty() {
                println!("below dust: {}", plan.dropped.join(", "));
            }
            println!("total {} sats, remainder {} sats", plan.total().to_sat(), plan.remainder);
        }
        Command::Payout {
            key,
            script_type,
            pool,
            recipients,
            basis,
            broadcast,
        } => {
            // keys and recipients are checked before anything touches the network
            let wallet = KeySource::detect(&key.key, key.passphrase.as_deref())
                .signing_wallet(secp, script_type, network)?;
            let recipients = eligible_recipients(&load_profiles(&recipients)?, network);
            let service = build_service(&config, broadcast)?;

            let report = service
                .run_payout(
                    &KeySigner::new(secp, wallet),
                    PayoutRequest {
                        pool: Amount::from_sat(pool),
                        recipients,
                        basis,
                        dry_run: !broadcast,
                    },
                )
                .await?;
            print_report(&report)?;
        }
        Command::Send {
            key,
            script_type,
            to,
            amount,
            broadcast,
        } => {
            let wallet = KeySource::detect(&key.key, key.passphrase.as_deref())
                .signing_wallet(secp, script_type, network)?;
            let destination = parse_address(&to, network)?;
            let service = build_service(&config, broadcast)?;

            let report = service
                .send(
                    &KeySigner::new(secp, wallet),
                    destination,
                    Amount::from_sat(amount),
                    !broadcast,
                )
                .await?;
            print_report(&report)?;
        }
        Command::Finalize { psbt, broadcast } => {
            let encoded = if Path::new(&psbt).is_file() {
                std::fs::read_to_string(&psbt).with_context(|| format!("Failed to read PSBT file: {}", psbt))?
            } else {
                psbt
            };
            let psbt = psbt_from_base64(encoded.trim())?;
            let service = build_service(&config, broadcast)?;

            let report = service.finalize_and_publish(psbt, !broadcast).await?;
            print_report(&report)?;
        }
    }

    Ok(())
}

fn esplora_client(config: &Config) -> Result<EsploraClient> {
    let url = config.esplora_url();
    EsploraClient::new(&url, Duration::from_secs(30), config.retry.clone())
        .with_context(|| format!("Failed to create esplora client for {}", url))
}

fn build_service(config: &Config, broadcast: bool) -> Result<PayoutService> {
    let client = Arc::new(esplora_client(config)?);
    let fees = FeeEstimator::new(client.clone(), config.fee_timeout(), config.fallback_fee_rate);

    // dry runs never record anything, so they don't need the database
    let audit: Arc<dyn AuditSink> = if broadcast {
        Arc::new(
            SqliteAuditStore::open(&config.audit_db)
                .with_context(|| format!("Failed to open audit database: {}", config.audit_db.display()))?,
        )
    } else {
        Arc::new(SqliteAuditStore::in_memory()?)
    };

    Ok(PayoutService::new(
        ecc::init(),
        config.network.to_bitcoin_network(),
        client.clone(),
        fees,
        client,
        audit,
    )
    .with_selection(config.selection())
    .with_dust_policy(config.dust_policy)
    .with_fee_tier(config.fee_tier))
}

fn load_profiles(path: &Path) -> Result<Vec<RecipientProfile>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read recipients file: {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse recipients file: {}", path.display()))
}

fn print_report(report: &RunReport) -> Result<()> {
    for output in &report.outputs {
        println!(
            "output {:>2}: {:>12} sats  {:?}",
            output.index,
            output.amount.to_sat(),
            output.kind
        );
    }
    println!("fee {} sats, change {} sats", report.fee.to_sat(), report.change.to_sat());
    if let Some(estimate) = &report.fee_estimate {
        println!("fee rate {} sat/vB from {}", estimate.rate_sat_vb, estimate.source);
    }

    match &report.outcome {
        RunOutcome::Built { tx } => {
            println!("dry run, not broadcast: {}", tx.txid);
            println!("{}", tx.raw_hex);
        }
        RunOutcome::Broadcast { txid, audit_error, .. } => {
            println!("broadcast: {}", txid);
            if let Some(error) = audit_error {
                eprintln!("warning: transaction is out but was not recorded: {}", error);
            }
        }
        RunOutcome::Unknown { txid, raw_hex, error } => {
            println!("{}", raw_hex);
            anyhow::bail!(
                "broadcast of {} failed, status unknown ({}); raw transaction printed above",
                txid,
                error.message
            );
        }
    }
    Ok(())
}
