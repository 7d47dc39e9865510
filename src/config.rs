//! Configuration management
//!
//! Loads and saves the TOML file shared by every subcommand.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::allocation::DustPolicy;
use crate::esplora::EsploraClient;
use crate::fee::{FeeTier, FALLBACK_FEE_RATE};
use crate::http::RetryPolicy;
use crate::psbt::SelectionConfig;

/// Network type for Bitcoin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }

    pub fn to_bitcoin_network(&self) -> bdk_wallet::bitcoin::Network {
        match self {
            Network::Mainnet => bdk_wallet::bitcoin::Network::Bitcoin,
            Network::Testnet => bdk_wallet::bitcoin::Network::Testnet,
            Network::Signet => bdk_wallet::bitcoin::Network::Signet,
            Network::Regtest => bdk_wallet::bitcoin::Network::Regtest,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mainnet" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(anyhow::anyhow!("Invalid network: {}", s)),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bitcoin network to use
    pub network: Network,

    /// Esplora-compatible API base URL. Defaults to mempool.space for the network.
    #[serde(default)]
    pub esplora_url: Option<String>,

    #[serde(default)]
    pub fee_tier: FeeTier,

    /// Seconds to wait for the fee service before falling back
    #[serde(default = "default_fee_timeout_secs")]
    pub fee_timeout_secs: u64,

    /// sat/vB used when the fee service is unavailable
    #[serde(default = "default_fallback_fee_rate")]
    pub fallback_fee_rate: f64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default = "default_min_utxo_value")]
    pub min_utxo_value: u64,

    /// Only spend confirmed outputs. Confirmed outputs are preferred either way.
    #[serde(default)]
    pub require_confirmed: bool,

    #[serde(default)]
    pub dust_policy: DustPolicy,

    /// SQLite database for broadcast attempts and payout records
    #[serde(default = "default_audit_db")]
    pub audit_db: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Signet,
            esplora_url: None,
            fee_tier: FeeTier::default(),
            fee_timeout_secs: default_fee_timeout_secs(),
            fallback_fee_rate: default_fallback_fee_rate(),
            retry: RetryPolicy::default(),
            min_utxo_value: default_min_utxo_value(),
            require_confirmed: false,
            dust_policy: DustPolicy::default(),
            audit_db: default_audit_db(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path()?)
    }

    /// Load configuration from `config_path`, writing a default file there if it doesn't exist
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

            tracing::info!("📝 Loaded config from: {}", config_path.display());
            Ok(config)
        } else {
            tracing::info!("📝 No config file found, creating default at: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(config_path, contents)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        tracing::info!("💾 Saved config to: {}", config_path.display());
        Ok(())
    }

    /// The configured esplora URL, or the public default for the network
    pub fn esplora_url(&self) -> String {
        self.esplora_url
            .clone()
            .unwrap_or_else(|| EsploraClient::default_url(self.network.to_bitcoin_network()).to_string())
    }

    pub fn fee_timeout(&self) -> Duration {
        Duration::from_secs(self.fee_timeout_secs)
    }

    pub fn selection(&self) -> SelectionConfig {
        SelectionConfig {
            min_utxo_value: self.min_utxo_value,
            require_confirmed: self.require_confirmed,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry.max_attempts must be at least 1"));
        }

        if !(self.fallback_fee_rate.is_finite() && self.fallback_fee_rate > 0.0) {
            return Err(anyhow::anyhow!(
                "fallback_fee_rate must be positive, got: {}",
                self.fallback_fee_rate
            ));
        }

        if self.fee_timeout_secs == 0 {
            return Err(anyhow::anyhow!("fee_timeout_secs must be at least 1"));
        }

        if let Some(ref url) = self.esplora_url {
            let rest = url
                .strip_prefix("https://")
                .or_else(|| url.strip_prefix("http://"))
                .ok_or_else(|| anyhow::anyhow!("esplora_url must start with http:// or https://, got: {}", url))?;
            if rest.is_empty() || rest.starts_with('/') {
                return Err(anyhow::anyhow!("esplora_url has no host: {}", url));
            }
        }

        if let DustPolicy::Uniform { limit } = self.dust_policy {
            if limit == 0 {
                return Err(anyhow::anyhow!("dust_policy limit must be positive"));
            }
        }

        Ok(())
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "payout-psbt")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

fn default_audit_db() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| home_dir().join(".payout-psbt"))
        .join("audit.db")
}

fn default_fee_timeout_secs() -> u64 {
    5
}

fn default_fallback_fee_rate() -> f64 {
    FALLBACK_FEE_RATE
}

fn default_min_utxo_value() -> u64 {
    SelectionConfig::default().min_utxo_value
}

/// Get the configuration file path
fn config_file_path() -> Result<PathBuf> {
    let config_dir = project_dirs()
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| home_dir().join(".config").join("payout-psbt"));

    Ok(config_dir.join("config.toml"))
}

/// Get the config file path for display purposes
pub fn get_config_path() -> Result<PathBuf> {
    config_file_path()
}
