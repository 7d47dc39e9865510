//! Fee-rate lookup and transaction size estimation
//!
//! Fee rates come from a mempool.space style `fees/recommended` endpoint
//! behind the [`FeeRateSource`] trait. The lookup runs under a short timeout;
//! if it times out or fails for any reason the estimator falls back to a
//! fixed conservative rate (1 sat/vB by default) and reports that fact in
//! [`FeeEstimate::source`] and at `warn` level. The fallback keeps payouts
//! moving during an estimator outage; it is never reported as a remote rate.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{PayoutError, Result};
use crate::keys::ScriptType;

/// Rate used when the fee service cannot be reached.
pub const FALLBACK_FEE_RATE: f64 = 1.0;

/// Default lookup timeout.
pub const DEFAULT_FEE_TIMEOUT: Duration = Duration::from_secs(5);

/// Recommended rates in sat/vB, as served by `/api/v1/fees/recommended`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecommendedFees {
    #[serde(rename = "fastestFee")]
    pub fastest_fee: f64,
    #[serde(rename = "halfHourFee")]
    pub half_hour_fee: f64,
    #[serde(rename = "hourFee")]
    pub hour_fee: f64,
    #[serde(rename = "economyFee")]
    pub economy_fee: f64,
    #[serde(rename = "minimumFee", default)]
    pub minimum_fee: f64,
}

impl RecommendedFees {
    pub fn rate_for(&self, tier: FeeTier) -> f64 {
        match tier {
            FeeTier::Fastest => self.fastest_fee,
            FeeTier::HalfHour => self.half_hour_fee,
            FeeTier::Hour => self.hour_fee,
            FeeTier::Economy => self.economy_fee,
            FeeTier::Minimum => self.minimum_fee,
        }
    }
}

/// Which recommended rate to use. Batch payouts default to economy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeTier {
    Fastest,
    HalfHour,
    Hour,
    #[default]
    Economy,
    Minimum,
}

impl fmt::Display for FeeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeeTier::Fastest => "fastest",
            FeeTier::HalfHour => "half_hour",
            FeeTier::Hour => "hour",
            FeeTier::Economy => "economy",
            FeeTier::Minimum => "minimum",
        };
        f.write_str(name)
    }
}

impl FromStr for FeeTier {
    type Err = PayoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fastest" => Ok(FeeTier::Fastest),
            "half_hour" => Ok(FeeTier::HalfHour),
            "hour" => Ok(FeeTier::Hour),
            "economy" => Ok(FeeTier::Economy),
            "minimum" => Ok(FeeTier::Minimum),
            other => Err(PayoutError::InvalidInput(format!("unknown fee tier: {}", other))),
        }
    }
}

/// External fee-estimation endpoint.
#[async_trait]
pub trait FeeRateSource: Send + Sync {
    async fn recommended_fees(&self) -> Result<RecommendedFees>;

    /// Human readable name for logs.
    fn name(&self) -> &str {
        "fee service"
    }
}

/// Where a rate came from.
#[derive(Debug, Clone, PartialEq)]
pub enum FeeSource {
    Remote { provider: String },
    Fallback { reason: String },
}

impl FeeSource {
    pub fn is_fallback(&self) -> bool {
        matches!(self, FeeSource::Fallback { .. })
    }
}

impl fmt::Display for FeeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeeSource::Remote { provider } => write!(f, "{}", provider),
            FeeSource::Fallback { reason } => write!(f, "fallback ({})", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeeEstimate {
    pub rate_sat_vb: f64,
    pub tier: FeeTier,
    pub source: FeeSource,
    pub timestamp: Instant,
}

/// Fee estimator with timeout, fallback and a short-lived cache.
pub struct FeeEstimator {
    source: Arc<dyn FeeRateSource>,
    timeout: Duration,
    fallback_rate: f64,
    cache_ttl: Duration,
    cache: Arc<RwLock<Option<FeeEstimate>>>,
}

impl FeeEstimator {
    pub fn new(source: Arc<dyn FeeRateSource>, timeout: Duration, fallback_rate: f64) -> Self {
        Self {
            source,
            timeout,
            fallback_rate,
            cache_ttl: Duration::from_secs(60),
            cache: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Look up the rate for `tier`, falling back on timeout or failure.
    ///
    /// Never fails: the fallback is returned instead, tagged as such.
    pub async fn estimate(&self, tier: FeeTier) -> FeeEstimate {
        if let Some(cached) = self.get_cached_estimate(tier).await {
            tracing::debug!(
                "Using cached fee estimate: {:.2} sat/vB from {} (age: {}s)",
                cached.rate_sat_vb,
                cached.source,
                cached.timestamp.elapsed().as_secs()
            );
            return cached;
        }

        let lookup = tokio::time::timeout(self.timeout, self.source.recommended_fees()).await;
        let failure = match lookup {
            Ok(Ok(fees)) => {
                let rate = fees.rate_for(tier);
                if rate.is_finite() && rate > 0.0 {
                    tracing::info!(
                        "⛽ Fee estimate from {}: {:.2} sat/vB ({} tier)",
                        self.source.name(),
                        rate,
                        tier
                    );
                    let estimate = FeeEstimate {
                        rate_sat_vb: rate,
                        tier,
                        source: FeeSource::Remote {
                            provider: self.source.name().to_string(),
                        },
                        timestamp: Instant::now(),
                    };
                    *self.cache.write().await = Some(estimate.clone());
                    return estimate;
                }
                format!("{} returned unusable {} rate {}", self.source.name(), tier, rate)
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => PayoutError::NetworkTimeout(self.timeout).to_string(),
        };

        tracing::warn!(
            "⚠️  Fee lookup failed ({}); using fail-safe fallback of {:.2} sat/vB",
            failure,
            self.fallback_rate
        );
        FeeEstimate {
            rate_sat_vb: self.fallback_rate,
            tier,
            source: FeeSource::Fallback { reason: failure },
            timestamp: Instant::now(),
        }
    }

    async fn get_cached_estimate(&self, tier: FeeTier) -> Option<FeeEstimate> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|estimate| estimate.tier == tier && estimate.timestamp.elapsed() < self.cache_ttl)
            .cloned()
    }

    pub async fn clear_cache(&self) {
        *self.cache.write().await = None;
    }
}

// Transaction weight model, in weight units (4 WU = 1 vB).

/// version + locktime + input/output counts.
const TX_OVERHEAD_WEIGHT: u64 = 40;
/// Segwit marker and flag bytes.
const SEGWIT_MARKER_WEIGHT: u64 = 2;

/// Weight of one input spending `script_type`, including its witness.
pub fn input_weight(script_type: ScriptType) -> Option<u64> {
    match script_type {
        ScriptType::P2pkh => Some(592),
        ScriptType::P2shP2wpkh => Some(364),
        ScriptType::P2wpkh => Some(272),
        ScriptType::P2tr => Some(230),
        ScriptType::P2sh => None,
    }
}

/// Weight of one output: value, script length prefix and script.
pub fn output_weight(script_len: usize) -> u64 {
    4 * (8 + 1 + script_len as u64)
}

/// Estimated virtual size for the given inputs and output script lengths.
pub fn estimate_vsize(inputs: &[ScriptType], output_script_lens: &[usize]) -> u64 {
    let mut weight = TX_OVERHEAD_WEIGHT;
    if inputs.iter().any(ScriptType::is_segwit) {
        weight += SEGWIT_MARKER_WEIGHT;
    }
    weight += inputs
        .iter()
        .map(|script_type| input_weight(*script_type).unwrap_or(0))
        .sum::<u64>();
    weight += output_script_lens
        .iter()
        .map(|len| output_weight(*len))
        .sum::<u64>();
    weight.div_ceil(4)
}

/// `ceil(vsize * rate)` in satoshis.
pub fn fee_for_vsize(vsize: u64, rate_sat_vb: f64) -> u64 {
    (vsize as f64 * rate_sat_vb).ceil() as u64
}

/// Marginal fee for adding one input of `script_type`.
pub fn input_fee(script_type: ScriptType, rate_sat_vb: f64) -> Option<u64> {
    input_weight(script_type).map(|weight| (weight as f64 / 4.0 * rate_sat_vb).ceil() as u64)
}
