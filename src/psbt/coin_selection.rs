//! Greedy UTXO selection
//!
//! Candidates are filtered (too small, unconfirmed when confirmation is
//! required, unsignable, or worth less than the fee to spend them), then
//! taken confirmed-first and largest-first until they cover the target plus
//! the fee for the current input count.

use bdk_wallet::bitcoin::{Amount, Script, ScriptBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::allocation::{DustPolicy, DUST_LIMIT};
use crate::error::{PayoutError, Result};
use crate::fee::{estimate_vsize, fee_for_vsize, input_fee, input_weight};
use crate::keys::ScriptType;
use crate::utxo::Utxo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Outputs below this value are never spent.
    pub min_utxo_value: u64,
    /// Spend only confirmed outputs. Confirmed outputs are preferred either way.
    pub require_confirmed: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_utxo_value: DUST_LIMIT,
            require_confirmed: false,
        }
    }
}

/// Inputs chosen for a spend and the fee they need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub selected: Vec<Utxo>,
    /// Fee to hand to assembly. Covers a change output when one is
    /// worthwhile; otherwise it is everything above the target.
    pub fee: Amount,
    /// Change the selection expects assembly to emit.
    pub change: Amount,
}

impl Selection {
    pub fn input_total(&self) -> Amount {
        self.selected.iter().map(|u| u.value).sum()
    }
}

/// Pick inputs covering `target` plus fees at `fee_rate` sat/vB.
///
/// `outputs` are the payout scripts and `change_script` the script change
/// would go to; both feed the size estimate.
pub fn select_utxos(
    utxos: &[Utxo],
    target: Amount,
    fee_rate: f64,
    outputs: &[ScriptBuf],
    change_script: &Script,
    config: &SelectionConfig,
    dust: &DustPolicy,
) -> Result<Selection> {
    let mut candidates: Vec<&Utxo> = utxos
        .iter()
        .filter(|utxo| is_spendable(utxo, fee_rate, config))
        .collect();

    candidates.sort_by(|a, b| {
        b.confirmed
            .cmp(&a.confirmed)
            .then_with(|| b.value.cmp(&a.value))
            .then_with(|| a.outpoint.cmp(&b.outpoint))
    });

    let payout_lens: Vec<usize> = outputs.iter().map(|s| s.len()).collect();
    let mut with_change_lens = payout_lens.clone();
    with_change_lens.push(change_script.len());
    let change_limit = dust.limit_for(change_script);

    let target_sats = target.to_sat();
    let mut selected: Vec<Utxo> = Vec::new();
    let mut input_types: Vec<ScriptType> = Vec::new();
    let mut total = 0u64;
    let mut fee_no_change = fee_for_vsize(estimate_vsize(&[], &payout_lens), fee_rate);

    for utxo in candidates {
        selected.push(utxo.clone());
        input_types.push(utxo.script_type);
        total += utxo.value.to_sat();

        fee_no_change = fee_for_vsize(estimate_vsize(&input_types, &payout_lens), fee_rate);
        let fee_with_change = fee_for_vsize(estimate_vsize(&input_types, &with_change_lens), fee_rate);

        if total < target_sats + fee_no_change {
            continue;
        }

        let (fee, change) = if total >= target_sats + fee_with_change
            && total - target_sats - fee_with_change > change_limit
        {
            (fee_with_change, total - target_sats - fee_with_change)
        } else if total >= target_sats + fee_with_change {
            // change at or below dust: folded into the fee at assembly
            (fee_with_change, 0)
        } else {
            (total - target_sats, 0)
        };

        info!(
            "✅ Selected {} UTXOs ({} sats) for {} sats + {} sats fee at {:.2} sat/vB",
            selected.len(),
            total,
            target_sats,
            fee,
            fee_rate
        );
        return Ok(Selection {
            selected,
            fee: Amount::from_sat(fee),
            change: Amount::from_sat(change),
        });
    }

    let needed = target_sats + fee_no_change;
    Err(PayoutError::InsufficientFunds {
        needed,
        available: total,
        shortfall: needed.saturating_sub(total),
    })
}

fn is_spendable(utxo: &Utxo, fee_rate: f64, config: &SelectionConfig) -> bool {
    if utxo.value.to_sat() < config.min_utxo_value {
        debug!("Skipping {}: below minimum value {}", utxo, config.min_utxo_value);
        return false;
    }
    if config.require_confirmed && !utxo.confirmed {
        debug!("Skipping {}: unconfirmed", utxo);
        return false;
    }
    if input_weight(utxo.script_type).is_none() {
        debug!("Skipping {}: cannot sign {}", utxo, utxo.script_type);
        return false;
    }
    match input_fee(utxo.script_type, fee_rate) {
        Some(cost) if utxo.value.to_sat() > cost => true,
        _ => {
            debug!("Skipping {}: worth less than the fee to spend it", utxo);
            false
        }
    }
}
