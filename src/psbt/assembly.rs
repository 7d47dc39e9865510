//! PSBT assembly
//!
//! Turns a selection plus payout outputs into an unsigned PSBT with the
//! per-input metadata each script type needs for signing:
//!
//! - P2WPKH: witness UTXO
//! - P2TR: witness UTXO and x-only internal key
//! - P2SH-P2WPKH: witness UTXO and the wrapped P2WPKH redeem script
//! - P2PKH: the full previous transaction
//!
//! Payout outputs keep the order they were given in; change, if any, is
//! always last.

use bdk_wallet::bitcoin::{
    absolute, psbt::Psbt, transaction, Address, Amount, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use tracing::info;

use crate::allocation::{DustPolicy, PayoutAllocation};
use crate::error::{PayoutError, Result};
use crate::keys::{FundingAddress, ScriptType};
use crate::utxo::Utxo;

use super::psbt_to_base64;

/// A destination and amount, optionally tagged with the recipient it pays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutOutput {
    pub address: Address,
    pub amount: Amount,
    pub recipient_key: Option<String>,
}

impl PayoutOutput {
    pub fn new(address: Address, amount: Amount) -> Self {
        Self {
            address,
            amount,
            recipient_key: None,
        }
    }
}

impl From<&PayoutAllocation> for PayoutOutput {
    fn from(allocation: &PayoutAllocation) -> Self {
        Self {
            address: allocation.destination.clone(),
            amount: allocation.amount,
            recipient_key: Some(allocation.recipient_key.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputKind {
    Payout { recipient_key: Option<String> },
    Change,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftOutput {
    pub index: usize,
    pub script_pubkey: ScriptBuf,
    pub amount: Amount,
    pub kind: OutputKind,
}

/// An assembled, unsigned transaction.
///
/// Inputs and outputs are fixed from here on; signing and finalization
/// never reorder them.
#[derive(Debug, Clone)]
pub struct TransactionDraft {
    psbt: Psbt,
    inputs: Vec<Utxo>,
    outputs: Vec<DraftOutput>,
    fee: Amount,
    change: Amount,
}

impl TransactionDraft {
    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn inputs(&self) -> &[Utxo] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[DraftOutput] {
        &self.outputs
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    pub fn change(&self) -> Amount {
        self.change
    }

    pub fn input_total(&self) -> Amount {
        self.inputs.iter().map(|u| u.value).sum()
    }

    pub fn output_total(&self) -> Amount {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    pub fn unsigned_txid(&self) -> Txid {
        self.psbt.unsigned_tx.compute_txid()
    }

    /// Base64 PSBT for an external wallet to sign.
    pub fn to_base64(&self) -> String {
        psbt_to_base64(&self.psbt)
    }

    /// Accept a PSBT signed elsewhere, if it is for this exact transaction.
    pub fn with_signed_psbt(self, signed: Psbt) -> Result<SignedDraft> {
        if signed.unsigned_tx != self.psbt.unsigned_tx {
            return Err(PayoutError::Psbt(format!(
                "signed PSBT is for transaction {}, expected {}",
                signed.unsigned_tx.compute_txid(),
                self.unsigned_txid()
            )));
        }
        Ok(SignedDraft {
            psbt: signed,
            outputs: self.outputs,
            fee: self.fee,
            change: self.change,
        })
    }

    pub(crate) fn into_parts(self) -> (Psbt, Vec<DraftOutput>, Amount, Amount) {
        (self.psbt, self.outputs, self.fee, self.change)
    }
}

/// A draft whose inputs carry signatures, ready for finalization.
#[derive(Debug, Clone)]
pub struct SignedDraft {
    pub(crate) psbt: Psbt,
    pub(crate) outputs: Vec<DraftOutput>,
    pub(crate) fee: Amount,
    pub(crate) change: Amount,
}

impl SignedDraft {
    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn outputs(&self) -> &[DraftOutput] {
        &self.outputs
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    pub fn change(&self) -> Amount {
        self.change
    }
}

/// Build the unsigned PSBT.
///
/// `change = inputs - outputs - fee`. Change above the dust limit for the
/// funding script becomes a final output back to `funding`; anything at or
/// below it is left to the miners.
pub fn assemble(
    selected: &[Utxo],
    outputs: &[PayoutOutput],
    funding: &FundingAddress,
    fee: Amount,
    dust: &DustPolicy,
) -> Result<TransactionDraft> {
    if selected.is_empty() {
        return Err(PayoutError::InvalidInput("no inputs selected".to_string()));
    }
    if outputs.is_empty() {
        return Err(PayoutError::InvalidInput("no outputs to pay".to_string()));
    }

    for output in outputs {
        let limit = dust.limit_for(&output.address.script_pubkey());
        if output.amount.to_sat() < limit {
            return Err(PayoutError::InvalidInput(format!(
                "output of {} sats to {} is below the dust limit of {} sats",
                output.amount.to_sat(),
                output.address,
                limit
            )));
        }
    }

    let input_total: Amount = selected.iter().map(|u| u.value).sum();
    let spent = outputs
        .iter()
        .try_fold(fee, |acc, o| acc.checked_add(o.amount))
        .ok_or_else(|| PayoutError::InvalidInput("output total overflows".to_string()))?;
    let leftover = input_total
        .checked_sub(spent)
        .ok_or_else(|| PayoutError::InsufficientFunds {
            needed: spent.to_sat(),
            available: input_total.to_sat(),
            shortfall: spent.to_sat() - input_total.to_sat(),
        })?;

    let change_limit = dust.limit_for(&funding.script_pubkey);
    let (change, fee) = if leftover.to_sat() > change_limit {
        (leftover, fee)
    } else {
        if leftover > Amount::ZERO {
            info!(
                "💨 Change of {} sats is at or below dust ({}); adding it to the fee",
                leftover.to_sat(),
                change_limit
            );
        }
        (Amount::ZERO, fee + leftover)
    };

    let mut draft_outputs: Vec<DraftOutput> = outputs
        .iter()
        .enumerate()
        .map(|(index, output)| DraftOutput {
            index,
            script_pubkey: output.address.script_pubkey(),
            amount: output.amount,
            kind: OutputKind::Payout {
                recipient_key: output.recipient_key.clone(),
            },
        })
        .collect();
    if change > Amount::ZERO {
        draft_outputs.push(DraftOutput {
            index: draft_outputs.len(),
            script_pubkey: funding.script_pubkey.clone(),
            amount: change,
            kind: OutputKind::Change,
        });
    }

    let unsigned_tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: selected
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: draft_outputs
            .iter()
            .map(|o| TxOut {
                value: o.amount,
                script_pubkey: o.script_pubkey.clone(),
            })
            .collect(),
    };

    let mut psbt =
        Psbt::from_unsigned_tx(unsigned_tx).map_err(|e| PayoutError::Psbt(e.to_string()))?;

    for (input, utxo) in psbt.inputs.iter_mut().zip(selected) {
        match utxo.script_type {
            ScriptType::P2wpkh => {
                input.witness_utxo = Some(utxo.txout());
            }
            ScriptType::P2tr => {
                input.witness_utxo = Some(utxo.txout());
                input.tap_internal_key = Some(funding.tap_internal_key.ok_or_else(|| {
                    unsupported(utxo, "funding wallet has no taproot internal key")
                })?);
            }
            ScriptType::P2shP2wpkh => {
                input.witness_utxo = Some(utxo.txout());
                input.redeem_script = Some(funding.redeem_script.clone().ok_or_else(|| {
                    unsupported(utxo, "funding wallet has no redeem script")
                })?);
            }
            ScriptType::P2pkh => {
                input.non_witness_utxo = Some(previous_transaction(utxo)?);
            }
            ScriptType::P2sh => return Err(unsupported(utxo, "p2sh")),
        }
    }

    let draft = TransactionDraft {
        psbt,
        inputs: selected.to_vec(),
        outputs: draft_outputs,
        fee,
        change,
    };

    debug_assert_eq!(draft.input_total(), draft.output_total() + draft.fee);

    info!(
        "🔨 Assembled transaction {}: {} inputs, {} outputs, fee {} sats, change {} sats",
        draft.unsigned_txid(),
        draft.inputs.len(),
        draft.outputs.len(),
        draft.fee.to_sat(),
        draft.change.to_sat()
    );

    Ok(draft)
}

fn unsupported(utxo: &Utxo, detail: &str) -> PayoutError {
    PayoutError::UnsupportedScript {
        outpoint: utxo.outpoint.to_string(),
        script_type: format!("{} ({})", utxo.script_type, detail),
    }
}

/// The previous transaction for a legacy input, checked against the outpoint.
fn previous_transaction(utxo: &Utxo) -> Result<Transaction> {
    let missing = || PayoutError::MissingPreviousTransaction {
        outpoint: utxo.outpoint.to_string(),
    };
    let prev_tx = utxo.prev_tx.as_ref().ok_or_else(missing)?;
    let OutPoint { txid, vout } = utxo.outpoint;
    if prev_tx.compute_txid() != txid {
        return Err(missing());
    }
    match prev_tx.output.get(vout as usize) {
        Some(out) if out.value == utxo.value && out.script_pubkey == utxo.script_pubkey => {
            Ok(prev_tx.clone())
        }
        _ => Err(missing()),
    }
}
