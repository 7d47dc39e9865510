//! Transaction pipeline stages
//!
//! Each stage hands the next one a new value instead of mutating a shared
//! builder:
//!
//! ```text
//! select_utxos -> assemble -> TransactionDraft
//!              -> sign      -> SignedDraft
//!              -> finalize  -> FinalizedTransaction
//! ```

pub mod assembly;
pub mod coin_selection;
pub mod finalize;
pub mod signer;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bdk_wallet::bitcoin::{consensus::encode::serialize_hex, psbt::Psbt, Transaction, Txid};
use tracing::debug;

use crate::error::{PayoutError, Result};

pub use assembly::{assemble, DraftOutput, OutputKind, PayoutOutput, SignedDraft, TransactionDraft};
pub use coin_selection::{select_utxos, Selection, SelectionConfig};
pub use finalize::finalize_psbt;
pub use signer::{KeySigner, Signer, TweakedSigner};

/// A fully signed, extracted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedTransaction {
    pub tx: Transaction,
    pub txid: Txid,
    pub raw_hex: String,
}

impl FinalizedTransaction {
    pub fn new(tx: Transaction) -> Self {
        let txid = tx.compute_txid();
        let raw_hex = serialize_hex(&tx);
        Self { tx, txid, raw_hex }
    }

    pub fn vsize(&self) -> usize {
        self.tx.vsize()
    }
}

/// Encode a PSBT for an external wallet.
pub fn psbt_to_base64(psbt: &Psbt) -> String {
    STANDARD.encode(psbt.serialize())
}

/// Decode a base64 PSBT.
pub fn psbt_from_base64(encoded: &str) -> Result<Psbt> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| PayoutError::Psbt(format!("not base64: {}", e)))?;
    Psbt::deserialize(&bytes).map_err(|e| PayoutError::Psbt(e.to_string()))
}

/// Log the signing-relevant state of every input and output.
pub(crate) fn dump_psbt_state(psbt: &Psbt, label: &str) {
    debug!("========== PSBT STATE: {} ==========", label);
    debug!(
        "Transaction inputs: {}, outputs: {}",
        psbt.unsigned_tx.input.len(),
        psbt.unsigned_tx.output.len()
    );

    for (i, input) in psbt.inputs.iter().enumerate() {
        debug!("--- Input {} ---", i);
        if let Some(ref utxo) = input.witness_utxo {
            debug!("  witness_utxo: {} sats, {}", utxo.value.to_sat(), utxo.script_pubkey);
        }
        debug!("  non_witness_utxo: {}", input.non_witness_utxo.is_some());
        debug!("  redeem_script: {:?}", input.redeem_script);
        debug!("  tap_internal_key: {:?}", input.tap_internal_key);
        debug!("  tap_key_sig: {}", input.tap_key_sig.is_some());
        debug!("  partial_sigs: {}", input.partial_sigs.len());
        debug!("  final_script_sig: {}", input.final_script_sig.is_some());
        debug!("  final_script_witness: {}", input.final_script_witness.is_some());
    }

    for (i, output) in psbt.unsigned_tx.output.iter().enumerate() {
        debug!("--- Output {} --- {} sats to {}", i, output.value.to_sat(), output.script_pubkey);
    }
    debug!("========================================");
}
