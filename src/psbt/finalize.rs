//! PSBT finalization
//!
//! The miniscript finalizer runs first. Any input it could not finalize gets
//! exactly one manual attempt that builds the scriptSig/witness by hand from
//! the signature data for its script type. If an input is still not final
//! after that, finalization fails naming that input.

use bdk_wallet::bitcoin::{
    psbt::{Input, Psbt},
    script::{Builder, PushBytesBuf},
    ScriptBuf, Witness,
};
use bdk_wallet::miniscript::psbt::PsbtExt;
use tracing::{info, warn};

use crate::ecc::Secp;
use crate::error::{PayoutError, Result};
use crate::keys::ScriptType;

use super::assembly::SignedDraft;
use super::{dump_psbt_state, FinalizedTransaction};

impl SignedDraft {
    /// Finalize every input and extract the transaction.
    pub fn finalize(self, secp: &Secp) -> Result<FinalizedTransaction> {
        finalize_psbt(secp, self.psbt)
    }
}

/// Finalize a signed PSBT, whoever signed it, and extract the transaction.
///
/// Script types are read from the PSBT itself, so this also serves PSBTs
/// signed by an external wallet.
pub fn finalize_psbt(secp: &Secp, mut psbt: Psbt) -> Result<FinalizedTransaction> {
    info!("🔍 Finalizing PSBT with {} inputs", psbt.inputs.len());

    if let Err(errors) = psbt.finalize_mut(secp) {
        for error in &errors {
            warn!("Standard finalizer: {}", error);
        }
        warn!("Falling back to manual finalization for {} inputs", errors.len());

        for index in 0..psbt.inputs.len() {
            if is_final(&psbt.inputs[index]) {
                continue;
            }
            let script_pubkey = spent_script(&psbt, index)?;
            if let Err(e) = finalize_input(&mut psbt.inputs[index], index, &script_pubkey) {
                dump_psbt_state(&psbt, "finalization failed");
                return Err(e);
            }
            info!("    Input {}: finalized manually", index);
        }
    }

    if let Some(index) = psbt.inputs.iter().position(|input| !is_final(input)) {
        dump_psbt_state(&psbt, "finalization incomplete");
        return Err(PayoutError::FinalizationError {
            index,
            reason: "input has neither a final scriptSig nor a final witness".to_string(),
        });
    }

    let tx = psbt
        .extract_tx()
        .map_err(|e| PayoutError::Psbt(format!("extracting transaction: {}", e)))?;
    let finalized = FinalizedTransaction::new(tx);

    info!(
        "✅ All inputs finalized: {} ({} vB)",
        finalized.txid,
        finalized.vsize()
    );
    Ok(finalized)
}

fn is_final(input: &Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

fn spent_script(psbt: &Psbt, index: usize) -> Result<ScriptBuf> {
    let input = &psbt.inputs[index];
    if let Some(utxo) = &input.witness_utxo {
        return Ok(utxo.script_pubkey.clone());
    }
    let vout = psbt.unsigned_tx.input[index].previous_output.vout as usize;
    input
        .non_witness_utxo
        .as_ref()
        .and_then(|prev| prev.output.get(vout))
        .map(|out| out.script_pubkey.clone())
        .ok_or_else(|| PayoutError::FinalizationError {
            index,
            reason: "no previous output to identify the script type".to_string(),
        })
}

/// Build the final scriptSig/witness for one input by hand.
fn finalize_input(input: &mut Input, index: usize, script_pubkey: &ScriptBuf) -> Result<()> {
    let failure = |reason: &str| PayoutError::FinalizationError {
        index,
        reason: reason.to_string(),
    };

    let script_type = ScriptType::classify(script_pubkey, input.redeem_script.as_deref())
        .ok_or_else(|| failure("unrecognised script"))?;

    match script_type {
        ScriptType::P2tr => {
            let sig = input
                .tap_key_sig
                .ok_or_else(|| failure("missing taproot key signature"))?;
            input.final_script_witness = Some(Witness::from_slice(&[sig.to_vec()]));
        }
        ScriptType::P2wpkh | ScriptType::P2shP2wpkh => {
            let (pk, sig) = single_partial_sig(input).ok_or_else(|| failure("missing signature"))?;
            if script_type == ScriptType::P2shP2wpkh {
                let redeem = input
                    .redeem_script
                    .as_ref()
                    .ok_or_else(|| failure("missing redeem script"))?;
                let push = PushBytesBuf::try_from(redeem.to_bytes())
                    .map_err(|_| failure("redeem script too large"))?;
                input.final_script_sig = Some(Builder::new().push_slice(push).into_script());
            }
            input.final_script_witness = Some(Witness::from_slice(&[sig, pk]));
        }
        ScriptType::P2pkh => {
            let (pk, sig) = single_partial_sig(input).ok_or_else(|| failure("missing signature"))?;
            let sig = PushBytesBuf::try_from(sig).map_err(|_| failure("signature too large"))?;
            let pk = PushBytesBuf::try_from(pk).map_err(|_| failure("public key too large"))?;
            input.final_script_sig = Some(Builder::new().push_slice(sig).push_slice(pk).into_script());
        }
        ScriptType::P2sh => return Err(failure("bare p2sh inputs cannot be finalized")),
    }

    clear_non_final_fields(input);
    Ok(())
}

/// Serialized (pubkey, signature) of the only partial signature.
fn single_partial_sig(input: &Input) -> Option<(Vec<u8>, Vec<u8>)> {
    if input.partial_sigs.len() != 1 {
        return None;
    }
    input
        .partial_sigs
        .iter()
        .next()
        .map(|(pk, sig)| (pk.to_bytes(), sig.to_vec()))
}

/// Clear all non-final fields per BIP 174
fn clear_non_final_fields(input: &mut Input) {
    input.partial_sigs.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    input.bip32_derivation.clear();
    input.tap_key_sig = None;
    input.tap_script_sigs.clear();
    input.tap_scripts.clear();
    input.tap_key_origins.clear();
    input.tap_internal_key = None;
    input.tap_merkle_root = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::DustPolicy;
    use crate::ecc;
    use crate::keys::{KeySource, SigningWallet};
    use crate::psbt::signer::sign_draft;
    use crate::psbt::{assemble, KeySigner, PayoutOutput, TransactionDraft};
    use crate::utxo::Utxo;
    use bdk_wallet::bitcoin::{
        absolute, hashes::Hash, transaction, Amount, Network, OutPoint, Sequence, Transaction, TxIn,
        TxOut, Txid,
    };

    const KEY: &str = "0000000000000000000000000000000000000000000000000000000000000005";

    fn wallet(script_type: ScriptType) -> SigningWallet {
        KeySource::detect(KEY, None)
            .signing_wallet(ecc::init(), script_type, Network::Regtest)
            .unwrap()
    }

    fn draft_for(source: &SigningWallet) -> TransactionDraft {
        let prev = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([4; 32]), 1),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(30_000),
                script_pubkey: source.script_pubkey(),
            }],
        };
        let utxo = Utxo {
            outpoint: OutPoint::new(prev.compute_txid(), 0),
            value: Amount::from_sat(30_000),
            script_pubkey: source.script_pubkey(),
            script_type: source.script_type(),
            address: source.address().clone(),
            confirmed: true,
            prev_tx: Some(prev),
        };
        assemble(
            &[utxo],
            &[PayoutOutput::new(wallet(ScriptType::P2tr).address().clone(), Amount::from_sat(20_000))],
            &source.funding(),
            Amount::from_sat(1_000),
            &DustPolicy::default(),
        )
        .unwrap()
    }

    async fn signed_psbt(script_type: ScriptType) -> Psbt {
        let source = wallet(script_type);
        let draft = draft_for(&source);
        let signed = sign_draft(draft, &KeySigner::new(ecc::init(), source)).await.unwrap();
        signed.psbt().clone()
    }

    #[tokio::test]
    async fn test_standard_finalization_for_every_script_type() {
        for script_type in ScriptType::SIGNABLE {
            let psbt = signed_psbt(script_type).await;
            let finalized = finalize_psbt(ecc::init(), psbt).unwrap();
            let input = &finalized.tx.input[0];
            match script_type {
                ScriptType::P2tr => {
                    assert_eq!(input.witness.len(), 1);
                    assert!(input.script_sig.is_empty());
                }
                ScriptType::P2wpkh => {
                    assert_eq!(input.witness.len(), 2);
                    assert!(input.script_sig.is_empty());
                }
                ScriptType::P2shP2wpkh => {
                    assert_eq!(input.witness.len(), 2);
                    assert!(!input.script_sig.is_empty());
                }
                _ => {
                    assert!(input.witness.is_empty());
                    assert!(!input.script_sig.is_empty());
                }
            }
            assert_eq!(finalized.txid, finalized.tx.compute_txid());
        }
    }

    #[tokio::test]
    async fn test_manual_fallback_matches_standard_finalizer() {
        for script_type in ScriptType::SIGNABLE {
            let psbt = signed_psbt(script_type).await;
            let standard = finalize_psbt(ecc::init(), psbt.clone()).unwrap();

            let mut manual = psbt;
            let script = spent_script(&manual, 0).unwrap();
            finalize_input(&mut manual.inputs[0], 0, &script).unwrap();
            let manual_tx = manual.extract_tx().unwrap();

            assert_eq!(manual_tx, standard.tx, "{} differs", script_type);
        }
    }

    #[tokio::test]
    async fn test_unsigned_input_fails_with_index() {
        let draft = draft_for(&wallet(ScriptType::P2wpkh));
        let err = finalize_psbt(ecc::init(), draft.psbt().clone()).unwrap_err();
        assert!(matches!(err, PayoutError::FinalizationError { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_finalization_is_deterministic() {
        let first = finalize_psbt(ecc::init(), signed_psbt(ScriptType::P2tr).await).unwrap();
        let second = finalize_psbt(ecc::init(), signed_psbt(ScriptType::P2tr).await).unwrap();
        assert_eq!(first.raw_hex, second.raw_hex);
    }
}
