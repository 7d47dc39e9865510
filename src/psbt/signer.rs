//! Signing abstraction for PSBT inputs
//!
//! [`KeySigner`] holds one derived wallet and signs every input that pays to
//! that wallet's script, computing the sighash for the input's script type.
//! Taproot inputs are signed through a [`TweakedSigner`], which applies the
//! BIP341 key tweak to the internal key. The tweaked key exists only for
//! the duration of one signing call.

use async_trait::async_trait;
use bdk_wallet::bitcoin::{
    ecdsa,
    hashes::Hash,
    key::{Parity, TapTweak},
    psbt::{Input, Psbt},
    secp256k1::{schnorr, Keypair, Message, SecretKey, XOnlyPublicKey},
    sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType},
    taproot::{self, TapTweakHash},
    PublicKey, Script, TapSighash, Transaction, TxOut,
};
use tracing::info;

use crate::ecc::Secp;
use crate::error::{PayoutError, Result};
use crate::keys::{FundingAddress, ScriptType, SigningWallet};

use super::assembly::{SignedDraft, TransactionDraft};

/// Abstraction for signing operations
///
/// Implementations can be:
/// - KeySigner: a derived key held in memory for one operation
/// - an external wallet, reached through the base64 PSBT round trip
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign every input this signer owns, returning how many were signed.
    async fn sign_psbt(&self, psbt: &mut Psbt) -> Result<usize>;

    /// Public description of the address whose inputs this signer owns.
    fn funding(&self) -> FundingAddress;
}

/// Sign a draft, producing the next pipeline stage.
///
/// Every input must end up signed; a signer that owns only some of the
/// inputs is an error rather than a half-signed transaction.
pub async fn sign_draft(draft: TransactionDraft, signer: &dyn Signer) -> Result<SignedDraft> {
    let (mut psbt, outputs, fee, change) = draft.into_parts();
    let signed = signer.sign_psbt(&mut psbt).await?;

    if let Some(index) = psbt.inputs.iter().position(|input| !has_signature(input)) {
        return Err(PayoutError::SigningFailure {
            index,
            reason: "input does not belong to the signing wallet".to_string(),
        });
    }

    info!("✍️  Signed {} of {} inputs", signed, psbt.inputs.len());
    Ok(SignedDraft {
        psbt,
        outputs,
        fee,
        change,
    })
}

fn has_signature(input: &Input) -> bool {
    input.tap_key_sig.is_some()
        || !input.partial_sigs.is_empty()
        || input.final_script_sig.is_some()
        || input.final_script_witness.is_some()
}

/// In-memory signer for a single derived wallet.
pub struct KeySigner {
    secp: &'static Secp,
    wallet: SigningWallet,
}

impl KeySigner {
    pub fn new(secp: &'static Secp, wallet: SigningWallet) -> Self {
        Self { secp, wallet }
    }

    pub fn wallet(&self) -> &SigningWallet {
        &self.wallet
    }

    fn sign_input(
        &self,
        index: usize,
        tx: &Transaction,
        cache: &mut SighashCache<&Transaction>,
        prevouts: &[TxOut],
        input: &mut Input,
    ) -> Result<()> {
        let failure = |reason: String| PayoutError::SigningFailure { index, reason };
        let prevout = prevouts
            .get(index)
            .ok_or_else(|| failure("missing previous output".to_string()))?;

        match self.wallet.script_type() {
            ScriptType::P2tr => {
                let tweaked = TweakedSigner::new(self.secp, self.wallet.secret_key())
                    .map_err(|e| failure(e.to_string()))?;
                let sighash = cache
                    .taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts), TapSighashType::Default)
                    .map_err(|e| failure(e.to_string()))?;
                input.tap_key_sig = Some(taproot::Signature {
                    signature: tweaked.sign(self.secp, &sighash),
                    sighash_type: TapSighashType::Default,
                });
            }
            ScriptType::P2wpkh | ScriptType::P2shP2wpkh => {
                // for the nested form the sighash commits to the inner P2WPKH script
                let script_code = match self.wallet.redeem_script() {
                    Some(redeem) => redeem,
                    None => prevout.script_pubkey.clone(),
                };
                let sighash = cache
                    .p2wpkh_signature_hash(index, &script_code, prevout.value, EcdsaSighashType::All)
                    .map_err(|e| failure(e.to_string()))?;
                self.add_ecdsa_signature(input, sighash.to_byte_array());
            }
            ScriptType::P2pkh => {
                if input.non_witness_utxo.is_none() {
                    return Err(failure("legacy input has no previous transaction".to_string()));
                }
                let sighash = cache
                    .legacy_signature_hash(index, &prevout.script_pubkey, EcdsaSighashType::All.to_u32())
                    .map_err(|e| failure(e.to_string()))?;
                self.add_ecdsa_signature(input, sighash.to_byte_array());
            }
            ScriptType::P2sh => {
                return Err(PayoutError::UnsupportedScript {
                    outpoint: tx.input[index].previous_output.to_string(),
                    script_type: ScriptType::P2sh.to_string(),
                })
            }
        }
        Ok(())
    }

    fn add_ecdsa_signature(&self, input: &mut Input, digest: [u8; 32]) {
        let message = Message::from_digest(digest);
        let signature = self.secp.sign_ecdsa(&message, self.wallet.secret_key());
        input.partial_sigs.insert(
            PublicKey::new(self.wallet.public_key()),
            ecdsa::Signature {
                signature,
                sighash_type: EcdsaSighashType::All,
            },
        );
    }
}

#[async_trait]
impl Signer for KeySigner {
    async fn sign_psbt(&self, psbt: &mut Psbt) -> Result<usize> {
        let tx = psbt.unsigned_tx.clone();
        let prevouts = previous_outputs(psbt)?;
        let mut cache = SighashCache::new(&tx);
        let ours = self.wallet.script_pubkey();

        let mut signed = 0;
        for (index, input) in psbt.inputs.iter_mut().enumerate() {
            if prevouts[index].script_pubkey != ours {
                continue;
            }
            self.sign_input(index, &tx, &mut cache, &prevouts, input)?;
            signed += 1;
        }
        Ok(signed)
    }

    fn funding(&self) -> FundingAddress {
        self.wallet.funding()
    }
}

/// Previous output for every input, from the witness UTXO or the full
/// previous transaction.
fn previous_outputs(psbt: &Psbt) -> Result<Vec<TxOut>> {
    psbt.inputs
        .iter()
        .zip(&psbt.unsigned_tx.input)
        .enumerate()
        .map(|(index, (input, txin))| {
            if let Some(utxo) = &input.witness_utxo {
                return Ok(utxo.clone());
            }
            input
                .non_witness_utxo
                .as_ref()
                .and_then(|prev| prev.output.get(txin.previous_output.vout as usize))
                .cloned()
                .ok_or_else(|| PayoutError::SigningFailure {
                    index,
                    reason: "missing witness_utxo and non_witness_utxo".to_string(),
                })
        })
        .collect()
}

/// Signer for a taproot key-path spend with no script tree.
///
/// Holds the internal key after the BIP341 tweak:
/// `d' = d + H_TapTweak(P)` where `d` is negated first if `P = dG` has an
/// odd y coordinate.
pub struct TweakedSigner {
    keypair: Keypair,
}

impl TweakedSigner {
    pub fn new(secp: &Secp, internal_secret: &SecretKey) -> Result<Self> {
        let (internal_key, parity) = internal_secret.x_only_public_key(secp);
        let even_secret = if parity == Parity::Odd {
            internal_secret.negate()
        } else {
            *internal_secret
        };

        let tweak = TapTweakHash::from_key_and_tweak(internal_key, None).to_scalar();
        let tweaked = even_secret
            .add_tweak(&tweak)
            .map_err(|e| PayoutError::KeyDerivation(format!("taproot tweak failed: {}", e)))?;

        Ok(Self {
            keypair: Keypair::from_secret_key(secp, &tweaked),
        })
    }

    /// The tweaked output key, as committed to in the P2TR scriptPubKey.
    pub fn output_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    pub fn sign(&self, secp: &Secp, sighash: &TapSighash) -> schnorr::Signature {
        let message = Message::from_digest(sighash.to_byte_array());
        secp.sign_schnorr_no_aux_rand(&message, &self.keypair)
    }
}

impl Drop for TweakedSigner {
    fn drop(&mut self) {
        self.keypair.non_secure_erase();
    }
}

/// Check a key-path signature against the output key derived independently
/// from the internal key.
pub fn verify_key_path(
    secp: &Secp,
    internal_key: XOnlyPublicKey,
    sighash: &TapSighash,
    signature: &schnorr::Signature,
) -> bool {
    let (output_key, _) = internal_key.tap_tweak(secp, None);
    let message = Message::from_digest(sighash.to_byte_array());
    secp.verify_schnorr(signature, &message, &output_key.to_inner())
        .is_ok()
}

/// `true` if `script` is the P2TR output for `internal_key` with no script tree.
pub fn is_key_path_output(secp: &Secp, internal_key: XOnlyPublicKey, script: &Script) -> bool {
    let (output_key, _) = internal_key.tap_tweak(secp, None);
    script.is_p2tr() && script.as_bytes()[2..] == output_key.to_inner().serialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::DustPolicy;
    use crate::ecc;
    use crate::keys::KeySource;
    use crate::psbt::{assemble, PayoutOutput};
    use crate::utxo::Utxo;
    use bdk_wallet::bitcoin::{
        absolute, transaction, Amount, Network, OutPoint, ScriptBuf, Sequence, TxIn, Txid, Witness,
    };
    use bdk_wallet::bitcoin::secp256k1::ecdsa as secp_ecdsa;

    const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon \
                            abandon abandon abandon abandon abandon about";

    fn wallet(script_type: ScriptType) -> SigningWallet {
        KeySource::detect(MNEMONIC, None)
            .signing_wallet(ecc::init(), script_type, Network::Regtest)
            .unwrap()
    }

    /// A funding transaction paying `value` to `wallet`, so legacy inputs
    /// have a real previous transaction to commit to.
    fn funding_tx(wallet: &SigningWallet, value: u64) -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([9; 32]), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: wallet.script_pubkey(),
            }],
        }
    }

    fn draft_for(wallet: &SigningWallet) -> TransactionDraft {
        let prev = funding_tx(wallet, 20_000);
        let utxo = Utxo {
            outpoint: OutPoint::new(prev.compute_txid(), 0),
            value: Amount::from_sat(20_000),
            script_pubkey: wallet.script_pubkey(),
            script_type: wallet.script_type(),
            address: wallet.address().clone(),
            confirmed: true,
            prev_tx: Some(prev),
        };
        let destination = KeySource::detect(
            "0000000000000000000000000000000000000000000000000000000000000002",
            None,
        )
        .signing_wallet(ecc::init(), ScriptType::P2wpkh, Network::Regtest)
        .unwrap();
        assemble(
            &[utxo],
            &[PayoutOutput::new(destination.address().clone(), Amount::from_sat(15_000))],
            &wallet.funding(),
            Amount::from_sat(400),
            &DustPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_tweak_matches_address_output_key() {
        let secp = ecc::init();
        let taproot = wallet(ScriptType::P2tr);
        let tweaked = TweakedSigner::new(secp, taproot.secret_key()).unwrap();
        assert_eq!(
            &taproot.script_pubkey().as_bytes()[2..],
            tweaked.output_key().serialize().as_slice()
        );
        assert!(is_key_path_output(
            secp,
            taproot.tap_internal_key().unwrap(),
            &taproot.script_pubkey()
        ));
    }

    #[tokio::test]
    async fn test_taproot_signature_verifies_against_tweaked_internal_key() {
        let secp = ecc::init();
        let taproot = wallet(ScriptType::P2tr);
        let internal_key = taproot.tap_internal_key().unwrap();
        let draft = draft_for(&taproot);
        let signer = KeySigner::new(secp, taproot);

        let signed = sign_draft(draft, &signer).await.unwrap();
        let psbt = signed.psbt();
        let signature = psbt.inputs[0].tap_key_sig.unwrap();

        let prevouts = vec![psbt.inputs[0].witness_utxo.clone().unwrap()];
        let sighash = SighashCache::new(&psbt.unsigned_tx)
            .taproot_key_spend_signature_hash(0, &Prevouts::All(&prevouts), TapSighashType::Default)
            .unwrap();
        assert!(verify_key_path(secp, internal_key, &sighash, &signature.signature));

        // the untweaked internal key must not verify
        let message = Message::from_digest(sighash.to_byte_array());
        assert!(secp
            .verify_schnorr(&signature.signature, &message, &internal_key)
            .is_err());
    }

    fn verify_ecdsa(psbt: &Psbt, wallet: &SigningWallet, digest: [u8; 32]) {
        let secp = ecc::init();
        let (pk, sig) = psbt.inputs[0].partial_sigs.iter().next().unwrap();
        assert_eq!(pk.inner, wallet.public_key());
        let signature: secp_ecdsa::Signature = sig.signature;
        secp.verify_ecdsa(&Message::from_digest(digest), &signature, &pk.inner)
            .unwrap();
    }

    #[tokio::test]
    async fn test_segwit_v0_signatures_verify() {
        for script_type in [ScriptType::P2wpkh, ScriptType::P2shP2wpkh] {
            let source = wallet(script_type);
            let draft = draft_for(&source);
            let signer = KeySigner::new(ecc::init(), wallet(script_type));
            let signed = sign_draft(draft, &signer).await.unwrap();
            let psbt = signed.psbt();

            let script_code = source.redeem_script().unwrap_or_else(|| source.script_pubkey());
            let sighash = SighashCache::new(&psbt.unsigned_tx)
                .p2wpkh_signature_hash(0, &script_code, Amount::from_sat(20_000), EcdsaSighashType::All)
                .unwrap();
            verify_ecdsa(psbt, &source, sighash.to_byte_array());
        }
    }

    #[tokio::test]
    async fn test_legacy_signature_verifies() {
        let source = wallet(ScriptType::P2pkh);
        let draft = draft_for(&source);
        let signer = KeySigner::new(ecc::init(), wallet(ScriptType::P2pkh));
        let signed = sign_draft(draft, &signer).await.unwrap();
        let psbt = signed.psbt();

        let sighash = SighashCache::new(&psbt.unsigned_tx)
            .legacy_signature_hash(0, &source.script_pubkey(), EcdsaSighashType::All.to_u32())
            .unwrap();
        verify_ecdsa(psbt, &source, sighash.to_byte_array());
    }

    #[tokio::test]
    async fn test_foreign_inputs_are_a_signing_failure() {
        let draft = draft_for(&wallet(ScriptType::P2wpkh));
        let signer = KeySigner::new(ecc::init(), wallet(ScriptType::P2tr));
        let err = sign_draft(draft, &signer).await.unwrap_err();
        assert!(matches!(err, PayoutError::SigningFailure { index: 0, .. }));
    }
}
