//! Key parsing and per-script-type address derivation
//!
//! Signing material comes either from a BIP39 mnemonic (derived along the
//! standard purpose paths) or from a single WIF / raw hex private key. Every
//! supported script type is derived from the same material:
//!
//! | Script type  | Path                |
//! |--------------|---------------------|
//! | P2PKH        | `m/44'/coin'/0'/0/0` |
//! | P2SH-P2WPKH  | `m/49'/coin'/0'/0/0` |
//! | P2WPKH       | `m/84'/coin'/0'/0/0` |
//! | P2TR         | `m/86'/coin'/0'/0/0` |
//!
//! `coin` is 0 on mainnet and 1 everywhere else.

use std::fmt;
use std::str::FromStr;

use bdk_wallet::bitcoin::{
    bip32::{DerivationPath, Xpriv},
    secp256k1::{PublicKey, SecretKey, XOnlyPublicKey},
    Address, CompressedPublicKey, Network, PrivateKey, Script, ScriptBuf,
};
use bdk_wallet::keys::{
    bip39::{Language, Mnemonic},
    DerivableKey, ExtendedKey,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::ecc::Secp;
use crate::error::{PayoutError, Result};

/// Output script families the pipeline understands.
///
/// Classified once when a UTXO is normalised and carried as typed data from
/// then on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptType {
    P2wpkh,
    P2tr,
    /// P2SH that is not our own wrapped P2WPKH; never spendable here.
    P2sh,
    P2shP2wpkh,
    P2pkh,
}

impl ScriptType {
    /// Script types we can derive keys for and sign.
    pub const SIGNABLE: [ScriptType; 4] = [
        ScriptType::P2pkh,
        ScriptType::P2shP2wpkh,
        ScriptType::P2wpkh,
        ScriptType::P2tr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::P2wpkh => "p2wpkh",
            ScriptType::P2tr => "p2tr",
            ScriptType::P2sh => "p2sh",
            ScriptType::P2shP2wpkh => "p2sh-p2wpkh",
            ScriptType::P2pkh => "p2pkh",
        }
    }

    /// BIP44-family purpose number.
    pub fn purpose(&self) -> Option<u32> {
        match self {
            ScriptType::P2pkh => Some(44),
            ScriptType::P2shP2wpkh => Some(49),
            ScriptType::P2wpkh => Some(84),
            ScriptType::P2tr => Some(86),
            ScriptType::P2sh => None,
        }
    }

    pub fn is_segwit(&self) -> bool {
        matches!(
            self,
            ScriptType::P2wpkh | ScriptType::P2tr | ScriptType::P2shP2wpkh
        )
    }

    /// Classify a scriptPubKey.
    ///
    /// `redeem_script` is the caller's own wrapped P2WPKH script, used to
    /// tell P2SH-P2WPKH apart from arbitrary P2SH.
    pub fn classify(script_pubkey: &Script, redeem_script: Option<&Script>) -> Option<Self> {
        if script_pubkey.is_p2wpkh() {
            Some(ScriptType::P2wpkh)
        } else if script_pubkey.is_p2tr() {
            Some(ScriptType::P2tr)
        } else if script_pubkey.is_p2pkh() {
            Some(ScriptType::P2pkh)
        } else if script_pubkey.is_p2sh() {
            let wrapped = redeem_script
                .filter(|redeem| redeem.is_p2wpkh())
                .map(|redeem| ScriptBuf::new_p2sh(&redeem.script_hash()).as_script() == script_pubkey)
                .unwrap_or(false);
            if wrapped {
                Some(ScriptType::P2shP2wpkh)
            } else {
                Some(ScriptType::P2sh)
            }
        } else {
            None
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptType {
    type Err = PayoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "p2wpkh" | "segwit" => Ok(ScriptType::P2wpkh),
            "p2tr" | "taproot" => Ok(ScriptType::P2tr),
            "p2sh" => Ok(ScriptType::P2sh),
            "p2sh-p2wpkh" | "nested" => Ok(ScriptType::P2shP2wpkh),
            "p2pkh" | "legacy" => Ok(ScriptType::P2pkh),
            other => Err(PayoutError::InvalidInput(format!(
                "unknown script type: {}",
                other
            ))),
        }
    }
}

/// Public description of a funding address; carries no private material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingAddress {
    pub address: Address,
    pub script_type: ScriptType,
    pub script_pubkey: ScriptBuf,
    /// Embedded P2WPKH script, only for P2SH-P2WPKH.
    pub redeem_script: Option<ScriptBuf>,
    /// x-only internal key, only for P2TR.
    pub tap_internal_key: Option<XOnlyPublicKey>,
}

/// Signing material for one script type.
///
/// Derived once per operation and never persisted. The secret key is erased
/// when the wallet is dropped.
pub struct SigningWallet {
    script_type: ScriptType,
    network: Network,
    address: Address,
    secret_key: SecretKey,
    public_key: PublicKey,
    tap_internal_key: Option<XOnlyPublicKey>,
    derivation_path: Option<DerivationPath>,
}

impl SigningWallet {
    /// Build a wallet for `script_type` around a single secret key.
    pub fn from_secret_key(
        secp: &Secp,
        secret_key: SecretKey,
        script_type: ScriptType,
        network: Network,
    ) -> Result<Self> {
        let public_key = PublicKey::from_secret_key(secp, &secret_key);
        let compressed = CompressedPublicKey(public_key);

        let (address, tap_internal_key) = match script_type {
            ScriptType::P2pkh => (
                Address::p2pkh(bdk_wallet::bitcoin::PublicKey::new(public_key).pubkey_hash(), network),
                None,
            ),
            ScriptType::P2shP2wpkh => (Address::p2shwpkh(&compressed, network), None),
            ScriptType::P2wpkh => (Address::p2wpkh(&compressed, network), None),
            ScriptType::P2tr => {
                // The 33-byte key drops its parity byte; addresses and
                // signing reference this x-only internal key.
                let (internal_key, _parity) = public_key.x_only_public_key();
                (
                    Address::p2tr(secp, internal_key, None, network),
                    Some(internal_key),
                )
            }
            ScriptType::P2sh => {
                return Err(PayoutError::InvalidInput(
                    "bare P2SH has no single-key signing wallet".to_string(),
                ))
            }
        };

        Ok(Self {
            script_type,
            network,
            address,
            secret_key,
            public_key,
            tap_internal_key,
            derivation_path: None,
        })
    }

    /// Derive the wallet for `script_type` from a BIP32 master key.
    pub fn derive(
        secp: &Secp,
        master: &Xpriv,
        script_type: ScriptType,
        network: Network,
    ) -> Result<Self> {
        let path = derivation_path(script_type, network)?;
        let child = master
            .derive_priv(secp, &path)
            .map_err(|e| PayoutError::KeyDerivation(format!("{}: {}", path, e)))?;

        let mut wallet = Self::from_secret_key(secp, child.private_key, script_type, network)?;
        wallet.derivation_path = Some(path);
        Ok(wallet)
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn tap_internal_key(&self) -> Option<XOnlyPublicKey> {
        self.tap_internal_key
    }

    pub fn derivation_path(&self) -> Option<&DerivationPath> {
        self.derivation_path.as_ref()
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Embedded P2WPKH script for P2SH-P2WPKH wallets.
    pub fn redeem_script(&self) -> Option<ScriptBuf> {
        match self.script_type {
            ScriptType::P2shP2wpkh => Some(ScriptBuf::new_p2wpkh(
                &CompressedPublicKey(self.public_key).wpubkey_hash(),
            )),
            _ => None,
        }
    }

    /// Public view handed to UTXO sources and assembly.
    pub fn funding(&self) -> FundingAddress {
        FundingAddress {
            address: self.address.clone(),
            script_type: self.script_type,
            script_pubkey: self.script_pubkey(),
            redeem_script: self.redeem_script(),
            tap_internal_key: self.tap_internal_key,
        }
    }
}

impl fmt::Debug for SigningWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningWallet")
            .field("script_type", &self.script_type)
            .field("address", &self.address.to_string())
            .field("public_key", &self.public_key)
            .field("derivation_path", &self.derivation_path)
            .finish_non_exhaustive()
    }
}

impl Drop for SigningWallet {
    fn drop(&mut self) {
        self.secret_key.non_secure_erase();
    }
}

/// Where signing material comes from.
pub enum KeySource {
    Mnemonic {
        phrase: Zeroizing<String>,
        passphrase: Option<Zeroizing<String>>,
    },
    /// WIF or 64-char hex.
    SecretKey(Zeroizing<String>),
}

impl KeySource {
    /// Treat multi-word input as a mnemonic, anything else as a single key.
    pub fn detect(raw: &str, passphrase: Option<&str>) -> Self {
        let trimmed = raw.trim();
        if trimmed.split_whitespace().count() > 1 {
            KeySource::Mnemonic {
                phrase: Zeroizing::new(trimmed.to_string()),
                passphrase: passphrase.map(|p| Zeroizing::new(p.to_string())),
            }
        } else {
            KeySource::SecretKey(Zeroizing::new(trimmed.to_string()))
        }
    }

    /// Produce the signing wallet for one script type.
    ///
    /// Mnemonic checksums are validated here, before any network call.
    pub fn signing_wallet(
        &self,
        secp: &Secp,
        script_type: ScriptType,
        network: Network,
    ) -> Result<SigningWallet> {
        match self {
            KeySource::Mnemonic { phrase, passphrase } => {
                let mnemonic = parse_mnemonic(phrase)?;
                let master = master_key(&mnemonic, passphrase.as_deref().map(String::as_str), network)?;
                SigningWallet::derive(secp, &master, script_type, network)
            }
            KeySource::SecretKey(raw) => {
                let secret_key = parse_secret_key(raw)?;
                SigningWallet::from_secret_key(secp, secret_key, script_type, network)
            }
        }
    }

    /// One signing wallet per signable script type.
    pub fn derive_all(&self, secp: &Secp, network: Network) -> Result<Vec<SigningWallet>> {
        ScriptType::SIGNABLE
            .iter()
            .map(|script_type| self.signing_wallet(secp, *script_type, network))
            .collect()
    }
}

/// Parse and checksum-validate an English BIP39 phrase.
pub fn parse_mnemonic(phrase: &str) -> Result<Mnemonic> {
    Mnemonic::parse_in(Language::English, phrase.trim())
        .map_err(|e| PayoutError::InvalidMnemonic(e.to_string()))
}

/// BIP32 master key for a mnemonic and optional passphrase.
pub fn master_key(mnemonic: &Mnemonic, passphrase: Option<&str>, network: Network) -> Result<Xpriv> {
    let xkey: ExtendedKey = (mnemonic.clone(), passphrase.map(str::to_string))
        .into_extended_key()
        .map_err(|e| PayoutError::KeyDerivation(e.to_string()))?;
    xkey.into_xprv(network)
        .ok_or_else(|| PayoutError::KeyDerivation("mnemonic did not yield a private key".to_string()))
}

/// Parse a private key from WIF or raw hex.
pub fn parse_secret_key(raw: &str) -> Result<SecretKey> {
    let raw = raw.trim();

    if raw.len() == 51 || raw.len() == 52 {
        if let Ok(wif) = PrivateKey::from_wif(raw) {
            // every address here is built from the compressed public key
            if !wif.compressed {
                return Err(PayoutError::InvalidKey(
                    "uncompressed WIF keys are not supported".to_string(),
                ));
            }
            return Ok(wif.inner);
        }
    }

    if raw.len() == 64 {
        let bytes = Zeroizing::new(
            hex::decode(raw).map_err(|e| PayoutError::InvalidKey(format!("bad hex: {}", e)))?,
        );
        return SecretKey::from_slice(&bytes)
            .map_err(|e| PayoutError::InvalidKey(e.to_string()));
    }

    Err(PayoutError::InvalidKey(
        "expected a WIF key or 64 hex characters".to_string(),
    ))
}

/// Standard derivation path for `script_type`: `m/purpose'/coin'/0'/0/0`.
pub fn derivation_path(script_type: ScriptType, network: Network) -> Result<DerivationPath> {
    let purpose = script_type.purpose().ok_or_else(|| {
        PayoutError::InvalidInput(format!("no derivation path for {}", script_type))
    })?;
    let coin_type = if network == Network::Bitcoin { 0 } else { 1 };
    DerivationPath::from_str(&format!("m/{}h/{}h/0h/0/0", purpose, coin_type))
        .map_err(|e| PayoutError::KeyDerivation(e.to_string()))
}
