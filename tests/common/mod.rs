#![allow(dead_code)]

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bdk_wallet::bitcoin::{
    absolute, consensus, hashes::Hash, transaction, Address, Amount, Network, OutPoint, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

use payout_psbt::allocation::Recipient;
use payout_psbt::audit::SqliteAuditStore;
use payout_psbt::broadcast::Broadcaster;
use payout_psbt::ecc;
use payout_psbt::error::{PayoutError, Result};
use payout_psbt::fee::{FeeEstimator, FeeRateSource, RecommendedFees, DEFAULT_FEE_TIMEOUT};
use payout_psbt::keys::{FundingAddress, KeySource, ScriptType, SigningWallet};
use payout_psbt::utxo::{Utxo, UtxoSource};
use payout_psbt::PayoutService;

// ============================================================
// FIXTURES
// ============================================================

/// BIP39 test vector mnemonic, never holds real funds
pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

pub const ALICE: &str = "bcrt1qzyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3lgth6c";
pub const BOB: &str = "bcrt1qyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zs4w3j0";
pub const CAROL: &str = "bcrt1qxvenxvenxvenxvenxvenxvenxvenxvenztev8a";

pub fn wallet(script_type: ScriptType) -> SigningWallet {
    KeySource::detect(TEST_MNEMONIC, None)
        .signing_wallet(ecc::init(), script_type, Network::Regtest)
        .unwrap()
}

pub fn address(raw: &str) -> Address {
    Address::from_str(raw).unwrap().require_network(Network::Regtest).unwrap()
}

pub fn recipient(key: &str, raw_address: &str, weight: u64) -> Recipient {
    Recipient {
        key: key.to_string(),
        address: address(raw_address),
        weight,
    }
}

/// Confirmed outputs paying `funding`, each in its own previous transaction.
pub fn funded_utxos(funding: &FundingAddress, values: &[u64]) -> Vec<Utxo> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let prev = Transaction {
                version: transaction::Version::TWO,
                lock_time: absolute::LockTime::ZERO,
                input: vec![TxIn {
                    previous_output: OutPoint::new(Txid::from_byte_array([i as u8 + 1; 32]), 0),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                }],
                output: vec![TxOut {
                    value: Amount::from_sat(*value),
                    script_pubkey: funding.script_pubkey.clone(),
                }],
            };
            Utxo {
                outpoint: OutPoint::new(prev.compute_txid(), 0),
                value: Amount::from_sat(*value),
                script_pubkey: funding.script_pubkey.clone(),
                script_type: funding.script_type,
                address: funding.address.clone(),
                confirmed: true,
                prev_tx: (funding.script_type == ScriptType::P2pkh).then_some(prev),
            }
        })
        .collect()
}

// ============================================================
// MOCK COLLABORATORS
// ============================================================

pub struct MockUtxoSource {
    utxos: Vec<Utxo>,
    calls: AtomicUsize,
}

impl MockUtxoSource {
    pub fn new(utxos: Vec<Utxo>) -> Self {
        Self {
            utxos,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UtxoSource for MockUtxoSource {
    async fn list_utxos(&self, funding: &FundingAddress) -> Result<Vec<Utxo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .utxos
            .iter()
            .filter(|u| u.script_pubkey == funding.script_pubkey)
            .cloned()
            .collect())
    }
}

/// Serves the same rate for every tier, or fails when `rate` is `None`.
pub struct MockFees {
    rate: Option<f64>,
    calls: AtomicUsize,
}

impl MockFees {
    pub fn new(rate: f64) -> Self {
        Self {
            rate: Some(rate),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            rate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeeRateSource for MockFees {
    async fn recommended_fees(&self) -> Result<RecommendedFees> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rate = self.rate.ok_or(PayoutError::HttpStatus {
            url: "mock://fees".to_string(),
            status: 503,
            body: "unavailable".to_string(),
        })?;
        Ok(RecommendedFees {
            fastest_fee: rate,
            half_hour_fee: rate,
            hour_fee: rate,
            economy_fee: rate,
            minimum_fee: rate,
        })
    }

    fn name(&self) -> &str {
        "mock fees"
    }
}

pub enum Reply {
    Accept,
    Reject(u16, &'static str),
}

/// Plays back scripted replies, accepting once they run out.
pub struct MockBroadcaster {
    replies: Mutex<VecDeque<Reply>>,
    submitted: Mutex<Vec<String>>,
}

impl MockBroadcaster {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broadcaster for MockBroadcaster {
    async fn submit(&self, raw_hex: &str) -> Result<String> {
        self.submitted.lock().unwrap().push(raw_hex.to_string());
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Accept);
        match reply {
            Reply::Accept => {
                let bytes = hex::decode(raw_hex).map_err(|e| PayoutError::InvalidInput(e.to_string()))?;
                let tx: Transaction =
                    consensus::deserialize(&bytes).map_err(|e| PayoutError::InvalidInput(e.to_string()))?;
                Ok(tx.compute_txid().to_string())
            }
            Reply::Reject(status, message) => Err(PayoutError::BroadcastRejected {
                status,
                message: message.to_string(),
            }),
        }
    }
}

// ============================================================
// SERVICE HARNESS
// ============================================================

pub struct Harness {
    pub service: PayoutService,
    pub utxos: Arc<MockUtxoSource>,
    pub fees: Arc<MockFees>,
    pub broadcaster: Arc<MockBroadcaster>,
    pub audit: Arc<SqliteAuditStore>,
}

pub fn harness(utxos: Vec<Utxo>, fees: MockFees, broadcaster: MockBroadcaster) -> Harness {
    let utxos = Arc::new(MockUtxoSource::new(utxos));
    let fees = Arc::new(fees);
    let broadcaster = Arc::new(broadcaster);
    let audit = Arc::new(SqliteAuditStore::in_memory().unwrap());

    let service = PayoutService::new(
        ecc::init(),
        Network::Regtest,
        utxos.clone(),
        FeeEstimator::new(fees.clone(), DEFAULT_FEE_TIMEOUT, 1.0),
        broadcaster.clone(),
        audit.clone(),
    );

    Harness {
        service,
        utxos,
        fees,
        broadcaster,
        audit,
    }
}
