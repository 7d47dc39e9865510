//! Spendable output records and the UTXO source collaborator

use std::fmt;

use async_trait::async_trait;
use bdk_wallet::bitcoin::{Address, Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use serde::Deserialize;

use crate::error::Result;
use crate::keys::{FundingAddress, ScriptType};

/// A spendable output owned by a funding address.
///
/// Immutable once fetched. `prev_tx` is only populated for legacy P2PKH,
/// whose signing commits to the full previous transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
    pub script_type: ScriptType,
    pub address: Address,
    pub confirmed: bool,
    pub prev_tx: Option<Transaction>,
}

impl Utxo {
    pub fn txout(&self) -> TxOut {
        TxOut {
            value: self.value,
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

impl fmt::Display for Utxo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} sats, {}{})",
            self.outpoint,
            self.value.to_sat(),
            self.script_type,
            if self.confirmed { "" } else { ", unconfirmed" }
        )
    }
}

/// Output as returned by an esplora `/address/{addr}/utxo` listing.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexerUtxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
    #[serde(default)]
    pub status: IndexerStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexerStatus {
    #[serde(default)]
    pub confirmed: bool,
    pub block_height: Option<u32>,
}

impl IndexerUtxo {
    /// Attach the funding address's script and classification.
    ///
    /// The indexer does not report scripts for address listings, so every
    /// output inherits the funding script, already classified.
    pub fn normalize(self, funding: &FundingAddress, prev_tx: Option<Transaction>) -> Utxo {
        Utxo {
            outpoint: OutPoint::new(self.txid, self.vout),
            value: Amount::from_sat(self.value),
            script_pubkey: funding.script_pubkey.clone(),
            script_type: funding.script_type,
            address: funding.address.clone(),
            confirmed: self.status.confirmed,
            prev_tx,
        }
    }
}

/// External indexing service that lists spendable outputs for an address.
#[async_trait]
pub trait UtxoSource: Send + Sync {
    async fn list_utxos(&self, funding: &FundingAddress) -> Result<Vec<Utxo>>;
}
