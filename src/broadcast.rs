//! Relay submission
//!
//! A rejection keeps the relay's own error text so the operator can tell
//! "min relay fee not met" from "bad-txns-inputs-missingorspent". A relay
//! reporting the transaction as already known counts as success, which makes
//! re-broadcasting identical bytes idempotent.

use async_trait::async_trait;
use bdk_wallet::bitcoin::Txid;

use crate::error::{PayoutError, Result};
use crate::psbt::FinalizedTransaction;

/// Public transaction relay accepting raw hex.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Submit raw transaction hex, returning the relay's reported txid.
    ///
    /// A non-2xx answer is [`PayoutError::BroadcastRejected`] carrying the
    /// response body verbatim.
    async fn submit(&self, raw_hex: &str) -> Result<String>;

    fn name(&self) -> &str {
        "relay"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastFailure {
    /// HTTP status, when the relay answered at all.
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastResult {
    pub success: bool,
    /// Always the locally computed txid of the submitted bytes.
    pub txid: Txid,
    pub error: Option<BroadcastFailure>,
}

const ALREADY_KNOWN: [&str; 4] = [
    "txn-already-known",
    "txn-already-in-mempool",
    "already in block chain",
    "transaction already exists",
];

fn is_already_known(message: &str) -> bool {
    let message = message.to_lowercase();
    ALREADY_KNOWN.iter().any(|marker| message.contains(marker))
}

/// Submit a finalized transaction.
pub async fn broadcast(broadcaster: &dyn Broadcaster, tx: &FinalizedTransaction) -> BroadcastResult {
    tracing::info!("📡 Broadcasting transaction {} via {}", tx.txid, broadcaster.name());

    match broadcaster.submit(&tx.raw_hex).await {
        Ok(reported) => {
            if reported != tx.txid.to_string() {
                tracing::warn!(
                    "Relay reported txid {} for transaction {}; keeping the local id",
                    reported,
                    tx.txid
                );
            }
            tracing::info!("✅ Transaction {} accepted", tx.txid);
            BroadcastResult {
                success: true,
                txid: tx.txid,
                error: None,
            }
        }
        Err(PayoutError::BroadcastRejected { message, .. }) if is_already_known(&message) => {
            tracing::info!("✅ Transaction {} already known to relay", tx.txid);
            BroadcastResult {
                success: true,
                txid: tx.txid,
                error: None,
            }
        }
        Err(e) => {
            let failure = match e {
                PayoutError::BroadcastRejected { status, message } => BroadcastFailure {
                    status: Some(status),
                    message,
                },
                PayoutError::HttpStatus { status, body, .. } => BroadcastFailure {
                    status: Some(status),
                    message: body,
                },
                other => BroadcastFailure {
                    status: None,
                    message: other.to_string(),
                },
            };
            tracing::warn!(
                "❌ Broadcast of {} failed{}: {}",
                tx.txid,
                failure
                    .status
                    .map(|s| format!(" (HTTP {})", s))
                    .unwrap_or_default(),
                failure.message
            );
            BroadcastResult {
                success: false,
                txid: tx.txid,
                error: Some(failure),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdk_wallet::bitcoin::{absolute, transaction, Amount, ScriptBuf, Transaction, TxOut};

    struct Scripted(std::result::Result<String, (u16, String)>);

    #[async_trait]
    impl Broadcaster for Scripted {
        async fn submit(&self, _raw_hex: &str) -> Result<String> {
            self.0.clone().map_err(|(status, message)| PayoutError::BroadcastRejected { status, message })
        }
    }

    fn finalized() -> FinalizedTransaction {
        FinalizedTransaction::new(Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            }],
        })
    }

    #[tokio::test]
    async fn test_rejection_text_is_verbatim() {
        let tx = finalized();
        let relay = Scripted(Err((
            400,
            "sendrawtransaction RPC error: {\"code\":-26,\"message\":\"min relay fee not met\"}".to_string(),
        )));
        let result = broadcast(&relay, &tx).await;
        assert!(!result.success);
        assert_eq!(result.txid, tx.txid);
        let failure = result.error.unwrap();
        assert_eq!(failure.status, Some(400));
        assert!(failure.message.contains("min relay fee not met"));
        assert!(failure.message.starts_with("sendrawtransaction RPC error"));
    }

    #[tokio::test]
    async fn test_already_known_is_success() {
        let tx = finalized();
        let relay = Scripted(Err((400, "Transaction already in block chain".to_string())));
        let result = broadcast(&relay, &tx).await;
        assert!(result.success);
        assert_eq!(result.txid, tx.txid);
    }

    #[tokio::test]
    async fn test_local_txid_is_reported() {
        let tx = finalized();
        let relay = Scripted(Ok("not-a-txid".to_string()));
        let result = broadcast(&relay, &tx).await;
        assert!(result.success);
        assert_eq!(result.txid, tx.txid);
    }
}
