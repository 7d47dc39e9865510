//! Esplora / mempool.space REST client
//!
//! Implements the three network collaborators the pipeline needs:
//! UTXO listing, recommended fee rates and raw transaction relay.

use std::time::Duration;

use async_trait::async_trait;
use bdk_wallet::bitcoin::{consensus, Network, Transaction, Txid};
use serde::de::DeserializeOwned;

use crate::broadcast::Broadcaster;
use crate::error::{PayoutError, Result};
use crate::fee::{FeeRateSource, RecommendedFees};
use crate::http::{retry, RetryPolicy};
use crate::keys::{FundingAddress, ScriptType};
use crate::utxo::{IndexerUtxo, Utxo, UtxoSource};

pub struct EsploraClient {
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl EsploraClient {
    /// Create a client for `base_url` (e.g. `https://mempool.space/api`).
    pub fn new(base_url: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("payout-psbt/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            retry,
        })
    }

    /// Public mempool.space endpoint for `network`; a local electrs for regtest.
    pub fn default_url(network: Network) -> &'static str {
        match network {
            Network::Bitcoin => "https://mempool.space/api",
            Network::Testnet => "https://mempool.space/testnet/api",
            Network::Signet => "https://mempool.space/signet/api",
            _ => "http://127.0.0.1:3002",
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let (client, url) = (&self.client, url.as_str());
        retry(&self.retry, &format!("GET {}", path), move || async move {
            let response = client.get(url).send().await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(PayoutError::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(body)
        })
        .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.get_text(path).await?;
        serde_json::from_str(&body)
            .map_err(|e| PayoutError::InvalidInput(format!("unexpected response from {}: {}", path, e)))
    }

    /// Full previous transaction, needed to sign legacy inputs.
    pub async fn fetch_transaction(&self, txid: &Txid) -> Result<Transaction> {
        let hex = self.get_text(&format!("/tx/{}/hex", txid)).await?;
        let bytes = hex::decode(hex.trim())
            .map_err(|e| PayoutError::InvalidInput(format!("transaction {} is not hex: {}", txid, e)))?;
        consensus::deserialize(&bytes)
            .map_err(|e| PayoutError::InvalidInput(format!("transaction {} does not decode: {}", txid, e)))
    }
}

#[async_trait]
impl UtxoSource for EsploraClient {
    async fn list_utxos(&self, funding: &FundingAddress) -> Result<Vec<Utxo>> {
        let listed: Vec<IndexerUtxo> = self
            .get_json(&format!("/address/{}/utxo", funding.address))
            .await?;

        let mut utxos = Vec::with_capacity(listed.len());
        for entry in listed {
            let prev_tx = if funding.script_type == ScriptType::P2pkh {
                Some(self.fetch_transaction(&entry.txid).await?)
            } else {
                None
            };
            utxos.push(entry.normalize(funding, prev_tx));
        }

        tracing::info!(
            "💰 {} UTXOs ({} sats) at {}",
            utxos.len(),
            utxos.iter().map(|u| u.value.to_sat()).sum::<u64>(),
            funding.address
        );
        Ok(utxos)
    }
}

#[async_trait]
impl FeeRateSource for EsploraClient {
    async fn recommended_fees(&self) -> Result<RecommendedFees> {
        self.get_json("/v1/fees/recommended").await
    }

    fn name(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Broadcaster for EsploraClient {
    async fn submit(&self, raw_hex: &str) -> Result<String> {
        let url = format!("{}/tx", self.base_url);
        // Resending identical bytes is harmless, so transient relay errors
        // are retried like reads.
        let (client, url) = (&self.client, url.as_str());
        retry(&self.retry, "POST /tx", move || async move {
            let response = client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(raw_hex.to_string())
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(PayoutError::BroadcastRejected {
                    status: status.as_u16(),
                    message: body,
                });
            }
            Ok(body.trim().to_string())
        })
        .await
    }

    fn name(&self) -> &str {
        &self.base_url
    }
}
