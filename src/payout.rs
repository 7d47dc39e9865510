//! Payout and send orchestration
//!
//! One run goes: allocate, lock the source wallet, fetch UTXOs and the fee
//! rate together, select, assemble, sign, finalize, then (unless this is a
//! dry run) journal, broadcast and record. The outcome tells the caller
//! which of three states the run ended in:
//!
//! - [`RunOutcome::Built`]: never sent, nothing written;
//! - [`RunOutcome::Unknown`]: broadcast failed, txid and hex preserved for
//!   manual resubmission;
//! - [`RunOutcome::Broadcast`]: accepted by the relay, audit written.

use std::sync::Arc;

use bdk_wallet::bitcoin::{psbt::Psbt, Address, Amount, Network, ScriptBuf, Txid};
use tracing::{info, warn};

use crate::allocation::{allocate_over, AllocationPlan, DustPolicy, Recipient};
use crate::audit::{AllocationRecord, AuditSink, PayoutRecord};
use crate::broadcast::{broadcast, BroadcastFailure, Broadcaster};
use crate::ecc::Secp;
use crate::error::{PayoutError, Result};
use crate::fee::{FeeEstimate, FeeEstimator, FeeTier};
use crate::keys::FundingAddress;
use crate::locks::{WalletGuard, WalletLocks};
use crate::psbt::{
    assemble, finalize_psbt, select_utxos, signer::sign_draft, DraftOutput, FinalizedTransaction,
    OutputKind, PayoutOutput, SelectionConfig, Signer, TransactionDraft,
};
use crate::utxo::UtxoSource;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Dry run: built and signed, never broadcast, nothing recorded.
    Built { tx: FinalizedTransaction },
    /// The relay did not accept the transaction. It may still have
    /// propagated, so the bytes are kept for resubmission.
    Unknown {
        txid: Txid,
        raw_hex: String,
        error: BroadcastFailure,
    },
    /// Accepted by the relay. `audit_error` is set if recording failed
    /// afterwards; the transaction is out either way.
    Broadcast {
        txid: Txid,
        raw_hex: String,
        audit_error: Option<String>,
    },
}

impl RunOutcome {
    pub fn txid(&self) -> Txid {
        match self {
            RunOutcome::Built { tx } => tx.txid,
            RunOutcome::Unknown { txid, .. } | RunOutcome::Broadcast { txid, .. } => *txid,
        }
    }

    pub fn raw_hex(&self) -> &str {
        match self {
            RunOutcome::Built { tx } => &tx.raw_hex,
            RunOutcome::Unknown { raw_hex, .. } | RunOutcome::Broadcast { raw_hex, .. } => raw_hex,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, RunOutcome::Broadcast { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub allocation: Option<AllocationPlan>,
    pub outputs: Vec<DraftOutput>,
    pub fee: Amount,
    pub change: Amount,
    pub fee_estimate: Option<FeeEstimate>,
}

#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub pool: Amount,
    pub recipients: Vec<Recipient>,
    /// Explicit weight basis, e.g. total supply. Defaults to the sum of weights.
    pub basis: Option<u64>,
    pub dry_run: bool,
}

/// An unsigned draft waiting on an external wallet. Holds the source
/// wallet's lock until it is submitted or dropped.
pub struct PendingSpend {
    draft: TransactionDraft,
    funding: FundingAddress,
    fee_estimate: FeeEstimate,
    _guard: WalletGuard,
}

impl PendingSpend {
    pub fn draft(&self) -> &TransactionDraft {
        &self.draft
    }

    /// Base64 PSBT to hand to the wallet.
    pub fn to_base64(&self) -> String {
        self.draft.to_base64()
    }
}

pub struct PayoutService {
    secp: &'static Secp,
    network: Network,
    utxos: Arc<dyn UtxoSource>,
    fees: FeeEstimator,
    broadcaster: Arc<dyn Broadcaster>,
    audit: Arc<dyn AuditSink>,
    locks: WalletLocks,
    selection: SelectionConfig,
    dust: DustPolicy,
    fee_tier: FeeTier,
}

impl PayoutService {
    pub fn new(
        secp: &'static Secp,
        network: Network,
        utxos: Arc<dyn UtxoSource>,
        fees: FeeEstimator,
        broadcaster: Arc<dyn Broadcaster>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            secp,
            network,
            utxos,
            fees,
            broadcaster,
            audit,
            locks: WalletLocks::new(),
            selection: SelectionConfig::default(),
            dust: DustPolicy::default(),
            fee_tier: FeeTier::default(),
        }
    }

    pub fn with_selection(mut self, selection: SelectionConfig) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_dust_policy(mut self, dust: DustPolicy) -> Self {
        self.dust = dust;
        self
    }

    pub fn with_fee_tier(mut self, tier: FeeTier) -> Self {
        self.fee_tier = tier;
        self
    }

    /// Share locks with other services spending from the same wallets.
    pub fn with_locks(mut self, locks: WalletLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Split `request.pool` across the recipients and pay them in one
    /// transaction funded by `signer`'s wallet.
    pub async fn run_payout(&self, signer: &dyn Signer, request: PayoutRequest) -> Result<RunReport> {
        let plan = allocate_over(request.pool, &request.recipients, request.basis, &self.dust)?;
        let outputs: Vec<PayoutOutput> = plan.payouts.iter().map(PayoutOutput::from).collect();

        info!(
            "💸 Payout of {} sats to {} recipients{}",
            plan.pool.to_sat(),
            outputs.len(),
            if request.dry_run { " (dry run)" } else { "" }
        );
        self.execute(signer, &outputs, "payout", Some(plan), request.dry_run)
            .await
    }

    /// Pay a single destination: commit funding, credit purchases.
    pub async fn send(
        &self,
        signer: &dyn Signer,
        destination: Address,
        amount: Amount,
        dry_run: bool,
    ) -> Result<RunReport> {
        let outputs = [PayoutOutput::new(destination, amount)];
        self.execute(signer, &outputs, "send", None, dry_run).await
    }

    /// Build an unsigned spend from `funding` for an external wallet to sign.
    pub async fn prepare_spend(
        &self,
        funding: FundingAddress,
        outputs: &[PayoutOutput],
    ) -> Result<PendingSpend> {
        let guard = self.locks.acquire(&funding.address.to_string()).await;
        let (draft, fee_estimate) = self.build_draft(&funding, outputs).await?;
        Ok(PendingSpend {
            draft,
            funding,
            fee_estimate,
            _guard: guard,
        })
    }

    /// Finalize and publish a PSBT the external wallet signed for `pending`.
    pub async fn submit_signed(
        &self,
        pending: PendingSpend,
        signed: Psbt,
        dry_run: bool,
    ) -> Result<RunReport> {
        let PendingSpend {
            draft,
            funding,
            fee_estimate,
            _guard,
        } = pending;
        let signed = draft.with_signed_psbt(signed)?;
        let (fee, change, outputs) = (signed.fee(), signed.change(), signed.outputs().to_vec());
        let finalized = signed.finalize(self.secp)?;

        let outcome = self
            .publish(finalized, "send", &funding, None, &outputs, fee, change, dry_run)
            .await?;
        Ok(RunReport {
            outcome,
            allocation: None,
            outputs,
            fee,
            change,
            fee_estimate: Some(fee_estimate),
        })
    }

    /// Finalize a PSBT built and signed elsewhere and publish it.
    pub async fn finalize_and_publish(&self, psbt: Psbt, dry_run: bool) -> Result<RunReport> {
        let fee = psbt.fee().map_err(|e| PayoutError::Psbt(e.to_string()))?;
        let source = spent_script(&psbt)
            .and_then(|script| Address::from_script(&script, self.network).ok())
            .map(|address| address.to_string())
            .unwrap_or_else(|| "external".to_string());
        let _guard = self.locks.acquire(&source).await;

        let outputs: Vec<DraftOutput> = psbt
            .unsigned_tx
            .output
            .iter()
            .enumerate()
            .map(|(index, out)| DraftOutput {
                index,
                script_pubkey: out.script_pubkey.clone(),
                amount: out.value,
                kind: OutputKind::Payout { recipient_key: None },
            })
            .collect();

        let finalized = finalize_psbt(self.secp, psbt)?;
        let outcome = if dry_run {
            RunOutcome::Built { tx: finalized }
        } else {
            self.journal_and_broadcast(finalized, "external", &source, None)
                .await?
        };
        Ok(RunReport {
            outcome,
            allocation: None,
            outputs,
            fee,
            change: Amount::ZERO,
            fee_estimate: None,
        })
    }

    async fn execute(
        &self,
        signer: &dyn Signer,
        outputs: &[PayoutOutput],
        kind: &str,
        plan: Option<AllocationPlan>,
        dry_run: bool,
    ) -> Result<RunReport> {
        let funding = signer.funding();
        let _guard = self.locks.acquire(&funding.address.to_string()).await;

        let (draft, fee_estimate) = self.build_draft(&funding, outputs).await?;
        let signed = sign_draft(draft, signer).await?;
        let (fee, change, draft_outputs) = (signed.fee(), signed.change(), signed.outputs().to_vec());
        let finalized = signed.finalize(self.secp)?;

        let outcome = self
            .publish(
                finalized,
                kind,
                &funding,
                plan.as_ref(),
                &draft_outputs,
                fee,
                change,
                dry_run,
            )
            .await?;

        Ok(RunReport {
            outcome,
            allocation: plan,
            outputs: draft_outputs,
            fee,
            change,
            fee_estimate: Some(fee_estimate),
        })
    }

    async fn build_draft(
        &self,
        funding: &FundingAddress,
        outputs: &[PayoutOutput],
    ) -> Result<(TransactionDraft, FeeEstimate)> {
        let (utxos, fee_estimate) = tokio::join!(
            self.utxos.list_utxos(funding),
            self.fees.estimate(self.fee_tier)
        );
        let utxos = utxos?;

        let target: Amount = outputs.iter().map(|o| o.amount).sum();
        let scripts: Vec<_> = outputs.iter().map(|o| o.address.script_pubkey()).collect();
        let selection = select_utxos(
            &utxos,
            target,
            fee_estimate.rate_sat_vb,
            &scripts,
            &funding.script_pubkey,
            &self.selection,
            &self.dust,
        )?;

        let draft = assemble(&selection.selected, outputs, funding, selection.fee, &self.dust)?;
        Ok((draft, fee_estimate))
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish(
        &self,
        finalized: FinalizedTransaction,
        kind: &str,
        funding: &FundingAddress,
        plan: Option<&AllocationPlan>,
        outputs: &[DraftOutput],
        fee: Amount,
        change: Amount,
        dry_run: bool,
    ) -> Result<RunOutcome> {
        if dry_run {
            info!(
                "🧪 Dry run: built {} ({} sats fee), not broadcasting",
                finalized.txid,
                fee.to_sat()
            );
            return Ok(RunOutcome::Built { tx: finalized });
        }

        let record = plan.map(|plan| PayoutRecord {
            txid: finalized.txid,
            pool_sats: plan.pool.to_sat(),
            fee_sats: fee.to_sat(),
            change_sats: change.to_sat(),
            allocations: allocation_records(outputs, self.network),
        });

        self.journal_and_broadcast(finalized, kind, &funding.address.to_string(), record)
            .await
    }

    async fn journal_and_broadcast(
        &self,
        finalized: FinalizedTransaction,
        kind: &str,
        source: &str,
        record: Option<PayoutRecord>,
    ) -> Result<RunOutcome> {
        // no journal entry, no broadcast
        self.audit
            .record_attempt(&finalized.txid, &finalized.raw_hex, kind, source)?;

        let result = broadcast(self.broadcaster.as_ref(), &finalized).await;
        let FinalizedTransaction { txid, raw_hex, .. } = finalized;

        if let Some(error) = result.error {
            if let Err(e) = self.audit.mark_failed(&txid, &error.message) {
                warn!("Could not mark {} as failed: {}", txid, e);
            }
            warn!("⚠️  {} was not accepted; raw transaction kept for resubmission", txid);
            return Ok(RunOutcome::Unknown {
                txid,
                raw_hex,
                error,
            });
        }

        let recorded = match &record {
            Some(record) => self.audit.record_payout(record),
            None => self.audit.mark_broadcast(&txid),
        };
        let audit_error = recorded.err().map(|e| {
            warn!("Transaction {} is out but recording it failed: {}", txid, e);
            e.to_string()
        });

        Ok(RunOutcome::Broadcast {
            txid,
            raw_hex,
            audit_error,
        })
    }
}

/// Script of the output spent by the first input.
fn spent_script(psbt: &Psbt) -> Option<ScriptBuf> {
    let input = psbt.inputs.first()?;
    if let Some(utxo) = &input.witness_utxo {
        return Some(utxo.script_pubkey.clone());
    }
    let vout = psbt.unsigned_tx.input.first()?.previous_output.vout as usize;
    input
        .non_witness_utxo
        .as_ref()
        .and_then(|prev| prev.output.get(vout))
        .map(|out| out.script_pubkey.clone())
}

fn allocation_records(outputs: &[DraftOutput], network: Network) -> Vec<AllocationRecord> {
    outputs
        .iter()
        .filter_map(|output| match &output.kind {
            OutputKind::Payout {
                recipient_key: Some(key),
            } => Some(AllocationRecord {
                output_index: output.index as u32,
                recipient_key: key.clone(),
                address: Address::from_script(&output.script_pubkey, network)
                    .map(|address| address.to_string())
                    .unwrap_or_else(|_| output.script_pubkey.to_hex_string()),
                amount_sats: output.amount.to_sat(),
            }),
            _ => None,
        })
        .collect()
}
