//! Payout audit trail
//!
//! Two kinds of record, written at different points of a run:
//!
//! - `broadcast_attempts`: a journal entry written after signing and before
//!   broadcast (status `pending`), then moved to `broadcast` or `failed`.
//!   A crash between signing and broadcast leaves the txid and raw hex on
//!   disk so the attempt can be checked or resubmitted.
//! - `payout_runs` / `payout_allocations`: the payout history, written only
//!   after the relay accepted the transaction.
//!
//! Dry runs write nothing at all.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use bdk_wallet::bitcoin::Txid;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{PayoutError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Broadcast,
    Failed,
}

impl AttemptStatus {
    fn to_str(self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Broadcast => "broadcast",
            AttemptStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AttemptStatus::Pending),
            "broadcast" => Some(AttemptStatus::Broadcast),
            "failed" => Some(AttemptStatus::Failed),
            _ => None,
        }
    }
}

/// Journal entry for one signed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastAttempt {
    pub txid: Txid,
    pub raw_hex: String,
    /// "payout" or "send".
    pub kind: String,
    pub source_address: String,
    pub status: AttemptStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub output_index: u32,
    pub recipient_key: String,
    pub address: String,
    pub amount_sats: u64,
}

/// Payout summary handed to the audit trail after a successful broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutRecord {
    pub txid: Txid,
    pub pool_sats: u64,
    pub fee_sats: u64,
    pub change_sats: u64,
    pub allocations: Vec<AllocationRecord>,
}

/// Persistence collaborator for the payout pipeline.
pub trait AuditSink: Send + Sync {
    /// Journal a signed transaction as pending, before it is broadcast.
    fn record_attempt(&self, txid: &Txid, raw_hex: &str, kind: &str, source_address: &str) -> Result<()>;

    /// The relay accepted the transaction.
    fn mark_broadcast(&self, txid: &Txid) -> Result<()>;

    /// The relay did not accept the transaction.
    fn mark_failed(&self, txid: &Txid, error: &str) -> Result<()>;

    /// Write the payout run and its allocations, and mark the attempt
    /// broadcast. Only called after a successful broadcast.
    fn record_payout(&self, record: &PayoutRecord) -> Result<()>;
}

/// SQLite-backed audit store.
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    /// Create or open an audit database
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PayoutError::AuditUnavailable(format!("{}: {}", parent.display(), e))
                })?;
            }
        }
        Self::init(Connection::open(db_path.as_ref())?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS broadcast_attempts (
                txid TEXT PRIMARY KEY,
                raw_hex TEXT NOT NULL,
                kind TEXT NOT NULL,
                source_address TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attempt_status ON broadcast_attempts(status);

            CREATE TABLE IF NOT EXISTS payout_runs (
                txid TEXT PRIMARY KEY,
                pool_sats INTEGER NOT NULL,
                fee_sats INTEGER NOT NULL,
                change_sats INTEGER NOT NULL,
                recipient_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS payout_allocations (
                txid TEXT NOT NULL,
                output_index INTEGER NOT NULL,
                recipient_key TEXT NOT NULL,
                address TEXT NOT NULL,
                amount_sats INTEGER NOT NULL,
                PRIMARY KEY (txid, output_index)
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PayoutError::AuditUnavailable("audit connection lock poisoned".to_string()))
    }

    fn set_status(&self, txid: &Txid, status: AttemptStatus, error: Option<&str>) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE broadcast_attempts SET status = ?1, error = ?2, updated_at = ?3 WHERE txid = ?4",
            params![status.to_str(), error, now(), txid.to_string()],
        )?;
        if updated == 0 {
            tracing::warn!("No journal entry for {} while marking it {}", txid, status.to_str());
        }
        Ok(())
    }

    /// Journal entry for `txid`, if any.
    pub fn attempt(&self, txid: &Txid) -> Result<Option<BroadcastAttempt>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT raw_hex, kind, source_address, status, error
                 FROM broadcast_attempts WHERE txid = ?1",
                params![txid.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(raw_hex, kind, source_address, status, error)| {
            let status = AttemptStatus::parse(&status).ok_or_else(|| {
                PayoutError::AuditUnavailable(format!("unknown attempt status {}", status))
            })?;
            Ok(BroadcastAttempt {
                txid: *txid,
                raw_hex,
                kind,
                source_address,
                status,
                error,
            })
        })
        .transpose()
    }

    pub fn count_attempts(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM broadcast_attempts", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count_payout_runs(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM payout_runs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Allocations written for a payout run, by output index.
    pub fn allocations(&self, txid: &Txid) -> Result<Vec<AllocationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT output_index, recipient_key, address, amount_sats
             FROM payout_allocations WHERE txid = ?1 ORDER BY output_index",
        )?;
        let rows = stmt.query_map(params![txid.to_string()], |row| {
            Ok(AllocationRecord {
                output_index: row.get(0)?,
                recipient_key: row.get(1)?,
                address: row.get(2)?,
                amount_sats: row.get::<_, i64>(3)? as u64,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

impl AuditSink for SqliteAuditStore {
    fn record_attempt(&self, txid: &Txid, raw_hex: &str, kind: &str, source_address: &str) -> Result<()> {
        let timestamp = now();
        // re-journaling the same bytes keeps the original row
        self.conn()?.execute(
            "INSERT OR IGNORE INTO broadcast_attempts
             (txid, raw_hex, kind, source_address, status, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', NULL, ?5, ?5)",
            params![txid.to_string(), raw_hex, kind, source_address, timestamp],
        )?;
        tracing::debug!("📝 Journaled pending {} transaction {}", kind, txid);
        Ok(())
    }

    fn mark_broadcast(&self, txid: &Txid) -> Result<()> {
        self.set_status(txid, AttemptStatus::Broadcast, None)
    }

    fn mark_failed(&self, txid: &Txid, error: &str) -> Result<()> {
        self.set_status(txid, AttemptStatus::Failed, Some(error))
    }

    fn record_payout(&self, record: &PayoutRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let txid = record.txid.to_string();
        let timestamp = now();

        tx.execute(
            "INSERT OR REPLACE INTO payout_runs
             (txid, pool_sats, fee_sats, change_sats, recipient_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                txid,
                record.pool_sats as i64,
                record.fee_sats as i64,
                record.change_sats as i64,
                record.allocations.len() as i64,
                timestamp,
            ],
        )?;
        for allocation in &record.allocations {
            tx.execute(
                "INSERT OR REPLACE INTO payout_allocations
                 (txid, output_index, recipient_key, address, amount_sats)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    txid,
                    allocation.output_index,
                    allocation.recipient_key,
                    allocation.address,
                    allocation.amount_sats as i64,
                ],
            )?;
        }
        tx.execute(
            "UPDATE broadcast_attempts SET status = 'broadcast', error = NULL, updated_at = ?1
             WHERE txid = ?2",
            params![timestamp, txid],
        )?;
        tx.commit()?;

        tracing::info!(
            "📒 Recorded payout {}: {} sats to {} recipients",
            record.txid,
            record.pool_sats,
            record.allocations.len()
        );
        Ok(())
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
