//! Error taxonomy for transaction building, signing and broadcast.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the payout pipeline.
///
/// Key and mnemonic errors are fatal and never retried. Network errors are
/// classified by [`crate::http::Retryable`].
#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("insufficient funds: need {needed} sats, have {available} sats (short by {shortfall} sats)")]
    InsufficientFunds {
        needed: u64,
        available: u64,
        shortfall: u64,
    },

    #[error("no eligible recipients")]
    NoEligibleRecipients,

    #[error("all payouts from a {pool} sat pool across {recipients} recipients fall below the dust limit")]
    DustAllocation { pool: u64, recipients: usize },

    #[error("cannot spend {outpoint}: unsupported script type {script_type}")]
    UnsupportedScript {
        outpoint: String,
        script_type: String,
    },

    #[error("legacy input {outpoint} has no matching previous transaction")]
    MissingPreviousTransaction { outpoint: String },

    #[error("signing input {index} failed: {reason}")]
    SigningFailure { index: usize, reason: String },

    #[error("finalizing input {index} failed: {reason}")]
    FinalizationError { index: usize, reason: String },

    #[error("relay rejected transaction (HTTP {status}): {message}")]
    BroadcastRejected { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    NetworkTimeout(Duration),

    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("PSBT error: {0}")]
    Psbt(String),

    #[error("audit store error: {0}")]
    Audit(#[from] rusqlite::Error),

    #[error("audit store unavailable: {0}")]
    AuditUnavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, PayoutError>;
