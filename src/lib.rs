// Library interface for payout-psbt
// Exposes the pipeline stages and their collaborators for the CLI and tests

pub mod allocation;
pub mod audit;
pub mod broadcast;
pub mod config;
pub mod ecc;
pub mod error;
pub mod esplora;
pub mod fee;
pub mod http;
pub mod keys;
pub mod locks;
pub mod payout;
pub mod psbt;
pub mod utxo;

pub use error::{PayoutError, Result};
pub use keys::{KeySource, ScriptType, SigningWallet};
pub use payout::{PayoutRequest, PayoutService, RunOutcome, RunReport};
