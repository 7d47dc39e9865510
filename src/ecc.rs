//! Process-wide secp256k1 context
//!
//! The context is created once at startup with [`init`] and then handed by
//! reference to every derivation, signing and verification call. Nothing in
//! the crate creates its own context.

use bdk_wallet::bitcoin::secp256k1::{All, Secp256k1};
use once_cell::sync::OnceCell;

/// Signing + verification context shared by the whole process.
pub type Secp = Secp256k1<All>;

static CONTEXT: OnceCell<Secp> = OnceCell::new();

/// Initialise the shared context. Later calls return the same context.
pub fn init() -> &'static Secp {
    CONTEXT.get_or_init(|| {
        tracing::debug!("initialising secp256k1 context");
        Secp256k1::new()
    })
}

/// The shared context, or `None` if [`init`] has not run yet.
pub fn context() -> Option<&'static Secp> {
    CONTEXT.get()
}
