//! Per-wallet spend locks
//!
//! Two builds from the same source wallet would select overlapping UTXOs and
//! the second broadcast would be rejected as a double spend. A build holds
//! its wallet's lock from UTXO fetch until broadcast or abandonment; builds
//! for different wallets run freely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for the duration of one spend from one wallet.
#[derive(Debug)]
pub struct WalletGuard {
    wallet: String,
    _guard: OwnedMutexGuard<()>,
}

impl WalletGuard {
    pub fn wallet(&self) -> &str {
        &self.wallet
    }
}

impl Drop for WalletGuard {
    fn drop(&mut self) {
        tracing::debug!("🔓 Released spend lock for {}", self.wallet);
    }
}

#[derive(Clone, Default)]
pub struct WalletLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl WalletLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, wallet: &str) -> Arc<AsyncMutex<()>> {
        // a poisoned map still holds valid mutexes
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(wallet.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive use of `wallet`.
    pub async fn acquire(&self, wallet: &str) -> WalletGuard {
        let lock = self.lock_for(wallet);
        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::info!("⏳ Another spend from {} is in flight; waiting", wallet);
                lock.lock_owned().await
            }
        };
        tracing::debug!("🔒 Acquired spend lock for {}", wallet);
        WalletGuard {
            wallet: wallet.to_string(),
            _guard: guard,
        }
    }

    /// Exclusive use of `wallet` if nobody holds it right now.
    pub fn try_acquire(&self, wallet: &str) -> Option<WalletGuard> {
        self.lock_for(wallet)
            .try_lock_owned()
            .ok()
            .map(|guard| WalletGuard {
                wallet: wallet.to_string(),
                _guard: guard,
            })
    }
}
