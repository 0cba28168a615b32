//! StoreVault: the in-memory store key.
//!
//! Holds the 32-byte column encryption key while an identity session
//! is open; cleared (and zeroized) on identity unload and shutdown.

use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use crate::error::StoreError;

#[derive(ZeroizeOnDrop)]
struct VaultInner {
    key: [u8; 32],
}

/// Thread-safe store key handle. Clone to share.
#[derive(Clone, Default)]
pub struct StoreVault {
    inner: Arc<RwLock<Option<VaultInner>>>,
}

impl StoreVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the store key (identity load).
    pub async fn unlock(&self, key: [u8; 32]) {
        let mut guard = self.inner.write().await;
        *guard = Some(VaultInner { key });
    }

    /// Drop and zeroize the key (identity unload / shutdown).
    pub async fn lock(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.read().await.is_none()
    }

    /// Run `f` with the raw key.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, StoreError>,
    {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(inner) => f(&inner.key),
            None => Err(StoreError::KeyNotLoaded),
        }
    }
}
