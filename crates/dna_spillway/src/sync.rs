//! Smart-sync window planning and the listen registry.
//!
//! Polling fetches a window of daily buckets. A recently synced
//! contact only needs yesterday/today/tomorrow (tomorrow absorbs the
//! peer's clock skew); a stale contact gets the full retention window.
//! Listening subscribes to today's chunk-0 key per contact and rotates
//! at the day boundary (driven by the engine heartbeat).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::dht::{Dht, DhtKey, DhtRecord, ListenToken};
use crate::error::TransportError;
use crate::keys::{day_of, SECONDS_PER_DAY};

/// Contacts synced within this horizon get the short window.
pub const RECENT_SYNC_HORIZON: u64 = 3 * SECONDS_PER_DAY;

/// Hard cap on concurrent listen registrations; beyond it we fall back
/// to polling only.
pub const MAX_LISTENERS: usize = 1024;

/// Heartbeat cadence for day-rotation checks.
pub const HEARTBEAT_SECS: u64 = 240;

/// The day buckets to poll for one contact.
///
/// Recent sync: `{today-1, today, today+1}`. Otherwise the full 8-day
/// retention: `{today-6 … today+1}`.
pub fn sync_window(now: u64, last_sync: Option<u64>) -> Vec<u64> {
    let today = day_of(now);
    let recent = last_sync.is_some_and(|t| now.saturating_sub(t) <= RECENT_SYNC_HORIZON);
    let back = if recent { 1 } else { 6 };
    (today.saturating_sub(back)..=today + 1).collect()
}

/// Listen registrations keyed by label (one label per logical
/// subscription, e.g. a contact's outbox or a group's outbox).
pub struct ListenManager {
    dht: Arc<dyn Dht>,
    subs: Mutex<HashMap<String, ListenToken>>,
    cap: usize,
}

impl ListenManager {
    pub fn new(dht: Arc<dyn Dht>) -> Self {
        Self { dht, subs: Mutex::new(HashMap::new()), cap: MAX_LISTENERS }
    }

    #[cfg(test)]
    fn with_cap(dht: Arc<dyn Dht>, cap: usize) -> Self {
        Self { dht, subs: Mutex::new(HashMap::new()), cap }
    }

    /// Subscribe under `label`. Returns false (poll-only fallback)
    /// when the cap is reached; replaces an existing subscription for
    /// the same label.
    pub async fn subscribe(
        &self,
        label: &str,
        key: &DhtKey,
        sink: mpsc::Sender<DhtRecord>,
    ) -> Result<bool, TransportError> {
        let previous = {
            let subs = self.subs.lock();
            if !subs.contains_key(label) && subs.len() >= self.cap {
                tracing::warn!(label, cap = self.cap, "listener cap reached, poll-only");
                return Ok(false);
            }
            subs.get(label).copied()
        };
        if let Some(token) = previous {
            self.dht.cancel_listen(token).await?;
        }
        let token = self.dht.listen(key, sink).await?;
        self.subs.lock().insert(label.to_string(), token);
        Ok(true)
    }

    /// Cancel one subscription; cleanup runs exactly once per token.
    pub async fn unsubscribe(&self, label: &str) -> Result<(), TransportError> {
        let token = self.subs.lock().remove(label);
        if let Some(token) = token {
            self.dht.cancel_listen(token).await?;
        }
        Ok(())
    }

    /// Cancel everything (shutdown path).
    pub async fn cancel_all(&self) {
        let drained: Vec<ListenToken> = {
            let mut subs = self.subs.lock();
            subs.drain().map(|(_, token)| token).collect()
        };
        for token in drained {
            if let Err(e) = self.dht.cancel_listen(token).await {
                tracing::warn!(error = %e, "listen cancellation failed during shutdown");
            }
        }
    }

    pub fn active(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn labels(&self) -> Vec<String> {
        self.subs.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::MemoryDht;

    #[test]
    fn recent_contact_gets_three_day_window() {
        let now = 20 * SECONDS_PER_DAY + 500;
        let window = sync_window(now, Some(now - SECONDS_PER_DAY));
        assert_eq!(window, vec![19, 20, 21]);
    }

    #[test]
    fn stale_contact_gets_full_retention() {
        // Last synced 4 days ago: the bucket written on day 16 is
        // still inside the window.
        let now = 20 * SECONDS_PER_DAY + 500;
        let window = sync_window(now, Some(now - 4 * SECONDS_PER_DAY));
        assert_eq!(window, vec![14, 15, 16, 17, 18, 19, 20, 21]);
    }

    #[test]
    fn never_synced_gets_full_retention() {
        let now = 20 * SECONDS_PER_DAY;
        assert_eq!(sync_window(now, None).len(), 8);
    }

    #[test]
    fn window_never_underflows_day_zero() {
        let window = sync_window(1_000, None);
        assert_eq!(window, vec![0, 1]);
    }

    #[test]
    fn horizon_boundary() {
        let now = 30 * SECONDS_PER_DAY;
        assert_eq!(sync_window(now, Some(now - RECENT_SYNC_HORIZON)).len(), 3);
        assert_eq!(sync_window(now, Some(now - RECENT_SYNC_HORIZON - 1)).len(), 8);
    }

    #[tokio::test]
    async fn listener_cap_falls_back_to_polling() {
        let dht = MemoryDht::new();
        let manager = ListenManager::with_cap(dht, 2);
        let (tx, _rx) = mpsc::channel(4);

        let k = |i: u8| DhtKey::from_bytes(&[i; 32]);
        assert!(manager.subscribe("a", &k(1), tx.clone()).await.unwrap());
        assert!(manager.subscribe("b", &k(2), tx.clone()).await.unwrap());
        assert!(!manager.subscribe("c", &k(3), tx.clone()).await.unwrap());
        assert_eq!(manager.active(), 2);

        // Re-subscribing an existing label is a replace, not a new slot.
        assert!(manager.subscribe("a", &k(4), tx.clone()).await.unwrap());
        assert_eq!(manager.active(), 2);

        manager.unsubscribe("a").await.unwrap();
        assert!(manager.subscribe("c", &k(3), tx).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_all_empties_registry() {
        let dht = MemoryDht::new();
        let manager = ListenManager::new(dht);
        let (tx, _rx) = mpsc::channel(4);
        manager
            .subscribe("x", &DhtKey::from_bytes(&[9; 32]), tx)
            .await
            .unwrap();
        manager.cancel_all().await;
        assert_eq!(manager.active(), 0);
    }
}
