//! One-shot token store with expiry.
//!
//! Maps an opaque token to a value for a bounded time. [`PendingStore::take`]
//! removes the entry, so each token can be redeemed once. Used for client
//! profile download links handed out by Generate.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::issuer::generate_token;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Token → value map with a fixed time-to-live and single-use redemption.
pub struct PendingStore<V> {
    entries: DashMap<String, Entry<V>>,
    ttl: Duration,
    prefix: &'static str,
}

impl<V: Send + Sync + 'static> PendingStore<V> {
    /// Create a store whose tokens start with `prefix` and live for `ttl`.
    #[must_use]
    pub fn new(prefix: &'static str, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            prefix,
        }
    }

    /// Store `value` under a fresh random token and return the token.
    pub fn insert(&self, value: V) -> String {
        let token = generate_token(self.prefix);
        self.entries.insert(
            token.clone(),
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
        token
    }

    /// Redeem a token. Returns `None` for unknown, already redeemed or
    /// expired tokens.
    pub fn take(&self, token: &str) -> Option<V> {
        let (_, entry) = self.entries.remove(token)?;
        if Instant::now() >= entry.expires_at {
            debug!("Expired pending token presented");
            return None;
        }
        Some(entry.value)
    }

    /// Number of entries, expired ones included until reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

/// Spawn a background task that reaps expired entries every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper<V: Send + Sync + 'static>(
    store: Arc<PendingStore<V>>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired pending tokens");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Pending token reaper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_redeems_once() {
        // GIVEN: a stored value
        let store = PendingStore::new("dl_", Duration::from_secs(60));
        let token = store.insert("profile".to_string());
        assert!(token.starts_with("dl_"));

        // WHEN/THEN: first take succeeds, second does not
        assert_eq!(store.take(&token).as_deref(), Some("profile"));
        assert!(store.take(&token).is_none());
    }

    #[tokio::test]
    async fn expired_token_is_refused_and_reaped() {
        let store = PendingStore::new("dl_", Duration::from_millis(30));
        let a = store.insert(1_u32);
        let _b = store.insert(2_u32);

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(store.take(&a).is_none());
        assert_eq!(store.reap_expired(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unknown_token_is_none() {
        let store: PendingStore<u32> = PendingStore::new("dl_", Duration::from_secs(5));
        assert!(store.take("dl_nope").is_none());
    }

    #[tokio::test]
    async fn reaper_purges_expired_entries() {
        let store = Arc::new(PendingStore::new("dl_", Duration::from_millis(20)));
        store.insert(1_u32);
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        spawn_reaper(store.clone(), Duration::from_millis(10), rx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.is_empty());
        tx.send(()).unwrap();
    }
}
