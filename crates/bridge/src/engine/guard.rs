use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// What a lock entry protects: a whole reconciliation pass, one operation
/// kind within it, or the post-apply persistence write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Document,
    Create,
    Update,
    FinalWrite,
}

/// Keyed re-entrancy locks, plus a short debounce that rejects a new pass
/// on a record immediately after the previous one completed. Every entry
/// carries a TTL, so a crashed pass can never wedge a record.
#[derive(Debug)]
pub struct ReentrancyGuard {
    locks: RwLock<HashMap<(String, LockKind), Instant>>,
    recent: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
    debounce: Duration,
}

impl ReentrancyGuard {
    #[must_use]
    pub fn new(ttl: Duration, debounce: Duration) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            recent: RwLock::new(HashMap::new()),
            ttl,
            debounce,
        }
    }

    /// Attempts to take the `(key, kind)` lock. Returns `false` if the lock
    /// is held, or (for document locks) if a pass on the record completed
    /// within the debounce window.
    pub async fn try_acquire(&self, key: &str, kind: LockKind) -> bool {
        self.prune_expired().await;

        if kind == LockKind::Document && self.recently_completed(key).await {
            return false;
        }

        let mut locks = self.locks.write().await;
        let entry = (key.to_string(), kind);
        if locks.contains_key(&entry) {
            return false;
        }

        locks.insert(entry, Instant::now() + self.ttl);
        true
    }

    /// Releases the lock. Releasing a document lock records the completion
    /// time for the debounce window.
    pub async fn release(&self, key: &str, kind: LockKind) {
        self.locks.write().await.remove(&(key.to_string(), kind));

        if kind == LockKind::Document {
            self.recent
                .write()
                .await
                .insert(key.to_string(), Instant::now());
        }
    }

    async fn recently_completed(&self, key: &str) -> bool {
        self.recent
            .read()
            .await
            .get(key)
            .is_some_and(|done| done.elapsed() < self.debounce)
    }

    async fn prune_expired(&self) {
        let now = Instant::now();
        self.locks
            .write()
            .await
            .retain(|_, deadline| *deadline > now);

        let debounce = self.debounce;
        self.recent
            .write()
            .await
            .retain(|_, done| now.saturating_duration_since(*done) < debounce);
    }
}
