//! Message Page Cache
//!
//! Time-bounded snapshots of each conversation's loaded messages. An entry
//! is only served while younger than the TTL; any successful mutation of the
//! conversation invalidates it so the next page-1 load goes to the server.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::conversation::ConversationId;
use crate::messages::Message;

/// Cache settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Entry time-to-live
    pub ttl: Duration,
    /// Interval of the background sweep
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// A cached snapshot
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Messages as of `cached_at`
    pub messages: Vec<Message>,
    /// When the snapshot was taken
    pub cached_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() < ttl
    }
}

/// Per-conversation message cache
#[derive(Debug)]
pub struct MessageCache {
    entries: DashMap<ConversationId, CacheEntry>,
    ttl: Duration,
}

impl MessageCache {
    /// Create a cache with the given TTL
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Fresh snapshot for `id`; an expired entry is evicted on the way
    #[must_use]
    pub fn get(&self, id: &ConversationId) -> Option<Vec<Message>> {
        let fresh = self
            .entries
            .get(id)
            .map(|entry| entry.is_fresh(self.ttl).then(|| entry.messages.clone()));

        match fresh {
            Some(Some(messages)) => Some(messages),
            Some(None) => {
                self.entries.remove_if(id, |_, entry| !entry.is_fresh(self.ttl));
                None
            }
            None => None,
        }
    }

    /// Whether a fresh entry exists
    #[must_use]
    pub fn is_fresh(&self, id: &ConversationId) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.is_fresh(self.ttl))
    }

    /// Store a snapshot
    pub fn put(&self, id: ConversationId, messages: Vec<Message>) {
        self.entries.insert(
            id,
            CacheEntry {
                messages,
                cached_at: Instant::now(),
            },
        );
    }

    /// Raw entry, fresh or not
    #[must_use]
    pub fn entry(&self, id: &ConversationId) -> Option<CacheEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Put back an entry exactly as it was (used by rollbacks)
    pub fn restore(&self, id: ConversationId, entry: Option<CacheEntry>) {
        match entry {
            Some(entry) => {
                self.entries.insert(id, entry);
            }
            None => {
                self.entries.remove(&id);
            }
        }
    }

    /// Drop the entry for `id`
    pub fn invalidate(&self, id: &ConversationId) {
        if self.entries.remove(id).is_some() {
            tracing::trace!(conversation_id = %id, "Cache entry invalidated");
        }
    }

    /// Remove every expired entry, returning how many were removed
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(self.ttl));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries (fresh or not)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured TTL
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageId;

    fn id(s: &str) -> ConversationId {
        ConversationId::new(s)
    }

    fn messages() -> Vec<Message> {
        vec![Message::assistant(MessageId::new("m1"), "hi")]
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_entry_served() {
        let cache = MessageCache::new(Duration::from_secs(300));
        cache.put(id("c1"), messages());

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get(&id("c1")).map(|m| m.len()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_evicted_on_get() {
        let cache = MessageCache::new(Duration::from_secs(300));
        cache.put(id("c1"), messages());

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(cache.get(&id("c1")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_counts_expired() {
        let cache = MessageCache::new(Duration::from_secs(10));
        cache.put(id("old"), messages());
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.put(id("new"), messages());

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_fresh(&id("new")));
    }

    #[test]
    fn test_invalidate_and_restore() {
        let cache = MessageCache::new(Duration::from_secs(300));
        cache.put(id("c1"), messages());
        let snapshot = cache.entry(&id("c1"));

        cache.invalidate(&id("c1"));
        assert!(!cache.is_fresh(&id("c1")));

        cache.restore(id("c1"), snapshot);
        assert!(cache.is_fresh(&id("c1")));

        cache.restore(id("c1"), None);
        assert!(cache.is_empty());
    }
}
