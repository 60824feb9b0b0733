//! Stream queue cache.
//!
//! The adapter-facing cache between a stream provider's queue reader and
//! its consumers: batches are appended with their dequeue time, consumers
//! walk them through cursors, and eviction is chronological — oldest
//! first, driven by a time-purge predicate and a capacity bound — with
//! pressure feedback so a slow consumer can throttle ingestion upstream.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identity of one stream within a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    /// Stream namespace.
    pub namespace: String,
    /// Stream key within the namespace.
    pub key: String,
}

impl StreamId {
    /// Stream id from namespace and key.
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

/// Position of one item in the cache's total order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceToken(pub u64);

/// One cached stream item.
#[derive(Debug, Clone)]
pub struct CachedMessage {
    /// The stream this item belongs to.
    pub stream: StreamId,
    /// Cache-order position.
    pub token: SequenceToken,
    /// Opaque item payload.
    pub payload: Vec<u8>,
    /// When the item was dequeued from the backing queue, ms since epoch.
    pub dequeued_ms: u64,
}

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct QueueCacheConfig {
    /// Maximum cached items before capacity eviction kicks in.
    pub capacity: usize,
    /// Items older than this (relative to the newest dequeue time) are
    /// purged.
    pub purge_age: Duration,
    /// Lag fraction of capacity beyond which the cache reports pressure.
    pub pressure_fraction: f64,
}

impl Default for QueueCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            purge_age: Duration::from_secs(30 * 60),
            pressure_fraction: 0.5,
        }
    }
}

/// Consumer cursor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(u64);

#[derive(Debug)]
struct CursorState {
    stream: StreamId,
    /// Next token this cursor wants to observe.
    next: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    items: VecDeque<CachedMessage>,
    next_token: u64,
    cursors: HashMap<u64, CursorState>,
    next_cursor: u64,
    latest_dequeue_ms: u64,
    purge_requested: bool,
}

/// The chronological stream cache.
#[derive(Debug)]
pub struct QueueCache {
    config: QueueCacheConfig,
    inner: Mutex<CacheInner>,
}

impl QueueCache {
    /// Cache with the given tuning.
    pub fn new(config: QueueCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Append a batch read from the backing queue; returns the assigned
    /// stream positions in batch order.
    pub fn add_messages(
        &self,
        batch: Vec<(StreamId, Vec<u8>)>,
        dequeued_ms: u64,
    ) -> Vec<SequenceToken> {
        let mut inner = self.inner.lock();
        inner.latest_dequeue_ms = inner.latest_dequeue_ms.max(dequeued_ms);
        let mut tokens = Vec::with_capacity(batch.len());
        for (stream, payload) in batch {
            let token = SequenceToken(inner.next_token);
            inner.next_token += 1;
            inner.items.push_back(CachedMessage {
                stream,
                token,
                payload,
                dequeued_ms,
            });
            tokens.push(token);
        }
        self.evict(&mut inner);
        tokens
    }

    /// Open a cursor on a stream, at `from` or at the oldest cached item.
    pub fn cursor(&self, stream: StreamId, from: Option<SequenceToken>) -> Cursor {
        let mut inner = self.inner.lock();
        let start = from
            .map(|t| t.0)
            .unwrap_or_else(|| inner.items.front().map(|m| m.token.0).unwrap_or(0));
        let id = inner.next_cursor;
        inner.next_cursor += 1;
        inner.cursors.insert(id, CursorState { stream, next: start });
        Cursor(id)
    }

    /// The next cached item for a cursor, if any.
    pub fn try_next(&self, cursor: &Cursor) -> Option<CachedMessage> {
        let mut inner = self.inner.lock();
        let state = inner.cursors.get(&cursor.0)?;
        let stream = state.stream.clone();
        let mut next = state.next;

        // A cursor that fell behind eviction resumes at the oldest item.
        if let Some(front) = inner.items.front()
            && next < front.token.0
        {
            next = front.token.0;
        }

        let found = inner
            .items
            .iter()
            .find(|m| m.token.0 >= next && m.stream == stream)
            .cloned();
        if let Some(msg) = &found
            && let Some(state) = inner.cursors.get_mut(&cursor.0)
        {
            state.next = msg.token.0 + 1;
        }
        found
    }

    /// Drop a cursor.
    pub fn close_cursor(&self, cursor: Cursor) {
        self.inner.lock().cursors.remove(&cursor.0);
    }

    /// Request an aggressive purge on the next eviction pass.
    pub fn signal_purge(&self) {
        let mut inner = self.inner.lock();
        inner.purge_requested = true;
        self.evict(&mut inner);
    }

    /// Whether a consumer lags far enough that ingestion should slow.
    pub fn under_pressure(&self) -> bool {
        let inner = self.inner.lock();
        let Some(newest) = inner.items.back().map(|m| m.token.0) else {
            return false;
        };
        let slowest = inner.cursors.values().map(|c| c.next).min();
        match slowest {
            Some(next) => {
                let lag = newest.saturating_sub(next) + 1;
                (lag as f64) > self.config.pressure_fraction * self.config.capacity as f64
            }
            None => false,
        }
    }

    /// Cached item count.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Chronological eviction: purge-aged items always go; capacity
    /// overflow drops oldest-first.
    fn evict(&self, inner: &mut CacheInner) {
        let purge_age_ms = self.config.purge_age.as_millis() as u64;
        let now = inner.latest_dequeue_ms;
        let purge_all_read = inner.purge_requested;
        inner.purge_requested = false;

        let slowest = inner.cursors.values().map(|c| c.next).min();
        let mut evicted = 0usize;
        while let Some(front) = inner.items.front() {
            let aged = now.saturating_sub(front.dequeued_ms) > purge_age_ms;
            let over_capacity = inner.items.len() > self.config.capacity;
            let consumed = slowest.is_none_or(|s| front.token.0 < s);
            if aged || over_capacity || (purge_all_read && consumed) {
                inner.items.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        if evicted > 0 {
            debug!(evicted, remaining = inner.items.len(), "queue cache evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(key: &str) -> StreamId {
        StreamId::new("test", key)
    }

    fn cache(capacity: usize, purge_secs: u64) -> QueueCache {
        QueueCache::new(QueueCacheConfig {
            capacity,
            purge_age: Duration::from_secs(purge_secs),
            pressure_fraction: 0.5,
        })
    }

    #[test]
    fn test_add_and_consume_in_order() {
        let cache = cache(100, 3600);
        let tokens = cache.add_messages(
            vec![
                (stream("a"), vec![1]),
                (stream("b"), vec![2]),
                (stream("a"), vec![3]),
            ],
            1_000,
        );
        assert_eq!(tokens.len(), 3);
        assert!(tokens[0] < tokens[1]);

        let cursor = cache.cursor(stream("a"), None);
        assert_eq!(cache.try_next(&cursor).expect("first").payload, vec![1]);
        assert_eq!(cache.try_next(&cursor).expect("second").payload, vec![3]);
        assert!(cache.try_next(&cursor).is_none());
    }

    #[test]
    fn test_cursor_from_token_skips_earlier_items() {
        let cache = cache(100, 3600);
        let tokens = cache.add_messages(
            vec![(stream("a"), vec![1]), (stream("a"), vec![2])],
            1_000,
        );
        let cursor = cache.cursor(stream("a"), Some(tokens[1]));
        assert_eq!(cache.try_next(&cursor).expect("item").payload, vec![2]);
        assert!(cache.try_next(&cursor).is_none());
    }

    #[test]
    fn test_capacity_eviction_is_oldest_first() {
        let cache = cache(2, 3600);
        cache.add_messages(vec![(stream("a"), vec![1])], 1_000);
        cache.add_messages(vec![(stream("a"), vec![2])], 1_001);
        cache.add_messages(vec![(stream("a"), vec![3])], 1_002);

        assert_eq!(cache.len(), 2);
        let cursor = cache.cursor(stream("a"), None);
        assert_eq!(cache.try_next(&cursor).expect("item").payload, vec![2]);
    }

    #[test]
    fn test_time_purge_drops_aged_items() {
        let cache = cache(100, 10);
        cache.add_messages(vec![(stream("a"), vec![1])], 1_000);
        // A much later batch ages the first item past the 10s predicate.
        cache.add_messages(vec![(stream("a"), vec![2])], 1_000 + 11_000);

        assert_eq!(cache.len(), 1);
        let cursor = cache.cursor(stream("a"), None);
        assert_eq!(cache.try_next(&cursor).expect("item").payload, vec![2]);
    }

    #[test]
    fn test_pressure_from_lagging_cursor() {
        let cache = cache(10, 3600);
        let cursor = cache.cursor(stream("a"), None);
        let batch: Vec<_> = (0..8u8).map(|i| (stream("a"), vec![i])).collect();
        cache.add_messages(batch, 1_000);

        // The cursor has read nothing: lag 8 of capacity 10 > 50%.
        assert!(cache.under_pressure());

        // Catching up clears the pressure.
        while cache.try_next(&cursor).is_some() {}
        assert!(!cache.under_pressure());
    }

    #[test]
    fn test_signal_purge_drops_consumed_items() {
        let cache = cache(100, 3600);
        cache.add_messages(vec![(stream("a"), vec![1]), (stream("a"), vec![2])], 1_000);
        let cursor = cache.cursor(stream("a"), None);
        let _ = cache.try_next(&cursor);

        cache.signal_purge();
        // Only the consumed item goes; the unread one stays.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.try_next(&cursor).expect("item").payload, vec![2]);
    }

    #[test]
    fn test_cursor_behind_eviction_resumes_at_oldest() {
        let cache = cache(1, 3600);
        cache.add_messages(vec![(stream("a"), vec![1])], 1_000);
        let cursor = cache.cursor(stream("a"), None);
        cache.add_messages(vec![(stream("a"), vec![2])], 1_001);

        // Item 1 was evicted under the cursor; it resumes at item 2.
        assert_eq!(cache.try_next(&cursor).expect("item").payload, vec![2]);
    }
}
