//! Durable reminders: cluster-persistent recurring wake-ups.
//!
//! Unlike local timers, reminders survive deactivation and silo failure.
//! Rows live in a [`ReminderStore`] keyed by (grain, name) with a
//! secondary index on the grain's 32-bit uniform hash; each silo serves
//! the hash range it owns on the membership ring, polls its range, and
//! fires due reminders as ordinary grain invocations — activating the
//! grain wherever it currently lives.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use granary_core::{GrainId, JsonCodec, Message, MessageCodec, epoch_ms};

use crate::directory::{RingRange, range_contains};
use crate::grain::REMINDER_METHOD;
use crate::router::MessageRouter;

/// Errors from reminder operations.
#[derive(Debug, thiserror::Error)]
pub enum ReminderError {
    /// Backend failure.
    #[error("reminder store error: {0}")]
    Store(String),
}

/// One reminder row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderEntry {
    /// The grain to wake.
    pub grain: GrainId,
    /// Reminder name, unique per grain.
    pub name: String,
    /// First due time, ms since epoch.
    pub start_at_ms: u64,
    /// Firing period, ms.
    pub period_ms: u64,
    /// Range-index key; normally the grain's uniform hash.
    pub grain_hash: u32,
    /// Concurrency tag assigned by the store.
    pub etag: String,
}

impl ReminderEntry {
    /// Entry for a grain, hashed with the grain's own uniform hash.
    pub fn new(
        grain: GrainId,
        name: impl Into<String>,
        start_at_ms: u64,
        period: Duration,
    ) -> Self {
        let grain_hash = grain.uniform_hash();
        Self {
            grain,
            name: name.into(),
            start_at_ms,
            period_ms: period.as_millis() as u64,
            grain_hash,
            etag: String::new(),
        }
    }
}

/// Durable reminder storage.
///
/// `read_rows_in_range(begin, end)` follows ring semantics: `begin < end`
/// reads the half-open interval `(begin, end]`; `begin >= end` reads the
/// wrap union `(begin, MAX] ∪ [0, end]`.
#[async_trait]
pub trait ReminderStore: Send + Sync + fmt::Debug {
    /// Read one row.
    async fn read_row(
        &self,
        grain: &GrainId,
        name: &str,
    ) -> Result<Option<ReminderEntry>, ReminderError>;

    /// Read every row of one grain.
    async fn read_rows_for_grain(&self, grain: &GrainId)
    -> Result<Vec<ReminderEntry>, ReminderError>;

    /// Read every row whose hash falls in the ring interval.
    async fn read_rows_in_range(
        &self,
        begin: u32,
        end: u32,
    ) -> Result<Vec<ReminderEntry>, ReminderError>;

    /// Insert or replace a row; returns the fresh etag.
    async fn upsert(&self, entry: ReminderEntry) -> Result<String, ReminderError>;

    /// Remove a row, conditional on its etag. `Ok(false)` means the etag
    /// was stale or the row is gone.
    async fn remove(&self, grain: &GrainId, name: &str, etag: &str)
    -> Result<bool, ReminderError>;
}

/// Process-local reminder store for tests and single-host clusters.
#[derive(Debug, Default)]
pub struct InMemoryReminderStore {
    inner: Mutex<ReminderStoreInner>,
}

#[derive(Debug, Default)]
struct ReminderStoreInner {
    rows: HashMap<(GrainId, String), ReminderEntry>,
    counter: u64,
}

impl InMemoryReminderStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReminderStore for InMemoryReminderStore {
    async fn read_row(
        &self,
        grain: &GrainId,
        name: &str,
    ) -> Result<Option<ReminderEntry>, ReminderError> {
        let key = (grain.clone(), name.to_string());
        Ok(self.inner.lock().rows.get(&key).cloned())
    }

    async fn read_rows_for_grain(
        &self,
        grain: &GrainId,
    ) -> Result<Vec<ReminderEntry>, ReminderError> {
        Ok(self
            .inner
            .lock()
            .rows
            .values()
            .filter(|e| e.grain == *grain)
            .cloned()
            .collect())
    }

    async fn read_rows_in_range(
        &self,
        begin: u32,
        end: u32,
    ) -> Result<Vec<ReminderEntry>, ReminderError> {
        Ok(self
            .inner
            .lock()
            .rows
            .values()
            .filter(|e| range_contains((begin, end), e.grain_hash))
            .cloned()
            .collect())
    }

    async fn upsert(&self, mut entry: ReminderEntry) -> Result<String, ReminderError> {
        let mut inner = self.inner.lock();
        inner.counter += 1;
        let etag = format!("r{}", inner.counter);
        entry.etag = etag.clone();
        inner
            .rows
            .insert((entry.grain.clone(), entry.name.clone()), entry);
        Ok(etag)
    }

    async fn remove(
        &self,
        grain: &GrainId,
        name: &str,
        etag: &str,
    ) -> Result<bool, ReminderError> {
        let key = (grain.clone(), name.to_string());
        let mut inner = self.inner.lock();
        match inner.rows.get(&key) {
            Some(existing) if existing.etag == etag => {
                inner.rows.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Per-silo reminder driver.
///
/// Polls the rows in the silo's ring range and fires due reminders as
/// grain calls with the reserved reminder method. Range updates arrive
/// with membership changes.
pub struct ReminderService {
    store: Arc<dyn ReminderStore>,
    router: Weak<MessageRouter>,
    refresh_period: Duration,
    range: Arc<Mutex<Option<RingRange>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ReminderService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReminderService")
            .field("range", &self.range.lock())
            .finish()
    }
}

impl ReminderService {
    /// Service over `store`, firing through `router`.
    pub fn new(
        store: Arc<dyn ReminderStore>,
        router: Weak<MessageRouter>,
        refresh_period: Duration,
    ) -> Self {
        Self {
            store,
            router,
            refresh_period,
            range: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    /// Update the ring range this silo serves.
    pub fn set_range(&self, range: Option<RingRange>) {
        *self.range.lock() = range;
    }

    /// Start the polling loop.
    pub fn start(&self) {
        let store = self.store.clone();
        let router = self.router.clone();
        let refresh = self.refresh_period;
        let range = self.range.clone();

        let handle = tokio::spawn(async move {
            // (grain, name) → last fire time.
            let mut fired: HashMap<(GrainId, String), u64> = HashMap::new();
            let mut tick = tokio::time::interval(refresh);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some((begin, end)) = *range.lock() else {
                    continue;
                };
                let rows = match store.read_rows_in_range(begin, end).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(error = %e, "reminder range read failed");
                        continue;
                    }
                };

                let now = epoch_ms();
                let live: std::collections::HashSet<(GrainId, String)> = rows
                    .iter()
                    .map(|r| (r.grain.clone(), r.name.clone()))
                    .collect();
                fired.retain(|key, _| live.contains(key));

                for row in rows {
                    let key = (row.grain.clone(), row.name.clone());
                    let due = match fired.get(&key) {
                        Some(last) => last + row.period_ms,
                        None => row.start_at_ms,
                    };
                    if now < due {
                        continue;
                    }
                    fired.insert(key, now);

                    let Some(router) = router.upgrade() else {
                        return;
                    };
                    let body = match JsonCodec.encode(&row.name) {
                        Ok(body) => body,
                        Err(e) => {
                            warn!(error = %e, "reminder name failed to encode");
                            continue;
                        }
                    };
                    let msg = Message::request(row.grain.clone())
                        .method(REMINDER_METHOD)
                        .body(body)
                        .build();
                    debug!(grain = %row.grain, reminder = row.name, "firing reminder");
                    tokio::spawn(async move {
                        if let Err(e) = router.send_request(msg).await {
                            warn!(error = %e, "reminder tick failed");
                        }
                    });
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop the polling loop.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ReminderService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use granary_core::GrainType;

    use super::*;

    fn grain(name: &str) -> GrainId {
        GrainId::text(GrainType(0xBA4E), name)
    }

    fn entry_with_hash(name: &str, hash: u32) -> ReminderEntry {
        let mut entry = ReminderEntry::new(grain(name), name, 0, Duration::from_secs(60));
        entry.grain_hash = hash;
        entry
    }

    #[tokio::test]
    async fn test_upsert_returns_fresh_etags() {
        let store = InMemoryReminderStore::new();
        let e1 = store
            .upsert(ReminderEntry::new(grain("a"), "r", 0, Duration::from_secs(1)))
            .await
            .expect("upsert");
        let e2 = store
            .upsert(ReminderEntry::new(grain("a"), "r", 0, Duration::from_secs(1)))
            .await
            .expect("upsert");
        assert_ne!(e1, e2);

        let row = store
            .read_row(&grain("a"), "r")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(row.etag, e2);
    }

    #[tokio::test]
    async fn test_remove_is_etag_conditional() {
        let store = InMemoryReminderStore::new();
        let etag = store
            .upsert(ReminderEntry::new(grain("a"), "r", 0, Duration::from_secs(1)))
            .await
            .expect("upsert");

        assert!(!store.remove(&grain("a"), "r", "stale").await.expect("remove"));
        assert!(store.remove(&grain("a"), "r", &etag).await.expect("remove"));
        assert!(
            store
                .read_row(&grain("a"), "r")
                .await
                .expect("read")
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_read_rows_for_grain() {
        let store = InMemoryReminderStore::new();
        store
            .upsert(ReminderEntry::new(grain("a"), "r1", 0, Duration::from_secs(1)))
            .await
            .expect("upsert");
        store
            .upsert(ReminderEntry::new(grain("a"), "r2", 0, Duration::from_secs(1)))
            .await
            .expect("upsert");
        store
            .upsert(ReminderEntry::new(grain("b"), "r1", 0, Duration::from_secs(1)))
            .await
            .expect("upsert");

        let rows = store.read_rows_for_grain(&grain("a")).await.expect("read");
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_range_read_plain_interval() {
        let store = InMemoryReminderStore::new();
        store
            .upsert(entry_with_hash("low", 0x1000))
            .await
            .expect("upsert");
        store
            .upsert(entry_with_hash("mid", 0x5000))
            .await
            .expect("upsert");
        store
            .upsert(entry_with_hash("high", 0x9000))
            .await
            .expect("upsert");

        // (begin, end]: begin exclusive, end inclusive.
        let rows = store.read_rows_in_range(0x1000, 0x5000).await.expect("read");
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["mid"]);
    }

    #[tokio::test]
    async fn test_range_read_wraps_around_ring() {
        let store = InMemoryReminderStore::new();
        store
            .upsert(entry_with_hash("a", 0x0000_0010))
            .await
            .expect("upsert");
        store
            .upsert(entry_with_hash("b", 0x8000_0000))
            .await
            .expect("upsert");
        store
            .upsert(entry_with_hash("c", 0xFFFF_FFF0))
            .await
            .expect("upsert");

        // begin >= end wraps: (begin, MAX] ∪ [0, end].
        let rows = store
            .read_rows_in_range(0xC000_0000, 0x1000_0000)
            .await
            .expect("read");
        let mut names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "c"]);
    }
}
