//! Durable grain state I/O.
//!
//! The store reads and writes opaque state bytes keyed by (grain, state
//! name) with etag-based optimistic concurrency; [`PersistentState<T>`]
//! layers typed, cached access on top. A write with a stale etag surfaces
//! [`StateError::InconsistentState`], which the runtime treats as grounds
//! to deactivate the *calling* activation only — never its peers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use granary_core::GrainId;

/// Errors from grain state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The stored etag does not match what the caller holds: someone else
    /// wrote the state since our last read.
    #[error("inconsistent state: expected etag {expected:?}, found {actual:?}")]
    InconsistentState {
        /// The etag the caller expected.
        expected: Option<String>,
        /// The etag currently stored.
        actual: Option<String>,
    },

    /// Serialization or deserialization failed.
    #[error("state serialization error: {0}")]
    Serialization(String),

    /// Generic backend failure.
    #[error("state store error: {0}")]
    Store(String),
}

/// A stored state record: bytes plus the concurrency tag.
#[derive(Debug, Clone)]
pub struct StoredState {
    /// Serialized state.
    pub data: Vec<u8>,
    /// Optimistic concurrency token.
    pub etag: String,
}

/// Pluggable durable storage for grain state.
#[async_trait]
pub trait GrainStateStore: Send + Sync + fmt::Debug {
    /// Read the record for (grain, state name), or `None` if never written.
    async fn read(
        &self,
        grain: &GrainId,
        state_name: &str,
    ) -> Result<Option<StoredState>, StateError>;

    /// Write a record. `expected_etag` of `None` means first write; a
    /// mismatch either way is [`StateError::InconsistentState`]. Returns
    /// the new etag.
    async fn write(
        &self,
        grain: &GrainId,
        state_name: &str,
        data: Vec<u8>,
        expected_etag: Option<&str>,
    ) -> Result<String, StateError>;

    /// Delete a record, conditional on the etag when `Some`.
    async fn clear(
        &self,
        grain: &GrainId,
        state_name: &str,
        expected_etag: Option<&str>,
    ) -> Result<(), StateError>;
}

/// In-memory state store for tests and single-host clusters.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<(GrainId, String), StoredState>,
    counter: u64,
}

impl InMemoryStateStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GrainStateStore for InMemoryStateStore {
    async fn read(
        &self,
        grain: &GrainId,
        state_name: &str,
    ) -> Result<Option<StoredState>, StateError> {
        let key = (grain.clone(), state_name.to_string());
        Ok(self.inner.lock().entries.get(&key).cloned())
    }

    async fn write(
        &self,
        grain: &GrainId,
        state_name: &str,
        data: Vec<u8>,
        expected_etag: Option<&str>,
    ) -> Result<String, StateError> {
        let key = (grain.clone(), state_name.to_string());
        let mut inner = self.inner.lock();

        let actual = inner.entries.get(&key).map(|s| s.etag.clone());
        if actual.as_deref() != expected_etag {
            return Err(StateError::InconsistentState {
                expected: expected_etag.map(str::to_string),
                actual,
            });
        }

        inner.counter += 1;
        let etag = inner.counter.to_string();
        inner.entries.insert(
            key,
            StoredState {
                data,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn clear(
        &self,
        grain: &GrainId,
        state_name: &str,
        expected_etag: Option<&str>,
    ) -> Result<(), StateError> {
        let key = (grain.clone(), state_name.to_string());
        let mut inner = self.inner.lock();
        if let Some(expected) = expected_etag {
            let actual = inner.entries.get(&key).map(|s| s.etag.clone());
            if actual.as_deref() != Some(expected) {
                return Err(StateError::InconsistentState {
                    expected: Some(expected.to_string()),
                    actual,
                });
            }
        }
        inner.entries.remove(&key);
        Ok(())
    }
}

/// Typed, cached view over one (grain, state name) record.
///
/// Grains create this in `on_activate` and keep it as a field; mutations
/// happen on the cached value and persist on [`save`](Self::save).
pub struct PersistentState<T> {
    value: T,
    etag: Option<String>,
    store: Arc<dyn GrainStateStore>,
    grain: GrainId,
    state_name: String,
}

impl<T: fmt::Debug> fmt::Debug for PersistentState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentState")
            .field("grain", &self.grain)
            .field("state_name", &self.state_name)
            .field("value", &self.value)
            .field("etag", &self.etag)
            .finish()
    }
}

impl<T: Serialize + DeserializeOwned + Default> PersistentState<T> {
    /// Load from the store, or start from `T::default()` when absent.
    ///
    /// # Errors
    ///
    /// Propagates store and deserialization failures.
    pub async fn load(
        store: Arc<dyn GrainStateStore>,
        grain: GrainId,
        state_name: impl Into<String>,
    ) -> Result<Self, StateError> {
        let state_name = state_name.into();
        let stored = store.read(&grain, &state_name).await?;
        let (value, etag) = match stored {
            Some(record) => {
                let value: T = serde_json::from_slice(&record.data)
                    .map_err(|e| StateError::Serialization(e.to_string()))?;
                (value, Some(record.etag))
            }
            None => (T::default(), None),
        };
        Ok(Self {
            value,
            etag,
            store,
            grain,
            state_name,
        })
    }

    /// The cached value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Mutable access; persisted only on [`save`](Self::save).
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// The current etag, `None` before the first save.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Persist the cached value with optimistic concurrency.
    ///
    /// # Errors
    ///
    /// [`StateError::InconsistentState`] when someone else wrote since our
    /// load; the runtime deactivates the calling activation on it.
    pub async fn save(&mut self) -> Result<(), StateError> {
        let data = serde_json::to_vec(&self.value)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        let etag = self
            .store
            .write(&self.grain, &self.state_name, data, self.etag.as_deref())
            .await?;
        self.etag = Some(etag);
        Ok(())
    }

    /// Delete the record and reset the cached value to default.
    ///
    /// # Errors
    ///
    /// Propagates conditional-clear failures.
    pub async fn clear(&mut self) -> Result<(), StateError> {
        self.store
            .clear(&self.grain, &self.state_name, self.etag.as_deref())
            .await?;
        self.value = T::default();
        self.etag = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use granary_core::GrainType;
    use serde::Deserialize;

    use super::*;

    fn grain(name: &str) -> GrainId {
        GrainId::text(GrainType(0xBA4E), name)
    }

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Balance {
        amount: i64,
    }

    #[tokio::test]
    async fn test_read_absent_returns_none() {
        let store = InMemoryStateStore::new();
        let result = store.read(&grain("alice"), "balance").await.expect("read");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = InMemoryStateStore::new();
        let etag = store
            .write(&grain("alice"), "balance", vec![1, 2], None)
            .await
            .expect("write");
        let stored = store
            .read(&grain("alice"), "balance")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(stored.data, vec![1, 2]);
        assert_eq!(stored.etag, etag);
    }

    #[tokio::test]
    async fn test_stale_etag_is_inconsistent_state() {
        let store = InMemoryStateStore::new();
        let etag = store
            .write(&grain("alice"), "balance", vec![1], None)
            .await
            .expect("write");
        // Second writer with the original (now stale) view.
        let result = store.write(&grain("alice"), "balance", vec![2], None).await;
        assert!(matches!(result, Err(StateError::InconsistentState { .. })));
        // The holder of the fresh etag can write.
        store
            .write(&grain("alice"), "balance", vec![3], Some(&etag))
            .await
            .expect("write");
    }

    #[tokio::test]
    async fn test_clear_conditional_on_etag() {
        let store = InMemoryStateStore::new();
        let etag = store
            .write(&grain("alice"), "balance", vec![1], None)
            .await
            .expect("write");
        assert!(matches!(
            store.clear(&grain("alice"), "balance", Some("stale")).await,
            Err(StateError::InconsistentState { .. })
        ));
        store
            .clear(&grain("alice"), "balance", Some(&etag))
            .await
            .expect("clear");
        assert!(
            store
                .read(&grain("alice"), "balance")
                .await
                .expect("read")
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_persistent_state_roundtrip() {
        let store: Arc<dyn GrainStateStore> = Arc::new(InMemoryStateStore::new());

        let mut state: PersistentState<Balance> =
            PersistentState::load(store.clone(), grain("alice"), "balance")
                .await
                .expect("load");
        assert_eq!(state.get(), &Balance::default());
        assert!(state.etag().is_none());

        state.get_mut().amount = 120;
        state.save().await.expect("save");
        assert!(state.etag().is_some());

        // A fresh load observes the saved value.
        let reloaded: PersistentState<Balance> =
            PersistentState::load(store.clone(), grain("alice"), "balance")
                .await
                .expect("load");
        assert_eq!(reloaded.get().amount, 120);
    }

    #[tokio::test]
    async fn test_persistent_state_conflict_detection() {
        let store: Arc<dyn GrainStateStore> = Arc::new(InMemoryStateStore::new());

        let mut first: PersistentState<Balance> =
            PersistentState::load(store.clone(), grain("alice"), "balance")
                .await
                .expect("load");
        let mut second: PersistentState<Balance> =
            PersistentState::load(store.clone(), grain("alice"), "balance")
                .await
                .expect("load");

        first.get_mut().amount = 1;
        first.save().await.expect("save");

        second.get_mut().amount = 2;
        let result = second.save().await;
        assert!(matches!(result, Err(StateError::InconsistentState { .. })));
    }
}
