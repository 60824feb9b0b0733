//! Pluggable membership table backends.
//!
//! The backend is shared storage: every silo of the cluster reads and
//! CAS-writes the same table. The contract that matters is the return
//! convention — conditional writes return `false` on a version/etag
//! mismatch instead of raising, so the protocol layer can re-read and
//! recompute without exception plumbing.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;

use granary_core::SiloAddress;

use super::table::{MembershipEntry, MembershipTable, TableVersion};

/// Errors from membership storage and protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    /// The backend failed transiently; the operation may be retried.
    #[error("membership backend error: {0}")]
    Backend(String),

    /// Optimistic-concurrency retries were exhausted.
    #[error("membership contention on {silo} after {attempts} attempts")]
    Contention {
        /// The row being written.
        silo: SiloAddress,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// A row that must exist does not.
    #[error("no membership row for {0}")]
    RowNotFound(SiloAddress),

    /// The local silo has been declared Dead; it must exit.
    #[error("silo {0} is declared dead")]
    DeclaredDead(SiloAddress),

    /// An illegal status transition was requested.
    #[error("illegal status transition for {silo}: {from} -> {to}")]
    IllegalTransition {
        /// The silo whose row was being written.
        silo: SiloAddress,
        /// Current status.
        from: super::table::SiloStatus,
        /// Requested status.
        to: super::table::SiloStatus,
    },
}

/// Shared membership storage.
///
/// All operations are idempotent under contention: `insert_row` and
/// `update_row` return `Ok(false)` when the caller's version tag (or row
/// etag) is stale, and the successful path atomically bumps the table
/// version row together with the entry write.
#[async_trait]
pub trait MembershipBackend: Send + Sync + fmt::Debug {
    /// Ensure the table and its version row exist.
    async fn initialize(&self) -> Result<(), MembershipError>;

    /// Read every row plus the version row.
    async fn read_all(&self) -> Result<MembershipTable, MembershipError>;

    /// Read a single silo's row (if present) plus the version row.
    async fn read_row(&self, silo: SiloAddress) -> Result<MembershipTable, MembershipError>;

    /// Insert a new row, paired with a version bump.
    ///
    /// Returns `Ok(false)` when the version tag is stale or a row for the
    /// same (endpoint, generation) already exists.
    async fn insert_row(
        &self,
        entry: MembershipEntry,
        expected: &TableVersion,
    ) -> Result<bool, MembershipError>;

    /// Replace an existing row, paired with a version bump.
    ///
    /// Returns `Ok(false)` when either the row etag or the version tag is
    /// stale.
    async fn update_row(
        &self,
        entry: MembershipEntry,
        etag: &str,
        expected: &TableVersion,
    ) -> Result<bool, MembershipError>;

    /// Fast-path heartbeat: merge only the I-am-alive column, with no
    /// version bump and no etag check.
    async fn update_i_am_alive(
        &self,
        silo: SiloAddress,
        when_ms: u64,
    ) -> Result<(), MembershipError>;

    /// Drop every row of the cluster (operator reset).
    async fn delete_entries(&self) -> Result<(), MembershipError>;

    /// Remove Dead rows whose I-am-alive is older than `before_ms`.
    /// Returns how many rows were removed.
    async fn cleanup_defunct(&self, before_ms: u64) -> Result<usize, MembershipError>;
}

/// Process-local membership table for tests and single-host clusters.
///
/// Shared between silos via `Arc`. Etags are monotonically numbered; the
/// version row bumps atomically with every successful row write, under
/// one mutex — which is exactly the atomicity the trait demands.
#[derive(Default)]
pub struct InMemoryMembershipTable {
    inner: Mutex<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    rows: BTreeMap<SiloAddress, (MembershipEntry, String)>,
    version: TableVersion,
    etag_counter: u64,
    initialized: bool,
}

impl InMemoryMembershipTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for InMemoryMembershipTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InMemoryMembershipTable")
            .field("rows", &inner.rows.len())
            .field("version", &inner.version.version)
            .finish()
    }
}

impl InMemoryInner {
    fn next_etag(&mut self) -> String {
        self.etag_counter += 1;
        format!("etag-{}", self.etag_counter)
    }

    fn bump_version(&mut self) {
        let next = self.version.version.next();
        let etag = self.next_etag();
        self.version = TableVersion {
            version: next,
            etag,
        };
    }

    fn snapshot(&self) -> MembershipTable {
        MembershipTable {
            entries: self.rows.values().cloned().collect(),
            version: self.version.clone(),
        }
    }
}

#[async_trait]
impl MembershipBackend for InMemoryMembershipTable {
    async fn initialize(&self) -> Result<(), MembershipError> {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            // Materialize the version row up front; an absent version row
            // is never trusted as "version 0".
            let etag = inner.next_etag();
            inner.version = TableVersion {
                version: granary_core::MembershipVersion::new(),
                etag,
            };
            inner.initialized = true;
        }
        Ok(())
    }

    async fn read_all(&self) -> Result<MembershipTable, MembershipError> {
        Ok(self.inner.lock().snapshot())
    }

    async fn read_row(&self, silo: SiloAddress) -> Result<MembershipTable, MembershipError> {
        let inner = self.inner.lock();
        Ok(MembershipTable {
            entries: inner.rows.get(&silo).cloned().into_iter().collect(),
            version: inner.version.clone(),
        })
    }

    async fn insert_row(
        &self,
        entry: MembershipEntry,
        expected: &TableVersion,
    ) -> Result<bool, MembershipError> {
        let mut inner = self.inner.lock();
        if inner.version.etag != expected.etag || inner.rows.contains_key(&entry.silo) {
            return Ok(false);
        }
        let etag = inner.next_etag();
        inner.rows.insert(entry.silo, (entry, etag));
        inner.bump_version();
        Ok(true)
    }

    async fn update_row(
        &self,
        entry: MembershipEntry,
        etag: &str,
        expected: &TableVersion,
    ) -> Result<bool, MembershipError> {
        let mut inner = self.inner.lock();
        if inner.version.etag != expected.etag {
            return Ok(false);
        }
        match inner.rows.get(&entry.silo) {
            Some((_, current_etag)) if current_etag == etag => {}
            _ => return Ok(false),
        }
        let new_etag = inner.next_etag();
        inner.rows.insert(entry.silo, (entry, new_etag));
        inner.bump_version();
        Ok(true)
    }

    async fn update_i_am_alive(
        &self,
        silo: SiloAddress,
        when_ms: u64,
    ) -> Result<(), MembershipError> {
        let mut inner = self.inner.lock();
        match inner.rows.get_mut(&silo) {
            Some((entry, _)) => {
                entry.i_am_alive_ms = when_ms;
                Ok(())
            }
            None => Err(MembershipError::RowNotFound(silo)),
        }
    }

    async fn delete_entries(&self) -> Result<(), MembershipError> {
        let mut inner = self.inner.lock();
        inner.rows.clear();
        inner.bump_version();
        Ok(())
    }

    async fn cleanup_defunct(&self, before_ms: u64) -> Result<usize, MembershipError> {
        let mut inner = self.inner.lock();
        let before_len = inner.rows.len();
        inner.rows.retain(|_, (entry, _)| {
            !(entry.status == super::table::SiloStatus::Dead && entry.i_am_alive_ms < before_ms)
        });
        Ok(before_len - inner.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use granary_core::NetworkAddress;

    use super::super::table::SiloStatus;
    use super::*;

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(NetworkAddress::localhost(port), 1)
    }

    fn entry(port: u16) -> MembershipEntry {
        MembershipEntry::new(silo(port), "host", "role", 1_000)
    }

    #[tokio::test]
    async fn test_insert_bumps_version() {
        let table = InMemoryMembershipTable::new();
        table.initialize().await.expect("init");
        let v0 = table.read_all().await.expect("read").version;

        let ok = table.insert_row(entry(1), &v0).await.expect("insert");
        assert!(ok);

        let all = table.read_all().await.expect("read");
        assert_eq!(all.entries.len(), 1);
        assert!(all.version.version > v0.version);
        assert_ne!(all.version.etag, v0.etag);
    }

    #[tokio::test]
    async fn test_insert_with_stale_version_returns_false() {
        let table = InMemoryMembershipTable::new();
        table.initialize().await.expect("init");
        let v0 = table.read_all().await.expect("read").version;

        assert!(table.insert_row(entry(1), &v0).await.expect("insert"));
        // v0 is now stale.
        assert!(!table.insert_row(entry(2), &v0).await.expect("insert"));
        assert_eq!(table.read_all().await.expect("read").entries.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_returns_false() {
        let table = InMemoryMembershipTable::new();
        table.initialize().await.expect("init");
        let v0 = table.read_all().await.expect("read").version;
        assert!(table.insert_row(entry(1), &v0).await.expect("insert"));

        let v1 = table.read_all().await.expect("read").version;
        assert!(!table.insert_row(entry(1), &v1).await.expect("insert"));
    }

    #[tokio::test]
    async fn test_update_requires_both_tags() {
        let table = InMemoryMembershipTable::new();
        table.initialize().await.expect("init");
        let v0 = table.read_all().await.expect("read").version;
        table.insert_row(entry(1), &v0).await.expect("insert");

        let all = table.read_all().await.expect("read");
        let (mut row, etag) = all.get(&silo(1)).cloned().expect("row");
        row.status = SiloStatus::Active;

        // Stale version tag.
        assert!(
            !table
                .update_row(row.clone(), &etag, &v0)
                .await
                .expect("update")
        );
        // Wrong row etag.
        assert!(
            !table
                .update_row(row.clone(), "bogus", &all.version)
                .await
                .expect("update")
        );
        // Both fresh.
        assert!(
            table
                .update_row(row, &etag, &all.version)
                .await
                .expect("update")
        );
        let after = table.read_all().await.expect("read");
        assert_eq!(
            after.get(&silo(1)).expect("row").0.status,
            SiloStatus::Active
        );
    }

    #[tokio::test]
    async fn test_i_am_alive_fast_path_skips_version_bump() {
        let table = InMemoryMembershipTable::new();
        table.initialize().await.expect("init");
        let v0 = table.read_all().await.expect("read").version;
        table.insert_row(entry(1), &v0).await.expect("insert");

        let before = table.read_all().await.expect("read").version;
        table
            .update_i_am_alive(silo(1), 9_999)
            .await
            .expect("heartbeat");
        let after = table.read_all().await.expect("read");
        assert_eq!(after.version.version, before.version);
        assert_eq!(after.get(&silo(1)).expect("row").0.i_am_alive_ms, 9_999);
    }

    #[tokio::test]
    async fn test_i_am_alive_unknown_row_errors() {
        let table = InMemoryMembershipTable::new();
        table.initialize().await.expect("init");
        assert!(matches!(
            table.update_i_am_alive(silo(5), 1).await,
            Err(MembershipError::RowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_defunct_removes_only_old_dead_rows() {
        let table = InMemoryMembershipTable::new();
        table.initialize().await.expect("init");

        let v = table.read_all().await.expect("read").version;
        let mut dead_old = entry(1);
        dead_old.status = SiloStatus::Dead;
        dead_old.i_am_alive_ms = 100;
        table.insert_row(dead_old, &v).await.expect("insert");

        let v = table.read_all().await.expect("read").version;
        let mut dead_fresh = entry(2);
        dead_fresh.status = SiloStatus::Dead;
        dead_fresh.i_am_alive_ms = 5_000;
        table.insert_row(dead_fresh, &v).await.expect("insert");

        let v = table.read_all().await.expect("read").version;
        let mut alive = entry(3);
        alive.status = SiloStatus::Active;
        alive.i_am_alive_ms = 100;
        table.insert_row(alive, &v).await.expect("insert");

        let removed = table.cleanup_defunct(1_000).await.expect("cleanup");
        assert_eq!(removed, 1);
        let all = table.read_all().await.expect("read");
        assert!(all.get(&silo(1)).is_none());
        assert!(all.get(&silo(2)).is_some());
        assert!(all.get(&silo(3)).is_some());
    }
}
