//! The membership oracle: liveness protocol driver.
//!
//! Each silo runs one oracle. It writes the silo's own row (join,
//! heartbeat, graceful shutdown), probes a deterministic subset of peers,
//! accrues suspicions against unresponsive ones, and declares them Dead
//! once enough distinct silos agree within the suspicion window. Every
//! table mutation is a version-guarded compare-and-swap recomputed from a
//! fresh read; nothing ever succeeds on stale state.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rapidhash::RapidHasher;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use granary_core::{MembershipVersion, SiloAddress, epoch_ms};

use crate::config::MembershipConfig;

use super::backend::{MembershipBackend, MembershipError};
use super::table::{MembershipEntry, SiloStatus};

/// Seed for the probe-ring ordering of silo addresses.
const PROBE_RING_SEED: u64 = 0x70726f_62655f72;

/// Point-in-time view of the cluster, derived from a table read.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    /// Table version the snapshot was derived from.
    pub version: MembershipVersion,
    /// Status per known silo incarnation.
    pub members: HashMap<SiloAddress, SiloStatus>,
}

impl ClusterSnapshot {
    /// Silos currently Active, in deterministic (sorted) order.
    pub fn active_silos(&self) -> Vec<SiloAddress> {
        let mut active: Vec<SiloAddress> = self
            .members
            .iter()
            .filter(|(_, s)| s.is_active())
            .map(|(silo, _)| *silo)
            .collect();
        active.sort();
        active
    }

    /// Whether a silo is currently Active.
    pub fn is_active(&self, silo: &SiloAddress) -> bool {
        self.members.get(silo).is_some_and(|s| s.is_active())
    }

    /// Whether a silo is present and not Dead.
    pub fn is_alive(&self, silo: &SiloAddress) -> bool {
        self.members
            .get(silo)
            .is_some_and(|s| *s != SiloStatus::Dead)
    }

    /// Status of a silo, if known.
    pub fn status_of(&self, silo: &SiloAddress) -> Option<SiloStatus> {
        self.members.get(silo).copied()
    }
}

/// How the oracle checks whether a peer responds.
///
/// The silo wires this to a system ping over the message router; tests
/// substitute a table-free fake.
#[async_trait]
pub trait Prober: Send + Sync + fmt::Debug {
    /// Probe `target` once. `true` means it answered in time.
    async fn probe(&self, target: SiloAddress) -> bool;
}

/// The per-silo membership protocol driver.
pub struct MembershipOracle {
    inner: Arc<OracleInner>,
}

struct OracleInner {
    local: SiloAddress,
    host_name: String,
    role: String,
    config: MembershipConfig,
    backend: Arc<dyn MembershipBackend>,
    prober: Arc<dyn Prober>,
    snapshot_tx: watch::Sender<ClusterSnapshot>,
    self_dead: AtomicBool,
    self_dead_notify: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for MembershipOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipOracle")
            .field("local", &self.inner.local)
            .finish()
    }
}

impl MembershipOracle {
    /// Create an oracle for `local`. Call [`join`](Self::join) then
    /// [`start`](Self::start).
    pub fn new(
        local: SiloAddress,
        host_name: impl Into<String>,
        role: impl Into<String>,
        config: MembershipConfig,
        backend: Arc<dyn MembershipBackend>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(ClusterSnapshot::default());
        Self {
            inner: Arc::new(OracleInner {
                local,
                host_name: host_name.into(),
                role: role.into(),
                config,
                backend,
                prober,
                snapshot_tx,
                self_dead: AtomicBool::new(false),
                self_dead_notify: Notify::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// This silo's address.
    pub fn local(&self) -> SiloAddress {
        self.inner.local
    }

    /// Latest observed snapshot.
    pub fn snapshot(&self) -> ClusterSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn watch(&self) -> watch::Receiver<ClusterSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Whether this silo has observed itself marked Dead.
    pub fn is_self_dead(&self) -> bool {
        self.inner.self_dead.load(Ordering::Acquire)
    }

    /// Resolve when this silo observes itself marked Dead. It must then
    /// exit; the generation is burned.
    pub async fn wait_self_dead(&self) {
        while !self.is_self_dead() {
            self.inner.self_dead_notify.notified().await;
        }
    }

    /// Join the cluster: insert self as Joining, then go Active.
    ///
    /// # Errors
    ///
    /// Surfaces contention exhaustion and backend failures.
    pub async fn join(&self) -> Result<(), MembershipError> {
        self.inner.backend.initialize().await?;

        let now = epoch_ms();
        let entry = MembershipEntry::new(
            self.inner.local,
            self.inner.host_name.clone(),
            self.inner.role.clone(),
            now,
        );
        self.insert_self(entry).await?;
        info!(silo = %self.inner.local, "joined membership table");

        self.update_status(SiloStatus::Active).await?;
        self.inner.refresh_once().await?;
        info!(silo = %self.inner.local, "silo active");
        Ok(())
    }

    async fn insert_self(&self, entry: MembershipEntry) -> Result<(), MembershipError> {
        let inner = &self.inner;
        let mut delay = inner.config.backend_retry_delay;
        for _ in 0..inner.config.max_contention_retries {
            let table = match inner.backend.read_all().await {
                Ok(table) => table,
                Err(MembershipError::Backend(e)) => {
                    warn!(error = %e, "membership read failed, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if table.get(&inner.local).is_some() {
                // Our generation already has a row; inserting again would
                // violate the one-row-per-incarnation invariant.
                return Ok(());
            }
            if inner
                .backend
                .insert_row(entry.clone(), &table.version)
                .await?
            {
                return Ok(());
            }
            debug!(silo = %inner.local, "insert contention, re-reading");
        }
        Err(MembershipError::Contention {
            silo: inner.local,
            attempts: inner.config.max_contention_retries,
        })
    }

    /// Transition this silo's own row to `status` with CAS retries.
    ///
    /// # Errors
    ///
    /// `DeclaredDead` if a peer got there first; `IllegalTransition` for
    /// out-of-order requests; `Contention` on retry exhaustion.
    pub async fn update_status(&self, status: SiloStatus) -> Result<(), MembershipError> {
        let inner = &self.inner;
        let mut delay = inner.config.backend_retry_delay;
        for _ in 0..inner.config.max_contention_retries {
            let table = match inner.backend.read_all().await {
                Ok(table) => table,
                Err(MembershipError::Backend(e)) => {
                    warn!(error = %e, "membership read failed, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let (mut entry, etag) = table
                .get(&inner.local)
                .cloned()
                .ok_or(MembershipError::RowNotFound(inner.local))?;

            if entry.status == SiloStatus::Dead {
                inner.mark_self_dead();
                return Err(MembershipError::DeclaredDead(inner.local));
            }
            if entry.status == status {
                return Ok(());
            }
            if !entry.status.can_transition_to(status) {
                return Err(MembershipError::IllegalTransition {
                    silo: inner.local,
                    from: entry.status,
                    to: status,
                });
            }

            entry.status = status;
            entry.i_am_alive_ms = epoch_ms();
            if inner
                .backend
                .update_row(entry, &etag, &table.version)
                .await?
            {
                info!(silo = %inner.local, %status, "status updated");
                return Ok(());
            }
            debug!(silo = %inner.local, %status, "status update contention, re-reading");
        }
        Err(MembershipError::Contention {
            silo: inner.local,
            attempts: inner.config.max_contention_retries,
        })
    }

    /// Start the heartbeat, probe, and refresh background loops.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.config.heartbeat_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if inner.self_dead.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = inner.backend.update_i_am_alive(inner.local, epoch_ms()).await {
                    debug!(error = %e, "heartbeat write failed");
                }
            }
        }));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.config.probe_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if inner.self_dead.load(Ordering::Acquire) {
                    break;
                }
                inner.probe_round().await;
            }
        }));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.config.refresh_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if inner.self_dead.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = inner.refresh_once().await {
                    debug!(error = %e, "membership refresh failed");
                }
            }
        }));
    }

    /// Graceful exit: ShuttingDown → Stopping → Dead, then stop loops.
    pub async fn shutdown(&self) {
        for status in [SiloStatus::ShuttingDown, SiloStatus::Stopping, SiloStatus::Dead] {
            if let Err(e) = self.update_status(status).await {
                debug!(error = %e, "shutdown status write failed");
                break;
            }
        }
        self.stop_tasks();
    }

    /// Stop background loops without writing the table (process crash in
    /// tests, or after observing self-death).
    pub fn stop_tasks(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Remove Dead rows older than the configured defunct age.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn cleanup_defunct(&self) -> Result<usize, MembershipError> {
        let cutoff = epoch_ms().saturating_sub(self.inner.config.defunct_age.as_millis() as u64);
        self.inner.backend.cleanup_defunct(cutoff).await
    }
}

impl Drop for MembershipOracle {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

impl OracleInner {
    fn mark_self_dead(&self) {
        if !self.self_dead.swap(true, Ordering::AcqRel) {
            warn!(silo = %self.local, "observed own death in membership table");
            self.self_dead_notify.notify_waiters();
        }
    }

    async fn refresh_once(&self) -> Result<(), MembershipError> {
        let table = self.backend.read_all().await?;
        let snapshot = ClusterSnapshot {
            version: table.version.version,
            members: table
                .entries
                .iter()
                .map(|(e, _)| (e.silo, e.status))
                .collect(),
        };

        if snapshot.status_of(&self.local) == Some(SiloStatus::Dead) {
            self.mark_self_dead();
        }

        self.snapshot_tx.send_if_modified(move |current| {
            // Never move backwards; skip no-op publishes.
            if snapshot.version < current.version
                || (snapshot.version == current.version && snapshot.members == current.members)
            {
                return false;
            }
            *current = snapshot;
            true
        });
        Ok(())
    }

    /// Probe this round's ring successors; suspect the silent ones.
    async fn probe_round(&self) {
        let snapshot = self.snapshot_tx.borrow().clone();
        let targets = probe_targets(&snapshot, self.local, self.config.probe_fanout);
        for target in targets {
            let answered = tokio::time::timeout(
                self.config.probe_timeout,
                self.prober.probe(target),
            )
            .await
            .unwrap_or(false);
            if !answered {
                debug!(%target, "probe failed, raising suspicion");
                if let Err(e) = self.suspect(target).await {
                    debug!(%target, error = %e, "suspicion write failed");
                }
            }
        }
    }

    /// Add ourselves to the target's suspectors; declare it Dead at the
    /// threshold. Version-guarded CAS with fresh re-reads throughout.
    async fn suspect(&self, target: SiloAddress) -> Result<(), MembershipError> {
        let window_ms = self.config.suspicion_window.as_millis() as u64;
        for _ in 0..self.config.max_contention_retries {
            let table = self.backend.read_all().await?;
            let Some((mut entry, etag)) = table.get(&target).cloned() else {
                return Ok(());
            };
            if entry.status == SiloStatus::Dead {
                return Ok(());
            }

            let now = epoch_ms();
            entry.add_suspector(self.local, now, window_ms);
            if entry.fresh_suspector_count(now, window_ms) >= self.config.suspector_threshold {
                warn!(%target, "suspicion threshold reached, declaring dead");
                entry.status = SiloStatus::Dead;
            }

            if self
                .backend
                .update_row(entry, &etag, &table.version)
                .await?
            {
                let _ = self.refresh_once().await;
                return Ok(());
            }
            debug!(%target, "suspicion contention, re-reading");
        }
        Err(MembershipError::Contention {
            silo: target,
            attempts: self.config.max_contention_retries,
        })
    }
}

/// Hash position of a silo on the probe ring.
fn ring_position(silo: &SiloAddress) -> u64 {
    let mut hasher = RapidHasher::new(PROBE_RING_SEED);
    silo.hash(&mut hasher);
    hasher.finish()
}

/// The `fanout` ring successors of `local` among silos worth probing
/// (Active or Joining peers).
fn probe_targets(
    snapshot: &ClusterSnapshot,
    local: SiloAddress,
    fanout: usize,
) -> Vec<SiloAddress> {
    let mut candidates: Vec<(u64, SiloAddress)> = snapshot
        .members
        .iter()
        .filter(|(silo, status)| {
            **silo != local && matches!(status, SiloStatus::Active | SiloStatus::Joining)
        })
        .map(|(silo, _)| (ring_position(silo), *silo))
        .collect();
    if candidates.is_empty() {
        return Vec::new();
    }
    candidates.sort();

    let own = ring_position(&local);
    let start = candidates.partition_point(|(h, _)| *h <= own);
    candidates
        .iter()
        .cycle()
        .skip(start)
        .take(fanout.min(candidates.len()))
        .map(|(_, silo)| *silo)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use granary_core::NetworkAddress;

    use crate::membership::backend::InMemoryMembershipTable;

    use super::*;

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(NetworkAddress::localhost(port), 1)
    }

    /// Prober that answers for every silo not in the `down` set.
    #[derive(Debug, Default)]
    struct FakeProber {
        down: Mutex<HashSet<SiloAddress>>,
    }

    impl FakeProber {
        fn kill(&self, silo: SiloAddress) {
            self.down.lock().insert(silo);
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, target: SiloAddress) -> bool {
            !self.down.lock().contains(&target)
        }
    }

    fn oracle(
        silo_addr: SiloAddress,
        backend: Arc<InMemoryMembershipTable>,
        prober: Arc<FakeProber>,
    ) -> MembershipOracle {
        MembershipOracle::new(
            silo_addr,
            "host",
            "role",
            MembershipConfig::local(),
            backend,
            prober,
        )
    }

    #[tokio::test]
    async fn test_join_transitions_to_active() {
        let backend = Arc::new(InMemoryMembershipTable::new());
        let prober = Arc::new(FakeProber::default());
        let o = oracle(silo(1), backend.clone(), prober);

        o.join().await.expect("join");
        let snapshot = o.snapshot();
        assert_eq!(snapshot.status_of(&silo(1)), Some(SiloStatus::Active));
        assert_eq!(snapshot.active_silos(), vec![silo(1)]);
    }

    #[tokio::test]
    async fn test_concurrent_joins_converge() {
        let backend = Arc::new(InMemoryMembershipTable::new());
        let prober = Arc::new(FakeProber::default());
        let oracles: Vec<_> = (1..=3)
            .map(|p| oracle(silo(p), backend.clone(), prober.clone()))
            .collect();

        let joins: Vec<_> = oracles.iter().map(|o| o.join()).collect();
        for result in futures::future::join_all(joins).await {
            result.expect("join");
        }

        let table = backend.read_all().await.expect("read");
        assert_eq!(table.entries.len(), 3);
        assert_eq!(table.active_silos().len(), 3);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_reaches_dead() {
        let backend = Arc::new(InMemoryMembershipTable::new());
        let prober = Arc::new(FakeProber::default());
        let o = oracle(silo(1), backend.clone(), prober);
        o.join().await.expect("join");
        o.shutdown().await;

        let table = backend.read_all().await.expect("read");
        assert_eq!(table.get(&silo(1)).expect("row").0.status, SiloStatus::Dead);
    }

    #[tokio::test]
    async fn test_version_strictly_increases_across_updates() {
        let backend = Arc::new(InMemoryMembershipTable::new());
        let prober = Arc::new(FakeProber::default());
        let o = oracle(silo(1), backend.clone(), prober);

        backend.initialize().await.expect("init");
        let mut last = backend.read_all().await.expect("read").version.version;
        o.join().await.expect("join");
        let v = backend.read_all().await.expect("read").version.version;
        assert!(v > last);
        last = v;

        o.update_status(SiloStatus::ShuttingDown).await.expect("update");
        let v = backend.read_all().await.expect("read").version.version;
        assert!(v > last);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let backend = Arc::new(InMemoryMembershipTable::new());
        let prober = Arc::new(FakeProber::default());
        let o = oracle(silo(1), backend.clone(), prober);
        o.join().await.expect("join");

        let result = o.update_status(SiloStatus::Joining).await;
        assert!(matches!(
            result,
            Err(MembershipError::IllegalTransition { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_peer_is_declared_dead_by_suspicion() {
        let backend = Arc::new(InMemoryMembershipTable::new());
        let prober = Arc::new(FakeProber::default());
        let o1 = oracle(silo(1), backend.clone(), prober.clone());
        let o2 = oracle(silo(2), backend.clone(), prober.clone());

        o1.join().await.expect("join 1");
        o2.join().await.expect("join 2");
        o1.start();

        // Silo 2 stops answering probes (threshold is 1 in local config).
        prober.kill(silo(2));
        tokio::time::sleep(Duration::from_secs(2)).await;

        let table = backend.read_all().await.expect("read");
        assert_eq!(table.get(&silo(2)).expect("row").0.status, SiloStatus::Dead);
        o1.stop_tasks();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silo_observes_own_death() {
        let backend = Arc::new(InMemoryMembershipTable::new());
        let prober = Arc::new(FakeProber::default());
        let o1 = oracle(silo(1), backend.clone(), prober.clone());
        let o2 = oracle(silo(2), backend.clone(), prober.clone());

        o1.join().await.expect("join 1");
        o2.join().await.expect("join 2");
        o1.start();
        o2.start();

        prober.kill(silo(2));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(o2.is_self_dead());
        // Any further status write from the dead silo is refused.
        assert!(matches!(
            o2.update_status(SiloStatus::ShuttingDown).await,
            Err(MembershipError::DeclaredDead(_))
        ));
        o1.stop_tasks();
        o2.stop_tasks();
    }

    #[test]
    fn test_probe_targets_deterministic_and_skip_self() {
        let mut snapshot = ClusterSnapshot::default();
        for p in 1..=5 {
            snapshot.members.insert(silo(p), SiloStatus::Active);
        }
        let a = probe_targets(&snapshot, silo(1), 2);
        let b = probe_targets(&snapshot, silo(1), 2);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert!(!a.contains(&silo(1)));
    }

    #[test]
    fn test_probe_targets_wrap_around_ring() {
        let mut snapshot = ClusterSnapshot::default();
        for p in 1..=3 {
            snapshot.members.insert(silo(p), SiloStatus::Active);
        }
        // With fanout >= peers, everyone else gets probed exactly once.
        let targets = probe_targets(&snapshot, silo(1), 10);
        let unique: HashSet<_> = targets.iter().copied().collect();
        assert_eq!(unique.len(), 2);
    }
}
