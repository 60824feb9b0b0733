//! The membership table model.
//!
//! One row per silo incarnation, plus a version row. Every mutation is
//! optimistic: writers carry the version tag they read, and the backend
//! rejects on mismatch. The version strictly increases with every
//! successful write, which is what lets any silo order snapshots.

use serde::{Deserialize, Serialize};

use granary_core::{MembershipVersion, SiloAddress};

/// Lifecycle status of a silo.
///
/// Legal transitions: Created → Joining → Active →
/// (ShuttingDown | Stopping) → Dead, plus Any → Dead forced by peers.
/// The derived ordering backs the monotonicity invariant: a peer never
/// observes a silo move backwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SiloStatus {
    /// Row inserted, protocol not started.
    Created,
    /// Announced, not yet serving.
    Joining,
    /// Fully operational.
    Active,
    /// Graceful shutdown: draining activations.
    ShuttingDown,
    /// Graceful shutdown: drained, final table writes in flight.
    Stopping,
    /// Gone. A Dead silo never returns under the same generation.
    Dead,
}

impl SiloStatus {
    /// Whether the silo can host activations and serve requests.
    pub fn is_active(self) -> bool {
        self == SiloStatus::Active
    }

    /// Whether the status permits transitioning to `next`.
    pub fn can_transition_to(self, next: SiloStatus) -> bool {
        use SiloStatus::*;
        match (self, next) {
            (_, Dead) => self != Dead,
            (Created, Joining) => true,
            (Joining, Active) => true,
            (Active, ShuttingDown) | (Active, Stopping) => true,
            (ShuttingDown, Stopping) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SiloStatus::Created => "Created",
            SiloStatus::Joining => "Joining",
            SiloStatus::Active => "Active",
            SiloStatus::ShuttingDown => "ShuttingDown",
            SiloStatus::Stopping => "Stopping",
            SiloStatus::Dead => "Dead",
        };
        f.write_str(s)
    }
}

/// One membership table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    /// The silo this row describes.
    pub silo: SiloAddress,
    /// Host name, for operators.
    pub host_name: String,
    /// Role tag.
    pub role: String,
    /// Current lifecycle status.
    pub status: SiloStatus,
    /// Process start time, ms since epoch.
    pub start_time_ms: u64,
    /// Last I-am-alive heartbeat, ms since epoch.
    pub i_am_alive_ms: u64,
    /// Update zone tag (rolling-upgrade grouping).
    pub update_zone: i32,
    /// Fault zone tag (failure-domain grouping).
    pub fault_zone: i32,
    /// Silos that failed to probe this one, with suspect times.
    pub suspecters: Vec<(SiloAddress, u64)>,
}

impl MembershipEntry {
    /// Fresh row for a silo announcing itself.
    pub fn new(
        silo: SiloAddress,
        host_name: impl Into<String>,
        role: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            silo,
            host_name: host_name.into(),
            role: role.into(),
            status: SiloStatus::Joining,
            start_time_ms: now_ms,
            i_am_alive_ms: now_ms,
            update_zone: 0,
            fault_zone: 0,
            suspecters: Vec::new(),
        }
    }

    /// Record a suspicion, pruning entries outside the sliding window and
    /// collapsing repeat suspicions from the same silo to the newest.
    pub fn add_suspector(&mut self, suspector: SiloAddress, now_ms: u64, window_ms: u64) {
        self.suspecters
            .retain(|(s, t)| *s != suspector && now_ms.saturating_sub(*t) <= window_ms);
        self.suspecters.push((suspector, now_ms));
    }

    /// Distinct silos suspecting this one within the window.
    pub fn fresh_suspector_count(&self, now_ms: u64, window_ms: u64) -> usize {
        self.suspecters
            .iter()
            .filter(|(_, t)| now_ms.saturating_sub(*t) <= window_ms)
            .count()
    }
}

/// The table version row: monotone counter plus an opaque concurrency tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TableVersion {
    /// Monotonically increasing version.
    pub version: MembershipVersion,
    /// Opaque tag the backend compares on conditional writes.
    pub etag: String,
}

/// A read of the membership table: rows with their etags, plus the
/// version row.
#[derive(Debug, Clone, Default)]
pub struct MembershipTable {
    /// Rows and their concurrency tags.
    pub entries: Vec<(MembershipEntry, String)>,
    /// The table version at read time.
    pub version: TableVersion,
}

impl MembershipTable {
    /// Find a row by silo address.
    pub fn get(&self, silo: &SiloAddress) -> Option<&(MembershipEntry, String)> {
        self.entries.iter().find(|(e, _)| e.silo == *silo)
    }

    /// All silos currently Active.
    pub fn active_silos(&self) -> Vec<SiloAddress> {
        self.entries
            .iter()
            .filter(|(e, _)| e.status.is_active())
            .map(|(e, _)| e.silo)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use granary_core::NetworkAddress;

    use super::*;

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(NetworkAddress::localhost(port), 1)
    }

    #[test]
    fn test_status_ordering_matches_lifecycle() {
        use SiloStatus::*;
        assert!(Created < Joining);
        assert!(Joining < Active);
        assert!(Active < ShuttingDown);
        assert!(ShuttingDown < Stopping);
        assert!(Stopping < Dead);
    }

    #[test]
    fn test_legal_transitions() {
        use SiloStatus::*;
        assert!(Created.can_transition_to(Joining));
        assert!(Joining.can_transition_to(Active));
        assert!(Active.can_transition_to(ShuttingDown));
        assert!(Active.can_transition_to(Stopping));
        assert!(ShuttingDown.can_transition_to(Stopping));
        // Forced death from anywhere but Dead itself.
        assert!(Joining.can_transition_to(Dead));
        assert!(Active.can_transition_to(Dead));
        assert!(!Dead.can_transition_to(Dead));
        // No going backwards.
        assert!(!Active.can_transition_to(Joining));
        assert!(!Dead.can_transition_to(Active));
        assert!(!Stopping.can_transition_to(ShuttingDown));
    }

    #[test]
    fn test_suspector_window_pruning() {
        let mut entry = MembershipEntry::new(silo(1), "h", "r", 1_000);
        entry.add_suspector(silo(2), 1_000, 500);
        entry.add_suspector(silo(3), 1_200, 500);
        assert_eq!(entry.fresh_suspector_count(1_200, 500), 2);
        // At t=1600 the first suspicion has aged out.
        assert_eq!(entry.fresh_suspector_count(1_600, 500), 1);
    }

    #[test]
    fn test_repeat_suspicion_from_same_silo_counts_once() {
        let mut entry = MembershipEntry::new(silo(1), "h", "r", 0);
        entry.add_suspector(silo(2), 100, 1_000);
        entry.add_suspector(silo(2), 200, 1_000);
        assert_eq!(entry.fresh_suspector_count(200, 1_000), 1);
    }

    proptest::proptest! {
        /// Any sequence of legal transitions yields a non-decreasing
        /// status sequence, and nothing follows Dead.
        #[test]
        fn prop_legal_transitions_are_monotone(steps in proptest::collection::vec(0usize..6, 0..40)) {
            use SiloStatus::*;
            let all = [Created, Joining, Active, ShuttingDown, Stopping, Dead];
            let mut current = Created;
            let mut observed = vec![current];
            for step in steps {
                let next = all[step];
                if current.can_transition_to(next) {
                    current = next;
                    observed.push(current);
                }
            }
            for pair in observed.windows(2) {
                proptest::prop_assert!(pair[0] < pair[1]);
            }
            if observed.contains(&Dead) {
                proptest::prop_assert_eq!(*observed.last().expect("nonempty"), Dead);
            }
        }
    }

    #[test]
    fn test_table_lookup_and_active_filter() {
        let mut table = MembershipTable::default();
        let mut a = MembershipEntry::new(silo(1), "a", "r", 0);
        a.status = SiloStatus::Active;
        let b = MembershipEntry::new(silo(2), "b", "r", 0);
        table.entries.push((a, "e1".into()));
        table.entries.push((b, "e2".into()));

        assert!(table.get(&silo(1)).is_some());
        assert!(table.get(&silo(9)).is_none());
        assert_eq!(table.active_silos(), vec![silo(1)]);
    }
}
