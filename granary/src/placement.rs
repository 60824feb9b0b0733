//! Placement: deciding which silo hosts a new activation.
//!
//! Two pieces, kept separate on purpose: [`PlacementStrategy`] is a
//! lightweight per-grain-type hint declared at registration;
//! [`PlacementDirector`] is the cluster-level algorithm that interprets
//! the hint against the current membership and load view. Placement is
//! advisory — whoever wins directory registration hosts the grain.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use rapidhash::RapidHasher;

use granary_core::{GrainId, SiloAddress};

use crate::membership::ClusterSnapshot;

/// Seed for rendezvous placement scoring.
const PLACEMENT_SEED: u64 = 0x706c6163_656d656e;

/// Errors from placement decisions.
#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    /// No silo is eligible to host the grain.
    #[error("no placement candidates for grain {0}")]
    NoCandidates(GrainId),
}

/// Per-grain-type placement hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementStrategy {
    /// Uniformly random over active, non-overloaded silos.
    #[default]
    RandomActive,
    /// The calling silo when eligible, else random.
    PreferLocal,
    /// Deterministic rendezvous hash of the grain id over active silos;
    /// stable under membership change.
    HashBased,
    /// The silo with the lowest weighted (activations, cpu, memory) load.
    ActivityCount,
    /// Local pool of interchangeable workers, up to `max_local`
    /// concurrent activations, with no cluster-wide uniqueness.
    StatelessWorker {
        /// Cap on concurrent local activations of the type.
        max_local: usize,
    },
}

/// One silo's load report.
#[derive(Debug, Clone, Copy, Default)]
pub struct SiloLoad {
    /// Activations currently hosted.
    pub activation_count: usize,
    /// CPU usage fraction, 0.0–1.0.
    pub cpu_usage: f64,
    /// Memory usage fraction, 0.0–1.0.
    pub memory_usage: f64,
    /// Whether the silo is shedding load.
    pub overloaded: bool,
}

impl SiloLoad {
    /// Composite weight used by [`PlacementStrategy::ActivityCount`]:
    /// activations scaled by resource headroom.
    pub fn weight(&self) -> f64 {
        (self.activation_count as f64 + 1.0) * (1.0 + self.cpu_usage + self.memory_usage)
    }
}

/// Cluster-wide load view fed by each silo's periodic reports.
pub trait LoadPublisher: Send + Sync + fmt::Debug {
    /// The last load report for a silo, if one arrived.
    fn load_of(&self, silo: &SiloAddress) -> Option<SiloLoad>;

    /// Record a silo's report.
    fn publish(&self, silo: SiloAddress, load: SiloLoad);
}

/// In-memory load view shared within a process.
#[derive(Debug, Default)]
pub struct SharedLoadView {
    loads: RwLock<HashMap<SiloAddress, SiloLoad>>,
}

impl SharedLoadView {
    /// Empty view.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadPublisher for SharedLoadView {
    fn load_of(&self, silo: &SiloAddress) -> Option<SiloLoad> {
        self.loads.read().get(silo).copied()
    }

    fn publish(&self, silo: SiloAddress, load: SiloLoad) {
        self.loads.write().insert(silo, load);
    }
}

/// Interprets a [`PlacementStrategy`] into a concrete target silo.
#[async_trait]
pub trait PlacementDirector: Send + Sync + fmt::Debug {
    /// Choose a silo for a new activation of `grain`.
    async fn place(
        &self,
        strategy: PlacementStrategy,
        grain: &GrainId,
        snapshot: &ClusterSnapshot,
        local: SiloAddress,
        load: &dyn LoadPublisher,
    ) -> Result<SiloAddress, PlacementError>;
}

/// Built-in director covering every strategy.
#[derive(Debug, Default)]
pub struct DefaultPlacementDirector;

#[async_trait]
impl PlacementDirector for DefaultPlacementDirector {
    async fn place(
        &self,
        strategy: PlacementStrategy,
        grain: &GrainId,
        snapshot: &ClusterSnapshot,
        local: SiloAddress,
        load: &dyn LoadPublisher,
    ) -> Result<SiloAddress, PlacementError> {
        // System grains are pinned by their key and never "placed".
        if let Some(pinned) = grain.pinned_silo() {
            return Ok(pinned);
        }

        let eligible: Vec<SiloAddress> = snapshot
            .active_silos()
            .into_iter()
            .filter(|s| !load.load_of(s).is_some_and(|l| l.overloaded))
            .collect();

        match strategy {
            PlacementStrategy::StatelessWorker { .. } => Ok(local),
            PlacementStrategy::PreferLocal => {
                if eligible.contains(&local) {
                    Ok(local)
                } else {
                    pick_random(grain, &eligible)
                }
            }
            PlacementStrategy::RandomActive => pick_random(grain, &eligible),
            PlacementStrategy::HashBased => pick_rendezvous(grain, &eligible),
            PlacementStrategy::ActivityCount => {
                let best = eligible
                    .iter()
                    .min_by(|a, b| {
                        let wa = load.load_of(a).unwrap_or_default().weight();
                        let wb = load.load_of(b).unwrap_or_default().weight();
                        wa.partial_cmp(&wb).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .copied();
                best.ok_or_else(|| PlacementError::NoCandidates(grain.clone()))
            }
        }
    }
}

fn pick_random(grain: &GrainId, eligible: &[SiloAddress]) -> Result<SiloAddress, PlacementError> {
    if eligible.is_empty() {
        return Err(PlacementError::NoCandidates(grain.clone()));
    }
    let index = rand::rng().random_range(0..eligible.len());
    Ok(eligible[index])
}

/// Rendezvous hashing: score every silo against the grain, take the max.
/// Adding or removing one silo only moves the grains that silo wins.
fn pick_rendezvous(
    grain: &GrainId,
    eligible: &[SiloAddress],
) -> Result<SiloAddress, PlacementError> {
    eligible
        .iter()
        .max_by_key(|silo| {
            let mut hasher = RapidHasher::new(PLACEMENT_SEED);
            grain.hash(&mut hasher);
            silo.hash(&mut hasher);
            hasher.finish()
        })
        .copied()
        .ok_or_else(|| PlacementError::NoCandidates(grain.clone()))
}

/// Convenience wrapper used by the router: a director plus its load view.
pub struct Placement {
    director: Arc<dyn PlacementDirector>,
    load: Arc<dyn LoadPublisher>,
}

impl fmt::Debug for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Placement").finish()
    }
}

impl Placement {
    /// Placement with the default director and a fresh load view.
    pub fn new() -> Self {
        Self {
            director: Arc::new(DefaultPlacementDirector),
            load: Arc::new(SharedLoadView::new()),
        }
    }

    /// Placement with custom parts.
    pub fn with_parts(director: Arc<dyn PlacementDirector>, load: Arc<dyn LoadPublisher>) -> Self {
        Self { director, load }
    }

    /// The shared load view.
    pub fn load(&self) -> &Arc<dyn LoadPublisher> {
        &self.load
    }

    /// Choose a silo for a new activation.
    ///
    /// # Errors
    ///
    /// [`PlacementError::NoCandidates`] when nothing is eligible.
    pub async fn place(
        &self,
        strategy: PlacementStrategy,
        grain: &GrainId,
        snapshot: &ClusterSnapshot,
        local: SiloAddress,
    ) -> Result<SiloAddress, PlacementError> {
        self.director
            .place(strategy, grain, snapshot, local, self.load.as_ref())
            .await
    }
}

impl Default for Placement {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use granary_core::{GrainType, NetworkAddress};

    use crate::membership::SiloStatus;

    use super::*;

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(NetworkAddress::localhost(port), 1)
    }

    fn snapshot(active: &[SiloAddress]) -> ClusterSnapshot {
        let mut s = ClusterSnapshot::default();
        for a in active {
            s.members.insert(*a, SiloStatus::Active);
        }
        s
    }

    fn grain(name: &str) -> GrainId {
        GrainId::text(GrainType(0xBA4E), name)
    }

    #[tokio::test]
    async fn test_prefer_local_picks_local_when_eligible() {
        let placement = Placement::new();
        let snap = snapshot(&[silo(1), silo(2)]);
        let chosen = placement
            .place(PlacementStrategy::PreferLocal, &grain("g"), &snap, silo(1))
            .await
            .expect("place");
        assert_eq!(chosen, silo(1));
    }

    #[tokio::test]
    async fn test_prefer_local_falls_back_when_local_overloaded() {
        let placement = Placement::new();
        placement.load().publish(
            silo(1),
            SiloLoad {
                overloaded: true,
                ..Default::default()
            },
        );
        let snap = snapshot(&[silo(1), silo(2)]);
        let chosen = placement
            .place(PlacementStrategy::PreferLocal, &grain("g"), &snap, silo(1))
            .await
            .expect("place");
        assert_eq!(chosen, silo(2));
    }

    #[tokio::test]
    async fn test_random_excludes_overloaded() {
        let placement = Placement::new();
        placement.load().publish(
            silo(2),
            SiloLoad {
                overloaded: true,
                ..Default::default()
            },
        );
        let snap = snapshot(&[silo(1), silo(2)]);
        for _ in 0..20 {
            let chosen = placement
                .place(PlacementStrategy::RandomActive, &grain("g"), &snap, silo(1))
                .await
                .expect("place");
            assert_eq!(chosen, silo(1));
        }
    }

    #[tokio::test]
    async fn test_random_with_no_candidates_errors() {
        let placement = Placement::new();
        let snap = snapshot(&[]);
        let result = placement
            .place(PlacementStrategy::RandomActive, &grain("g"), &snap, silo(1))
            .await;
        assert!(matches!(result, Err(PlacementError::NoCandidates(_))));
    }

    #[tokio::test]
    async fn test_hash_based_is_deterministic() {
        let placement = Placement::new();
        let snap = snapshot(&[silo(1), silo(2), silo(3)]);
        let first = placement
            .place(PlacementStrategy::HashBased, &grain("g"), &snap, silo(1))
            .await
            .expect("place");
        for caller in [silo(1), silo(2), silo(3)] {
            let again = placement
                .place(PlacementStrategy::HashBased, &grain("g"), &snap, caller)
                .await
                .expect("place");
            assert_eq!(again, first);
        }
    }

    #[tokio::test]
    async fn test_hash_based_is_stable_under_membership_change() {
        let placement = Placement::new();
        let before = snapshot(&[silo(1), silo(2), silo(3)]);
        let after = snapshot(&[silo(1), silo(2)]);

        for i in 0..100 {
            let g = grain(&format!("g{i}"));
            let old = placement
                .place(PlacementStrategy::HashBased, &g, &before, silo(1))
                .await
                .expect("place");
            if old != silo(3) {
                let new = placement
                    .place(PlacementStrategy::HashBased, &g, &after, silo(1))
                    .await
                    .expect("place");
                assert_eq!(new, old, "grain {g} moved despite surviving owner");
            }
        }
    }

    #[tokio::test]
    async fn test_activity_count_prefers_least_loaded() {
        let placement = Placement::new();
        placement.load().publish(
            silo(1),
            SiloLoad {
                activation_count: 1000,
                cpu_usage: 0.9,
                ..Default::default()
            },
        );
        placement.load().publish(
            silo(2),
            SiloLoad {
                activation_count: 3,
                cpu_usage: 0.1,
                ..Default::default()
            },
        );
        let snap = snapshot(&[silo(1), silo(2)]);
        let chosen = placement
            .place(PlacementStrategy::ActivityCount, &grain("g"), &snap, silo(1))
            .await
            .expect("place");
        assert_eq!(chosen, silo(2));
    }

    #[tokio::test]
    async fn test_stateless_worker_stays_local() {
        let placement = Placement::new();
        let snap = snapshot(&[silo(1), silo(2)]);
        let chosen = placement
            .place(
                PlacementStrategy::StatelessWorker { max_local: 8 },
                &grain("g"),
                &snap,
                silo(2),
            )
            .await
            .expect("place");
        assert_eq!(chosen, silo(2));
    }

    #[tokio::test]
    async fn test_pinned_system_grain_short_circuits() {
        let placement = Placement::new();
        let snap = snapshot(&[silo(1)]);
        let pinned = GrainId::system(GrainType::DIRECTORY, silo(7));
        let chosen = placement
            .place(PlacementStrategy::RandomActive, &pinned, &snap, silo(1))
            .await
            .expect("place");
        assert_eq!(chosen, silo(7));
    }
}
