//! Consistent hash ring over active silos.
//!
//! Each silo occupies one position on a 32-bit ring; the owner of a grain
//! is the silo whose position immediately succeeds the grain's uniform
//! hash (wrapping at the top). Positions come from a fixed-seed hash of
//! the silo address, so every silo computes an identical ring from the
//! same membership snapshot.

use std::hash::{Hash, Hasher};

use rapidhash::RapidHasher;

use granary_core::{GrainId, SiloAddress};

/// Seed for silo ring positions.
const SILO_RING_SEED: u64 = 0x73696c6f_72696e67;

/// A half-open ring interval. `begin < end` means `(begin, end]`;
/// `begin >= end` wraps through the top of the ring.
pub type RingRange = (u32, u32);

/// Whether `hash` falls inside the ring interval `(begin, end]`.
pub fn range_contains(range: RingRange, hash: u32) -> bool {
    let (begin, end) = range;
    if begin < end {
        hash > begin && hash <= end
    } else {
        // Wrap: (begin, MAX] plus [0, end]. A degenerate single-silo ring
        // (begin == end) owns everything.
        hash > begin || hash <= end
    }
}

/// Ring position of a silo.
pub fn silo_position(silo: &SiloAddress) -> u32 {
    let mut hasher = RapidHasher::new(SILO_RING_SEED);
    silo.hash(&mut hasher);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

/// Immutable ring built from one membership snapshot.
#[derive(Debug, Clone, Default)]
pub struct ConsistentRing {
    /// (position, silo), sorted by position.
    positions: Vec<(u32, SiloAddress)>,
}

impl ConsistentRing {
    /// Build a ring from the given silos.
    pub fn new(silos: impl IntoIterator<Item = SiloAddress>) -> Self {
        let mut positions: Vec<(u32, SiloAddress)> = silos
            .into_iter()
            .map(|s| (silo_position(&s), s))
            .collect();
        positions.sort();
        positions.dedup();
        Self { positions }
    }

    /// Whether the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Whether `silo` is on the ring.
    pub fn contains(&self, silo: &SiloAddress) -> bool {
        self.positions.iter().any(|(_, s)| s == silo)
    }

    /// Members of the ring.
    pub fn silos(&self) -> impl Iterator<Item = SiloAddress> + '_ {
        self.positions.iter().map(|(_, s)| *s)
    }

    /// The silo owning ring position `hash`: the first position at or
    /// after it, wrapping to the smallest.
    pub fn owner_of_hash(&self, hash: u32) -> Option<SiloAddress> {
        if self.positions.is_empty() {
            return None;
        }
        let idx = self.positions.partition_point(|(p, _)| *p < hash);
        let (_, silo) = self.positions[idx % self.positions.len()];
        Some(silo)
    }

    /// The silo owning a grain's authoritative directory entry.
    pub fn owner_of(&self, grain: &GrainId) -> Option<SiloAddress> {
        grain
            .pinned_silo()
            .or_else(|| self.owner_of_hash(grain.uniform_hash()))
    }

    /// The ring interval `silo` owns: `(predecessor position, own
    /// position]`, wrapping on a single-member or boundary-spanning ring.
    pub fn range_of(&self, silo: &SiloAddress) -> Option<RingRange> {
        let idx = self.positions.iter().position(|(_, s)| s == silo)?;
        let own = self.positions[idx].0;
        let pred = if self.positions.len() == 1 {
            own
        } else if idx == 0 {
            self.positions[self.positions.len() - 1].0
        } else {
            self.positions[idx - 1].0
        };
        Some((pred, own))
    }
}
