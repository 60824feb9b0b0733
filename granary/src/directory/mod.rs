//! The grain directory: grain identity → current activation address.
//!
//! Authoritative entries are sharded across silos by a consistent hash
//! ring over Active members; every silo additionally keeps a bounded LRU
//! cache of entries it does not own. Remote owner calls travel as system
//! messages through the [`DirectoryTransport`] seam, which the router
//! implements; tests wire directories to each other directly.
//!
//! Registration is exactly-once in the steady state: the owner serializes
//! concurrent registrations for a grain and resolves races
//! deterministically — the lower (silo, activation) tuple wins, and the
//! loser deactivates.

pub mod cache;
pub mod ring;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use granary_core::{ActivationAddress, GrainId, SiloAddress};

use crate::membership::ClusterSnapshot;

pub use cache::DirectoryCache;
pub use ring::{ConsistentRing, RingRange, range_contains};

/// Errors from directory operations.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The ring has no active silos to own the entry.
    #[error("no active owner for grain {0}")]
    NoActiveOwner(GrainId),

    /// A remote silo asked us to serve an entry we do not own.
    #[error("not the owner of grain {grain} (owner is {owner})")]
    WrongOwner {
        /// The grain in question.
        grain: GrainId,
        /// Who we believe owns it.
        owner: SiloAddress,
    },

    /// The owner could not be reached.
    #[error("directory transport error: {0}")]
    Transport(String),
}

/// How the directory reaches remote partition owners.
#[async_trait]
pub trait DirectoryTransport: Send + Sync + fmt::Debug {
    /// Register `address` with the partition owner; returns the winner.
    async fn register_remote(
        &self,
        owner: SiloAddress,
        address: ActivationAddress,
    ) -> Result<ActivationAddress, DirectoryError>;

    /// Remove `address` from the partition owner (activation must match).
    async fn unregister_remote(
        &self,
        owner: SiloAddress,
        address: ActivationAddress,
    ) -> Result<(), DirectoryError>;

    /// Ask the partition owner for a grain's current address.
    async fn lookup_remote(
        &self,
        owner: SiloAddress,
        grain: GrainId,
    ) -> Result<Option<ActivationAddress>, DirectoryError>;
}

/// One silo's view of the cluster directory.
pub struct GrainDirectory {
    local: SiloAddress,
    /// Authoritative entries this silo owns.
    partition: Mutex<HashMap<GrainId, ActivationAddress>>,
    /// Non-owned entries, kept coherent by invalidation headers.
    cache: DirectoryCache,
    rings: Mutex<RingState>,
    transport: Arc<dyn DirectoryTransport>,
}

#[derive(Debug, Default)]
struct RingState {
    current: ConsistentRing,
    /// Ring before the last membership change, for lazy partition
    /// migration: a fresh owner probes the previous owner on miss.
    previous: Option<ConsistentRing>,
}

impl fmt::Debug for GrainDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrainDirectory")
            .field("local", &self.local)
            .field("partition", &self.partition.lock().len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl GrainDirectory {
    /// Directory for `local`, with a cache bound and an owner transport.
    pub fn new(
        local: SiloAddress,
        cache_capacity: usize,
        transport: Arc<dyn DirectoryTransport>,
    ) -> Self {
        Self {
            local,
            partition: Mutex::new(HashMap::new()),
            cache: DirectoryCache::new(cache_capacity),
            rings: Mutex::new(RingState::default()),
            transport,
        }
    }

    /// The silo that owns a grain's authoritative entry.
    pub fn owner_of(&self, grain: &GrainId) -> Option<SiloAddress> {
        self.rings.lock().current.owner_of(grain)
    }

    /// Ring interval owned by this silo (for reminder responsibility).
    pub fn local_range(&self) -> Option<RingRange> {
        self.rings.lock().current.range_of(&self.local)
    }

    /// Register an activation; returns the cluster-wide winner.
    ///
    /// # Errors
    ///
    /// `NoActiveOwner` on an empty ring; transport errors from remote
    /// owners.
    pub async fn register(
        &self,
        address: ActivationAddress,
    ) -> Result<ActivationAddress, DirectoryError> {
        let owner = self
            .owner_of(&address.grain)
            .ok_or_else(|| DirectoryError::NoActiveOwner(address.grain.clone()))?;

        let winner = if owner == self.local {
            self.register_local(address)
        } else {
            self.transport.register_remote(owner, address).await?
        };

        if winner.silo != self.local {
            self.cache.insert(winner.clone());
        }
        Ok(winner)
    }

    /// Owner-side registration.
    ///
    /// The owner serializes concurrent registrations: the first claim for
    /// a grain wins and every later caller is handed that winner back, so
    /// racing callers all converge on one address. Entries pointing at
    /// silos that left the ring are replaced outright.
    pub fn register_local(&self, address: ActivationAddress) -> ActivationAddress {
        let ring_alive = |silo: &SiloAddress| self.rings.lock().current.contains(silo);
        let mut partition = self.partition.lock();
        match partition.get(&address.grain) {
            None => {
                partition.insert(address.grain.clone(), address.clone());
                address
            }
            Some(existing) if existing == &address => address,
            Some(existing) if !ring_alive(&existing.silo) => {
                debug!(grain = %address.grain, "replacing entry of departed silo");
                partition.insert(address.grain.clone(), address.clone());
                address
            }
            Some(existing) => existing.clone(),
        }
    }

    /// Merge two authoritative claims for one grain, as happens when a
    /// fresh owner absorbs an entry from the previous owner while already
    /// holding a registration of its own. Deterministic: the lower
    /// (silo, activation) tuple wins on every silo that evaluates it; the
    /// loser is deactivated and its address invalidated through the
    /// rejection/invalidation path.
    pub fn merge_claims(&self, address: ActivationAddress) -> ActivationAddress {
        let mut partition = self.partition.lock();
        match partition.get(&address.grain) {
            None => {
                partition.insert(address.grain.clone(), address.clone());
                address
            }
            Some(existing) if address.wins_over(existing) => {
                debug!(grain = %address.grain, winner = %address, loser = %existing,
                    "duplicate claims merged, lower tuple wins");
                partition.insert(address.grain.clone(), address.clone());
                address
            }
            Some(existing) => existing.clone(),
        }
    }

    /// Resolve a grain to its current activation address.
    ///
    /// # Errors
    ///
    /// Transport errors from remote owners.
    pub async fn lookup(
        &self,
        grain: &GrainId,
    ) -> Result<Option<ActivationAddress>, DirectoryError> {
        let Some(owner) = self.owner_of(grain) else {
            return Ok(None);
        };

        if owner == self.local {
            if let Some(found) = self.lookup_local(grain) {
                return Ok(Some(found));
            }
            // Fresh owner after a membership change: rebuild lazily from
            // the previous owner when it is still with us. If a new
            // registration already landed here, two authoritative claims
            // meet and the deterministic merge decides.
            if let Some(previous_owner) = self.migration_source(grain) {
                let found = self
                    .transport
                    .lookup_remote(previous_owner, grain.clone())
                    .await?;
                if let Some(address) = found {
                    let address = self.merge_claims(address);
                    return Ok(Some(address));
                }
            }
            return Ok(None);
        }

        if let Some(cached) = self.cache.get(grain) {
            return Ok(Some(cached));
        }
        let found = self.transport.lookup_remote(owner, grain.clone()).await?;
        if let Some(address) = &found {
            self.cache.insert(address.clone());
        }
        Ok(found)
    }

    /// Owner-side lookup.
    pub fn lookup_local(&self, grain: &GrainId) -> Option<ActivationAddress> {
        self.partition.lock().get(grain).cloned()
    }

    /// Remove an activation's entry everywhere it might be.
    ///
    /// # Errors
    ///
    /// Transport errors from remote owners.
    pub async fn unregister(&self, address: &ActivationAddress) -> Result<(), DirectoryError> {
        self.cache.invalidate_address(address);
        match self.owner_of(&address.grain) {
            Some(owner) if owner == self.local => {
                self.unregister_local(address);
                Ok(())
            }
            Some(owner) => {
                self.transport
                    .unregister_remote(owner, address.clone())
                    .await
            }
            None => Ok(()),
        }
    }

    /// Owner-side unregistration; only removes a matching activation, so
    /// a stale unregister cannot evict a newer activation.
    pub fn unregister_local(&self, address: &ActivationAddress) -> bool {
        let mut partition = self.partition.lock();
        match partition.get(&address.grain) {
            Some(existing) if existing.activation == address.activation => {
                partition.remove(&address.grain);
                true
            }
            _ => false,
        }
    }

    /// Drop any cached address for a grain.
    pub fn invalidate(&self, grain: &GrainId) {
        self.cache.invalidate(grain);
    }

    /// Apply a response message's cache-invalidation header.
    pub fn apply_invalidations(&self, stale: &[ActivationAddress]) {
        for address in stale {
            if self.cache.invalidate_address(address) {
                debug!(%address, "dropped stale cache entry");
            }
        }
    }

    /// Rebuild the ring from a fresh membership snapshot and drop all
    /// state pointing at silos that are no longer alive.
    pub fn update_ring(&self, snapshot: &ClusterSnapshot) {
        let new_ring = ConsistentRing::new(snapshot.active_silos());
        {
            let mut rings = self.rings.lock();
            let old = std::mem::replace(&mut rings.current, new_ring);
            if !old.is_empty() {
                rings.previous = Some(old);
            }
        }

        // Entries hosted on dead silos are gone everywhere.
        let dead: Vec<SiloAddress> = snapshot
            .members
            .iter()
            .filter(|(_, status)| **status == crate::membership::SiloStatus::Dead)
            .map(|(silo, _)| *silo)
            .collect();
        if !dead.is_empty() {
            let mut partition = self.partition.lock();
            partition.retain(|_, address| !dead.contains(&address.silo));
            drop(partition);
            for silo in &dead {
                let dropped = self.cache.invalidate_silo(silo);
                if dropped > 0 {
                    debug!(%silo, dropped, "evicted cache entries of dead silo");
                }
            }
        }
    }

    /// The previous owner to probe for lazy migration, when it is not us
    /// and is still an active member.
    fn migration_source(&self, grain: &GrainId) -> Option<SiloAddress> {
        let rings = self.rings.lock();
        let previous_owner = rings.previous.as_ref()?.owner_of(grain)?;
        if previous_owner != self.local && rings.current.contains(&previous_owner) {
            Some(previous_owner)
        } else {
            None
        }
    }

    /// Number of authoritative entries held locally.
    pub fn local_partition_len(&self) -> usize {
        self.partition.lock().len()
    }

    /// Number of cached non-owned entries.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
