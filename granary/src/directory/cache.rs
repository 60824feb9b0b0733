//! Bounded cache of directory entries owned by other silos.
//!
//! Pure performance layer: a hit saves a round-trip to the owner, a miss
//! costs one. Correctness comes from invalidation — response messages
//! carry the addresses their sender knows to be stale, and the receiver
//! drops them here before doing anything else.

use std::collections::HashMap;

use parking_lot::Mutex;

use granary_core::{ActivationAddress, GrainId, SiloAddress};

/// LRU-bounded map of grain → activation address.
#[derive(Debug)]
pub struct DirectoryCache {
    inner: Mutex<CacheInner>,
}

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<GrainId, CachedEntry>,
    capacity: usize,
    tick: u64,
}

#[derive(Debug)]
struct CachedEntry {
    address: ActivationAddress,
    last_used: u64,
}

impl DirectoryCache {
    /// Cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                capacity: capacity.max(1),
                tick: 0,
            }),
        }
    }

    /// Look up a cached address, refreshing its recency.
    pub fn get(&self, grain: &GrainId) -> Option<ActivationAddress> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.get_mut(grain).map(|e| {
            e.last_used = tick;
            e.address.clone()
        })
    }

    /// Insert or replace an entry, evicting the least recently used one
    /// when over capacity.
    pub fn insert(&self, address: ActivationAddress) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.insert(
            address.grain.clone(),
            CachedEntry {
                address,
                last_used: tick,
            },
        );
        if inner.entries.len() > inner.capacity {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(g, _)| g.clone())
            {
                inner.entries.remove(&oldest);
            }
        }
    }

    /// Drop the entry for a grain, whatever it points at.
    pub fn invalidate(&self, grain: &GrainId) -> bool {
        self.inner.lock().entries.remove(grain).is_some()
    }

    /// Drop an exact cached address (grain + activation must match); a
    /// newer cached activation for the same grain is left alone.
    pub fn invalidate_address(&self, address: &ActivationAddress) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get(&address.grain) {
            Some(e) if e.address.activation == address.activation => {
                inner.entries.remove(&address.grain);
                true
            }
            _ => false,
        }
    }

    /// Drop every entry hosted on `silo` (it died or left).
    pub fn invalidate_silo(&self, silo: &SiloAddress) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.address.silo != *silo);
        before - inner.entries.len()
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use granary_core::{ActivationId, GrainType, NetworkAddress, SiloAddress};

    use super::*;

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(NetworkAddress::localhost(port), 1)
    }

    fn addr(name: &str, port: u16, act: u64) -> ActivationAddress {
        ActivationAddress::new(
            GrainId::text(GrainType(1), name),
            silo(port),
            ActivationId::new(act),
        )
    }

    #[test]
    fn test_insert_get_roundtrip() {
        let cache = DirectoryCache::new(10);
        let a = addr("alice", 1, 1);
        cache.insert(a.clone());
        assert_eq!(cache.get(&a.grain), Some(a));
    }

    #[test]
    fn test_eviction_drops_least_recently_used() {
        let cache = DirectoryCache::new(2);
        let a = addr("a", 1, 1);
        let b = addr("b", 1, 2);
        let c = addr("c", 1, 3);

        cache.insert(a.clone());
        cache.insert(b.clone());
        // Touch `a` so `b` becomes the coldest.
        cache.get(&a.grain);
        cache.insert(c.clone());

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a.grain).is_some());
        assert!(cache.get(&b.grain).is_none());
        assert!(cache.get(&c.grain).is_some());
    }

    #[test]
    fn test_invalidate_address_requires_matching_activation() {
        let cache = DirectoryCache::new(10);
        let current = addr("alice", 1, 2);
        cache.insert(current.clone());

        // A stale invalidation for the previous activation is a no-op.
        let stale = addr("alice", 1, 1);
        assert!(!cache.invalidate_address(&stale));
        assert!(cache.get(&current.grain).is_some());

        assert!(cache.invalidate_address(&current));
        assert!(cache.get(&current.grain).is_none());
    }

    #[test]
    fn test_invalidate_silo_sweeps_all_its_entries() {
        let cache = DirectoryCache::new(10);
        cache.insert(addr("a", 1, 1));
        cache.insert(addr("b", 1, 2));
        cache.insert(addr("c", 2, 3));

        assert_eq!(cache.invalidate_silo(&silo(1)), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&GrainId::text(GrainType(1), "c")).is_some());
    }
}
