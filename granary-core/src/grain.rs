//! Grain identity and activation addressing.
//!
//! A grain is a virtual actor: a stable logical identity that outlives any
//! in-memory instance of it. An *activation* is one such instance, on one
//! silo, at one point in time. The distinction matters everywhere: the
//! directory maps grain → activation, the catalog owns activations, and
//! the router always addresses grains, never activation objects.

use std::hash::{Hash, Hasher};

use rapidhash::RapidHasher;
use serde::{Deserialize, Serialize};

use crate::types::SiloAddress;

/// Seed for the uniform grain hash. Fixed so every silo computes identical
/// hashes for ring placement and reminder range indexing.
const GRAIN_HASH_SEED: u64 = 0x6772_616e_6172_7921;

/// Identifies a grain TYPE — a class of grains sharing an interface.
///
/// # Convention
///
/// Use a hex constant per interface:
/// ```
/// use granary_core::GrainType;
/// const BANK_ACCOUNT: GrainType = GrainType(0xBA4E);
/// ```
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct GrainType(pub u32);

impl GrainType {
    /// Directory system interface (register/unregister/lookup on owners).
    pub const DIRECTORY: GrainType = GrainType(0xFFFF_0001);
    /// Membership probe interface.
    pub const MEMBERSHIP: GrainType = GrainType(0xFFFF_0002);
    /// Reminder tick interface.
    pub const REMINDER: GrainType = GrainType(0xFFFF_0003);
    /// Client-side pseudo-grain used as the sender of gateway requests.
    pub const CLIENT: GrainType = GrainType(0xFFFF_00C1);

    /// True for runtime-internal interfaces, which use the system response
    /// timeout and are re-bound to the receiving gateway on reroute.
    pub const fn is_system(self) -> bool {
        self.0 >= 0xFFFF_0000
    }
}

impl std::fmt::Display for GrainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Primary key of a grain.
///
/// System grains carry the owning silo in their key (`Silo` variant) so
/// that messages to them are pinned to that silo and never placed.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum GrainKey {
    /// 64-bit integer key.
    Integer(i64),
    /// 128-bit identifier key.
    Uuid(u128),
    /// String key.
    Text(String),
    /// 64-bit integer plus string suffix.
    IntegerCompound(i64, String),
    /// 128-bit identifier plus string suffix.
    UuidCompound(u128, String),
    /// Silo address key, used by system grains pinned to one silo.
    Silo(SiloAddress),
}

impl std::fmt::Display for GrainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrainKey::Integer(n) => write!(f, "{n}"),
            GrainKey::Uuid(u) => write!(f, "{u:032x}"),
            GrainKey::Text(s) => write!(f, "{s}"),
            GrainKey::IntegerCompound(n, s) => write!(f, "{n}+{s}"),
            GrainKey::UuidCompound(u, s) => write!(f, "{u:032x}+{s}"),
            GrainKey::Silo(silo) => write!(f, "{silo}"),
        }
    }
}

/// Full grain identity: type tag + primary key.
///
/// # Examples
///
/// ```
/// use granary_core::{GrainId, GrainType};
///
/// let alice = GrainId::text(GrainType(0xBA4E), "alice");
/// let order = GrainId::integer(GrainType(0x04D3), 42);
/// assert_ne!(alice, order);
/// ```
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct GrainId {
    /// The grain type (identifies the interface/handler).
    pub kind: GrainType,
    /// The primary key within the type.
    pub key: GrainKey,
}

impl GrainId {
    /// Create a grain id with an arbitrary key.
    pub fn new(kind: GrainType, key: GrainKey) -> Self {
        Self { kind, key }
    }

    /// Grain id with a string key.
    pub fn text(kind: GrainType, key: impl Into<String>) -> Self {
        Self::new(kind, GrainKey::Text(key.into()))
    }

    /// Grain id with an integer key.
    pub fn integer(kind: GrainType, key: i64) -> Self {
        Self::new(kind, GrainKey::Integer(key))
    }

    /// Grain id with a 128-bit identifier key.
    pub fn uuid(kind: GrainType, key: u128) -> Self {
        Self::new(kind, GrainKey::Uuid(key))
    }

    /// System grain pinned to `silo`.
    pub fn system(kind: GrainType, silo: SiloAddress) -> Self {
        Self::new(kind, GrainKey::Silo(silo))
    }

    /// The silo a system grain is pinned to, if any.
    pub fn pinned_silo(&self) -> Option<SiloAddress> {
        match &self.key {
            GrainKey::Silo(silo) => Some(*silo),
            _ => None,
        }
    }

    /// True for runtime-internal grains.
    pub fn is_system(&self) -> bool {
        self.kind.is_system()
    }

    /// Stable 32-bit uniform hash of this identity.
    ///
    /// Identical on every silo of the cluster (seeded rapidhash, no
    /// per-process randomness). Used for reminder range indexing and as
    /// the ring position of the grain.
    pub fn uniform_hash(&self) -> u32 {
        let mut hasher = RapidHasher::new(GRAIN_HASH_SEED);
        self.hash(&mut hasher);
        let h = hasher.finish();
        (h ^ (h >> 32)) as u32
    }
}

impl std::fmt::Display for GrainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// Silo-unique identity of one activation.
///
/// Disambiguates successive activations of the same grain on the same
/// silo; uniqueness across silos comes from pairing with [`SiloAddress`]
/// in [`ActivationAddress`].
#[derive(
    Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Default,
)]
pub struct ActivationId(pub u64);

impl ActivationId {
    /// Create an activation id with an explicit value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ActivationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "act-{:x}", self.0)
    }
}

/// Where a grain currently lives: (grain, silo, activation).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActivationAddress {
    /// The grain identity.
    pub grain: GrainId,
    /// The hosting silo.
    pub silo: SiloAddress,
    /// The specific activation on that silo.
    pub activation: ActivationId,
}

impl ActivationAddress {
    /// Create an activation address.
    pub fn new(grain: GrainId, silo: SiloAddress, activation: ActivationId) -> Self {
        Self {
            grain,
            silo,
            activation,
        }
    }

    /// Deterministic registration tie-break: the lower (silo, activation)
    /// tuple wins a concurrent-create race, on every silo that evaluates
    /// it, without coordination.
    pub fn wins_over(&self, other: &ActivationAddress) -> bool {
        (self.silo, self.activation) < (other.silo, other.activation)
    }
}

impl std::fmt::Display for ActivationAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.grain, self.silo, self.activation)
    }
}

#[cfg(test)]
mod tests {
    use crate::types::NetworkAddress;

    use super::*;

    fn silo(port: u16, generation: i64) -> SiloAddress {
        SiloAddress::new(NetworkAddress::localhost(port), generation)
    }

    #[test]
    fn test_grain_id_equality() {
        let a = GrainId::text(GrainType(0xBA4E), "alice");
        let b = GrainId::text(GrainType(0xBA4E), "alice");
        let c = GrainId::text(GrainType(0xBA4E), "bob");
        let d = GrainId::text(GrainType(0x504C), "alice");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_key_forms_are_distinct() {
        let kind = GrainType(1);
        let keys = [
            GrainKey::Integer(7),
            GrainKey::Uuid(7),
            GrainKey::Text("7".into()),
            GrainKey::IntegerCompound(7, "x".into()),
            GrainKey::UuidCompound(7, "x".into()),
        ];
        for (i, a) in keys.iter().enumerate() {
            for (j, b) in keys.iter().enumerate() {
                let ga = GrainId::new(kind, a.clone());
                let gb = GrainId::new(kind, b.clone());
                assert_eq!(i == j, ga == gb, "{ga} vs {gb}");
            }
        }
    }

    #[test]
    fn test_uniform_hash_is_stable() {
        let id = GrainId::text(GrainType(0xBA4E), "alice");
        // Two computations in the same process and, by construction of the
        // fixed seed, in any process.
        assert_eq!(id.uniform_hash(), id.uniform_hash());
        assert_ne!(
            id.uniform_hash(),
            GrainId::text(GrainType(0xBA4E), "bob").uniform_hash()
        );
    }

    #[test]
    fn test_system_grain_pinning() {
        let s = silo(11111, 1);
        let id = GrainId::system(GrainType::DIRECTORY, s);
        assert!(id.is_system());
        assert_eq!(id.pinned_silo(), Some(s));
        assert_eq!(GrainId::text(GrainType(1), "x").pinned_silo(), None);
    }

    #[test]
    fn test_tie_break_is_total_and_deterministic() {
        let g = GrainId::text(GrainType(1), "g");
        let a = ActivationAddress::new(g.clone(), silo(11111, 1), ActivationId::new(5));
        let b = ActivationAddress::new(g.clone(), silo(11111, 1), ActivationId::new(9));
        let c = ActivationAddress::new(g, silo(11112, 1), ActivationId::new(1));
        assert!(a.wins_over(&b));
        assert!(b.wins_over(&c));
        assert!(a.wins_over(&c));
        assert!(!c.wins_over(&a));
    }

    #[test]
    fn test_activation_address_serde_roundtrip() {
        let addr = ActivationAddress::new(
            GrainId::integer(GrainType(0x04D3), -12),
            silo(11111, 3),
            ActivationId::new(77),
        );
        let json = serde_json::to_vec(&addr).expect("serialize");
        let back: ActivationAddress = serde_json::from_slice(&json).expect("deserialize");
        assert_eq!(addr, back);
    }
}
