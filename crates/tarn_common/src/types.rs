//! Typed identifiers for the locking subsystem.
//!
//! A `ResourceId` names one lockable entity. The derived ordering
//! (`ResourceType` first, hashed key second) is the canonical acquisition
//! order: callers take Global before any Database or Collection resource, and
//! a Database before its Collections. Saved lock state is restored in this
//! order to avoid self-deadlock on reacquisition.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Unique identifier for a lock session (one per concurrent operation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockerId(pub u64);

impl fmt::Display for LockerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "locker:{}", self.0)
    }
}

/// Kind of lockable entity. The variant order defines the canonical
/// acquisition order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ResourceType {
    Global,
    Database,
    Collection,
    Metadata,
    Mutex,
}

pub const RESOURCE_TYPE_COUNT: usize = 5;

impl ResourceType {
    pub fn name(self) -> &'static str {
        match self {
            ResourceType::Global => "global",
            ResourceType::Database => "database",
            ResourceType::Collection => "collection",
            ResourceType::Metadata => "metadata",
            ResourceType::Mutex => "mutex",
        }
    }

    pub const ALL: [ResourceType; RESOURCE_TYPE_COUNT] = [
        ResourceType::Global,
        ResourceType::Database,
        ResourceType::Collection,
        ResourceType::Metadata,
        ResourceType::Mutex,
    ];
}

/// Compact, totally-ordered identifier for a lockable entity.
///
/// Named resources (databases, collections, metadata, mutexes) hash their
/// name into `key`; the two instance-wide singletons use reserved keys.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ResourceId {
    rtype: ResourceType,
    key: u64,
}

impl ResourceId {
    /// The "parallel batch writer mode" global sub-identity, used to pause
    /// all writers. Sorts before [`ResourceId::GLOBAL`] so saved state that
    /// includes it restores it first.
    pub const PARALLEL_BATCH_WRITER: ResourceId = ResourceId {
        rtype: ResourceType::Global,
        key: 1,
    };

    /// The ordinary instance-wide global resource. Every operation acquires
    /// this at least once before any database or collection lock.
    pub const GLOBAL: ResourceId = ResourceId {
        rtype: ResourceType::Global,
        key: 2,
    };

    pub fn database(name: &str) -> ResourceId {
        ResourceId::named(ResourceType::Database, name)
    }

    /// `namespace` is the full "db.collection" name.
    pub fn collection(namespace: &str) -> ResourceId {
        ResourceId::named(ResourceType::Collection, namespace)
    }

    pub fn metadata(name: &str) -> ResourceId {
        ResourceId::named(ResourceType::Metadata, name)
    }

    /// Internal named mutex. Mutex resources never participate in two-phase
    /// unlock deferral and may be held without the Global lock.
    pub fn mutex(name: &str) -> ResourceId {
        ResourceId::named(ResourceType::Mutex, name)
    }

    fn named(rtype: ResourceType, name: &str) -> ResourceId {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        name.hash(&mut hasher);
        ResourceId {
            rtype,
            key: hasher.finish(),
        }
    }

    pub fn resource_type(self) -> ResourceType {
        self.rtype
    }

    pub fn key(self) -> u64 {
        self.key
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == ResourceId::GLOBAL {
            write!(f, "global")
        } else if *self == ResourceId::PARALLEL_BATCH_WRITER {
            write!(f, "global:pbw")
        } else {
            write!(f, "{}:{:x}", self.rtype.name(), self.key)
        }
    }
}

/// Lock strength lattice.
///
/// `IntentShared`/`Shared` are the shared family; `IntentExclusive`/
/// `Exclusive` the exclusive family. Compatibility between granted holders
/// is decided by a static conflict matrix.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum LockMode {
    #[default]
    None,
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

pub const LOCK_MODE_COUNT: usize = 5;

const fn bit(mode: LockMode) -> u32 {
    1 << (mode as usize)
}

/// `CONFLICTS[m]` is the mask of granted modes a request for `m` conflicts
/// with.
const CONFLICTS: [u32; LOCK_MODE_COUNT] = [
    // None
    0,
    // IntentShared: conflicts only with Exclusive
    bit(LockMode::Exclusive),
    // IntentExclusive: conflicts with Shared, Exclusive
    bit(LockMode::Shared) | bit(LockMode::Exclusive),
    // Shared: conflicts with IntentExclusive, Exclusive
    bit(LockMode::IntentExclusive) | bit(LockMode::Exclusive),
    // Exclusive: conflicts with everything but None
    bit(LockMode::IntentShared)
        | bit(LockMode::IntentExclusive)
        | bit(LockMode::Shared)
        | bit(LockMode::Exclusive),
];

/// `COVERS[m]` is the mask of held modes that subsume a request for `m`.
const COVERS: [u32; LOCK_MODE_COUNT] = [
    // None is covered by anything
    0b11111,
    // IntentShared
    bit(LockMode::IntentShared)
        | bit(LockMode::IntentExclusive)
        | bit(LockMode::Shared)
        | bit(LockMode::Exclusive),
    // IntentExclusive
    bit(LockMode::IntentExclusive) | bit(LockMode::Exclusive),
    // Shared
    bit(LockMode::Shared) | bit(LockMode::Exclusive),
    // Exclusive
    bit(LockMode::Exclusive),
];

/// `COMBINE[a][b]` is the weakest mode covering both `a` and `b`; used when
/// a session converts a held lock so the strongest ever-granted mode is
/// retained. Note `IntentExclusive + Shared = Exclusive`.
const COMBINE: [[LockMode; LOCK_MODE_COUNT]; LOCK_MODE_COUNT] = {
    use LockMode::*;
    [
        [None, IntentShared, IntentExclusive, Shared, Exclusive],
        [IntentShared, IntentShared, IntentExclusive, Shared, Exclusive],
        [IntentExclusive, IntentExclusive, IntentExclusive, Exclusive, Exclusive],
        [Shared, Shared, Exclusive, Shared, Exclusive],
        [Exclusive, Exclusive, Exclusive, Exclusive, Exclusive],
    ]
};

impl LockMode {
    pub fn bit(self) -> u32 {
        bit(self)
    }

    /// Whether a request for `self` can be granted alongside the currently
    /// granted mode mask.
    pub fn compatible_with(self, granted_mask: u32) -> bool {
        CONFLICTS[self as usize] & granted_mask == 0
    }

    /// Whether holding `held` already satisfies a request for `self`.
    pub fn is_covered_by(self, held: LockMode) -> bool {
        COVERS[self as usize] & bit(held) != 0
    }

    /// Weakest mode covering both `self` and `other`.
    pub fn combine(self, other: LockMode) -> LockMode {
        COMBINE[self as usize][other as usize]
    }

    pub fn is_shared(self) -> bool {
        matches!(self, LockMode::IntentShared | LockMode::Shared)
    }

    pub fn short_name(self) -> &'static str {
        match self {
            LockMode::None => "NONE",
            LockMode::IntentShared => "IS",
            LockMode::IntentExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::Exclusive => "X",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LockMode::*;

    #[test]
    fn test_resource_ordering_is_type_then_key() {
        let db = ResourceId::database("db1");
        let coll = ResourceId::collection("db1.coll");
        assert!(ResourceId::GLOBAL < db);
        assert!(db < coll);
        assert!(ResourceId::PARALLEL_BATCH_WRITER < ResourceId::GLOBAL);
    }

    #[test]
    fn test_same_name_same_id() {
        assert_eq!(ResourceId::database("users"), ResourceId::database("users"));
        assert_ne!(ResourceId::database("users"), ResourceId::collection("users"));
    }

    #[test]
    fn test_conflict_matrix() {
        // Shared family is self-compatible.
        assert!(IntentShared.compatible_with(IntentShared.bit() | Shared.bit()));
        assert!(Shared.compatible_with(IntentShared.bit() | Shared.bit()));
        // Intent modes are mutually compatible.
        assert!(IntentExclusive.compatible_with(IntentShared.bit() | IntentExclusive.bit()));
        // Exclusive conflicts with everything.
        for m in [IntentShared, IntentExclusive, Shared, Exclusive] {
            assert!(!Exclusive.compatible_with(m.bit()));
            assert!(!m.compatible_with(Exclusive.bit()));
        }
        // Shared vs IntentExclusive conflict both ways.
        assert!(!Shared.compatible_with(IntentExclusive.bit()));
        assert!(!IntentExclusive.compatible_with(Shared.bit()));
    }

    #[test]
    fn test_cover_lattice() {
        assert!(IntentShared.is_covered_by(Exclusive));
        assert!(IntentShared.is_covered_by(Shared));
        assert!(Shared.is_covered_by(Exclusive));
        assert!(!Shared.is_covered_by(IntentExclusive));
        assert!(!Exclusive.is_covered_by(Shared));
        assert!(None.is_covered_by(IntentShared));
    }

    #[test]
    fn test_combine_retains_strongest() {
        assert_eq!(IntentShared.combine(IntentExclusive), IntentExclusive);
        assert_eq!(Shared.combine(IntentExclusive), Exclusive);
        assert_eq!(IntentExclusive.combine(Shared), Exclusive);
        assert_eq!(None.combine(Shared), Shared);
        assert_eq!(Exclusive.combine(IntentShared), Exclusive);
        // combine is idempotent
        for m in [None, IntentShared, IntentExclusive, Shared, Exclusive] {
            assert_eq!(m.combine(m), m);
        }
    }
}
