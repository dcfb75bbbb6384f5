//! Instance-wide lock statistics, striped to keep the hot acquisition path
//! off shared cache lines.
//!
//! Counters are bucketed per [`ResourceType`], not per resource; the sweep
//! of individual resources would make snapshots unbounded. Writers pick a
//! partition by `LockerId % PARTITIONS` so concurrent sessions mostly touch
//! distinct lines; readers merge all partitions into a plain
//! [`LockStatsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use tarn_common::types::{LockerId, ResourceId, ResourceType, RESOURCE_TYPE_COUNT};

const PARTITIONS: usize = 8;

/// Plain, copyable counters for one resource type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeStats {
    pub acquisitions: u64,
    pub waits: u64,
    pub wait_time_us: u64,
    pub deadlocks: u64,
}

/// Point-in-time statistics, either instance-wide or for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStatsSnapshot {
    pub per_type: [TypeStats; RESOURCE_TYPE_COUNT],
}

impl LockStatsSnapshot {
    pub fn record_acquisition(&mut self, resource: ResourceId) {
        self.per_type[resource.resource_type() as usize].acquisitions += 1;
    }

    pub fn record_wait(&mut self, resource: ResourceId) {
        self.per_type[resource.resource_type() as usize].waits += 1;
    }

    pub fn record_wait_time(&mut self, resource: ResourceId, micros: u64) {
        self.per_type[resource.resource_type() as usize].wait_time_us += micros;
    }

    pub fn record_deadlock(&mut self, resource: ResourceId) {
        self.per_type[resource.resource_type() as usize].deadlocks += 1;
    }

    pub fn add(&mut self, other: &LockStatsSnapshot) {
        for (mine, theirs) in self.per_type.iter_mut().zip(other.per_type.iter()) {
            mine.acquisitions += theirs.acquisitions;
            mine.waits += theirs.waits;
            mine.wait_time_us += theirs.wait_time_us;
            mine.deadlocks += theirs.deadlocks;
        }
    }

    /// Subtract a baseline snapshot, saturating so a reset between the two
    /// reads never underflows.
    pub fn subtract(&mut self, base: &LockStatsSnapshot) {
        for (mine, theirs) in self.per_type.iter_mut().zip(base.per_type.iter()) {
            mine.acquisitions = mine.acquisitions.saturating_sub(theirs.acquisitions);
            mine.waits = mine.waits.saturating_sub(theirs.waits);
            mine.wait_time_us = mine.wait_time_us.saturating_sub(theirs.wait_time_us);
            mine.deadlocks = mine.deadlocks.saturating_sub(theirs.deadlocks);
        }
    }

    pub fn for_type(&self, rtype: ResourceType) -> TypeStats {
        self.per_type[rtype as usize]
    }

    pub fn total_acquisitions(&self) -> u64 {
        self.per_type.iter().map(|t| t.acquisitions).sum()
    }

    pub fn total_waits(&self) -> u64 {
        self.per_type.iter().map(|t| t.waits).sum()
    }

    pub fn total_deadlocks(&self) -> u64 {
        self.per_type.iter().map(|t| t.deadlocks).sum()
    }
}

#[derive(Default)]
struct AtomicTypeStats {
    acquisitions: AtomicU64,
    waits: AtomicU64,
    wait_time_us: AtomicU64,
    deadlocks: AtomicU64,
}

/// One stripe, padded to its own cache line pair.
#[repr(align(128))]
#[derive(Default)]
struct Partition {
    per_type: [AtomicTypeStats; RESOURCE_TYPE_COUNT],
}

impl Partition {
    fn cell(&self, resource: ResourceId) -> &AtomicTypeStats {
        &self.per_type[resource.resource_type() as usize]
    }
}

/// Striped global counters. Single atomic add per event, no locking.
pub struct StatsRegistry {
    partitions: [Partition; PARTITIONS],
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    pub fn new() -> StatsRegistry {
        StatsRegistry {
            partitions: std::array::from_fn(|_| Partition::default()),
        }
    }

    fn partition(&self, locker: LockerId) -> &Partition {
        &self.partitions[(locker.0 % PARTITIONS as u64) as usize]
    }

    pub fn record_acquisition(&self, locker: LockerId, resource: ResourceId) {
        self.partition(locker)
            .cell(resource)
            .acquisitions
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait(&self, locker: LockerId, resource: ResourceId) {
        self.partition(locker)
            .cell(resource)
            .waits
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait_time(&self, locker: LockerId, resource: ResourceId, micros: u64) {
        self.partition(locker)
            .cell(resource)
            .wait_time_us
            .fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_deadlock(&self, locker: LockerId, resource: ResourceId) {
        self.partition(locker)
            .cell(resource)
            .deadlocks
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Merge all partitions. Not atomic across counters; values may be from
    /// slightly different instants, which is fine for monitoring.
    pub fn snapshot(&self) -> LockStatsSnapshot {
        let mut out = LockStatsSnapshot::default();
        for partition in &self.partitions {
            for (idx, cell) in partition.per_type.iter().enumerate() {
                let t = &mut out.per_type[idx];
                t.acquisitions += cell.acquisitions.load(Ordering::Relaxed);
                t.waits += cell.waits.load(Ordering::Relaxed);
                t.wait_time_us += cell.wait_time_us.load(Ordering::Relaxed);
                t.deadlocks += cell.deadlocks.load(Ordering::Relaxed);
            }
        }
        out
    }

    pub fn reset(&self) {
        for partition in &self.partitions {
            for cell in &partition.per_type {
                cell.acquisitions.store(0, Ordering::Relaxed);
                cell.waits.store(0, Ordering::Relaxed);
                cell.wait_time_us.store(0, Ordering::Relaxed);
                cell.deadlocks.store(0, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_striped_counters_merge() {
        let stats = StatsRegistry::new();
        // Ids 0..16 cover every partition twice.
        for id in 0..16 {
            stats.record_acquisition(LockerId(id), ResourceId::GLOBAL);
            stats.record_acquisition(LockerId(id), ResourceId::database("db"));
        }
        stats.record_wait(LockerId(3), ResourceId::GLOBAL);
        stats.record_wait_time(LockerId(3), ResourceId::GLOBAL, 250);
        stats.record_deadlock(LockerId(5), ResourceId::collection("db.c"));

        let snap = stats.snapshot();
        assert_eq!(snap.for_type(ResourceType::Global).acquisitions, 16);
        assert_eq!(snap.for_type(ResourceType::Database).acquisitions, 16);
        assert_eq!(snap.for_type(ResourceType::Global).waits, 1);
        assert_eq!(snap.for_type(ResourceType::Global).wait_time_us, 250);
        assert_eq!(snap.for_type(ResourceType::Collection).deadlocks, 1);
        assert_eq!(snap.total_acquisitions(), 32);
    }

    #[test]
    fn test_reset_clears_everything() {
        let stats = StatsRegistry::new();
        stats.record_acquisition(LockerId(1), ResourceId::GLOBAL);
        stats.reset();
        assert_eq!(stats.snapshot(), LockStatsSnapshot::default());
    }

    #[test]
    fn test_snapshot_subtract_saturates() {
        let mut a = LockStatsSnapshot::default();
        let mut b = LockStatsSnapshot::default();
        a.record_acquisition(ResourceId::GLOBAL);
        b.record_acquisition(ResourceId::GLOBAL);
        b.record_acquisition(ResourceId::GLOBAL);
        a.subtract(&b);
        assert_eq!(a.for_type(ResourceType::Global).acquisitions, 0);

        let mut c = LockStatsSnapshot::default();
        c.record_wait(ResourceId::database("db"));
        c.add(&b);
        assert_eq!(c.total_acquisitions(), 2);
        assert_eq!(c.total_waits(), 1);
    }
}
