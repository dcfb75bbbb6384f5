//! Engine-wide lock service: the shared state every [`Locker`] attaches to.
//!
//! One `LockService` per engine instance owns the lock manager, the ticket
//! pools, the striped statistics, and the registry of live sessions. It
//! also runs the periodic sweep of empty per-resource lock state.

use std::sync::Arc;
use std::thread;

use dashmap::DashMap;
use tracing::debug;

use tarn_common::shutdown::ShutdownSignal;
use tarn_common::types::LockerId;
use tarn_common::LockConfig;

use crate::locker::{LockerInfo, LockerShared};
use crate::manager::LockManager;
use crate::stats::{LockStatsSnapshot, StatsRegistry};
use crate::ticket::TicketPool;

pub struct LockService {
    config: LockConfig,
    manager: LockManager,
    tickets: TicketPool,
    stats: StatsRegistry,
    lockers: DashMap<LockerId, Arc<LockerShared>>,
}

impl LockService {
    pub fn new(config: LockConfig) -> Arc<LockService> {
        let tickets = TicketPool::new(
            config.read_tickets,
            config.write_tickets,
            config.deadlock_poll_interval(),
        );
        Arc::new(LockService {
            manager: LockManager::new(),
            tickets,
            stats: StatsRegistry::new(),
            lockers: DashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn manager(&self) -> &LockManager {
        &self.manager
    }

    pub fn tickets(&self) -> &TicketPool {
        &self.tickets
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    pub(crate) fn register(&self, shared: Arc<LockerShared>) {
        self.lockers.insert(shared.id(), shared);
    }

    pub(crate) fn deregister(&self, id: LockerId) {
        self.lockers.remove(&id);
    }

    pub fn active_locker_count(&self) -> usize {
        self.lockers.len()
    }

    /// Diagnostics snapshot of every live session: held locks, client
    /// state, what it is waiting on, and its counters. Rows are gathered
    /// one session at a time, so the set is not a single atomic cut.
    pub fn all_lockers_info(&self) -> Vec<LockerInfo> {
        let mut rows: Vec<LockerInfo> = self
            .lockers
            .iter()
            .map(|entry| entry.value().info(&self.manager))
            .collect();
        rows.sort_by_key(|row| row.id);
        rows
    }

    /// Instance-wide counters merged across all stripes.
    pub fn global_stats(&self) -> LockStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the background sweeper that drops empty per-resource lock
    /// state on the configured interval. Returns the signal that stops it
    /// and the thread handle to join on shutdown.
    pub fn start_sweeper(self: &Arc<Self>) -> (ShutdownSignal, thread::JoinHandle<()>) {
        let signal = ShutdownSignal::new();
        let service = Arc::clone(self);
        let stop = signal.clone();
        let handle = thread::Builder::new()
            .name("tarn-lock-sweeper".to_string())
            .spawn(move || {
                let interval = service.config.sweep_interval();
                while !stop.wait_timeout(interval) {
                    let swept = service.manager.cleanup_unused_locks();
                    if swept > 0 {
                        debug!(swept, "swept empty lock heads");
                    }
                }
                debug!("lock sweeper stopped");
            })
            .expect("failed to spawn lock sweeper");
        (signal, handle)
    }
}
