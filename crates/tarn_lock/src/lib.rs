//! Concurrency-control core of the tarndb engine.
//!
//! A hierarchical, multi-granularity lock manager ([`manager::LockManager`])
//! mediates all structural access to shared server state. Each concurrent
//! operation drives it through a [`locker::Locker`] session, which layers
//! recursion counting, two-phase unlock deferral, deadline/interruption
//! handling and deadlock polling on top of the raw grant machinery.
//! Instance-wide admission is bounded by the [`ticket::TicketPool`], and
//! [`service::LockService`] wires the pieces into one injectable runtime.

pub mod deadlock;
pub mod locker;
pub mod manager;
pub mod service;
pub mod stats;
pub mod ticket;


pub use locker::{ClientState, GlobalLockCompanion, LockSnapshot, Locker, LockerInfo};
pub use manager::{GrantState, LockManager};
pub use service::LockService;
pub use stats::{LockStatsSnapshot, StatsRegistry};
pub use ticket::TicketPool;

// Re-export from tarn_common for convenience
pub use tarn_common::{LockConfig, LockError, LockMode, LockerId, ResourceId, ResourceType, TarnResult};
