//! Per-operation lock session.
//!
//! A `Locker` is owned by exactly one operation (one thread of control) and
//! tracks everything that operation holds: the per-resource modes and
//! recursion counts, the write-unit-of-work nesting that defers releases,
//! and the admission ticket taken in front of the Global lock. The manager
//! is only consulted at the edges, when a lock is first needed on a
//! resource, converted to a stronger mode, or finally released.
//!
//! Recoverable failures (timeout, deadlock, interruption) come back as
//! `Err` with the failed request fully unwound. Misuse, like dropping a
//! session with locks still held or taking a collection lock without the
//! Global lock, is a bug in the caller and trips an assertion instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use tarn_common::shutdown::InterruptFlag;
use tarn_common::types::{LockMode, LockerId, ResourceId, ResourceType};
use tarn_common::{LockError, TarnResult};

use crate::deadlock;
use crate::manager::{GrantNotice, GrantState, QueuePolicy, RequestStatus};
use crate::service::LockService;
use crate::stats::LockStatsSnapshot;

static NEXT_LOCKER_ID: AtomicU64 = AtomicU64::new(1);

/// Coarse admission state of a session, for diagnostics. Readers are
/// shared-family global holders (IS/S), writers exclusive-family (IX/X);
/// Queued means parked on the ticket pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Inactive,
    ActiveReader,
    QueuedReader,
    ActiveWriter,
    QueuedWriter,
}

impl ClientState {
    fn encode(self) -> u8 {
        match self {
            ClientState::Inactive => 0,
            ClientState::ActiveReader => 1,
            ClientState::QueuedReader => 2,
            ClientState::ActiveWriter => 3,
            ClientState::QueuedWriter => 4,
        }
    }

    fn decode(raw: u8) -> ClientState {
        match raw {
            1 => ClientState::ActiveReader,
            2 => ClientState::QueuedReader,
            3 => ClientState::ActiveWriter,
            4 => ClientState::QueuedWriter,
            _ => ClientState::Inactive,
        }
    }
}

/// One resource's session-local state.
#[derive(Debug, Clone, Copy)]
struct HeldLock {
    mode: LockMode,
    recursive_count: u32,
    /// Releases deferred by an enclosing write unit of work. Replayed at
    /// commit, or consumed in place by a covered re-lock.
    unlock_pending: u32,
    status: RequestStatus,
}

/// State shared with the [`LockService`] registry so diagnostics can
/// inspect live sessions without the owning thread's cooperation.
pub struct LockerShared {
    id: LockerId,
    requests: Mutex<HashMap<ResourceId, HeldLock>>,
    client_state: AtomicU8,
    stats: Mutex<LockStatsSnapshot>,
}

impl LockerShared {
    pub fn id(&self) -> LockerId {
        self.id
    }

    fn set_client_state(&self, state: ClientState) {
        self.client_state.store(state.encode(), Ordering::Relaxed);
    }

    pub fn client_state(&self) -> ClientState {
        ClientState::decode(self.client_state.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        *self.stats.lock()
    }

    /// Diagnostics row. Never blocks on the session's own progress; the
    /// requests map is only locked for the copy.
    pub(crate) fn info(&self, manager: &crate::manager::LockManager) -> LockerInfo {
        let mut held: Vec<(ResourceId, LockMode)> = self
            .requests
            .lock()
            .iter()
            .map(|(res, lock)| (*res, lock.mode))
            .collect();
        held.sort();
        LockerInfo {
            id: self.id,
            client_state: self.client_state(),
            held,
            waiting_on: manager.waiting_resource(self.id),
            stats: self.stats(),
        }
    }
}

/// Point-in-time view of one session, as reported by
/// [`LockService::all_lockers_info`].
#[derive(Debug, Clone)]
pub struct LockerInfo {
    pub id: LockerId,
    pub client_state: ClientState,
    /// Held locks in canonical resource order.
    pub held: Vec<(ResourceId, LockMode)>,
    pub waiting_on: Option<ResourceId>,
    pub stats: LockStatsSnapshot,
}

/// Saved session lock state, produced by
/// [`Locker::save_lock_state_and_unlock`] and consumed by
/// [`Locker::restore_lock_state`]. Locks are kept in canonical resource
/// order so reacquisition cannot self-deadlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSnapshot {
    pub global_mode: LockMode,
    pub locks: Vec<(ResourceId, LockMode)>,
}

/// Storage-engine hook: a resource to acquire alongside the first Global
/// lock acquisition and release with it. The companion resource must not be
/// of Global or Mutex type, and it never participates in two-phase unlock
/// deferral.
pub trait GlobalLockCompanion: Send + Sync {
    fn companion(&self, global_mode: LockMode) -> Option<(ResourceId, LockMode)>;
}

/// A lock session. Not `Sync`; owned and driven by a single operation.
pub struct Locker {
    shared: Arc<LockerShared>,
    service: Arc<LockService>,
    notice: Arc<GrantNotice>,
    companion: Option<Arc<dyn GlobalLockCompanion>>,
    interrupt: Option<InterruptFlag>,
    /// Mode the admission ticket was taken for; `Some` exactly while the
    /// Global lock is tracked.
    mode_for_ticket: Option<LockMode>,
    ticket_held: bool,
    wuow_nesting: u32,
    deferred_unlock_count: u32,
    max_lock_timeout: Option<Duration>,
    shared_locks_two_phase: bool,
    /// Nesting depth of uninterruptible regions. While nonzero, waits
    /// ignore the interrupt flag and the max lock timeout cap.
    uninterruptible: u32,
}

impl Locker {
    pub fn new(service: Arc<LockService>) -> Locker {
        let id = LockerId(NEXT_LOCKER_ID.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(LockerShared {
            id,
            requests: Mutex::new(HashMap::new()),
            client_state: AtomicU8::new(ClientState::Inactive.encode()),
            stats: Mutex::new(LockStatsSnapshot::default()),
        });
        service.register(shared.clone());
        Locker {
            shared,
            max_lock_timeout: service.config().max_lock_timeout(),
            service,
            notice: GrantNotice::new(),
            companion: None,
            interrupt: None,
            mode_for_ticket: None,
            ticket_held: false,
            wuow_nesting: 0,
            deferred_unlock_count: 0,
            shared_locks_two_phase: false,
            uninterruptible: 0,
        }
    }

    pub fn id(&self) -> LockerId {
        self.shared.id
    }

    // -------------------------------------------------------------------
    // Session tunables
    // -------------------------------------------------------------------

    /// Cancellation hook checked before each acquisition and at every wait
    /// slice boundary.
    pub fn set_interrupt(&mut self, flag: Option<InterruptFlag>) {
        self.interrupt = flag;
    }

    /// Override the configured wait cap (`None` = unlimited).
    pub fn set_max_lock_timeout(&mut self, timeout: Option<Duration>) {
        self.max_lock_timeout = timeout;
    }

    /// When set, S/IS locks also defer their release to the end of the
    /// write unit of work. X/IX always do.
    pub fn set_shared_locks_two_phase(&mut self, enabled: bool) {
        self.shared_locks_two_phase = enabled;
    }

    pub fn set_global_lock_companion(&mut self, companion: Option<Arc<dyn GlobalLockCompanion>>) {
        self.companion = companion;
    }

    /// Enter a region whose waits must not be interrupted or capped, e.g.
    /// cleanup that has to finish. Regions nest.
    pub fn begin_uninterruptible(&mut self) {
        self.uninterruptible += 1;
    }

    pub fn end_uninterruptible(&mut self) {
        debug_assert!(self.uninterruptible > 0);
        self.uninterruptible -= 1;
    }

    // -------------------------------------------------------------------
    // Global lock and tickets
    // -------------------------------------------------------------------

    /// Acquire the Global lock: admission ticket first (skipped while the
    /// Global lock is already tracked, and entirely for Exclusive), then the
    /// lock itself, then the storage-engine companion on first acquisition.
    pub fn lock_global(&mut self, mode: LockMode) -> TarnResult<()> {
        self.lock_global_deadline(mode, None)
    }

    pub fn lock_global_deadline(
        &mut self,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> TarnResult<()> {
        debug_assert!(mode != LockMode::None);
        debug_assert_eq!(
            self.is_locked(),
            self.mode_for_ticket.is_some(),
            "ticket tracking out of sync with Global lock"
        );
        self.check_interrupt(ResourceId::GLOBAL, mode)?;

        if self.mode_for_ticket.is_none() {
            if self.uninterruptible > 0 {
                // Ticket-exempt: cleanup paths must not be throttled by a
                // saturated pool.
                self.mode_for_ticket = Some(mode);
                self.shared.set_client_state(if mode.is_shared() {
                    ClientState::ActiveReader
                } else {
                    ClientState::ActiveWriter
                });
            } else {
                self.acquire_ticket(mode, deadline)?;
            }
        }

        let state = self.lock_begin(ResourceId::GLOBAL, mode);
        if state == GrantState::Waiting {
            // Deadlock detection is skipped here: the Global lock sits above
            // everything in the acquisition order, so a fresh request for it
            // cannot close a cycle.
            self.lock_complete(ResourceId::GLOBAL, mode, deadline, false)?;
        }

        let first_acquisition = {
            let requests = self.shared.requests.lock();
            requests[&ResourceId::GLOBAL].recursive_count == 1
        };
        if first_acquisition {
            if let Some(companion) = self.companion.clone() {
                if let Some((resource, companion_mode)) = companion.companion(mode) {
                    debug_assert!(!matches!(
                        resource.resource_type(),
                        ResourceType::Global | ResourceType::Mutex
                    ));
                    if let Err(err) = self.lock_deadline(resource, companion_mode, deadline) {
                        self.unlock_global();
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn acquire_ticket(&mut self, mode: LockMode, deadline: Option<Instant>) -> TarnResult<()> {
        let queued = if mode.is_shared() {
            ClientState::QueuedReader
        } else {
            ClientState::QueuedWriter
        };
        self.shared.set_client_state(queued);

        let deadline = self.effective_deadline(deadline);
        let interrupt = if self.uninterruptible == 0 {
            self.interrupt.as_ref()
        } else {
            None
        };
        match self.service.tickets().acquire(mode, deadline, interrupt) {
            Ok(taken) => {
                self.ticket_held = taken;
                self.mode_for_ticket = Some(mode);
                self.shared.set_client_state(if mode.is_shared() {
                    ClientState::ActiveReader
                } else {
                    ClientState::ActiveWriter
                });
                Ok(())
            }
            Err(err) => {
                self.shared.set_client_state(ClientState::Inactive);
                Err(err)
            }
        }
    }

    /// Return the admission ticket while keeping all locks, so a blocked
    /// operation does not count against the active set. Pair with
    /// [`Locker::reacquire_ticket`].
    pub fn release_ticket(&mut self) {
        if let Some(mode) = self.mode_for_ticket {
            if self.ticket_held {
                self.service.tickets().release(mode);
                self.ticket_held = false;
                self.shared.set_client_state(ClientState::Inactive);
            }
        }
    }

    pub fn reacquire_ticket(&mut self, deadline: Option<Instant>) -> TarnResult<()> {
        match self.mode_for_ticket {
            Some(mode) if !self.ticket_held => self.acquire_ticket(mode, deadline),
            _ => Ok(()),
        }
    }

    /// Release the Global lock and, once it is fully out (recursion
    /// unwound, not deferred), every remaining database, collection and
    /// metadata lock along with the admission ticket. Returns whether the
    /// Global lock was fully released.
    pub fn unlock_global(&mut self) -> bool {
        if !self.unlock(ResourceId::GLOBAL) {
            return false;
        }
        assert_eq!(self.wuow_nesting, 0, "global lock escaped a write unit of work");

        let remaining: Vec<ResourceId> = {
            let requests = self.shared.requests.lock();
            requests
                .keys()
                .copied()
                .filter(|res| {
                    !matches!(
                        res.resource_type(),
                        ResourceType::Global | ResourceType::Mutex
                    )
                })
                .collect()
        };
        for resource in remaining {
            while !self.unlock(resource) {}
        }
        true
    }

    /// Replace a held Global Exclusive lock with Shared without a release
    /// window in between, letting readers in while still excluding writers.
    pub fn downgrade_global_x_to_s(&mut self) {
        debug_assert_eq!(self.held_mode(ResourceId::GLOBAL), LockMode::Exclusive);
        self.downgrade(ResourceId::GLOBAL, LockMode::Shared);
    }

    // -------------------------------------------------------------------
    // Resource locks
    // -------------------------------------------------------------------

    pub fn lock(&mut self, resource: ResourceId, mode: LockMode) -> TarnResult<()> {
        self.lock_deadline(resource, mode, None)
    }

    pub fn lock_deadline(
        &mut self,
        resource: ResourceId,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> TarnResult<()> {
        self.check_interrupt(resource, mode)?;
        let state = self.lock_begin(resource, mode);
        if state == GrantState::Waiting {
            self.lock_complete(resource, mode, deadline, true)?;
        }
        Ok(())
    }

    /// Start an acquisition. Covered re-locks and pending-unlock reuse are
    /// resolved entirely locally; everything else goes to the manager.
    fn lock_begin(&mut self, resource: ResourceId, mode: LockMode) -> GrantState {
        debug_assert!(mode != LockMode::None);
        let shared = self.shared.clone();
        let mut requests = shared.requests.lock();

        if let Some(held) = requests.get_mut(&resource) {
            if mode.is_covered_by(held.mode) {
                if held.unlock_pending > 0 {
                    // Re-lock of a resource whose release is deferred:
                    // cancel one pending release instead of recursing.
                    held.unlock_pending -= 1;
                    self.deferred_unlock_count -= 1;
                } else {
                    held.recursive_count += 1;
                }
                return GrantState::Granted;
            }

            // Conversion to a stronger mode.
            debug_assert_eq!(
                held.status,
                RequestStatus::Granted,
                "conversion while a request is already pending"
            );
            self.notice.clear();
            let state = self
                .service
                .manager()
                .convert(resource, shared.id, mode, self.notice.clone());
            match state {
                GrantState::Granted => {
                    held.mode = held.mode.combine(mode);
                    held.recursive_count += 1;
                }
                GrantState::Waiting => held.status = RequestStatus::Converting,
            }
            drop(requests);
            self.record_acquisition(resource, state);
            return state;
        }

        if !matches!(
            resource.resource_type(),
            ResourceType::Global | ResourceType::Mutex
        ) {
            debug_assert!(
                requests.contains_key(&ResourceId::GLOBAL),
                "{resource} requested without the Global lock"
            );
        }

        self.notice.clear();
        let state = self.service.manager().lock(
            resource,
            shared.id,
            mode,
            self.notice.clone(),
            QueuePolicy::for_request(resource, mode),
        );
        requests.insert(
            resource,
            HeldLock {
                mode,
                recursive_count: 1,
                unlock_pending: 0,
                status: match state {
                    GrantState::Granted => RequestStatus::Granted,
                    GrantState::Waiting => RequestStatus::Waiting,
                },
            },
        );
        drop(requests);
        self.record_acquisition(resource, state);
        state
    }

    /// Block until the pending request on `resource` is granted or fails.
    /// The wait is sliced by the deadlock poll interval; each wakeup
    /// re-checks interruption, runs deadlock detection, and re-checks the
    /// deadline. Any failure unwinds the request completely.
    fn lock_complete(
        &mut self,
        resource: ResourceId,
        mode: LockMode,
        deadline: Option<Instant>,
        check_deadlock: bool,
    ) -> TarnResult<()> {
        let id = self.shared.id;
        let deadline = self.effective_deadline(deadline);
        let poll = self.service.config().deadlock_poll_interval();
        let wait_start = Instant::now();

        let outcome = loop {
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(LockError::Timeout { resource, mode });
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };
            if self.notice.wait_for(slice) {
                break Ok(());
            }
            if self.uninterruptible == 0 {
                if let Some(flag) = &self.interrupt {
                    if flag.is_interrupted() {
                        break Err(LockError::Interrupted { resource, mode });
                    }
                }
            }
            if check_deadlock {
                if let Some(cycle) = deadlock::check(self.service.manager(), id) {
                    warn!(
                        locker = %id,
                        resource = %resource,
                        ?cycle,
                        "deadlock detected, aborting wait"
                    );
                    self.service.stats().record_deadlock(id, resource);
                    self.shared.stats.lock().record_deadlock(resource);
                    break Err(LockError::Deadlock { resource, cycle });
                }
            }
        };

        let waited = wait_start.elapsed().as_micros() as u64;
        self.service.stats().record_wait_time(id, resource, waited);
        self.shared.stats.lock().record_wait_time(resource, waited);

        match outcome {
            Ok(()) => {
                let shared = self.shared.clone();
                let mut requests = shared.requests.lock();
                let held = requests
                    .get_mut(&resource)
                    .expect("granted request is untracked");
                match held.status {
                    RequestStatus::Waiting => held.status = RequestStatus::Granted,
                    RequestStatus::Converting => {
                        held.mode = held.mode.combine(mode);
                        held.recursive_count += 1;
                        held.status = RequestStatus::Granted;
                    }
                    RequestStatus::Granted => unreachable!("completed wait was never pending"),
                }
                Ok(())
            }
            Err(err) => {
                self.unwind_failed_wait(resource);
                Err(err)
            }
        }
    }

    /// Remove every trace of a failed request, tolerating the race where
    /// the grant landed after the failure decision.
    fn unwind_failed_wait(&mut self, resource: ResourceId) {
        let shared = self.shared.clone();
        let mut requests = shared.requests.lock();
        let held = requests
            .get_mut(&resource)
            .expect("failed request is untracked");
        match held.status {
            RequestStatus::Waiting => {
                self.service
                    .manager()
                    .abandon_request(resource, shared.id, LockMode::None);
                requests.remove(&resource);
                drop(requests);
                if resource == ResourceId::GLOBAL {
                    self.finish_global_release();
                }
            }
            RequestStatus::Converting => {
                let revert_to = held.mode;
                self.service
                    .manager()
                    .abandon_request(resource, shared.id, revert_to);
                held.status = RequestStatus::Granted;
            }
            RequestStatus::Granted => unreachable!("unwinding a granted request"),
        }
    }

    /// Release one level of `resource`. Inside a write unit of work the
    /// release of two-phase modes is deferred instead. Returns whether the
    /// lock is now fully released.
    pub fn unlock(&mut self, resource: ResourceId) -> bool {
        let shared = self.shared.clone();
        let mut requests = shared.requests.lock();
        let held = match requests.get_mut(&resource) {
            Some(held) => held,
            None => return false,
        };
        debug_assert_eq!(
            held.status,
            RequestStatus::Granted,
            "unlock while a request is pending"
        );

        if self.wuow_nesting > 0 && self.should_delay_unlock(resource, held.mode) {
            held.unlock_pending += 1;
            debug_assert!(held.unlock_pending <= held.recursive_count, "unbalanced unlock");
            self.deferred_unlock_count += 1;
            return false;
        }

        debug_assert!(held.recursive_count > 0, "unbalanced unlock");
        held.recursive_count -= 1;
        if held.recursive_count > 0 {
            return false;
        }

        requests.remove(&resource);
        drop(requests);
        self.service.manager().unlock(resource, shared.id);
        if resource == ResourceId::GLOBAL {
            self.finish_global_release();
        }
        true
    }

    fn should_delay_unlock(&self, resource: ResourceId, mode: LockMode) -> bool {
        if resource.resource_type() == ResourceType::Mutex {
            return false;
        }
        if let Some(companion) = &self.companion {
            if let Some(held_global) = self.mode_for_ticket {
                if companion
                    .companion(held_global)
                    .is_some_and(|(res, _)| res == resource)
                {
                    return false;
                }
            }
        }
        match mode {
            LockMode::Exclusive | LockMode::IntentExclusive => true,
            LockMode::Shared | LockMode::IntentShared => self.shared_locks_two_phase,
            LockMode::None => false,
        }
    }

    fn finish_global_release(&mut self) {
        if let Some(mode) = self.mode_for_ticket.take() {
            if self.ticket_held {
                self.service.tickets().release(mode);
                self.ticket_held = false;
            }
        }
        self.shared.set_client_state(ClientState::Inactive);
    }

    /// Atomically weaken a held lock. The new mode must be covered by the
    /// held one.
    pub fn downgrade(&mut self, resource: ResourceId, new_mode: LockMode) {
        let shared = self.shared.clone();
        let mut requests = shared.requests.lock();
        let held = requests
            .get_mut(&resource)
            .expect("downgrade of a lock that is not held");
        debug_assert_eq!(held.status, RequestStatus::Granted);
        self.service.manager().downgrade(resource, shared.id, new_mode);
        held.mode = new_mode;
    }

    // -------------------------------------------------------------------
    // Write units of work
    // -------------------------------------------------------------------

    /// Enter a write unit of work. Until the matching
    /// [`Locker::end_write_unit_of_work`], releases of exclusive-family
    /// locks (and shared ones if configured) are deferred, giving two-phase
    /// locking within the unit.
    pub fn begin_write_unit_of_work(&mut self) {
        self.wuow_nesting += 1;
    }

    /// Leave a write unit of work. When the outermost unit ends, all
    /// deferred releases are replayed.
    pub fn end_write_unit_of_work(&mut self) {
        debug_assert!(self.wuow_nesting > 0, "unbalanced end of write unit of work");
        self.wuow_nesting -= 1;
        if self.wuow_nesting > 0 || self.deferred_unlock_count == 0 {
            return;
        }

        let pending: Vec<(ResourceId, u32)> = {
            let requests = self.shared.requests.lock();
            requests
                .iter()
                .filter(|(_, held)| held.unlock_pending > 0)
                .map(|(res, held)| (*res, held.unlock_pending))
                .collect()
        };
        for (resource, count) in pending {
            {
                let shared = self.shared.clone();
                let mut requests = shared.requests.lock();
                if let Some(held) = requests.get_mut(&resource) {
                    held.unlock_pending = 0;
                }
            }
            for _ in 0..count {
                self.unlock(resource);
            }
        }
        self.deferred_unlock_count = 0;
    }

    pub fn in_write_unit_of_work(&self) -> bool {
        self.wuow_nesting > 0
    }

    // -------------------------------------------------------------------
    // Yield and restore
    // -------------------------------------------------------------------

    /// Release everything held, returning a snapshot from which the exact
    /// same lock set can be reacquired. Refuses (returns `None`) when the
    /// session holds nothing, or holds the Global lock recursively, since a
    /// partial release would break the caller's invariants. Must not be
    /// called inside a write unit of work.
    pub fn save_lock_state_and_unlock(&mut self) -> Option<LockSnapshot> {
        debug_assert_eq!(self.wuow_nesting, 0, "yield inside a write unit of work");

        let (global_mode, locks) = {
            let requests = self.shared.requests.lock();
            let global = requests.get(&ResourceId::GLOBAL)?;
            if global.recursive_count > 1 {
                return None;
            }
            let mut locks = Vec::with_capacity(requests.len().saturating_sub(1));
            for (resource, held) in requests.iter() {
                if *resource == ResourceId::GLOBAL {
                    continue;
                }
                debug_assert!(
                    resource.resource_type() != ResourceType::Mutex,
                    "mutex resources cannot be yielded"
                );
                debug_assert_eq!(held.recursive_count, 1, "yield of a recursively held lock");
                debug_assert_eq!(held.unlock_pending, 0);
                if self.is_companion_resource(*resource) {
                    // Reacquired as a side effect of lock_global on restore.
                    continue;
                }
                locks.push((*resource, held.mode));
            }
            (global.mode, locks)
        };

        let mut snapshot = LockSnapshot { global_mode, locks };
        snapshot.locks.sort();

        for (resource, _) in &snapshot.locks {
            let released = self.unlock(*resource);
            debug_assert!(released);
        }
        let released = self.unlock_global();
        debug_assert!(released);
        Some(snapshot)
    }

    /// Reacquire a saved lock set: the parallel-batch-writer resource first
    /// when present, then the Global lock (and ticket), then everything
    /// else in canonical order.
    ///
    /// On failure the partial reacquisition is unwound before the error is
    /// returned, so the session again holds nothing and may retry or bail.
    pub fn restore_lock_state(&mut self, snapshot: &LockSnapshot) -> TarnResult<()> {
        debug_assert_eq!(self.wuow_nesting, 0);
        debug_assert!(self.mode_for_ticket.is_none(), "restore over live lock state");

        let mut rest = snapshot.locks.as_slice();
        let mut batch_writer_held = false;
        if let Some(&(first, mode)) = rest.first() {
            if first == ResourceId::PARALLEL_BATCH_WRITER {
                self.lock(first, mode)?;
                batch_writer_held = true;
                rest = &rest[1..];
            }
        }
        let outcome = self.lock_global(snapshot.global_mode).and_then(|()| {
            for &(resource, mode) in rest {
                if let Err(err) = self.lock(resource, mode) {
                    // unlock_global sweeps the locks reacquired so far.
                    self.unlock_global();
                    return Err(err);
                }
            }
            Ok(())
        });
        if outcome.is_err() && batch_writer_held {
            // Global-type resources survive the sweep; release it directly.
            self.unlock(ResourceId::PARALLEL_BATCH_WRITER);
        }
        outcome
    }

    fn is_companion_resource(&self, resource: ResourceId) -> bool {
        match (&self.companion, self.mode_for_ticket) {
            (Some(companion), Some(global_mode)) => companion
                .companion(global_mode)
                .is_some_and(|(res, _)| res == resource),
            _ => false,
        }
    }

    // -------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------

    /// Mode currently held on `resource`, `None` when untracked.
    pub fn held_mode(&self, resource: ResourceId) -> LockMode {
        self.shared
            .requests
            .lock()
            .get(&resource)
            .map(|held| held.mode)
            .unwrap_or(LockMode::None)
    }

    pub fn is_locked(&self) -> bool {
        self.held_mode(ResourceId::GLOBAL) != LockMode::None
    }

    /// Global Exclusive held.
    pub fn is_w(&self) -> bool {
        self.held_mode(ResourceId::GLOBAL) == LockMode::Exclusive
    }

    /// Global Shared held.
    pub fn is_r(&self) -> bool {
        self.held_mode(ResourceId::GLOBAL) == LockMode::Shared
    }

    pub fn is_write_locked(&self) -> bool {
        self.is_lock_held_for_mode(ResourceId::GLOBAL, LockMode::IntentExclusive)
    }

    pub fn is_read_locked(&self) -> bool {
        self.is_lock_held_for_mode(ResourceId::GLOBAL, LockMode::IntentShared)
    }

    /// Whether the held mode on `resource` covers `mode`.
    pub fn is_lock_held_for_mode(&self, resource: ResourceId, mode: LockMode) -> bool {
        mode.is_covered_by(self.held_mode(resource))
    }

    pub fn is_db_locked_for_mode(&self, db_name: &str, mode: LockMode) -> bool {
        if self.is_w() {
            return true;
        }
        if self.is_r() && mode.is_shared() {
            return true;
        }
        self.is_lock_held_for_mode(ResourceId::database(db_name), mode)
    }

    /// `namespace` is "db.collection". Intent modes on the database defer
    /// to the collection lock; S/X on the database cover outright.
    pub fn is_collection_locked_for_mode(&self, namespace: &str, mode: LockMode) -> bool {
        if self.is_w() {
            return true;
        }
        if self.is_r() && mode.is_shared() {
            return true;
        }
        let db_name = namespace.split('.').next().unwrap_or(namespace);
        match self.held_mode(ResourceId::database(db_name)) {
            LockMode::None => false,
            LockMode::Exclusive => true,
            LockMode::Shared => mode.is_shared(),
            LockMode::IntentShared | LockMode::IntentExclusive => {
                self.is_lock_held_for_mode(ResourceId::collection(namespace), mode)
            }
        }
    }

    pub fn is_global_locked_recursively(&self) -> bool {
        self.shared
            .requests
            .lock()
            .get(&ResourceId::GLOBAL)
            .map(|held| held.recursive_count > 1)
            .unwrap_or(false)
    }

    /// Resource this session is currently parked on, if any.
    pub fn waiting_resource(&self) -> Option<ResourceId> {
        self.service.manager().waiting_resource(self.shared.id)
    }

    pub fn client_state(&self) -> ClientState {
        self.shared.client_state()
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        self.shared.stats()
    }

    /// Session counters accumulated since `base` was taken, for
    /// per-operation reporting.
    pub fn stats_since(&self, base: &LockStatsSnapshot) -> LockStatsSnapshot {
        let mut stats = self.shared.stats();
        stats.subtract(base);
        stats
    }

    pub fn info(&self) -> LockerInfo {
        self.shared.info(self.service.manager())
    }

    /// Log the session's held locks at debug level.
    pub fn dump(&self) {
        let info = self.info();
        debug!(locker = %info.id, state = ?info.client_state, "lock session dump");
        for (resource, mode) in &info.held {
            debug!(locker = %info.id, resource = %resource, mode = %mode, "held");
        }
    }

    // -------------------------------------------------------------------

    fn check_interrupt(&self, resource: ResourceId, mode: LockMode) -> TarnResult<()> {
        if self.uninterruptible == 0 {
            if let Some(flag) = &self.interrupt {
                if flag.is_interrupted() {
                    return Err(LockError::Interrupted { resource, mode });
                }
            }
        }
        Ok(())
    }

    /// Caller deadline capped by the session's max lock timeout, unless in
    /// an uninterruptible region.
    fn effective_deadline(&self, deadline: Option<Instant>) -> Option<Instant> {
        if self.uninterruptible > 0 {
            return deadline;
        }
        match self.max_lock_timeout {
            Some(cap) => {
                let capped = Instant::now() + cap;
                Some(deadline.map_or(capped, |d| d.min(capped)))
            }
            None => deadline,
        }
    }

    fn record_acquisition(&self, resource: ResourceId, state: GrantState) {
        let id = self.shared.id;
        self.service.stats().record_acquisition(id, resource);
        let mut stats = self.shared.stats.lock();
        stats.record_acquisition(resource);
        if state == GrantState::Waiting {
            stats.record_wait(resource);
            drop(stats);
            self.service.stats().record_wait(id, resource);
        }
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        self.service.deregister(self.shared.id);
        if !std::thread::panicking() {
            assert_eq!(self.wuow_nesting, 0, "locker dropped inside a write unit of work");
            assert_eq!(self.deferred_unlock_count, 0);
            assert!(
                self.shared.requests.lock().is_empty(),
                "locker dropped with locks held"
            );
            assert!(self.mode_for_ticket.is_none());
        }
    }
}
