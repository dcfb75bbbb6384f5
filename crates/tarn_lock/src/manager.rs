//! The shared lock manager: per-resource grant lists and wait queues.
//!
//! For every [`ResourceId`] with live requests the manager keeps a
//! [`LockHead`]: the set of granted holders, an ordered wait queue, and
//! compatible-first accounting. Requests are keyed by `(ResourceId,
//! LockerId)`; the manager has no notion of sessions beyond that key.
//! Recursion counting and two-phase unlock deferral are the
//! [`Locker`](crate::locker::Locker)'s concern; the manager is only called
//! when a lock is first needed, converted, or finally released.
//!
//! Grant ordering within one resource is FIFO with two deliberate
//! exceptions:
//! - Global-type Shared/Exclusive requests enqueue at the *front* and are
//!   marked compatible-first, so infrequent instance-wide operations
//!   (shutdown, schema publish) are not starved behind a stream of intent
//!   locks.
//! - While a compatible-first holder is granted, the grant scan may step
//!   past conflicting waiters to admit compatible ones.
//!
//! Deadlocks are not detected here; blocked sessions poll the
//! [`deadlock`](crate::deadlock) walker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use tarn_common::types::{LockMode, LockerId, ResourceId, LOCK_MODE_COUNT};

/// Outcome of a grant attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantState {
    /// The request is granted; the caller holds the lock.
    Granted,
    /// The request is enqueued; the caller must block on its notice.
    Waiting,
}

/// Status of a request slot inside a `LockHead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Granted,
    Waiting,
    Converting,
}

/// Queue placement policy for a new request.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueuePolicy {
    pub enqueue_at_front: bool,
    pub compatible_first: bool,
}

impl QueuePolicy {
    /// Policy for `resource`/`mode`: Global-type S/X requests get priority
    /// so instance-wide operations are not starved behind intent locks.
    pub fn for_request(resource: ResourceId, mode: LockMode) -> QueuePolicy {
        use tarn_common::types::ResourceType;
        let boost = resource.resource_type() == ResourceType::Global
            && matches!(mode, LockMode::Shared | LockMode::Exclusive);
        QueuePolicy {
            enqueue_at_front: boost,
            compatible_first: boost,
        }
    }
}

/// Condvar-backed grant notification, one per lock session. Cleared before
/// each blocking request so a grant that lands between enqueue and wait is
/// not lost.
pub struct GrantNotice {
    granted: Mutex<bool>,
    cond: Condvar,
}

impl GrantNotice {
    pub fn new() -> Arc<GrantNotice> {
        Arc::new(GrantNotice {
            granted: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub fn clear(&self) {
        *self.granted.lock() = false;
    }

    pub fn notify(&self) {
        let mut granted = self.granted.lock();
        *granted = true;
        self.cond.notify_all();
    }

    /// Block for at most `timeout`. Returns whether the request has been
    /// granted. Spurious wakeups are fine; callers loop and re-check
    /// deadlines anyway.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut granted = self.granted.lock();
        if *granted {
            return true;
        }
        self.cond.wait_for(&mut granted, timeout);
        *granted
    }
}

/// One request by one session on one resource.
struct LockSlot {
    locker: LockerId,
    mode: LockMode,
    status: RequestStatus,
    /// Target mode while `status == Converting`; `None` otherwise.
    convert_mode: LockMode,
    compatible_first: bool,
    notice: Arc<GrantNotice>,
}

/// Per-resource grant/wait state.
#[derive(Default)]
struct LockHead {
    granted: Vec<LockSlot>,
    granted_counts: [u32; LOCK_MODE_COUNT],
    queue: VecDeque<LockSlot>,
    /// Number of granted slots carrying the compatible-first flag.
    compatible_first_count: u32,
}

impl LockHead {
    fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.queue.is_empty()
    }

    fn granted_mask(&self) -> u32 {
        let mut mask = 0;
        for (idx, &count) in self.granted_counts.iter().enumerate() {
            if count > 0 {
                mask |= 1 << idx;
            }
        }
        mask
    }

    /// Granted mode mask with `locker`'s own contribution removed; used for
    /// conversion compatibility checks (a session never conflicts with
    /// itself).
    fn granted_mask_excluding(&self, locker: LockerId) -> u32 {
        let mut counts = self.granted_counts;
        for slot in &self.granted {
            if slot.locker == locker {
                counts[slot.mode as usize] -= 1;
            }
        }
        let mut mask = 0;
        for (idx, &count) in counts.iter().enumerate() {
            if count > 0 {
                mask |= 1 << idx;
            }
        }
        mask
    }

    /// Mask of pending conversion targets. A converting slot blocks new
    /// entrants at its target mode even though it is still granted at its
    /// old one, so conversions cannot be starved by a stream of requests
    /// compatible with the current holders.
    fn convert_mask(&self) -> u32 {
        let mut mask = 0;
        for slot in &self.granted {
            if slot.status == RequestStatus::Converting {
                mask |= slot.convert_mode.bit();
            }
        }
        mask
    }

    fn granted_index(&self, locker: LockerId) -> Option<usize> {
        self.granted.iter().position(|s| s.locker == locker)
    }

    fn queue_index(&self, locker: LockerId) -> Option<usize> {
        self.queue.iter().position(|s| s.locker == locker)
    }

    fn add_granted(&mut self, mut slot: LockSlot) {
        slot.status = RequestStatus::Granted;
        self.granted_counts[slot.mode as usize] += 1;
        if slot.compatible_first {
            self.compatible_first_count += 1;
        }
        self.granted.push(slot);
    }

    fn remove_granted(&mut self, idx: usize) -> LockSlot {
        let slot = self.granted.swap_remove(idx);
        self.granted_counts[slot.mode as usize] -= 1;
        if slot.compatible_first {
            self.compatible_first_count -= 1;
        }
        slot
    }
}

/// The shared, instance-wide lock table.
///
/// Injectable and self-contained: unit tests create as many independent
/// managers as they like. The per-resource heads live in a sharded map; all
/// mutation happens under the owning shard's lock, so a head's granted set
/// is always internally compatible.
pub struct LockManager {
    heads: DashMap<ResourceId, LockHead>,
    /// Wait registry: which resource each blocked session is parked on.
    /// Read by the deadlock detector and the diagnostics snapshot.
    ///
    /// Lock order: a `heads` shard guard may be held while touching this
    /// map, never the reverse. Readers copy the value out immediately.
    waiters: DashMap<LockerId, ResourceId>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> LockManager {
        LockManager {
            heads: DashMap::new(),
            waiters: DashMap::new(),
        }
    }

    /// Request `mode` on `resource` for `locker`. Grants synchronously when
    /// compatible with all current holders and the queue does not demand
    /// FIFO ordering; otherwise enqueues per `policy` and returns
    /// [`GrantState::Waiting`], and the caller then blocks on `notice`.
    pub fn lock(
        &self,
        resource: ResourceId,
        locker: LockerId,
        mode: LockMode,
        notice: Arc<GrantNotice>,
        policy: QueuePolicy,
    ) -> GrantState {
        debug_assert!(mode != LockMode::None);
        let mut head = self.heads.entry(resource).or_default();
        debug_assert!(
            head.granted_index(locker).is_none() && head.queue_index(locker).is_none(),
            "duplicate request for {resource} by {locker}; recursion is the session's concern"
        );

        let slot = LockSlot {
            locker,
            mode,
            status: RequestStatus::Waiting,
            convert_mode: LockMode::None,
            compatible_first: policy.compatible_first,
            notice,
        };

        // Immediate grant requires compatibility with every holder and every
        // pending conversion target, and an empty queue, except while a
        // compatible-first holder is granted, in which case compatible
        // requests may jump ahead of queued conflicting ones.
        if mode.compatible_with(head.granted_mask() | head.convert_mask())
            && (head.queue.is_empty() || head.compatible_first_count > 0)
        {
            head.add_granted(slot);
            return GrantState::Granted;
        }

        if policy.enqueue_at_front {
            head.queue.push_front(slot);
        } else {
            head.queue.push_back(slot);
        }
        self.waiters.insert(locker, resource);
        GrantState::Waiting
    }

    /// Convert `locker`'s granted lock on `resource` towards `new_mode`. The
    /// effective target is `combine(current, new_mode)` so the strongest
    /// ever-granted mode is retained. While the conversion is pending the
    /// slot keeps blocking others in its old mode.
    ///
    /// Pending conversions are granted ahead of new entrants: they are
    /// re-checked first whenever the granted set changes.
    pub fn convert(
        &self,
        resource: ResourceId,
        locker: LockerId,
        new_mode: LockMode,
        notice: Arc<GrantNotice>,
    ) -> GrantState {
        let mut head = self
            .heads
            .get_mut(&resource)
            .expect("convert on resource with no lock state");
        let mask_others = head.granted_mask_excluding(locker);
        let idx = head
            .granted_index(locker)
            .expect("convert without a granted lock");
        let slot = &mut head.granted[idx];
        debug_assert_eq!(slot.status, RequestStatus::Granted, "conversion already pending");

        let target = slot.mode.combine(new_mode);
        if target == slot.mode {
            return GrantState::Granted;
        }

        if target.compatible_with(mask_others) {
            let old = slot.mode;
            slot.mode = target;
            head.granted_counts[old as usize] -= 1;
            head.granted_counts[target as usize] += 1;
            return GrantState::Granted;
        }

        let slot = &mut head.granted[idx];
        slot.status = RequestStatus::Converting;
        slot.convert_mode = target;
        slot.notice = notice;
        self.waiters.insert(locker, resource);
        GrantState::Waiting
    }

    /// Fully release `locker`'s granted lock on `resource` and grant any
    /// waiters that became compatible. Returns whether at least one waiter
    /// was granted. Called only at recursion zero.
    pub fn unlock(&self, resource: ResourceId, locker: LockerId) -> bool {
        let mut head = self
            .heads
            .get_mut(&resource)
            .expect("unlock on resource with no lock state");
        let idx = head
            .granted_index(locker)
            .expect("unlock without a granted lock");
        debug_assert_eq!(
            head.granted[idx].status,
            RequestStatus::Granted,
            "unlock of a converting request; abandon the conversion first"
        );
        head.remove_granted(idx);
        self.schedule(&mut head) > 0
    }

    /// Unwind a request that failed its wait (timeout, deadlock,
    /// interruption) so nothing dangles in the manager's structures.
    ///
    /// `revert_to` is `LockMode::None` for a first-time request, or the
    /// previously granted mode for a failed conversion. Both cases tolerate
    /// the race where the grant landed between the wait's failure and this
    /// call: a granted first-time request is released, a completed
    /// conversion is downgraded back.
    pub fn abandon_request(&self, resource: ResourceId, locker: LockerId, revert_to: LockMode) {
        let mut head = self
            .heads
            .get_mut(&resource)
            .expect("abandon on resource with no lock state");
        self.waiters.remove(&locker);

        if revert_to == LockMode::None {
            if let Some(idx) = head.queue_index(locker) {
                head.queue.remove(idx);
            } else {
                // Granted concurrently with the failure decision; release.
                let idx = head
                    .granted_index(locker)
                    .expect("abandoned request neither queued nor granted");
                head.remove_granted(idx);
            }
        } else {
            let idx = head
                .granted_index(locker)
                .expect("abandoned conversion is not granted");
            let slot = &mut head.granted[idx];
            match slot.status {
                RequestStatus::Converting => {
                    slot.status = RequestStatus::Granted;
                    slot.convert_mode = LockMode::None;
                }
                RequestStatus::Granted => {
                    // Conversion completed concurrently; fall back to the
                    // mode the session still believes it holds.
                    let promoted = slot.mode;
                    slot.mode = revert_to;
                    head.granted_counts[promoted as usize] -= 1;
                    head.granted_counts[revert_to as usize] += 1;
                }
                RequestStatus::Waiting => unreachable!("conversion slot cannot be queued"),
            }
        }

        // The abandoned request may have been what blocked the queue.
        self.schedule(&mut head);
    }

    /// Atomically replace a held exclusive-family mode with a weaker one
    /// (no drop-and-reacquire, so there is no visibility gap), then grant
    /// newly compatible waiters.
    pub fn downgrade(&self, resource: ResourceId, locker: LockerId, new_mode: LockMode) {
        let mut head = self
            .heads
            .get_mut(&resource)
            .expect("downgrade on resource with no lock state");
        let idx = head
            .granted_index(locker)
            .expect("downgrade without a granted lock");
        let slot = &mut head.granted[idx];
        debug_assert_eq!(slot.status, RequestStatus::Granted);
        assert!(
            new_mode.is_covered_by(slot.mode),
            "downgrade to {new_mode} from weaker {}",
            slot.mode
        );
        let old = slot.mode;
        slot.mode = new_mode;
        head.granted_counts[old as usize] -= 1;
        head.granted_counts[new_mode as usize] += 1;
        self.schedule(&mut head);
    }

    /// Grant scheduling after the granted set shrank or weakened: pending
    /// conversions first, then the wait queue in order. A conflicting waiter
    /// stops the scan unless a compatible-first holder is granted.
    fn schedule(&self, head: &mut LockHead) -> usize {
        let mut woke = 0;

        for idx in 0..head.granted.len() {
            if head.granted[idx].status != RequestStatus::Converting {
                continue;
            }
            let target = head.granted[idx].convert_mode;
            let mask = head.granted_mask_excluding(head.granted[idx].locker);
            if target.compatible_with(mask) {
                let slot = &mut head.granted[idx];
                let old = slot.mode;
                slot.mode = target;
                slot.status = RequestStatus::Granted;
                slot.convert_mode = LockMode::None;
                head.granted_counts[old as usize] -= 1;
                head.granted_counts[target as usize] += 1;
                self.waiters.remove(&head.granted[idx].locker);
                head.granted[idx].notice.notify();
                woke += 1;
            }
        }

        let mut idx = 0;
        while idx < head.queue.len() {
            if head.queue[idx]
                .mode
                .compatible_with(head.granted_mask() | head.convert_mask())
            {
                let slot = head.queue.remove(idx).expect("index checked");
                self.waiters.remove(&slot.locker);
                slot.notice.notify();
                head.add_granted(slot);
                woke += 1;
            } else if head.compatible_first_count > 0 {
                idx += 1;
            } else {
                break;
            }
        }

        woke
    }

    /// The resource `locker` is currently parked on, if any.
    pub fn waiting_resource(&self, locker: LockerId) -> Option<ResourceId> {
        self.waiters.get(&locker).map(|entry| *entry)
    }

    /// Snapshot of all (waiter, resource) pairs, for the deadlock walker.
    pub fn waiting_pairs(&self) -> Vec<(LockerId, ResourceId)> {
        self.waiters
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Sessions blocking `waiter` on `resource`: granted holders whose mode
    /// conflicts with the waiter's pending mode, plus conflicting requests
    /// queued ahead of it. These are the wait-for graph edges.
    pub fn conflict_owners(&self, resource: ResourceId, waiter: LockerId) -> Vec<LockerId> {
        let head = match self.heads.get(&resource) {
            Some(head) => head,
            None => return Vec::new(),
        };

        let mut owners = Vec::new();
        if let Some(pos) = head.queue_index(waiter) {
            let pending = head.queue[pos].mode;
            for slot in &head.granted {
                let blocks = !pending.compatible_with(slot.mode.bit())
                    || (slot.status == RequestStatus::Converting
                        && !pending.compatible_with(slot.convert_mode.bit()));
                if slot.locker != waiter && blocks {
                    owners.push(slot.locker);
                }
            }
            for slot in head.queue.iter().take(pos) {
                if !pending.compatible_with(slot.mode.bit()) {
                    owners.push(slot.locker);
                }
            }
        } else if let Some(idx) = head.granted_index(waiter) {
            let slot = &head.granted[idx];
            if slot.status == RequestStatus::Converting {
                let pending = slot.convert_mode;
                for other in &head.granted {
                    if other.locker != waiter && !pending.compatible_with(other.mode.bit()) {
                        owners.push(other.locker);
                    }
                }
            }
        }
        owners
    }

    /// Granted holders of `resource`, for diagnostics and tests.
    pub fn granted_holders(&self, resource: ResourceId) -> Vec<(LockerId, LockMode)> {
        self.heads
            .get(&resource)
            .map(|head| head.granted.iter().map(|s| (s.locker, s.mode)).collect())
            .unwrap_or_default()
    }

    /// Length of `resource`'s wait queue.
    pub fn queue_len(&self, resource: ResourceId) -> usize {
        self.heads.get(&resource).map(|h| h.queue.len()).unwrap_or(0)
    }

    /// Drop per-resource state with no granted holders and no waiters.
    /// Invoked by the periodic background sweep; heads are recreated on
    /// first use, so this only bounds memory.
    pub fn cleanup_unused_locks(&self) -> usize {
        let before = self.heads.len();
        self.heads.retain(|_, head| !head.is_empty());
        before - self.heads.len()
    }

    /// Number of resources with live lock state.
    pub fn resource_count(&self) -> usize {
        self.heads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LockMode::*;

    fn mgr() -> LockManager {
        LockManager::new()
    }

    fn lock(
        m: &LockManager,
        res: ResourceId,
        id: u64,
        mode: LockMode,
    ) -> (GrantState, Arc<GrantNotice>) {
        let notice = GrantNotice::new();
        let state = m.lock(
            res,
            LockerId(id),
            mode,
            notice.clone(),
            QueuePolicy::for_request(res, mode),
        );
        (state, notice)
    }

    #[test]
    fn test_compatible_grants_are_immediate() {
        let m = mgr();
        let res = ResourceId::collection("db.users");
        assert_eq!(lock(&m, res, 1, IntentShared).0, GrantState::Granted);
        assert_eq!(lock(&m, res, 2, IntentExclusive).0, GrantState::Granted);
        assert_eq!(lock(&m, res, 3, IntentShared).0, GrantState::Granted);
        assert_eq!(m.granted_holders(res).len(), 3);
    }

    #[test]
    fn test_conflicting_request_waits_fifo() {
        let m = mgr();
        let res = ResourceId::collection("db.users");
        assert_eq!(lock(&m, res, 1, Exclusive).0, GrantState::Granted);
        let (state, notice) = lock(&m, res, 2, Shared);
        assert_eq!(state, GrantState::Waiting);
        assert_eq!(m.waiting_resource(LockerId(2)), Some(res));
        assert!(!notice.wait_for(Duration::from_millis(5)));

        assert!(m.unlock(res, LockerId(1)));
        assert!(notice.wait_for(Duration::from_millis(100)));
        assert!(m.waiting_resource(LockerId(2)).is_none());
        assert_eq!(m.granted_holders(res), vec![(LockerId(2), Shared)]);
    }

    #[test]
    fn test_fifo_blocks_compatible_behind_conflicting() {
        let m = mgr();
        let res = ResourceId::collection("db.users");
        // holder S, then queued X, then another S: the second S must not
        // jump the queued X (no compatible-first holder on collections).
        assert_eq!(lock(&m, res, 1, Shared).0, GrantState::Granted);
        assert_eq!(lock(&m, res, 2, Exclusive).0, GrantState::Waiting);
        assert_eq!(lock(&m, res, 3, Shared).0, GrantState::Waiting);
        assert_eq!(m.queue_len(res), 2);
    }

    #[test]
    fn test_global_shared_jumps_ahead_of_queued_intents() {
        let m = mgr();
        let res = ResourceId::GLOBAL;
        // Granted S carries compatible-first; a queued IX conflicts... use
        // X waiter to build the queue.
        assert_eq!(lock(&m, res, 1, Shared).0, GrantState::Granted);
        assert_eq!(lock(&m, res, 2, IntentExclusive).0, GrantState::Waiting);
        // A new IS is compatible with S and may jump the queued IX because
        // the S holder is compatible-first.
        assert_eq!(lock(&m, res, 3, IntentShared).0, GrantState::Granted);
    }

    #[test]
    fn test_exclusive_global_enqueues_at_front() {
        let m = mgr();
        let res = ResourceId::GLOBAL;
        assert_eq!(lock(&m, res, 1, IntentShared).0, GrantState::Granted);
        assert_eq!(lock(&m, res, 2, IntentExclusive).0, GrantState::Granted);
        // Conflicting IS waiter queues behind nothing; then X jumps in front.
        assert_eq!(lock(&m, res, 3, Shared).0, GrantState::Waiting);
        let (state, x_notice) = lock(&m, res, 4, Exclusive);
        assert_eq!(state, GrantState::Waiting);

        m.unlock(res, LockerId(1));
        m.unlock(res, LockerId(2));
        // X was enqueued at the front, so it wins over the earlier S.
        assert!(x_notice.wait_for(Duration::from_millis(100)));
        assert_eq!(m.granted_holders(res), vec![(LockerId(4), Exclusive)]);
    }

    #[test]
    fn test_conversion_granted_ahead_of_new_entrants() {
        let m = mgr();
        let res = ResourceId::collection("db.users");
        assert_eq!(lock(&m, res, 1, Shared).0, GrantState::Granted);
        assert_eq!(lock(&m, res, 2, Shared).0, GrantState::Granted);

        // 1 upgrades to X: blocked by 2's S.
        let notice = GrantNotice::new();
        assert_eq!(
            m.convert(res, LockerId(1), Exclusive, notice.clone()),
            GrantState::Waiting
        );
        // A new S entrant queues behind the pending conversion's conflict.
        let (state, _s_notice) = lock(&m, res, 3, Shared);
        assert_eq!(state, GrantState::Waiting);

        m.unlock(res, LockerId(2));
        assert!(notice.wait_for(Duration::from_millis(100)));
        // The conversion won; the new S entrant still waits behind X.
        assert_eq!(m.granted_holders(res), vec![(LockerId(1), Exclusive)]);
        assert_eq!(m.queue_len(res), 1);
    }

    #[test]
    fn test_pending_conversion_blocks_entrant_stream() {
        let m = mgr();
        let res = ResourceId::collection("db.users");
        assert_eq!(lock(&m, res, 1, Shared).0, GrantState::Granted);
        assert_eq!(lock(&m, res, 2, Shared).0, GrantState::Granted);
        let notice = GrantNotice::new();
        assert_eq!(
            m.convert(res, LockerId(1), Exclusive, notice.clone()),
            GrantState::Waiting
        );

        // A stream of S entrants is compatible with the granted S holders
        // but must not be granted past the pending S->X upgrade.
        assert_eq!(lock(&m, res, 3, Shared).0, GrantState::Waiting);
        assert_eq!(lock(&m, res, 4, Shared).0, GrantState::Waiting);
        // The entrants wait on the converting session, not the S holders.
        assert_eq!(m.conflict_owners(res, LockerId(3)), vec![LockerId(1)]);

        m.unlock(res, LockerId(2));
        assert!(notice.wait_for(Duration::from_millis(100)));
        assert_eq!(m.granted_holders(res), vec![(LockerId(1), Exclusive)]);
        assert_eq!(m.queue_len(res), 2);
    }

    #[test]
    fn test_conversion_retains_strongest_mode() {
        let m = mgr();
        let res = ResourceId::database("db");
        assert_eq!(lock(&m, res, 1, IntentExclusive).0, GrantState::Granted);
        let notice = GrantNotice::new();
        // IX + S combine to X.
        assert_eq!(
            m.convert(res, LockerId(1), Shared, notice),
            GrantState::Granted
        );
        assert_eq!(m.granted_holders(res), vec![(LockerId(1), Exclusive)]);
    }

    #[test]
    fn test_abandon_waiting_request_leaves_no_residue() {
        let m = mgr();
        let res = ResourceId::collection("db.users");
        assert_eq!(lock(&m, res, 1, Exclusive).0, GrantState::Granted);
        assert_eq!(lock(&m, res, 2, Shared).0, GrantState::Waiting);

        m.abandon_request(res, LockerId(2), LockMode::None);
        assert!(m.waiting_resource(LockerId(2)).is_none());
        assert_eq!(m.queue_len(res), 0);

        m.unlock(res, LockerId(1));
        m.cleanup_unused_locks();
        assert_eq!(m.resource_count(), 0);
    }

    #[test]
    fn test_abandon_unblocks_queue_behind_it() {
        let m = mgr();
        let res = ResourceId::collection("db.users");
        assert_eq!(lock(&m, res, 1, Shared).0, GrantState::Granted);
        assert_eq!(lock(&m, res, 2, Exclusive).0, GrantState::Waiting);
        let (state, notice3) = lock(&m, res, 3, Shared);
        assert_eq!(state, GrantState::Waiting);

        // Abandoning the X waiter lets the queued S through.
        m.abandon_request(res, LockerId(2), LockMode::None);
        assert!(notice3.wait_for(Duration::from_millis(100)));
    }

    #[test]
    fn test_abandon_conversion_reverts_mode() {
        let m = mgr();
        let res = ResourceId::collection("db.users");
        assert_eq!(lock(&m, res, 1, Shared).0, GrantState::Granted);
        assert_eq!(lock(&m, res, 2, Shared).0, GrantState::Granted);
        let notice = GrantNotice::new();
        assert_eq!(
            m.convert(res, LockerId(1), Exclusive, notice),
            GrantState::Waiting
        );

        m.abandon_request(res, LockerId(1), Shared);
        assert!(m.waiting_resource(LockerId(1)).is_none());
        let holders = m.granted_holders(res);
        assert!(holders.contains(&(LockerId(1), Shared)));
        assert!(holders.contains(&(LockerId(2), Shared)));
    }

    #[test]
    fn test_downgrade_grants_compatible_waiters() {
        let m = mgr();
        let res = ResourceId::GLOBAL;
        assert_eq!(lock(&m, res, 1, Exclusive).0, GrantState::Granted);
        let (state, notice) = lock(&m, res, 2, Shared);
        assert_eq!(state, GrantState::Waiting);

        m.downgrade(res, LockerId(1), Shared);
        assert!(notice.wait_for(Duration::from_millis(100)));
        let holders = m.granted_holders(res);
        assert!(holders.contains(&(LockerId(1), Shared)));
        assert!(holders.contains(&(LockerId(2), Shared)));
    }

    #[test]
    fn test_conflict_owners_reports_holders_and_queued_ahead() {
        let m = mgr();
        let res = ResourceId::collection("db.users");
        assert_eq!(lock(&m, res, 1, Shared).0, GrantState::Granted);
        assert_eq!(lock(&m, res, 2, Exclusive).0, GrantState::Waiting);
        assert_eq!(lock(&m, res, 3, Shared).0, GrantState::Waiting);

        let owners2 = m.conflict_owners(res, LockerId(2));
        assert_eq!(owners2, vec![LockerId(1)]);
        // 3 is not blocked by the granted holder, S is compatible with S;
        // it is blocked by the X queued ahead.
        let owners3 = m.conflict_owners(res, LockerId(3));
        assert_eq!(owners3, vec![LockerId(2)]);
    }

    #[test]
    fn test_cleanup_keeps_live_heads() {
        let m = mgr();
        let res = ResourceId::database("db");
        assert_eq!(lock(&m, res, 1, IntentShared).0, GrantState::Granted);
        assert_eq!(m.cleanup_unused_locks(), 0);
        assert_eq!(m.resource_count(), 1);
        m.unlock(res, LockerId(1));
        assert_eq!(m.cleanup_unused_locks(), 1);
        assert_eq!(m.resource_count(), 0);
    }
}
