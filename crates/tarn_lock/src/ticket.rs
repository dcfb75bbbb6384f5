//! Ticketed admission control in front of the Global lock.
//!
//! Two fixed-size pools bound how many operations may be active inside the
//! engine at once: one for shared-family global requests (IS/S), one for
//! intent-exclusive ones (IX). Exclusive global requests bypass ticketing
//! entirely so instance-wide maintenance cannot be starved by admission.
//!
//! A ticket is taken before the Global lock request is made and returned
//! when the Global lock is fully released, or temporarily around long
//! blocking waits via the session's release/reacquire pair.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use tarn_common::shutdown::InterruptFlag;
use tarn_common::types::{LockMode, ResourceId};
use tarn_common::{LockError, TarnResult};

/// A single counting pool. Waits are sliced so external interruption and
/// deadline expiry are noticed promptly.
struct TicketHolder {
    capacity: u32,
    available: Mutex<u32>,
    cond: Condvar,
}

/// Result of one admission attempt, mapped to `LockError` by the pool since
/// only the pool knows the originating mode.
enum AdmitOutcome {
    Admitted,
    Timeout,
    Interrupted,
}

impl TicketHolder {
    fn new(capacity: u32) -> TicketHolder {
        TicketHolder {
            capacity,
            available: Mutex::new(capacity),
            cond: Condvar::new(),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut available = self.available.lock();
        if *available > 0 {
            *available -= 1;
            true
        } else {
            false
        }
    }

    fn acquire(
        &self,
        deadline: Option<Instant>,
        poll: Duration,
        interrupt: Option<&InterruptFlag>,
    ) -> AdmitOutcome {
        let mut available = self.available.lock();
        loop {
            if *available > 0 {
                *available -= 1;
                return AdmitOutcome::Admitted;
            }
            if let Some(flag) = interrupt {
                if flag.is_interrupted() {
                    return AdmitOutcome::Interrupted;
                }
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return AdmitOutcome::Timeout;
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };
            self.cond.wait_for(&mut available, slice);
        }
    }

    fn release(&self) {
        let mut available = self.available.lock();
        debug_assert!(*available < self.capacity, "ticket released twice");
        *available += 1;
        self.cond.notify_one();
    }

    fn available(&self) -> u32 {
        *self.available.lock()
    }
}

/// Admission gate consulted by every Global lock acquisition.
pub struct TicketPool {
    reading: TicketHolder,
    writing: TicketHolder,
    poll: Duration,
}

impl TicketPool {
    pub fn new(read_tickets: u32, write_tickets: u32, poll: Duration) -> TicketPool {
        TicketPool {
            reading: TicketHolder::new(read_tickets),
            writing: TicketHolder::new(write_tickets),
            poll,
        }
    }

    fn holder_for(&self, mode: LockMode) -> Option<&TicketHolder> {
        match mode {
            LockMode::IntentShared | LockMode::Shared => Some(&self.reading),
            LockMode::IntentExclusive => Some(&self.writing),
            LockMode::Exclusive | LockMode::None => None,
        }
    }

    /// Block until a ticket for `mode` is available, the deadline passes, or
    /// the operation is interrupted. Returns whether a ticket was actually
    /// taken (false for modes that bypass admission); the caller must hand
    /// that flag back to [`TicketPool::release`] symmetry via the same mode.
    pub fn acquire(
        &self,
        mode: LockMode,
        deadline: Option<Instant>,
        interrupt: Option<&InterruptFlag>,
    ) -> TarnResult<bool> {
        let holder = match self.holder_for(mode) {
            Some(holder) => holder,
            None => return Ok(false),
        };
        match holder.acquire(deadline, self.poll, interrupt) {
            AdmitOutcome::Admitted => Ok(true),
            AdmitOutcome::Timeout => Err(LockError::Timeout {
                resource: ResourceId::GLOBAL,
                mode,
            }),
            AdmitOutcome::Interrupted => Err(LockError::Interrupted {
                resource: ResourceId::GLOBAL,
                mode,
            }),
        }
    }

    /// Non-blocking variant; `Ok(false)` means the mode needs no ticket.
    pub fn try_acquire(&self, mode: LockMode) -> Option<bool> {
        match self.holder_for(mode) {
            Some(holder) => {
                if holder.try_acquire() {
                    Some(true)
                } else {
                    None
                }
            }
            None => Some(false),
        }
    }

    /// Return the ticket taken for `mode`. No-op for bypassing modes.
    pub fn release(&self, mode: LockMode) {
        if let Some(holder) = self.holder_for(mode) {
            holder.release();
        }
    }

    /// Tickets currently available for `mode`; `None` for bypassing modes.
    pub fn available(&self, mode: LockMode) -> Option<u32> {
        self.holder_for(mode).map(TicketHolder::available)
    }

    pub fn capacity(&self, mode: LockMode) -> Option<u32> {
        self.holder_for(mode).map(|holder| holder.capacity)
    }

    pub fn reads_available(&self) -> u32 {
        self.reading.available()
    }

    pub fn writes_available(&self) -> u32 {
        self.writing.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn pool(read: u32, write: u32) -> TicketPool {
        TicketPool::new(read, write, Duration::from_millis(10))
    }

    #[test]
    fn test_pools_are_independent() {
        let pool = pool(2, 1);
        assert_eq!(pool.acquire(LockMode::IntentShared, None, None), Ok(true));
        assert_eq!(pool.acquire(LockMode::Shared, None, None), Ok(true));
        assert_eq!(pool.acquire(LockMode::IntentExclusive, None, None), Ok(true));
        assert_eq!(pool.reads_available(), 0);
        assert_eq!(pool.writes_available(), 0);

        pool.release(LockMode::Shared);
        assert_eq!(pool.reads_available(), 1);
        assert_eq!(pool.writes_available(), 0);
    }

    #[test]
    fn test_exclusive_bypasses_admission() {
        let pool = pool(0, 0);
        assert_eq!(pool.acquire(LockMode::Exclusive, None, None), Ok(false));
        pool.release(LockMode::Exclusive);
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let pool = pool(2, 1);
        assert_eq!(pool.acquire(LockMode::IntentExclusive, None, None), Ok(true));
        let deadline = Instant::now() + Duration::from_millis(30);
        let err = pool
            .acquire(LockMode::IntentExclusive, Some(deadline), None)
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_release_wakes_blocked_acquirer() {
        let pool = Arc::new(pool(2, 1));
        assert_eq!(pool.acquire(LockMode::IntentExclusive, None, None), Ok(true));

        let p = pool.clone();
        let handle = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            p.acquire(LockMode::IntentExclusive, Some(deadline), None)
        });
        thread::sleep(Duration::from_millis(20));
        pool.release(LockMode::IntentExclusive);
        assert_eq!(handle.join().unwrap(), Ok(true));
    }

    #[test]
    fn test_interrupt_fails_blocked_acquirer() {
        let pool = Arc::new(pool(2, 1));
        assert_eq!(pool.acquire(LockMode::IntentExclusive, None, None), Ok(true));

        let flag = InterruptFlag::new();
        let p = pool.clone();
        let f = flag.clone();
        let handle = thread::spawn(move || p.acquire(LockMode::IntentExclusive, None, Some(&f)));
        thread::sleep(Duration::from_millis(20));
        flag.interrupt();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, LockError::Interrupted { .. }));
    }

    #[test]
    fn test_try_acquire() {
        let pool = pool(1, 1);
        assert_eq!(pool.try_acquire(LockMode::Shared), Some(true));
        assert_eq!(pool.try_acquire(LockMode::IntentShared), None);
        assert_eq!(pool.try_acquire(LockMode::Exclusive), Some(false));
    }
}
