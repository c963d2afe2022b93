//! src/ukern/fiber.rs
//! Fiber attributes and lifecycle state . A fiber's user
//! code is modeled as a boxed `Future` rather than a hand-switched stack:
//! Rust's `Future::poll` already gives exactly the "suspend only at
//! well-defined points, resume later with the same local state" contract
//! describes, without unsafe stack-switching machinery. Every
//! suspension point named in (`Sleep`, `WaitOnAddress`,
//! `ArbitrateLock`, `WaitKey`) is an `async fn` that returns `Poll::Pending`
//! exactly once per real suspension and registers its own wakeup.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::l0::index_alloc::Handle;

pub type FiberId = Handle;

/// Lower number runs first (: "priority (lower number = higher
/// priority)").
pub type Priority = u32;

pub const DEFAULT_PRIORITY: Priority = 16;
pub const PRIORITY_LEVELS: usize = 64;

#[inline]
pub fn priority_bucket(p: Priority) -> usize {
    (p as usize).min(PRIORITY_LEVELS - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityLevel {
    Suspended,
    Schedulable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Unscheduled,
    Scheduled,
    ScheduledLocal,
    Running,
    Exiting,
    Waiting,
    Suspended,
}

/// Result of the fiber's last wait operation, observable via
/// [`FiberControlBlock::last_wait_result`] .
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Success,
    Timeout,
    InvalidWaitAddressValue,
}

/// A fixed-size TLS slot array, indexed positionally . Slots are type-erased; callers agree out-of-band on which
/// index holds what (the current-thread-heap slot is index 0, see
/// `crate::mem::current_heap`).
pub const TLS_SLOT_COUNT: usize = 8;

pub struct FiberControlBlock {
    pub name: String,
    pub base_priority: Priority,
    /// Effective priority, raised by [`crate::ukern::mutex::Mutex`]'s
    /// priority-inheritance path while a higher-priority fiber waits on a
    /// lock this fiber owns; restored to `base_priority` on release.
    pub effective_priority: AtomicU32,
    pub allowed_core_mask: u64,
    pub current_core: AtomicU32,
    pub activity: Mutex<ActivityLevel>,
    pub state: Mutex<FiberState>,
    pub last_wait_result: Mutex<WaitResult>,
    pub tls: Mutex<[Option<Box<dyn std::any::Any + Send>>; TLS_SLOT_COUNT]>,
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
}

impl fmt::Debug for FiberControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberControlBlock")
            .field("name", &self.name)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority.load(Ordering::Relaxed))
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl FiberControlBlock {
    pub fn new(
        name: impl Into<String>,
        priority: Priority,
        allowed_core_mask: u64,
        entry: impl Future<Output = ()> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            base_priority: priority,
            effective_priority: AtomicU32::new(priority),
            allowed_core_mask,
            current_core: AtomicU32::new(u32::MAX),
            activity: Mutex::new(ActivityLevel::Suspended),
            state: Mutex::new(FiberState::Unscheduled),
            last_wait_result: Mutex::new(WaitResult::Success),
            tls: Mutex::new(Default::default()),
            future: Mutex::new(Some(Box::pin(entry))),
        }
    }

    #[inline]
    pub fn effective_priority(&self) -> Priority {
        self.effective_priority.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_effective_priority(&self, p: Priority) {
        self.effective_priority.store(p, Ordering::Release);
    }

    /// Raises effective priority to `min(current, candidate)` — spec
    /// §4.1's priority-inheritance rule applied per-waiter. Never lowers.
    pub fn inherit_priority_at_least(&self, candidate: Priority) {
        loop {
            let current = self.effective_priority.load(Ordering::Acquire);
            let next = current.min(candidate);
            if next == current {
                return;
            }
            if self
                .effective_priority
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn restore_base_priority(&self) {
        self.effective_priority.store(self.base_priority, Ordering::Release);
    }

    pub fn can_run_on_core(&self, core: u32) -> bool {
        core < 64 && (self.allowed_core_mask & (1u64 << core)) != 0
    }

    /// Takes the boxed future out for polling. The caller (the scheduler's
    /// dispatch loop) must put it back with [`Self::restore_future`] unless
    /// the future completed.
    pub(crate) fn take_future(&self) -> Option<Pin<Box<dyn Future<Output = ()> + Send>>> {
        self.future.lock().take()
    }

    pub(crate) fn restore_future(&self, f: Pin<Box<dyn Future<Output = ()> + Send>>) {
        *self.future.lock() = Some(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_inheritance_only_raises() {
        let fcb = FiberControlBlock::new("t", 50, u64::MAX, async {});
        fcb.inherit_priority_at_least(10);
        assert_eq!(fcb.effective_priority(), 10);
        fcb.inherit_priority_at_least(30);
        assert_eq!(fcb.effective_priority(), 10, "must not raise priority number back up");
        fcb.restore_base_priority();
        assert_eq!(fcb.effective_priority(), 50);
    }

    #[test]
    fn core_mask_respected() {
        let fcb = FiberControlBlock::new("t", 0, 0b0101, async {});
        assert!(fcb.can_run_on_core(0));
        assert!(!fcb.can_run_on_core(1));
        assert!(fcb.can_run_on_core(2));
    }
}
