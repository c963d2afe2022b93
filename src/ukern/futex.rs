//! src/ukern/futex.rs
//! Wait/wake primitives keyed by user-space address, futex-style. The
//! "address" is a real Rust address — `&AtomicU32 as *const _ as usize` —
//! so [`crate::ukern::mutex::Mutex`] and
//! [`crate::ukern::condvar::ConditionVariable`] can key off their own word,
//! and arbitrary user code can call [`FutexTable::wait_if_equal`] directly
//! against any `AtomicU32` it owns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::Waker;

use parking_lot::Mutex;

use crate::ukern::fiber::{FiberId, Priority};

struct Waiter {
    fiber: FiberId,
    priority: Priority,
    waker: Waker,
}

#[derive(Default)]
struct Bucket {
    waiters: Vec<Waiter>,
}

/// Process-wide table of address -> waiter buckets. One instance lives on
/// the [`crate::ukern::scheduler::Scheduler`]; `Mutex`/`ConditionVariable`
/// borrow it rather than keeping their own.
#[derive(Default)]
pub struct FutexTable {
    buckets: Mutex<HashMap<usize, Bucket>>,
}

impl FutexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically checks `*addr == expected`, and if so registers `waker`
    /// on `addr`'s bucket. Returns `true` if the waiter was registered
    /// (caller should return `Poll::Pending`), `false` if the predicate
    /// failed (caller should fail with `InvalidWaitAddressValue`).
    ///
    /// The check-and-register happens while holding the bucket table lock,
    /// which is what makes this "atomic" in the futex sense: a concurrent
    /// `wake` cannot run between the check and the registration.
    pub fn wait_if_equal(
        &self,
        addr: &AtomicU32,
        expected: u32,
        fiber: FiberId,
        priority: Priority,
        waker: Waker,
    ) -> bool {
        let mut buckets = self.buckets.lock();
        if addr.load(Ordering::SeqCst) != expected {
            return false;
        }
        self.register_locked(&mut buckets, addr, fiber, priority, waker);
        true
    }

    /// As [`Self::wait_if_equal`] but for `*addr < expected`, optionally
    /// decrementing `*addr` first .
    pub fn wait_if_less_than(
        &self,
        addr: &AtomicU32,
        expected: u32,
        decrement: bool,
        fiber: FiberId,
        priority: Priority,
        waker: Waker,
    ) -> bool {
        let mut buckets = self.buckets.lock();
        if addr.load(Ordering::SeqCst) >= expected {
            return false;
        }
        if decrement {
            addr.fetch_sub(1, Ordering::SeqCst);
        }
        self.register_locked(&mut buckets, addr, fiber, priority, waker);
        true
    }

    fn register_locked(
        &self,
        buckets: &mut HashMap<usize, Bucket>,
        addr: &AtomicU32,
        fiber: FiberId,
        priority: Priority,
        waker: Waker,
    ) {
        let key = addr as *const _ as usize;
        buckets.entry(key).or_default().waiters.push(Waiter { fiber, priority, waker });
    }

    /// Registers without a predicate check — used by the condition
    /// variable, which has already atomically released its mutex by the
    /// time it enqueues .
    pub fn register(&self, addr_key: usize, fiber: FiberId, priority: Priority, waker: Waker) {
        let mut buckets = self.buckets.lock();
        buckets.entry(addr_key).or_default().waiters.push(Waiter { fiber, priority, waker });
    }

    pub fn key_of(addr: &AtomicU32) -> usize {
        addr as *const _ as usize
    }

    /// Removes a specific fiber's waiter from `addr`'s bucket (used when a
    /// timeout fires before a wake does). Returns true if it was present.
    pub fn cancel_wait(&self, addr_key: usize, fiber: FiberId) -> bool {
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(&addr_key) {
            let before = bucket.waiters.len();
            bucket.waiters.retain(|w| w.fiber != fiber);
            let removed = bucket.waiters.len() != before;
            if bucket.waiters.is_empty() {
                buckets.remove(&addr_key);
            }
            return removed;
        }
        false
    }

    /// Wakes up to `count` waiters (`count < 0` wakes all), highest
    /// priority first, FIFO within a priority — the discipline's
    /// Open Questions section asks implementers to pick consistently.
    /// Returns the number actually woken.
    pub fn wake(&self, addr_key: usize, count: i32) -> usize {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(&addr_key) else {
            return 0;
        };
        bucket.waiters.sort_by_key(|w| w.priority);
        let n = if count < 0 {
            bucket.waiters.len()
        } else {
            (count as usize).min(bucket.waiters.len())
        };
        let woken: Vec<Waiter> = bucket.waiters.drain(0..n).collect();
        if bucket.waiters.is_empty() {
            buckets.remove(&addr_key);
        }
        drop(buckets);
        let woken_count = woken.len();
        for w in woken {
            w.waker.wake();
        }
        woken_count
    }

    /// Pops the single highest-priority waiter (FIFO within priority) from
    /// `addr_key`'s bucket and wakes it, reporting whether other waiters are
    /// still queued behind it. Used by [`crate::ukern::mutex::Mutex`] to
    /// transfer ownership directly to the winner on unlock while leaving the
    /// waiters bit correct for whoever is still queued. `before_wake` runs
    /// with the winner's fiber and the "others remain" flag *before* the
    /// winner's waker fires, so the caller can publish the new owner word
    /// first and never race the winner's own re-poll against it. Returns
    /// `false` (without calling `before_wake`) if the bucket was empty.
    pub fn wake_one_for_ownership_transfer(&self, addr_key: usize, before_wake: impl FnOnce(FiberId, bool)) -> bool {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(&addr_key) else {
            return false;
        };
        bucket.waiters.sort_by_key(|w| w.priority);
        let winner = bucket.waiters.remove(0);
        let more_remain = !bucket.waiters.is_empty();
        if bucket.waiters.is_empty() {
            buckets.remove(&addr_key);
        }
        drop(buckets);
        before_wake(winner.fiber, more_remain);
        winner.waker.wake();
        true
    }

    /// `WakeIncrementIfEqual`: if `*addr == value`, increments it then
    /// wakes `count` waiters.
    pub fn wake_increment_if_equal(&self, addr: &AtomicU32, value: u32, count: i32) -> usize {
        if addr.compare_exchange(value, value.wrapping_add(1), Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return 0;
        }
        self.wake(Self::key_of(addr), count)
    }

    /// `WakeModifyByWaiterCount`: if `*addr == value`, sets `*addr` to the
    /// remaining-waiter count after waking `count` of them.
    pub fn wake_modify_by_waiter_count(&self, addr: &AtomicU32, value: u32, count: i32) -> usize {
        let mut buckets = self.buckets.lock();
        if addr.load(Ordering::SeqCst) != value {
            return 0;
        }
        let key = Self::key_of(addr);
        let Some(bucket) = buckets.get_mut(&key) else {
            addr.store(0, Ordering::SeqCst);
            return 0;
        };
        bucket.waiters.sort_by_key(|w| w.priority);
        let n = if count < 0 {
            bucket.waiters.len()
        } else {
            (count as usize).min(bucket.waiters.len())
        };
        let woken: Vec<Waiter> = bucket.waiters.drain(0..n).collect();
        let remaining = bucket.waiters.len() as u32;
        if bucket.waiters.is_empty() {
            buckets.remove(&key);
        }
        drop(buckets);
        addr.store(remaining, Ordering::SeqCst);
        let woken_count = woken.len();
        for w in woken {
            w.waker.wake();
        }
        woken_count
    }

    #[cfg(test)]
    pub fn waiter_count(&self, addr_key: usize) -> usize {
        self.buckets.lock().get(&addr_key).map(|b| b.waiters.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::task::{RawWaker, RawWakerVTable, Wake};

    struct NoopWake;
    impl Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    fn noop_waker() -> Waker {
        Waker::from(Arc::new(NoopWake))
    }

    #[test]
    fn wait_if_equal_fails_predicate_without_registering() {
        let table = FutexTable::new();
        let word = AtomicU32::new(5);
        let ok = table.wait_if_equal(&word, 9, FiberId::new(0, 0), 0, noop_waker());
        assert!(!ok);
        assert_eq!(table.waiter_count(FutexTable::key_of(&word)), 0);
    }

    #[test]
    fn wake_respects_priority_order() {
        let table = FutexTable::new();
        let word = AtomicU32::new(1);
        table.wait_if_equal(&word, 1, FiberId::new(1, 0), 50, noop_waker());
        table.wait_if_equal(&word, 1, FiberId::new(2, 0), 5, noop_waker());
        let key = FutexTable::key_of(&word);
        assert_eq!(table.waiter_count(key), 2);
        let woken = table.wake(key, 1);
        assert_eq!(woken, 1);
        assert_eq!(table.waiter_count(key), 1);
    }

    #[test]
    fn wake_increment_if_equal_requires_match() {
        let table = FutexTable::new();
        let word = AtomicU32::new(0);
        assert_eq!(table.wake_increment_if_equal(&word, 1, -1), 0);
        assert_eq!(word.load(Ordering::SeqCst), 0);
        assert_eq!(table.wake_increment_if_equal(&word, 0, -1), 0);
        assert_eq!(word.load(Ordering::SeqCst), 1);
    }
}
