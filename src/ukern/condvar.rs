//! src/ukern/condvar.rs
//! Condition variable `WaitKey`/`SignalKey` . The word is
//! treated as a monotonically incrementing generation counter rather than
//! a raw opaque value — a standard futex-condvar construction that closes
//! the lost-wakeup window between releasing the mutex and registering the
//! wait: `SignalKey` bumps the generation, so if a signal lands between our
//! generation read and our registration, the registration's predicate
//! check (`word == observed_generation`) fails and we treat that as
//! "already signaled" rather than hanging.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::ukern::fiber::{FiberId, WaitResult};
use crate::ukern::futex::FutexTable;
use crate::ukern::mutex::{Mutex, MutexGuard};
use crate::ukern::scheduler::{current_fiber, Scheduler};
use crate::ukern::suspend::WaitOnAddressFuture;

pub struct ConditionVariable {
    word: AtomicU32,
    scheduler: &'static Scheduler,
}

impl ConditionVariable {
    pub fn new(scheduler: &'static Scheduler) -> Self {
        Self {
            word: AtomicU32::new(0),
            scheduler,
        }
    }

    /// `WaitKey(lock, cv, my_handle, timeout)`: atomically releases
    /// `guard`'s mutex and enqueues on the cv's wait bucket, then
    /// reacquires the mutex before returning — the caller never observes
    /// the mutex unlocked .
    pub async fn wait_key<'a>(
        &self,
        guard: MutexGuard<'a>,
        mutex: &'a Mutex,
        timeout: crate::l0::time::TimeSpan,
    ) -> MutexGuard<'a> {
        let me = current_fiber().unwrap_or(FiberId::INVALID);
        let priority = self.scheduler.priority_of(me);
        let seq = self.word.load(Ordering::Acquire);
        // Release the mutex (runs ArbitrateUnlock if contended) before we
        // suspend — this ordering is what makes WaitKey atomic: a signaler
        // cannot observe us "still holding the lock but not yet waiting".
        drop(guard);

        let deadline = {
            let abs = crate::l0::time::get_absolute_time_to_wakeup(self.scheduler.tick_source(), timeout.0);
            if abs == crate::l0::time::NO_TIMEOUT {
                None
            } else {
                Some(abs)
            }
        };
        let wait = WaitOnAddressFuture::equal(self.scheduler, me, priority, &self.word, seq, deadline);
        // A generation mismatch here means we were already signaled between
        // reading `seq` and registering — not an error, just "proceed".
        let _ = wait.await;
        mutex.lock().await
    }

    /// `SignalKey(cv, count)`: bumps the generation and wakes up to
    /// `count` waiters (spec: `Signal(count)` maps to `SignalKeyImpl`,
    /// `Broadcast` to `count = -1`).
    pub fn signal(&self, count: i32) -> usize {
        self.word.fetch_add(1, Ordering::AcqRel);
        self.scheduler.futex().wake(FutexTable::key_of(&self.word), count)
    }

    pub fn signal_one(&self) -> usize {
        self.signal(1)
    }

    pub fn broadcast(&self) -> usize {
        self.signal(-1)
    }
}

pub fn wait_result_from(_r: WaitResult) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn test_scheduler() -> &'static Scheduler {
        let sched = Box::leak(Box::new(Scheduler::new(0b11, 64, 0)));
        sched.ensure_started();
        sched
    }

    #[test]
    fn signal_wakes_a_waiting_fiber() {
        let sched = test_scheduler();
        let mutex = Arc::new(Mutex::new(sched));
        let cv = Arc::new(ConditionVariable::new(sched));
        let woke = Arc::new(AtomicBool::new(false));

        let m1 = mutex.clone();
        let cv1 = cv.clone();
        let woke1 = woke.clone();
        let waiter = sched
            .create_fiber("waiter", 10, u64::MAX, async move {
                let guard = m1.lock().await;
                let _guard = cv1.wait_key(guard, &m1, crate::l0::time::TimeSpan::from_milliseconds(2000)).await;
                woke1.store(true, Ordering::SeqCst);
            })
            .unwrap();
        sched.start_fiber(waiter);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!woke.load(Ordering::SeqCst));

        let m2 = mutex.clone();
        let cv2 = cv.clone();
        let signaler = sched
            .create_fiber("signaler", 10, u64::MAX, async move {
                let _g = m2.lock().await;
                drop(_g);
                cv2.signal_one();
            })
            .unwrap();
        sched.start_fiber(signaler);

        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(woke.load(Ordering::SeqCst));
    }
}
