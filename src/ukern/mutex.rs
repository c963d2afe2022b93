//! src/ukern/mutex.rs
//! The arbitration lock (/§4.1 "Mutex (arbitration handle)"): a
//! single 32-bit atomic word holding the owner's fiber handle with the top
//! bit as the "has waiters" flag, plus priority inheritance while
//! contended.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};

use crate::glue::result::{result_abort_unless, Code, Module, ResultCode};
use crate::ukern::fiber::{priority_bucket, FiberId};
use crate::ukern::futex::FutexTable;
use crate::ukern::scheduler::{current_fiber, Scheduler};

const WAITERS_BIT: u32 = 0x8000_0000;
const OWNER_MASK: u32 = 0x7FFF_FFFF;

///: "word == 0 iff unlocked; word's low bits == owner-handle iff
/// locked; the has-waiters bit is set only while at least one fiber is
/// blocked on this word."
pub struct Mutex {
    word: AtomicU32,
    scheduler: &'static Scheduler,
}

impl Mutex {
    pub fn new(scheduler: &'static Scheduler) -> Self {
        Self {
            word: AtomicU32::new(0),
            scheduler,
        }
    }

    fn owner_raw(&self) -> u32 {
        self.word.load(Ordering::Acquire) & OWNER_MASK
    }

    pub fn is_locked(&self) -> bool {
        self.owner_raw() != 0
    }

    /// `Enter()` ( "Arbitration lock (mutex)"). Fast path is a
    /// single CAS; the slow path sets the waiters bit and suspends via the
    /// futex table keyed on this mutex's own word address, applying
    /// priority inheritance to the current owner for the wait's duration.
    pub async fn lock(&self) -> MutexGuard<'_> {
        let me = current_fiber().unwrap_or(FiberId::INVALID);
        let me_raw = me.raw() & OWNER_MASK;
        loop {
            if self
                .word
                .compare_exchange(0, me_raw, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return MutexGuard { mutex: self };
            }
            // Contended: mark waiters bit, then atomically verify the word
            // still looks contended before registering — this closes the
            // lost-wakeup window between the failed CAS and registration.
            let before = self.word.load(Ordering::Acquire);
            if before == 0 {
                continue; // owner released between our CAS and the read; retry fast path
            }
            let with_waiters = before | WAITERS_BIT;
            if self
                .word
                .compare_exchange(before, with_waiters, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let owner_handle = before & OWNER_MASK;
            if let Some(owner_fcb) = self.scheduler.fcb_of(FiberId::from_raw(owner_handle)) {
                let my_priority = self.scheduler.priority_of(me);
                owner_fcb.inherit_priority_at_least(my_priority);
            }
            let priority = self.scheduler.priority_of(me);
            let wait = ArbitrateLockFuture {
                scheduler: self.scheduler,
                word: &self.word,
                me,
                priority,
                registered: false,
            };
            wait.await;
            // `arbitrate_unlock` may have transferred ownership to us
            // directly (writing our handle into the word itself) rather
            // than clearing it to 0 for a fresh race; recognize that case
            // so we don't fall through to a CAS(0, me_raw) that would
            // never observe our own handle as "unlocked".
            let after_wake = self.word.load(Ordering::Acquire);
            if (after_wake & OWNER_MASK) == me_raw {
                return MutexGuard { mutex: self };
            }
            // Otherwise the word was cleared (no waiters survived the
            // transfer) or another fiber already raced ahead of us; retry
            // the fast path.
        }
    }

    /// `Leave()`. Releasing a mutex not owned by the caller is an
    /// invariant violation .
    fn unlock_from(&self, me_raw: u32) {
        let current = self.word.load(Ordering::Acquire);
        result_abort_unless!(
            (current & OWNER_MASK) == me_raw,
            ResultCode::new(Module::Ukern, Code::InvalidHandle)
        );
        if self
            .word
            .compare_exchange(me_raw, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return; // uncontended fast path
        }
        self.arbitrate_unlock();
    }

    /// Picks the next waiter (highest priority, FIFO within priority),
    /// transfers ownership directly to it in the word, and wakes it — so
    /// the waiter resumes already owning the lock rather than re-racing the
    /// CAS . If other waiters remain queued behind the
    /// winner, the waiters bit is re-asserted on the new owner's word so a
    /// later `unlock_from` doesn't fast-path past them and strand their
    /// futex registrations forever.
    fn arbitrate_unlock(&self) {
        let key = FutexTable::key_of(&self.word);
        let word = &self.word;
        let transferred = self.scheduler.futex().wake_one_for_ownership_transfer(key, |next_owner, more_remain| {
            let owner_raw = next_owner.raw() & OWNER_MASK;
            let new_word = if more_remain { owner_raw | WAITERS_BIT } else { owner_raw };
            word.store(new_word, Ordering::Release);
        });
        if !transferred {
            self.word.store(0, Ordering::Release);
        }
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl<'a> Drop for MutexGuard<'a> {
    fn drop(&mut self) {
        let me = current_fiber().unwrap_or(FiberId::INVALID);
        let me_raw = me.raw() & OWNER_MASK;
        self.mutex.unlock_from(me_raw);
        if let Some(fcb) = self.mutex.scheduler.fcb_of(me) {
            fcb.restore_base_priority();
        }
    }
}

struct ArbitrateLockFuture<'a> {
    scheduler: &'static Scheduler,
    word: &'a AtomicU32,
    me: FiberId,
    priority: crate::ukern::fiber::Priority,
    registered: bool,
}

impl<'a> Future for ArbitrateLockFuture<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.registered {
            return Poll::Ready(());
        }
        this.registered = true;
        let current = this.word.load(Ordering::Acquire);
        if (current & OWNER_MASK) == 0 {
            // Lock freed already; let the caller's CAS loop retry.
            return Poll::Ready(());
        }
        // No timeout/outcome bookkeeping needed here: the only thing that
        // re-polls this future is our own executor calling `wake()` after
        // `ArbitrateUnlock`, so a second poll unconditionally means "retry
        // the CAS loop now".
        let registered =
            this.scheduler
                .futex()
                .wait_if_equal(this.word, current, this.me, this.priority, cx.waker().clone());
        if !registered {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn test_scheduler() -> &'static Scheduler {
        let sched = Box::leak(Box::new(Scheduler::new(0b11, 64, 0)));
        sched.ensure_started();
        sched
    }

    #[test]
    fn uncontended_lock_unlock_round_trips() {
        let sched = test_scheduler();
        let mutex = Arc::new(Mutex::new(sched));
        let counter = Arc::new(AtomicUsize::new(0));
        let m2 = mutex.clone();
        let c2 = counter.clone();
        let id = sched
            .create_fiber("locker", 10, u64::MAX, async move {
                let _guard = m2.lock().await;
                c2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        sched.start_fiber(id);
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!mutex.is_locked());
    }

    /// Regression test: with 3+ fibers blocked on the same mutex,
    /// `arbitrate_unlock` must re-assert the waiters bit on transfer so the
    /// second and later waiters aren't stranded in the futex table after
    /// the first waiter's `unlock_from` takes the now-bare fast path.
    #[test]
    fn contended_lock_wakes_every_waiter_in_turn() {
        let sched = test_scheduler();
        let mutex = Arc::new(Mutex::new(sched));
        let counter = Arc::new(AtomicUsize::new(0));

        // Hold the mutex first so every fiber below contends.
        let holder_guard_released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let m_holder = mutex.clone();
        let released = holder_guard_released.clone();
        let holder = sched
            .create_fiber("holder", 10, u64::MAX, async move {
                let guard = m_holder.lock().await;
                while !released.load(Ordering::SeqCst) {
                    sched.yield_now().await;
                }
                drop(guard);
            })
            .unwrap();
        sched.start_fiber(holder);
        std::thread::sleep(std::time::Duration::from_millis(20));

        for i in 0..5 {
            let m = mutex.clone();
            let c = counter.clone();
            let id = sched
                .create_fiber(format!("waiter-{i}"), 10, u64::MAX, async move {
                    let _guard = m.lock().await;
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            sched.start_fiber(id);
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        holder_guard_released.store(true, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(300));

        assert_eq!(counter.load(Ordering::SeqCst), 5, "every waiter must eventually acquire the mutex, not just the first");
        assert!(!mutex.is_locked());
    }
}
