//! src/service/mod.rs
//! The service-thread bridge: primitives usable identically from a UKern
//! fiber or a raw OS thread. [`ServiceEvent`] is the one that genuinely
//! needs both paths — if the calling thread is a fiber the wait routes
//! through the futex wait, otherwise it uses a host OS condvar, and signal
//! always does both; [`ServiceMutex`] is a thin wrapper over a host OS
//! mutex, since only events are ever waited on from both kinds of caller
//! in this runtime. [`ServiceThreadPool`] is the crossbeam-channel-dispatched
//! worker pool background work (decompression, cache eviction sweeps) runs
//! on.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::glue::result::Result as UResult;
use crate::l0::time::TimeSpan;
use crate::ukern::scheduler::{current_fiber, Scheduler};

/// A host-OS mutex reachable from service threads without going through
/// `ukern::Mutex`'s fiber-arbitration path —: "Service threads use
/// `ServiceMutex`/`ServiceEvent` which wrap OS primitives directly."
pub struct ServiceMutex<T> {
    inner: Mutex<T>,
}

impl<T> ServiceMutex<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, T> {
        self.inner.lock()
    }
}

/// Dual-path event: a fiber caller waits via the futex table on the
/// scheduler it belongs to; an OS-thread caller waits via a real
/// condition variable. `signal` always drives both .
pub struct ServiceEvent {
    scheduler: &'static Scheduler,
    futex_word: AtomicU32,
    os_signalled: Mutex<bool>,
    os_cv: Condvar,
    manual_reset: bool,
}

impl ServiceEvent {
    pub fn new(scheduler: &'static Scheduler, manual_reset: bool) -> Self {
        Self {
            scheduler,
            futex_word: AtomicU32::new(0),
            os_signalled: Mutex::new(false),
            os_cv: Condvar::new(),
            manual_reset,
        }
    }

    pub fn signal(&self) {
        self.futex_word.store(1, Ordering::Release);
        self.scheduler.wake(&self.futex_word, -1);
        *self.os_signalled.lock() = true;
        self.os_cv.notify_all();
    }

    /// Manual-reset events stay signalled until [`Self::reset`]; auto-reset
    /// events clear themselves for exactly one waiter per signal.
    pub fn reset(&self) {
        self.futex_word.store(0, Ordering::Release);
        *self.os_signalled.lock() = false;
    }

    pub async fn wait(&self, timeout: TimeSpan) -> UResult<()> {
        if current_fiber().is_some() {
            self.wait_as_fiber(timeout).await
        } else {
            self.wait_as_os_thread(timeout);
            Ok(())
        }
    }

    async fn wait_as_fiber(&self, timeout: TimeSpan) -> UResult<()> {
        loop {
            if self.futex_word.load(Ordering::Acquire) != 0 {
                if !self.manual_reset {
                    self.futex_word.store(0, Ordering::Release);
                }
                return Ok(());
            }
            self.scheduler.wait_on_address_equal(&self.futex_word, 0, timeout).await?;
        }
    }

    fn wait_as_os_thread(&self, timeout: TimeSpan) {
        let mut signalled = self.os_signalled.lock();
        if let Some(dur) = timeout.as_duration() {
            if !*signalled {
                self.os_cv.wait_for(&mut signalled, dur);
            }
        } else {
            while !*signalled {
                self.os_cv.wait(&mut signalled);
            }
        }
        if !self.manual_reset {
            *signalled = false;
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// A small pool of native OS threads dispatched via an unbounded
/// `crossbeam-channel`, used for work that must block on a real OS
/// primitive the UKern scheduler cannot observe (decompressor streaming,
/// the resource cache's eviction sweep), in the same channel-dispatch
/// shape as an `OffloadManager::worker_loop`.
pub struct ServiceThreadPool {
    sender: crossbeam_channel::Sender<Job>,
}

impl ServiceThreadPool {
    pub fn new(worker_count: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        for idx in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            std::thread::Builder::new()
                .name(format!("service-worker-{idx}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .expect("failed to spawn service worker thread");
        }
        Self { sender }
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Box::new(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn test_scheduler() -> &'static Scheduler {
        let sched = Box::leak(Box::new(Scheduler::new(0b1, 16, 0)));
        sched.ensure_started();
        sched
    }

    #[test]
    fn os_thread_wait_unblocks_on_signal() {
        let sched = test_scheduler();
        let event = Arc::new(ServiceEvent::new(sched, false));
        let e2 = Arc::clone(&event);
        let signalled = Arc::new(AtomicBool::new(false));
        let s2 = signalled.clone();
        let handle = std::thread::spawn(move || {
            e2.wait_as_os_thread(TimeSpan::FOREVER);
            s2.store(true, AtomicOrdering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        event.signal();
        handle.join().unwrap();
        assert!(signalled.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn service_thread_pool_runs_submitted_job() {
        let pool = ServiceThreadPool::new(2);
        let ran = Arc::new(AtomicBool::new(false));
        let r2 = ran.clone();
        pool.submit(move || r2.store(true, AtomicOrdering::SeqCst));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(ran.load(AtomicOrdering::SeqCst));
    }
}
