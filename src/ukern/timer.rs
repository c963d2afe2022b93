//! src/ukern/timer.rs
//! Absolute-deadline timeout delivery for `Sleep`/`WaitOnAddress`/`WaitKey`.
//! A single background thread holds a min-heap of `(deadline, id)` pairs
//! and fires callbacks as ticks elapse; this is the mechanism behind
//! "Timeout is expressed as an absolute tick deadline" .

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::l0::time::{Tick, TickSource, NO_TIMEOUT};

type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: u64,
    id: u64,
    callback: Mutex<Option<Callback>>,
}

struct Inner {
    heap: Mutex<BinaryHeap<Reverse<(u64, u64)>>>,
    entries: Mutex<std::collections::HashMap<u64, Arc<Entry>>>,
    cv: Condvar,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    tick_source: Arc<TickSource>,
}

/// A handle to a pending timer registration, allowing cancellation if the
/// waiter was woken by something other than the timeout (e.g. `Wake`
/// racing the deadline).
#[derive(Clone)]
pub struct TimerHandle {
    inner: Arc<Inner>,
    id: u64,
}

impl TimerHandle {
    /// Cancels the timer. Returns `true` if the callback had not yet fired.
    pub fn cancel(&self) -> bool {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.remove(&self.id) {
            let mut cb = entry.callback.lock();
            cb.take().is_some()
        } else {
            false
        }
    }
}

pub struct TimerService {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new(tick_source: Arc<TickSource>) -> Self {
        let inner = Arc::new(Inner {
            heap: Mutex::new(BinaryHeap::new()),
            entries: Mutex::new(std::collections::HashMap::new()),
            cv: Condvar::new(),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            tick_source,
        });
        let worker_inner = inner.clone();
        let thread = std::thread::Builder::new()
            .name("ukern-timer".into())
            .spawn(move || Self::run(worker_inner))
            .expect("failed to spawn ukern timer thread");
        Self {
            inner,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Registers `callback` to fire no earlier than `deadline` ticks.
    /// `deadline == NO_TIMEOUT` never fires (spec: "no-timeout" sentinel).
    pub fn register(&self, deadline: u64, callback: Callback) -> Option<TimerHandle> {
        if deadline == NO_TIMEOUT {
            return None;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            deadline,
            id,
            callback: Mutex::new(Some(callback)),
        });
        self.inner.entries.lock().insert(id, entry);
        self.inner.heap.lock().push(Reverse((deadline, id)));
        self.inner.cv.notify_one();
        Some(TimerHandle {
            inner: self.inner.clone(),
            id,
        })
    }

    fn run(inner: Arc<Inner>) {
        loop {
            if inner.shutdown.load(Ordering::Acquire) {
                return;
            }
            let mut heap = inner.heap.lock();
            let Some(&Reverse((deadline, id))) = heap.peek() else {
                // Nothing scheduled; wait to be notified of a new registration.
                inner.cv.wait_for(&mut heap, Duration::from_millis(100));
                continue;
            };
            let now = inner.tick_source.now().0;
            if deadline > now {
                let wait_ns = deadline - now;
                let wait = Duration::from_nanos(wait_ns.min(Duration::from_secs(1).as_nanos() as u64));
                inner.cv.wait_for(&mut heap, wait);
                continue;
            }
            heap.pop();
            drop(heap);
            let entry = inner.entries.lock().remove(&id);
            if let Some(entry) = entry {
                if let Some(cb) = entry.callback.lock().take() {
                    cb();
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cv.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Converts `(absolute_tick_or_no_timeout)` against `now` into a
/// `Option<Tick>` deadline suitable for [`TimerService::register`].
pub fn deadline_from_absolute(absolute: u64) -> Option<u64> {
    if absolute == NO_TIMEOUT {
        None
    } else {
        Some(absolute)
    }
}

pub type TickRef = Tick;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use std::time::Duration as StdDuration;

    #[test]
    fn timer_fires_after_deadline() {
        let ts = Arc::new(TickSource::new());
        let svc = TimerService::new(ts.clone());
        let fired = Arc::new(StdAtomicBool::new(false));
        let fired2 = fired.clone();
        let deadline = ts.now().0 + Duration::from_millis(20).as_nanos() as u64;
        svc.register(deadline, Box::new(move || fired2.store(true, Ordering::SeqCst)));
        std::thread::sleep(StdDuration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_before_fire_prevents_callback() {
        let ts = Arc::new(TickSource::new());
        let svc = TimerService::new(ts.clone());
        let fired = Arc::new(StdAtomicBool::new(false));
        let fired2 = fired.clone();
        let deadline = ts.now().0 + Duration::from_secs(5).as_nanos() as u64;
        let handle = svc.register(deadline, Box::new(move || fired2.store(true, Ordering::SeqCst))).unwrap();
        assert!(handle.cancel());
        std::thread::sleep(StdDuration::from_millis(50));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
