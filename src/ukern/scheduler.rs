//! src/ukern/scheduler.rs
//! The UKern scheduler: one host worker thread per selected
//! core, a fixed-capacity handle table, and priority-ordered dispatch with
//! no preemption. Fibers are `Future`s; the worker thread's dispatch loop
//! is a minimal hand-rolled executor — `poll` only returns control at the
//! fixed set of suspension points (`Sleep`, `WaitOnAddress`, `ArbitrateLock`,
//! `WaitKey`, exit), so this is cooperative in exactly the intended sense
//! even though the mechanism (a boxed `Future` instead of a raw stack swap)
//! is idiomatic-Rust rather than hand-switched assembly.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Poll, Wake, Waker};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::l0::index_alloc::HandleTable;
use crate::l0::time::{Tick, TickSource, NO_TIMEOUT};
use crate::ukern::fiber::{priority_bucket, FiberControlBlock, FiberId, FiberState, Priority, WaitResult, PRIORITY_LEVELS};
use crate::ukern::futex::FutexTable;
use crate::ukern::suspend::{SleepFuture, WaitOnAddressFuture};
use crate::ukern::timer::TimerService;

thread_local! {
    static CURRENT_FIBER: std::cell::Cell<Option<FiberId>> = std::cell::Cell::new(None);
}

/// Returns the fiber id currently executing on this worker thread, if any.
/// `None` when called from a non-fiber context (e.g. a service thread).
pub fn current_fiber() -> Option<FiberId> {
    CURRENT_FIBER.with(|c| c.get())
}

struct FiberWaker {
    scheduler: &'static Scheduler,
    fiber: FiberId,
}

impl Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        self.scheduler.wake_fiber(self.fiber);
    }
    fn wake_by_ref(self: &Arc<Self>) {
        self.scheduler.wake_fiber(self.fiber);
    }
}

pub struct Scheduler {
    handles: Mutex<HandleTable<Arc<FiberControlBlock>>>,
    run_queue: Mutex<[VecDeque<FiberId>; PRIORITY_LEVELS]>,
    idle_cv: Condvar,
    futex: FutexTable,
    timer: TimerService,
    tick_source: Arc<TickSource>,
    core_mask: u64,
    core_count: u32,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shutdown: AtomicBool,
}

impl Scheduler {
    pub fn new(core_mask: u64, max_fibers: usize, _default_stack_size: usize) -> Self {
        let core_mask = if core_mask == 0 { 1 } else { core_mask };
        let core_count = core_mask.count_ones();
        let tick_source = Arc::new(TickSource::new());
        Self {
            handles: Mutex::new(HandleTable::with_capacity(max_fibers.max(1))),
            run_queue: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            idle_cv: Condvar::new(),
            futex: FutexTable::new(),
            timer: TimerService::new(tick_source.clone()),
            tick_source,
            core_mask,
            core_count,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn futex(&'static self) -> &'static FutexTable {
        &self.futex
    }

    pub fn timers(&'static self) -> &'static TimerService {
        &self.timer
    }

    pub fn tick_source(&self) -> &TickSource {
        &self.tick_source
    }

    pub fn core_count(&self) -> u32 {
        self.core_count
    }

    /// Spawns one worker thread per bit set in `core_mask`. Idempotent —
    /// safe to call from multiple init paths.
    pub fn ensure_started(&'static self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.workers.lock();
        for core in 0..64u32 {
            if self.core_mask & (1u64 << core) == 0 {
                continue;
            }
            let handle = std::thread::Builder::new()
                .name(format!("ukern-core-{core}"))
                .spawn(move || Self::worker_loop(self, core))
                .expect("failed to spawn ukern worker thread");
            workers.push(handle);
        }
        debug!(cores = workers.len(), "ukern scheduler started");
    }

    pub fn shutdown(&'static self) {
        self.shutdown.store(true, Ordering::Release);
        self.idle_cv.notify_all();
        let mut workers = self.workers.lock();
        for w in workers.drain(..) {
            let _ = w.join();
        }
    }

    /// `Create`: allocates a fiber record but does not schedule
    /// it. Returns `None` if the handle table is exhausted — UKern never
    /// grows this table at runtime.
    pub fn create_fiber(
        &'static self,
        name: impl Into<String>,
        priority: Priority,
        allowed_core_mask: u64,
        entry: impl Future<Output = ()> + Send + 'static,
    ) -> Option<FiberId> {
        let fcb = Arc::new(FiberControlBlock::new(name, priority, allowed_core_mask, entry));
        self.handles.lock().allocate(fcb)
    }

    /// `Start`: Unscheduled -> Scheduled, links into the run
    /// queue at the fiber's priority.
    pub fn start_fiber(&'static self, id: FiberId) -> bool {
        let handles = self.handles.lock();
        let Some(fcb) = handles.get(id) else { return false };
        {
            let mut state = fcb.state.lock();
            if *state != FiberState::Unscheduled {
                return false;
            }
            *state = FiberState::Scheduled;
            *fcb.activity.lock() = crate::ukern::fiber::ActivityLevel::Schedulable;
        }
        let prio = priority_bucket(fcb.effective_priority());
        drop(handles);
        self.run_queue.lock()[prio].push_back(id);
        self.idle_cv.notify_all();
        true
    }

    pub fn name_of(&self, id: FiberId) -> Option<String> {
        self.handles.lock().get(id).map(|f| f.name.clone())
    }

    pub fn state_of(&self, id: FiberId) -> Option<FiberState> {
        self.handles.lock().get(id).map(|f| *f.state.lock())
    }

    /// Wakes a fiber that is currently `Waiting`, moving it back onto its
    /// priority's run queue .
    pub fn wake_fiber(&'static self, id: FiberId) {
        let fcb = {
            let handles = self.handles.lock();
            handles.get(id).cloned()
        };
        let Some(fcb) = fcb else { return };
        let should_enqueue = {
            let mut state = fcb.state.lock();
            if *state == FiberState::Waiting {
                *state = FiberState::Scheduled;
                true
            } else {
                false
            }
        };
        if should_enqueue {
            let prio = priority_bucket(fcb.effective_priority());
            self.run_queue.lock()[prio].push_back(id);
            self.idle_cv.notify_all();
        }
    }

    /// `SuspendThread`/`Resume`: explicit suspend bypasses the
    /// wait table entirely — only an explicit `resume_fiber` call (not a
    /// futex wake) reschedules it.
    pub fn suspend_self(&'static self) {
        if let Some(id) = current_fiber() {
            let handles = self.handles.lock();
            if let Some(fcb) = handles.get(id) {
                *fcb.state.lock() = FiberState::Suspended;
                *fcb.activity.lock() = crate::ukern::fiber::ActivityLevel::Suspended;
            }
        }
    }

    pub fn resume_fiber(&'static self, id: FiberId) -> bool {
        let fcb = {
            let handles = self.handles.lock();
            handles.get(id).cloned()
        };
        let Some(fcb) = fcb else { return false };
        let was_suspended = {
            let mut state = fcb.state.lock();
            if *state == FiberState::Suspended {
                *state = FiberState::Scheduled;
                true
            } else {
                false
            }
        };
        if was_suspended {
            *fcb.activity.lock() = crate::ukern::fiber::ActivityLevel::Schedulable;
            let prio = priority_bucket(fcb.effective_priority());
            self.run_queue.lock()[prio].push_back(id);
            self.idle_cv.notify_all();
        }
        was_suspended
    }

    fn acquire_next_runnable(&'static self, core: u32) -> Option<FiberId> {
        let handles = self.handles.lock();
        let mut rq = self.run_queue.lock();
        for level in rq.iter_mut() {
            if let Some(pos) = level
                .iter()
                .position(|id| handles.get(*id).map(|f| f.can_run_on_core(core)).unwrap_or(false))
            {
                let id = level.remove(pos).unwrap();
                if let Some(fcb) = handles.get(id) {
                    *fcb.state.lock() = FiberState::Running;
                    fcb.current_core.store(core, Ordering::Release);
                }
                return Some(id);
            }
        }
        None
    }

    fn worker_loop(&'static self, core: u32) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            match self.acquire_next_runnable(core) {
                Some(id) => self.run_fiber_once(id, core),
                None => {
                    let mut rq = self.run_queue.lock();
                    self.idle_cv.wait_for(&mut rq, Duration::from_millis(25));
                }
            }
        }
    }

    fn run_fiber_once(&'static self, id: FiberId, core: u32) {
        let fcb = {
            let handles = self.handles.lock();
            handles.get(id).cloned()
        };
        let Some(fcb) = fcb else { return };
        let Some(mut fut) = fcb.take_future() else {
            warn!(?id, "fiber scheduled with no future attached");
            return;
        };
        let waker = Waker::from(Arc::new(FiberWaker { scheduler: self, fiber: id }));
        let mut cx = std::task::Context::from_waker(&waker);
        CURRENT_FIBER.with(|c| c.set(Some(id)));
        let poll = fut.as_mut().poll(&mut cx);
        CURRENT_FIBER.with(|c| c.set(None));
        match poll {
            Poll::Ready(()) => {
                trace!(?id, core, "fiber exited");
                let mut handles = self.handles.lock();
                if let Some(fcb2) = handles.get(id) {
                    *fcb2.state.lock() = FiberState::Exiting;
                }
                handles.free(id);
            }
            Poll::Pending => {
                fcb.restore_future(fut);
                let mut state = fcb.state.lock();
                if *state == FiberState::Running {
                    *state = FiberState::Waiting;
                }
            }
        }
    }

    /// `Sleep(timeout)` . Relative timeout, `0` meaning yield
    /// (the fiber is immediately reschedulable after one dispatch round).
    pub async fn sleep(&'static self, relative: crate::l0::time::TimeSpan) -> WaitResult {
        if relative.0 == 0 {
            return self.yield_now().await;
        }
        let deadline = crate::l0::time::get_absolute_time_to_wakeup(&self.tick_source, relative.0);
        if deadline == NO_TIMEOUT {
            return WaitResult::Success;
        }
        SleepFuture::new(self, deadline).await
    }

    /// `SleepThread(0)` yield: re-enters the run queue at the back of its
    /// priority level without actually elapsing time.
    pub async fn yield_now(&'static self) -> WaitResult {
        YieldFuture { yielded: false }.await;
        WaitResult::Success
    }

    pub async fn wait_on_address_equal(
        &'static self,
        addr: &AtomicU32,
        expected: u32,
        timeout: crate::l0::time::TimeSpan,
    ) -> crate::glue::result::Result<()> {
        let fiber = current_fiber().unwrap_or(FiberId::INVALID);
        let priority = self.priority_of(fiber);
        let deadline = self.deadline_of(timeout);
        WaitOnAddressFuture::equal(self, fiber, priority, addr, expected, deadline).await
    }

    pub async fn wait_on_address_less_than(
        &'static self,
        addr: &AtomicU32,
        expected: u32,
        decrement: bool,
        timeout: crate::l0::time::TimeSpan,
    ) -> crate::glue::result::Result<()> {
        let fiber = current_fiber().unwrap_or(FiberId::INVALID);
        let priority = self.priority_of(fiber);
        let deadline = self.deadline_of(timeout);
        WaitOnAddressFuture::less_than(self, fiber, priority, addr, expected, decrement, deadline).await
    }

    pub fn wake(&self, addr: &AtomicU32, count: i32) -> usize {
        self.futex.wake(FutexTable::key_of(addr), count)
    }

    pub fn wake_increment_if_equal(&self, addr: &AtomicU32, value: u32, count: i32) -> usize {
        self.futex.wake_increment_if_equal(addr, value, count)
    }

    pub fn wake_modify_by_waiter_count(&self, addr: &AtomicU32, value: u32, count: i32) -> usize {
        self.futex.wake_modify_by_waiter_count(addr, value, count)
    }

    pub(crate) fn priority_of(&self, fiber: FiberId) -> Priority {
        self.handles
            .lock()
            .get(fiber)
            .map(|f| f.effective_priority())
            .unwrap_or(crate::ukern::fiber::DEFAULT_PRIORITY)
    }

    pub(crate) fn fcb_of(&self, fiber: FiberId) -> Option<Arc<FiberControlBlock>> {
        self.handles.lock().get(fiber).cloned()
    }

    fn deadline_of(&self, timeout: crate::l0::time::TimeSpan) -> Option<u64> {
        let abs = crate::l0::time::get_absolute_time_to_wakeup(&self.tick_source, timeout.0);
        if abs == NO_TIMEOUT {
            None
        } else {
            Some(abs)
        }
    }

    pub fn now(&self) -> Tick {
        self.tick_source.now()
    }
}

struct YieldFuture {
    yielded: bool,
}

impl Future for YieldFuture {
    type Output = ();
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_scheduler() -> &'static Scheduler {
        Box::leak(Box::new(Scheduler::new(0b1, 64, 0))).ensure_started_and_return()
    }

    trait TestExt {
        fn ensure_started_and_return(&'static self) -> &'static Self;
    }
    impl TestExt for Scheduler {
        fn ensure_started_and_return(&'static self) -> &'static Self {
            self.ensure_started();
            self
        }
    }

    #[test]
    fn fiber_runs_to_completion_and_frees_handle() {
        let sched = test_scheduler();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let id = sched
            .create_fiber("t", 10, u64::MAX, async move {
                ran2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        sched.start_fiber(id);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sleep_suspends_and_resumes_after_deadline() {
        let sched = test_scheduler();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let id = sched
            .create_fiber("sleeper", 10, u64::MAX, async move {
                sched.sleep(crate::l0::time::TimeSpan::from_milliseconds(20)).await;
                done2.store(true, Ordering::SeqCst);
            })
            .unwrap();
        sched.start_fiber(id);
        std::thread::sleep(Duration::from_millis(10));
        assert!(!done.load(Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(150));
        assert!(done.load(Ordering::SeqCst));
    }
}
