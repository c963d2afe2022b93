//! src/ukern/suspend.rs
//! The concrete suspension-point futures named in: `Sleep`,
//! `WaitOnAddress` (`WaitIfEqual`/`WaitIfLessThan`). `ArbitrateLock` and
//! `WaitKey` are built out of [`crate::ukern::futex::FutexTable`] directly
//! inside `mutex.rs`/`condvar.rs` since they need to interleave a CAS retry
//! between checks; these two are the ones exposed to user code unmodified.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex as PlMutex;

use crate::ukern::fiber::{FiberId, Priority, WaitResult};
use crate::ukern::scheduler::Scheduler;

/// Shared cell the futex-wake path and the timeout path race to fill; the
/// first write wins — whichever unblocks first decides the outcome.
pub(crate) type Outcome = Arc<PlMutex<Option<WaitResult>>>;

pub(crate) struct FutexWake {
    pub outcome: Outcome,
    pub result: WaitResult,
    pub executor_waker: Waker,
}

impl Wake for FutexWake {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }
    fn wake_by_ref(self: &Arc<Self>) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(self.result);
        }
        drop(slot);
        self.executor_waker.wake_by_ref();
    }
}

pub(crate) fn wake_waker(outcome: Outcome, result: WaitResult, executor_waker: Waker) -> Waker {
    Waker::from(Arc::new(FutexWake {
        outcome,
        result,
        executor_waker,
    }))
}

/// `Sleep(timeout)` —. Completes only by timeout elapsing;
/// `timeout == NO_TIMEOUT` never completes (matches "There is NO
/// preemption" — a fiber that sleeps forever never runs again without an
/// external `Resume`/handle teardown).
pub struct SleepFuture {
    scheduler: &'static Scheduler,
    deadline: u64,
    registered: bool,
    outcome: Outcome,
}

impl SleepFuture {
    pub fn new(scheduler: &'static Scheduler, deadline: u64) -> Self {
        Self {
            scheduler,
            deadline,
            registered: false,
            outcome: Arc::new(PlMutex::new(None)),
        }
    }
}

impl Future for SleepFuture {
    type Output = WaitResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(result) = *this.outcome.lock() {
            return Poll::Ready(result);
        }
        if !this.registered {
            this.registered = true;
            let outcome = this.outcome.clone();
            let waker = cx.waker().clone();
            let registered = this.scheduler.timers().register(
                this.deadline,
                Box::new(move || {
                    *outcome.lock() = Some(WaitResult::Success);
                    waker.wake();
                }),
            );
            if registered.is_none() {
                // NO_TIMEOUT: sleep forever until something else drops the future.
            }
        }
        Poll::Pending
    }
}

/// `WaitOnAddress` — `WaitIfEqual`/`WaitIfLessThan` , raced
/// against an optional absolute-deadline timeout.
pub struct WaitOnAddressFuture {
    scheduler: &'static Scheduler,
    fiber: FiberId,
    priority: Priority,
    addr: *const AtomicU32,
    mode: WaitMode,
    deadline: Option<u64>,
    state: WaitState,
}

// Safety: the pointee is a real `AtomicU32` the caller guarantees outlives
// the wait — the address-keyed futex model assumes the address stays
// stable for the wait's duration.
unsafe impl Send for WaitOnAddressFuture {}

enum WaitMode {
    Equal { expected: u32 },
    LessThan { expected: u32, decrement: bool },
}

enum WaitState {
    Unregistered,
    Registered { outcome: Outcome, key: usize },
    Done,
}

impl WaitOnAddressFuture {
    pub fn equal(
        scheduler: &'static Scheduler,
        fiber: FiberId,
        priority: Priority,
        addr: &AtomicU32,
        expected: u32,
        deadline: Option<u64>,
    ) -> Self {
        Self {
            scheduler,
            fiber,
            priority,
            addr: addr as *const AtomicU32,
            mode: WaitMode::Equal { expected },
            deadline,
            state: WaitState::Unregistered,
        }
    }

    pub fn less_than(
        scheduler: &'static Scheduler,
        fiber: FiberId,
        priority: Priority,
        addr: &AtomicU32,
        expected: u32,
        decrement: bool,
        deadline: Option<u64>,
    ) -> Self {
        Self {
            scheduler,
            fiber,
            priority,
            addr: addr as *const AtomicU32,
            mode: WaitMode::LessThan { expected, decrement },
            deadline,
            state: WaitState::Unregistered,
        }
    }
}

impl Future for WaitOnAddressFuture {
    type Output = Result<(), crate::glue::result::ResultCode>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        use crate::glue::result::{Code, Module, ResultCode};
        let this = self.get_mut();
        let addr = unsafe { &*this.addr };
        match &this.state {
            WaitState::Unregistered => {
                let outcome: Outcome = Arc::new(PlMutex::new(None));
                let futex_waker = wake_waker(outcome.clone(), WaitResult::Success, cx.waker().clone());
                let ok = match &this.mode {
                    WaitMode::Equal { expected } => this.scheduler.futex().wait_if_equal(
                        addr,
                        *expected,
                        this.fiber,
                        this.priority,
                        futex_waker,
                    ),
                    WaitMode::LessThan { expected, decrement } => this.scheduler.futex().wait_if_less_than(
                        addr,
                        *expected,
                        *decrement,
                        this.fiber,
                        this.priority,
                        futex_waker,
                    ),
                };
                if !ok {
                    this.state = WaitState::Done;
                    return Poll::Ready(Err(ResultCode::new(Module::Ukern, Code::InvalidWaitAddressValue)));
                }
                let key = crate::ukern::futex::FutexTable::key_of(addr);
                if let Some(deadline) = this.deadline {
                    let timeout_outcome = outcome.clone();
                    let waker = cx.waker().clone();
                    let futex = this.scheduler.futex();
                    let fiber = this.fiber;
                    this.scheduler.timers().register(
                        deadline,
                        Box::new(move || {
                            if futex.cancel_wait(key, fiber) {
                                let mut slot = timeout_outcome.lock();
                                if slot.is_none() {
                                    *slot = Some(WaitResult::Timeout);
                                }
                                drop(slot);
                                waker.wake();
                            }
                        }),
                    );
                }
                this.state = WaitState::Registered { outcome, key };
                Poll::Pending
            }
            WaitState::Registered { outcome, .. } => {
                let result = *outcome.lock();
                match result {
                    Some(WaitResult::Timeout) => {
                        this.state = WaitState::Done;
                        Poll::Ready(Err(ResultCode::new(Module::Ukern, Code::Timeout)))
                    }
                    Some(WaitResult::Success) => {
                        this.state = WaitState::Done;
                        Poll::Ready(Ok(()))
                    }
                    Some(WaitResult::InvalidWaitAddressValue) | None => Poll::Pending,
                }
            }
            WaitState::Done => Poll::Pending,
        }
    }
}
