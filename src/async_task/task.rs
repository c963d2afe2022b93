//! src/async_task/task.rs
//! `AsyncTask`: one unit of queued work. The
//! section's "deep virtual hierarchy" note (`AsyncTask` →
//! `AsyncTaskForAllocator` → `LoadTask`) collapses here into one struct
//! plus a `user_data` slot any subclass-like caller (the resource pipeline's
//! `LoadTask`) stuffs its own state into, rather than a trait-object chain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::glue::result::Result as UResult;
use crate::l0::index_alloc::Handle;

pub type TaskId = Handle;

/// Cooperative cancellation flag threaded into every task closure. Execute
/// must poll this if it wishes to cooperate with cancellation — in-flight
/// cancellation is advisory, not preemptive.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub type TaskFn = Box<dyn FnMut(&CancelFlag) -> UResult<()> + Send>;
pub type ResultFn = Box<dyn FnMut(UResult<()>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Uninitialized,
    Cancelled,
    Queued,
    Acquired,
    FreeExecute,
    PostExecute,
    Complete,
    /// Terminal like `Complete`, but `invoke()`'s `task_fn` returned an
    /// error rather than succeeding — "a task whose Execute method ...
    /// returns a non-success Result causes the queue to reflect that
    /// failure in the finish notification; the task is still freed."
    Failed,
}

impl TaskStatus {
    /// Either terminal variant a watcher or `wait_for_completion` caller
    /// should stop polling on.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

pub struct AsyncTask {
    pub priority: u32,
    pub pinned_worker: Option<usize>,
    pub status: Mutex<TaskStatus>,
    pub cancel: CancelFlag,
    task_fn: Mutex<Option<TaskFn>>,
    result_fn: Mutex<Option<ResultFn>>,
    /// Signaled exactly once, when `status` reaches a terminal variant
    /// (`Complete`, `Failed`, or `Cancelled`) — what
    /// [`crate::async_task::watcher::AsyncTaskWatcher::wait_for_completion`]
    /// awaits.
    pub(crate) finish: Notify,
    /// Optional watcher bound at push time . Notified
    /// on the same terminal transition as `finish`.
    watcher: Mutex<Option<Arc<crate::async_task::watcher::AsyncTaskWatcher>>>,
}

impl AsyncTask {
    pub fn new(priority: u32, pinned_worker: Option<usize>, task_fn: TaskFn, result_fn: Option<ResultFn>) -> Self {
        Self {
            priority,
            pinned_worker,
            status: Mutex::new(TaskStatus::Uninitialized),
            cancel: CancelFlag::new(),
            task_fn: Mutex::new(Some(task_fn)),
            result_fn: Mutex::new(result_fn),
            finish: Notify::new(),
            watcher: Mutex::new(None),
        }
    }

    pub fn set_watcher(&self, watcher: Arc<crate::async_task::watcher::AsyncTaskWatcher>) {
        *self.watcher.lock() = Some(watcher);
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, s: TaskStatus) {
        *self.status.lock() = s;
    }

    /// Runs the task's `task_fn`, then its optional `result_fn`, exactly
    /// once — `task_fn` is taken out so a task can never be double-invoked
    /// even if two code paths race to execute it.
    pub(crate) fn invoke(&self) -> UResult<()> {
        let Some(mut f) = self.task_fn.lock().take() else {
            return Ok(());
        };
        let result = f(&self.cancel);
        if let Some(mut r) = self.result_fn.lock().take() {
            r(result.clone());
        }
        result
    }

    pub(crate) fn finish_and_notify(&self, status: TaskStatus) {
        self.set_status(status);
        self.finish.notify_waiters();
        if let Some(w) = self.watcher.lock().as_ref() {
            w.notify_terminal(status);
        }
    }
}
