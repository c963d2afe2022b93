//! src/async_task/watcher.rs
//! `AsyncTaskWatcher`: a counted
//! handle over a task's completion. While its reference count is above
//! zero the task it watches may not be returned to
//! [`crate::async_task::allocator::TaskAllocator`] — this is what lets a
//! `ResourceBinder` safely hold a load task's result past the point the
//! queue itself considers the task finished.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::async_task::queue::AsyncQueue;
use crate::async_task::task::{AsyncTask, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Uninitialized,
    Pending,
    Complete,
    Cancelled,
}

struct Inner {
    state: WatcherState,
    /// Back-pointer to the watched task's allocator slot, released exactly
    /// once on the Complete/Cancelled transition .
    task: Option<Arc<AsyncTask>>,
    released: bool,
}

/// A ref-counted observer of one [`AsyncTask`]'s completion . `reference()`/`release_reference()` are the only mutators
/// of the count; the queue mutex is not needed here because the watcher's
/// own state is independent of queue topology — only the *task* it wraps
/// is queue-owned, and that task's own `Mutex` already serializes status
/// transitions.
pub struct AsyncTaskWatcher {
    refcount: AtomicU32,
    inner: Mutex<Inner>,
}

impl AsyncTaskWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            refcount: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                state: WatcherState::Uninitialized,
                task: None,
                released: false,
            }),
        })
    }

    /// Binds the watcher to a task that has just been queued . Must be called before anyone calls
    /// `wait_for_completion`.
    pub fn bind(self: &Arc<Self>, task: Arc<AsyncTask>) {
        task.set_watcher(self.clone());
        let mut inner = self.inner.lock();
        inner.task = Some(task);
        inner.state = WatcherState::Pending;
        inner.released = false;
    }

    pub fn state(&self) -> WatcherState {
        self.inner.lock().state
    }

    pub fn reference(self: &Arc<Self>) -> WatcherRef {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        WatcherRef { watcher: self.clone() }
    }

    /// Releases a reference; if this is the last one and the task has
    /// already finished, frees the task back to its allocator —:
    /// "the watcher releases its back-reference exactly once on the
    /// transition to Complete or Cancelled", deferred here until refcount
    /// also reaches zero so an in-flight `wait_for_completion` caller never
    /// races the free.
    fn release_reference(&self) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.maybe_release_task();
        }
    }

    fn maybe_release_task(&self) {
        let mut inner = self.inner.lock();
        if inner.released {
            return;
        }
        if matches!(inner.state, WatcherState::Complete | WatcherState::Cancelled)
            && self.refcount.load(Ordering::Acquire) == 0
        {
            inner.released = true;
            inner.task = None;
        }
    }

    /// Called by the queue when the watched task reaches a terminal status
    /// .
    pub(crate) fn notify_terminal(&self, status: TaskStatus) {
        let mut inner = self.inner.lock();
        inner.state = match status {
            TaskStatus::Cancelled => WatcherState::Cancelled,
            _ => WatcherState::Complete,
        };
        drop(inner);
        self.maybe_release_task();
    }

    /// Blocks (cooperatively, via the task's finish event) until the
    /// watched task reaches Complete or Cancelled. References the watcher
    /// for the duration so the task cannot be recycled out from under the
    /// wait.
    pub async fn wait_for_completion(self: &Arc<Self>) -> WatcherState {
        let _guard = self.reference();
        let task = self.inner.lock().task.clone();
        if let Some(task) = task {
            while !task.status().is_terminal() {
                task.finish.notified().await;
            }
        }
        self.state()
    }
}

/// RAII reference on a watcher — dropping it calls `release_reference()`
/// exactly once, mirroring the original's manual `Reference`/`ReleaseReference`
/// pairing without requiring callers to remember to release.
pub struct WatcherRef {
    watcher: Arc<AsyncTaskWatcher>,
}

impl Drop for WatcherRef {
    fn drop(&mut self) {
        self.watcher.release_reference();
    }
}

/// Pushes `info` onto `queue` and returns a bound watcher for it — the
/// convenience wiring most callers (the resource pipeline's load task) want
/// instead of juggling `AsyncQueue::push` and `AsyncTaskWatcher::bind`
/// themselves.
pub fn push_with_watcher(
    queue: &AsyncQueue,
    info: crate::async_task::queue::PushInfo,
) -> crate::glue::result::Result<Arc<AsyncTaskWatcher>> {
    let watcher = AsyncTaskWatcher::new();
    let id = queue.push(info)?;
    if let Some(task) = queue.task_finish_notify(id) {
        watcher.bind(task);
    }
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_task::queue::PushInfo;

    #[tokio::test]
    async fn watcher_completes_when_task_completes() {
        let queue = AsyncQueue::new(2, 16, 8);
        let watcher = push_with_watcher(
            &queue,
            PushInfo {
                priority: 0,
                pinned_worker: None,
                task_fn: Box::new(|_| Ok(())),
                result_fn: None,
                sync: false,
            },
        )
        .unwrap();
        assert_eq!(watcher.state(), WatcherState::Pending);

        // Drain synchronously — `force_calc_sync` calls `finish_and_notify`,
        // which now also fires the bound watcher.
        queue.force_calc_sync(1);
        let state = watcher.wait_for_completion().await;
        assert_eq!(state, WatcherState::Complete);
    }

    #[test]
    fn refcount_gates_task_release() {
        let watcher = AsyncTaskWatcher::new();
        let task = Arc::new(AsyncTask::new(0, None, Box::new(|_| Ok(())), None));
        watcher.bind(task);
        let r1 = watcher.reference();
        watcher.notify_terminal(TaskStatus::Complete);
        assert!(watcher.inner.lock().task.is_some(), "still referenced, task must not be released yet");
        drop(r1);
        assert!(watcher.inner.lock().task.is_none());
    }
}
