//! src/async_task/allocator.rs
//! `AsyncTaskForAllocator` / `TaskAllocator`: a fixed-capacity free list of reusable task
//! slots for the common load-task case, so the resource pipeline does not
//! allocate a fresh `AsyncTask` per request.
//!
//! The section collapses `AsyncTask -> AsyncTaskForAllocator
//! -> LoadTask` into one struct (`AsyncTask` itself, see `task.rs`) plus a
//! `user_data`-shaped slot; this module is the pool that owns and recycles
//! those slots, independent of what a caller stuffs into them.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::async_task::task::{AsyncTask, TaskStatus};
use crate::async_task::watcher::{AsyncTaskWatcher, WatcherState};
use crate::glue::result::{Code, Module, Result, ResultCode};
use crate::l0::index_alloc::{Handle, HandleTable};

pub type AllocatorSlot = Handle;

struct Slot {
    task: Arc<AsyncTask>,
    watcher: Option<Arc<AsyncTaskWatcher>>,
    /// "a bit in each task indicating 'currently on the free list'"
    /// .
    on_free_list: bool,
}

/// A fixed-capacity pool of reusable tasks. `free_to_allocator` must run
/// under the owning queue's mutex in the original; here the pool keeps its
/// own lock since allocator membership is independent of queue scan state
/// — the invariant it protects ("watchers never observe a freed task") is
/// enforced by checking watcher state before returning a slot to the free
/// list, not by sharing the queue's lock.
pub struct TaskAllocator {
    slots: Mutex<HandleTable<Slot>>,
    free: Mutex<Vec<AllocatorSlot>>,
}

impl TaskAllocator {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HandleTable::with_capacity(capacity)),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Allocates a slot for a new task, preferring a freed slot over
    /// growing the table. Returns `None` only if the fixed-capacity table
    /// itself is exhausted.
    pub fn allocate(&self, task: Arc<AsyncTask>, watcher: Option<Arc<AsyncTaskWatcher>>) -> Result<AllocatorSlot> {
        if let Some(reused) = self.free.lock().pop() {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(reused) {
                slot.task = task;
                slot.watcher = watcher;
                slot.on_free_list = false;
                return Ok(reused);
            }
        }
        self.slots
            .lock()
            .allocate(Slot { task, watcher, on_free_list: false })
            .ok_or_else(|| ResultCode::new(Module::Async, Code::AlreadyQueued))
    }

    pub fn task_of(&self, slot: AllocatorSlot) -> Option<Arc<AsyncTask>> {
        self.slots.lock().get(slot).map(|s| s.task.clone())
    }

    /// `AsyncTaskForAllocator::FreeToAllocator`: returns the
    /// slot to the free list only if there is no watcher, or the watcher
    /// has already reached a terminal state — this is what guarantees
    /// "watchers never observe a freed task".
    pub fn free_to_allocator(&self, slot: AllocatorSlot) -> bool {
        let mut slots = self.slots.lock();
        let Some(s) = slots.get_mut(slot) else { return false };
        if s.on_free_list {
            return false;
        }
        let releasable = match &s.watcher {
            None => true,
            Some(w) => matches!(w.state(), WatcherState::Complete | WatcherState::Cancelled),
        };
        if !releasable {
            return false;
        }
        s.on_free_list = true;
        drop(slots);
        self.free.lock().push(slot);
        true
    }

    pub fn is_on_free_list(&self, slot: AllocatorSlot) -> bool {
        self.slots.lock().get(slot).map(|s| s.on_free_list).unwrap_or(true)
    }

    pub fn status_of(&self, slot: AllocatorSlot) -> Option<TaskStatus> {
        self.slots.lock().get(slot).map(|s| s.task.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task() -> Arc<AsyncTask> {
        Arc::new(AsyncTask::new(0, None, Box::new(|_| Ok(())), None))
    }

    #[test]
    fn free_without_watcher_succeeds_immediately() {
        let alloc = TaskAllocator::with_capacity(4);
        let slot = alloc.allocate(make_task(), None).unwrap();
        assert!(alloc.free_to_allocator(slot));
        assert!(alloc.is_on_free_list(slot));
    }

    #[test]
    fn free_with_pending_watcher_is_refused() {
        let alloc = TaskAllocator::with_capacity(4);
        let watcher = AsyncTaskWatcher::new();
        let task = make_task();
        watcher.bind(task.clone());
        let slot = alloc.allocate(task, Some(watcher.clone())).unwrap();
        assert!(!alloc.free_to_allocator(slot));
        watcher.notify_terminal(TaskStatus::Complete);
        assert!(alloc.free_to_allocator(slot));
    }

    #[test]
    fn reused_slots_are_preferred_over_growth() {
        let alloc = TaskAllocator::with_capacity(1);
        let slot = alloc.allocate(make_task(), None).unwrap();
        alloc.free_to_allocator(slot);
        let slot2 = alloc.allocate(make_task(), None).unwrap();
        assert_eq!(slot, slot2, "single-capacity pool must reuse the freed slot, not grow");
    }
}
