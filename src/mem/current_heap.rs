//! src/mem/current_heap.rs
//! Per-fiber "current heap" context . Object constructors that
//! need allocation but weren't given a heap explicitly pull from this slot.
//! Backed by TLS slot 0 of the calling fiber's control block (not OS
//! thread-local storage — many fibers share one worker thread over their
//! lifetimes, so the "current" heap must travel with the fiber, not the
//! thread it happens to be running on this tick).

use crate::mem::heap::HeapId;
use crate::ukern::scheduler::{current_fiber, Scheduler};

const CURRENT_HEAP_TLS_SLOT: usize = 0;

/// Returns the calling fiber's current heap, or `None` if unset or if
/// called outside any fiber (e.g. from a service thread, which has no FCB
/// to carry this context — service code must be given a heap explicitly).
pub fn current_heap(scheduler: &'static Scheduler) -> Option<HeapId> {
    let fiber = current_fiber()?;
    let fcb = scheduler.fcb_of(fiber)?;
    let tls = fcb.tls.lock();
    tls[CURRENT_HEAP_TLS_SLOT]
        .as_ref()
        .and_then(|b| b.downcast_ref::<HeapId>())
        .copied()
}

pub fn set_current_heap(scheduler: &'static Scheduler, heap: Option<HeapId>) -> Option<HeapId> {
    let fiber = current_fiber()?;
    let fcb = scheduler.fcb_of(fiber)?;
    let mut tls = fcb.tls.lock();
    let previous = tls[CURRENT_HEAP_TLS_SLOT]
        .take()
        .and_then(|b| b.downcast_ref::<HeapId>().copied());
    tls[CURRENT_HEAP_TLS_SLOT] = heap.map(|h| Box::new(h) as Box<dyn std::any::Any + Send>);
    previous
}

/// RAII scope that installs a heap as current for its lifetime and
/// restores whatever was current beforehand on every exit path (spec
/// §4.2: "saves/restores on all exit paths").
pub struct ScopedCurrentThreadHeap {
    scheduler: &'static Scheduler,
    previous: Option<HeapId>,
}

impl ScopedCurrentThreadHeap {
    pub fn new(scheduler: &'static Scheduler, heap: HeapId) -> Self {
        let previous = set_current_heap(scheduler, Some(heap));
        Self { scheduler, previous }
    }
}

impl Drop for ScopedCurrentThreadHeap {
    fn drop(&mut self) {
        set_current_heap(self.scheduler, self.previous);
    }
}
