//! src/resource/binder.rs
//! `ResourceBinder`: the caller-visible handle a load request hands
//! back. Wraps an [`crate::async_task::watcher::AsyncTaskWatcher`] so a
//! binder can be dropped mid-load to advisory-cancel its task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::async_task::watcher::{AsyncTaskWatcher, WatcherState};

/// Carried verbatim from `res_resourcebinder.h`. `IsErrorStatus()` below is
/// `status >= UnknownError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Uninitialized,
    ResourceInitialized,
    Referenced,
    Reclaimed,
    InLoad,
    UnknownError,
    RequiresReprocess,
    FileNotFound,
    FailedToGetDecompressedSize,
    FailedToInitializeResource,
    InvalidUserResourceSize,
    InvalidResourceSize,
    FileNotAvailable,
    MemoryAllocationFailure,
    NoResourceUnitOnFinalize,
}

impl Status {
    /// `res_resourcebinder.h::IsErrorStatus()`: every variant from
    /// `UnknownError` onward is a failure, carried verbatim — the enum's
    /// declaration order *is* the error boundary.
    pub fn is_error(self) -> bool {
        self >= Status::UnknownError
    }
}

struct BinderState {
    status: Status,
    /// `res_resourcebinder.h`'s named bitfield, reproduced as bools per
    /// ("Rust has no ambient need to match the C++ memory
    /// layout here").
    is_initialized: bool,
    load_guard: bool,
    is_finalize: bool,
    complete_guard: bool,
    unit: Option<Arc<crate::resource::unit::ResourceUnit>>,
}

/// The caller-visible load handle .
pub struct ResourceBinder {
    state: Mutex<BinderState>,
    watcher: Arc<AsyncTaskWatcher>,
    failed: AtomicBool,
}

impl ResourceBinder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BinderState {
                status: Status::Uninitialized,
                is_initialized: false,
                load_guard: false,
                is_finalize: false,
                complete_guard: false,
                unit: None,
            }),
            watcher: AsyncTaskWatcher::new(),
            failed: AtomicBool::new(false),
        })
    }

    pub fn watcher(&self) -> &Arc<AsyncTaskWatcher> {
        &self.watcher
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn set_status(&self, status: Status) {
        if status.is_error() {
            self.failed.store(true, Ordering::Release);
        }
        self.state.lock().status = status;
    }

    /// `IsFailed()`: "stays true until the
    /// binder is re-used", i.e. until [`Self::reset`] is called, not just
    /// until `status` happens to read non-error again.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn begin_load(&self) -> bool {
        let mut state = self.state.lock();
        if state.load_guard {
            return false;
        }
        state.load_guard = true;
        state.status = Status::InLoad;
        true
    }

    pub fn begin_finalize(&self) -> bool {
        let mut state = self.state.lock();
        if state.is_finalize || state.complete_guard {
            return false;
        }
        state.is_finalize = true;
        true
    }

    pub fn complete(&self, unit: Arc<crate::resource::unit::ResourceUnit>) {
        let mut state = self.state.lock();
        state.unit = Some(unit);
        state.status = Status::Referenced;
        state.is_initialized = true;
        state.complete_guard = true;
        state.is_finalize = false;
    }

    pub fn fail(&self, status: Status) {
        debug_assert!(status.is_error(), "fail() must be called with an error status");
        self.set_status(status);
        let mut state = self.state.lock();
        state.unit = None;
        state.is_finalize = false;
        state.load_guard = false;
    }

    pub fn unit(&self) -> Option<Arc<crate::resource::unit::ResourceUnit>> {
        self.state.lock().unit.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_initialized
    }

    /// Re-arms a binder for reuse .
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = BinderState {
            status: Status::Uninitialized,
            is_initialized: false,
            load_guard: false,
            is_finalize: false,
            complete_guard: false,
            unit: None,
        };
        self.failed.store(false, Ordering::Release);
    }

    pub async fn wait_for_completion(self: &Arc<Self>) -> Status {
        self.watcher.wait_for_completion().await;
        self.status()
    }

    /// Advisory-cancels the in-flight load by releasing the binder's own
    /// watcher reference: the owning binder may cancel by releasing.
    pub fn cancel(&self) {
        if matches!(self.watcher.state(), WatcherState::Pending) {
            self.set_status(Status::Reclaimed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_boundary_is_unknown_error_and_above() {
        assert!(!Status::InLoad.is_error());
        assert!(Status::UnknownError.is_error());
        assert!(Status::NoResourceUnitOnFinalize.is_error());
    }

    #[test]
    fn is_failed_persists_until_reset() {
        let binder = ResourceBinder::new();
        binder.fail(Status::FileNotFound);
        assert!(binder.is_failed());
        binder.set_status(Status::InLoad);
        assert!(binder.is_failed(), "status moving off the error value alone must not clear IsFailed()");
        binder.reset();
        assert!(!binder.is_failed());
    }

    #[test]
    fn begin_load_guards_against_reentry() {
        let binder = ResourceBinder::new();
        assert!(binder.begin_load());
        assert!(!binder.begin_load(), "a second concurrent load on the same binder must be refused");
    }
}
