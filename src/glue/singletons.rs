//! src/glue/singletons.rs
//! Process-wide instances, reduced to the single legacy global
//! concedes is unavoidable: the UKern scheduler itself (fibers must suspend
//! and resume without threading a context handle through every call site
//! that might yield). Every other subsystem the original listed as a
//! global singleton (`HeapManager`, `AsyncResourceManager`,
//! `FileDeviceManager`, ...) is instead an explicit [`crate::Runtime`]
//! object constructed once and threaded through initialization, per the
//! section.

use std::sync::OnceLock;

use crate::ukern::scheduler::Scheduler;

static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

/// Initializes the process-wide UKern scheduler. Must be called exactly
/// once before any fiber API is used; subsequent calls are no-ops (the
/// scheduler, once started, owns its worker threads for the process
/// lifetime —: "isolate it behind a single initialization point
/// with a documented teardown protocol").
pub fn init_scheduler(core_mask: u64, max_fibers: usize, default_stack_size: usize) -> &'static Scheduler {
    SCHEDULER.get_or_init(|| Scheduler::new(core_mask, max_fibers, default_stack_size))
}

/// Returns the process-wide scheduler. Panics if [`init_scheduler`] has not
/// been called — this mirrors the original's assumption that UKern is
/// brought up before any other subsystem touches a fiber.
pub fn scheduler() -> &'static Scheduler {
    SCHEDULER
        .get()
        .expect("ukern scheduler not initialized: call glue::singletons::init_scheduler first")
}

/// True once the scheduler singleton has been initialized. Used by tests
/// that want to skip scheduler-dependent assertions when running in
/// isolation.
pub fn scheduler_is_initialized() -> bool {
    SCHEDULER.get().is_some()
}
