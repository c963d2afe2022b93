//! src/glue/mod.rs
//! Process-wide plumbing that doesn't belong to any one subsystem: the
//! domain result-code taxonomy, the RTTI shim, and the single legacy
//! singleton (the scheduler) concedes is unavoidable.

pub mod result;
pub mod rtti;
pub mod singletons;
