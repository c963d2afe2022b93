//! src/l0/mod.rs
//! Leaves-first utilities every higher layer depends on :
//! the monotonic tick source and timespan conversions, and the intrusive
//! containers (lists, ordered trees, ring buffers, index allocators) that
//! `ukern`, `mem`, `async_task` and `resource` all build on.

pub mod index_alloc;
pub mod intrusive;
pub mod time;
