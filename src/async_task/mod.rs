//! src/async_task/mod.rs
//! The priority-aware async task engine: a priority
//! [`queue::AsyncQueue`] of [`task::AsyncTask`]s, an optional
//! [`watcher::AsyncTaskWatcher`] per task, a [`allocator::TaskAllocator`]
//! pool for the resource pipeline's recurring load tasks, and a separate
//! [`job_graph::DependencyJobGraph`] scheduler for batch DAG-shaped work.

pub mod allocator;
pub mod job_graph;
pub mod queue;
pub mod task;
pub mod watcher;

pub use allocator::{AllocatorSlot, TaskAllocator};
pub use job_graph::{DependencyJobGraph, DependencyJobThreadManager, JobGraphNode, JobGraphNodeSpec, RegisterId};
pub use queue::{AsyncQueue, PushInfo};
pub use task::{AsyncTask, CancelFlag, TaskId, TaskStatus};
pub use watcher::{push_with_watcher, AsyncTaskWatcher, WatcherRef, WatcherState};
