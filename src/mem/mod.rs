//! src/mem/mod.rs
//! The heap hierarchy: a tree of named heaps rooted under a
//! process-wide [`heap::HeapManager`], each backed by one of the kinds in
//! [`heap::HeapKind`].

pub mod current_heap;
pub mod disposer;
pub mod exp_heap;
#[cfg(feature = "gpu")]
pub mod gpu_heap;
pub mod heap;
pub mod virtual_address_heap;

pub use current_heap::{current_heap, set_current_heap, ScopedCurrentThreadHeap};
pub use disposer::{Disposer, DisposerToken};
pub use exp_heap::{AllocationMode, ExpHeap};
pub use heap::{HeapEntry, HeapId, HeapKind, HeapManager};
pub use virtual_address_heap::VirtualAddressHeap;
