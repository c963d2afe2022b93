//! src/mem/heap.rs
//! The heap hierarchy: a process-wide tree of named heaps.
//! Every allocation's address lies in its heap's `[start, end)` range, and
//! that range lies inside its parent's — the sole mechanism used
//! for attributing a bare address back to the heap that owns it, which is
//! why every heap kind here (bar `VirtualAddressHeap`, which already gets
//! unique addresses straight from the host's page allocator) draws its
//! range from one process-wide flat address counter rather than an
//! independent zero-based arena.
//!
//! [`HeapBacking`] is a closed enum rather than a base class with virtual
//! dispatch, so the different heap kinds share one interface without a
//! vtable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::glue::result::{Code, Module, Result, ResultCode};
use crate::l0::index_alloc::{Handle, HandleTable};
use crate::l0::intrusive::SlotId;
use crate::mem::disposer::Disposer;
use crate::mem::exp_heap::{AllocationMode, ExpHeap};
use crate::mem::virtual_address_heap::VirtualAddressHeap;

pub type HeapId = Handle;

/// Process-wide flat address space used purely for range bookkeeping.
/// `ExpHeap`/`SeparateHeap` never read or write through these addresses —
/// ranges exist only so `HeapManager` can answer "which heap owns this
/// address" and enforce "child range ⊆ parent range" without every heap
/// sharing one real backing buffer. Starts well above zero so a stray
/// null-ish address never collides with a heap range in tests.
static ADDRESS_SPACE: AtomicUsize = AtomicUsize::new(0x1_0000_0000);

pub(crate) fn reserve_address_range(size: usize) -> usize {
    let aligned = size.max(1).next_multiple_of(64);
    ADDRESS_SPACE.fetch_add(aligned, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    Exp,
    VirtualAddress,
    Separate,
    #[cfg(feature = "gpu")]
    GpuExp,
}

enum HeapBacking {
    /// `ExpHeap` also backs `HeapKind::Separate`: `SeparateHeap`'s defining
    /// trait is that block metadata lives outside the managed region, which
    /// is already how `ExpHeap` works here (headers are tracked in a
    /// `SlotList`, never packed into arena bytes) — so the two kinds share
    /// an implementation and differ only in the tag exposed to callers.
    Exp(ExpHeap),
    VirtualAddress(VirtualAddressHeap),
    #[cfg(feature = "gpu")]
    Gpu(crate::mem::gpu_heap::GpuExpHeap),
}

impl HeapBacking {
    fn allocate(&mut self, size: usize, align: usize) -> Result<usize> {
        match self {
            HeapBacking::Exp(h) => h.allocate(size, align),
            HeapBacking::VirtualAddress(h) => h.allocate(size),
            #[cfg(feature = "gpu")]
            HeapBacking::Gpu(h) => h.allocate(size, align),
        }
    }

    fn free(&mut self, addr: usize) -> Result<()> {
        match self {
            HeapBacking::Exp(h) => h.free(addr),
            HeapBacking::VirtualAddress(h) => h.free(addr),
            #[cfg(feature = "gpu")]
            HeapBacking::Gpu(h) => h.free(addr),
        }
    }

    fn contains(&self, addr: usize) -> bool {
        match self {
            HeapBacking::Exp(h) => h.contains(addr),
            HeapBacking::VirtualAddress(h) => h.contains(addr),
            #[cfg(feature = "gpu")]
            HeapBacking::Gpu(h) => h.contains(addr),
        }
    }
}

/// Parent/child links, mutated only while the owning [`HeapManager`]'s
/// process-wide topology lock is held .
struct Topology {
    parent: Option<HeapId>,
    children: Vec<HeapId>,
}

pub struct HeapEntry {
    pub name: String,
    pub kind: HeapKind,
    pub range: (usize, usize),
    topology: Mutex<Topology>,
    backing: Mutex<HeapBacking>,
    disposers: Mutex<crate::l0::intrusive::SlotList<Box<dyn Disposer>>>,
}

impl HeapEntry {
    pub fn start(&self) -> usize {
        self.range.0
    }

    pub fn end(&self) -> usize {
        self.range.1
    }

    pub fn parent(&self) -> Option<HeapId> {
        self.topology.lock().parent
    }

    pub fn children(&self) -> Vec<HeapId> {
        self.topology.lock().children.clone()
    }

    pub fn allocate(&self, size: usize, align: usize) -> Result<usize> {
        self.backing.lock().allocate(size, align)
    }

    pub fn free(&self, addr: usize) -> Result<()> {
        self.backing.lock().free(addr)
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.range.0 && addr < self.range.1 && self.backing.lock().contains(addr)
    }

    /// Registers a disposer, returning the token it must present back to
    /// [`HeapEntry::remove_disposer`] .
    pub fn add_disposer(&self, disposer: Box<dyn Disposer>) -> SlotId {
        self.disposers.lock().push_back(disposer)
    }

    pub fn remove_disposer(&self, slot: SlotId) {
        self.disposers.lock().remove(slot);
    }

    /// Drains every registered disposer in registration order. Invoked
    /// under the heap's own lock, before the manager ever touches topology
    /// — `mem_heap.hpp`'s two-phase destruct order (disposers first, then
    /// unlink), carried into [`HeapManager::destroy`].
    fn dispose_all(&self) {
        let mut disposers = self.disposers.lock();
        while let Some(slot) = disposers.front_id() {
            let mut d = disposers.remove(slot);
            d.dispose();
        }
    }
}

pub struct HeapManager {
    handles: Mutex<HandleTable<Arc<HeapEntry>>>,
    /// The process-wide topology lock: held whenever a
    /// heap's parent/child links change, i.e. during create/destroy, but
    /// never during ordinary allocate/free traffic on an existing heap.
    topology_lock: Mutex<()>,
}

impl HeapManager {
    pub fn new(max_heaps: u32) -> Self {
        Self {
            handles: Mutex::new(HandleTable::with_capacity(max_heaps as usize)),
            topology_lock: Mutex::new(()),
        }
    }

    fn insert(&self, entry: HeapEntry) -> Result<HeapId> {
        let entry = Arc::new(entry);
        self.handles
            .lock()
            .allocate(entry)
            .ok_or_else(|| ResultCode::new(Module::Mem, Code::EntryExhaustion))
    }

    pub fn entry(&self, id: HeapId) -> Option<Arc<HeapEntry>> {
        self.handles.lock().get(id).cloned()
    }

    pub fn create_root(&self, name: impl Into<String>, size: usize, kind: HeapKind, mode: AllocationMode) -> Result<HeapId> {
        let _topology = self.topology_lock.lock();
        let base = reserve_address_range(size);
        let backing = match kind {
            HeapKind::Exp | HeapKind::Separate => HeapBacking::Exp(ExpHeap::new(base, size, mode)),
            HeapKind::VirtualAddress => HeapBacking::VirtualAddress(VirtualAddressHeap::new()),
            #[cfg(feature = "gpu")]
            HeapKind::GpuExp => return Err(ResultCode::new(Module::Mem, Code::InvalidFile)),
        };
        let range = match &backing {
            HeapBacking::VirtualAddress(_) => (0, usize::MAX),
            _ => (base, base + size),
        };
        self.insert(HeapEntry {
            name: name.into(),
            kind,
            range,
            topology: Mutex::new(Topology { parent: None, children: Vec::new() }),
            backing: Mutex::new(backing),
            disposers: Mutex::new(crate::l0::intrusive::SlotList::new()),
        })
    }

    /// Creates a heap wholly contained inside `parent`'s range. Its backing
    /// store is carved from the parent via one
    /// allocation covering the whole child arena: the child then manages
    /// that span with its own free list, and freeing the child releases
    /// that single allocation back to the parent.
    pub fn create_child(
        &self,
        parent_id: HeapId,
        name: impl Into<String>,
        size: usize,
        kind: HeapKind,
        mode: AllocationMode,
    ) -> Result<HeapId> {
        let _topology = self.topology_lock.lock();
        let parent = self
            .entry(parent_id)
            .ok_or_else(|| ResultCode::new(Module::Ukern, Code::InvalidHandle))?;
        // Reserve header room in the same allocation so the child's own
        // bookkeeping (never written to real bytes, see HeapBacking::Exp)
        // still maps to an address range the parent is willing to vouch
        // for as "contained".
        let carved = parent.allocate(size, 64)?;
        let range = (carved, carved + size);
        let backing = match kind {
            HeapKind::Exp | HeapKind::Separate => HeapBacking::Exp(ExpHeap::new(carved, size, mode)),
            HeapKind::VirtualAddress => HeapBacking::VirtualAddress(VirtualAddressHeap::new()),
            #[cfg(feature = "gpu")]
            HeapKind::GpuExp => return Err(ResultCode::new(Module::Mem, Code::InvalidFile)),
        };
        let id = self.insert(HeapEntry {
            name: name.into(),
            kind,
            range,
            topology: Mutex::new(Topology { parent: Some(parent_id), children: Vec::new() }),
            backing: Mutex::new(backing),
            disposers: Mutex::new(crate::l0::intrusive::SlotList::new()),
        })?;
        parent.topology.lock().children.push(id);
        Ok(id)
    }

    /// Two-phase destruct: drain
    /// this heap's disposers under its own lock first — a disposer may
    /// itself touch sibling state but never the topology lock — then take
    /// the process-wide topology lock to unlink from the parent and
    /// recursively destroy any remaining children.
    pub fn destroy(&self, id: HeapId) -> Result<()> {
        let Some(entry) = self.entry(id) else {
            return Err(ResultCode::new(Module::Ukern, Code::InvalidHandle));
        };
        entry.dispose_all();

        let children = entry.children();
        for child in children {
            self.destroy(child)?;
        }

        let _topology = self.topology_lock.lock();
        if let Some(parent_id) = entry.parent() {
            if let Some(parent) = self.entry(parent_id) {
                parent.topology.lock().children.retain(|c| *c != id);
                let _ = parent.free(entry.range.0);
            }
        }
        self.handles.lock().free(id);
        Ok(())
    }

    /// Walks every live heap's range to find the one that owns `addr` —
    /// the sole means to attribute an address back to its heap.
    /// Prefers the most deeply nested match (a child's range is a subset
    /// of its parent's, so the first containing leaf found is exact).
    pub fn owner_of(&self, addr: usize) -> Option<HeapId> {
        let handles = self.handles.lock();
        let mut best: Option<(HeapId, usize)> = None;
        for (id, entry) in handles.iter() {
            if entry.contains(addr) {
                let span = entry.range.1.saturating_sub(entry.range.0);
                if best.map(|(_, b)| span < b).unwrap_or(true) {
                    best = Some((id, span));
                }
            }
        }
        best.map(|(id, _)| id)
    }

    pub fn name_of(&self, id: HeapId) -> Option<String> {
        self.entry(id).map(|e| e.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_range_is_contained_in_parent_range() {
        let mgr = HeapManager::new(64);
        let root = mgr.create_root("root", 16 * 1024, HeapKind::Exp, AllocationMode::FirstFit).unwrap();
        let child = mgr.create_child(root, "child", 1024, HeapKind::Exp, AllocationMode::FirstFit).unwrap();
        let root_entry = mgr.entry(root).unwrap();
        let child_entry = mgr.entry(child).unwrap();
        assert!(child_entry.start() >= root_entry.start());
        assert!(child_entry.end() <= root_entry.end());
    }

    #[test]
    fn owner_of_resolves_to_the_most_specific_heap() {
        let mgr = HeapManager::new(64);
        let root = mgr.create_root("root", 16 * 1024, HeapKind::Exp, AllocationMode::FirstFit).unwrap();
        let child = mgr.create_child(root, "child", 1024, HeapKind::Exp, AllocationMode::FirstFit).unwrap();
        let child_entry = mgr.entry(child).unwrap();
        let addr = child_entry.allocate(32, 8).unwrap();
        assert_eq!(mgr.owner_of(addr), Some(child));
    }

    #[test]
    fn destroy_drains_disposers_before_unlinking() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc as StdArc;

        struct Flag(StdArc<AtomicBool>);
        impl Disposer for Flag {
            fn dispose(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let mgr = HeapManager::new(64);
        let root = mgr.create_root("root", 4096, HeapKind::Exp, AllocationMode::FirstFit).unwrap();
        let fired = StdArc::new(AtomicBool::new(false));
        {
            let entry = mgr.entry(root).unwrap();
            entry.add_disposer(Box::new(Flag(fired.clone())));
        }
        mgr.destroy(root).unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert!(mgr.entry(root).is_none());
    }

    #[test]
    fn destroying_parent_recursively_destroys_children() {
        let mgr = HeapManager::new(64);
        let root = mgr.create_root("root", 16 * 1024, HeapKind::Exp, AllocationMode::FirstFit).unwrap();
        let child = mgr.create_child(root, "child", 1024, HeapKind::Exp, AllocationMode::FirstFit).unwrap();
        mgr.destroy(root).unwrap();
        assert!(mgr.entry(child).is_none());
        assert!(mgr.entry(root).is_none());
    }
}
