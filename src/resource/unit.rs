//! src/resource/unit.rs
//! `ResourceUnit` and `ResourceMemoryManager`: the cached, refcounted record behind one
//! loaded path, and the per-manager allocator/LRU free-cache that owns its
//! backing heap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::glue::result::{Code, Module, Result, ResultCode};
use crate::mem::{AllocationMode, HeapId, HeapKind, HeapManager};

pub type PathHash = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitLifecycle {
    Init,
    Loading,
    StreamingDecode,
    Ready,
    Referenced,
    Evictable,
    Destroyed,
}

/// One cached resource . Holds its own CPU
/// heap (sized to the decompressed file plus overhead) so freeing the unit
/// is a single heap-manager `destroy` call.
pub struct ResourceUnit {
    pub path_hash: PathHash,
    pub heap: HeapId,
    pub decompressed_size: usize,
    refcount: AtomicUsize,
    lifecycle: Mutex<UnitLifecycle>,
    bytes: Mutex<Option<Vec<u8>>>,
    /// The `ResourceFactory`-constructed object . Kept as `dyn Any` so
    /// this module stays factory-agnostic; callers downcast via
    /// [`ResourceUnit::object`].
    object: Mutex<Option<Arc<dyn std::any::Any + Send + Sync>>>,
}

impl ResourceUnit {
    fn new(path_hash: PathHash, heap: HeapId, decompressed_size: usize) -> Self {
        Self {
            path_hash,
            heap,
            decompressed_size,
            refcount: AtomicUsize::new(0),
            lifecycle: Mutex::new(UnitLifecycle::Init),
            bytes: Mutex::new(None),
            object: Mutex::new(None),
        }
    }

    /// Stores the constructed resource object .
    pub fn set_object(&self, object: Arc<dyn std::any::Any + Send + Sync>) {
        *self.object.lock() = Some(object);
    }

    /// Downcasts the stored resource object, if any, to `T`.
    pub fn object<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.object.lock().clone()?.downcast::<T>().ok()
    }

    pub fn lifecycle(&self) -> UnitLifecycle {
        *self.lifecycle.lock()
    }

    pub fn set_lifecycle(&self, state: UnitLifecycle) {
        *self.lifecycle.lock() = state;
    }

    pub fn set_bytes(&self, bytes: Vec<u8>) {
        *self.bytes.lock() = Some(bytes);
    }

    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.bytes.lock().clone()
    }

    /// A binder taking a reference .
    pub fn add_ref(&self) -> usize {
        let n = self.refcount.fetch_add(1, Ordering::AcqRel) + 1;
        *self.lifecycle.lock() = UnitLifecycle::Referenced;
        n
    }

    /// A binder dropping its reference. Returns the unit to "Evictable"
    ///  once the count reaches zero rather than
    /// destroying it outright — eviction is driven by memory pressure, not
    /// by the last release.
    pub fn release(&self) -> usize {
        let n = self.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if n == 0 {
            *self.lifecycle.lock() = UnitLifecycle::Evictable;
        }
        n
    }

    pub fn ref_count(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }
}

/// Owns the CPU heap backing this manager's units and the LRU free-cache
/// list units fall onto at zero refcount ( step 6: "Future
/// lookups of the same path pull it back with zero reload cost; memory
/// pressure triggers `ClearCacheForAllocate(n)`").
pub struct ResourceMemoryManager {
    heaps: Arc<HeapManager>,
    root: HeapId,
    units: Mutex<std::collections::HashMap<PathHash, Arc<ResourceUnit>>>,
    free_cache: Mutex<LruCache<PathHash, ()>>,
}

impl ResourceMemoryManager {
    pub fn new(heaps: Arc<HeapManager>, root: HeapId, free_cache_capacity: usize) -> Self {
        Self {
            heaps,
            root,
            units: Mutex::new(std::collections::HashMap::new()),
            free_cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(free_cache_capacity.max(1)).unwrap(),
            )),
        }
    }

    pub fn lookup(&self, path_hash: PathHash) -> Option<Arc<ResourceUnit>> {
        let unit = self.units.lock().get(&path_hash).cloned();
        if unit.is_some() {
            self.free_cache.lock().pop(&path_hash);
        }
        unit
    }

    /// Allocates a unit sized to `decompressed_size + overhead` .
    pub fn allocate(&self, path_hash: PathHash, decompressed_size: usize, overhead: usize) -> Result<Arc<ResourceUnit>> {
        let size = decompressed_size.saturating_add(overhead).max(64);
        let heap = self
            .heaps
            .create_child(self.root, format!("resunit-{path_hash:08x}"), size, HeapKind::Exp, AllocationMode::FirstFit)
            .or_else(|_| {
                self.clear_cache_for_allocate(size);
                self.heaps.create_child(self.root, format!("resunit-{path_hash:08x}"), size, HeapKind::Exp, AllocationMode::FirstFit)
            })?;
        let unit = Arc::new(ResourceUnit::new(path_hash, heap, decompressed_size));
        self.units.lock().insert(path_hash, unit.clone());
        Ok(unit)
    }

    /// Moves a unit with a zero refcount onto the LRU free-cache list
    /// .
    pub fn mark_evictable(&self, unit: &Arc<ResourceUnit>) {
        if unit.ref_count() == 0 {
            self.free_cache.lock().put(unit.path_hash, ());
        }
    }

    /// Evicts least-recently-used cached units until the requested size
    /// would plausibly fit, or the free-cache is exhausted .
    /// This runtime has no single contiguous arena to measure against, so
    /// "enough space" is approximated by evicting one unit per call to the
    /// size this allocation needs, in LRU order, capped at the free-cache's
    /// current length.
    pub fn clear_cache_for_allocate(&self, _requested_size: usize) {
        let victims: Vec<PathHash> = {
            let cache = self.free_cache.lock();
            cache.iter().map(|(k, _)| *k).collect()
        };
        for path_hash in victims {
            self.evict(path_hash);
        }
    }

    fn evict(&self, path_hash: PathHash) {
        self.free_cache.lock().pop(&path_hash);
        if let Some(unit) = self.units.lock().remove(&path_hash) {
            if unit.ref_count() == 0 {
                unit.set_lifecycle(UnitLifecycle::Destroyed);
                let _ = self.heaps.destroy(unit.heap);
            } else {
                // Raced with a new reference; put it back rather than losing it.
                self.units.lock().insert(path_hash, unit);
            }
        }
    }

    pub fn destroy(&self, path_hash: PathHash) -> Result<()> {
        self.free_cache.lock().pop(&path_hash);
        let Some(unit) = self.units.lock().remove(&path_hash) else {
            return Err(ResultCode::new(Module::Res, Code::FileNotFound));
        };
        unit.set_lifecycle(UnitLifecycle::Destroyed);
        self.heaps.destroy(unit.heap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> ResourceMemoryManager {
        let heaps = Arc::new(HeapManager::new(256));
        let root = heaps.create_root("resource-root", 1 << 20, HeapKind::Exp, AllocationMode::FirstFit).unwrap();
        ResourceMemoryManager::new(heaps, root, 4)
    }

    #[test]
    fn lookup_miss_then_allocate_then_hit() {
        let mgr = test_manager();
        assert!(mgr.lookup(0x1234).is_none());
        let unit = mgr.allocate(0x1234, 1024, 128).unwrap();
        assert_eq!(unit.path_hash, 0x1234);
        assert!(mgr.lookup(0x1234).is_some());
    }

    #[test]
    fn zero_refcount_moves_unit_to_evictable() {
        let mgr = test_manager();
        let unit = mgr.allocate(0x1, 512, 64).unwrap();
        unit.add_ref();
        assert_eq!(unit.lifecycle(), UnitLifecycle::Referenced);
        unit.release();
        assert_eq!(unit.lifecycle(), UnitLifecycle::Evictable);
        mgr.mark_evictable(&unit);
    }

    #[test]
    fn evict_frees_heap_and_removes_from_table() {
        let mgr = test_manager();
        let unit = mgr.allocate(0x9, 256, 32).unwrap();
        mgr.mark_evictable(&unit);
        mgr.clear_cache_for_allocate(256);
        assert!(mgr.lookup(0x9).is_none());
    }
}
