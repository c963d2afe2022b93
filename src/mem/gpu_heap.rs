//! src/mem/gpu_heap.rs
//! GPU-visible heap management, gated behind the `gpu` feature exactly like
//! this crate's own `wgpu` integration — a headless build (CI, the
//! fiber/heap unit tests) never needs a GPU adapter.
//!
//! Grounded on `gpu/resource_pool.rs` and `bind_group_manager.rs` for how
//! GPU-visible memory gets partitioned by access pattern, adapted here to
//! a root-context-per-property-class model instead of a descriptor-pool
//! model.

#![cfg(feature = "gpu")]

use crate::glue::result::{Code, Module, Result, ResultCode};
use crate::mem::exp_heap::{AllocationMode, ExpHeap};

/// The property classes `GpuHeapManager` keeps separate root contexts for
/// — CPU-cached and CPU-uncached mappings of system memory,
/// and GPU-local memory that is also CPU-uncached (the common "invisible"
/// VRAM heap). Each class gets up to [`MAX_ROOTS_PER_CLASS`] root heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyClass {
    CpuUncached,
    CpuCached,
    GpuUncachedCpuUncached,
}

pub const MAX_ROOTS_PER_CLASS: usize = 2;

/// A GPU-visible sub-heap. Internally this is the same explicit-free
/// algorithm as [`crate::mem::exp_heap::ExpHeap`] — `GpuExpHeap` differs
/// from `ExpHeap` only in that its backing range maps host-visible or
/// device-local GPU memory instead of plain system RAM, which at this layer
/// (address bookkeeping, no raw byte access) is not a distinction this
/// allocator needs to make.
pub struct GpuExpHeap {
    inner: ExpHeap,
    class: PropertyClass,
    /// Cache-coherency state is tracked rather than acted on here — actual
    /// flush/invalidate requires a device handle, which callers reach via
    /// `FlushCpuCache`/`InvalidateCpuCache` on the owning context, not on
    /// the heap itself.
    needs_flush: bool,
}

impl GpuExpHeap {
    pub fn new(base: usize, size: usize, class: PropertyClass, mode: AllocationMode) -> Self {
        Self {
            inner: ExpHeap::new(base, size, mode),
            class,
            needs_flush: false,
        }
    }

    pub fn class(&self) -> PropertyClass {
        self.class
    }

    pub fn allocate(&mut self, size: usize, align: usize) -> Result<usize> {
        let addr = self.inner.allocate(size, align)?;
        if matches!(self.class, PropertyClass::CpuCached) {
            self.needs_flush = true;
        }
        Ok(addr)
    }

    pub fn free(&mut self, addr: usize) -> Result<()> {
        self.inner.free(addr)
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.inner.contains(addr)
    }

    /// `needs_flush` latches true on every CPU-cached allocation and is
    /// cleared by `flush_cpu_cache` — callers must flush before handing an
    /// address to the GPU: CPU writes are not observable to the GPU until
    /// flushed.
    pub fn needs_flush(&self) -> bool {
        self.needs_flush
    }

    pub fn flush_cpu_cache(&mut self) {
        self.needs_flush = false;
    }
}

struct RootContext {
    class: PropertyClass,
    heaps: Vec<GpuExpHeap>,
}

/// Owns up to [`MAX_ROOTS_PER_CLASS`] root contexts per [`PropertyClass`],
/// so an allocation never straddles two cache-coherency domains.
pub struct GpuHeapManager {
    roots: std::collections::HashMap<PropertyClass, Vec<RootContext>>,
}

impl GpuHeapManager {
    pub fn new() -> Self {
        Self {
            roots: std::collections::HashMap::new(),
        }
    }

    pub fn create_root(&mut self, class: PropertyClass, size: usize, mode: AllocationMode) -> Result<()> {
        let roots = self.roots.entry(class).or_default();
        if roots.len() >= MAX_ROOTS_PER_CLASS {
            return Err(ResultCode::new(Module::Mem, Code::SectionExhaustion));
        }
        let base = crate::mem::heap::reserve_address_range(size);
        roots.push(RootContext {
            class,
            heaps: vec![GpuExpHeap::new(base, size, class, mode)],
        });
        Ok(())
    }

    pub fn allocate(&mut self, class: PropertyClass, size: usize, align: usize) -> Result<usize> {
        let roots = self
            .roots
            .get_mut(&class)
            .ok_or_else(|| ResultCode::new(Module::Mem, Code::OutOfMemory))?;
        for root in roots.iter_mut() {
            for heap in root.heaps.iter_mut() {
                if let Ok(addr) = heap.allocate(size, align) {
                    return Ok(addr);
                }
            }
        }
        Err(ResultCode::new(Module::Mem, Code::OutOfMemory))
    }

    pub fn free(&mut self, class: PropertyClass, addr: usize) -> Result<()> {
        let roots = self
            .roots
            .get_mut(&class)
            .ok_or_else(|| ResultCode::new(Module::Mem, Code::AddressNotInHeap))?;
        for root in roots.iter_mut() {
            for heap in root.heaps.iter_mut() {
                if heap.contains(addr) {
                    return heap.free(addr);
                }
            }
        }
        Err(ResultCode::new(Module::Mem, Code::AddressNotInHeap))
    }
}

impl Default for GpuHeapManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_round_trip() {
        let mut mgr = GpuHeapManager::new();
        mgr.create_root(PropertyClass::GpuUncachedCpuUncached, 64 * 1024, AllocationMode::FirstFit)
            .unwrap();
        let addr = mgr.allocate(PropertyClass::GpuUncachedCpuUncached, 256, 16).unwrap();
        mgr.free(PropertyClass::GpuUncachedCpuUncached, addr).unwrap();
    }

    #[test]
    fn cpu_cached_allocation_requires_flush_before_gpu_use() {
        let mut heap = GpuExpHeap::new(0, 4096, PropertyClass::CpuCached, AllocationMode::FirstFit);
        heap.allocate(64, 8).unwrap();
        assert!(heap.needs_flush());
        heap.flush_cpu_cache();
        assert!(!heap.needs_flush());
    }

    #[test]
    fn a_class_exhausts_after_max_roots() {
        let mut mgr = GpuHeapManager::new();
        for _ in 0..MAX_ROOTS_PER_CLASS {
            mgr.create_root(PropertyClass::CpuUncached, 4096, AllocationMode::FirstFit).unwrap();
        }
        assert!(mgr.create_root(PropertyClass::CpuUncached, 4096, AllocationMode::FirstFit).is_err());
    }
}
