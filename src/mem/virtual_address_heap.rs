//! src/mem/virtual_address_heap.rs
//! Host-OS reserve/commit heap . Small
//! allocations (≤ 64 KiB) are packed into 64 KiB regions shared by up to 8
//! allocations; large allocations get their own `memmap2` mapping and are
//! tracked in an address-ordered map.

use std::collections::HashMap;

use memmap2::MmapMut;

use crate::glue::result::{Code, Module, ResultCode};
use crate::l0::intrusive::AddressOrderedMap;

pub const SMALL_REGION_SIZE: usize = 64 * 1024;
pub const SMALL_REGION_SLOTS: usize = 16;
pub const SMALL_REGION_MAX_ALLOCS: usize = 8;
const SMALL_ALLOC_THRESHOLD: usize = SMALL_REGION_SIZE;

struct SmallRegion {
    mapping: MmapMut,
    base: usize,
    /// One bit per page-sized slot, set while occupied.
    bitmap: u16,
    /// Per-allocation (offset, size) table, up to `SMALL_REGION_MAX_ALLOCS`
    /// entries (spec: "8-entry per-allocation size table").
    sizes: HashMap<usize, usize>,
}

impl SmallRegion {
    fn new() -> std::io::Result<Self> {
        let mapping = MmapMut::map_anon(SMALL_REGION_SIZE)?;
        let base = mapping.as_ptr() as usize;
        Ok(Self {
            mapping,
            base,
            bitmap: 0,
            sizes: HashMap::new(),
        })
    }

    fn slot_size(&self) -> usize {
        SMALL_REGION_SIZE / SMALL_REGION_SLOTS
    }

    fn alloc_count(&self) -> usize {
        self.sizes.len()
    }

    fn try_allocate(&mut self, size: usize) -> Option<usize> {
        if self.alloc_count() >= SMALL_REGION_MAX_ALLOCS {
            return None;
        }
        let slot_size = self.slot_size();
        let slots_needed = size.div_ceil(slot_size).max(1);
        if slots_needed > SMALL_REGION_SLOTS {
            return None;
        }
        for start in 0..=(SMALL_REGION_SLOTS - slots_needed) {
            let mask = ((1u32 << slots_needed) - 1) << start;
            if self.bitmap as u32 & mask == 0 {
                self.bitmap |= mask as u16;
                let offset = self.base + start * slot_size;
                self.sizes.insert(offset, size);
                return Some(offset);
            }
        }
        None
    }

    fn owns(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + SMALL_REGION_SIZE
    }

    fn free(&mut self, addr: usize) -> bool {
        let Some(size) = self.sizes.remove(&addr) else {
            return false;
        };
        let slot_size = self.slot_size();
        let slots = size.div_ceil(slot_size).max(1);
        let start = (addr - self.base) / slot_size;
        let mask = ((1u32 << slots) - 1) << start;
        self.bitmap &= !(mask as u16);
        true
    }
}

struct LargeAllocation {
    mapping: MmapMut,
    size: usize,
}

pub struct VirtualAddressHeap {
    small_regions: Vec<SmallRegion>,
    large: AddressOrderedMap<usize, LargeAllocation>,
}

impl VirtualAddressHeap {
    pub fn new() -> Self {
        Self {
            small_regions: Vec::new(),
            large: AddressOrderedMap::new(),
        }
    }

    pub fn allocate(&mut self, size: usize) -> crate::glue::result::Result<usize> {
        if size == 0 {
            return Err(ResultCode::new(Module::Mem, Code::OutOfMemory));
        }
        if size <= SMALL_ALLOC_THRESHOLD {
            for region in self.small_regions.iter_mut() {
                if let Some(addr) = region.try_allocate(size) {
                    return Ok(addr);
                }
            }
            let mut region = SmallRegion::new().map_err(|_| ResultCode::new(Module::Mem, Code::OutOfMemory))?;
            let addr = region
                .try_allocate(size)
                .ok_or(ResultCode::new(Module::Mem, Code::OutOfMemory))?;
            self.small_regions.push(region);
            Ok(addr)
        } else {
            let mapping = MmapMut::map_anon(size).map_err(|_| ResultCode::new(Module::Mem, Code::OutOfMemory))?;
            let addr = mapping.as_ptr() as usize;
            self.large.insert(addr, LargeAllocation { mapping, size });
            Ok(addr)
        }
    }

    pub fn free(&mut self, addr: usize) -> crate::glue::result::Result<()> {
        if let Some(region) = self.small_regions.iter_mut().find(|r| r.owns(addr)) {
            return if region.free(addr) {
                Ok(())
            } else {
                Err(ResultCode::new(Module::Mem, Code::AddressNotInHeap))
            };
        }
        if self.large.remove(&addr).is_some() {
            Ok(())
        } else {
            Err(ResultCode::new(Module::Mem, Code::AddressNotInHeap))
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.small_regions.iter().any(|r| r.owns(addr)) || self.large.contains_key(&addr)
    }
}

impl Default for VirtualAddressHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocations_share_a_region_until_saturated() {
        let mut heap = VirtualAddressHeap::new();
        let mut ptrs = Vec::new();
        for _ in 0..SMALL_REGION_MAX_ALLOCS {
            ptrs.push(heap.allocate(1024).unwrap());
        }
        assert_eq!(heap.small_regions.len(), 1);
        // A 9th allocation must open a new region (old one saturated).
        ptrs.push(heap.allocate(1024).unwrap());
        assert_eq!(heap.small_regions.len(), 2);
        for p in ptrs {
            heap.free(p).unwrap();
        }
    }

    #[test]
    fn large_allocations_tracked_individually() {
        let mut heap = VirtualAddressHeap::new();
        let addr = heap.allocate(SMALL_REGION_SIZE + 1).unwrap();
        assert!(heap.contains(addr));
        heap.free(addr).unwrap();
        assert!(!heap.contains(addr));
    }

    #[test]
    fn freeing_unknown_address_fails() {
        let mut heap = VirtualAddressHeap::new();
        assert!(heap.free(0xdead_beef).is_err());
    }
}
