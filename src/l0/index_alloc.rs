//! src/l0/index_alloc.rs
//! Fixed-capacity generational index allocators and handle tables.
//!
//! Grounded in the resource manager's `Handle` (index in the low bits,
//! generation in the high bits — see `resource_manager.rs::Handle`) and in
//! hubris's `TaskID` (`kern/src/task.rs`), which combines a table index with
//! a generation counter so a stale reference to a recycled slot is
//! detectable rather than silently aliasing a new occupant.
//!
//! This is the mechanism the section asks for everywhere a
//! raw back-pointer would otherwise be used: an `(index, generation)` pair
//! plus a slot table, instead of an intrusive pointer.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// A 32-bit handle: low 24 bits are the slot index, high 8 bits are the
/// generation. Matches the shape of `resource_manager::Handle` but is
/// reusable by any fixed-capacity table (fiber handle table, resource unit
/// allocator, GPU handle pools, ...).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Handle(u32);

impl Handle {
    pub const INVALID: Handle = Handle(u32::MAX);

    #[inline]
    pub const fn new(index: u32, generation: u8) -> Self {
        Handle((index & 0x00FF_FFFF) | ((generation as u32) << 24))
    }

    #[inline]
    pub const fn index(self) -> usize {
        (self.0 & 0x00FF_FFFF) as usize
    }

    #[inline]
    pub const fn generation(self) -> u8 {
        ((self.0 >> 24) & 0xFF) as u8
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Reconstructs a `Handle` from a raw packed value previously obtained
    /// via [`Self::raw`] — used where the raw value round-trips through a
    /// plain `AtomicU32` (the mutex word, the futex key) and must be turned
    /// back into a `Handle` for a handle-table lookup.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle(idx={}, gen={})", self.index(), self.generation())
    }
}

/// A fixed-capacity table mapping handles to slots of `T`, with free-slot
/// reuse and generation bumping on every reuse so a handle captured before a
/// slot was freed can never alias the new occupant.
///
/// Used for the UKern fiber handle table (default capacity 256)
/// and for any other bounded pool that must hand out stable, ABA-safe
/// identifiers (resource unit allocator, decompressor handle pool).
pub struct HandleTable<T> {
    slots: Vec<Option<T>>,
    generations: Vec<AtomicU8>,
    free_list: Vec<u32>,
}

impl<T> HandleTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut generations = Vec::with_capacity(capacity);
        let mut free_list = Vec::with_capacity(capacity);
        let mut slots = Vec::with_capacity(capacity);
        for i in (0..capacity).rev() {
            generations.push(AtomicU8::new(0));
            free_list.push(i as u32);
            slots.push(None);
        }
        Self {
            slots,
            generations,
            free_list,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Allocate a slot, returning its handle at the bumped generation, or
    /// `None` if the table is exhausted (the scheduler never grows this
    /// table at runtime —: "all tables are fixed-capacity").
    pub fn allocate(&mut self, value: T) -> Option<Handle> {
        let idx = self.free_list.pop()?;
        // Generation is kept to 7 bits (wraps at 128, not 256) so that
        // `Handle::raw()` never sets bit 31. That leaves bit 31 free for
        // `ukern::mutex::Mutex` to use as its "has waiters" flag when a
        // handle's raw value is stored directly in the lock word — see
        // DESIGN.md's note on the mutex word layout.
        let gen = (self.generations[idx as usize].fetch_add(1, Ordering::AcqRel).wrapping_add(1)) & 0x7F;
        self.slots[idx as usize] = Some(value);
        Some(Handle::new(idx, gen))
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        if !handle.is_valid() {
            return None;
        }
        let idx = handle.index();
        if idx >= self.slots.len() {
            return None;
        }
        if self.generations[idx].load(Ordering::Acquire) != handle.generation() {
            return None;
        }
        self.slots[idx].as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        if !handle.is_valid() {
            return None;
        }
        let idx = handle.index();
        if idx >= self.slots.len() {
            return None;
        }
        if self.generations[idx].load(Ordering::Acquire) != handle.generation() {
            return None;
        }
        self.slots[idx].as_mut()
    }

    /// Release a slot back to the free list, returning its last value.
    /// Bumps the generation again on next allocate, so a handle to the slot
    /// freed here is invalid even before the slot is reused.
    pub fn free(&mut self, handle: Handle) -> Option<T> {
        if !handle.is_valid() {
            return None;
        }
        let idx = handle.index();
        if idx >= self.slots.len() {
            return None;
        }
        if self.generations[idx].load(Ordering::Acquire) != handle.generation() {
            return None;
        }
        let value = self.slots[idx].take();
        self.free_list.push(idx as u32);
        value
    }

    /// Iterates every occupied slot as `(handle, &value)`, for callers that
    /// must scan the whole table (e.g. `HeapManager::owner_of` attributing
    /// an address back to its heap).
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| {
            slot.as_ref().map(|v| {
                let gen = self.generations[idx].load(Ordering::Acquire);
                (Handle::new(idx as u32, gen), v)
            })
        })
    }
}

/// A lock-free single-slot-at-a-time index allocator backed by atomics, used
/// by the decompressor pool . Unlike [`HandleTable`] this hands out raw indices with
/// no generation or payload — callers pair it with their own fixed array.
pub struct AtomicIndexAllocator {
    free_list: crossbeam::queue::ArrayQueue<u32>,
}

impl AtomicIndexAllocator {
    pub const INVALID: u32 = u32::MAX;

    pub fn new(count: u32) -> Self {
        let free_list = crossbeam::queue::ArrayQueue::new(count.max(1) as usize);
        for i in 0..count {
            let _ = free_list.push(i);
        }
        Self { free_list }
    }

    pub fn try_allocate(&self) -> u32 {
        self.free_list.pop().unwrap_or(Self::INVALID)
    }

    pub fn free(&self, index: u32) {
        let _ = self.free_list.push(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut table: HandleTable<u32> = HandleTable::with_capacity(4);
        let h1 = table.allocate(10).unwrap();
        assert_eq!(table.get(h1), Some(&10));

        table.free(h1);
        let h2 = table.allocate(20).unwrap();

        // Same slot index, different generation.
        assert_eq!(h1.index(), h2.index());
        assert_ne!(h1.generation(), h2.generation());
        assert_eq!(table.get(h1), None);
        assert_eq!(table.get(h2), Some(&20));
    }

    #[test]
    fn exhaustion_returns_none_never_grows() {
        let mut table: HandleTable<u32> = HandleTable::with_capacity(2);
        assert!(table.allocate(1).is_some());
        assert!(table.allocate(2).is_some());
        assert!(table.allocate(3).is_none());
        assert_eq!(table.capacity(), 2);
    }

    #[test]
    fn atomic_index_allocator_round_trips() {
        let alloc = AtomicIndexAllocator::new(2);
        let a = alloc.try_allocate();
        let b = alloc.try_allocate();
        assert_ne!(a, AtomicIndexAllocator::INVALID);
        assert_ne!(b, AtomicIndexAllocator::INVALID);
        assert_eq!(alloc.try_allocate(), AtomicIndexAllocator::INVALID);
        alloc.free(a);
        assert_ne!(alloc.try_allocate(), AtomicIndexAllocator::INVALID);
    }
}
