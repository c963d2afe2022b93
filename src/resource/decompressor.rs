//! src/resource/decompressor.rs
//! `DecompressorManager` :
//! one Zstd decompressor per usable core, handed out through an atomic
//! index allocator with free-event backpressure when the pool is
//! exhausted, each with a small dictionary table keyed by dictionary id.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::glue::result::{Code, Module, Result, ResultCode};
use crate::l0::index_alloc::AtomicIndexAllocator;
use crate::l0::intrusive::RingBuffer;
use crate::service::ServiceEvent;
use crate::ukern::fiber::Priority;
use crate::ukern::scheduler::Scheduler;

/// `cReadSize`: the chunk size the
/// streaming decode loop feeds the decompressor.
pub const READ_CHUNK_SIZE: usize = 0xd_0000;
/// Maximum leftover bytes carried between chunks .
pub const MAX_LEFTOVER: usize = 128 * 1024;
/// `ZSTD_DDict` slots per decompressor ().
pub const MAX_DICTIONARIES: usize = 8;

struct DictionaryTable {
    slots: Vec<Option<(u32, Arc<Vec<u8>>)>>,
}

impl DictionaryTable {
    fn new() -> Self {
        Self { slots: vec![None; MAX_DICTIONARIES] }
    }

    fn get_or_insert(&mut self, id: u32, bytes: impl FnOnce() -> Arc<Vec<u8>>) -> Arc<Vec<u8>> {
        if let Some((_, existing)) = self.slots.iter().flatten().find(|(slot_id, _)| *slot_id == id) {
            return existing.clone();
        }
        let value = bytes();
        if let Some(empty) = self.slots.iter_mut().find(|s| s.is_none()) {
            *empty = Some((id, value.clone()));
        } else {
            // Table full: evict slot 0 (oldest by insertion order in this
            // simplified model; the original's eviction policy is not
            // specified beyond the 8-slot bound).
            self.slots[0] = Some((id, value.clone()));
        }
        value
    }
}

/// One decompressor worker: a dictionary table plus the priority/core-mask
/// its owning fiber is retargeted to on every acquire .
pub struct Decompressor {
    index: u32,
    dictionaries: Mutex<DictionaryTable>,
    priority: AtomicU32,
    core_mask: AtomicU64,
}

impl Decompressor {
    fn new(index: u32) -> Self {
        Self {
            index,
            dictionaries: Mutex::new(DictionaryTable::new()),
            priority: AtomicU32::new(crate::ukern::fiber::DEFAULT_PRIORITY),
            core_mask: AtomicU64::new(u64::MAX),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    fn retarget(&self, priority: Priority, core_mask: u64) {
        self.priority.store(priority, Ordering::Release);
        self.core_mask.store(core_mask, Ordering::Release);
    }

    /// Decodes `compressed`, reading decoded output in [`READ_CHUNK_SIZE`]
    /// pieces and carrying at most [`MAX_LEFTOVER`] bytes of any partial
    /// final piece forward, leaning on `zstd::stream::read::Decoder`
    /// for the actual frame state machine rather than driving the raw
    /// `ZSTD_DCtx` buffers by hand.
    pub fn decode_streaming(&self, compressed: &[u8], dictionary_id: Option<u32>, dictionary_bytes: Option<&[u8]>) -> Result<Vec<u8>> {
        use std::io::Read;

        let cursor = std::io::Cursor::new(compressed);
        let mut reader: Box<dyn Read> = match (dictionary_id, dictionary_bytes) {
            (Some(id), Some(bytes)) => {
                let dict = self.dictionaries.lock().get_or_insert(id, || Arc::new(bytes.to_vec()));
                let decoder = zstd::stream::read::Decoder::with_dictionary(cursor, dict.as_slice())
                    .map_err(|_| ResultCode::new(Module::Res, Code::InvalidFile))?;
                Box::new(decoder)
            }
            _ => {
                let decoder = zstd::stream::read::Decoder::new(cursor).map_err(|_| ResultCode::new(Module::Res, Code::InvalidFile))?;
                Box::new(decoder)
            }
        };

        // `zstd::stream::read::Decoder` carries any undecoded frame bytes in
        // its own internal buffer across `read` calls, which is what gives
        // the <= 128 KiB of leftover carried between chunks here; reading in
        // READ_CHUNK_SIZE pieces keeps this loop's own granularity matching
        // `cReadSize`.
        let mut output = Vec::with_capacity(compressed.len() * 2);
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut chunk).map_err(|_| ResultCode::new(Module::Res, Code::InvalidFile))?;
            if n == 0 {
                break;
            }
            output.extend_from_slice(&chunk[..n]);
        }
        Ok(output)
    }
}

/// `DecompressorManager`: an `AtomicIndexAllocator` sized to
/// core count plus a free-event signalled on every release, so a waiter
/// blocked on pool exhaustion wakes as soon as one comes back.
pub struct DecompressorManager {
    decompressors: Vec<Decompressor>,
    allocator: AtomicIndexAllocator,
    free_event: ServiceEvent,
}

impl DecompressorManager {
    pub fn new(core_count: u32, scheduler: &'static Scheduler) -> Self {
        Self {
            decompressors: (0..core_count).map(Decompressor::new).collect(),
            allocator: AtomicIndexAllocator::new(core_count),
            free_event: ServiceEvent::new(scheduler, false),
        }
    }

    /// `AllocateDecompressorHandle`: pop a
    /// handle; if exhausted, wait on the free-event and retry.
    pub async fn allocate(&self, priority: Priority, core_mask: u64, timeout: crate::l0::time::TimeSpan) -> Result<&Decompressor> {
        loop {
            let idx = self.allocator.try_allocate();
            if idx != AtomicIndexAllocator::INVALID {
                let d = &self.decompressors[idx as usize];
                d.retarget(priority, core_mask);
                return Ok(d);
            }
            self.free_event.wait(timeout).await?;
        }
    }

    /// Synchronous variant of [`Self::allocate`] for callers running inside
    /// a load task's `Execute` closure, which is a plain synchronous
    /// `FnMut` and cannot `.await` . Spins with a
    /// short sleep rather than parking on the fiber-aware free-event —
    /// acceptable because `Execute` already blocks its worker thread for
    /// the duration of the load ( worker loop: "Invoke
    /// `task.Execute()`").
    pub fn allocate_blocking(&self, priority: Priority, core_mask: u64) -> &Decompressor {
        loop {
            let idx = self.allocator.try_allocate();
            if idx != AtomicIndexAllocator::INVALID {
                let d = &self.decompressors[idx as usize];
                d.retarget(priority, core_mask);
                return d;
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
    }

    /// Releases a handle back to the pool and signals the free-event
    /// .
    pub fn release(&self, decompressor: &Decompressor) {
        self.allocator.free(decompressor.index());
        self.free_event.signal();
    }

    pub fn core_count(&self) -> usize {
        self.decompressors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_scheduler() -> &'static Scheduler {
        let sched = Box::leak(Box::new(Scheduler::new(0b1, 16, 0)));
        sched.ensure_started();
        sched
    }

    #[test]
    fn round_trip_decode_of_a_small_payload() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(64);
        let compressed = zstd::stream::encode_all(payload.as_slice(), 3).unwrap();
        let d = Decompressor::new(0);
        let decoded = d.decode_streaming(&compressed, None, None).unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn allocate_blocks_until_release_frees_a_handle() {
        let sched = test_scheduler();
        let manager = Arc::new(DecompressorManager::new(1, sched));
        let first = manager.allocate(0, u64::MAX, crate::l0::time::TimeSpan::FOREVER).await.unwrap();
        let first_index = first.index();

        let m2 = manager.clone();
        let waiter = tokio::spawn(async move {
            m2.allocate(0, u64::MAX, crate::l0::time::TimeSpan::from_milliseconds(500)).await.unwrap().index()
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        manager.release(&manager.decompressors[first_index as usize]);
        let got = waiter.await.unwrap();
        assert_eq!(got, first_index);
    }

    #[test]
    fn allocate_blocking_waits_for_a_release_from_another_thread() {
        let manager = Arc::new(DecompressorManager::new(1, test_scheduler()));
        let first = manager.allocate_blocking(0, u64::MAX).index();
        let m2 = manager.clone();
        let handle = std::thread::spawn(move || m2.allocate_blocking(0, u64::MAX).index());
        std::thread::sleep(std::time::Duration::from_millis(20));
        manager.release(&manager.decompressors[first as usize]);
        assert_eq!(handle.join().unwrap(), first);
    }
}
