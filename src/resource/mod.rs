//! src/resource/mod.rs
//! The resource pipeline: ties [`unit`], [`extension_manager`],
//! [`size_table`], [`decompressor`], and [`binder`] to the async task
//! engine and the file-device layer through [`AsyncResourceManager`], whose
//! [`AsyncResourceManager::load`] is the load task: device lookup
//! → read → size-table consult → decompressor-selected decode → resource
//! factory invocation → binder completion.

pub mod binder;
pub mod decompressor;
pub mod extension_manager;
pub mod size_table;
pub mod unit;

pub use binder::{ResourceBinder, Status as BinderStatus};
pub use decompressor::{Decompressor, DecompressorManager};
pub use extension_manager::{ExtensionEntry, ExtensionManager};
pub use size_table::{ResourceSizeTableManager, SizeTable, INVALID_SIZE};
pub use unit::{PathHash, ResourceMemoryManager, ResourceUnit, UnitLifecycle};

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::async_task::queue::{AsyncQueue, PushInfo};
use crate::async_task::task::{CancelFlag, TaskFn};
use crate::file_device::archive::BeaCompression;
use crate::file_device::{hash_path, FileDeviceManager};
use crate::glue::result::{Code, Module, Result as UResult, ResultCode};
use crate::mem::HeapManager;
use crate::ukern::fiber::Priority;
use crate::ukern::scheduler::Scheduler;

/// Per-extension hook constructing a typed resource from a unit's raw
/// bytes ( step 4 "Ready": "The `ResourceFactory` for the
/// extension constructs a `Resource` from the raw bytes, calls
/// `OnFileLoad(heap, bytes, size)`"). A missing factory for a registered
/// extension surfaces as `res::NullResourceFactory` .
pub trait ResourceFactory: Send + Sync {
    fn on_file_load(&self, bytes: &[u8]) -> UResult<Arc<dyn Any + Send + Sync>>;
}

/// Configuration surface: control/memory/
/// load thread priorities, the queue shape those threads run on, and the
/// decompressor pool's core count.
pub struct AsyncResourceManagerConfig {
    pub control_thread_priority: Priority,
    pub memory_thread_priority: Priority,
    pub load_threads_priority: Priority,
    pub queue_priority_levels: usize,
    pub queue_max_tasks: usize,
    pub requests_per_yield: u32,
    pub decompressor_core_count: u32,
    pub free_cache_capacity: usize,
}

impl Default for AsyncResourceManagerConfig {
    fn default() -> Self {
        Self {
            control_thread_priority: crate::ukern::fiber::DEFAULT_PRIORITY,
            memory_thread_priority: crate::ukern::fiber::DEFAULT_PRIORITY,
            load_threads_priority: crate::ukern::fiber::DEFAULT_PRIORITY,
            queue_priority_levels: 4,
            queue_max_tasks: 512,
            requests_per_yield: 8,
            decompressor_core_count: 4,
            free_cache_capacity: 256,
        }
    }
}

/// Ties the file-device layer, extension manager, size-table manager,
/// decompressor pool and async task engine together behind one load entry
/// point . This is the crate's `AsyncResourceManager`: the
/// section retires the original's global singleton of the
/// same name in favor of an explicit instance threaded through
/// [`crate::Runtime`].
pub struct AsyncResourceManager {
    heaps: Arc<HeapManager>,
    devices: Arc<FileDeviceManager>,
    extensions: Mutex<ExtensionManager>,
    size_tables: Mutex<ResourceSizeTableManager>,
    decompressors: Arc<DecompressorManager>,
    queue: Arc<AsyncQueue>,
    load_priority: Priority,
    factories: Mutex<HashMap<String, Arc<dyn ResourceFactory>>>,
}

impl AsyncResourceManager {
    pub fn new(
        heaps: Arc<HeapManager>,
        devices: Arc<FileDeviceManager>,
        extensions: ExtensionManager,
        size_tables: ResourceSizeTableManager,
        scheduler: &'static Scheduler,
        config: AsyncResourceManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            heaps,
            devices,
            extensions: Mutex::new(extensions),
            size_tables: Mutex::new(size_tables),
            decompressors: Arc::new(DecompressorManager::new(config.decompressor_core_count, scheduler)),
            queue: Arc::new(AsyncQueue::new(config.queue_priority_levels, config.queue_max_tasks, config.requests_per_yield)),
            load_priority: config.load_threads_priority,
            factories: Mutex::new(HashMap::new()),
        })
    }

    pub fn queue(&self) -> &Arc<AsyncQueue> {
        &self.queue
    }

    pub fn heaps(&self) -> &Arc<HeapManager> {
        &self.heaps
    }

    pub fn devices(&self) -> &Arc<FileDeviceManager> {
        &self.devices
    }

    pub fn decompressors(&self) -> &Arc<DecompressorManager> {
        &self.decompressors
    }

    /// Registers the factory invoked for every extension's "Ready" step
    /// . `extension` is matched the same way
    /// [`ExtensionManager::get_resource_unit_manager`] strips it (text
    /// after the final `.`).
    pub fn register_factory(&self, extension: impl Into<String>, factory: Arc<dyn ResourceFactory>) {
        self.factories.lock().insert(extension.into(), factory);
    }

    fn extension_of(path: &str) -> &str {
        path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
    }

    /// "Load task": pushes a load onto the async engine and
    /// returns the caller-visible [`ResourceBinder`] immediately. Mirrors
    /// `FormatPushInfo` taking a reference on `archive_binder` (if any)
    /// synchronously, before the task is even queued, so the archive
    /// cannot be unloaded mid-load; the reference is held by the task
    /// closure itself and drops when `Execute` returns (`OnFinishExecute`).
    pub fn load(
        self: &Arc<Self>,
        path: impl Into<String>,
        priority: Option<Priority>,
        archive_binder: Option<Arc<ResourceBinder>>,
    ) -> Arc<ResourceBinder> {
        let path = path.into();
        let binder = ResourceBinder::new();
        if !binder.begin_load() {
            return binder;
        }

        let mgr = self.clone();
        let task_binder = binder.clone();
        // Held by the closure for the task's whole lifetime; dropped
        // (releasing the reference) the instant `Execute` returns.
        let _archive_ref = archive_binder.as_ref().map(|b| b.watcher().reference());
        let priority = priority.unwrap_or(self.load_priority).min(self.queue.level_count() as u32 - 1);

        let task_fn: TaskFn = Box::new(move |cancel: &CancelFlag| {
            let _keep_archive_alive = &_archive_ref;
            mgr.execute_load(&path, &task_binder, cancel)
        });

        match self.queue.push(PushInfo { priority, pinned_worker: None, task_fn, result_fn: None, sync: false }) {
            Ok(id) => {
                if let Some(task) = self.queue.task_finish_notify(id) {
                    binder.watcher().bind(task);
                }
            }
            Err(_) => binder.fail(BinderStatus::UnknownError),
        }
        binder
    }

    /// The load task's `Execute` body: device
    /// lookup, read, size-table consult, decompressor-selected decode,
    /// resource factory invocation, binder completion — in that order, any
    /// failure short-circuiting into the binder's status.
    fn execute_load(self: &Arc<Self>, path: &str, binder: &Arc<ResourceBinder>, cancel: &CancelFlag) -> UResult<()> {
        if cancel.requested() {
            binder.fail(BinderStatus::FileNotAvailable);
            return Err(ResultCode::new(Module::Res, Code::Cancelled));
        }

        let path_hash = hash_path(path);
        let unit_manager = self.extensions.lock().get_resource_unit_manager(path);

        if let Some(existing) = unit_manager.lookup(path_hash) {
            existing.add_ref();
            binder.complete(existing);
            return Ok(());
        }

        let mut file = self.devices.open_file(path).map_err(|_| {
            binder.fail(BinderStatus::FileNotFound);
            ResultCode::new(Module::Res, Code::FileNotFound)
        })?;

        let raw_size = file.size() as usize;
        let mut raw = vec![0u8; raw_size];
        let mut read = 0usize;
        while read < raw_size {
            let n = file.read(read as u64, &mut raw[read..]).map_err(|_| {
                binder.fail(BinderStatus::FileNotFound);
                ResultCode::new(Module::Res, Code::InvalidFile)
            })?;
            if n == 0 {
                break;
            }
            read += n;
        }
        raw.truncate(read);

        let compression = self.extensions.lock().get_compression_extension(path);
        let declared_size = self.size_tables.lock().lookup(path);
        let overhead = 4096;

        let decompressed = match compression {
            BeaCompression::None => raw,
            BeaCompression::Zlib => {
                binder.fail(BinderStatus::InvalidResourceSize);
                return Err(ResultCode::new(Module::Res, Code::InvalidFile));
            }
            BeaCompression::Zstandard => {
                let decompressor = self.decompressors.allocate_blocking(0, u64::MAX);
                let result = decompressor.decode_streaming(&raw, None, None);
                self.decompressors.release(decompressor);
                result.map_err(|e| {
                    binder.fail(BinderStatus::FailedToInitializeResource);
                    e
                })?
            }
        };

        if declared_size != INVALID_SIZE && declared_size as usize != decompressed.len() {
            binder.fail(BinderStatus::InvalidResourceSize);
            return Err(ResultCode::new(Module::Res, Code::InvalidBufferSize));
        }

        let unit = unit_manager.allocate(path_hash, decompressed.len(), overhead).map_err(|e| {
            binder.fail(BinderStatus::MemoryAllocationFailure);
            e
        })?;
        unit.set_lifecycle(UnitLifecycle::StreamingDecode);

        let factory = self.factories.lock().get(Self::extension_of(path)).cloned();
        if let Some(factory) = factory {
            match factory.on_file_load(&decompressed) {
                Ok(object) => unit.set_object(object),
                Err(_) => {
                    binder.fail(BinderStatus::FailedToInitializeResource);
                    return Err(ResultCode::new(Module::Res, Code::InvalidFile));
                }
            }
        }

        unit.set_bytes(decompressed);
        unit.set_lifecycle(UnitLifecycle::Ready);
        unit.add_ref();
        binder.complete(unit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_device::PhysicalFileDevice;
    use crate::mem::{AllocationMode, HeapKind};

    fn test_scheduler() -> &'static Scheduler {
        let sched = Box::leak(Box::new(Scheduler::new(0b1, 32, 0)));
        sched.ensure_started();
        sched
    }

    fn test_manager(root: &std::path::Path) -> Arc<AsyncResourceManager> {
        let heaps = Arc::new(HeapManager::new(256));
        let devices = Arc::new(FileDeviceManager::new());
        devices.register("content", Arc::new(PhysicalFileDevice::new(root)));
        let default_root = heaps.create_root("res-default", 1 << 20, HeapKind::Exp, AllocationMode::FirstFit).unwrap();
        let default_manager = Arc::new(ResourceMemoryManager::new(heaps.clone(), default_root, 16));
        let extensions = ExtensionManager::new(default_manager, vec![]);
        AsyncResourceManager::new(heaps, devices, extensions, ResourceSizeTableManager::new(), test_scheduler(), AsyncResourceManagerConfig::default())
    }

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("ukern-resource-test-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn load_of_an_uncompressed_file_completes_synchronously() {
        let dir = temp_dir("plain");
        std::fs::write(dir.join("a.bin"), b"hello resource pipeline").unwrap();
        let mgr = test_manager(&dir);

        let binder = mgr.load("content:a.bin", None, None);
        mgr.queue().force_calc_sync(mgr.queue().level_count() - 1);

        assert_eq!(binder.status(), BinderStatus::Referenced);
        let unit = binder.unit().unwrap();
        assert_eq!(unit.bytes().unwrap(), b"hello resource pipeline");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_of_a_missing_file_fails_the_binder() {
        let dir = temp_dir("missing");
        let mgr = test_manager(&dir);

        let binder = mgr.load("content:nope.bin", None, None);
        mgr.queue().force_calc_sync(mgr.queue().level_count() - 1);

        assert!(binder.is_failed());
        assert_eq!(binder.status(), BinderStatus::FileNotFound);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn double_load_of_the_same_path_is_coalesced_onto_one_unit() {
        let dir = temp_dir("coalesce");
        std::fs::write(dir.join("shared.bin"), b"shared payload").unwrap();
        let mgr = test_manager(&dir);

        let first = mgr.load("content:shared.bin", None, None);
        mgr.queue().force_calc_sync(mgr.queue().level_count() - 1);
        let second = mgr.load("content:shared.bin", None, None);
        mgr.queue().force_calc_sync(mgr.queue().level_count() - 1);

        assert!(Arc::ptr_eq(&first.unit().unwrap(), &second.unit().unwrap()));
        assert_eq!(first.unit().unwrap().ref_count(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }
}
