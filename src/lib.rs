//! src/lib.rs
//! Crate root: wires every subsystem module together behind [`Runtime`], a
//! single explicit object threaded through initialization instead of a
//! scattered set of process-wide globals; see [`glue::singletons`]'s doc
//! comment for the one global that remains, the UKern scheduler itself.

pub mod async_task;
pub mod context;
pub mod error;
pub mod file_device;
pub mod glue;
pub mod l0;
pub mod mem;
pub mod resource;
pub mod service;
pub mod ukern;

use std::sync::Arc;

use crate::async_task::job_graph::DependencyJobThreadManager;
use crate::file_device::FileDeviceManager;
use crate::mem::{AllocationMode, HeapId, HeapKind, HeapManager};
use crate::resource::{AsyncResourceManager, AsyncResourceManagerConfig, ExtensionManager, ResourceMemoryManager, ResourceSizeTableManager};
use crate::service::ServiceThreadPool;
use crate::ukern::scheduler::Scheduler;

/// One `{arena, arena_size}` request for a root heap. Each entry in
/// [`HeapManagerConfig::roots`] becomes one call to
/// [`HeapManager::create_root`].
pub struct HeapRootSpec {
    pub name: String,
    pub arena_size: usize,
    pub kind: HeapKind,
    pub mode: AllocationMode,
}

/// Heap manager init surface: `{root_heap_count, per-root {arena,
/// arena_size}, oom_resize_alignment, oom_callback}`. `oom_resize_alignment`
/// and `oom_callback` are carried as fields rather than acted on by
/// [`mem::heap::HeapManager`] itself — the retry-on-exhaustion contract
/// (an allocation failure that crosses a heap boundary invokes the heap's
/// OOM callback exactly once and retries) is implemented at the call sites
/// that actually allocate (e.g.
/// [`resource::unit::ResourceMemoryManager::allocate`]'s
/// `clear_cache_for_allocate` retry), not inside the generic heap itself.
pub struct HeapManagerConfig {
    pub max_heaps: u32,
    pub roots: Vec<HeapRootSpec>,
    pub oom_resize_alignment: usize,
    pub oom_callback: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

impl Default for HeapManagerConfig {
    fn default() -> Self {
        Self {
            max_heaps: 4096,
            roots: vec![HeapRootSpec {
                name: "default".into(),
                arena_size: 64 << 20,
                kind: HeapKind::Exp,
                mode: AllocationMode::FirstFit,
            }],
            oom_resize_alignment: 64 * 1024,
            oom_callback: None,
        }
    }
}

/// UKern init surface: `{max fiber count, per-core stack default}`, plus the
/// core mask the system manager uses to decide which OS threads the
/// scheduler spawns one worker on. Defaults to a bit-mask of all schedulable
/// process cores.
pub struct UkernConfig {
    pub core_mask: u64,
    pub max_fiber_count: usize,
    pub default_stack_size: usize,
}

impl Default for UkernConfig {
    fn default() -> Self {
        Self {
            core_mask: std::thread::available_parallelism().map(|n| (1u64 << n.get().min(63)) - 1).unwrap_or(1),
            max_fiber_count: 4096,
            default_stack_size: 64 * 1024,
        }
    }
}

/// Async queue init surface: `{priority_level_count, queue_thread_count}`.
/// The level count and per-level shape live on
/// [`resource::AsyncResourceManagerConfig`] (the queue this runtime starts
/// belongs to the resource pipeline); this struct only controls how many
/// fiber workers [`Runtime::new`] starts against
/// [`async_task::queue::AsyncQueue::worker_loop`].
pub struct AsyncQueueConfig {
    pub queue_thread_count: usize,
}

impl Default for AsyncQueueConfig {
    fn default() -> Self {
        Self { queue_thread_count: 2 }
    }
}

/// GPU heap manager init surface: per-property-class `{count, size[]}`,
/// defaulting to 4 MiB host-uncached / 8 MiB host-cached / 16 MiB
/// gpu+host-uncached roots. Only meaningful when built with the `gpu`
/// feature; kept unconditional here so [`RuntimeConfig`]'s shape doesn't
/// change across feature flags.
pub struct GpuHeapConfig {
    pub cpu_uncached_root_size: usize,
    pub cpu_cached_root_size: usize,
    pub gpu_uncached_root_size: usize,
}

impl Default for GpuHeapConfig {
    fn default() -> Self {
        Self {
            cpu_uncached_root_size: 4 << 20,
            cpu_cached_root_size: 8 << 20,
            gpu_uncached_root_size: 16 << 20,
        }
    }
}

/// Top-level configuration surface, gathered into one value so
/// [`Runtime::new`] has a single entry point instead of a call per
/// subsystem singleton.
pub struct RuntimeConfig {
    pub ukern: UkernConfig,
    pub heaps: HeapManagerConfig,
    pub gpu_heaps: GpuHeapConfig,
    pub async_queue: AsyncQueueConfig,
    pub resources: AsyncResourceManagerConfig,
    pub job_threads: usize,
    pub job_manager_runs_on_caller_thread: bool,
    pub service_thread_count: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ukern: UkernConfig::default(),
            heaps: HeapManagerConfig::default(),
            gpu_heaps: GpuHeapConfig::default(),
            async_queue: AsyncQueueConfig::default(),
            resources: AsyncResourceManagerConfig::default(),
            job_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            job_manager_runs_on_caller_thread: false,
            service_thread_count: 2,
        }
    }
}

/// The explicit, single construction point for every subsystem that would
/// otherwise be a process-wide global (see [`glue::singletons`]): the heap
/// hierarchy, file-device registry, resource pipeline, dependency-job
/// dispatcher and service-thread pool, plus a reference to the one global
/// that remains, the UKern scheduler.
pub struct Runtime {
    scheduler: &'static Scheduler,
    heaps: Arc<HeapManager>,
    default_root: HeapId,
    devices: Arc<FileDeviceManager>,
    resources: Arc<AsyncResourceManager>,
    job_threads: DependencyJobThreadManager,
    service_threads: ServiceThreadPool,
}

impl Runtime {
    /// Brings up every subsystem in dependency order: the scheduler first
    /// (no other subsystem may touch a fiber before UKern is running), then
    /// the heap hierarchy, then the file-device registry and resource
    /// pipeline that sit on top of it, then the queue workers and
    /// background thread pools.
    pub fn new(config: RuntimeConfig) -> error::Result<Arc<Self>> {
        let scheduler = glue::singletons::init_scheduler(
            config.ukern.core_mask,
            config.ukern.max_fiber_count,
            config.ukern.default_stack_size,
        );
        scheduler.ensure_started();

        let heaps = Arc::new(HeapManager::new(config.heaps.max_heaps));
        let mut default_root = None;
        for root in &config.heaps.roots {
            let id = heaps
                .create_root(root.name.clone(), root.arena_size, root.kind, root.mode)
                .map_err(|e| error::Error::custom(format!("failed to create root heap '{}': {e:?}", root.name)))?;
            default_root.get_or_insert(id);
        }
        let default_root = default_root.ok_or_else(|| error::Error::custom("HeapManagerConfig::roots must name at least one root heap"))?;

        let devices = Arc::new(FileDeviceManager::new());

        let default_manager = Arc::new(ResourceMemoryManager::new(heaps.clone(), default_root, config.resources.free_cache_capacity));
        let extensions = ExtensionManager::new(default_manager, Vec::new());
        let size_tables = ResourceSizeTableManager::new();

        let queue_thread_count = config.async_queue.queue_thread_count;
        let resources = AsyncResourceManager::new(heaps.clone(), devices.clone(), extensions, size_tables, scheduler, config.resources);

        for worker_idx in 0..queue_thread_count.max(1) {
            let queue = resources.queue().clone();
            let name = format!("resource-queue-worker-{worker_idx}");
            let entry = async move {
                queue.worker_loop(scheduler, worker_idx).await;
            };
            if let Some(fiber) = scheduler.create_fiber(name, crate::ukern::fiber::DEFAULT_PRIORITY, u64::MAX, entry) {
                scheduler.start_fiber(fiber);
            }
        }

        let job_threads = DependencyJobThreadManager::new(config.job_threads, config.job_manager_runs_on_caller_thread);
        let service_threads = ServiceThreadPool::new(config.service_thread_count);

        Ok(Arc::new(Self {
            scheduler,
            heaps,
            default_root,
            devices,
            resources,
            job_threads,
            service_threads,
        }))
    }

    pub fn scheduler(&self) -> &'static Scheduler {
        self.scheduler
    }

    pub fn heaps(&self) -> &Arc<HeapManager> {
        &self.heaps
    }

    pub fn default_root_heap(&self) -> HeapId {
        self.default_root
    }

    pub fn devices(&self) -> &Arc<FileDeviceManager> {
        &self.devices
    }

    pub fn resources(&self) -> &Arc<AsyncResourceManager> {
        &self.resources
    }

    pub fn job_threads(&self) -> &DependencyJobThreadManager {
        &self.job_threads
    }

    pub fn service_threads(&self) -> &ServiceThreadPool {
        &self.service_threads
    }

    /// Orderly teardown: drains the resource queue, then joins the
    /// scheduler's worker threads.
    pub async fn shutdown(&self) {
        self.resources.queue().wait_all_complete().await;
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_brings_up_every_subsystem() {
        let mut config = RuntimeConfig::default();
        config.ukern.core_mask = 0b1;
        config.ukern.max_fiber_count = 64;
        config.async_queue.queue_thread_count = 1;
        config.job_threads = 1;
        config.service_thread_count = 1;

        let runtime = Runtime::new(config).unwrap();
        assert!(runtime.heaps().entry(runtime.default_root_heap()).is_some());
        assert_eq!(runtime.resources().queue().level_count(), AsyncResourceManagerConfig::default().queue_priority_levels);
    }
}
