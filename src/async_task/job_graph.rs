//! src/async_task/job_graph.rs
//! The dependency job graph: a build-time DAG of [`JobGraphNode`]s that
//! [`DependencyJobThreadManager::submit_graph`] flattens wave-by-wave onto
//! worker threads, separate from the priority [`crate::async_task::queue::AsyncQueue`]
//! — this scheduler exists for batch, shape-known-in-advance work (a
//! frame's render-graph build, an asset-cook pipeline) rather than the
//! queue's steady stream of independently-arriving requests.
//!
//! Cycle rejection is structural  rather than a runtime cycle
//! check: `register_dependency` rejects any edge whose child register id
//! is not strictly greater than its parent's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::glue::result::{Code, Module, Result, ResultCode};
use crate::ukern::fiber::Priority;

pub type RegisterId = u32;

pub type JobFn = Box<dyn FnMut() -> Result<()> + Send>;

/// One node of the DAG . `multi_run_count > 1` reruns the same
/// closure that many times once its parents are complete;
/// `is_multi_run_complete_once` controls whether dependents may start
/// after the *first* run finishes or must wait for *all* of them.
pub struct JobGraphNode {
    register_id: RegisterId,
    user_id: Option<u32>,
    run: Mutex<JobFn>,
    priority: Priority,
    core_affinity_mask: u64,
    multi_run_count: u32,
    is_multi_run_complete_once: bool,
    completed_runs: AtomicU32,
    complete: AtomicBool,
    failed: AtomicBool,
}

impl JobGraphNode {
    pub fn is_runnable_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

pub struct JobGraphNodeSpec {
    pub user_id: Option<u32>,
    pub priority: Priority,
    pub core_affinity_mask: u64,
    pub multi_run_count: u32,
    pub is_multi_run_complete_once: bool,
}

impl Default for JobGraphNodeSpec {
    fn default() -> Self {
        Self {
            user_id: None,
            priority: crate::ukern::fiber::DEFAULT_PRIORITY,
            core_affinity_mask: u64::MAX,
            multi_run_count: 1,
            is_multi_run_complete_once: false,
        }
    }
}

/// A build-time DAG . Build with
/// `register_job`/`register_dependency`, then hand to
/// [`DependencyJobThreadManager::submit_graph`].
pub struct DependencyJobGraph {
    nodes: Vec<Arc<JobGraphNode>>,
    /// parent register id -> child register ids.
    edges_by_register: HashMap<RegisterId, Vec<RegisterId>>,
    /// parent user id -> child user ids, resolved to register ids at
    /// submission time .
    edges_by_user: Vec<(u32, u32)>,
    user_to_register: HashMap<u32, RegisterId>,
}

impl Default for DependencyJobGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyJobGraph {
    pub const MAX_USER_IDS: usize = 256;

    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges_by_register: HashMap::new(),
            edges_by_user: Vec::new(),
            user_to_register: HashMap::new(),
        }
    }

    pub fn register_job(&mut self, job: JobFn, spec: JobGraphNodeSpec) -> Result<RegisterId> {
        if let Some(uid) = spec.user_id {
            if self.user_to_register.len() >= Self::MAX_USER_IDS {
                return Err(ResultCode::new(Module::ResBui, Code::EntryExhaustion));
            }
            self.user_to_register.insert(uid, self.nodes.len() as RegisterId);
        }
        let id = self.nodes.len() as RegisterId;
        self.nodes.push(Arc::new(JobGraphNode {
            register_id: id,
            user_id: spec.user_id,
            run: Mutex::new(job),
            priority: spec.priority,
            core_affinity_mask: spec.core_affinity_mask,
            multi_run_count: spec.multi_run_count.max(1),
            is_multi_run_complete_once: spec.is_multi_run_complete_once,
            completed_runs: AtomicU32::new(0),
            complete: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }));
        Ok(id)
    }

    /// Adds a `parent -> child` edge. Rejected  unless `child > parent`, which also
    /// rejects self-edges.
    pub fn register_dependency(&mut self, parent: RegisterId, child: RegisterId) -> Result<()> {
        if child <= parent || parent as usize >= self.nodes.len() || child as usize >= self.nodes.len() {
            return Err(ResultCode::new(Module::ResBui, Code::AlreadyLinked));
        }
        self.edges_by_register.entry(parent).or_default().push(child);
        Ok(())
    }

    pub fn register_dependency_by_user_id(&mut self, parent_user: u32, child_user: u32) {
        self.edges_by_user.push((parent_user, child_user));
    }

    /// Resolves every user-id edge against the register map and folds it
    /// into `edges_by_register`. Called once at submission time (spec
    /// §4.3: "resolved ... at queue-submission time").
    fn resolve_user_edges(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.edges_by_user);
        for (parent_user, child_user) in pending {
            let parent = *self
                .user_to_register
                .get(&parent_user)
                .ok_or_else(|| ResultCode::new(Module::ResBui, Code::DuplicatePath))?;
            let child = *self
                .user_to_register
                .get(&child_user)
                .ok_or_else(|| ResultCode::new(Module::ResBui, Code::DuplicatePath))?;
            self.register_dependency(parent, child)?;
        }
        Ok(())
    }

    fn parent_count(&self) -> Vec<u32> {
        let mut parents = vec![0u32; self.nodes.len()];
        for children in self.edges_by_register.values() {
            for &c in children {
                parents[c as usize] += 1;
            }
        }
        parents
    }

    /// Topologically flattens the DAG into waves: wave 0 is every node
    /// with no parents, wave k+1 is every node whose parents are all in
    /// waves `0..=k` .
    fn flatten_waves(&self) -> Vec<Vec<RegisterId>> {
        let mut remaining_parents = self.parent_count();
        let mut placed = vec![false; self.nodes.len()];
        let mut waves = Vec::new();
        let mut placed_count = 0;
        while placed_count < self.nodes.len() {
            let wave: Vec<RegisterId> = (0..self.nodes.len() as RegisterId)
                .filter(|&id| !placed[id as usize] && remaining_parents[id as usize] == 0)
                .collect();
            if wave.is_empty() {
                break; // would only happen on a malformed graph; register_dependency already rejects cycles.
            }
            for &id in &wave {
                placed[id as usize] = true;
                placed_count += 1;
                if let Some(children) = self.edges_by_register.get(&id) {
                    for &c in children {
                        remaining_parents[c as usize] -= 1;
                    }
                }
            }
            waves.push(wave);
        }
        waves
    }

    pub fn node(&self, id: RegisterId) -> &Arc<JobGraphNode> {
        &self.nodes[id as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Clears the graph for reuse .
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges_by_register.clear();
        self.edges_by_user.clear();
        self.user_to_register.clear();
    }
}

/// Runs the runnable closure for one job, `multi_run_count` times.
/// Dependency-completeness is signaled after the first run when
/// `is_multi_run_complete_once` is set, otherwise only after the last.
fn run_node(node: &Arc<JobGraphNode>) {
    for run_index in 0..node.multi_run_count {
        let result = (node.run.lock())();
        if result.is_err() {
            node.failed.store(true, Ordering::Release);
        }
        let completed = node.completed_runs.fetch_add(1, Ordering::AcqRel) + 1;
        if node.is_multi_run_complete_once && run_index == 0 {
            node.complete.store(true, Ordering::Release);
        }
        if completed == node.multi_run_count {
            node.complete.store(true, Ordering::Release);
        }
    }
}

/// Dispatches a [`DependencyJobGraph`] across a bounded pool of native
/// worker threads, one wave at a time . Each wave is a barrier:
/// every job in it runs to the point its completeness contract requires
/// before the next wave's parent-check would be satisfied.
pub struct DependencyJobThreadManager {
    /// Spec §4.3: "The manager's own fiber can participate as a worker if
    /// `is_process_in_mainthread` is set" — here, whether `submit_graph`'s
    /// caller runs one job itself each wave instead of purely dispatching.
    pub is_process_in_mainthread: bool,
    pub worker_count: usize,
}

impl DependencyJobThreadManager {
    pub fn new(worker_count: usize, is_process_in_mainthread: bool) -> Self {
        Self {
            is_process_in_mainthread,
            worker_count: worker_count.max(1),
        }
    }

    /// `SubmitGraph` + `FinishRun`: flattens, then runs each
    /// wave to completion before starting the next. Jobs within a wave are
    /// sorted by priority (lower runs first) before being handed to the
    /// pool — there is no preemption once a job starts, so priority here
    /// governs dispatch order only, consistent with the queue's own
    /// "priority governs scan order, not preemption" rule .
    pub fn submit_graph(&self, graph: &mut DependencyJobGraph) -> Result<()> {
        graph.resolve_user_edges()?;
        let waves = graph.flatten_waves();
        for wave in waves {
            let mut runnable: Vec<&Arc<JobGraphNode>> = wave.iter().map(|&id| graph.node(id)).collect();
            runnable.sort_by_key(|n| n.priority);
            self.run_wave(&runnable);
        }
        let any_failed = graph.nodes.iter().any(|n| n.failed.load(Ordering::Acquire));
        if any_failed {
            return Err(ResultCode::new(Module::Async, Code::Incomplete));
        }
        Ok(())
    }

    fn run_wave(&self, jobs: &[&Arc<JobGraphNode>]) {
        if jobs.is_empty() {
            return;
        }
        let (mainthread_job, pooled) = if self.is_process_in_mainthread {
            (jobs.first().copied(), &jobs[1.min(jobs.len())..])
        } else {
            (None, jobs)
        };
        std::thread::scope(|scope| {
            for chunk in pooled.chunks(pooled.len().div_ceil(self.worker_count).max(1)) {
                let chunk = chunk.to_vec();
                scope.spawn(move || {
                    for node in chunk {
                        run_node(node);
                    }
                });
            }
            if let Some(node) = mainthread_job {
                run_node(node);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;

    #[test]
    fn runs_in_topological_wave_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut graph = DependencyJobGraph::new();

        let o1 = order.clone();
        let a = graph
            .register_job(Box::new(move || { o1.lock().push('a'); Ok(()) }), JobGraphNodeSpec::default())
            .unwrap();
        let o2 = order.clone();
        let b = graph
            .register_job(Box::new(move || { o2.lock().push('b'); Ok(()) }), JobGraphNodeSpec::default())
            .unwrap();
        let o3 = order.clone();
        let c = graph
            .register_job(Box::new(move || { o3.lock().push('c'); Ok(()) }), JobGraphNodeSpec::default())
            .unwrap();
        graph.register_dependency(a, b).unwrap();
        graph.register_dependency(a, c).unwrap();

        let manager = DependencyJobThreadManager::new(4, false);
        manager.submit_graph(&mut graph).unwrap();

        let result = order.lock();
        assert_eq!(result[0], 'a');
        assert!(result.contains(&'b'));
        assert!(result.contains(&'c'));
    }

    #[test]
    fn backward_dependency_is_rejected() {
        let mut graph = DependencyJobGraph::new();
        let a = graph.register_job(Box::new(|| Ok(())), JobGraphNodeSpec::default()).unwrap();
        let b = graph.register_job(Box::new(|| Ok(())), JobGraphNodeSpec::default()).unwrap();
        assert!(graph.register_dependency(b, a).is_err(), "child must have a strictly greater register id");
    }

    #[test]
    fn multi_run_complete_once_marks_complete_after_first_run() {
        let mut graph = DependencyJobGraph::new();
        let counter = Arc::new(StdAtomicU32::new(0));
        let c = counter.clone();
        let id = graph
            .register_job(
                Box::new(move || { c.fetch_add(1, Ordering::SeqCst); Ok(()) }),
                JobGraphNodeSpec { multi_run_count: 3, is_multi_run_complete_once: true, ..Default::default() },
            )
            .unwrap();
        let manager = DependencyJobThreadManager::new(2, false);
        manager.submit_graph(&mut graph).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(graph.node(id).is_runnable_complete());
    }
}
