//! Per-worker job queues and the blocking dependency-scan entry point.
//!
//! Three queues per worker: `pending_scans` (a plain FIFO), `pending_builds`
//! (one FIFO per priority band), and `in_flight` (jobs handed to a worker
//! thread but not yet DONE/CANCELED). A single mutex covers all of it --
//! the C++ original uses a `recursive_mutex` because `ScanDependencies`
//! calls back into the registry while already holding the scheduler lock;
//! here the two locks are taken in a fixed order (registry, then
//! scheduler) and never nested the other way, so no reentrancy is needed.

use crate::ids::{JobId, JobIdAllocator, WorkerId};
use crate::job::{BuildPayload, DependencyScanPayload, Job, JobSetWaiter, Payload, Priority, Status};
use crate::registry::Registry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct WorkerQueues {
    pending_scans: VecDeque<Job>,
    pending_builds: HashMap<Priority, VecDeque<Job>>,
    in_flight: HashSet<JobId>,
    in_flight_jobs: HashMap<JobId, Job>,
}

pub struct Scheduler {
    registry: Arc<Registry>,
    queues: Mutex<HashMap<WorkerId, WorkerQueues>>,
    ids: JobIdAllocator,
    waiter: JobSetWaiter,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>) -> Scheduler {
        Scheduler { registry, queues: Mutex::new(HashMap::new()), ids: JobIdAllocator::default(), waiter: JobSetWaiter::default() }
    }

    pub fn register_worker(&self, worker: WorkerId) {
        self.queues.lock().unwrap().entry(worker).or_default();
    }

    pub fn next_job_id(&self) -> JobId {
        self.ids.alloc()
    }

    /// Submits a scan job to a *specific* worker -- the golden node for
    /// its toolchain, chosen by the caller -- preserving FIFO order
    /// within that worker's scan queue.
    pub fn submit_scan_job(&self, worker: WorkerId, job: Job) {
        let mut queues = self.queues.lock().unwrap();
        queues.entry(worker).or_default().pending_scans.push_back(job);
    }

    /// Enqueues a build job onto some worker able to run it (one whose
    /// registry-advertised toolchain set includes the job's toolchain
    /// hash), preferring the worker with the shortest queue and breaking
    /// ties by worker id.
    pub fn submit_job(&self, job: Job, toolchain_hash: &str) -> Option<WorkerId> {
        let mut queues = self.queues.lock().unwrap();
        let candidates: Vec<WorkerId> = queues
            .keys()
            .copied()
            .filter(|w| self.registry.worker_advertises(*w, toolchain_hash))
            .collect();

        let chosen = candidates
            .into_iter()
            .map(|w| {
                let len: usize = {
                    let q = &queues[&w];
                    q.pending_builds.values().map(|v| v.len()).sum()
                };
                (len, w)
            })
            .min_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(_, w)| w);

        if let Some(worker) = chosen {
            queues.entry(worker).or_default().pending_builds.entry(job.priority).or_default().push_back(job);
        }
        chosen
    }

    pub fn pop_scan_job(&self, worker: WorkerId) -> Option<Job> {
        let mut queues = self.queues.lock().unwrap();
        let wq = queues.entry(worker).or_default();
        let job = wq.pending_scans.pop_front()?;
        job.set_status(Status::Running);
        wq.in_flight.insert(job.id);
        wq.in_flight_jobs.insert(job.id, job.clone());
        Some(job)
    }

    /// Scans take priority over builds; within builds, priority bands
    /// drain high -> normal -> low, FIFO within a band.
    pub fn pop_build_job(&self, worker: WorkerId) -> Option<Job> {
        let mut queues = self.queues.lock().unwrap();
        let wq = queues.entry(worker).or_default();
        for prio in [Priority::High, Priority::Normal, Priority::Low] {
            if let Some(q) = wq.pending_builds.get_mut(&prio) {
                if let Some(job) = q.pop_front() {
                    job.set_status(Status::Running);
                    wq.in_flight.insert(job.id);
                    wq.in_flight_jobs.insert(job.id, job.clone());
                    return Some(job);
                }
            }
        }
        None
    }

    pub fn mark_done(&self, worker: WorkerId, job: &Job) {
        job.set_status(Status::Done);
        self.finish_in_flight(worker, job.id);
        self.waiter.notify();
    }

    pub fn mark_failed_but_done(&self, worker: WorkerId, job: &Job) {
        // A compile/link that produced a FAILED cache entry still
        // completes the job -- only disconnects CANCEL.
        self.mark_done(worker, job);
    }

    fn finish_in_flight(&self, worker: WorkerId, id: JobId) {
        let mut queues = self.queues.lock().unwrap();
        if let Some(wq) = queues.get_mut(&worker) {
            wq.in_flight.remove(&id);
            wq.in_flight_jobs.remove(&id);
        }
    }

    /// Cancels all of `worker`'s in-flight jobs, re-queues build jobs onto
    /// a surviving worker where possible, and drops its queues. Jobs
    /// blocked on other jobs' completion are left as-is -- they remain
    /// blocked until their prerequisite resolves on whatever worker now
    /// owns it.
    pub fn remove_node(&self, worker: WorkerId) {
        let removed = {
            let mut queues = self.queues.lock().unwrap();
            queues.remove(&worker)
        };
        self.registry.remove_client(worker);

        let Some(wq) = removed else { return };
        for (_, job) in wq.in_flight_jobs {
            job.set_status(Status::Canceled);
            if let Payload::Build(b) = &*job.payload {
                // Re-queue iff another worker can still run this
                // toolchain; otherwise it stays PENDING until capacity
                // returns, per the no-retry policy.
                let requeued = Job::new(self.next_job_id(), job.priority, clone_build_payload(b), (*job.dependency_jobs).clone());
                self.submit_job(requeued, &b.toolchain_hash);
            }
        }
        self.waiter.notify();
    }

    pub fn notify_waiters(&self) {
        self.waiter.notify();
    }

    pub fn wait_poll(&self, timeout: Duration) {
        self.waiter.wait_timeout(timeout);
    }

    /// Blocking scheduler op: resolves the golden node for `toolchain_hash`,
    /// submits a scan job there, and blocks until it's DONE or CANCELED.
    /// Returns the completed job so the caller can read its results, or
    /// `None` if no golden node is available or the job was canceled.
    pub fn scan_dependencies(
        &self,
        source_path: &str,
        arch: &str,
        toolchain_name: &str,
        toolchain_hash: &str,
        flags: Vec<String>,
    ) -> Option<Job> {
        let golden = self.registry.get_golden_node(toolchain_hash)?;

        let job = Job::new(
            self.next_job_id(),
            Priority::High,
            Payload::Scan(DependencyScanPayload {
                source_path: source_path.to_owned(),
                arch: arch.to_owned(),
                toolchain_name: toolchain_name.to_owned(),
                toolchain_hash: toolchain_hash.to_owned(),
                flags,
            }),
            vec![],
        );
        self.submit_scan_job(golden, job.clone());

        if job.wait_for_completion() {
            Some(job)
        } else {
            None
        }
    }
}

fn clone_build_payload(b: &BuildPayload) -> Payload {
    Payload::Build(BuildPayload {
        node_hash: b.node_hash.clone(),
        output_path: b.output_path.clone(),
        toolchain_name: b.toolchain_name.clone(),
        toolchain_hash: b.toolchain_hash.clone(),
        arch: b.arch.clone(),
        stage: b.stage.clone(),
        flags: b.flags.clone(),
        sources: b.sources.clone(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ids::WorkerId;
    use splash_proto::{CompilerInfo, ToolchainKind, VersionTriple};

    fn registry_with_worker(worker: WorkerId, hash: &str) -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        registry.add_toolchain(
            worker,
            CompilerInfo {
                hash: hash.to_owned(),
                kind: ToolchainKind::Gnu,
                version: VersionTriple { major: 1, minor: 0, patch: 0 },
                version_string: "gcc 1.0.0".into(),
                languages: vec!["c++".into()],
                triplets: vec!["x86_64-linux-gnu".into()],
                compiler_names: vec!["g++".into()],
                affixes: vec![],
            },
            false,
        );
        registry
    }

    fn build_job(id: u64, prio: Priority) -> Job {
        Job::new(
            JobId(id),
            prio,
            Payload::Build(BuildPayload {
                node_hash: format!("n{}", id),
                output_path: "out".into(),
                toolchain_name: "c++".into(),
                toolchain_hash: "h".into(),
                arch: "x86_64-linux-gnu".into(),
                stage: "compile".into(),
                flags: vec![],
                sources: vec![],
            }),
            vec![],
        )
    }

    #[test]
    fn scan_jobs_pop_in_fifo_order() {
        let registry = registry_with_worker(WorkerId(1), "h");
        let sched = Scheduler::new(registry);
        sched.register_worker(WorkerId(1));
        let j1 = Job::new(JobId(1), Priority::High, Payload::Scan(DependencyScanPayload {
            source_path: "a.c".into(), arch: "x".into(), toolchain_name: "c++".into(), toolchain_hash: "h".into(), flags: vec![],
        }), vec![]);
        let j2 = Job::new(JobId(2), Priority::High, Payload::Scan(DependencyScanPayload {
            source_path: "b.c".into(), arch: "x".into(), toolchain_name: "c++".into(), toolchain_hash: "h".into(), flags: vec![],
        }), vec![]);
        sched.submit_scan_job(WorkerId(1), j1);
        sched.submit_scan_job(WorkerId(1), j2);
        assert_eq!(sched.pop_scan_job(WorkerId(1)).unwrap().id, JobId(1));
        assert_eq!(sched.pop_scan_job(WorkerId(1)).unwrap().id, JobId(2));
        assert!(sched.pop_scan_job(WorkerId(1)).is_none());
    }

    #[test]
    fn build_jobs_drain_high_before_normal() {
        let registry = registry_with_worker(WorkerId(1), "h");
        let sched = Scheduler::new(registry);
        sched.register_worker(WorkerId(1));
        sched.submit_job(build_job(1, Priority::Normal), "h");
        sched.submit_job(build_job(2, Priority::High), "h");
        assert_eq!(sched.pop_build_job(WorkerId(1)).unwrap().id, JobId(2));
        assert_eq!(sched.pop_build_job(WorkerId(1)).unwrap().id, JobId(1));
    }

    #[test]
    fn submit_job_picks_shortest_queue() {
        let registry = registry_with_worker(WorkerId(1), "h");
        registry.add_toolchain(WorkerId(2), CompilerInfo {
            hash: "h".into(), kind: ToolchainKind::Gnu, version: VersionTriple { major: 1, minor: 0, patch: 0 },
            version_string: "gcc 1.0.0".into(), languages: vec!["c++".into()], triplets: vec!["x86_64-linux-gnu".into()],
            compiler_names: vec!["g++".into()], affixes: vec![],
        }, false);
        let sched = Scheduler::new(registry);
        sched.register_worker(WorkerId(1));
        sched.register_worker(WorkerId(2));
        sched.submit_job(build_job(1, Priority::Normal), "h");
        let second = sched.submit_job(build_job(2, Priority::Normal), "h");
        assert_eq!(second, Some(WorkerId(2)));
    }

    #[test]
    fn remove_node_cancels_in_flight_and_requeues() {
        let registry = registry_with_worker(WorkerId(1), "h");
        registry.add_toolchain(WorkerId(2), CompilerInfo {
            hash: "h".into(), kind: ToolchainKind::Gnu, version: VersionTriple { major: 1, minor: 0, patch: 0 },
            version_string: "gcc 1.0.0".into(), languages: vec!["c++".into()], triplets: vec!["x86_64-linux-gnu".into()],
            compiler_names: vec!["g++".into()], affixes: vec![],
        }, false);
        let sched = Scheduler::new(registry);
        sched.register_worker(WorkerId(1));
        sched.register_worker(WorkerId(2));
        sched.submit_job(build_job(1, Priority::Normal), "h");
        let job = sched.pop_build_job(WorkerId(1)).unwrap();
        assert_eq!(job.status(), Status::Running);

        sched.remove_node(WorkerId(1));
        assert_eq!(job.status(), Status::Canceled);

        // Requeued copy should be runnable on worker 2.
        let requeued = sched.pop_build_job(WorkerId(2));
        assert!(requeued.is_some());
    }
}
