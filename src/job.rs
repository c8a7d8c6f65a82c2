//! Jobs: the unit the scheduler queues and workers execute.
//!
//! The original polls job status with a fixed-interval sleep. Per Design
//! Note 9 ("replace with condition-variable signalling... no sleep
//! constants"), waiters here block on a `Condvar` that every status
//! transition notifies.
//!
//! Refcounting: the scheduler holds one reference (via `Arc`), each caller
//! holds one, and the worker thread holds one while running. `Arc`'s own
//! drop glue is the "final unref destroys the job" rule -- no manual
//! refcount bookkeeping is needed in safe Rust.

use crate::ids::{JobId, WorkerId};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Blocking,
    Pending,
    Running,
    Done,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

pub struct DependencyScanPayload {
    pub source_path: String,
    pub arch: String,
    pub toolchain_name: String,
    pub toolchain_hash: String,
    pub flags: Vec<String>,
}

pub struct BuildPayload {
    pub node_hash: String,
    pub output_path: String,
    pub toolchain_name: String,
    pub toolchain_hash: String,
    pub arch: String,
    pub stage: String,
    pub flags: Vec<String>,
    pub sources: Vec<(String, String)>,
}

pub enum Payload {
    Scan(DependencyScanPayload),
    Build(BuildPayload),
}

/// A scan's results, as reported back over the wire by the worker that
/// ran it (`DependencyResults`).
pub struct ScanOutcome {
    pub ok: bool,
    pub stdout: String,
    pub deps: Vec<(String, String)>,
    pub libflags: Vec<String>,
}

/// A build's results, as reported back over the wire by the worker that
/// ran it (`NodeBuildResults`).
pub struct BuildOutcome {
    pub success: bool,
    pub stdout: String,
    pub outputs: Vec<(String, Vec<u8>)>,
}

pub enum Outcome {
    Scan(ScanOutcome),
    Build(BuildOutcome),
}

struct State {
    status: Status,
}

/// A scheduler-visible unit of work. Cheap to clone (`Arc` underneath);
/// cloning is how the scheduler, a waiting caller, and the running worker
/// thread each get their own handle.
#[derive(Clone)]
pub struct Job {
    pub id: JobId,
    pub priority: Priority,
    pub payload: Arc<Payload>,
    /// Jobs that must complete before this one may run (a build job's
    /// compile-step dependencies, for instance).
    pub dependency_jobs: Arc<Vec<Job>>,
    /// The worker this job is destined for, once assigned.
    pub assigned_worker: Arc<Mutex<Option<WorkerId>>>,
    /// Set by the session thread that ran this job, just before it calls
    /// `Scheduler::mark_done`; read by whoever is blocked in
    /// `wait_for_completion`.
    results: Arc<Mutex<Option<Outcome>>>,
    state: Arc<(Mutex<State>, Condvar)>,
}

impl Job {
    pub fn new(id: JobId, priority: Priority, payload: Payload, dependency_jobs: Vec<Job>) -> Job {
        Job {
            id,
            priority,
            payload: Arc::new(payload),
            dependency_jobs: Arc::new(dependency_jobs),
            assigned_worker: Arc::new(Mutex::new(None)),
            results: Arc::new(Mutex::new(None)),
            state: Arc::new((Mutex::new(State { status: Status::Pending }), Condvar::new())),
        }
    }

    pub fn set_results(&self, outcome: Outcome) {
        *self.results.lock().unwrap() = Some(outcome);
    }

    pub fn take_results(&self) -> Option<Outcome> {
        self.results.lock().unwrap().take()
    }

    pub fn status(&self) -> Status {
        self.state.0.lock().unwrap().status
    }

    pub fn set_status(&self, status: Status) {
        let (lock, cvar) = &*self.state;
        let mut guard = lock.lock().unwrap();
        guard.status = status;
        cvar.notify_all();
    }

    /// Blocks the calling thread until the job reaches `Done` or
    /// `Canceled`, returning `true` iff it was `Done`.
    pub fn wait_for_completion(&self) -> bool {
        let (lock, cvar) = &*self.state;
        let mut guard = lock.lock().unwrap();
        while !matches!(guard.status, Status::Done | Status::Canceled) {
            guard = cvar.wait(guard).unwrap();
        }
        guard.status == Status::Done
    }

    /// As `wait_for_completion`, but also wakes on every transition so a
    /// caller polling a whole job set (e.g. `BuildRequest` orchestration)
    /// can recheck status of every job it holds rather than just this one.
    pub fn wait_for_any_transition(&self) {
        let (lock, cvar) = &*self.state;
        let guard = lock.lock().unwrap();
        let _ = cvar.wait(guard).unwrap();
    }
}

/// A shared condvar all jobs' transitions notify, so a waiter blocking on
/// a *set* of jobs (not a single job) can wake whenever any of them
/// changes. Used by `BuildRequest` orchestration (§4.6 step 5).
#[derive(Default)]
pub struct JobSetWaiter {
    pair: Mutex<()>,
    cvar: Condvar,
}

impl JobSetWaiter {
    pub fn notify(&self) {
        self.cvar.notify_all();
    }

    pub fn wait_timeout(&self, timeout: std::time::Duration) {
        let guard = self.pair.lock().unwrap();
        let _ = self.cvar.wait_timeout(guard, timeout).unwrap();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wait_for_completion_unblocks_on_done() {
        let job = Job::new(
            JobId(1),
            Priority::Normal,
            Payload::Scan(DependencyScanPayload {
                source_path: "a.c".into(),
                arch: "x86_64-linux-gnu".into(),
                toolchain_name: "c++".into(),
                toolchain_hash: "h".into(),
                flags: vec![],
            }),
            vec![],
        );
        let job2 = job.clone();
        let t = std::thread::spawn(move || {
            job2.set_status(Status::Running);
            job2.set_status(Status::Done);
        });
        assert!(job.wait_for_completion());
        t.join().unwrap();
    }

    #[test]
    fn wait_for_completion_reports_cancellation() {
        let job = Job::new(
            JobId(2),
            Priority::Normal,
            Payload::Scan(DependencyScanPayload {
                source_path: "a.c".into(),
                arch: "x86_64-linux-gnu".into(),
                toolchain_name: "c++".into(),
                toolchain_hash: "h".into(),
                flags: vec![],
            }),
            vec![],
        );
        job.set_status(Status::Canceled);
        assert!(!job.wait_for_completion());
    }
}
