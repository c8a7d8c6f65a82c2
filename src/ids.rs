//! Small newtype identifiers shared across the registry, scheduler and
//! session layers, replacing the C++ original's raw `clientID` typedef.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct WorkerIdAllocator {
    next: AtomicU64,
}

impl WorkerIdAllocator {
    pub fn alloc(&self) -> WorkerId {
        WorkerId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

#[derive(Debug, Default)]
pub struct JobIdAllocator {
    next: AtomicU64,
}

impl JobIdAllocator {
    pub fn alloc(&self) -> JobId {
        JobId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
