//! The working copy: one reentrant-mutex-guarded view over the build
//! graph, exposed as the narrow set of operations a session thread
//! actually needs (spec.md §4.3 "Working Copy").
//!
//! A plain `Mutex` is not reentrant; rather than pull in a reentrant-lock
//! crate, every `WorkingCopy` method takes the lock exactly once and does
//! not call back into another `WorkingCopy` method while holding it, so
//! the non-reentrant mutex is sufficient.

use crate::graph::node::NodeId;
use crate::graph::BuildGraph;
use crate::registry::Registry;
use splash_proto::{ClientInfoEntry, ClientType};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One entry per currently-connected session, keyed by an opaque handle
/// the caller gets back from `add_client` and must hand back to
/// `remove_client` on disconnect. original_source's `WorkingCopy` is one
/// instance per developer client and tracks its own identity
/// (`m_hostname`/`m_id`) plus a `CLIENT_COUNT`-sized refcount array
/// (`AddClient`/`RemoveClient`); our `WorkingCopy` is a single instance
/// shared by every session thread, so the per-client identity moves into
/// this table instead of onto the struct itself.
struct ClientRecord {
    client_type: ClientType,
    hostname: String,
    uuid: Option<String>,
}

pub struct WorkingCopy {
    graph: Mutex<BuildGraph>,
    clients: Mutex<HashMap<u64, ClientRecord>>,
    next_client_id: AtomicU64,
    /// path -> (hostname, uuid) of whichever client most recently pushed
    /// it, mirroring `m_fileMap`'s per-client ownership in the original
    /// (there it falls out for free since each client has its own
    /// `WorkingCopy`; here it's tracked explicitly since the graph itself
    /// is shared).
    file_owners: Mutex<HashMap<String, (String, Option<String>)>>,
}

impl WorkingCopy {
    pub fn new(registry: Arc<Registry>) -> WorkingCopy {
        WorkingCopy {
            graph: Mutex::new(BuildGraph::new(registry)),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            file_owners: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a newly connected session. Returns a handle to pass to
    /// `remove_client` when the connection closes.
    pub fn add_client(&self, client_type: ClientType, hostname: &str, uuid: Option<&str>) -> u64 {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().unwrap().insert(id, ClientRecord { client_type, hostname: hostname.to_owned(), uuid: uuid.map(str::to_owned) });
        id
    }

    pub fn remove_client(&self, id: u64) {
        self.clients.lock().unwrap().remove(&id);
    }

    /// Count of currently-connected clients of a given type, the
    /// refcount `AddClient`/`RemoveClient` maintained in the original.
    pub fn client_count(&self, client_type: ClientType) -> usize {
        self.clients.lock().unwrap().values().filter(|c| c.client_type == client_type).count()
    }

    pub fn list_clients(&self) -> Vec<ClientInfoEntry> {
        self.clients.lock().unwrap().values().map(|c| ClientInfoEntry { hostname: c.hostname.clone(), uuid: c.uuid.clone(), client_type: c.client_type }).collect()
    }

    pub fn has(&self, path: &str) -> bool {
        self.graph.lock().unwrap().has(path)
    }

    pub fn get_hash(&self, path: &str) -> Option<String> {
        self.graph.lock().unwrap().get_hash(path)
    }

    /// Updates a file's content and reparses any scripts it touches.
    /// Returns the set of script paths that should be reparsed
    /// downstream (propagated `recursive_config` changes).
    pub fn update(&self, path: &str, data: &[u8]) -> Result<HashSet<String>, String> {
        self.graph.lock().unwrap().update(path, data)
    }

    pub fn remove(&self, path: &str) {
        self.graph.lock().unwrap().remove(path);
        self.file_owners.lock().unwrap().remove(path);
    }

    /// Records which client pushed `path` most recently. Called
    /// alongside `update` by the session layer, which knows the
    /// connection's hostname/uuid; kept separate so `update` itself
    /// doesn't need the client's identity threaded through it.
    pub fn set_file_owner(&self, path: &str, hostname: &str, uuid: Option<&str>) {
        self.file_owners.lock().unwrap().insert(path.to_owned(), (hostname.to_owned(), uuid.map(str::to_owned)));
    }

    pub fn file_owner(&self, path: &str) -> Option<(String, Option<String>)> {
        self.file_owners.lock().unwrap().get(path).cloned()
    }

    pub fn refresh_toolchains(&self) -> Vec<NodeId> {
        self.graph.lock().unwrap().refresh_toolchains()
    }

    pub fn rebuild(&self) -> Vec<NodeId> {
        self.graph.lock().unwrap().rebuild()
    }

    pub fn set_scanned_dependencies(&self, id: NodeId, deps: Vec<(String, String)>, libflags: Vec<String>) {
        self.graph.lock().unwrap().set_scanned_dependencies(id, deps, libflags)
    }

    /// Runs `f` against the graph under the single lock. Used by callers
    /// (e.g. `BuildRequest` orchestration) that need a read of node state
    /// that doesn't fit the narrow accessors above.
    pub fn with_graph<R>(&self, f: impl FnOnce(&BuildGraph) -> R) -> R {
        f(&self.graph.lock().unwrap())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn update_then_has_round_trips() {
        let wc = WorkingCopy::new(Arc::new(Registry::new()));
        wc.update("/proj/main.c", b"int main(){}").unwrap();
        assert!(wc.has("/proj/main.c"));
        assert!(wc.get_hash("/proj/main.c").is_some());
    }

    #[test]
    fn remove_drops_the_file() {
        let wc = WorkingCopy::new(Arc::new(Registry::new()));
        wc.update("/proj/main.c", b"int main(){}").unwrap();
        wc.remove("/proj/main.c");
        assert!(!wc.has("/proj/main.c"));
    }

    #[test]
    fn client_count_tracks_add_and_remove() {
        let wc = WorkingCopy::new(Arc::new(Registry::new()));
        assert_eq!(wc.client_count(ClientType::Build), 0);
        let a = wc.add_client(ClientType::Build, "worker-a", None);
        let _b = wc.add_client(ClientType::Developer, "dev-box", Some("uuid-1"));
        assert_eq!(wc.client_count(ClientType::Build), 1);
        assert_eq!(wc.client_count(ClientType::Developer), 1);
        wc.remove_client(a);
        assert_eq!(wc.client_count(ClientType::Build), 0);
        assert_eq!(wc.list_clients().len(), 1);
    }

    #[test]
    fn file_owner_tracks_most_recent_pusher_and_clears_on_remove() {
        let wc = WorkingCopy::new(Arc::new(Registry::new()));
        wc.update("/proj/main.c", b"int main(){}").unwrap();
        wc.set_file_owner("/proj/main.c", "dev-box", Some("uuid-1"));
        assert_eq!(wc.file_owner("/proj/main.c"), Some(("dev-box".to_owned(), Some("uuid-1".to_owned()))));
        wc.remove("/proj/main.c");
        assert!(wc.file_owner("/proj/main.c").is_none());
    }
}
