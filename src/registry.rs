//! Toolchain registry: merges per-worker toolchain descriptors into a
//! single logical name-space and selects golden nodes for reproducible
//! dependency scans.
//!
//! One reentrant mutex in the original; here, `Registry` exposes a single
//! `Mutex<Inner>` and callers that need to hold a toolchain reference
//! across several calls take the lock once (`lock()`) and operate on the
//! guard, rather than relying on re-entrant acquisition.

use crate::ids::WorkerId;
use crate::toolchain::ToolchainDescriptor;
use splash_proto::CompilerInfo;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
pub struct Inner {
    /// Every descriptor a worker is currently advertising, keyed by
    /// worker id.
    by_node: HashMap<WorkerId, HashSet<String>>,
    /// hash -> (descriptor, set of workers holding it). Two descriptors
    /// with equal hash are interchangeable; any holder can serve a query.
    by_hash: HashMap<String, (ToolchainDescriptor, HashSet<WorkerId>)>,
    /// (language, arch) -> hash, for the `<language>/generic` convenience
    /// entries.
    by_language_arch: HashMap<(String, String), String>,
    /// (compiler-name, arch) -> hash, the resolved logical name-space.
    by_name: HashMap<(String, String), String>,
}

pub struct Registry {
    inner: Mutex<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry { inner: Mutex::new(Inner::default()) }
    }
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Exposed for callers (e.g. `Scheduler::scan_dependencies`) that must
    /// dereference a toolchain pointer across several registry
    /// operations without a descriptor being evicted out from under them.
    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Registers one descriptor for `worker`. If `more_coming` is false,
    /// re-derives the `by-name` map and reports whether it changed (the
    /// caller is then responsible for reparsing build scripts).
    pub fn add_toolchain(&self, worker: WorkerId, info: CompilerInfo, more_coming: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.by_node.entry(worker).or_default().insert(info.hash.clone());
        inner
            .by_hash
            .entry(info.hash.clone())
            .or_insert_with(|| (ToolchainDescriptor { info: info.clone() }, HashSet::new()))
            .1
            .insert(worker);

        if more_coming {
            false
        } else {
            inner.rederive_by_name()
        }
    }

    /// Drops all descriptors a disconnecting worker was advertising (that
    /// no other worker also advertises) and re-derives `by-name`.
    pub fn remove_client(&self, worker: WorkerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(hashes) = inner.by_node.remove(&worker) {
            for hash in hashes {
                if let Some((_, holders)) = inner.by_hash.get_mut(&hash) {
                    holders.remove(&worker);
                    if holders.is_empty() {
                        inner.by_hash.remove(&hash);
                    }
                }
            }
        }
        inner.rederive_by_name()
    }

    pub fn get_toolchain_hash(&self, arch: &str, name: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.by_name.get(&(name.to_owned(), arch.to_owned())).cloned()
    }

    /// Returns a clone of a descriptor held by *some* worker advertising
    /// `hash` (callers needing liveness across multiple calls should hold
    /// `lock()` instead).
    pub fn get_any_toolchain_for_name(&self, arch: &str, name: &str) -> Option<ToolchainDescriptor> {
        let inner = self.inner.lock().unwrap();
        let hash = inner.by_name.get(&(name.to_owned(), arch.to_owned()))?;
        inner.by_hash.get(hash).map(|(d, _)| d.clone())
    }

    pub fn get_descriptor(&self, hash: &str) -> Option<ToolchainDescriptor> {
        self.inner.lock().unwrap().by_hash.get(hash).map(|(d, _)| d.clone())
    }

    /// The first worker holding `hash` -- today a fixed, deterministic
    /// choice; the design permits explicit golden pinning later.
    pub fn get_golden_node(&self, hash: &str) -> Option<WorkerId> {
        let inner = self.inner.lock().unwrap();
        inner.by_hash.get(hash).and_then(|(_, holders)| holders.iter().min().copied())
    }

    pub fn all_toolchains(&self) -> Vec<ToolchainDescriptor> {
        self.inner.lock().unwrap().by_hash.values().map(|(d, _)| d.clone()).collect()
    }

    pub fn worker_advertises(&self, worker: WorkerId, hash: &str) -> bool {
        self.inner.lock().unwrap().by_node.get(&worker).map(|s| s.contains(hash)).unwrap_or(false)
    }
}

impl Inner {
    /// Re-derives `by_name` and `by_language_arch`:
    ///
    /// 1. For each hash, register its compiler names × triplets in
    ///    `by_name`, keeping the higher-versioned descriptor on collision
    ///    (strict version-triple compare, ties broken by type order).
    /// 2. For each `(language, arch)` pair present anywhere, pick the best
    ///    available toolchain and additionally register it as
    ///    `<language-lowercase>/generic` for that arch.
    ///
    /// Returns whether the map actually changed.
    fn rederive_by_name(&mut self) -> bool {
        let mut new_by_name: HashMap<(String, String), String> = HashMap::new();

        for (hash, (desc, _)) in &self.by_hash {
            for name in desc.compiler_names() {
                for triplet in &desc.info.triplets {
                    let key = (name.clone(), triplet.clone());
                    match new_by_name.get(&key) {
                        Some(existing_hash) => {
                            let existing = &self.by_hash[existing_hash].0;
                            if desc.outranks(existing) {
                                new_by_name.insert(key, hash.clone());
                            }
                        }
                        None => {
                            new_by_name.insert(key, hash.clone());
                        }
                    }
                }
            }
        }

        let mut new_by_lang_arch: HashMap<(String, String), String> = HashMap::new();
        let mut languages_and_arches: HashSet<(String, String)> = HashSet::new();
        for (_, (desc, _)) in &self.by_hash {
            for lang in &desc.info.languages {
                for triplet in &desc.info.triplets {
                    languages_and_arches.insert((lang.to_lowercase(), triplet.clone()));
                }
            }
        }
        for (lang, arch) in &languages_and_arches {
            let mut best: Option<&str> = None;
            for (hash, (desc, _)) in &self.by_hash {
                if desc.supports_language(lang) && desc.supports_triplet(arch) {
                    let better = match best {
                        None => true,
                        Some(b) => desc.outranks(&self.by_hash[b].0),
                    };
                    if better {
                        best = Some(hash);
                    }
                }
            }
            if let Some(hash) = best {
                new_by_lang_arch.insert((lang.clone(), arch.clone()), hash.to_owned());
                new_by_name.insert((format!("{}/generic", lang), arch.clone()), hash.to_owned());
            }
        }

        let changed = new_by_name != self.by_name || new_by_lang_arch != self.by_language_arch;
        self.by_name = new_by_name;
        self.by_language_arch = new_by_lang_arch;
        changed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use splash_proto::{ToolchainKind, VersionTriple};

    fn info(hash: &str, major: u32, triplet: &str) -> CompilerInfo {
        CompilerInfo {
            hash: hash.to_owned(),
            kind: ToolchainKind::Gnu,
            version: VersionTriple { major, minor: 0, patch: 0 },
            version_string: format!("gcc {}.0.0", major),
            languages: vec!["c++".to_owned()],
            triplets: vec![triplet.to_owned()],
            compiler_names: vec!["g++".to_owned(), "c++".to_owned()],
            affixes: vec![],
        }
    }

    #[test]
    fn higher_version_wins_on_name_collision() {
        let reg = Registry::new();
        reg.add_toolchain(WorkerId(1), info("h5", 5, "x86_64-linux-gnu"), false);
        reg.add_toolchain(WorkerId(2), info("h9", 9, "x86_64-linux-gnu"), false);
        assert_eq!(reg.get_toolchain_hash("x86_64-linux-gnu", "g++"), Some("h9".to_owned()));
    }

    #[test]
    fn language_generic_alias_is_registered() {
        let reg = Registry::new();
        reg.add_toolchain(WorkerId(1), info("h5", 5, "x86_64-linux-gnu"), false);
        assert_eq!(reg.get_toolchain_hash("x86_64-linux-gnu", "c++/generic"), Some("h5".to_owned()));
    }

    #[test]
    fn remove_client_drops_unshared_descriptors() {
        let reg = Registry::new();
        reg.add_toolchain(WorkerId(1), info("h5", 5, "x86_64-linux-gnu"), false);
        reg.remove_client(WorkerId(1));
        assert_eq!(reg.get_toolchain_hash("x86_64-linux-gnu", "g++"), None);
    }

    #[test]
    fn shared_descriptor_survives_one_holder_leaving() {
        let reg = Registry::new();
        reg.add_toolchain(WorkerId(1), info("h5", 5, "x86_64-linux-gnu"), true);
        reg.add_toolchain(WorkerId(2), info("h5", 5, "x86_64-linux-gnu"), false);
        reg.remove_client(WorkerId(1));
        assert_eq!(reg.get_golden_node("h5"), Some(WorkerId(2)));
    }

    #[test]
    fn golden_node_is_deterministic_for_reproducible_scans() {
        let reg = Registry::new();
        reg.add_toolchain(WorkerId(7), info("h5", 5, "x86_64-linux-gnu"), true);
        reg.add_toolchain(WorkerId(3), info("h5", 5, "x86_64-linux-gnu"), false);
        assert_eq!(reg.get_golden_node("h5"), Some(WorkerId(3)));
    }
}
