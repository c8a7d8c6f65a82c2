//! Content-addressed object cache.
//!
//! On-disk layout under `$HOME/.splash/cache-<name>/`:
//! `<xx>/<oid-64hex>/{data,hash,log,failed?}` where `<xx>` is the first two
//! hex nibbles of the oid. `hash` holds 64 hex bytes of `H(data)`; `failed`,
//! when present, marks a failed entry (no `data`).
//!
//! A single mutex serializes all index and filesystem mutations. Readers
//! hold it only long enough to check membership; bulk I/O happens against
//! local paths with the mutex released.

use crate::errors::*;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Missing,
    Ready,
    Failed,
    Building,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    state: State,
    stored_hash: Option<String>,
}

pub struct ObjectCache {
    root: PathBuf,
    index: Mutex<HashMap<String, IndexEntry>>,
    /// Soft byte budget for the on-disk `data` files; `None` disables
    /// eviction entirely (Open Question 9(b): no threshold is prescribed
    /// by the design, so the caller picks one).
    byte_budget: Option<u64>,
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    hex::encode(digest.as_ref())
}

fn shard_dir(root: &Path, oid: &str) -> PathBuf {
    let nibbles = if oid.len() >= 2 { &oid[..2] } else { oid };
    root.join(nibbles)
}

fn entry_dir(root: &Path, oid: &str) -> PathBuf {
    shard_dir(root, oid).join(oid)
}

impl ObjectCache {
    /// Opens (creating if necessary) the cache rooted at
    /// `$HOME/.splash/cache-<name>/` and scans existing shards, registering
    /// valid-looking oids by reading only their `hash` file. Full
    /// `validate()` is deferred to first access, as spec'd.
    pub fn open(name: &str, byte_budget: Option<u64>) -> Result<ObjectCache> {
        let base = splash_home_dir()?;
        Self::open_at(base.join(format!("cache-{}", name)), byte_budget)
    }

    /// Same as `open`, but rooted at an arbitrary directory instead of
    /// `$HOME/.splash/cache-<name>`. Lets callers (tests, multi-tenant
    /// hosting) pick their own cache location explicitly.
    pub fn open_at(root: PathBuf, byte_budget: Option<u64>) -> Result<ObjectCache> {
        fs::create_dir_all(&root)?;

        let mut index = HashMap::new();
        if let Ok(shards) = fs::read_dir(&root) {
            for shard in shards.flatten() {
                if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let Ok(oids) = fs::read_dir(shard.path()) else { continue };
                for oid_dir in oids.flatten() {
                    let path = oid_dir.path();
                    if !path.is_dir() {
                        continue;
                    }
                    let oid = match path.file_name().and_then(|n| n.to_str()) {
                        Some(o) => o.to_owned(),
                        None => continue,
                    };
                    let failed = path.join("failed").exists();
                    if failed {
                        index.insert(oid, IndexEntry { state: State::Failed, stored_hash: None });
                        continue;
                    }
                    match fs::read_to_string(path.join("hash")) {
                        Ok(h) => {
                            index.insert(oid, IndexEntry { state: State::Ready, stored_hash: Some(h.trim().to_owned()) });
                        }
                        Err(_) => {
                            log::warn!("cache entry {} has no readable hash file, discarding", oid);
                            let _ = fs::remove_dir_all(&path);
                        }
                    }
                }
            }
        }

        Ok(ObjectCache { root, index: Mutex::new(index), byte_budget })
    }

    pub fn state(&self, oid: &str) -> State {
        self.index.lock().unwrap().get(oid).map(|e| e.state).unwrap_or(State::Missing)
    }

    pub fn is_cached(&self, oid: &str) -> bool {
        self.state(oid) == State::Ready
    }

    pub fn is_failed(&self, oid: &str) -> bool {
        self.state(oid) == State::Failed
    }

    pub fn mark_building(&self, oid: &str) {
        let mut index = self.index.lock().unwrap();
        index.entry(oid.to_owned()).or_insert(IndexEntry { state: State::Building, stored_hash: None }).state = State::Building;
    }

    /// Idempotent: a second `add` with an oid already present is a no-op.
    /// If the on-disk directory exists but the in-memory index doesn't
    /// know about it, it is purged and rewritten rather than trusted.
    pub fn add(&self, basename: &str, oid: &str, content_hash: &str, data: &[u8], log: &str) -> Result<()> {
        let mut index = self.index.lock().unwrap();
        if matches!(index.get(oid), Some(e) if e.state == State::Ready) {
            return Ok(());
        }

        let dir = entry_dir(&self.root, oid);
        if dir.exists() && !index.contains_key(oid) {
            fs::remove_dir_all(&dir)?;
        }

        if let Err(e) = write_entry(&dir, basename, content_hash, Some(data), log, false) {
            log::warn!("failed to write cache entry {}: {}", oid, e);
            index.remove(oid);
            return Ok(());
        }

        index.insert(oid.to_owned(), IndexEntry { state: State::Ready, stored_hash: Some(content_hash.to_owned()) });
        Ok(())
    }

    pub fn add_failed(&self, basename: &str, oid: &str, log: &str) -> Result<()> {
        let mut index = self.index.lock().unwrap();
        if matches!(index.get(oid), Some(e) if e.state == State::Failed) {
            return Ok(());
        }

        let dir = entry_dir(&self.root, oid);
        if dir.exists() && !index.contains_key(oid) {
            fs::remove_dir_all(&dir)?;
        }

        if let Err(e) = write_entry(&dir, basename, "", None, log, true) {
            log::warn!("failed to write failed-cache entry {}: {}", oid, e);
            index.remove(oid);
            return Ok(());
        }

        index.insert(oid.to_owned(), IndexEntry { state: State::Failed, stored_hash: None });
        Ok(())
    }

    pub fn read(&self, oid: &str) -> Result<Vec<u8>> {
        if self.state(oid) != State::Ready {
            return Err(ErrorKind::NotCached(oid.to_owned()).into());
        }
        let dir = entry_dir(&self.root, oid);
        let data = fs::read(dir.join("data"))?;
        let _ = filetime::set_file_mtime(dir.join("data"), filetime::FileTime::now());
        Ok(data)
    }

    pub fn read_log(&self, oid: &str) -> Result<String> {
        let dir = entry_dir(&self.root, oid);
        Ok(fs::read_to_string(dir.join("log")).unwrap_or_default())
    }

    /// Recomputes `H(data)` and compares to the stored hash; a mismatch
    /// evicts the entry and reports `false`.
    pub fn validate(&self, oid: &str) -> bool {
        let dir = entry_dir(&self.root, oid);
        let data = match fs::read(dir.join("data")) {
            Ok(d) => d,
            Err(_) => return false,
        };
        let stored = {
            let index = self.index.lock().unwrap();
            match index.get(oid) {
                Some(e) if e.state == State::Ready => e.stored_hash.clone(),
                _ => return false,
            }
        };
        let stored = match stored {
            Some(h) => h,
            None => return false,
        };
        if sha256_hex(&data) == stored {
            true
        } else {
            log::error!("cache entry {} failed integrity check, evicting", oid);
            let _ = fs::remove_dir_all(&dir);
            self.index.lock().unwrap().remove(oid);
            false
        }
    }

    /// Trims the `data` files with the oldest access time until the total
    /// is under the configured byte budget. A `None` budget is a no-op.
    /// This is the size-bounded LRU referenced (but never implemented) by
    /// the original design notes.
    pub fn evict_to_budget(&self) -> Result<()> {
        let Some(budget) = self.byte_budget else { return Ok(()) };

        let mut index = self.index.lock().unwrap();
        let mut entries: Vec<(String, PathBuf, u64, filetime::FileTime)> = Vec::new();
        let mut total: u64 = 0;
        for oid in index.keys() {
            let dir = entry_dir(&self.root, oid);
            let data_path = dir.join("data");
            if let Ok(meta) = fs::metadata(&data_path) {
                let len = meta.len();
                let atime = filetime::FileTime::from_last_access_time(&meta);
                total += len;
                entries.push((oid.clone(), dir, len, atime));
            }
        }
        if total <= budget {
            return Ok(());
        }

        entries.sort_by_key(|(_, _, _, atime)| *atime);
        for (oid, dir, len, _) in entries {
            if total <= budget {
                break;
            }
            if fs::remove_dir_all(&dir).is_ok() {
                index.remove(&oid);
                total = total.saturating_sub(len);
            }
        }
        Ok(())
    }
}

fn write_entry(dir: &Path, basename: &str, content_hash: &str, data: Option<&[u8]>, log: &str, failed: bool) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    if let Some(data) = data {
        fs::write(dir.join("data"), data)?;
        fs::write(dir.join("hash"), content_hash)?;
    }
    fs::write(dir.join("log"), strip_ansi_escapes::strip(log.as_bytes())?)?;
    if failed {
        fs::File::create(dir.join("failed"))?;
    }
    let _ = basename; // retained for parity with on-disk layout conventions; not itself part of the path
    Ok(())
}

pub fn splash_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or_else(|| Error::from("could not determine home directory"))?;
    Ok(home.join(".splash"))
}

/// Content hash of a leaf file: simply `H(data)`, matching the oid rule
/// for `SourceFile` nodes.
pub fn content_hash(data: &[u8]) -> String {
    sha256_hex(data)
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn test_cache() -> (TempDir, ObjectCache) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("cache-test");
        std::fs::create_dir_all(&root).unwrap();
        let cache = ObjectCache { root, index: Mutex::new(HashMap::new()), byte_budget: None };
        (tmp, cache)
    }

    #[test]
    fn add_is_idempotent() {
        let (_tmp, cache) = test_cache();
        let data = b"int main(){}";
        let hash = content_hash(data);
        cache.add("main.o", "deadbeef", &hash, data, "log one").unwrap();
        cache.add("main.o", "deadbeef", &hash, data, "log two").unwrap();
        assert_eq!(cache.state("deadbeef"), State::Ready);
        assert_eq!(cache.read("deadbeef").unwrap(), data);
        // second add() is a no-op, so the first log wins
        assert_eq!(cache.read_log("deadbeef").unwrap(), "log one");
    }

    #[test]
    fn validate_evicts_on_hash_mismatch() {
        let (_tmp, cache) = test_cache();
        cache.add("foo", "oid1", &content_hash(b"foo"), b"bar", "").unwrap();
        assert!(!cache.validate("oid1"));
        assert_eq!(cache.state("oid1"), State::Missing);
    }

    #[test]
    fn failed_entries_have_no_data() {
        let (_tmp, cache) = test_cache();
        cache.add_failed("a.o", "oid2", "compile error: foo.c:3").unwrap();
        assert!(cache.is_failed("oid2"));
        assert!(cache.read("oid2").is_err());
        assert_eq!(cache.read_log("oid2").unwrap(), "compile error: foo.c:3");
    }

    #[test]
    fn eviction_respects_byte_budget() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("cache-test");
        std::fs::create_dir_all(&root).unwrap();
        let cache = ObjectCache { root, index: Mutex::new(HashMap::new()), byte_budget: Some(10) };
        cache.add("a", "oid_a", &content_hash(b"aaaaaaaaaa"), b"aaaaaaaaaa", "").unwrap();
        cache.add("b", "oid_b", &content_hash(b"bbbbbbbbbb"), b"bbbbbbbbbb", "").unwrap();
        cache.evict_to_budget().unwrap();
        let ready = [cache.state("oid_a"), cache.state("oid_b")];
        assert_eq!(ready.iter().filter(|s| **s == State::Ready).count(), 1);
    }
}
