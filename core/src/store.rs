use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::job::{JobSpec, JobState, LocationFix};

/// Minimal key/value interface over byte keys and values.
pub trait Kv: Clone + Send + Sync + 'static {
    /// Get value bytes for `key`, if present.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    /// Set value bytes for `key`, overwriting if it exists.
    fn put(&self, key: &[u8], val: &[u8]) -> Result<()>;
    /// Delete `key`; returns `true` if a value existed.
    fn delete(&self, key: &[u8]) -> bool;
}

/// Serde helpers layered on top of any [`Kv`] implementation.
pub trait KvSerde: Kv {
    /// Deserialize type `T` stored at `key` using `bincode`.
    fn get_t<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key) {
            Some(bytes) => {
                let v = bincode::deserialize::<T>(&bytes)
                    .with_context(|| "bincode deserialize")?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }
    /// Serialize `val` with `bincode` and store at `key`.
    fn put_t<T: Serialize>(&self, key: &[u8], val: &T) -> Result<()> {
        let buf = bincode::serialize(val).with_context(|| "bincode serialize")?;
        self.put(key, &buf)
    }
}
impl<T: Kv> KvSerde for T {}

/// Build a namespaced key as bytes: `"{ns}:{key}"`.
pub fn ns(ns: &str, key: &str) -> Vec<u8> {
    let mut s = String::with_capacity(ns.len() + 1 + key.len());
    s.push_str(ns);
    s.push(':');
    s.push_str(key);
    s.into_bytes()
}

/* --------------------- FsKv --------------------- */

/// Filesystem-backed store: one file per key under `root`.
#[derive(Clone, Debug)]
pub struct FsKv {
    root: PathBuf,
}

/// Default KV type used by the binaries (FS-backed).
pub type DefaultKv = FsKv;

/// Open an FS-backed KV rooted at `dir` (created if missing).
pub fn open_fs<P: AsRef<Path>>(dir: P) -> Result<FsKv> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root)
        .with_context(|| format!("create kv dir {}", root.display()))?;
    Ok(FsKv { root })
}

impl FsKv {
    fn path_for(&self, key: &[u8]) -> PathBuf {
        // Hex file names keep `:` and other bytes out of the path.
        let mut name = String::with_capacity(key.len() * 2);
        for &b in key {
            name.push(hex_digit(b >> 4));
            name.push(hex_digit(b & 0xF));
        }
        self.root.join(name)
    }
}

fn hex_digit(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'a' + (n - 10)) as char,
        _ => '?',
    }
}

impl Kv for FsKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        fs::read(self.path_for(key)).ok()
    }

    fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(val)?;
        f.sync_all()?;
        fs::rename(&tmp, &path).with_context(|| format!("rename {}", path.display()))?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> bool {
        fs::remove_file(self.path_for(key)).is_ok()
    }
}

/* --------------------- MemKv --------------------- */

/// Process-local store; clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemKv {
    map: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemKv {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// `true` when no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Kv for MemKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut map = self.map.lock().map_err(|_| anyhow::anyhow!("mem kv poisoned"))?;
        map.insert(key.to_vec(), val.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.map
            .lock()
            .map(|mut m| m.remove(key).is_some())
            .unwrap_or(false)
    }
}

/* --------------------- typed job/fix records --------------------- */

fn spec_key(name: &str) -> Vec<u8> {
    ns("jobs", &format!("{name}:spec"))
}

fn state_key(name: &str) -> Vec<u8> {
    ns("jobs", &format!("{name}:state"))
}

fn registry_key() -> Vec<u8> {
    ns("jobs", "registry")
}

/// Persisted periodic registrations and the fixes they produced.
#[derive(Clone, Debug)]
pub struct JobStore<K: Kv> {
    kv: K,
}

impl<K: Kv> JobStore<K> {
    /// Wrap a KV engine.
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    /// The underlying KV.
    pub fn kv(&self) -> &K {
        &self.kv
    }

    /// Names of every persisted registration, in registration order.
    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self.kv.get_t(&registry_key())?.unwrap_or_default())
    }

    /// Persist `spec` and add its name to the registry.
    pub fn save_spec(&self, spec: &JobSpec) -> Result<()> {
        let mut names = self.names()?;
        if !names.iter().any(|n| n == &spec.name) {
            names.push(spec.name.clone());
            self.kv.put_t(&registry_key(), &names)?;
        }
        self.kv.put_t(&spec_key(&spec.name), spec)
    }

    /// Load the spec stored under `name`.
    pub fn spec(&self, name: &str) -> Result<Option<JobSpec>> {
        self.kv.get_t(&spec_key(name))
    }

    /// Every persisted spec; unreadable entries are skipped.
    pub fn specs(&self) -> Result<Vec<JobSpec>> {
        let mut out = Vec::new();
        for name in self.names()? {
            match self.spec(&name) {
                Ok(Some(spec)) => out.push(spec),
                Ok(None) => {}
                Err(e) => tracing::warn!("skip unreadable spec {name}: {e:#}"),
            }
        }
        Ok(out)
    }

    /// Load runtime state for `name` (default when absent).
    pub fn state(&self, name: &str) -> Result<JobState> {
        Ok(self.kv.get_t(&state_key(name))?.unwrap_or_default())
    }

    /// Persist runtime state for `name`.
    pub fn save_state(&self, name: &str, state: &JobState) -> Result<()> {
        self.kv.put_t(&state_key(name), state)
    }

    /// Drop spec, state and registry entry. Returns `true` if it was registered.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut names = self.names()?;
        let before = names.len();
        names.retain(|n| n != name);
        let existed = names.len() != before;
        if existed {
            self.kv.put_t(&registry_key(), &names)?;
        }
        self.kv.delete(&spec_key(name));
        self.kv.delete(&state_key(name));
        Ok(existed)
    }

    /// Store `fix` as the latest for `name` and bump its count.
    pub fn record_fix(&self, name: &str, fix: &LocationFix) -> Result<u64> {
        let count_key = ns("fixes", &format!("{name}:count"));
        let count = self.kv.get_t::<u64>(&count_key)?.unwrap_or(0) + 1;
        self.kv.put_t(&ns("fixes", &format!("{name}:last")), fix)?;
        self.kv.put_t(&count_key, &count)?;
        Ok(count)
    }

    /// Latest fix recorded for `name`.
    pub fn last_fix(&self, name: &str) -> Result<Option<LocationFix>> {
        self.kv.get_t(&ns("fixes", &format!("{name}:last")))
    }

    /// Number of fixes recorded for `name`.
    pub fn fix_count(&self, name: &str) -> Result<u64> {
        Ok(self.kv.get_t(&ns("fixes", &format!("{name}:count")))?.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Action, Constraint};
    use std::time::Duration;

    fn spec(name: &str) -> JobSpec {
        JobSpec::periodic(
            name,
            Duration::from_secs(3600),
            Action::SampleLocation { deadline_ms: 20_000, high_accuracy: true, background: true },
        )
        .with_constraint(Constraint::BatteryNotLow)
    }

    #[test]
    fn fs_kv_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_fs(dir.path()).unwrap();
        kv.put(b"jobs:a", b"one").unwrap();
        assert_eq!(kv.get(b"jobs:a").as_deref(), Some(&b"one"[..]));
        kv.put(b"jobs:a", b"two").unwrap();
        assert_eq!(kv.get(b"jobs:a").as_deref(), Some(&b"two"[..]));
        assert!(kv.delete(b"jobs:a"));
        assert!(!kv.delete(b"jobs:a"));
        assert!(kv.get(b"jobs:a").is_none());
    }

    #[test]
    fn registry_dedups_names_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(open_fs(dir.path()).unwrap());
        store.save_spec(&spec("LocationWork")).unwrap();
        store.save_spec(&spec("LocationWork")).unwrap();
        store.save_spec(&spec("Other")).unwrap();

        let reopened = JobStore::new(open_fs(dir.path()).unwrap());
        assert_eq!(reopened.names().unwrap(), vec!["LocationWork", "Other"]);
        assert_eq!(reopened.spec("LocationWork").unwrap(), Some(spec("LocationWork")));
    }

    #[test]
    fn remove_clears_spec_and_state() {
        let store = JobStore::new(MemKv::new());
        store.save_spec(&spec("a")).unwrap();
        store
            .save_state("a", &JobState { runs: 3, ..JobState::default() })
            .unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(store.specs().unwrap().is_empty());
        assert_eq!(store.state("a").unwrap(), JobState::default());
        // only the (now empty) registry list remains
        assert_eq!(store.kv().len(), 1);
    }

    #[test]
    fn fixes_are_counted() {
        let store = JobStore::new(MemKv::new());
        let fix = LocationFix { latitude: 1.0, longitude: 2.0, accuracy_m: 3.0, timestamp_ms: 4 };
        assert_eq!(store.record_fix("a", &fix).unwrap(), 1);
        assert_eq!(store.record_fix("a", &fix).unwrap(), 2);
        assert_eq!(store.last_fix("a").unwrap(), Some(fix));
        assert_eq!(store.fix_count("b").unwrap(), 0);
    }
}
