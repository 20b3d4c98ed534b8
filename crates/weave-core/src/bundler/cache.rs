//! Incremental build cache.
//!
//! Transform results are keyed by `(content fingerprint, chain identity)`, so
//! a renamed but unchanged file hits and a changed chain configuration misses
//! without any explicit invalidation. Two tiers:
//!
//! - memory: shared by every build of the process
//! - disk (optional): `<dir>/<chain id>/<fp[..2]>/<fp>.json`, safe to delete
//!
//! At most one computation per key runs at a time; concurrent requests for a
//! key wait for the in-flight result instead of computing it again.

use super::transform::SideArtifact;
use crate::config::BuildConfig;
use crate::error::{CacheIoError, TransformError};
use crate::version::CACHE_SCHEMA_VERSION;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use tracing::{debug, trace, warn};
use weave_util::hash::short;

/// Length of the chain-id directory names of the disk tier.
const CHAIN_DIR_LEN: usize = 16;

/// Cache key: what was transformed and how.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: String,
    pub chain_id: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(fingerprint: impl Into<String>, chain_id: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            chain_id: chain_id.into(),
        }
    }
}

/// A transform result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    #[serde(default)]
    pub side_artifacts: Vec<SideArtifact>,
    /// See [`TransformOutput::url`](super::transform::TransformOutput::url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl CacheEntry {
    #[must_use]
    pub fn new(bytes: Vec<u8>, side_artifacts: Vec<SideArtifact>) -> Self {
        Self {
            bytes,
            side_artifacts,
            url: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }
}

/// Serde helper storing bytes as base64 text.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(bytes: T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Memory,
    Disk,
    /// This request ran the transform.
    Computed,
    /// Another request was already computing it; this one waited.
    Shared,
}

impl CacheStatus {
    #[must_use]
    pub fn is_hit(self) -> bool {
        !matches!(self, Self::Computed)
    }
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub computed: u64,
    pub shared: u64,
    pub disk_errors: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    computed: AtomicU64,
    shared: AtomicU64,
    disk_errors: AtomicU64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskRecord {
    schema: u32,
    fingerprint: String,
    chain_id: String,
    entry: CacheEntry,
}

/// The persisted tier.
#[derive(Debug)]
struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    fn chain_dir(&self, chain_id: &str) -> PathBuf {
        self.dir.join(short(chain_id, CHAIN_DIR_LEN))
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.chain_dir(&key.chain_id)
            .join(short(&key.fingerprint, 2))
            .join(format!("{}.json", key.fingerprint))
    }

    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheIoError> {
        let path = self.entry_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheIoError::new(&path, e)),
        };
        let record: DiskRecord =
            serde_json::from_slice(&bytes).map_err(|e| CacheIoError::new(&path, e))?;
        if record.schema != CACHE_SCHEMA_VERSION
            || record.fingerprint != key.fingerprint
            || record.chain_id != key.chain_id
        {
            return Ok(None);
        }
        Ok(Some(record.entry))
    }

    fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheIoError> {
        let path = self.entry_path(key);
        let record = DiskRecord {
            schema: CACHE_SCHEMA_VERSION,
            fingerprint: key.fingerprint.clone(),
            chain_id: key.chain_id.clone(),
            entry: entry.clone(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| CacheIoError::new(&path, e))?;
        weave_util::fs::atomic_write(&path, &bytes).map_err(|e| CacheIoError::new(&path, e))
    }

    fn evict_chain(&self, chain_id: &str) -> Result<(), CacheIoError> {
        let dir = self.chain_dir(chain_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheIoError::new(&dir, e)),
        }
    }

    fn retain_chains(&self, keep: &[String]) -> Result<usize, CacheIoError> {
        let keep: Vec<&str> = keep.iter().map(|id| short(id, CHAIN_DIR_LEN)).collect();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheIoError::new(&self.dir, e)),
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && !keep.contains(&name.as_str()) {
                std::fs::remove_dir_all(entry.path())
                    .map_err(|e| CacheIoError::new(&entry.path(), e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<(), CacheIoError> {
        weave_util::fs::empty_dir(&self.dir).map_err(|e| CacheIoError::new(&self.dir, e))
    }
}

type Slot = Arc<OnceLock<Result<Arc<CacheEntry>, TransformError>>>;

/// Two-tier transform cache with in-flight deduplication.
#[derive(Debug, Default)]
pub struct IncrementalCache {
    memory: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
    in_flight: Mutex<HashMap<CacheKey, Slot>>,
    disk: Option<DiskCache>,
    counters: Counters,
}

impl IncrementalCache {
    /// A cache without a persisted tier.
    #[must_use]
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    /// A cache persisting entries under `dir`.
    #[must_use]
    pub fn with_disk(dir: impl Into<PathBuf>) -> Self {
        Self {
            disk: Some(DiskCache { dir: dir.into() }),
            ..Self::default()
        }
    }

    /// The cache `config` asks for.
    #[must_use]
    pub fn from_config(config: &BuildConfig) -> Self {
        match config.persistent_cache_dir() {
            Some(dir) => Self::with_disk(dir),
            None => Self::new_in_memory(),
        }
    }

    /// Directory of the persisted tier, if any.
    #[must_use]
    pub fn disk_dir(&self) -> Option<&Path> {
        self.disk.as_ref().map(|d| d.dir.as_path())
    }

    /// Bytes and file count of the persisted tier.
    #[must_use]
    pub fn disk_usage(&self) -> Option<(u64, usize)> {
        self.disk
            .as_ref()
            .map(|d| weave_util::fs::dir_usage(&d.dir))
    }

    fn disk_error(&self, err: &CacheIoError) {
        self.counters.disk_errors.fetch_add(1, Ordering::Relaxed);
        warn!(path = %err.path.display(), error = %err.message, "cache I/O error, recomputing");
    }

    fn remember(&self, key: CacheKey, entry: Arc<CacheEntry>) {
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
    }

    fn memory_get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn disk_get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let disk = self.disk.as_ref()?;
        match disk.load(key) {
            Ok(Some(entry)) => {
                let entry = Arc::new(entry);
                self.remember(key.clone(), Arc::clone(&entry));
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                self.disk_error(&e);
                None
            }
        }
    }

    /// Look up `key` in memory, then on disk.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.memory_get(key) {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry);
        }
        let entry = self.disk_get(key)?;
        self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Store `entry` under `key` in every tier.
    pub fn put(&self, key: CacheKey, entry: CacheEntry) -> Arc<CacheEntry> {
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.store(&key, &entry) {
                self.disk_error(&e);
            }
        }
        let entry = Arc::new(entry);
        self.remember(key, Arc::clone(&entry));
        entry
    }

    /// Return the entry for `key`, running `compute` on a miss.
    ///
    /// Concurrent callers with the same key share one computation. Failed
    /// computations are not cached.
    pub fn get_or_compute<F>(
        &self,
        key: &CacheKey,
        compute: F,
    ) -> (Result<Arc<CacheEntry>, TransformError>, CacheStatus)
    where
        F: FnOnce() -> Result<CacheEntry, TransformError>,
    {
        if let Some(entry) = self.memory_get(key) {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            return (Ok(entry), CacheStatus::Memory);
        }

        let slot: Slot = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            // The computing request fills memory before it releases its slot.
            if let Some(entry) = self.memory_get(key) {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return (Ok(entry), CacheStatus::Memory);
            }
            Arc::clone(in_flight.entry(key.clone()).or_default())
        };

        let mut status = CacheStatus::Shared;
        let result = slot
            .get_or_init(|| {
                if let Some(entry) = self.disk_get(key) {
                    status = CacheStatus::Disk;
                    return Ok(entry);
                }
                status = CacheStatus::Computed;
                compute().map(|entry| self.put(key.clone(), entry))
            })
            .clone();

        match status {
            CacheStatus::Shared => {
                self.counters.shared.fetch_add(1, Ordering::Relaxed);
                trace!(fingerprint = %short(&key.fingerprint, 12), "waited for in-flight transform");
            }
            _ => {
                let counter = if status == CacheStatus::Disk {
                    &self.counters.disk_hits
                } else {
                    &self.counters.computed
                };
                counter.fetch_add(1, Ordering::Relaxed);
                let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                if in_flight.get(key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    in_flight.remove(key);
                }
            }
        }
        (result, status)
    }

    /// Drop every entry produced by `chain_id`.
    pub fn evict_chain(&self, chain_id: &str) {
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|k, _| k.chain_id != chain_id);
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.evict_chain(chain_id) {
                self.disk_error(&e);
            }
        }
        debug!(chain_id = %short(chain_id, 12), "evicted chain");
    }

    /// Drop every entry whose chain is not in `chain_ids`.
    pub fn retain_chains(&self, chain_ids: &[String]) {
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|k, _| chain_ids.contains(&k.chain_id));
        if let Some(disk) = &self.disk {
            match disk.retain_chains(chain_ids) {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "evicted stale chains from disk cache"),
                Err(e) => self.disk_error(&e),
            }
        }
    }

    /// Remove every entry from every tier.
    pub fn clear(&self) -> Result<(), CacheIoError> {
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        match &self.disk {
            Some(disk) => disk.clear(),
            None => Ok(()),
        }
    }

    /// Number of entries held in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memory.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            computed: self.counters.computed.load(Ordering::Relaxed),
            shared: self.counters.shared.load(Ordering::Relaxed),
            disk_errors: self.counters.disk_errors.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
