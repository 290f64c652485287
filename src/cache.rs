//! Summary Cache (component C3)
//!
//! Two-tier cache of [`FileSummary`] keyed by absolute path: an in-memory `moka`
//! LRU (L1) backed by a sharded on-disk JSON store (L2). See SPEC_FULL.md §4.3.

use crate::errors::{Result, UsageError};
use crate::metrics::MetricsCollector;
use crate::models::FileSummary;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use md5::{Digest, Md5};
use moka::sync::Cache as MokaCache;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::warn;

/// Which tier satisfied a `get`, for cache-hit accounting in the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitLayer {
    L1,
    L2,
    Miss,
}

/// MD5 the absolute path into the sharded L2 directory layout `<hash[0:2]>/<hash>.json`.
fn shard_path(cache_dir: &Path, key: &str) -> PathBuf {
    let mut hasher = Md5::new();
    hasher.update(key.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    cache_dir.join(&digest[0..2]).join(format!("{}.json", digest))
}

pub struct SummaryCache {
    cache_dir: PathBuf,
    l1: MokaCache<String, Arc<FileSummary>>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
    metrics: Arc<MetricsCollector>,
}

impl SummaryCache {
    pub fn new(cache_dir: PathBuf, l1_capacity: u64) -> Self {
        Self::with_metrics(cache_dir, l1_capacity, Arc::new(MetricsCollector::new()))
    }

    /// Builds a cache reporting into `metrics`, so a shared collector can
    /// observe every cache instance in the process (C10 is observed by all
    /// cache components, per SPEC_FULL.md §2).
    pub fn with_metrics(cache_dir: PathBuf, l1_capacity: u64, metrics: Arc<MetricsCollector>) -> Self {
        let l1 = MokaCache::builder().max_capacity(l1_capacity).build();
        let cache = Self {
            cache_dir,
            l1,
            write_locks: DashMap::new(),
            metrics,
        };
        cache.preload();
        cache
    }

    /// Exposes the collector so callers can publish combined latency/percentile
    /// reports alongside the raw counters in [`SummaryCache::stats`].
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Scan the L2 directory at startup and warm L1 with every summary found.
    fn preload(&self) {
        let Ok(shards) = fs::read_dir(&self.cache_dir) else {
            return;
        };
        for shard in shards.flatten() {
            let Ok(entries) = fs::read_dir(shard.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Ok(content) = fs::read_to_string(&path) {
                    if let Ok(summary) = serde_json::from_str::<FileSummary>(&content) {
                        self.l1.insert(summary.absolute_path.clone(), Arc::new(summary));
                    }
                }
            }
        }
    }

    pub fn get(&self, path: &str) -> (Option<Arc<FileSummary>>, HitLayer) {
        let started = Instant::now();
        self.metrics.record_request();

        if let Some(summary) = self.l1.get(path) {
            self.metrics.record_hit();
            self.metrics.record_read_latency(started.elapsed());
            return (Some(summary), HitLayer::L1);
        }

        let result = match self.load_l2(path) {
            Ok(Some(summary)) => {
                let summary = Arc::new(summary);
                self.l1.insert(path.to_string(), summary.clone());
                self.metrics.record_hit();
                (Some(summary), HitLayer::L2)
            }
            Ok(None) => {
                self.metrics.record_miss();
                (None, HitLayer::Miss)
            }
            Err(e) => {
                warn!(path = %path, error = %e, "discarding corrupted cache entry");
                let _ = fs::remove_file(shard_path(&self.cache_dir, path));
                self.metrics.record_miss();
                (None, HitLayer::Miss)
            }
        };
        self.metrics.record_read_latency(started.elapsed());
        result
    }

    pub fn has(&self, path: &str) -> bool {
        self.l1.contains_key(path) || shard_path(&self.cache_dir, path).exists()
    }

    /// `true` if the cached summary no longer matches the file on disk.
    pub fn is_stale(&self, path: &str, mod_time: DateTime<Utc>, file_size: u64) -> bool {
        match self.get(path) {
            (Some(summary), _) => summary.is_stale(mod_time, file_size),
            (None, _) => true,
        }
    }

    fn load_l2(&self, path: &str) -> Result<Option<FileSummary>> {
        let file_path = shard_path(&self.cache_dir, path);
        if !file_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&file_path).map_err(UsageError::Io)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| UsageError::CacheCorruption(e.to_string()))
    }

    /// Update L1 immediately and write L2 under a per-key lock so two refreshes
    /// racing on the same file serialize their writes.
    pub fn set(&self, summary: FileSummary) {
        let started = Instant::now();
        let key = summary.absolute_path.clone();
        self.l1.insert(key.clone(), Arc::new(summary.clone()));

        let lock = self
            .write_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().unwrap();

        let file_path = shard_path(&self.cache_dir, &key);
        if let Some(parent) = file_path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let Ok(content) = serde_json::to_string(&summary) else {
            return;
        };
        let tmp = file_path.with_extension("json.tmp");
        if fs::write(&tmp, content).is_ok() {
            let _ = fs::rename(&tmp, &file_path);
            self.metrics.record_write();
            self.metrics.record_write_latency(started.elapsed());
        }
    }

    pub fn invalidate(&self, path: &str) {
        self.l1.invalidate(path);
        let _ = fs::remove_file(shard_path(&self.cache_dir, path));
        self.metrics.record_eviction();
    }

    pub fn stats(&self) -> CacheStats {
        let counters = self.metrics.counters();
        CacheStats {
            requests: counters.requests,
            hits: counters.hits,
            misses: counters.misses,
            writes: counters.writes,
            l1_entries: self.l1.entry_count(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub l1_entries: u64,
}
