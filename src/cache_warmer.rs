//! Cache Warmer (component C9)
//!
//! Runs once at startup, in parallel with the orchestrator's first tick:
//! discovers recently-touched JSONL files and primes the summary cache for
//! them ahead of the first refresh. See SPEC_FULL.md §4.9.

use crate::cache::SummaryCache;
use crate::config::CacheWarmerConfig;
use crate::memory;
use crate::models::ModelPricing;
use crate::parser;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

#[derive(Debug, Default, Clone, Copy)]
pub struct WarmupReport {
    pub files_warmed: usize,
    pub files_failed: usize,
    pub bytes_warmed: u64,
    pub duration_ms: u64,
}

pub struct CacheWarmer {
    config: CacheWarmerConfig,
}

impl CacheWarmer {
    pub fn new(config: CacheWarmerConfig) -> Self {
        Self { config }
    }

    /// Prioritize candidates: files modified today sort first, then yesterday,
    /// then the rest of the trailing week, each bucket newest-first.
    fn prioritize(&self, mut candidates: Vec<(PathBuf, DateTime<Utc>, u64)>, now: DateTime<Utc>) -> Vec<(PathBuf, DateTime<Utc>, u64)> {
        let cutoff = now - chrono::Duration::days(self.config.max_age_days);
        candidates.retain(|(_, mtime, _)| *mtime >= cutoff);
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates.truncate(self.config.max_files);
        candidates
    }

    pub async fn warm(
        &self,
        candidates: Vec<PathBuf>,
        cache: Arc<SummaryCache>,
        pricing: Arc<HashMap<String, ModelPricing>>,
        now: DateTime<Utc>,
    ) -> WarmupReport {
        let start = Instant::now();

        let with_stats: Vec<(PathBuf, DateTime<Utc>, u64)> = candidates
            .into_iter()
            .filter_map(|path| {
                let stat = std::fs::metadata(&path).ok()?;
                let mtime: DateTime<Utc> = stat.modified().ok().map(DateTime::from)?;
                Some((path, mtime, stat.len()))
            })
            .collect();

        let prioritized = self.prioritize(with_stats, now);

        // Shrinks under the same pressure curve that throttles C4's load
        // chunking, so a cold-cache warmup doesn't pile concurrency on top
        // of an already-degraded refresh.
        let worker_pool_size = memory::pressure_scaled_worker_pool(self.config.worker_pool_size);
        let semaphore = Arc::new(Semaphore::new(worker_pool_size));
        let per_file_timeout = Duration::from_secs(self.config.per_file_timeout_secs);
        let mut tasks = JoinSet::new();

        for (path, mtime, size) in prioritized {
            let semaphore = semaphore.clone();
            let cache = cache.clone();
            let pricing = pricing.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let path_for_blocking = path.clone();
                let result = tokio::time::timeout(
                    per_file_timeout,
                    tokio::task::spawn_blocking(move || parser::parse_file(&path_for_blocking, &pricing)),
                )
                .await;

                match result {
                    Ok(Ok(Ok(outcome))) => {
                        if !cache.has(&path.to_string_lossy()) {
                            let summary = crate::loader::build_summary(&path.to_string_lossy(), mtime, size, &outcome.entries);
                            cache.set(summary);
                        }
                        Some(size)
                    }
                    Ok(Ok(Err(e))) => {
                        warn!(file = %path.display(), error = %e, "cache warmer failed to parse file");
                        None
                    }
                    Ok(Err(_)) => {
                        warn!(file = %path.display(), "cache warmer blocking task panicked");
                        None
                    }
                    Err(_) => {
                        warn!(file = %path.display(), timeout_secs = per_file_timeout.as_secs(), "cache warmer per-file timeout exceeded");
                        None
                    }
                }
            });
        }

        let mut report = WarmupReport::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Some(size)) => {
                    report.files_warmed += 1;
                    report.bytes_warmed += size;
                }
                Ok(None) => report.files_failed += 1,
                Err(_) => report.files_failed += 1,
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CacheWarmerConfig {
        CacheWarmerConfig {
            max_age_days: 7,
            max_files: 100,
            worker_pool_size: 4,
            per_file_timeout_secs: 5,
        }
    }

    #[test]
    fn prioritize_drops_files_past_max_age() {
        let warmer = CacheWarmer::new(config());
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);
        let recent = now - chrono::Duration::hours(1);

        let candidates = vec![
            (PathBuf::from("/tmp/old.jsonl"), old, 10),
            (PathBuf::from("/tmp/recent.jsonl"), recent, 10),
        ];

        let result = warmer.prioritize(candidates, now);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].0, PathBuf::from("/tmp/recent.jsonl"));
    }

    #[test]
    fn prioritize_orders_newest_first_and_caps_count() {
        let mut config = config();
        config.max_files = 1;
        let warmer = CacheWarmer::new(config);
        let now = Utc::now();

        let candidates = vec![
            (PathBuf::from("/tmp/a.jsonl"), now - chrono::Duration::hours(2), 10),
            (PathBuf::from("/tmp/b.jsonl"), now - chrono::Duration::hours(1), 10),
        ];

        let result = warmer.prioritize(candidates, now);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].0, PathBuf::from("/tmp/b.jsonl"));
    }

    #[tokio::test]
    async fn warm_reports_zero_for_empty_candidate_list() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(SummaryCache::new(dir.path().to_path_buf(), 100));
        let warmer = CacheWarmer::new(config());
        let report = warmer.warm(Vec::new(), cache, Arc::new(HashMap::new()), Utc::now()).await;
        assert_eq!(report.files_warmed, 0);
        assert_eq!(report.files_failed, 0);
    }
}
