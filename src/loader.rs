//! Loader (component C4)
//!
//! Turns a root directory of JSONL logs into a flat, deduplicated list of
//! [`UsageEntry`], using the summary cache to skip unchanged files. See
//! SPEC_FULL.md §4.4.

use crate::cache::SummaryCache;
use crate::config::get_config;
use crate::file_discovery::FileDiscovery;
use crate::memory;
use crate::models::{AnalysisMetadata, FileSummary, ModelPricing, ModelStats, TemporalBucket, UsageEntry};
use crate::parser;
use chrono::{DateTime, Duration, Timelike, Utc};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct LoadOptions {
    pub root: PathBuf,
    pub exclude_vms: bool,
    pub dedup_enabled: bool,
}

pub struct LoadResult {
    pub entries: Vec<UsageEntry>,
    pub metadata: AnalysisMetadata,
    /// Set when `cancel` fired before the load finished; `entries` is a
    /// partial, best-effort result and must not be published as a snapshot.
    pub cancelled: bool,
}

/// Hash a synthetic or unfingerprintable entry for dedup purposes.
fn content_fingerprint(entry: &UsageEntry) -> String {
    entry.fingerprint().unwrap_or_else(|| {
        format!(
            "{}:{}:{}:{}:{}",
            entry.timestamp.timestamp(),
            entry.model,
            entry.input_tokens,
            entry.output_tokens,
            entry.cost_usd
        )
    })
}

fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

fn floor_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Build a cacheable [`FileSummary`] from a freshly parsed file's entries.
pub(crate) fn build_summary(path: &str, mod_time: DateTime<Utc>, file_size: u64, entries: &[UsageEntry]) -> FileSummary {
    let mut summary = FileSummary {
        absolute_path: path.to_string(),
        mod_time,
        file_size,
        entry_count: entries.len() as u64,
        total_cost: 0.0,
        total_tokens: 0,
        model_stats: HashMap::new(),
        hourly_buckets: HashMap::new(),
        daily_buckets: HashMap::new(),
        processed_hashes: HashSet::new(),
    };

    for entry in entries {
        summary.total_cost += entry.cost_usd;
        summary.total_tokens += entry.total_tokens();
        summary
            .model_stats
            .entry(entry.model.clone())
            .or_default()
            .add_entry(entry);
        summary.processed_hashes.insert(content_fingerprint(entry));

        let hour_key = floor_to_hour(entry.timestamp).to_rfc3339();
        summary
            .hourly_buckets
            .entry(hour_key)
            .or_insert_with(TemporalBucket::default)
            .add_entry(entry);

        let day_key = floor_to_day(entry.timestamp).to_rfc3339();
        summary
            .daily_buckets
            .entry(day_key)
            .or_insert_with(TemporalBucket::default)
            .add_entry(entry);
    }

    summary
}

/// Reconstruct synthetic per-entry records from a cached summary's per-(hour,model)
/// aggregates. Sums over the synthetic entries exactly equal the stored aggregates
/// (SPEC_FULL.md §4.4.1) — this is the contract a naive one-entry-per-bucket
/// materialization violates.
fn materialize(summary: &FileSummary) -> Vec<UsageEntry> {
    let mut entries = Vec::with_capacity(summary.entry_count as usize);

    for (hour_key, bucket) in &summary.hourly_buckets {
        let Ok(hour_start) = DateTime::parse_from_rfc3339(hour_key) else {
            continue;
        };
        let hour_start = hour_start.with_timezone(&Utc);

        for (model, stats) in &bucket.by_model {
            let n = stats.entry_count;
            if n == 0 {
                continue;
            }

            let input_avg = stats.input_tokens / n;
            let input_rem = stats.input_tokens % n;
            let output_avg = stats.output_tokens / n;
            let output_rem = stats.output_tokens % n;
            let cache_creation_avg = stats.cache_creation_tokens / n;
            let cache_creation_rem = stats.cache_creation_tokens % n;
            let cache_read_avg = stats.cache_read_tokens / n;
            let cache_read_rem = stats.cache_read_tokens % n;
            let cost_per_entry = stats.cost_usd / n as f64;

            for i in 0..n {
                entries.push(UsageEntry {
                    timestamp: hour_start + Duration::minutes(i as i64),
                    model: model.clone(),
                    input_tokens: input_avg + if i < input_rem { 1 } else { 0 },
                    output_tokens: output_avg + if i < output_rem { 1 } else { 0 },
                    cache_creation_tokens: cache_creation_avg + if i < cache_creation_rem { 1 } else { 0 },
                    cache_read_tokens: cache_read_avg + if i < cache_read_rem { 1 } else { 0 },
                    cost_usd: cost_per_entry,
                    message_id: String::new(),
                    request_id: String::new(),
                    session_id: String::new(),
                });
            }
        }
    }

    entries
}

pub struct Loader {
    discovery: FileDiscovery,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    pub fn new() -> Self {
        Self {
            discovery: FileDiscovery::new(),
        }
    }

    pub fn load(
        &self,
        options: &LoadOptions,
        pricing: &HashMap<String, ModelPricing>,
        cache: &SummaryCache,
        cancel: &CancellationToken,
    ) -> LoadResult {
        let start = Instant::now();
        let mut metadata = AnalysisMetadata::default();

        if cancel.is_cancelled() {
            return LoadResult { entries: Vec::new(), metadata, cancelled: true };
        }

        let claude_paths = match self.discovery.discover_claude_paths(&options.root, options.exclude_vms) {
            Ok(paths) => paths,
            Err(e) => {
                metadata.processing_errors += 1;
                metadata.last_error = Some(e.to_string());
                return LoadResult { entries: Vec::new(), metadata, cancelled: false };
            }
        };

        let file_tuples = self
            .discovery
            .find_jsonl_files(&claude_paths)
            .unwrap_or_default();
        let file_tuples = self.discovery.sort_files_by_timestamp(file_tuples);

        let mut fresh: Vec<PathBuf> = Vec::new();
        let mut cached_summaries: Vec<FileSummary> = Vec::new();

        for (path, _) in &file_tuples {
            let path_str = path.to_string_lossy().to_string();
            let stat = match std::fs::metadata(path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let mod_time: DateTime<Utc> = stat.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
            let file_size = stat.len();

            if cache.is_stale(&path_str, mod_time, file_size) {
                fresh.push(path.clone());
            } else if let (Some(summary), _) = cache.get(&path_str) {
                cached_summaries.push((*summary).clone());
                metadata.cache_hits += 1;
            } else {
                fresh.push(path.clone());
            }
        }

        let base_chunk_size = get_config().processing.batch_size;
        let adaptive_chunk_size = memory::get_adaptive_batch_size(base_chunk_size).max(1);
        debug!(
            fresh = fresh.len(),
            cached = cached_summaries.len(),
            chunk_size = adaptive_chunk_size,
            "loader partitioned files"
        );

        let mut fresh_entries: Vec<UsageEntry> = Vec::new();
        let mut cancelled = false;

        for chunk in fresh.chunks(adaptive_chunk_size) {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let chunk_results: Vec<_> = chunk
                .par_iter()
                .map(|path| {
                    let outcome = parser::parse_file(path, pricing);
                    (path.clone(), outcome)
                })
                .collect();

            for (path, outcome) in chunk_results {
                metadata.files_processed += 1;
                match outcome {
                    Ok(outcome) => {
                        let path_str = path.to_string_lossy().to_string();
                        if let Ok(stat) = std::fs::metadata(&path) {
                            let mod_time: DateTime<Utc> =
                                stat.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
                            let summary = build_summary(&path_str, mod_time, stat.len(), &outcome.entries);
                            cache.set(summary);
                        }
                        metadata.cache_misses += 1;
                        fresh_entries.extend(outcome.entries);
                    }
                    Err(e) => {
                        metadata.processing_errors += 1;
                        warn!(file = %path.display(), error = %e, "failed to parse file");
                    }
                }
            }
        }

        let materialized: Vec<UsageEntry> = cached_summaries.iter().flat_map(materialize).collect();

        let mut entries: Vec<UsageEntry> = Vec::with_capacity(fresh_entries.len() + materialized.len());
        entries.extend(fresh_entries);
        entries.extend(materialized);

        if options.dedup_enabled {
            let mut seen: HashSet<String> = HashSet::new();
            entries.retain(|entry| seen.insert(content_fingerprint(entry)));
        }

        metadata.entries_loaded = entries.len();
        metadata.load_duration_ms = start.elapsed().as_millis() as u64;

        LoadResult { entries, metadata, cancelled }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn materialize_preserves_aggregate_sums() {
        let mut bucket = TemporalBucket::default();
        let mut stats = ModelStats::default();
        stats.entry_count = 7;
        stats.input_tokens = 100;
        stats.output_tokens = 53;
        stats.cache_creation_tokens = 0;
        stats.cache_read_tokens = 0;
        stats.cost_usd = 1.4;
        bucket.by_model.insert("claude-3-5-sonnet".to_string(), stats);

        let mut summary = FileSummary {
            absolute_path: "/tmp/f.jsonl".to_string(),
            mod_time: ts(0, 0),
            file_size: 10,
            entry_count: 7,
            total_cost: 1.4,
            total_tokens: 153,
            model_stats: HashMap::new(),
            hourly_buckets: HashMap::new(),
            daily_buckets: HashMap::new(),
            processed_hashes: HashSet::new(),
        };
        summary.hourly_buckets.insert(ts(3, 0).to_rfc3339(), bucket);

        let entries = materialize(&summary);
        assert_eq!(entries.len(), 7);
        let total_input: u64 = entries.iter().map(|e| e.input_tokens).sum();
        let total_output: u64 = entries.iter().map(|e| e.output_tokens).sum();
        let total_cost: f64 = entries.iter().map(|e| e.cost_usd).sum();
        assert_eq!(total_input, 100);
        assert_eq!(total_output, 53);
        assert!((total_cost - 1.4).abs() < 1e-9);
    }

    #[test]
    fn materialize_assigns_distinct_timestamps_within_hour() {
        let mut bucket = TemporalBucket::default();
        let mut stats = ModelStats::default();
        stats.entry_count = 3;
        stats.input_tokens = 30;
        bucket.by_model.insert("claude-3-5-sonnet".to_string(), stats);

        let mut summary = FileSummary {
            absolute_path: "/tmp/g.jsonl".to_string(),
            mod_time: ts(0, 0),
            file_size: 10,
            entry_count: 3,
            total_cost: 0.0,
            total_tokens: 30,
            model_stats: HashMap::new(),
            hourly_buckets: HashMap::new(),
            daily_buckets: HashMap::new(),
            processed_hashes: HashSet::new(),
        };
        summary.hourly_buckets.insert(ts(5, 0).to_rfc3339(), bucket);

        let mut entries = materialize(&summary);
        entries.sort_by_key(|e| e.timestamp);
        let timestamps: HashSet<_> = entries.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps.len(), 3);
        assert!(entries.iter().all(|e| e.timestamp.hour() == 5));
    }

    #[test]
    fn pre_cancelled_token_short_circuits_before_discovery() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let dir = tempfile::tempdir().unwrap();
        let cache = SummaryCache::new(dir.path().to_path_buf(), 10);
        let loader = Loader::new();
        let options = LoadOptions {
            root: dir.path().to_path_buf(),
            exclude_vms: false,
            dedup_enabled: false,
        };

        let result = loader.load(&options, &HashMap::new(), &cache, &cancel);
        assert!(result.cancelled);
        assert!(result.entries.is_empty());
    }

    #[test]
    fn dedup_keeps_first_seen_entry() {
        let a = UsageEntry {
            timestamp: ts(0, 0),
            model: "claude-3-5-sonnet".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            cost_usd: 0.1,
            message_id: "m1".to_string(),
            request_id: "r1".to_string(),
            session_id: String::new(),
        };
        let mut b = a.clone();
        b.cost_usd = 0.2; // different payload, same fingerprint

        let mut entries = vec![a.clone(), b];
        let mut seen: HashSet<String> = HashSet::new();
        entries.retain(|entry| seen.insert(content_fingerprint(entry)));

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cost_usd, 0.1);
    }
}
