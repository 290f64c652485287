//! Aggregation Engine (component C6)
//!
//! An embedded ordered key-value store for hourly/daily roll-ups, backed by
//! `sled` — the Rust analogue of the badger store the original design named,
//! with the same operational shape: directory-owned, single-writer, ordered
//! range scans. See SPEC_FULL.md §4.6.

use crate::config::AggregationConfig;
use crate::errors::{Result, UsageError};
use crate::metrics::MetricsCollector;
use crate::models::{DailyAggregation, HourlyAggregation, ModelStats, UsageEntry};
use chrono::{DateTime, Duration, Timelike, Utc};
use md5::{Digest, Md5};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

fn hourly_key(hour_start: DateTime<Utc>) -> String {
    format!("hourly:{}", hour_start.format("%Y-%m-%d-%H"))
}

fn daily_key(day_start: DateTime<Utc>) -> String {
    format!("daily:{}", day_start.format("%Y-%m-%d"))
}

fn model_summary_key(model: &str) -> String {
    format!("model_summary:{}", model)
}

fn file_meta_key(path: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(path.as_bytes());
    format!("file_meta:{:x}", hasher.finalize())
}

const MODELS_LIST_KEY: &str = "models:list";

fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0).and_then(|t| t.with_second(0)).and_then(|t| t.with_nanosecond(0)).unwrap_or(ts)
}

fn floor_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_hour(0).and_then(|t| t.with_minute(0)).and_then(|t| t.with_second(0)).and_then(|t| t.with_nanosecond(0)).unwrap_or(ts)
}

/// Per-model lifetime roll-up, stored at `model_summary:<model>`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ModelSummary {
    pub model: String,
    pub total: ModelStats,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

pub struct AggregationEngine {
    db: sled::Db,
    config: AggregationConfig,
    metrics: Arc<MetricsCollector>,
}

impl AggregationEngine {
    pub fn open(path: &std::path::Path, config: AggregationConfig) -> Result<Self> {
        Self::open_with_metrics(path, config, Arc::new(MetricsCollector::new()))
    }

    /// Builds an engine reporting its writes into `metrics`, so a collector
    /// shared with [`crate::cache::SummaryCache`] observes the whole storage
    /// layer rather than just the file-level cache (SPEC_FULL.md §2).
    pub fn open_with_metrics(path: &std::path::Path, config: AggregationConfig, metrics: Arc<MetricsCollector>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| UsageError::Store(e.to_string()))?;
        Ok(Self { db, config, metrics })
    }

    fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let started = Instant::now();
        let result = self.db.get(key).map_err(|e| UsageError::Store(e.to_string()))?;
        self.metrics.record_read_latency(started.elapsed());
        match result {
            Some(bytes) => {
                let value = bincode::deserialize(&bytes)
                    .map_err(|e| UsageError::Store(format!("corrupt value at {}: {}", key, e)))?;
                self.metrics.record_hit();
                Ok(Some(value))
            }
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
        }
    }

    fn put<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let started = Instant::now();
        let bytes = bincode::serialize(value).map_err(|e| UsageError::Store(e.to_string()))?;
        self.db.insert(key, bytes).map_err(|e| UsageError::Store(e.to_string()))?;
        self.metrics.record_write();
        self.metrics.record_write_latency(started.elapsed());
        Ok(())
    }

    /// Group `entries` by hour, merge each hour into the existing aggregation at
    /// that key, then rebuild the owning day(s) by folding all 24 hourly keys.
    pub fn process_file(&self, entries: &[UsageEntry], now: DateTime<Utc>) -> Result<()> {
        let mut by_hour: HashMap<DateTime<Utc>, Vec<&UsageEntry>> = HashMap::new();
        for entry in entries {
            by_hour.entry(floor_to_hour(entry.timestamp)).or_default().push(entry);
        }

        let mut touched_days: HashSet<DateTime<Utc>> = HashSet::new();
        let mut models_seen: HashSet<String> = HashSet::new();

        for (hour_start, hour_entries) in &by_hour {
            let mut fresh = HourlyAggregation::new(*hour_start, now);
            for entry in hour_entries {
                fresh.total.add_entry(entry);
                fresh.by_model.entry(entry.model.clone()).or_default().add_entry(entry);
                if !entry.session_id.is_empty() {
                    fresh.session_ids.insert(entry.session_id.clone());
                }
                fresh.first_entry = fresh.first_entry.min(entry.timestamp);
                fresh.last_entry = fresh.last_entry.max(entry.timestamp);
                models_seen.insert(entry.model.clone());
            }

            let key = hourly_key(*hour_start);
            let mut merged = self.get::<HourlyAggregation>(&key)?.unwrap_or_else(|| HourlyAggregation::new(*hour_start, now));
            merged.merge(&fresh, now);
            self.put(&key, &merged)?;

            touched_days.insert(floor_to_day(*hour_start));
        }

        for day_start in touched_days {
            self.rebuild_day(day_start, now)?;
        }

        for model in models_seen {
            self.update_model_summary(&model, &by_hour, now)?;
        }

        self.db.flush().map_err(|e| UsageError::Store(e.to_string()))?;
        Ok(())
    }

    fn rebuild_day(&self, day_start: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let mut hours = Vec::with_capacity(24);
        for h in 0..24 {
            let hour_start = day_start + Duration::hours(h);
            if let Some(hour) = self.get::<HourlyAggregation>(&hourly_key(hour_start))? {
                hours.push(hour);
            }
        }
        let daily = DailyAggregation::from_hourly(day_start, &hours, now);
        self.put(&daily_key(day_start), &daily)
    }

    fn update_model_summary(
        &self,
        model: &str,
        by_hour: &HashMap<DateTime<Utc>, Vec<&UsageEntry>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = model_summary_key(model);
        let mut summary = self.get::<ModelSummary>(&key)?.unwrap_or_else(|| ModelSummary {
            model: model.to_string(),
            ..Default::default()
        });

        for entries in by_hour.values() {
            for entry in entries.iter().filter(|e| e.model == model) {
                summary.total.add_entry(entry);
                summary.first_seen = Some(summary.first_seen.map_or(entry.timestamp, |t| t.min(entry.timestamp)));
                summary.last_seen = Some(summary.last_seen.map_or(entry.timestamp, |t| t.max(entry.timestamp)));
            }
        }
        self.put(&key, &summary)?;

        let mut models: HashSet<String> = self.get(MODELS_LIST_KEY)?.unwrap_or_default();
        models.insert(model.to_string());
        self.put(MODELS_LIST_KEY, &models)
    }

    pub fn get_hourly_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<HourlyAggregation>> {
        let lower = hourly_key(start);
        let upper = hourly_key(end);
        let mut out = Vec::new();
        for item in self.db.range(lower.as_bytes()..=upper.as_bytes()) {
            let (_, value) = item.map_err(|e| UsageError::Store(e.to_string()))?;
            let hour: HourlyAggregation = bincode::deserialize(&value).map_err(|e| UsageError::Store(e.to_string()))?;
            out.push(hour);
        }
        Ok(out)
    }

    pub fn get_daily_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<DailyAggregation>> {
        let lower = daily_key(start);
        let upper = daily_key(end);
        let mut out = Vec::new();
        for item in self.db.range(lower.as_bytes()..=upper.as_bytes()) {
            let (_, value) = item.map_err(|e| UsageError::Store(e.to_string()))?;
            let day: DailyAggregation = bincode::deserialize(&value).map_err(|e| UsageError::Store(e.to_string()))?;
            out.push(day);
        }
        Ok(out)
    }

    pub fn get_model_usage_in_range(&self, model: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<ModelStats> {
        let mut total = ModelStats::default();
        for day in self.get_daily_range(start, end)? {
            if let Some(stats) = day.by_model.get(model) {
                total.merge(stats);
            }
        }
        Ok(total)
    }

    pub fn get_top_models(&self, n: usize, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<(String, ModelStats)>> {
        let mut totals: HashMap<String, ModelStats> = HashMap::new();
        for day in self.get_daily_range(start, end)? {
            for (model, stats) in day.by_model {
                totals.entry(model).or_default().merge(&stats);
            }
        }
        let mut ranked: Vec<(String, ModelStats)> = totals.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cost_usd.partial_cmp(&a.1.cost_usd).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(n);
        Ok(ranked)
    }

    pub fn record_file_meta(&self, path: &str, mod_time: DateTime<Utc>, size: u64) -> Result<()> {
        self.put(&file_meta_key(path), &(mod_time, size))
    }

    /// Delete `hourly:*` keys older than the configured retention window. Daily and
    /// model-summary keys are small roll-ups and are kept indefinitely.
    pub fn run_gc_sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::hours(self.config.hourly_retention_hours);
        let mut removed = 0;
        let mut to_delete = Vec::new();

        for item in self.db.scan_prefix("hourly:") {
            let (key, value) = item.map_err(|e| UsageError::Store(e.to_string()))?;
            let hour: HourlyAggregation = match bincode::deserialize(&value) {
                Ok(h) => h,
                Err(_) => {
                    to_delete.push(key.to_vec());
                    continue;
                }
            };
            if hour.hour_start < cutoff {
                to_delete.push(key.to_vec());
            }
        }

        for key in to_delete {
            self.db.remove(&key).map_err(|e| UsageError::Store(e.to_string()))?;
            self.metrics.record_eviction();
            removed += 1;
        }

        debug!(
            removed,
            gc_ratio = self.config.gc_ratio,
            "hourly retention sweep complete (gc_ratio is informational only; sled manages its own compaction)"
        );
        info!(size_on_disk = self.db.size_on_disk().unwrap_or(0), "aggregation store size");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(ts: DateTime<Utc>, model: &str, tokens: u64, cost: f64) -> UsageEntry {
        UsageEntry {
            timestamp: ts,
            model: model.to_string(),
            input_tokens: tokens,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            cost_usd: cost,
            message_id: String::new(),
            request_id: String::new(),
            session_id: "s1".to_string(),
        }
    }

    fn config() -> AggregationConfig {
        AggregationConfig {
            gc_interval_secs: 300,
            hourly_retention_hours: 24,
            gc_ratio: 0.5,
        }
    }

    #[test]
    fn process_file_then_range_query_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AggregationEngine::open(dir.path(), config()).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let entries = vec![entry(now, "claude-3-5-sonnet", 100, 0.01)];

        engine.process_file(&entries, now).unwrap();
        let hours = engine.get_hourly_range(now - Duration::hours(1), now + Duration::hours(1)).unwrap();
        assert_eq!(hours.len(), 1);
        assert_eq!(hours[0].total.input_tokens, 100);
    }

    #[test]
    fn merging_two_files_in_same_hour_sums_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AggregationEngine::open(dir.path(), config()).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 30, 0).unwrap();

        engine.process_file(&[entry(now, "claude-3-5-sonnet", 100, 0.01)], now).unwrap();
        engine.process_file(&[entry(now, "claude-3-5-sonnet", 50, 0.005)], now).unwrap();

        let hours = engine.get_hourly_range(now - Duration::hours(1), now + Duration::hours(1)).unwrap();
        assert_eq!(hours[0].total.input_tokens, 150);
    }

    #[test]
    fn daily_rebuilds_from_hourly_after_process() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AggregationEngine::open(dir.path(), config()).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        engine.process_file(&[entry(now, "claude-3-5-sonnet", 100, 0.01)], now).unwrap();

        let days = engine.get_daily_range(now - Duration::days(1), now + Duration::days(1)).unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].total.input_tokens, 100);
    }

    #[test]
    fn top_models_orders_by_cost_descending() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AggregationEngine::open(dir.path(), config()).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        engine.process_file(&[entry(now, "claude-3-opus", 10, 5.0), entry(now, "claude-3-haiku", 10, 0.1)], now).unwrap();

        let top = engine.get_top_models(2, now - Duration::days(1), now + Duration::days(1)).unwrap();
        assert_eq!(top[0].0, "claude-3-opus");
    }

    #[test]
    fn gc_sweep_removes_hourly_keys_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AggregationEngine::open(dir.path(), config()).unwrap();
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        engine.process_file(&[entry(old, "claude-3-5-sonnet", 10, 0.01)], old).unwrap();

        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let removed = engine.run_gc_sweep(now).unwrap();
        assert_eq!(removed, 1);
    }
}
