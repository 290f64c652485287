//! Core data structures shared by every pipeline stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One normalized LLM usage record, regardless of which on-disk shape it was parsed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: f64,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub session_id: String,
}

impl UsageEntry {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    /// Fingerprint used for cross-file deduplication: `(message_id, request_id)` when both
    /// are present, else `None` (caller falls back to hashing the raw source line).
    pub fn fingerprint(&self) -> Option<String> {
        if self.message_id.is_empty() || self.request_id.is_empty() {
            None
        } else {
            Some(format!("{}:{}", self.message_id, self.request_id))
        }
    }
}

/// Per-model pricing, expressed as USD per one million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
    pub cache_creation_cost_per_million: f64,
    pub cache_read_cost_per_million: f64,
}

impl ModelPricing {
    pub fn cost_for(&self, entry: &UsageEntry) -> f64 {
        (entry.input_tokens as f64 / 1_000_000.0) * self.input_cost_per_million
            + (entry.output_tokens as f64 / 1_000_000.0) * self.output_cost_per_million
            + (entry.cache_creation_tokens as f64 / 1_000_000.0)
                * self.cache_creation_cost_per_million
            + (entry.cache_read_tokens as f64 / 1_000_000.0) * self.cache_read_cost_per_million
    }
}

/// Per-model running totals, stored both inside `FileSummary` and in the aggregation store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub entry_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: f64,
}

impl ModelStats {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    pub fn add_entry(&mut self, entry: &UsageEntry) {
        self.entry_count += 1;
        self.input_tokens += entry.input_tokens;
        self.output_tokens += entry.output_tokens;
        self.cache_creation_tokens += entry.cache_creation_tokens;
        self.cache_read_tokens += entry.cache_read_tokens;
        self.cost_usd += entry.cost_usd;
    }

    pub fn merge(&mut self, other: &ModelStats) {
        self.entry_count += other.entry_count;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// A single hour or day bucket inside a `FileSummary`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemporalBucket {
    pub total: ModelStats,
    pub by_model: HashMap<String, ModelStats>,
}

impl TemporalBucket {
    pub fn add_entry(&mut self, entry: &UsageEntry) {
        self.total.add_entry(entry);
        self.by_model.entry(entry.model.clone()).or_default().add_entry(entry);
    }
}

/// Cacheable digest of one JSONL file, keyed by absolute path in the summary cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSummary {
    pub absolute_path: String,
    pub mod_time: DateTime<Utc>,
    pub file_size: u64,
    pub entry_count: u64,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub model_stats: HashMap<String, ModelStats>,
    pub hourly_buckets: HashMap<String, TemporalBucket>,
    pub daily_buckets: HashMap<String, TemporalBucket>,
    pub processed_hashes: HashSet<String>,
}

impl FileSummary {
    pub fn is_stale(&self, mod_time: DateTime<Utc>, file_size: u64) -> bool {
        self.mod_time != mod_time || self.file_size != file_size
    }
}

/// One hour's roll-up across every file that contributed to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyAggregation {
    pub hour_start: DateTime<Utc>,
    pub total: ModelStats,
    pub by_model: HashMap<String, ModelStats>,
    pub session_ids: HashSet<String>,
    pub first_entry: DateTime<Utc>,
    pub last_entry: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HourlyAggregation {
    pub fn new(hour_start: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            hour_start,
            total: ModelStats::default(),
            by_model: HashMap::new(),
            session_ids: HashSet::new(),
            first_entry: hour_start,
            last_entry: hour_start,
            updated_at: now,
        }
    }

    /// Commutative, associative merge: safe to apply in any order or interleaving.
    pub fn merge(&mut self, other: &HourlyAggregation, now: DateTime<Utc>) {
        self.total.merge(&other.total);
        for (model, stats) in &other.by_model {
            self.by_model.entry(model.clone()).or_default().merge(stats);
        }
        self.session_ids.extend(other.session_ids.iter().cloned());
        self.first_entry = self.first_entry.min(other.first_entry);
        self.last_entry = self.last_entry.max(other.last_entry);
        self.updated_at = now;
    }
}

/// One day's roll-up, rebuilt by folding the day's 24 hourly aggregations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAggregation {
    pub day_start: DateTime<Utc>,
    pub total: ModelStats,
    pub by_model: HashMap<String, ModelStats>,
    pub session_ids: HashSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl DailyAggregation {
    pub fn from_hourly(day_start: DateTime<Utc>, hours: &[HourlyAggregation], now: DateTime<Utc>) -> Self {
        let mut total = ModelStats::default();
        let mut by_model: HashMap<String, ModelStats> = HashMap::new();
        let mut session_ids = HashSet::new();
        for hour in hours {
            total.merge(&hour.total);
            for (model, stats) in &hour.by_model {
                by_model.entry(model.clone()).or_default().merge(stats);
            }
            session_ids.extend(hour.session_ids.iter().cloned());
        }
        Self {
            day_start,
            total,
            by_model,
            session_ids,
            updated_at: now,
        }
    }
}

/// Burn-rate snapshot for an active session block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BurnRate {
    pub elapsed_minutes: f64,
    pub tokens_per_minute: f64,
    pub cost_per_hour: f64,
}

/// Forward projection computed from a block's current burn rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub projected_tokens: u64,
    pub projected_cost: f64,
}

/// A fixed-width (default 5h) window of activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBlock {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub actual_end: DateTime<Utc>,
    pub is_active: bool,
    pub is_gap: bool,
    pub entry_count: u64,
    pub token_counts: ModelStats,
    pub by_model: HashMap<String, ModelStats>,
    pub cost_usd: f64,
    pub burn_rate: Option<BurnRate>,
    pub projection: Option<Projection>,
    pub limit_hit_at: Option<DateTime<Utc>>,
}

/// Timing and count metadata attached to each `MonitoringData` snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub files_processed: usize,
    pub entries_loaded: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub processing_errors: usize,
    pub load_duration_ms: u64,
    pub analyze_duration_ms: u64,
    pub aggregate_duration_ms: u64,
    pub degraded: bool,
    pub last_error: Option<String>,
}

/// Snapshot delivered to every registered subscriber on each orchestrator tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringData {
    pub blocks: Vec<SessionBlock>,
    pub metadata: AnalysisMetadata,
    pub token_limit: Option<u64>,
    pub sequence: u64,
    pub current_session_id: Option<String>,
    pub generated_at: DateTime<Utc>,
}
