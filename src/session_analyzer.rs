//! Session Analyzer (component C5)
//!
//! Partitions a sorted entry list into fixed-width [`SessionBlock`]s, detects
//! gaps between bursts of activity, and computes burn rate and forward
//! projections for the active block. See SPEC_FULL.md §4.5.

use crate::config::AnalyzerConfig;
use crate::models::{BurnRate, ModelStats, Projection, SessionBlock, UsageEntry};
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::HashMap;
use uuid::Uuid;

fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

fn new_block(start: DateTime<Utc>, duration: Duration) -> SessionBlock {
    SessionBlock {
        id: Uuid::new_v4().to_string(),
        start,
        end: start + duration,
        actual_end: start,
        is_active: false,
        is_gap: false,
        entry_count: 0,
        token_counts: ModelStats::default(),
        by_model: HashMap::new(),
        cost_usd: 0.0,
        burn_rate: None,
        projection: None,
        limit_hit_at: None,
    }
}

/// A gap block spans from the closed block's nominal boundary to the hour
/// containing the next entry, not from the closed block's last real activity.
fn new_gap_block(start: DateTime<Utc>, end: DateTime<Utc>) -> SessionBlock {
    SessionBlock {
        id: Uuid::new_v4().to_string(),
        start,
        end,
        actual_end: start,
        is_active: false,
        is_gap: true,
        entry_count: 0,
        token_counts: ModelStats::default(),
        by_model: HashMap::new(),
        cost_usd: 0.0,
        burn_rate: None,
        projection: None,
        limit_hit_at: None,
    }
}

fn add_entry(block: &mut SessionBlock, entry: &UsageEntry) {
    block.entry_count += 1;
    block.token_counts.add_entry(entry);
    block.by_model.entry(entry.model.clone()).or_default().add_entry(entry);
    block.cost_usd += entry.cost_usd;
    block.actual_end = entry.timestamp;
}

/// A marker extracted from raw entries indicating the provider reported a rate
/// or usage limit at a specific instant. See SPEC_FULL.md §4.5 limit detection.
pub struct LimitMarker {
    pub timestamp: DateTime<Utc>,
}

pub struct SessionAnalyzer {
    config: AnalyzerConfig,
}

impl SessionAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn analyze(&self, entries: &[UsageEntry], now: DateTime<Utc>) -> Vec<SessionBlock> {
        self.analyze_with_limits(entries, now, &[])
    }

    pub fn analyze_with_limits(
        &self,
        entries: &[UsageEntry],
        now: DateTime<Utc>,
        limits: &[LimitMarker],
    ) -> Vec<SessionBlock> {
        if entries.is_empty() {
            return Vec::new();
        }

        let duration = Duration::hours(self.config.session_duration_hours);
        let mut sorted: Vec<&UsageEntry> = entries.iter().collect();
        sorted.sort_by_key(|e| e.timestamp);

        let mut blocks: Vec<SessionBlock> = Vec::new();
        let mut current = new_block(floor_to_hour(sorted[0].timestamp), duration);

        for entry in sorted.iter() {
            if entry.timestamp >= current.end {
                let last_activity = current.actual_end;
                let nominal_end = current.end;
                blocks.push(current);

                // The real inactivity gap is measured from the last entry actually
                // seen, not from the block's nominal boundary.
                let real_gap = entry.timestamp - last_activity;
                if real_gap > duration {
                    let gap_end = floor_to_hour(entry.timestamp);
                    if gap_end > nominal_end {
                        blocks.push(new_gap_block(nominal_end, gap_end));
                    }
                }

                current = new_block(floor_to_hour(entry.timestamp), duration);
            }

            add_entry(&mut current, entry);
        }
        blocks.push(current);

        // A block stays active while `now` hasn't passed its nominal end, extended by the
        // configured grace window (Open Question, SPEC_FULL §9; default grace is zero).
        let grace = Duration::seconds(self.config.active_block_grace_seconds);
        for block in blocks.iter_mut() {
            if block.is_gap || block.entry_count == 0 {
                continue;
            }
            block.is_active = now < block.end + grace;
        }

        for block in blocks.iter_mut() {
            if block.is_gap || block.entry_count == 0 {
                continue;
            }
            let reference_end = if block.is_active { now } else { block.actual_end };
            let elapsed_minutes = (reference_end - block.start).num_seconds() as f64 / 60.0;
            let elapsed_minutes = elapsed_minutes.max(1.0);
            let total_tokens = block.token_counts.total_tokens() as f64;

            let rate = BurnRate {
                elapsed_minutes,
                tokens_per_minute: total_tokens / elapsed_minutes,
                cost_per_hour: 60.0 * block.cost_usd / elapsed_minutes,
            };

            if block.is_active {
                let remaining_minutes = (block.end - now).num_seconds().max(0) as f64 / 60.0;
                block.projection = Some(Projection {
                    projected_tokens: block.token_counts.total_tokens()
                        + (rate.tokens_per_minute * remaining_minutes) as u64,
                    projected_cost: block.cost_usd + rate.cost_per_hour * (remaining_minutes / 60.0),
                });
            }

            block.burn_rate = Some(rate);
        }

        for marker in limits {
            if let Some(block) = blocks
                .iter_mut()
                .find(|b| !b.is_gap && marker.timestamp >= b.start && marker.timestamp <= b.end)
            {
                block.limit_hit_at = Some(marker.timestamp);
            }
        }

        blocks
    }
}
