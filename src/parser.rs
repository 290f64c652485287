//! File Reader (component C2)
//!
//! Parses one JSONL conversation log into normalized [`UsageEntry`] records. Lines that
//! fail to parse are counted and skipped, never fatal to the whole file. See
//! SPEC_FULL.md §4.2 for the three accepted record shapes.

use crate::config::get_config;
use crate::memory;
use crate::models::{ModelPricing, UsageEntry};
use crate::pricing::resolve_model_pricing;
use crate::timestamp_parser::TimestampParser;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

/// Outcome of parsing one file: the normalized entries plus a count of lines skipped.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub entries: Vec<UsageEntry>,
    pub skipped_lines: usize,
}

fn usage_u64(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

/// Pulls token/usage and model fields out of either accepted record shape.
fn extract_fields(record: &Value) -> Option<(String, Value, String)> {
    let timestamp = record.get("timestamp")?.as_str()?.to_string();

    let record_type = record.get("type").and_then(|v| v.as_str());

    let (usage, model) = match record_type {
        Some("message") => {
            let usage = record.get("usage")?.clone();
            let model = record
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            (usage, model)
        }
        Some("assistant") => {
            let message = record.get("message")?;
            let usage = message.get("usage")?.clone();
            let model = message
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            (usage, model)
        }
        _ => {
            // Legacy shape: no `type` discriminator, usage nested under `message`.
            let message = record.get("message")?;
            let usage = message.get("usage")?.clone();
            let model = message
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            (usage, model)
        }
    };

    Some((timestamp, usage, model))
}

fn extract_cost(record: &Value) -> Option<f64> {
    record
        .get("costUSD")
        .or_else(|| record.get("cost_usd"))
        .and_then(|v| v.as_f64())
}

fn extract_ids(record: &Value) -> (String, String) {
    let message_id = record
        .get("message")
        .and_then(|m| m.get("id"))
        .or_else(|| record.get("message_id"))
        .or_else(|| record.get("messageId"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let request_id = record
        .get("requestId")
        .or_else(|| record.get("request_id"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    (message_id, request_id)
}

/// Parses one raw JSON line into a `UsageEntry`, computing cost from the pricing table
/// when the record doesn't already carry a nonzero `cost_usd`.
pub fn parse_line(line: &str, pricing: &HashMap<String, ModelPricing>) -> Option<UsageEntry> {
    let record: Value = serde_json::from_str(line).ok()?;
    let (timestamp_str, usage, model) = extract_fields(&record)?;
    let timestamp: DateTime<Utc> = TimestampParser::parse(&timestamp_str).ok()?;

    let input_tokens = usage_u64(&usage, "input_tokens");
    let output_tokens = usage_u64(&usage, "output_tokens");
    let cache_creation_tokens = usage_u64(&usage, "cache_creation_input_tokens");
    let cache_read_tokens = usage_u64(&usage, "cache_read_input_tokens");

    if input_tokens == 0 && output_tokens == 0 && cache_creation_tokens == 0 && cache_read_tokens == 0 {
        return None;
    }

    let (message_id, request_id) = extract_ids(&record);

    let mut entry = UsageEntry {
        timestamp,
        model: model.clone(),
        input_tokens,
        output_tokens,
        cache_creation_tokens,
        cache_read_tokens,
        cost_usd: 0.0,
        message_id,
        request_id,
        session_id: String::new(),
    };

    entry.cost_usd = match extract_cost(&record) {
        Some(cost) if cost > 0.0 => cost,
        _ => resolve_model_pricing(pricing, &model).cost_for(&entry),
    };

    Some(entry)
}

/// Parses an entire JSONL file, restartable and holding no cross-call state.
pub fn parse_file(path: &Path, pricing: &HashMap<String, ModelPricing>) -> std::io::Result<ParseOutcome> {
    let metadata = std::fs::metadata(path)?;
    memory::track_allocation(metadata.len() as usize);

    let base_buffer = get_config().memory.buffer_size_kb * 1024;
    let buffer_size = memory::get_adaptive_batch_size(base_buffer);
    let file = File::open(path)?;
    let reader = BufReader::with_capacity(buffer_size, file);

    let mut outcome = ParseOutcome::default();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_line(trimmed, pricing) {
            Some(entry) => outcome.entries.push(entry),
            None => outcome.skipped_lines += 1,
        }
    }

    memory::track_deallocation(metadata.len() as usize);
    debug!(
        file = %path.display(),
        entries = outcome.entries.len(),
        skipped = outcome.skipped_lines,
        "parsed jsonl file"
    );

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pricing_table() -> HashMap<String, ModelPricing> {
        let mut table = HashMap::new();
        table.insert(
            "claude-3-5-sonnet".to_string(),
            ModelPricing {
                input_cost_per_million: 3.0,
                output_cost_per_million: 15.0,
                cache_creation_cost_per_million: 3.75,
                cache_read_cost_per_million: 0.3,
            },
        );
        table
    }

    #[test]
    fn parses_message_shape() {
        let line = r#"{"type":"message","timestamp":"2026-01-01T00:00:00Z","model":"claude-3-5-sonnet","usage":{"input_tokens":100,"output_tokens":50,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}"#;
        let entry = parse_line(line, &pricing_table()).unwrap();
        assert_eq!(entry.input_tokens, 100);
        assert_eq!(entry.output_tokens, 50);
        assert!(entry.cost_usd > 0.0);
    }

    #[test]
    fn parses_assistant_shape() {
        let line = r#"{"type":"assistant","timestamp":"2026-01-01T00:00:00Z","message":{"model":"claude-3-5-sonnet","usage":{"input_tokens":10,"output_tokens":5,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}}"#;
        let entry = parse_line(line, &pricing_table()).unwrap();
        assert_eq!(entry.input_tokens, 10);
    }

    #[test]
    fn parses_legacy_shape_without_type() {
        let line = r#"{"timestamp":"2026-01-01T00:00:00Z","message":{"model":"claude-3-5-sonnet","id":"msg1","usage":{"input_tokens":10,"output_tokens":5,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}},"costUSD":0.01,"requestId":"req1"}"#;
        let entry = parse_line(line, &pricing_table()).unwrap();
        assert_eq!(entry.message_id, "msg1");
        assert_eq!(entry.request_id, "req1");
        assert_eq!(entry.cost_usd, 0.01);
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        assert!(parse_line("not json at all", &pricing_table()).is_none());
    }

    #[test]
    fn zero_usage_entry_is_skipped() {
        let line = r#"{"type":"message","timestamp":"2026-01-01T00:00:00Z","model":"claude-3-5-sonnet","usage":{"input_tokens":0,"output_tokens":0,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}"#;
        assert!(parse_line(line, &pricing_table()).is_none());
    }

    #[test]
    fn computes_cost_when_absent() {
        let line = r#"{"type":"message","timestamp":"2026-01-01T00:00:00Z","model":"claude-3-5-sonnet","usage":{"input_tokens":1000000,"output_tokens":0,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}"#;
        let entry = parse_line(line, &pricing_table()).unwrap();
        assert!((entry.cost_usd - 3.0).abs() < 1e-9);
    }
}
