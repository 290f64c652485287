//! End-to-end test of the ingestion -> cache -> aggregation pipeline against a
//! fixture Claude home directory, mirroring the directory layout file
//! discovery expects (`<home>/projects/<project>/conversation_*.jsonl`).

mod common;

use chrono::Utc;
use std::collections::HashMap;
use usage_ledger::aggregation::AggregationEngine;
use usage_ledger::cache::SummaryCache;
use usage_ledger::config::AggregationConfig;
use usage_ledger::loader::{LoadOptions, Loader};
use usage_ledger::models::ModelPricing;
use usage_ledger::session_analyzer::SessionAnalyzer;
use usage_ledger::config::AnalyzerConfig;
use tokio_util::sync::CancellationToken;

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

fn sample_line(ts: &str, input: u64, output: u64, message_id: &str) -> String {
    format!(
        r#"{{"type":"assistant","timestamp":"{ts}","message":{{"id":"{message_id}","model":"claude-3-5-sonnet","usage":{{"input_tokens":{input},"output_tokens":{output}}}}},"requestId":"req-{message_id}"}}"#
    )
}

#[test]
fn loader_discovers_parses_and_caches_fixture_conversation() {
    let home = tempfile::tempdir().unwrap();
    let project_dir = home.path().join("projects").join("demo-project");
    std::fs::create_dir_all(&project_dir).unwrap();

    let lines = vec![
        sample_line("2026-01-01T10:00:00Z", 100, 50, "m1"),
        sample_line("2026-01-01T10:05:00Z", 200, 80, "m2"),
        sample_line("2026-01-01T11:00:00Z", 50, 20, "m3"),
    ];
    common::create_test_jsonl(
        &project_dir,
        "conversation_1.jsonl",
        &lines.join("\n"),
    )
    .unwrap();

    let cache_dir = tempfile::tempdir().unwrap();
    let cache = SummaryCache::new(cache_dir.path().to_path_buf(), 100);
    let pricing = pricing_table();

    let loader = Loader::new();
    let options = LoadOptions {
        root: home.path().to_path_buf(),
        exclude_vms: false,
        dedup_enabled: true,
    };

    let no_cancel = CancellationToken::new();
    let first_load = loader.load(&options, &pricing, &cache, &no_cancel);
    assert_eq!(first_load.entries.len(), 3);
    assert_eq!(first_load.metadata.cache_misses, 1);

    // Second load should be served entirely from the cache via materialization.
    let second_load = loader.load(&options, &pricing, &cache, &no_cancel);
    assert_eq!(second_load.entries.len(), 3);
    assert_eq!(second_load.metadata.cache_hits, 1);
    assert_eq!(second_load.metadata.cache_misses, 0);

    let total_cost: f64 = first_load.entries.iter().map(|e| e.cost_usd).sum();
    let cached_cost: f64 = second_load.entries.iter().map(|e| e.cost_usd).sum();
    assert!((total_cost - cached_cost).abs() < 1e-6);
}

#[test]
fn pipeline_feeds_aggregation_engine_and_session_analyzer() {
    let home = tempfile::tempdir().unwrap();
    let project_dir = home.path().join("projects").join("demo-project");
    std::fs::create_dir_all(&project_dir).unwrap();

    let lines = vec![
        sample_line("2026-01-01T10:00:00Z", 100, 50, "a1"),
        sample_line("2026-01-01T10:10:00Z", 200, 80, "a2"),
    ];
    common::create_test_jsonl(&project_dir, "conversation_2.jsonl", &lines.join("\n")).unwrap();

    let cache_dir = tempfile::tempdir().unwrap();
    let cache = SummaryCache::new(cache_dir.path().to_path_buf(), 100);
    let pricing = pricing_table();

    let loader = Loader::new();
    let options = LoadOptions {
        root: home.path().to_path_buf(),
        exclude_vms: false,
        dedup_enabled: true,
    };
    let load_result = loader.load(&options, &pricing, &cache, &CancellationToken::new());
    assert_eq!(load_result.entries.len(), 2);

    let agg_dir = tempfile::tempdir().unwrap();
    let engine = AggregationEngine::open(
        &agg_dir.path().join("agg.sled"),
        AggregationConfig {
            gc_interval_secs: 300,
            hourly_retention_hours: 24,
            gc_ratio: 0.5,
        },
    )
    .unwrap();

    let now = Utc::now();
    engine.process_file(&load_result.entries, now).unwrap();

    let start = now - chrono::Duration::days(1);
    let daily = engine.get_daily_range(start, now).unwrap();
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].total.entry_count, 2);

    let analyzer = SessionAnalyzer::new(AnalyzerConfig {
        session_duration_hours: 5,
        active_block_grace_seconds: 0,
    });
    let blocks = analyzer.analyze(&load_result.entries, now);
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].entry_count, 2);
}
