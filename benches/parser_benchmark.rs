//! Performance benchmarks for JSONL usage-log parsing
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;
use std::io::Write;
use tempfile::NamedTempFile;
use usage_ledger::models::ModelPricing;
use usage_ledger::parser;

fn generate_test_jsonl(num_lines: usize, include_errors: bool) -> String {
    let mut lines = Vec::new();

    for i in 0..num_lines {
        if include_errors && i % 10 == 5 {
            lines.push("{broken json}".to_string());
        } else {
            lines.push(format!(
                r#"{{"type":"assistant","timestamp":"2024-01-15T10:30:{}Z","message":{{"id":"msg_{}","model":"claude-3-5-sonnet-20241022","usage":{{"input_tokens":{},"output_tokens":{},"cache_creation_input_tokens":{},"cache_read_input_tokens":{}}}}},"costUSD":{},"requestId":"req_{}"}}"#,
                format!("{:02}", i % 60),
                i,
                100 + i,
                200 + i,
                i % 50,
                i % 100,
                0.001 * (i as f64),
                i
            ));
        }
    }

    lines.join("\n")
}

fn create_temp_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn pricing_table() -> HashMap<String, ModelPricing> {
    let mut table = HashMap::new();
    table.insert(
        "claude-3-5-sonnet-20241022".to_string(),
        ModelPricing {
            input_cost_per_million: 3.0,
            output_cost_per_million: 15.0,
            cache_creation_cost_per_million: 3.75,
            cache_read_cost_per_million: 0.3,
        },
    );
    table
}

fn benchmark_parse_file_scaling(c: &mut Criterion) {
    let pricing = pricing_table();
    let mut group = c.benchmark_group("parse_file_scaling");

    for size in [10, 100, 1000, 10000].iter() {
        let jsonl_content = generate_test_jsonl(*size, false);
        let temp_file = create_temp_file(&jsonl_content);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| parser::parse_file(black_box(temp_file.path()), &pricing));
        });
    }

    group.finish();
}

fn benchmark_parse_file_with_errors(c: &mut Criterion) {
    let pricing = pricing_table();
    let jsonl_with_errors = generate_test_jsonl(1000, true);
    let temp_file = create_temp_file(&jsonl_with_errors);

    c.bench_function("parse_file_with_10pct_malformed_lines", |b| {
        b.iter(|| parser::parse_file(black_box(temp_file.path()), &pricing));
    });
}

fn benchmark_parse_line(c: &mut Criterion) {
    let pricing = pricing_table();
    let line = generate_test_jsonl(1, false);

    c.bench_function("parse_single_line", |b| {
        b.iter(|| parser::parse_line(black_box(&line), &pricing));
    });
}

criterion_group!(
    benches,
    benchmark_parse_file_scaling,
    benchmark_parse_file_with_errors,
    benchmark_parse_line
);
criterion_main!(benches);
