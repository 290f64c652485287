//! `export` command: thin consumer of the aggregation engine's range query,
//! writing the result as CSV or JSON. No templating, no scheduling.

use crate::aggregation::AggregationEngine;
use crate::cache::SummaryCache;
use crate::config::Config;
use crate::loader::{LoadOptions, Loader};
use crate::pricing::PricingProvider;
use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

pub enum ExportFormat {
    Csv,
    Json,
}

pub struct ExportOptions {
    pub format: ExportFormat,
    pub since_days: i64,
    pub exclude_vms: bool,
}

pub async fn run(config: &Config, options: ExportOptions) -> Result<()> {
    let cache = SummaryCache::new(config.paths.cache_dir.clone(), config.cache.l1_capacity);
    let pricing = PricingProvider::new(config.pricing.clone(), &config.paths.cache_dir);
    let pricing_table = pricing.get_all().await?;

    let loader = Loader::new();
    let load_options = LoadOptions {
        root: config.paths.claude_home.clone(),
        exclude_vms: options.exclude_vms,
        dedup_enabled: config.dedup.enabled,
    };
    let load_result = loader.load(&load_options, &pricing_table, &cache, &CancellationToken::new());

    let agg_path = config.paths.cache_dir.join("aggregation.sled");
    let engine = AggregationEngine::open(&agg_path, config.aggregation.clone())?;
    let now = Utc::now();
    engine.process_file(&load_result.entries, now)?;

    let start = now - chrono::Duration::days(options.since_days);
    let days = engine.get_daily_range(start, now)?;

    match options.format {
        ExportFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&days)?);
        }
        ExportFormat::Csv => {
            println!("date,cost_usd,input_tokens,output_tokens,cache_creation_tokens,cache_read_tokens,entry_count");
            for day in &days {
                println!(
                    "{},{:.6},{},{},{},{},{}",
                    day.day_start.format("%Y-%m-%d"),
                    day.total.cost_usd,
                    day.total.input_tokens,
                    day.total.output_tokens,
                    day.total.cache_creation_tokens,
                    day.total.cache_read_tokens,
                    day.total.entry_count
                );
            }
        }
    }

    Ok(())
}
