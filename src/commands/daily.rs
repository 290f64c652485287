//! `daily` command: prints per-day usage totals for a trailing window.

use crate::aggregation::AggregationEngine;
use crate::cache::SummaryCache;
use crate::config::Config;
use crate::loader::{LoadOptions, Loader};
use crate::pricing::PricingProvider;
use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

pub struct DailyOptions {
    pub json: bool,
    pub limit: Option<usize>,
    pub exclude_vms: bool,
}

pub async fn run(config: &Config, options: DailyOptions) -> Result<()> {
    let cache = SummaryCache::new(config.paths.cache_dir.clone(), config.cache.l1_capacity);
    let pricing = PricingProvider::new(config.pricing.clone(), &config.paths.cache_dir);
    let pricing_table = pricing.get_all().await?;

    let loader = Loader::new();
    let load_options = LoadOptions {
        root: config.paths.claude_home.clone(),
        exclude_vms: options.exclude_vms,
        dedup_enabled: config.dedup.enabled,
    };
    // One-shot CLI invocation: nothing to cancel, so the token never fires.
    let load_result = loader.load(&load_options, &pricing_table, &cache, &CancellationToken::new());

    let agg_path = config.paths.cache_dir.join("aggregation.sled");
    let engine = AggregationEngine::open(&agg_path, config.aggregation.clone())?;
    let now = Utc::now();
    engine.process_file(&load_result.entries, now)?;

    let limit = options.limit.unwrap_or(30);
    let start = now - chrono::Duration::days(limit as i64);
    let days = engine.get_daily_range(start, now)?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&days)?);
    } else {
        println!("{:<12} {:>10} {:>12} {:>10}", "Date", "Cost (USD)", "Tokens", "Entries");
        for day in &days {
            println!(
                "{:<12} {:>10.2} {:>12} {:>10}",
                day.day_start.format("%Y-%m-%d"),
                day.total.cost_usd,
                day.total.total_tokens(),
                day.total.entry_count
            );
        }
    }

    Ok(())
}
