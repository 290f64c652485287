//! `monthly` command: folds daily aggregates into calendar-month totals.

use crate::aggregation::AggregationEngine;
use crate::cache::SummaryCache;
use crate::config::Config;
use crate::loader::{LoadOptions, Loader};
use crate::models::ModelStats;
use crate::pricing::PricingProvider;
use anyhow::Result;
use chrono::{Datelike, Utc};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

pub struct MonthlyOptions {
    pub json: bool,
    pub limit: Option<usize>,
    pub exclude_vms: bool,
}

pub async fn run(config: &Config, options: MonthlyOptions) -> Result<()> {
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

    let months = options.limit.unwrap_or(12) as i64;
    let start = now - chrono::Duration::days(months * 31);
    let days = engine.get_daily_range(start, now)?;

    let mut by_month: BTreeMap<String, ModelStats> = BTreeMap::new();
    for day in &days {
        let key = format!("{:04}-{:02}", day.day_start.year(), day.day_start.month());
        by_month.entry(key).or_default().merge(&day.total);
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&by_month)?);
    } else {
        println!("{:<10} {:>10} {:>12} {:>10}", "Month", "Cost (USD)", "Tokens", "Entries");
        for (month, stats) in &by_month {
            println!(
                "{:<10} {:>10.2} {:>12} {:>10}",
                month,
                stats.cost_usd,
                stats.total_tokens(),
                stats.entry_count
            );
        }
    }

    Ok(())
}
