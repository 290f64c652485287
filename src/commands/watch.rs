//! `watch` command: subscribes to the orchestrator and prints each
//! `MonitoringData` snapshot as it arrives. Exercises the subscriber contract
//! end-to-end; it is not a polished TUI.

use crate::cache::SummaryCache;
use crate::cache_warmer::CacheWarmer;
use crate::config::Config;
use crate::data_manager::DataManager;
use crate::file_discovery::FileDiscovery;
use crate::orchestrator::Orchestrator;
use crate::pricing::PricingProvider;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct WatchOptions {
    pub json: bool,
    pub token_limit: Option<u64>,
}

/// Spawns the startup cache warmer in the background, racing the orchestrator's
/// first tick rather than blocking it.
fn spawn_cache_warmer(config: &Config) {
    let config = config.clone();
    tokio::spawn(async move {
        let discovery = FileDiscovery::new();
        let Ok(claude_paths) = discovery.discover_claude_paths(&config.paths.claude_home, false) else {
            return;
        };
        let Ok(file_tuples) = discovery.find_jsonl_files(&claude_paths) else {
            return;
        };
        let candidates: Vec<_> = file_tuples.into_iter().map(|(path, _)| path).collect();
        if candidates.is_empty() {
            return;
        }

        let cache = Arc::new(SummaryCache::new(config.paths.cache_dir.clone(), config.cache.l1_capacity));
        let pricing = PricingProvider::new(config.pricing.clone(), &config.paths.cache_dir);
        let pricing_table = Arc::new(pricing.get_all().await.unwrap_or_else(|_| HashMap::new()));

        let warmer = CacheWarmer::new(config.cache_warmer.clone());
        let report = warmer.warm(candidates, cache, pricing_table, Utc::now()).await;
        info!(
            warmed = report.files_warmed,
            failed = report.files_failed,
            duration_ms = report.duration_ms,
            "cache warmer finished"
        );
    });
}

pub async fn run(config: &Config, options: WatchOptions) -> Result<()> {
    spawn_cache_warmer(config);

    // Shared so `orchestrator.stop()` aborts an in-flight refresh, not just the ticker loop.
    let cancel = CancellationToken::new();
    let data_manager = Arc::new(DataManager::with_cancellation(config, cancel.clone()));
    let update_interval = Duration::from_secs(config.orchestrator.update_interval_secs);
    let orchestrator = Orchestrator::with_cancellation(data_manager, update_interval, options.token_limit, cancel);

    orchestrator.start();
    info!("watch started, waiting for first snapshot");

    if !orchestrator.wait_for_initial_data(Duration::from_secs(30)).await {
        orchestrator.stop().await;
        anyhow::bail!("timed out waiting for the first usage snapshot");
    }

    let mut receiver = orchestrator.subscribe_channel();
    println!("Watching for usage updates. Press Ctrl+C to exit.");

    loop {
        tokio::select! {
            update = receiver.recv() => {
                match update {
                    Ok(data) => print_snapshot(&data, options.json),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "watch receiver lagged behind the orchestrator");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping watch.");
                break;
            }
        }
    }

    orchestrator.stop().await;
    Ok(())
}

fn print_snapshot(data: &crate::models::MonitoringData, json: bool) {
    if json {
        if let Ok(rendered) = serde_json::to_string(data) {
            println!("{}", rendered);
        }
        return;
    }

    println!(
        "[{}] sequence={} blocks={} entries={} cache_hits={} cache_misses={}",
        data.generated_at.format("%Y-%m-%d %H:%M:%S"),
        data.sequence,
        data.blocks.len(),
        data.metadata.entries_loaded,
        data.metadata.cache_hits,
        data.metadata.cache_misses,
    );
    if let Some(active) = data.blocks.iter().find(|b| b.is_active) {
        if let Some(burn) = &active.burn_rate {
            println!(
                "  active session: {:.2} tokens/min, ${:.4}/hour",
                burn.tokens_per_minute, burn.cost_per_hour
            );
        }
    }
}
