//! Pricing Provider (component C1)
//!
//! Resolves `model -> ModelPricing` with a layered source order: remote LiteLLM
//! document -> on-disk cache -> hardcoded fallback table. See SPEC_FULL.md §4.1.

use crate::config::PricingConfig;
use crate::models::ModelPricing;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

/// On-disk pricing cache document, matching the `{source, updated_at, pricing}` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPricing {
    pub source: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub pricing: HashMap<String, ModelPricing>,
}

#[derive(Debug, Deserialize)]
struct LiteLlmModelEntry {
    #[serde(default)]
    input_cost_per_token: Option<f64>,
    #[serde(default)]
    output_cost_per_token: Option<f64>,
    #[serde(default)]
    cache_creation_input_token_cost: Option<f64>,
    #[serde(default)]
    cache_read_input_token_cost: Option<f64>,
    #[serde(default)]
    litellm_provider: Option<String>,
    #[serde(default)]
    mode: Option<String>,
}

struct Memo {
    table: HashMap<String, ModelPricing>,
    fetched_at: Instant,
}

/// Fallback table used when neither the network nor an on-disk cache is available.
fn fallback_table() -> HashMap<String, ModelPricing> {
    let mut table = HashMap::new();
    let mut insert = |name: &str, input: f64, output: f64| {
        table.insert(
            name.to_string(),
            ModelPricing {
                input_cost_per_million: input,
                output_cost_per_million: output,
                cache_creation_cost_per_million: input * 1.25,
                cache_read_cost_per_million: input * 0.10,
            },
        );
    };
    insert("claude-3-haiku", 0.25, 1.25);
    insert("claude-3-5-haiku", 0.80, 4.00);
    insert("claude-3-sonnet", 3.00, 15.00);
    insert("claude-3-5-sonnet", 3.00, 15.00);
    insert("claude-3-opus", 15.00, 75.00);
    insert("claude-opus-4", 15.00, 75.00);
    insert("claude-sonnet-4", 3.00, 15.00);
    table
}

pub struct PricingProvider {
    config: PricingConfig,
    cache_path: PathBuf,
    memo: RwLock<Option<Memo>>,
    warned_degraded: std::sync::atomic::AtomicBool,
    http: Option<reqwest::Client>,
}

impl PricingProvider {
    pub fn new(config: PricingConfig, cache_dir: &Path) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .ok();
        Self {
            cache_path: cache_dir.join("pricing_cache.json"),
            config,
            memo: RwLock::new(None),
            warned_degraded: std::sync::atomic::AtomicBool::new(false),
            http,
        }
    }

    /// Resolve pricing for a model name, applying the full fallback chain.
    pub async fn get_pricing(&self, model: &str) -> Result<ModelPricing> {
        let table = self.get_all().await?;
        Ok(resolve_model_pricing(&table, model))
    }

    /// Return the full resolved pricing table, refreshing from source if the
    /// in-process memo has expired.
    pub async fn get_all(&self) -> Result<HashMap<String, ModelPricing>> {
        {
            let memo = self.memo.read().await;
            if let Some(m) = memo.as_ref() {
                if m.fetched_at.elapsed() < Duration::from_secs(self.config.memo_ttl_secs) {
                    return Ok(m.table.clone());
                }
            }
        }

        if self.config.offline {
            return self.load_disk_cache().with_context(|| {
                "pricing provider is offline and no on-disk cache is available".to_string()
            });
        }

        let table = match self.fetch_remote().await {
            Ok(table) => {
                self.save_disk_cache(&table);
                table
            }
            Err(e) => {
                if let Ok(cached) = self.load_disk_cache() {
                    if !self.warned_degraded.swap(true, std::sync::atomic::Ordering::Relaxed) {
                        warn!(error = %e, "pricing fetch failed, serving on-disk cache");
                    }
                    cached
                } else {
                    warn!(error = %e, "pricing fetch failed and no cache available, using fallback table");
                    fallback_table()
                }
            }
        };

        let mut memo = self.memo.write().await;
        *memo = Some(Memo {
            table: table.clone(),
            fetched_at: Instant::now(),
        });

        Ok(table)
    }

    /// Force a remote refresh; rejected while offline.
    pub async fn refresh(&self) -> Result<()> {
        if self.config.offline {
            anyhow::bail!("refresh denied: pricing provider is offline");
        }
        let table = self.fetch_remote().await?;
        self.save_disk_cache(&table);
        let mut memo = self.memo.write().await;
        *memo = Some(Memo {
            table,
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    async fn fetch_remote(&self) -> Result<HashMap<String, ModelPricing>> {
        let client = self
            .http
            .as_ref()
            .context("pricing http client unavailable")?;
        let response = client
            .get(&self.config.source_url)
            .header("User-Agent", "usage-ledger/0.1")
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("pricing source returned HTTP {}", response.status());
        }

        let raw: HashMap<String, LiteLlmModelEntry> = response.json().await?;
        let mut table = HashMap::new();

        for (model_name, entry) in raw {
            if !model_name.starts_with("claude-") {
                continue;
            }
            let is_claude_provider = entry
                .litellm_provider
                .as_deref()
                .map(|p| p == "anthropic" || p == "bedrock")
                .unwrap_or(true);
            let is_chat = entry.mode.as_deref().map(|m| m == "chat").unwrap_or(true);
            if !is_claude_provider || !is_chat {
                continue;
            }

            let input = entry.input_cost_per_token.unwrap_or(0.0) * 1_000_000.0;
            let output = entry.output_cost_per_token.unwrap_or(0.0) * 1_000_000.0;
            let cache_read = entry
                .cache_read_input_token_cost
                .map(|v| v * 1_000_000.0)
                .unwrap_or(input * self.config.default_cache_read_multiplier);
            let cache_write = entry
                .cache_creation_input_token_cost
                .map(|v| v * 1_000_000.0)
                .unwrap_or(input * self.config.default_cache_write_multiplier);

            table.insert(
                model_name,
                ModelPricing {
                    input_cost_per_million: input,
                    output_cost_per_million: output,
                    cache_creation_cost_per_million: cache_write,
                    cache_read_cost_per_million: cache_read,
                },
            );
        }

        Ok(table)
    }

    fn load_disk_cache(&self) -> Result<HashMap<String, ModelPricing>> {
        let content = fs::read_to_string(&self.cache_path)
            .with_context(|| format!("no pricing cache at {}", self.cache_path.display()))?;
        let cached: CachedPricing = serde_json::from_str(&content)?;
        Ok(cached.pricing)
    }

    fn save_disk_cache(&self, table: &HashMap<String, ModelPricing>) {
        let cached = CachedPricing {
            source: self.config.source_url.clone(),
            updated_at: chrono::Utc::now(),
            pricing: table.clone(),
        };
        let Ok(content) = serde_json::to_string_pretty(&cached) else {
            return;
        };
        let tmp = self.cache_path.with_extension("json.tmp");
        if fs::write(&tmp, content).is_ok() {
            let _ = fs::rename(&tmp, &self.cache_path);
        }
    }
}

/// Normalize a model name: strip vendor prefixes and trailing date suffixes so that
/// `anthropic.claude-3-5-sonnet-20241022-v2:0` and `claude-3-5-sonnet` converge.
pub fn normalize_model_name(model: &str) -> String {
    let mut name = model.to_lowercase();
    for prefix in ["us.anthropic.", "anthropic.", "bedrock/"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest.to_string();
        }
    }
    if let Some(idx) = name.rfind('-') {
        let suffix = &name[idx + 1..];
        if suffix.len() == 8 && suffix.chars().all(|c| c.is_ascii_digit()) {
            name = name[..idx].to_string();
        }
    }
    name.trim_end_matches(":0").to_string()
}

/// Exact -> normalized -> substring -> Sonnet-fallback resolution chain (SPEC_FULL §4.1).
pub fn resolve_model_pricing(table: &HashMap<String, ModelPricing>, model: &str) -> ModelPricing {
    if let Some(p) = table.get(model) {
        return *p;
    }
    let normalized = normalize_model_name(model);
    if let Some(p) = table.get(&normalized) {
        return *p;
    }
    for (key, value) in table {
        let key_lower = key.to_lowercase();
        for needle in ["opus", "sonnet", "haiku"] {
            if normalized.contains(needle) && key_lower.contains(needle) {
                return *value;
            }
        }
    }
    table
        .iter()
        .find(|(k, _)| k.to_lowercase().contains("sonnet"))
        .map(|(_, v)| *v)
        .unwrap_or_else(|| {
            let fallback = fallback_table();
            *fallback.get("claude-3-5-sonnet").unwrap()
        })
}
