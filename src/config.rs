//! Production configuration system
//!
//! Provides centralized configuration management with:
//! - Environment variable support
//! - Config file loading (optional)
//! - Runtime defaults
//! - Validation and type safety

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
#[cfg(not(test))]
use std::sync::OnceLock;
#[cfg(test)]
use std::sync::Mutex;
use tracing::{info, warn};

/// Main configuration structure
///
/// `serde(default)` lets a partial config file override only the sections it
/// specifies; missing sections fall back to `Config::default()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub processing: ProcessingConfig,
    pub memory: MemoryConfig,
    pub dedup: DedupConfig,
    pub output: OutputConfig,
    pub paths: PathsConfig,
    pub pricing: PricingConfig,
    pub cache: CacheConfig,
    pub aggregation: AggregationConfig,
    pub analyzer: AnalyzerConfig,
    pub orchestrator: OrchestratorConfig,
    pub cache_warmer: CacheWarmerConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub batch_size: usize,
    pub parallel_chunks: usize,
    pub max_retries: usize,
    pub progress_interval_mb: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_memory_mb: usize,
    pub buffer_size_kb: usize,
    pub warning_threshold_pct: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub window_hours: i64,
    pub cleanup_threshold: usize,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub json_pretty: bool,
    pub include_metadata: bool,
    pub timestamp_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub claude_home: PathBuf,
    pub vms_directory: PathBuf,
    pub log_directory: PathBuf,
    pub cache_dir: PathBuf,
}

/// Pricing provider knobs (component C1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub source_url: String,
    pub offline: bool,
    pub memo_ttl_secs: u64,
    pub fetch_timeout_secs: u64,
    pub default_cache_read_multiplier: f64,
    pub default_cache_write_multiplier: f64,
}

/// Summary cache knobs (component C3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub l1_capacity: u64,
}

/// Aggregation engine knobs (component C6)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub gc_interval_secs: u64,
    pub hourly_retention_hours: i64,
    /// Retained for interface parity with the badger-style value-log GC ratio this
    /// component used to expose; sled has no equivalent knob, so this is logged
    /// but does not affect behavior. See SPEC_FULL.md §4.6.
    pub gc_ratio: f64,
}

/// Session analyzer knobs (component C5)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub session_duration_hours: i64,
    pub active_block_grace_seconds: i64,
}

/// Orchestrator knobs (component C8)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub update_interval_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub shutdown_timeout_secs: u64,
}

/// Cache warmer knobs (component C9)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheWarmerConfig {
    pub max_age_days: i64,
    pub max_files: usize,
    pub worker_pool_size: usize,
    pub per_file_timeout_secs: u64,
}

/// Metrics collector knobs (component C10)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub latency_buffer_size: usize,
    pub timeseries_retention_minutes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            logging: LoggingConfig {
                level: "WARN".to_string(),
                format: "pretty".to_string(),
                output: "console".to_string(),
            },
            processing: ProcessingConfig {
                batch_size: 10,
                parallel_chunks: 4,
                max_retries: 3,
                progress_interval_mb: 10,
            },
            memory: MemoryConfig {
                max_memory_mb: 512,
                buffer_size_kb: 8,
                warning_threshold_pct: 90,
            },
            dedup: DedupConfig {
                window_hours: 24,
                cleanup_threshold: 10000,
                enabled: true,
            },
            output: OutputConfig {
                json_pretty: false,
                include_metadata: false,
                timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
            },
            paths: PathsConfig {
                claude_home: home.join(".claude"),
                vms_directory: home.join(".claude").join("vms"),
                log_directory: PathBuf::from("logs"),
                cache_dir: home.join(".claude").join("usage-cache"),
            },
            pricing: PricingConfig {
                source_url: "https://raw.githubusercontent.com/BerriAI/litellm/main/model_prices_and_context_window.json".to_string(),
                offline: false,
                memo_ttl_secs: 24 * 3600,
                fetch_timeout_secs: 30,
                default_cache_read_multiplier: 0.10,
                default_cache_write_multiplier: 1.25,
            },
            cache: CacheConfig {
                l1_capacity: 10_000,
            },
            aggregation: AggregationConfig {
                gc_interval_secs: 300,
                hourly_retention_hours: 24,
                gc_ratio: 0.5,
            },
            analyzer: AnalyzerConfig {
                session_duration_hours: 5,
                active_block_grace_seconds: 0,
            },
            orchestrator: OrchestratorConfig {
                update_interval_secs: 10,
                max_retries: 3,
                retry_backoff_ms: 100,
                shutdown_timeout_secs: 5,
            },
            cache_warmer: CacheWarmerConfig {
                max_age_days: 7,
                max_files: 100,
                worker_pool_size: 4,
                per_file_timeout_secs: 5,
            },
            metrics: MetricsConfig {
                latency_buffer_size: 10_000,
                timeseries_retention_minutes: 60,
            },
        }
    }
}

impl Config {
    /// Load configuration from environment, file, and defaults
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        let config_paths = [
            PathBuf::from("usage-ledger.toml"),
            PathBuf::from(".usage-ledger.toml"),
            dirs::config_dir()
                .map(|d| d.join("usage-ledger").join("config.toml"))
                .unwrap_or_default(),
        ];

        for path in &config_paths {
            if path.exists() {
                info!(config_file = %path.display(), "Loading configuration from file");
                config = Self::load_from_file(path)?;
                break;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Expand ~ in path strings
    fn expand_path(path_str: &str) -> PathBuf {
        if path_str.starts_with('~') {
            if let Some(home) = dirs::home_dir() {
                if path_str == "~" {
                    return home;
                } else if let Some(rest) = path_str.strip_prefix("~/") {
                    return home.join(rest);
                }
            }
        }
        PathBuf::from(path_str)
    }

    #[cfg(feature = "basic")]
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.expand_paths();

        Ok(config)
    }

    #[cfg(not(feature = "basic"))]
    pub fn load_from_file(_path: &Path) -> Result<Self> {
        Ok(Self::default())
    }

    fn expand_paths(&mut self) {
        if let Some(s) = self.paths.claude_home.to_str() {
            self.paths.claude_home = Self::expand_path(s);
        }
        if let Some(s) = self.paths.vms_directory.to_str() {
            self.paths.vms_directory = Self::expand_path(s);
        }
        if let Some(s) = self.paths.log_directory.to_str() {
            self.paths.log_directory = Self::expand_path(s);
        }
        if let Some(s) = self.paths.cache_dir.to_str() {
            self.paths.cache_dir = Self::expand_path(s);
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = env::var("LOG_FORMAT") {
            self.logging.format = val;
        }
        if let Ok(val) = env::var("LOG_OUTPUT") {
            self.logging.output = val;
        }

        if let Ok(val) = env::var("USAGE_LEDGER_BATCH_SIZE") {
            self.processing.batch_size = val.parse().context("Invalid USAGE_LEDGER_BATCH_SIZE")?;
        }
        if let Ok(val) = env::var("USAGE_LEDGER_PARALLEL_CHUNKS") {
            self.processing.parallel_chunks = val
                .parse()
                .context("Invalid USAGE_LEDGER_PARALLEL_CHUNKS")?;
        }

        if let Ok(val) = env::var("USAGE_LEDGER_MAX_MEMORY_MB") {
            self.memory.max_memory_mb = val.parse().context("Invalid USAGE_LEDGER_MAX_MEMORY_MB")?;
        }
        if let Ok(val) = env::var("USAGE_LEDGER_BUFFER_SIZE_KB") {
            self.memory.buffer_size_kb =
                val.parse().context("Invalid USAGE_LEDGER_BUFFER_SIZE_KB")?;
        }

        if let Ok(val) = env::var("USAGE_LEDGER_DEDUP_WINDOW_HOURS") {
            self.dedup.window_hours = val
                .parse()
                .context("Invalid USAGE_LEDGER_DEDUP_WINDOW_HOURS")?;
        }
        if let Ok(val) = env::var("USAGE_LEDGER_DEDUP_ENABLED") {
            self.dedup.enabled = val.parse().context("Invalid USAGE_LEDGER_DEDUP_ENABLED")?;
        }

        if let Ok(val) = env::var("CLAUDE_HOME") {
            self.paths.claude_home = Self::expand_path(&val);
        }
        if let Ok(val) = env::var("CLAUDE_VMS_DIR") {
            self.paths.vms_directory = Self::expand_path(&val);
        }
        if let Ok(val) = env::var("USAGE_LEDGER_LOG_DIR") {
            self.paths.log_directory = Self::expand_path(&val);
        }
        if let Ok(val) = env::var("USAGE_LEDGER_CACHE_DIR") {
            self.paths.cache_dir = Self::expand_path(&val);
        }

        if let Ok(val) = env::var("USAGE_LEDGER_PRICING_URL") {
            self.pricing.source_url = val;
        }
        if let Ok(val) = env::var("USAGE_LEDGER_OFFLINE") {
            self.pricing.offline = val.parse().context("Invalid USAGE_LEDGER_OFFLINE")?;
        }

        if let Ok(val) = env::var("USAGE_LEDGER_UPDATE_INTERVAL_SECS") {
            self.orchestrator.update_interval_secs = val
                .parse()
                .context("Invalid USAGE_LEDGER_UPDATE_INTERVAL_SECS")?;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.memory.max_memory_mb < 64 {
            warn!(
                max_memory_mb = self.memory.max_memory_mb,
                "Memory limit is very low, may cause performance issues"
            );
        }

        if self.memory.buffer_size_kb == 0 || self.memory.buffer_size_kb > 1024 {
            return Err(anyhow::anyhow!(
                "Buffer size must be between 1KB and 1024KB, got {}KB",
                self.memory.buffer_size_kb
            ));
        }

        if self.processing.batch_size == 0 {
            return Err(anyhow::anyhow!("Batch size must be greater than 0"));
        }

        if self.processing.parallel_chunks == 0 {
            return Err(anyhow::anyhow!("Parallel chunks must be greater than 0"));
        }

        if self.dedup.window_hours < 0 {
            return Err(anyhow::anyhow!("Dedup window hours cannot be negative"));
        }

        if self.analyzer.session_duration_hours <= 0 {
            return Err(anyhow::anyhow!("Session duration must be positive"));
        }

        if self.orchestrator.update_interval_secs == 0 {
            return Err(anyhow::anyhow!("Update interval must be greater than 0"));
        }

        if !self.paths.log_directory.exists() {
            fs::create_dir_all(&self.paths.log_directory)
                .context("Failed to create log directory")?;
        }

        if !self.paths.cache_dir.exists() {
            fs::create_dir_all(&self.paths.cache_dir)
                .context("Failed to create cache directory")?;
        }

        Ok(())
    }

    #[allow(dead_code)]
    #[cfg(feature = "basic")]
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!(path = %path.display(), "Configuration saved to file");

        Ok(())
    }

    #[allow(dead_code)]
    #[cfg(not(feature = "basic"))]
    pub fn save_to_file(&self, _path: &Path) -> Result<()> {
        anyhow::bail!("TOML configuration saving not available. Rebuild with --features basic")
    }
}

#[cfg(not(test))]
static CONFIG: OnceLock<Config> = OnceLock::new();

#[cfg(test)]
static CONFIG: Mutex<Option<&'static Config>> = Mutex::new(None);

#[cfg(not(test))]
pub fn get_config() -> &'static Config {
    CONFIG.get_or_init(|| Config::load().expect("Failed to load configuration"))
}

#[cfg(test)]
pub fn get_config() -> &'static Config {
    let mut guard = CONFIG.lock().unwrap();
    if let Some(config) = *guard {
        config
    } else {
        let config = Config::load().expect("Failed to load configuration");
        let config_ref: &'static Config = Box::leak(Box::new(config));
        *guard = Some(config_ref);
        config_ref
    }
}

#[cfg(test)]
pub fn reset_config_for_test() {
    let mut guard = CONFIG.lock().unwrap();
    *guard = None;
}
