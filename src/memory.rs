//! Memory pressure tracking (shared by C2, C4, C9)
//!
//! Tracks approximate resident usage against a configured limit with atomic
//! counters, and exposes that pressure to the components that scale their own
//! concurrency off it: the loader's (C4) adaptive chunk size, the parser's
//! (C2) read-buffer sizing, and the cache warmer's (C9) worker-pool size.
//! There is one global limit per process; tracking is approximate (entry
//! sizes, not actual allocator bytes) and meant to bias batch sizes, not to
//! enforce a hard cap.

use crate::config::get_config;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use tracing::warn;

static MEMORY_LIMIT: AtomicUsize = AtomicUsize::new(0);
static CURRENT_USAGE: AtomicUsize = AtomicUsize::new(0);
static MEMORY_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Pressure band driving adaptive sizing across C2/C4/C9.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemoryPressureLevel {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub current_usage: usize,
    pub memory_limit: usize,
    pub usage_percentage: f64,
}

/// Sets the process-wide limit from config. Called once at startup; later
/// calls are no-ops (the limit doesn't change mid-run).
pub fn init_memory_limit() {
    let config = get_config();
    let limit_bytes = config.memory.max_memory_mb * 1_000_000;
    MEMORY_LIMIT.store(limit_bytes, Ordering::Relaxed);
    let _ = MEMORY_INITIALIZED.set(());
}

fn ensure_initialized() {
    MEMORY_INITIALIZED.get_or_init(|| {
        let config = get_config();
        let limit_bytes = config.memory.max_memory_mb * 1_000_000;
        MEMORY_LIMIT.store(limit_bytes, Ordering::Relaxed);
    });
}

/// `true` once usage crosses into `High`/`Critical`. Logs at that transition
/// so a run that degrades batch sizes leaves a trail explaining why.
pub fn check_memory_pressure() -> bool {
    ensure_initialized();
    match get_pressure_level() {
        MemoryPressureLevel::Low | MemoryPressureLevel::Normal => false,
        pressure @ (MemoryPressureLevel::High | MemoryPressureLevel::Critical) => {
            let stats = get_memory_stats();
            warn!(
                current_mb = stats.current_usage / 1_000_000,
                limit_mb = stats.memory_limit / 1_000_000,
                usage_pct = stats.usage_percentage,
                pressure_level = ?pressure,
                "memory pressure detected"
            );
            true
        }
    }
}

/// Called by C2's parser when it reads a file into memory.
pub fn track_allocation(bytes: usize) {
    ensure_initialized();
    let limit = MEMORY_LIMIT.load(Ordering::Relaxed);
    let new_usage = CURRENT_USAGE.fetch_add(bytes, Ordering::Relaxed) + bytes;

    if new_usage > limit {
        warn!(
            bytes = bytes,
            new_usage_mb = new_usage / 1_000_000,
            limit_mb = limit / 1_000_000,
            "allocation pushed usage over the configured limit"
        );
    }
}

/// Called by C2's parser once a file's entries have been handed off.
pub fn track_deallocation(bytes: usize) {
    ensure_initialized();
    let current = CURRENT_USAGE.load(Ordering::Relaxed);
    CURRENT_USAGE.store(current.saturating_sub(bytes), Ordering::Relaxed);
}

pub fn get_memory_usage_mb() -> usize {
    ensure_initialized();
    CURRENT_USAGE.load(Ordering::Relaxed) / 1_000_000
}

/// Scales `default` down as pressure rises; `Low` passes it through unchanged.
/// The same curve backs both [`get_adaptive_batch_size`] (C4's chunk size,
/// C2's read-buffer size) and [`pressure_scaled_worker_pool`] (C9's semaphore
/// permits) — one pressure curve, two call sites scaling different resources.
fn pressure_scaled(default: usize) -> usize {
    match get_pressure_level() {
        MemoryPressureLevel::Low => default,
        MemoryPressureLevel::Normal => (default * 3) / 4,
        MemoryPressureLevel::High => default / 2,
        MemoryPressureLevel::Critical => default / 4,
    }
}

/// Adaptive chunk/buffer size for C4 (loader) and C2 (parser).
pub fn get_adaptive_batch_size(default_size: usize) -> usize {
    ensure_initialized();
    pressure_scaled(default_size)
}

/// Adaptive worker-pool size for C9 (cache warmer): shrinks the semaphore
/// under pressure so a cold-cache warmup doesn't compound with a loader
/// refresh that's already spilling batches. Floors at 1 so warming never
/// fully stalls.
pub fn pressure_scaled_worker_pool(default_permits: usize) -> usize {
    ensure_initialized();
    pressure_scaled(default_permits).max(1)
}

pub fn get_memory_stats() -> MemoryStats {
    ensure_initialized();
    let current = CURRENT_USAGE.load(Ordering::Relaxed);
    let limit = MEMORY_LIMIT.load(Ordering::Relaxed);
    let percentage = if limit > 0 { (current as f64 / limit as f64) * 100.0 } else { 0.0 };

    MemoryStats {
        current_usage: current,
        memory_limit: limit,
        usage_percentage: percentage,
    }
}

/// `true` once usage crosses into `Critical` — callers can use this to decide
/// whether to flush partial results rather than accumulate further.
pub fn should_spill_to_disk() -> bool {
    ensure_initialized();
    matches!(get_pressure_level(), MemoryPressureLevel::Critical)
}

pub fn get_pressure_level() -> MemoryPressureLevel {
    ensure_initialized();
    let current = CURRENT_USAGE.load(Ordering::Relaxed);
    let limit = MEMORY_LIMIT.load(Ordering::Relaxed);

    if limit == 0 {
        return MemoryPressureLevel::Low;
    }

    let usage_ratio = current as f64 / limit as f64;
    match usage_ratio {
        r if r < 0.5 => MemoryPressureLevel::Low,
        r if r < 0.75 => MemoryPressureLevel::Normal,
        r if r < 0.9 => MemoryPressureLevel::High,
        _ => MemoryPressureLevel::Critical,
    }
}
