//! Orchestrator (component C8)
//!
//! Owns the periodic refresh ticker and fans each new [`MonitoringData`]
//! snapshot out to registered subscribers, isolating them from each other's
//! panics. See SPEC_FULL.md §4.8.

use crate::data_manager::DataManager;
use crate::errors::{Result, UsageError};
use crate::models::MonitoringData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub type UpdateCallback = Arc<dyn Fn(Arc<MonitoringData>) + Send + Sync>;

pub struct Orchestrator {
    data_manager: Arc<DataManager>,
    update_interval: Duration,
    token_limit: Option<u64>,
    callbacks: std::sync::Mutex<Vec<UpdateCallback>>,
    first_data: Arc<Notify>,
    got_first_data: AtomicU64,
    cancel: CancellationToken,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    panic_count: AtomicU64,
    sender: broadcast::Sender<Arc<MonitoringData>>,
}

impl Orchestrator {
    pub fn new(data_manager: Arc<DataManager>, update_interval: Duration, token_limit: Option<u64>) -> Arc<Self> {
        Self::with_cancellation(data_manager, update_interval, token_limit, CancellationToken::new())
    }

    /// Builds an orchestrator that shares `cancel` with the [`DataManager`] it
    /// drives, so `stop()` aborts an in-flight refresh rather than only the
    /// ticker loop. See SPEC_FULL.md §5/§9.
    pub fn with_cancellation(
        data_manager: Arc<DataManager>,
        update_interval: Duration,
        token_limit: Option<u64>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (sender, _) = broadcast::channel(1);
        Arc::new(Self {
            data_manager,
            update_interval,
            token_limit,
            callbacks: std::sync::Mutex::new(Vec::new()),
            first_data: Arc::new(Notify::new()),
            got_first_data: AtomicU64::new(0),
            cancel,
            handle: std::sync::Mutex::new(None),
            panic_count: AtomicU64::new(0),
            sender,
        })
    }

    pub fn subscribe(&self, callback: UpdateCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run().await });
        *self.handle.lock().unwrap() = Some(handle);
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.update_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Forces a fresh pipeline run (not a cached read) and dispatches the
    /// result, bumping `sequence`. Exposed so external callers can trigger an
    /// out-of-band refresh; the ticker calls this on every tick so that the
    /// sequence the spec requires to be strictly increasing actually advances,
    /// rather than rebroadcasting the same cached snapshot forever.
    pub async fn force_refresh(&self) -> Result<Arc<MonitoringData>> {
        let mut data = self.data_manager.get_data(true).await?;

        if self.token_limit.is_some() {
            let mut owned = (*data).clone();
            owned.token_limit = self.token_limit;
            data = Arc::new(owned);
        }

        crate::logging::set_current_session_id(data.current_session_id.clone());
        let span = crate::span_with_context!(tracing::Level::DEBUG, "dispatch", sequence = data.sequence);
        let _entered = span.enter();
        self.dispatch(data.clone());
        if self.got_first_data.swap(1, Ordering::SeqCst) == 0 {
            self.first_data.notify_waiters();
        }
        Ok(data)
    }

    async fn tick(&self) {
        match self.force_refresh().await {
            Ok(_) => {}
            // A refresh cancelled mid-flight (e.g. `stop()` raced the tick) is
            // not a failure worth logging; the next tick (if any) retries.
            Err(UsageError::CancelledRefresh) => {
                debug!("orchestrator tick cancelled mid-refresh");
            }
            Err(e) => {
                error!(error = %e, "orchestrator tick failed to fetch data");
            }
        }
    }

    fn dispatch(&self, data: Arc<MonitoringData>) {
        let _ = self.sender.send(data.clone());

        let callbacks = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            let data = data.clone();
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(data)));
            if result.is_err() {
                self.panic_count.fetch_add(1, Ordering::Relaxed);
                warn!("subscriber callback panicked; dispatch continues for remaining subscribers");
            }
        }
    }

    pub fn subscribe_channel(&self) -> broadcast::Receiver<Arc<MonitoringData>> {
        self.sender.subscribe()
    }

    pub async fn wait_for_initial_data(&self, timeout: Duration) -> bool {
        if self.got_first_data.load(Ordering::SeqCst) == 1 {
            return true;
        }
        tokio::time::timeout(timeout, self.first_data.notified()).await.is_ok()
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }

    pub fn panic_count(&self) -> u64 {
        self.panic_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::AnalysisMetadata;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    fn manager(dir: &std::path::Path) -> Arc<DataManager> {
        let mut config = Config::default();
        config.paths.cache_dir = dir.to_path_buf();
        config.paths.claude_home = dir.to_path_buf();
        config.pricing.offline = true;
        Arc::new(DataManager::new(&config))
    }

    fn manager_with_cancellation(dir: &std::path::Path, cancel: CancellationToken) -> Arc<DataManager> {
        let mut config = Config::default();
        config.paths.cache_dir = dir.to_path_buf();
        config.paths.claude_home = dir.to_path_buf();
        config.pricing.offline = true;
        Arc::new(DataManager::with_cancellation(&config, cancel))
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(manager(dir.path()), Duration::from_millis(50), None);

        let hit = Arc::new(AtomicUsize::new(0));
        let hit_clone = hit.clone();
        orchestrator.subscribe(Arc::new(move |_data| {
            panic!("boom");
        }));
        orchestrator.subscribe(Arc::new(move |_data| {
            hit_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let data = Arc::new(MonitoringData {
            blocks: Vec::new(),
            metadata: AnalysisMetadata::default(),
            token_limit: None,
            sequence: 1,
            current_session_id: None,
            generated_at: Utc::now(),
        });
        orchestrator.dispatch(data);

        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.panic_count(), 1);
    }

    #[tokio::test]
    async fn wait_for_initial_data_times_out_when_nothing_published() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(manager(dir.path()), Duration::from_secs(60), None);
        let fired = orchestrator.wait_for_initial_data(Duration::from_millis(20)).await;
        assert!(!fired);
    }

    #[tokio::test]
    async fn repeated_force_refresh_strictly_increases_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(manager(dir.path()), Duration::from_secs(60), None);

        let first = orchestrator.force_refresh().await.unwrap();
        let second = orchestrator.force_refresh().await.unwrap();
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn cancelling_before_tick_yields_no_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let data_manager = manager_with_cancellation(dir.path(), cancel.clone());
        let orchestrator =
            Orchestrator::with_cancellation(data_manager, Duration::from_secs(60), None, cancel.clone());
        cancel.cancel();

        let result = orchestrator.force_refresh().await;
        assert!(matches!(result, Err(UsageError::CancelledRefresh)));
        assert!(!orchestrator.wait_for_initial_data(Duration::from_millis(10)).await);
    }
}
