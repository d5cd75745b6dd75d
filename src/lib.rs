//! Offline action queue and synchronization engine for a medication-adherence
//! app.
//!
//! User actions (a dose marked taken, a medication edited, a preference
//! changed) are encoded into [`PendingAction`]s, persisted before the call
//! returns, and replayed against a [`RemoteExecutor`] in the order they were
//! recorded once the backend is reachable again. [`OfflineSync`] owns one of
//! each component and wires them together.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod capture;
pub mod config;
pub mod connectivity;
pub mod encoder;
pub mod event;
pub mod model;
pub mod offline_store;
pub mod outbox;
pub mod sync_driver;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

pub use capabilities::executor::{RemoteExecutor, SubmitError};
pub use capabilities::kv::{FileKv, KvError, KvStore, MemoryKv};
pub use capabilities::notification::{LiveMessage, NotificationAction};
#[cfg(not(target_arch = "wasm32"))]
pub use capabilities::sqlite_kv::SqliteKv;
pub use capture::{CaptureError, CaptureStore, CapturedAction, ReconcileReport};
pub use config::{ConfigError, PermanentFailurePolicy, SyncConfig};
pub use connectivity::{ConnectivityMonitor, LivenessProbe, SignalSource, Transition};
pub use encoder::{ActionEncoder, Clock, EncodeError, SystemClock};
pub use event::{DomainEvent, MedicationId, SnoozeMinutes, ValidationError};
pub use model::{ActionId, ActionKind, DeadLetter, EntityKind, PendingAction, UnixTimeMs};
pub use outbox::{ActionQueue, QueueError};
pub use sync_driver::{
    CacheInvalidator, DrainOutcome, DrainReport, NoopInvalidator, SyncDriver, SyncEvent,
    SyncPhase,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Queue(e) => e.is_retryable(),
            SyncError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Point-in-time view for a status badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub reachable: bool,
    pub pending: usize,
    pub dead_letters: usize,
}

/// Everything [`OfflineSync::start`] needs from the host.
pub struct SyncBackends {
    /// Holds the queue, dead letters and quarantine.
    pub kv: Arc<dyn KvStore>,
    /// Written by the background capture bridge.
    pub capture_kv: Arc<dyn KvStore>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub invalidator: Arc<dyn CacheInvalidator>,
    pub clock: Arc<dyn Clock>,
}

impl SyncBackends {
    /// Uses one store for both the queue and captures, the system clock, and
    /// no cache invalidation.
    pub fn new(kv: Arc<dyn KvStore>, executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            capture_kv: kv.clone(),
            kv,
            executor,
            invalidator: Arc::new(NoopInvalidator),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_capture_store(mut self, capture_kv: Arc<dyn KvStore>) -> Self {
        self.capture_kv = capture_kv;
        self
    }

    #[must_use]
    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidator = invalidator;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Owns the queue, encoder, connectivity monitor, sync driver and capture
/// store of one user session.
///
/// A reachable connectivity transition requests a drain, and so does every
/// append made while reachable.
pub struct OfflineSync {
    queue: Arc<ActionQueue>,
    encoder: Arc<ActionEncoder>,
    monitor: Arc<ConnectivityMonitor>,
    driver: Arc<SyncDriver>,
    capture: Arc<CaptureStore>,
    probe_interval: std::time::Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineSync {
    /// Loads the queue, merges background captures, and starts listening for
    /// connectivity changes. Must be called inside a tokio runtime.
    #[instrument(skip_all)]
    pub async fn start(config: SyncConfig, backends: SyncBackends) -> Result<Self, SyncError> {
        config.validate()?;

        let queue = Arc::new(ActionQueue::load(backends.kv, &config).await?);
        let encoder = Arc::new(ActionEncoder::new(backends.clock.clone()));
        let capture = Arc::new(CaptureStore::new(backends.capture_kv, backends.clock));

        // Unmerged captures stay in their store and are retried next start.
        match capture.reconcile_into(&queue, &encoder).await {
            Ok(report) if report.merged > 0 => {
                info!("Merged {} background actions into the queue", report.merged);
            }
            Ok(_) => {}
            Err(e) => warn!("Background capture reconciliation failed: {}", e),
        }

        let monitor = Arc::new(ConnectivityMonitor::new(
            config.assume_reachable_at_start,
            config.event_channel_capacity,
        ));
        let driver = Arc::new(SyncDriver::new(
            queue.clone(),
            backends.executor,
            backends.invalidator,
            &config,
        ));

        let listener = spawn_transition_listener(&monitor, &driver);

        let sync = Self {
            queue,
            encoder,
            monitor,
            driver,
            capture,
            probe_interval: config.probe_interval(),
            tasks: Mutex::new(vec![listener]),
        };

        if sync.monitor.is_reachable() && !sync.queue.is_empty().await {
            sync.driver.request_drain();
        }

        info!(
            pending = sync.queue.len().await,
            reachable = sync.monitor.is_reachable(),
            "Offline sync started"
        );
        Ok(sync)
    }

    /// Encodes and durably queues a domain event.
    pub async fn record(&self, event: DomainEvent) -> Result<ActionId, SyncError> {
        let action = self.encoder.encode_event(event)?;
        self.append(action).await
    }

    pub async fn enqueue(
        &self,
        kind: ActionKind,
        entity: EntityKind,
        payload: serde_json::Value,
    ) -> Result<ActionId, SyncError> {
        let action = self.encoder.encode(kind, entity, payload)?;
        self.append(action).await
    }

    /// String-typed variant of [`enqueue`](Self::enqueue).
    pub async fn enqueue_raw(
        &self,
        kind: &str,
        entity: &str,
        payload: serde_json::Value,
    ) -> Result<ActionId, SyncError> {
        let action = self.encoder.encode_raw(kind, entity, payload)?;
        self.append(action).await
    }

    async fn append(&self, action: PendingAction) -> Result<ActionId, SyncError> {
        let id = action.id.clone();
        self.queue.append(action).await?;
        if self.monitor.is_reachable() {
            self.driver.request_drain();
        }
        Ok(id)
    }

    /// Records a notification button press made while the app was in the
    /// background. It joins the queue at the next start or
    /// [`reconcile_captures`](Self::reconcile_captures).
    pub async fn capture(
        &self,
        action: NotificationAction,
        medication_id: MedicationId,
    ) -> Result<(), SyncError> {
        self.capture.capture(action, medication_id).await?;
        Ok(())
    }

    pub async fn reconcile_captures(&self) -> Result<ReconcileReport, SyncError> {
        let report = self.capture.reconcile_into(&self.queue, &self.encoder).await?;
        if report.merged > 0 && self.monitor.is_reachable() {
            self.driver.request_drain();
        }
        Ok(report)
    }

    /// Drains now, whatever the connectivity state says.
    pub async fn sync_now(&self) -> DrainReport {
        self.driver.drain().await
    }

    pub fn report_native_signal(&self, online: bool) -> Option<Transition> {
        self.monitor.report(SignalSource::Native, online)
    }

    pub fn report_manual_signal(&self, reachable: bool) -> Option<Transition> {
        self.monitor.report(SignalSource::Manual, reachable)
    }

    /// Polls `probe` at the configured interval, for platforms without a
    /// usable native online/offline signal.
    pub fn spawn_liveness_polling(&self, probe: Arc<dyn LivenessProbe>) {
        let handle = self.monitor.spawn_probe_loop(probe, self.probe_interval);
        self.track(handle);
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.len().await
    }

    pub async fn pending_actions(&self) -> Vec<PendingAction> {
        self.queue.list_ordered().await
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.dead_letters().await
    }

    pub async fn discard_dead_letter(&self, id: &ActionId) -> Result<bool, SyncError> {
        Ok(self.queue.discard_dead_letter(id).await?)
    }

    /// Drops every pending action without submitting it.
    pub async fn clear(&self) -> Result<usize, SyncError> {
        Ok(self.queue.clear().await?)
    }

    pub async fn status(&self) -> SyncStatus {
        SyncStatus {
            phase: self.driver.phase(),
            reachable: self.monitor.is_reachable(),
            pending: self.queue.len().await,
            dead_letters: self.queue.dead_letters().await.len(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.driver.subscribe()
    }

    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<Transition> {
        self.monitor.subscribe()
    }

    pub fn subscribe_pages(&self) -> broadcast::Receiver<LiveMessage> {
        self.capture.subscribe_pages()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.driver.watch_phase()
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn driver(&self) -> &Arc<SyncDriver> {
        &self.driver
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    /// Stops background tasks. Queued actions stay persisted.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(_) => handle.abort(),
        }
    }
}

impl Drop for OfflineSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Requests a drain on every reachable transition.
fn spawn_transition_listener(
    monitor: &Arc<ConnectivityMonitor>,
    driver: &Arc<SyncDriver>,
) -> JoinHandle<()> {
    let mut transitions = monitor.subscribe();
    let state = monitor.watch();
    let driver = Arc::clone(driver);
    tokio::spawn(async move {
        loop {
            match transitions.recv().await {
                Ok(transition) if transition.reachable => {
                    driver.request_drain();
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} connectivity transitions", missed);
                    if *state.borrow() {
                        driver.request_drain();
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
