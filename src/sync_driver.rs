use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::executor::{RemoteExecutor, SubmitError};
use crate::config::{PermanentFailurePolicy, SyncConfig};
use crate::model::{ActionId, ActionKind, EntityKind, PendingAction};
use crate::outbox::{ActionQueue, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    Draining,
    /// The last drain stopped on a failure. Left only by a reachable
    /// transition or a manual drain; there is no retry timer.
    Backoff,
}

/// Told which cached aggregate is stale after an action is applied remotely.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, entity: EntityKind, action_id: &ActionId);
}

impl<F> CacheInvalidator for F
where
    F: Fn(EntityKind, &ActionId) + Send + Sync,
{
    fn invalidate(&self, entity: EntityKind, action_id: &ActionId) {
        self(entity, action_id)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInvalidator;

impl CacheInvalidator for NoopInvalidator {
    fn invalidate(&self, _entity: EntityKind, _action_id: &ActionId) {}
}

/// What the presentation layer hears about synchronization.
///
/// Transport details only appear in `ActionRejected` and
/// `AttemptThresholdReached`, where a human has to act on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    DrainStarted {
        pending: usize,
    },
    ActionApplied {
        action_id: ActionId,
        kind: ActionKind,
        entity: EntityKind,
    },
    ActionRejected {
        action_id: ActionId,
        kind: ActionKind,
        reason: String,
    },
    AttemptThresholdReached {
        action_id: ActionId,
        kind: ActionKind,
        attempt: u32,
        last_error: String,
    },
    DrainSucceeded {
        applied: usize,
        remaining: usize,
    },
    DrainFailed {
        applied: usize,
        remaining: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every action in the snapshot was applied or dead-lettered.
    Completed,
    /// Stopped at `action_id`; it and everything after it stay queued.
    Halted {
        action_id: ActionId,
        attempt: u32,
        error: SubmitError,
    },
    /// Another drain was running; it will run one more cycle afterwards.
    Coalesced,
    /// The queue could not be updated after a submission.
    StoreFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub outcome: DrainOutcome,
    pub applied: usize,
    pub rejected: usize,
    pub remaining: usize,
}

impl DrainReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, DrainOutcome::Completed)
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub drains_started: AtomicU64,
    pub drains_completed: AtomicU64,
    pub drains_halted: AtomicU64,
    pub coalesced_requests: AtomicU64,
    pub actions_applied: AtomicU64,
    pub actions_failed: AtomicU64,
    pub actions_rejected: AtomicU64,
    pub store_failures: AtomicU64,
}

impl SyncMetrics {
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            drains_started: self.drains_started.load(Ordering::Relaxed),
            drains_completed: self.drains_completed.load(Ordering::Relaxed),
            drains_halted: self.drains_halted.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            actions_applied: self.actions_applied.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            actions_rejected: self.actions_rejected.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMetricsSnapshot {
    pub drains_started: u64,
    pub drains_completed: u64,
    pub drains_halted: u64,
    pub coalesced_requests: u64,
    pub actions_applied: u64,
    pub actions_failed: u64,
    pub actions_rejected: u64,
    pub store_failures: u64,
}

// ============================================================================
// Drain gate
// ============================================================================

/// Holds the "draining" flag. Dropping it (including when the drain future is
/// cancelled) clears the flag so the next request can start a drain.
struct DrainGuard<'a> {
    draining: &'a AtomicBool,
    phase: &'a watch::Sender<SyncPhase>,
    held: bool,
}

impl<'a> DrainGuard<'a> {
    fn try_acquire(draining: &'a AtomicBool, phase: &'a watch::Sender<SyncPhase>) -> Option<Self> {
        draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                draining,
                phase,
                held: true,
            })
    }

    fn release(&mut self) {
        if self.held {
            self.draining.store(false, Ordering::Release);
            self.held = false;
        }
    }

    fn reacquire(&mut self) -> bool {
        if !self.held {
            self.held = self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        }
        self.held
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.phase.send_if_modified(|phase| {
                if *phase == SyncPhase::Draining {
                    *phase = SyncPhase::Idle;
                    return true;
                }
                false
            });
            self.release();
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Replays the queue against the remote executor, oldest first.
///
/// At most one drain runs at a time. Delivery is at least once and in replay
/// order within each snapshot.
pub struct SyncDriver {
    queue: Arc<ActionQueue>,
    executor: Arc<dyn RemoteExecutor>,
    invalidator: Arc<dyn CacheInvalidator>,
    policy: PermanentFailurePolicy,
    alert_after_attempts: u32,
    draining: AtomicBool,
    rerun_requested: AtomicBool,
    phase: watch::Sender<SyncPhase>,
    events: broadcast::Sender<SyncEvent>,
    metrics: SyncMetrics,
}

impl SyncDriver {
    pub fn new(
        queue: Arc<ActionQueue>,
        executor: Arc<dyn RemoteExecutor>,
        invalidator: Arc<dyn CacheInvalidator>,
        config: &SyncConfig,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            queue,
            executor,
            invalidator,
            policy: config.permanent_failure_policy,
            alert_after_attempts: config.alert_after_attempts,
            draining: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
            phase,
            events,
            metrics: SyncMetrics::default(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Starts a drain on the runtime without waiting for it.
    pub fn request_drain(self: &Arc<Self>) -> JoinHandle<DrainReport> {
        let driver = Arc::clone(self);
        tokio::spawn(async move { driver.drain().await })
    }

    /// Drains the queue, or coalesces into the drain already running.
    ///
    /// A request that arrives mid-drain makes the running drain take one more
    /// snapshot once the current one completes. Failures end the drain and
    /// discard any pending follow-up.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> DrainReport {
        let Some(mut guard) = DrainGuard::try_acquire(&self.draining, &self.phase) else {
            self.rerun_requested.store(true, Ordering::Release);
            self.metrics.coalesced_requests.fetch_add(1, Ordering::Relaxed);
            debug!("Drain already running; request coalesced");
            return DrainReport {
                outcome: DrainOutcome::Coalesced,
                applied: 0,
                rejected: 0,
                remaining: self.queue.len().await,
            };
        };

        let mut applied = 0;
        let mut rejected = 0;
        loop {
            self.rerun_requested.store(false, Ordering::Release);
            let report = self.drain_snapshot().await;
            applied += report.applied;
            rejected += report.rejected;

            if !report.is_completed() {
                self.rerun_requested.store(false, Ordering::Release);
                return DrainReport {
                    applied,
                    rejected,
                    ..report
                };
            }

            if self.rerun_requested.load(Ordering::Acquire) {
                continue;
            }

            // A request can land between the check above and the release;
            // look once more after the gate is open.
            guard.release();
            if self.rerun_requested.load(Ordering::Acquire) && guard.reacquire() {
                continue;
            }

            return DrainReport {
                applied,
                rejected,
                ..report
            };
        }
    }

    async fn drain_snapshot(&self) -> DrainReport {
        let snapshot = self.queue.list_ordered().await;
        self.metrics.drains_started.fetch_add(1, Ordering::Relaxed);
        self.phase.send_replace(SyncPhase::Draining);
        self.emit(SyncEvent::DrainStarted {
            pending: snapshot.len(),
        });
        info!("Draining {} pending actions", snapshot.len());

        let mut applied = 0;
        let mut rejected = 0;

        for action in snapshot {
            // Cleared or removed since the snapshot was taken.
            if !self.queue.contains(&action.id).await {
                debug!(action_id = %action.id, "Skipping action no longer queued");
                continue;
            }

            match self.executor.submit(&action).await {
                Ok(()) => {
                    if let Err(e) = self.queue.remove(&action.id).await {
                        return self.store_failed(&action, e, applied, rejected).await;
                    }
                    self.invalidator.invalidate(action.entity, &action.id);
                    applied += 1;
                    self.metrics.actions_applied.fetch_add(1, Ordering::Relaxed);
                    self.emit(SyncEvent::ActionApplied {
                        action_id: action.id,
                        kind: action.kind,
                        entity: action.entity,
                    });
                }
                Err(error)
                    if error.is_permanent()
                        && self.policy == PermanentFailurePolicy::DeadLetter =>
                {
                    let reason = error.to_string();
                    if let Err(e) = self.queue.dead_letter(&action.id, reason.clone()).await {
                        return self.store_failed(&action, e, applied, rejected).await;
                    }
                    rejected += 1;
                    self.metrics.actions_rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        action_id = %action.id,
                        kind = %action.kind,
                        status = ?error.status(),
                        %reason,
                        "Action rejected permanently"
                    );
                    self.emit(SyncEvent::ActionRejected {
                        action_id: action.id,
                        kind: action.kind,
                        reason,
                    });
                }
                Err(error) => {
                    return self.halt(action, error, applied, rejected).await;
                }
            }
        }

        let remaining = self.queue.len().await;
        self.metrics.drains_completed.fetch_add(1, Ordering::Relaxed);
        self.phase.send_replace(SyncPhase::Idle);
        info!(applied, rejected, remaining, "Drain completed");
        self.emit(SyncEvent::DrainSucceeded { applied, remaining });

        DrainReport {
            outcome: DrainOutcome::Completed,
            applied,
            rejected,
            remaining,
        }
    }

    async fn halt(
        &self,
        action: PendingAction,
        error: SubmitError,
        applied: usize,
        rejected: usize,
    ) -> DrainReport {
        self.metrics.actions_failed.fetch_add(1, Ordering::Relaxed);

        let attempt = match self.queue.record_attempt(&action.id).await {
            Ok(Some(attempt)) => attempt,
            Ok(None) => action.attempt.saturating_add(1),
            Err(e) => {
                error!(action_id = %action.id, "Failed to persist attempt count: {}", e);
                action.attempt.saturating_add(1)
            }
        };

        warn!(
            action_id = %action.id,
            kind = %action.kind,
            attempt,
            status = ?error.status(),
            %error,
            "Submission failed; drain halted"
        );

        if attempt >= self.alert_after_attempts {
            warn!(
                action_id = %action.id,
                attempt,
                threshold = self.alert_after_attempts,
                "Action keeps failing"
            );
            self.emit(SyncEvent::AttemptThresholdReached {
                action_id: action.id.clone(),
                kind: action.kind,
                attempt,
                last_error: error.to_string(),
            });
        }

        self.finish_failed(applied).await;
        DrainReport {
            outcome: DrainOutcome::Halted {
                action_id: action.id,
                attempt,
                error,
            },
            applied,
            rejected,
            remaining: self.queue.len().await,
        }
    }

    async fn store_failed(
        &self,
        action: &PendingAction,
        e: QueueError,
        applied: usize,
        rejected: usize,
    ) -> DrainReport {
        self.metrics.store_failures.fetch_add(1, Ordering::Relaxed);
        error!(action_id = %action.id, "Failed to update queue after submission: {}", e);
        self.finish_failed(applied).await;
        DrainReport {
            outcome: DrainOutcome::StoreFailed {
                reason: e.to_string(),
            },
            applied,
            rejected,
            remaining: self.queue.len().await,
        }
    }

    async fn finish_failed(&self, applied: usize) {
        self.metrics.drains_halted.fetch_add(1, Ordering::Relaxed);
        self.phase.send_replace(SyncPhase::Backoff);
        self.emit(SyncEvent::DrainFailed {
            applied,
            remaining: self.queue.len().await,
        });
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is not an error.
        let _ = self.events.send(event);
    }
}
