//! Background capture bridge.
//!
//! Notification buttons can be pressed while no page is running. Those presses
//! are written to their own namespace, one key per press, and merged into the
//! main queue by [`CaptureStore::reconcile_into`] the next time the app starts.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::kv::{KeyNamespace, KvError, KvKey, KvStore};
use crate::capabilities::notification::{LiveMessage, NotificationAction, NotificationError};
use crate::encoder::{ActionEncoder, Clock};
use crate::event::{MedicationId, ValidationError};
use crate::model::UnixTimeMs;
use crate::outbox::{ActionQueue, QueueError};

const KEY_PREFIX: &str = "action-";
const SEQUENCE_SPACE: u32 = 10_000;
const PAGE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error("invalid medication id: {0}")]
    Validation(#[from] ValidationError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("no free capture key for timestamp {0}")]
    KeySpaceExhausted(UnixTimeMs),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<serde_json::Error> for CaptureError {
    fn from(e: serde_json::Error) -> Self {
        CaptureError::Serialization(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapturedAction {
    pub action: NotificationAction,
    pub medication_id: MedicationId,
    pub captured_at: UnixTimeMs,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub merged: usize,
    pub already_queued: usize,
    pub discarded: usize,
}

/// Zero-padded so lexical key order is creation order.
fn capture_key_name(captured_at: UnixTimeMs, sequence: u32) -> String {
    format!("{}{:013}-{:04}", KEY_PREFIX, captured_at.as_millis(), sequence)
}

pub struct CaptureStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    sequence: AtomicU32,
    pages: broadcast::Sender<LiveMessage>,
}

impl CaptureStore {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        let (pages, _) = broadcast::channel(PAGE_CHANNEL_CAPACITY);
        Self {
            kv,
            clock,
            sequence: AtomicU32::new(0),
            pages,
        }
    }

    /// Live messages for pages that are open while a capture happens.
    pub fn subscribe_pages(&self) -> broadcast::Receiver<LiveMessage> {
        self.pages.subscribe()
    }

    /// Records a button press durably, then tells any open page about it.
    #[instrument(skip(self), fields(action = %action, medication_id = %medication_id))]
    pub async fn capture(
        &self,
        action: NotificationAction,
        medication_id: MedicationId,
    ) -> Result<KvKey, CaptureError> {
        let captured = CapturedAction {
            action,
            medication_id,
            captured_at: self.clock.now(),
        };
        let bytes = serde_json::to_vec(&captured)?;

        let key = self.free_key(captured.captured_at).await?;
        self.kv.set(&key, &bytes).await?;
        info!("Captured background action as {}", key.key());

        let message = LiveMessage::NotificationAction {
            action: captured.action,
            medication_id: captured.medication_id,
            captured_at: captured.captured_at,
        };
        if self.pages.send(message).is_err() {
            debug!("No open pages to notify");
        }

        Ok(key)
    }

    /// Like [`capture`](Self::capture), for the raw strings a platform
    /// notification handler receives.
    pub async fn capture_raw(
        &self,
        action_id: &str,
        medication_id: &str,
    ) -> Result<KvKey, CaptureError> {
        let action = NotificationAction::parse(action_id)?;
        let medication_id = MedicationId::new(medication_id)?;
        self.capture(action, medication_id).await
    }

    /// Captured actions not yet reconciled, oldest first. Unreadable records
    /// are skipped here and discarded by reconciliation.
    pub async fn pending(&self) -> Result<Vec<(KvKey, CapturedAction)>, CaptureError> {
        let mut pending = Vec::new();
        for key in self.capture_keys().await? {
            let Some(bytes) = self.kv.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<CapturedAction>(&bytes) {
                Ok(captured) => pending.push((key, captured)),
                Err(e) => warn!("Unreadable captured action {}: {}", key.key(), e),
            }
        }
        Ok(pending)
    }

    /// Moves every captured action into `queue`.
    ///
    /// Each key is deleted only after its action is durably queued. Ids are
    /// derived from the key, so a crash between the two steps is repaired on
    /// the next run instead of producing a duplicate. That holds even if the
    /// action was replayed in between, because the queue remembers captured
    /// ids across restarts. Never contacts the remote side.
    #[instrument(skip_all)]
    pub async fn reconcile_into(
        &self,
        queue: &ActionQueue,
        encoder: &ActionEncoder,
    ) -> Result<ReconcileReport, CaptureError> {
        let mut report = ReconcileReport::default();

        for key in self.capture_keys().await? {
            let Some(bytes) = self.kv.get(&key).await? else {
                continue;
            };

            let captured = match serde_json::from_slice::<CapturedAction>(&bytes) {
                Ok(captured) => captured,
                Err(e) => {
                    warn!("Discarding unreadable captured action {}: {}", key.key(), e);
                    let quarantine_key = KvKey::new(
                        KeyNamespace::Quarantine,
                        format!("{:013}-{}", UnixTimeMs::now().as_millis(), key.key()),
                    )?;
                    self.kv.set(&quarantine_key, &bytes).await?;
                    self.kv.delete(&key).await?;
                    report.discarded += 1;
                    continue;
                }
            };

            let action = encoder.encode_captured(key.key(), &captured);
            match queue.append(action).await {
                Ok(()) => report.merged += 1,
                Err(QueueError::DuplicateId(_) | QueueError::AlreadyRemoved(_)) => {
                    report.already_queued += 1;
                }
                Err(e) => return Err(e.into()),
            }

            self.kv.delete(&key).await?;
        }

        if report != ReconcileReport::default() {
            info!(
                merged = report.merged,
                already_queued = report.already_queued,
                discarded = report.discarded,
                "Reconciled background captures"
            );
        }
        Ok(report)
    }

    async fn capture_keys(&self) -> Result<Vec<KvKey>, CaptureError> {
        let mut keys = self.kv.list(&KeyNamespace::Capture).await?;
        keys.retain(|key| key.key().starts_with(KEY_PREFIX));
        Ok(keys)
    }

    /// Another writer (a second worker, or this store before a restart) may
    /// already hold a key for the same millisecond.
    async fn free_key(&self, captured_at: UnixTimeMs) -> Result<KvKey, CaptureError> {
        for _ in 0..SEQUENCE_SPACE {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) % SEQUENCE_SPACE;
            let key = KvKey::new(
                KeyNamespace::Capture,
                capture_key_name(captured_at, sequence),
            )?;
            if self.kv.get(&key).await?.is_none() {
                return Ok(key);
            }
        }
        Err(CaptureError::KeySpaceExhausted(captured_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::kv::MemoryKv;
    use crate::config::SyncConfig;
    use crate::encoder::tests::ManualClock;
    use crate::model::{ActionId, ActionKind};

    fn med(id: &str) -> MedicationId {
        MedicationId::new(id).unwrap()
    }

    fn store_at(kv: &MemoryKv, ms: u64) -> (CaptureStore, Arc<ManualClock>) {
        let clock = ManualClock::at(ms);
        (CaptureStore::new(Arc::new(kv.clone()), clock.clone()), clock)
    }

    async fn queue(kv: &MemoryKv) -> ActionQueue {
        ActionQueue::load(Arc::new(kv.clone()), &SyncConfig::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_key_format() {
        assert_eq!(
            capture_key_name(UnixTimeMs(1_700_000_000_000), 7),
            "action-1700000000000-0007"
        );
        assert_eq!(capture_key_name(UnixTimeMs(5), 0), "action-0000000000005-0000");
    }

    #[tokio::test]
    async fn test_keys_sort_in_creation_order() {
        let kv = MemoryKv::new();
        let (store, clock) = store_at(&kv, 9_999);

        store.capture(NotificationAction::Taken, med("med-1")).await.unwrap();
        clock.advance(1);
        store.capture(NotificationAction::Skip, med("med-2")).await.unwrap();
        store.capture(NotificationAction::Snooze, med("med-3")).await.unwrap();

        let pending = store.pending().await.unwrap();
        let meds: Vec<_> = pending
            .iter()
            .map(|(_, c)| c.medication_id.as_str().to_string())
            .collect();
        assert_eq!(meds, vec!["med-1", "med-2", "med-3"]);
        assert_eq!(pending[0].0.key(), "action-0000000009999-0000");
    }

    #[tokio::test]
    async fn test_same_millisecond_from_two_writers_does_not_overwrite() {
        let kv = MemoryKv::new();
        let (first, _) = store_at(&kv, 1_000);
        let (second, _) = store_at(&kv, 1_000);

        let a = first.capture(NotificationAction::Taken, med("med-1")).await.unwrap();
        let b = second.capture(NotificationAction::Skip, med("med-1")).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(first.pending().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_capture_posts_live_message() {
        let kv = MemoryKv::new();
        let (store, _) = store_at(&kv, 42);
        let mut page = store.subscribe_pages();

        store.capture_raw("taken", "med-1").await.unwrap();

        assert_eq!(
            page.recv().await.unwrap(),
            LiveMessage::NotificationAction {
                action: NotificationAction::Taken,
                medication_id: med("med-1"),
                captured_at: UnixTimeMs(42),
            }
        );
    }

    #[tokio::test]
    async fn test_capture_without_pages_is_fine() {
        let kv = MemoryKv::new();
        let (store, _) = store_at(&kv, 42);
        assert!(store.capture(NotificationAction::Skip, med("med-1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_capture_raw_rejects_bad_input() {
        let kv = MemoryKv::new();
        let (store, _) = store_at(&kv, 42);
        assert!(matches!(
            store.capture_raw("dismiss", "med-1").await,
            Err(CaptureError::Notification(_))
        ));
        assert!(matches!(
            store.capture_raw("taken", "  ").await,
            Err(CaptureError::Validation(_))
        ));
        assert!(store.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_moves_captures_into_queue() {
        let kv = MemoryKv::new();
        let (store, clock) = store_at(&kv, 1_000);
        store.capture(NotificationAction::Taken, med("med-1")).await.unwrap();
        clock.advance(5);
        store.capture(NotificationAction::Snooze, med("med-2")).await.unwrap();

        let queue = queue(&kv).await;
        let report = store
            .reconcile_into(&queue, &ActionEncoder::default())
            .await
            .unwrap();

        assert_eq!(report.merged, 2);
        assert!(store.pending().await.unwrap().is_empty());

        let actions = queue.list_ordered().await;
        assert_eq!(actions[0].kind, ActionKind::MarkTaken);
        assert_eq!(actions[0].enqueued_at, UnixTimeMs(1_000));
        assert_eq!(actions[1].kind, ActionKind::MarkSnoozed);
        assert_eq!(actions[1].payload["medicationId"], "med-2");
    }

    #[tokio::test]
    async fn test_reconcile_after_crash_does_not_duplicate() {
        let kv = MemoryKv::new();
        let (store, _) = store_at(&kv, 1_000);
        let key = store.capture(NotificationAction::Taken, med("med-1")).await.unwrap();

        // Simulate a crash after the append but before the key was deleted.
        let encoder = ActionEncoder::default();
        let queue = queue(&kv).await;
        let captured = store.pending().await.unwrap().remove(0).1;
        queue
            .append(encoder.encode_captured(key.key(), &captured))
            .await
            .unwrap();
        drop(queue);

        let queue = ActionQueue::load(Arc::new(kv.clone()), &SyncConfig::default())
            .await
            .unwrap();
        let report = store.reconcile_into(&queue, &encoder).await.unwrap();

        assert_eq!(report.merged, 0);
        assert_eq!(report.already_queued, 1);
        assert_eq!(queue.len().await, 1);
        assert!(queue.contains(&ActionId::derived(key.key())).await);
        assert!(store.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_after_crash_and_replay_does_not_requeue() {
        let kv = MemoryKv::new();
        let (store, _) = store_at(&kv, 1_000);
        let key = store.capture(NotificationAction::Taken, med("med-1")).await.unwrap();

        // Merged, but the key survived; then a drain applied the action.
        let encoder = ActionEncoder::default();
        let queue = queue(&kv).await;
        let captured = store.pending().await.unwrap().remove(0).1;
        queue
            .append(encoder.encode_captured(key.key(), &captured))
            .await
            .unwrap();
        assert!(queue.remove(&ActionId::derived(key.key())).await.unwrap());
        drop(queue);

        let queue = ActionQueue::load(Arc::new(kv.clone()), &SyncConfig::default())
            .await
            .unwrap();
        let report = store.reconcile_into(&queue, &encoder).await.unwrap();

        assert_eq!(report.merged, 0);
        assert_eq!(report.already_queued, 1);
        assert!(queue.is_empty().await);
        assert!(store.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_discards_unreadable_records() {
        let kv = MemoryKv::new();
        let (store, _) = store_at(&kv, 1_000);
        let bad = KvKey::new(KeyNamespace::Capture, "action-0000000000001-0000").unwrap();
        kv.set(&bad, b"{ not json").await.unwrap();

        let queue = queue(&kv).await;
        let report = store
            .reconcile_into(&queue, &ActionEncoder::default())
            .await
            .unwrap();

        assert_eq!(report.discarded, 1);
        assert!(queue.is_empty().await);
        assert_eq!(kv.get(&bad).await.unwrap(), None);
        assert_eq!(kv.list(&KeyNamespace::Quarantine).await.unwrap().len(), 1);
    }
}
