use lru::LruCache;
use serde_json::Value;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use crate::capabilities::kv::{KeyNamespace, KvError, KvKey, KvStore};
use crate::config::{ConfigError, SyncConfig};
use crate::model::{ActionId, DeadLetter, PendingAction, UnixTimeMs};
use crate::offline_store::{self, StoreError};

const QUEUE_KEY: &str = "pending-actions";
const DEAD_LETTER_KEY: &str = "actions";
const RETIRED_KEY: &str = "replayed-captures";
/// Captured actions are rare; this covers far more than one restart's worth.
const MAX_RETIRED_IDS: usize = 1024;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({0} entries)")]
    Full(usize),

    #[error("duplicate action: {0}")]
    DuplicateId(ActionId),

    #[error("action {0} was already removed and cannot be queued again")]
    AlreadyRemoved(ActionId),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("encoding error: {0}")]
    Encoding(#[from] StoreError),
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub appended: AtomicU64,
    pub removed: AtomicU64,
    pub attempts_recorded: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub duplicate_rejections: AtomicU64,
    pub storage_errors: AtomicU64,
    pub quarantined_blobs: AtomicU64,
    pub unknown_kinds_kept: AtomicU64,
}

impl QueueMetrics {
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            appended: self.appended.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            attempts_recorded: self.attempts_recorded.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            duplicate_rejections: self.duplicate_rejections.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            quarantined_blobs: self.quarantined_blobs.load(Ordering::Relaxed),
            unknown_kinds_kept: self.unknown_kinds_kept.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetricsSnapshot {
    pub appended: u64,
    pub removed: u64,
    pub attempts_recorded: u64,
    pub dead_lettered: u64,
    pub duplicate_rejections: u64,
    pub storage_errors: u64,
    pub quarantined_blobs: u64,
    pub unknown_kinds_kept: u64,
}

// ============================================================================
// Queue state
// ============================================================================

struct QueueState {
    /// Kept sorted by replay order.
    actions: Vec<PendingAction>,
    /// Records of kinds this build cannot replay, written back untouched.
    unknown_actions: Vec<Value>,
    removed_ids: LruCache<ActionId, ()>,
    /// Derived ids of captured actions that left the queue. Persisted, so a
    /// capture whose key outlived its merge is never queued a second time.
    retired: VecDeque<ActionId>,
    dead_letters: Vec<DeadLetter>,
    unknown_letters: Vec<Value>,
    quarantined: Vec<KvKey>,
}

impl QueueState {
    fn position(&self, id: &ActionId) -> Option<usize> {
        self.actions.iter().position(|a| &a.id == id)
    }

    fn was_removed(&self, id: &ActionId) -> bool {
        self.removed_ids.contains(id) || self.retired.contains(id)
    }
}

/// Durable, ordered list of pending actions.
///
/// Every mutation updates the in-memory mirror, persists the whole list, and
/// rolls the mirror back if persisting fails. The write lock is held across the
/// persist call, so mutations are serialized and a caller that got `Ok` knows
/// the change is on disk.
///
/// Records of kinds this build does not know are not listed or replayed, but
/// they stay persisted until [`clear`](Self::clear).
pub struct ActionQueue {
    kv: Arc<dyn KvStore>,
    queue_key: KvKey,
    dead_letter_key: KvKey,
    retired_key: KvKey,
    max_entries: usize,
    state: RwLock<QueueState>,
    metrics: QueueMetrics,
}

impl ActionQueue {
    /// Loads the persisted queue. Corrupt contents are quarantined and the
    /// queue starts empty; only an unreadable backing store is an error.
    #[instrument(skip(kv, config))]
    pub async fn load(kv: Arc<dyn KvStore>, config: &SyncConfig) -> Result<Self, QueueError> {
        config.validate()?;

        let queue_key = KvKey::new(KeyNamespace::Queue, QUEUE_KEY)?;
        let dead_letter_key = KvKey::new(KeyNamespace::DeadLetter, DEAD_LETTER_KEY)?;
        let retired_key = KvKey::new(KeyNamespace::Queue, RETIRED_KEY)?;
        let metrics = QueueMetrics::default();
        let mut quarantined = kv.list(&KeyNamespace::Quarantine).await?;

        let mut actions = Vec::new();
        let mut unknown_actions = Vec::new();
        if let Some(bytes) = kv.get(&queue_key).await? {
            match offline_store::decode_actions(&bytes) {
                Ok(decoded) => {
                    metrics
                        .unknown_kinds_kept
                        .fetch_add(decoded.unknown.len() as u64, Ordering::Relaxed);
                    actions = decoded.records;
                    unknown_actions = decoded.unknown;
                }
                Err(e) => {
                    warn!("Discarding corrupt action queue: {}", e);
                    quarantined.push(quarantine(kv.as_ref(), &queue_key, &bytes).await?);
                    metrics.quarantined_blobs.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let mut dead_letters = Vec::new();
        let mut unknown_letters = Vec::new();
        if let Some(bytes) = kv.get(&dead_letter_key).await? {
            match offline_store::decode_dead_letters(&bytes) {
                Ok(decoded) => {
                    dead_letters = decoded.records;
                    unknown_letters = decoded.unknown;
                }
                Err(e) => {
                    warn!("Discarding corrupt dead-letter list: {}", e);
                    quarantined.push(quarantine(kv.as_ref(), &dead_letter_key, &bytes).await?);
                    metrics.quarantined_blobs.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let mut retired = VecDeque::new();
        if let Some(bytes) = kv.get(&retired_key).await? {
            match offline_store::decode_retired_ids(&bytes) {
                Ok(ids) => retired = ids.into(),
                Err(e) => {
                    warn!("Discarding corrupt list of replayed captures: {}", e);
                    quarantined.push(quarantine(kv.as_ref(), &retired_key, &bytes).await?);
                    metrics.quarantined_blobs.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if actions.len() > config.max_entries {
            warn!(
                "Loaded {} actions, above the maximum of {}; appends refused until it drains",
                actions.len(),
                config.max_entries
            );
        }

        info!(
            "Action queue loaded with {} pending, {} dead-lettered, {} quarantined",
            actions.len(),
            dead_letters.len(),
            quarantined.len()
        );

        let cache_size =
            NonZeroUsize::new(config.removed_id_cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            kv,
            queue_key,
            dead_letter_key,
            retired_key,
            max_entries: config.max_entries,
            state: RwLock::new(QueueState {
                actions,
                unknown_actions,
                removed_ids: LruCache::new(cache_size),
                retired,
                dead_letters,
                unknown_letters,
                quarantined,
            }),
            metrics,
        })
    }

    /// Appends `action` and returns once it is durable.
    #[instrument(skip(self, action), fields(action_id = %action.id, kind = %action.kind))]
    pub async fn append(&self, action: PendingAction) -> Result<(), QueueError> {
        let mut state = self.state.write().await;

        if state.position(&action.id).is_some() {
            self.metrics.duplicate_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(QueueError::DuplicateId(action.id));
        }

        if state.was_removed(&action.id) {
            self.metrics.duplicate_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(QueueError::AlreadyRemoved(action.id));
        }

        if state.actions.len() >= self.max_entries {
            return Err(QueueError::Full(self.max_entries));
        }

        // Memory first
        let pos = state
            .actions
            .partition_point(|queued| queued.replay_order(&action).is_lt());
        state.actions.insert(pos, action);

        // Then persist - rollback on failure
        if let Err(e) = self.persist_actions(&state).await {
            state.actions.remove(pos);
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to persist appended action: {}", e);
            return Err(e);
        }

        self.metrics.appended.fetch_add(1, Ordering::Relaxed);
        info!("Action queued ({} pending)", state.actions.len());
        Ok(())
    }

    /// All pending actions in replay order.
    pub async fn list_ordered(&self) -> Vec<PendingAction> {
        self.state.read().await.actions.clone()
    }

    /// Removes `id`. Returns `false` without touching storage if it is not queued.
    #[instrument(skip(self), fields(action_id = %id))]
    pub async fn remove(&self, id: &ActionId) -> Result<bool, QueueError> {
        let mut state = self.state.write().await;

        let Some(pos) = state.position(id) else {
            return Ok(false);
        };
        self.retire_captured(&mut state, vec![id.clone()]).await?;
        let removed = state.actions.remove(pos);

        if let Err(e) = self.persist_actions(&state).await {
            state.actions.insert(pos, removed);
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to persist removal: {}", e);
            return Err(e);
        }

        state.removed_ids.put(removed.id, ());
        self.metrics.removed.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Drops every pending action, including records of unknown kinds.
    /// Returns how many were dropped.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let mut state = self.state.write().await;

        let leaving = state.actions.iter().map(|a| a.id.clone()).collect();
        self.retire_captured(&mut state, leaving).await?;

        let cleared = std::mem::take(&mut state.actions);
        let cleared_unknown = std::mem::take(&mut state.unknown_actions);
        if let Err(e) = self.persist_actions(&state).await {
            state.actions = cleared;
            state.unknown_actions = cleared_unknown;
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to persist cleared queue: {}", e);
            return Err(e);
        }

        let count = cleared.len() + cleared_unknown.len();
        for action in cleared {
            state.removed_ids.put(action.id, ());
        }
        self.metrics.removed.fetch_add(count as u64, Ordering::Relaxed);
        warn!("Cleared {} pending actions", count);
        Ok(count)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.actions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.actions.is_empty()
    }

    pub async fn contains(&self, id: &ActionId) -> bool {
        self.state.read().await.position(id).is_some()
    }

    /// Increments the persisted attempt counter of `id`.
    ///
    /// Returns the new count, or `None` if the action is no longer queued.
    #[instrument(skip(self), fields(action_id = %id))]
    pub async fn record_attempt(&self, id: &ActionId) -> Result<Option<u32>, QueueError> {
        let mut state = self.state.write().await;

        let Some(pos) = state.position(id) else {
            return Ok(None);
        };
        let previous = state.actions[pos].attempt;
        state.actions[pos].attempt = previous.saturating_add(1);

        if let Err(e) = self.persist_actions(&state).await {
            state.actions[pos].attempt = previous;
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to persist attempt count: {}", e);
            return Err(e);
        }

        self.metrics.attempts_recorded.fetch_add(1, Ordering::Relaxed);
        Ok(Some(state.actions[pos].attempt))
    }

    /// Moves `id` from the queue to the dead-letter list.
    ///
    /// The dead letter is written before the action leaves the queue, so a
    /// crash in between leaves it in both places rather than in neither.
    #[instrument(skip(self, reason), fields(action_id = %id))]
    pub async fn dead_letter(
        &self,
        id: &ActionId,
        reason: impl Into<String>,
    ) -> Result<Option<DeadLetter>, QueueError> {
        let mut state = self.state.write().await;

        let Some(pos) = state.position(id) else {
            return Ok(None);
        };

        let letter = DeadLetter {
            action: state.actions[pos].clone(),
            reason: reason.into(),
            dead_lettered_at: UnixTimeMs::now(),
        };

        let previous_letters = state.dead_letters.clone();
        match state.dead_letters.iter().position(|l| &l.action.id == id) {
            Some(existing) => state.dead_letters[existing] = letter.clone(),
            None => state.dead_letters.push(letter.clone()),
        }

        if let Err(e) = self.persist_dead_letters(&state).await {
            state.dead_letters = previous_letters;
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to persist dead letter: {}", e);
            return Err(e);
        }

        self.retire_captured(&mut state, vec![id.clone()]).await?;
        let removed = state.actions.remove(pos);
        if let Err(e) = self.persist_actions(&state).await {
            // The dead letter stays written; a retry replaces it in place.
            state.actions.insert(pos, removed);
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to remove dead-lettered action from queue: {}", e);
            return Err(e);
        }

        state.removed_ids.put(removed.id, ());
        self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
        warn!(reason = %letter.reason, "Action moved to dead-letter list");
        Ok(Some(letter))
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.read().await.dead_letters.clone()
    }

    /// Deletes a dead letter after it has been handled manually.
    #[instrument(skip(self), fields(action_id = %id))]
    pub async fn discard_dead_letter(&self, id: &ActionId) -> Result<bool, QueueError> {
        let mut state = self.state.write().await;

        let Some(pos) = state.dead_letters.iter().position(|l| &l.action.id == id) else {
            return Ok(false);
        };
        let removed = state.dead_letters.remove(pos);

        if let Err(e) = self.persist_dead_letters(&state).await {
            state.dead_letters.insert(pos, removed);
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to persist dead-letter removal: {}", e);
            return Err(e);
        }
        Ok(true)
    }

    /// Keys of corrupt blobs set aside for inspection.
    pub async fn quarantined(&self) -> Vec<KvKey> {
        self.state.read().await.quarantined.clone()
    }

    pub fn metrics(&self) -> QueueMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Records that captured actions among `leaving` are about to leave the
    /// queue. Runs before the queue itself is rewritten, so a crash in between
    /// leaves an id both queued and retired, never merged twice.
    async fn retire_captured(
        &self,
        state: &mut QueueState,
        leaving: Vec<ActionId>,
    ) -> Result<(), QueueError> {
        let fresh: Vec<ActionId> = leaving
            .into_iter()
            .filter(|id| id.is_derived() && !state.retired.contains(id))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        let previous = state.retired.clone();
        state.retired.extend(fresh);
        while state.retired.len() > MAX_RETIRED_IDS {
            state.retired.pop_front();
        }

        let bytes = match offline_store::encode_retired_ids(state.retired.make_contiguous()) {
            Ok(bytes) => bytes,
            Err(e) => {
                state.retired = previous;
                return Err(e.into());
            }
        };
        if let Err(e) = self.kv.set(&self.retired_key, &bytes).await {
            state.retired = previous;
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to persist replayed capture ids: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    async fn persist_actions(&self, state: &QueueState) -> Result<(), QueueError> {
        let bytes = offline_store::encode_actions(&state.actions, &state.unknown_actions)?;
        self.kv.set(&self.queue_key, &bytes).await?;
        Ok(())
    }

    async fn persist_dead_letters(&self, state: &QueueState) -> Result<(), QueueError> {
        let bytes =
            offline_store::encode_dead_letters(&state.dead_letters, &state.unknown_letters)?;
        self.kv.set(&self.dead_letter_key, &bytes).await?;
        Ok(())
    }
}

/// Copies a corrupt blob aside and deletes the original.
async fn quarantine(kv: &dyn KvStore, source: &KvKey, bytes: &[u8]) -> Result<KvKey, KvError> {
    let key = KvKey::new(
        KeyNamespace::Quarantine,
        format!("{:013}-{}", UnixTimeMs::now().as_millis(), source.key()),
    )?;
    kv.set(&key, bytes).await?;
    kv.delete(source).await?;
    warn!("Quarantined {} as {}", source.raw(), key.raw());
    Ok(key)
}
