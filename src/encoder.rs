use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

use crate::capture::CapturedAction;
use crate::event::DomainEvent;
use crate::model::{ActionId, ActionKind, EntityKind, PendingAction, UnixTimeMs};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("action kind is empty")]
    MissingKind,

    #[error("entity is empty")]
    MissingEntity,

    #[error("unknown action kind: {0:?}")]
    UnknownKind(String),

    #[error("unknown entity: {0:?}")]
    UnknownEntity(String),

    #[error("{kind} cannot target {entity}")]
    EntityMismatch { kind: ActionKind, entity: EntityKind },

    #[error("payload must be a JSON object, got {0}")]
    PayloadNotObject(&'static str),
}

pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Turns user intents into [`PendingAction`]s. Performs no I/O.
pub struct ActionEncoder {
    clock: Arc<dyn Clock>,
    last_stamp: AtomicU64,
}

impl Default for ActionEncoder {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ActionEncoder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last_stamp: AtomicU64::new(0),
        }
    }

    /// Strictly increasing within this encoder, so append order and replay
    /// order agree even for several actions in the same millisecond.
    fn next_stamp(&self) -> UnixTimeMs {
        let now = self.clock.now().as_millis();
        let mut last = self.last_stamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .last_stamp
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return UnixTimeMs(next),
                Err(observed) => last = observed,
            }
        }
    }

    pub fn encode(
        &self,
        kind: ActionKind,
        entity: EntityKind,
        payload: Value,
    ) -> Result<PendingAction, EncodeError> {
        let payload = checked(kind, entity, payload)?;
        Ok(PendingAction {
            id: ActionId::generate(),
            kind,
            entity,
            payload,
            enqueued_at: self.next_stamp(),
            attempt: 0,
        })
    }

    /// For callers that only have the wire strings.
    pub fn encode_raw(
        &self,
        kind: &str,
        entity: &str,
        payload: Value,
    ) -> Result<PendingAction, EncodeError> {
        let (kind, entity) = parse_pair(kind, entity).map_err(|e| {
            error!("Refusing to encode action: {}", e);
            e
        })?;
        self.encode(kind, entity, payload)
    }

    pub fn encode_event(&self, event: DomainEvent) -> Result<PendingAction, EncodeError> {
        let (kind, payload) = match event {
            DomainEvent::IntakeConfirmed {
                medication_id,
                scheduled_for,
            } => (
                ActionKind::MarkTaken,
                intake_payload(medication_id.as_str(), scheduled_for),
            ),
            DomainEvent::IntakeSkipped {
                medication_id,
                scheduled_for,
            } => (
                ActionKind::MarkSkipped,
                intake_payload(medication_id.as_str(), scheduled_for),
            ),
            DomainEvent::IntakeSnoozed {
                medication_id,
                scheduled_for,
                snooze,
            } => {
                let mut payload = intake_payload(medication_id.as_str(), scheduled_for);
                payload["snoozeMinutes"] = json!(snooze.value());
                (ActionKind::MarkSnoozed, payload)
            }
            DomainEvent::IntakeRecordCreated { record } => (ActionKind::CreateIntakeRecord, record),
            DomainEvent::MedicationCreated { medication } => {
                (ActionKind::CreateMedication, medication)
            }
            DomainEvent::MedicationUpdated {
                medication_id,
                changes,
            } => (
                ActionKind::UpdateMedication,
                json!({ "medicationId": medication_id.as_str(), "changes": changes }),
            ),
            DomainEvent::PreferenceUpdated { changes } => (ActionKind::UpdatePreference, changes),
        };
        self.encode(kind, kind.target_entity(), payload)
    }

    /// Re-encodes a background capture.
    ///
    /// The id is derived from the capture key and the timestamp is the capture
    /// time, so encoding the same capture twice yields the same action.
    pub fn encode_captured(&self, key: &str, captured: &CapturedAction) -> PendingAction {
        PendingAction {
            id: ActionId::derived(key),
            kind: captured.action.kind(),
            entity: EntityKind::IntakeRecord,
            payload: intake_payload(captured.medication_id.as_str(), None),
            enqueued_at: captured.captured_at,
            attempt: 0,
        }
    }
}

fn parse_pair(kind: &str, entity: &str) -> Result<(ActionKind, EntityKind), EncodeError> {
    let kind = kind.trim();
    let entity = entity.trim();
    if kind.is_empty() {
        return Err(EncodeError::MissingKind);
    }
    if entity.is_empty() {
        return Err(EncodeError::MissingEntity);
    }
    let kind =
        ActionKind::from_str_checked(kind).ok_or_else(|| EncodeError::UnknownKind(kind.into()))?;
    let entity = EntityKind::from_str_checked(entity)
        .ok_or_else(|| EncodeError::UnknownEntity(entity.into()))?;
    Ok((kind, entity))
}

fn checked(kind: ActionKind, entity: EntityKind, payload: Value) -> Result<Value, EncodeError> {
    let result = if kind.target_entity() != entity {
        Err(EncodeError::EntityMismatch { kind, entity })
    } else {
        match payload {
            Value::Null => Ok(Value::Object(Map::new())),
            Value::Object(_) => Ok(payload),
            Value::Bool(_) => Err(EncodeError::PayloadNotObject("a boolean")),
            Value::Number(_) => Err(EncodeError::PayloadNotObject("a number")),
            Value::String(_) => Err(EncodeError::PayloadNotObject("a string")),
            Value::Array(_) => Err(EncodeError::PayloadNotObject("an array")),
        }
    };
    if let Err(e) = &result {
        error!("Refusing to encode action: {}", e);
    }
    result
}

fn intake_payload(medication_id: &str, scheduled_for: Option<UnixTimeMs>) -> Value {
    let mut payload = json!({ "medicationId": medication_id });
    if let Some(at) = scheduled_for {
        payload["scheduledFor"] = json!(at.as_millis());
    }
    payload
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capabilities::notification::NotificationAction;
    use crate::event::{MedicationId, SnoozeMinutes};

    /// Clock that only moves when told to.
    #[derive(Default)]
    pub(crate) struct ManualClock(AtomicU64);

    impl ManualClock {
        pub(crate) fn at(ms: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(ms)))
        }

        pub(crate) fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> UnixTimeMs {
            UnixTimeMs(self.0.load(Ordering::SeqCst))
        }
    }

    fn encoder_at(ms: u64) -> (ActionEncoder, Arc<ManualClock>) {
        let clock = ManualClock::at(ms);
        (ActionEncoder::new(clock.clone()), clock)
    }

    fn med() -> MedicationId {
        MedicationId::new("med-1").unwrap()
    }

    #[test]
    fn encode_assigns_unique_ids_and_clock_time() {
        let (encoder, _) = encoder_at(1_000);
        let a = encoder
            .encode(ActionKind::MarkTaken, EntityKind::IntakeRecord, json!({}))
            .unwrap();
        let b = encoder
            .encode(ActionKind::MarkTaken, EntityKind::IntakeRecord, json!({}))
            .unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.enqueued_at, UnixTimeMs(1_000));
        assert_eq!(a.attempt, 0);
    }

    #[test]
    fn same_millisecond_stamps_are_strictly_increasing() {
        let (encoder, clock) = encoder_at(1_000);
        let stamps: Vec<_> = (0..5)
            .map(|_| {
                encoder
                    .encode(ActionKind::MarkSkipped, EntityKind::IntakeRecord, Value::Null)
                    .unwrap()
                    .enqueued_at
                    .as_millis()
            })
            .collect();
        assert_eq!(stamps, vec![1_000, 1_001, 1_002, 1_003, 1_004]);

        clock.advance(100);
        let next = encoder
            .encode(ActionKind::MarkSkipped, EntityKind::IntakeRecord, Value::Null)
            .unwrap();
        assert_eq!(next.enqueued_at, UnixTimeMs(1_100));
    }

    #[test]
    fn clock_going_backwards_does_not_reorder() {
        let clock = ManualClock::at(5_000);
        let encoder = ActionEncoder::new(clock.clone());
        let first = encoder
            .encode(ActionKind::MarkTaken, EntityKind::IntakeRecord, json!({}))
            .unwrap();
        clock.0.store(1_000, Ordering::SeqCst);
        let second = encoder
            .encode(ActionKind::MarkTaken, EntityKind::IntakeRecord, json!({}))
            .unwrap();
        assert!(second.enqueued_at > first.enqueued_at);
    }

    #[test]
    fn null_payload_normalizes_to_empty_object() {
        let (encoder, _) = encoder_at(1);
        let action = encoder
            .encode(ActionKind::UpdatePreference, EntityKind::UserPreference, Value::Null)
            .unwrap();
        assert_eq!(action.payload, json!({}));
    }

    #[test]
    fn misuse_is_rejected() {
        let (encoder, _) = encoder_at(1);
        assert_eq!(
            encoder.encode_raw("", "intake-record", json!({})).unwrap_err(),
            EncodeError::MissingKind
        );
        assert_eq!(
            encoder.encode_raw("mark-taken", " ", json!({})).unwrap_err(),
            EncodeError::MissingEntity
        );
        assert!(matches!(
            encoder.encode_raw("mark-forgotten", "intake-record", json!({})),
            Err(EncodeError::UnknownKind(_))
        ));
        assert!(matches!(
            encoder.encode_raw("mark-taken", "pharmacy", json!({})),
            Err(EncodeError::UnknownEntity(_))
        ));
        assert!(matches!(
            encoder.encode_raw("mark-taken", "medication", json!({})),
            Err(EncodeError::EntityMismatch { .. })
        ));
        assert!(matches!(
            encoder.encode_raw("mark-taken", "intake-record", json!([1, 2])),
            Err(EncodeError::PayloadNotObject(_))
        ));
    }

    #[test]
    fn intake_events_map_to_mark_kinds() {
        let (encoder, _) = encoder_at(1);

        let taken = encoder
            .encode_event(DomainEvent::IntakeConfirmed {
                medication_id: med(),
                scheduled_for: Some(UnixTimeMs(1_700_000_000_000)),
            })
            .unwrap();
        assert_eq!(taken.kind, ActionKind::MarkTaken);
        assert_eq!(taken.entity, EntityKind::IntakeRecord);
        assert_eq!(
            taken.payload,
            json!({ "medicationId": "med-1", "scheduledFor": 1_700_000_000_000u64 })
        );

        let skipped = encoder
            .encode_event(DomainEvent::IntakeSkipped {
                medication_id: med(),
                scheduled_for: None,
            })
            .unwrap();
        assert_eq!(skipped.kind, ActionKind::MarkSkipped);
        assert_eq!(skipped.payload, json!({ "medicationId": "med-1" }));

        let snoozed = encoder
            .encode_event(DomainEvent::IntakeSnoozed {
                medication_id: med(),
                scheduled_for: None,
                snooze: SnoozeMinutes::new(15).unwrap(),
            })
            .unwrap();
        assert_eq!(snoozed.kind, ActionKind::MarkSnoozed);
        assert_eq!(
            snoozed.payload,
            json!({ "medicationId": "med-1", "snoozeMinutes": 15 })
        );
    }

    #[test]
    fn medication_and_preference_events_map() {
        let (encoder, _) = encoder_at(1);

        let created = encoder
            .encode_event(DomainEvent::MedicationCreated {
                medication: json!({ "name": "Metformin", "dose": "500mg" }),
            })
            .unwrap();
        assert_eq!(created.kind, ActionKind::CreateMedication);
        assert_eq!(created.entity, EntityKind::Medication);
        assert_eq!(created.payload["name"], "Metformin");

        let updated = encoder
            .encode_event(DomainEvent::MedicationUpdated {
                medication_id: med(),
                changes: json!({ "dose": "850mg" }),
            })
            .unwrap();
        assert_eq!(
            updated.payload,
            json!({ "medicationId": "med-1", "changes": { "dose": "850mg" } })
        );

        let pref = encoder
            .encode_event(DomainEvent::PreferenceUpdated {
                changes: json!({ "reminderSound": false }),
            })
            .unwrap();
        assert_eq!(pref.entity, EntityKind::UserPreference);

        let bad = encoder.encode_event(DomainEvent::IntakeRecordCreated { record: json!("x") });
        assert!(matches!(bad, Err(EncodeError::PayloadNotObject(_))));
    }

    #[test]
    fn captured_actions_encode_deterministically() {
        let (encoder, _) = encoder_at(9_999);
        let captured = CapturedAction {
            action: NotificationAction::Snooze,
            medication_id: med(),
            captured_at: UnixTimeMs(1_234),
        };

        let a = encoder.encode_captured("action-0000000001234-0000", &captured);
        let b = encoder.encode_captured("action-0000000001234-0000", &captured);

        assert_eq!(a, b);
        assert_eq!(a.kind, ActionKind::MarkSnoozed);
        assert_eq!(a.enqueued_at, UnixTimeMs(1_234));
        assert_eq!(a.payload, json!({ "medicationId": "med-1" }));
    }
}
