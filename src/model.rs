use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Namespace for ids derived from background capture keys.
const DERIVED_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5f1c_9a3e_2b7d_4c80_9e61_0d4a_7b3f_12c8);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("invalid action id: {0}")]
    InvalidId(String),

    #[error("unknown action kind: {0:?}")]
    UnknownKind(String),

    #[error("unknown entity: {0:?}")]
    UnknownEntity(String),
}

/// Unix timestamp in milliseconds
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated action identifier - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActionId(String);

impl ActionId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Stable id for a record that may be encoded more than once, such as a
    /// captured notification action replayed after a crash.
    pub fn derived(name: &str) -> Self {
        Self(Uuid::new_v5(&DERIVED_ID_NAMESPACE, name.as_bytes()).to_string())
    }

    /// Whether this id came from [`derived`](Self::derived).
    pub fn is_derived(&self) -> bool {
        Uuid::parse_str(&self.0).is_ok_and(|id| id.get_version() == Some(uuid::Version::Sha1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), ModelError> {
        if id.is_empty() {
            return Err(ModelError::InvalidId("id cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ModelError::InvalidId(format!(
                "id exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ModelError::InvalidId(
                "id contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(())
    }
}

impl TryFrom<String> for ActionId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ActionId> for String {
    fn from(id: ActionId) -> Self {
        id.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Domain aggregate a mutation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Medication,
    IntakeRecord,
    UserPreference,
}

impl EntityKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Medication => "medication",
            Self::IntakeRecord => "intake-record",
            Self::UserPreference => "user-preference",
        }
    }

    /// Returns `None` for unrecognized values.
    pub fn from_str_checked(s: &str) -> Option<Self> {
        match s {
            "medication" => Some(Self::Medication),
            "intake-record" => Some(Self::IntakeRecord),
            "user-preference" => Some(Self::UserPreference),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of mutations the queue can carry.
///
/// Adding a variant is backward compatible for readers: older builds skip
/// records whose kind they do not know (see `offline_store`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    CreateMedication,
    UpdateMedication,
    CreateIntakeRecord,
    MarkTaken,
    MarkSkipped,
    MarkSnoozed,
    UpdatePreference,
}

impl ActionKind {
    pub const ALL: [ActionKind; 7] = [
        Self::CreateMedication,
        Self::UpdateMedication,
        Self::CreateIntakeRecord,
        Self::MarkTaken,
        Self::MarkSkipped,
        Self::MarkSnoozed,
        Self::UpdatePreference,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateMedication => "create-medication",
            Self::UpdateMedication => "update-medication",
            Self::CreateIntakeRecord => "create-intake-record",
            Self::MarkTaken => "mark-taken",
            Self::MarkSkipped => "mark-skipped",
            Self::MarkSnoozed => "mark-snoozed",
            Self::UpdatePreference => "update-preference",
        }
    }

    /// Returns `None` for unrecognized values.
    pub fn from_str_checked(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// The only entity this kind of mutation may target.
    pub const fn target_entity(self) -> EntityKind {
        match self {
            Self::CreateMedication | Self::UpdateMedication => EntityKind::Medication,
            Self::CreateIntakeRecord | Self::MarkTaken | Self::MarkSkipped | Self::MarkSnoozed => {
                EntityKind::IntakeRecord
            }
            Self::UpdatePreference => EntityKind::UserPreference,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single queued, not-yet-applied user mutation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub entity: EntityKind,
    /// Already in the shape the remote side expects; never interpreted here.
    pub payload: serde_json::Value,
    pub enqueued_at: UnixTimeMs,
    #[serde(default)]
    pub attempt: u32,
}

impl PendingAction {
    pub fn sort_key(&self) -> (UnixTimeMs, &ActionId) {
        (self.enqueued_at, &self.id)
    }

    /// Total replay order: `enqueued_at`, ties broken by `id`.
    pub fn replay_order(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

// Redact debug output because payloads carry health data.
impl fmt::Debug for PendingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("entity", &self.entity)
            .field(
                "payload_fields",
                &self.payload.as_object().map_or(0, |obj| obj.len()),
            )
            .field("enqueued_at", &self.enqueued_at)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// An action the remote side refused permanently, parked outside the replay
/// queue for manual handling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub action: PendingAction,
    pub reason: String,
    pub dead_lettered_at: UnixTimeMs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(id: &str, at: u64) -> PendingAction {
        PendingAction {
            id: ActionId::new(id).unwrap(),
            kind: ActionKind::MarkTaken,
            entity: EntityKind::IntakeRecord,
            payload: json!({ "medicationId": "med-1" }),
            enqueued_at: UnixTimeMs(at),
            attempt: 0,
        }
    }

    #[test]
    fn test_action_id_validation() {
        assert!(ActionId::new("valid-id_123").is_ok());
        assert!(ActionId::new("").is_err());
        assert!(ActionId::new("   ").is_err());
        assert!(ActionId::new("invalid id").is_err());
        assert!(ActionId::new("a".repeat(129)).is_err());
    }

    #[test]
    fn test_action_id_trims_whitespace() {
        let id = ActionId::new("  op-1  ").unwrap();
        assert_eq!(id.as_str(), "op-1");
    }

    #[test]
    fn test_derived_ids_are_stable() {
        let a = ActionId::derived("action-0001700000000000-0000");
        let b = ActionId::derived("action-0001700000000000-0000");
        let c = ActionId::derived("action-0001700000000000-0001");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(ActionId::new(a.as_str()).is_ok());
        assert!(a.is_derived());
        assert!(!ActionId::generate().is_derived());
        assert!(!ActionId::new("op-1").unwrap().is_derived());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| ActionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_kind_string_roundtrip() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::from_str_checked(kind.as_str()), Some(kind));
        }
        assert_eq!(ActionKind::from_str_checked("mark-forgotten"), None);
        assert_eq!(ActionKind::from_str_checked(""), None);
    }

    #[test]
    fn test_kind_targets() {
        assert_eq!(ActionKind::MarkSnoozed.target_entity(), EntityKind::IntakeRecord);
        assert_eq!(ActionKind::UpdateMedication.target_entity(), EntityKind::Medication);
        assert_eq!(
            ActionKind::UpdatePreference.target_entity(),
            EntityKind::UserPreference
        );
    }

    #[test]
    fn test_replay_order_breaks_ties_by_id() {
        let mut actions = vec![action("b", 10), action("c", 5), action("a", 10)];
        actions.sort_by(PendingAction::replay_order);
        let ids: Vec<_> = actions.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(action("op-1", 42)).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "op-1",
                "kind": "mark-taken",
                "entity": "intake-record",
                "payload": { "medicationId": "med-1" },
                "enqueuedAt": 42,
                "attempt": 0
            })
        );
    }

    #[test]
    fn test_missing_attempt_defaults_to_zero() {
        let parsed: PendingAction = serde_json::from_value(json!({
            "id": "op-1",
            "kind": "mark-skipped",
            "entity": "intake-record",
            "payload": {},
            "enqueuedAt": 7
        }))
        .unwrap();
        assert_eq!(parsed.attempt, 0);
    }

    #[test]
    fn test_invalid_persisted_id_is_rejected() {
        let parsed = serde_json::from_value::<PendingAction>(json!({
            "id": "not valid!",
            "kind": "mark-taken",
            "entity": "intake-record",
            "payload": {},
            "enqueuedAt": 7
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_debug_redacts_payload() {
        let rendered = format!("{:?}", action("op-1", 1));
        assert!(!rendered.contains("med-1"));
        assert!(rendered.contains("payload_fields: 1"));
    }
}
