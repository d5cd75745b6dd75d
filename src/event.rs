use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::UnixTimeMs;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Result<Self, ValidationError> {
                let s = s.into().trim().to_string();
                if s.is_empty() {
                    return Err(ValidationError::EmptyId(stringify!($name)));
                }
                if s.len() > MAX_REFERENCE_LENGTH {
                    return Err(ValidationError::TooLong {
                        len: s.len(),
                        max: MAX_REFERENCE_LENGTH,
                    });
                }
                Ok(Self(s))
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

const MAX_REFERENCE_LENGTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} cannot be empty")]
    EmptyId(&'static str),
    #[error("value too long ({len} > {max})")]
    TooLong { len: usize, max: usize },
    #[error("snooze must be between {min} and {max} minutes, got {got}")]
    SnoozeOutOfRange { got: u32, min: u32, max: u32 },
}

typed_id!(MedicationId);

// --- Snooze duration: validated ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnoozeMinutes(u32);

impl SnoozeMinutes {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 24 * 60;

    pub fn new(value: u32) -> Result<Self, ValidationError> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(ValidationError::SnoozeOutOfRange {
                got: value,
                min: Self::MIN,
                max: Self::MAX,
            });
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

/// Something the user did that must eventually reach the backend.
///
/// Object-shaped fields (`medication`, `record`, `changes`) are forwarded to
/// the remote side untouched.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum DomainEvent {
    IntakeConfirmed {
        medication_id: MedicationId,
        scheduled_for: Option<UnixTimeMs>,
    },
    IntakeSkipped {
        medication_id: MedicationId,
        scheduled_for: Option<UnixTimeMs>,
    },
    IntakeSnoozed {
        medication_id: MedicationId,
        scheduled_for: Option<UnixTimeMs>,
        snooze: SnoozeMinutes,
    },
    IntakeRecordCreated {
        record: serde_json::Value,
    },
    MedicationCreated {
        medication: serde_json::Value,
    },
    MedicationUpdated {
        medication_id: MedicationId,
        changes: serde_json::Value,
    },
    PreferenceUpdated {
        changes: serde_json::Value,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IntakeConfirmed { .. } => "intake_confirmed",
            Self::IntakeSkipped { .. } => "intake_skipped",
            Self::IntakeSnoozed { .. } => "intake_snoozed",
            Self::IntakeRecordCreated { .. } => "intake_record_created",
            Self::MedicationCreated { .. } => "medication_created",
            Self::MedicationUpdated { .. } => "medication_updated",
            Self::PreferenceUpdated { .. } => "preference_updated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medication_id_rejects_blank() {
        assert!(MedicationId::new("").is_err());
        assert!(MedicationId::new("   ").is_err());
        assert_eq!(MedicationId::new(" med-1 ").unwrap().as_str(), "med-1");
    }

    #[test]
    fn medication_id_rejects_oversized() {
        assert!(matches!(
            MedicationId::new("m".repeat(MAX_REFERENCE_LENGTH + 1)),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn medication_id_is_validated_on_deserialize() {
        assert!(serde_json::from_str::<MedicationId>(r#""med-1""#).is_ok());
        assert!(serde_json::from_str::<MedicationId>(r#""  ""#).is_err());
    }

    #[test]
    fn snooze_bounds() {
        assert!(SnoozeMinutes::new(0).is_err());
        assert!(SnoozeMinutes::new(1).is_ok());
        assert!(SnoozeMinutes::new(24 * 60).is_ok());
        assert!(SnoozeMinutes::new(24 * 60 + 1).is_err());
    }

    #[test]
    fn event_names_are_snake_case() {
        let event = DomainEvent::IntakeConfirmed {
            medication_id: MedicationId::new("med-1").unwrap(),
            scheduled_for: None,
        };
        assert_eq!(event.name(), "intake_confirmed");
    }
}
