use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::event::MedicationId;
use crate::model::{ActionKind, UnixTimeMs};

/// Buttons offered on a dose reminder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
    Taken,
    Snooze,
    Skip,
}

impl NotificationAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Taken => "taken",
            Self::Snooze => "snooze",
            Self::Skip => "skip",
        }
    }

    /// Parses the action identifier the platform reports for a button press.
    pub fn parse(action_id: &str) -> Result<Self, NotificationError> {
        match action_id.trim() {
            "taken" => Ok(Self::Taken),
            "snooze" => Ok(Self::Snooze),
            "skip" => Ok(Self::Skip),
            other => Err(NotificationError::UnknownAction(other.to_string())),
        }
    }

    #[must_use]
    pub const fn kind(self) -> ActionKind {
        match self {
            Self::Taken => ActionKind::MarkTaken,
            Self::Snooze => ActionKind::MarkSnoozed,
            Self::Skip => ActionKind::MarkSkipped,
        }
    }
}

impl fmt::Display for NotificationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationError {
    #[error("unknown notification action: {0:?}")]
    UnknownAction(String),
}

/// Message posted to open pages when an action is captured in the background,
/// so a visible page can update without waiting for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiveMessage {
    #[serde(rename_all = "camelCase")]
    NotificationAction {
        action: NotificationAction,
        medication_id: MedicationId,
        captured_at: UnixTimeMs,
    },
}
