use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::PendingAction;

/// Statuses that mean "try again later" even though they are 4xx.
pub const RETRYABLE_CLIENT_STATUSES: [u16; 3] = [408, 425, 429];

/// Applies queued actions to the backend.
///
/// Implementations must be idempotent on `action.id`: the driver delivers at
/// least once, so the same id can arrive again after a lost acknowledgment.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn submit(&self, action: &PendingAction) -> Result<(), SubmitError>;
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubmitError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

impl SubmitError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Classifies a non-success response.
    ///
    /// 4xx responses are permanent except the ones in
    /// [`RETRYABLE_CLIENT_STATUSES`]; everything else is transient.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&status) && !RETRYABLE_CLIENT_STATUSES.contains(&status) {
            Self::Rejected { status, message }
        } else {
            Self::Status { status, message }
        }
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_permanent()
    }

    /// Resubmitting the same action will never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SubmitError::Rejected { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SubmitError::Status { status, .. } | SubmitError::Rejected { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_permanent() {
        for status in [400, 401, 403, 404, 409, 422] {
            let err = SubmitError::from_status(status, "nope");
            assert!(err.is_permanent(), "{status} should be permanent");
            assert_eq!(err.status(), Some(status));
        }
    }

    #[test]
    fn test_throttling_and_timeouts_are_transient() {
        for status in RETRYABLE_CLIENT_STATUSES {
            let err = SubmitError::from_status(status, "later");
            assert!(err.is_retryable(), "{status} should be retryable");
            assert!(matches!(err, SubmitError::Status { .. }));
        }
    }

    #[test]
    fn test_server_errors_are_transient() {
        for status in [500, 502, 503, 504] {
            let err = SubmitError::from_status(status, "boom");
            assert!(err.is_retryable());
            assert!(!err.is_permanent());
            assert_eq!(err.status(), Some(status));
        }
    }

    #[test]
    fn test_transport_errors_are_transient() {
        assert!(SubmitError::network("offline").is_retryable());
        assert!(SubmitError::Timeout { timeout_ms: 30_000 }.is_retryable());
        assert_eq!(SubmitError::network("offline").status(), None);
    }

    #[test]
    fn test_display() {
        let err = SubmitError::from_status(422, "medication name required");
        assert_eq!(
            err.to_string(),
            "rejected with status 422: medication name required"
        );
    }
}
