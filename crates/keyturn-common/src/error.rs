use serde::{Deserialize, Serialize};

/// Machine-readable error codes for the wire protocol.
/// Shared by the control plane routes and the agent-side HTTP client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidPayload,
    NotFound,
    RotationConflict,
    VersionConflict,
    GracePeriodNotElapsed,
    NotInProgress,
    InvalidTransition,
    CredentialRejected,
    Unavailable,
    IoError,
    ShuttingDown,
    Internal,
}

impl ErrorCode {
    /// Suggested HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidPayload | Self::InvalidTransition => 400,
            Self::CredentialRejected => 403,
            Self::NotFound => 404,
            Self::RotationConflict | Self::VersionConflict | Self::NotInProgress => 409,
            Self::GracePeriodNotElapsed => 425,
            Self::Unavailable | Self::ShuttingDown => 503,
            Self::IoError | Self::Internal => 500,
        }
    }

    /// Whether a client may retry the same request later without changing it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::ShuttingDown | Self::IoError | Self::Internal
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::NotFound => "not_found",
            Self::RotationConflict => "rotation_conflict",
            Self::VersionConflict => "version_conflict",
            Self::GracePeriodNotElapsed => "grace_period_not_elapsed",
            Self::NotInProgress => "not_in_progress",
            Self::InvalidTransition => "invalid_transition",
            Self::CredentialRejected => "credential_rejected",
            Self::Unavailable => "unavailable",
            Self::IoError => "io_error",
            Self::ShuttingDown => "shutting_down",
            Self::Internal => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ErrorCode; 12] = [
        ErrorCode::InvalidPayload,
        ErrorCode::NotFound,
        ErrorCode::RotationConflict,
        ErrorCode::VersionConflict,
        ErrorCode::GracePeriodNotElapsed,
        ErrorCode::NotInProgress,
        ErrorCode::InvalidTransition,
        ErrorCode::CredentialRejected,
        ErrorCode::Unavailable,
        ErrorCode::IoError,
        ErrorCode::ShuttingDown,
        ErrorCode::Internal,
    ];

    #[test]
    fn serialized_form_matches_as_str() {
        for code in ALL {
            let value = serde_json::to_value(code).unwrap();
            assert_eq!(value, code.as_str(), "{code:?}");
            let back: ErrorCode = serde_json::from_value(value).unwrap();
            assert_eq!(back, code);
        }
    }

    #[test]
    fn conflicts_map_to_409() {
        assert_eq!(ErrorCode::RotationConflict.http_status(), 409);
        assert_eq!(ErrorCode::VersionConflict.http_status(), 409);
        assert_eq!(ErrorCode::NotInProgress.http_status(), 409);
    }

    #[test]
    fn only_server_side_faults_are_retryable() {
        assert!(ErrorCode::Unavailable.is_retryable());
        assert!(ErrorCode::Internal.is_retryable());
        assert!(!ErrorCode::CredentialRejected.is_retryable());
        assert!(!ErrorCode::VersionConflict.is_retryable());
        assert!(!ErrorCode::InvalidPayload.is_retryable());
    }
}
