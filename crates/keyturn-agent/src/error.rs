//! Agent error types.

use std::time::Duration;

use keyturn_common::error::ErrorCode;
use keyturn_rotation::{CaType, RotationError};

/// Failure talking to the control plane.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("{}: {message}", code.as_str())]
    Rejected { code: ErrorCode, message: String },

    #[error("invalid response: {0}")]
    Decode(String),
}

impl ControlPlaneError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => true,
            Self::Rejected { code, .. } => code.is_retryable(),
            Self::Decode(_) => false,
        }
    }
}

impl From<RotationError> for ControlPlaneError {
    fn from(e: RotationError) -> Self {
        Self::Rejected {
            code: ErrorCode::from(&e),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("renewal attempt {attempt} failed: {source}")]
    RenewalTransientFailure {
        attempt: u32,
        source: ControlPlaneError,
    },

    #[error("renewal failed after {attempts} attempts: {reason}")]
    RenewalFatalFailure { attempts: u32, reason: String },

    #[error("rotation watch for {ca_type} CA disconnected: {reason}")]
    WatchStreamDisconnected { ca_type: CaType, reason: String },

    #[error("identity generation {attempted} is not newer than {high_water}")]
    StaleGeneration { high_water: u64, attempted: u64 },

    #[error("generation {0} is not the current identity")]
    NotCurrent(u64),

    #[error("no previous identity to revert to")]
    NothingToRevert,

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("agent is shutting down")]
    ShuttingDown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&AgentError> for ErrorCode {
    fn from(e: &AgentError) -> Self {
        match e {
            AgentError::RenewalTransientFailure { source, .. } => match source {
                ControlPlaneError::Rejected { code, .. } => *code,
                _ => ErrorCode::Unavailable,
            },
            AgentError::RenewalFatalFailure { .. } | AgentError::WatchStreamDisconnected { .. } => {
                ErrorCode::Unavailable
            }
            AgentError::StaleGeneration { .. } | AgentError::NotCurrent(_) => {
                ErrorCode::VersionConflict
            }
            AgentError::NothingToRevert => ErrorCode::NotFound,
            AgentError::InvalidIdentity(_) | AgentError::InvalidConfig(_) => {
                ErrorCode::InvalidPayload
            }
            AgentError::ShuttingDown => ErrorCode::ShuttingDown,
            AgentError::Io(_) => ErrorCode::IoError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_transient() {
        assert!(ControlPlaneError::Unavailable("refused".into()).is_transient());
        assert!(ControlPlaneError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ControlPlaneError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn rejections_follow_the_wire_code() {
        let rejected: ControlPlaneError =
            RotationError::CredentialRejected("expired".into()).into();
        assert!(!rejected.is_transient());
        assert_eq!(rejected.to_string(), "credential_rejected: credential rejected: expired");

        let internal: ControlPlaneError = RotationError::Internal("lock poisoned".into()).into();
        assert!(internal.is_transient());
    }

    #[test]
    fn timeout_message_uses_millis() {
        let err = ControlPlaneError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "request timed out after 250ms");
    }
}
