//! Control-plane error types.

use std::time::Duration;

use keyturn_common::error::ErrorCode;

use crate::state::{CaType, Phase};

#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error("no certificate authority of type {0} in this cluster")]
    UnknownCa(CaType),

    #[error("{ca_type} CA is already rotating (phase {phase})")]
    RotationConflict { ca_type: CaType, phase: Phase },

    #[error("{ca_type} CA state is at version {actual}, request expected {expected}")]
    VersionConflict {
        ca_type: CaType,
        expected: u64,
        actual: u64,
    },

    #[error("{ca_type} CA grace period has not elapsed, {}s remaining", remaining.as_secs())]
    GracePeriodNotElapsed { ca_type: CaType, remaining: Duration },

    #[error("{0} CA is not rotating")]
    NotInProgress(CaType),

    #[error("cannot move {ca_type} CA from {from} to {to}")]
    InvalidTransition {
        ca_type: CaType,
        from: Phase,
        to: Phase,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("credential rejected: {0}")]
    CredentialRejected(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl From<rcgen::Error> for RotationError {
    fn from(e: rcgen::Error) -> Self {
        Self::Certificate(e.to_string())
    }
}

impl From<&RotationError> for ErrorCode {
    fn from(e: &RotationError) -> Self {
        match e {
            RotationError::UnknownCa(_) => ErrorCode::NotFound,
            RotationError::RotationConflict { .. } => ErrorCode::RotationConflict,
            RotationError::VersionConflict { .. } => ErrorCode::VersionConflict,
            RotationError::GracePeriodNotElapsed { .. } => ErrorCode::GracePeriodNotElapsed,
            RotationError::NotInProgress(_) => ErrorCode::NotInProgress,
            RotationError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            RotationError::InvalidRequest(_) => ErrorCode::InvalidPayload,
            RotationError::CredentialRejected(_) => ErrorCode::CredentialRejected,
            RotationError::Io(_) => ErrorCode::IoError,
            RotationError::Certificate(_) | RotationError::Internal(_) => ErrorCode::Internal,
        }
    }
}
