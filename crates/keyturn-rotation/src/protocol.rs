//! Wire types for the rotation HTTP endpoints.
//!
//! Shared with the agent's HTTP control-plane client, so every shape here
//! is both `Serialize` and `Deserialize`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{AgentRole, CaType, Phase, RotationMode, RotationState};

/// SSE event name for rotation state snapshots on `/watch/:ca_type`.
pub const WATCH_EVENT: &str = "rotation_state";

/// Operator request to move one CA, or every CA, to `target_phase`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateRequest {
    /// `None` applies the transition to every CA type independently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_type: Option<CaType>,
    pub target_phase: Phase,
    #[serde(default)]
    pub mode: RotationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
    #[serde(default)]
    pub force: bool,
}

impl RotateRequest {
    pub fn new(ca_type: Option<CaType>, target_phase: Phase) -> Self {
        Self {
            ca_type,
            target_phase,
            mode: RotationMode::Manual,
            expected_version: None,
            force: false,
        }
    }
}

/// States of every CA the request touched, after the transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateResponse {
    pub states: Vec<RotationState>,
}

/// Snapshot of every CA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatesResponse {
    pub states: Vec<RotationState>,
}

/// Agent request for a fresh identity, authenticated by its current one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewRequest {
    pub certificate_pem: String,
}

/// Fresh identity plus everything the agent needs to compute its trust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewResponse {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub issuer_fingerprint: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Concatenated PEM of the trust required for the identity's role.
    pub ca_bundle: String,
    /// States the bundle was computed from, ordered by CA type.
    pub states: Vec<RotationState>,
}

/// Agent request to check that an identity is accepted, without issuing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub certificate_pem: String,
}

/// Claims of a presented identity the control plane accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub subject: String,
    pub role: AgentRole,
    pub ca_type: CaType,
    pub issuer_fingerprint: String,
    pub expires_at: DateTime<Utc>,
}
