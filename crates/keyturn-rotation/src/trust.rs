//! Trust bundle computation.
//!
//! Everything here is a pure function of published [`RotationState`]s, so
//! the control plane and every agent derive identical bundles.

use serde::{Deserialize, Serialize};

use crate::state::{AgentRole, Audience, CaType, Certificate, Phase, RotationState};

/// Certificates an audience must trust for one CA type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustBundle {
    pub audience: Audience,
    pub ca_type: CaType,
    /// Active certificate first, then the standby certificate if trusted.
    pub certificates: Vec<Certificate>,
}

impl TrustBundle {
    pub fn fingerprints(&self) -> Vec<&str> {
        self.certificates
            .iter()
            .map(|c| c.fingerprint.as_str())
            .collect()
    }

    /// Concatenated PEM blocks, in bundle order.
    pub fn to_pem(&self) -> String {
        concat_pem(&self.certificates)
    }
}

/// Which CA key pair signs identities for a role in a given phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningSlot {
    Active,
    Standby,
}

/// Compute the bundle `audience` must trust while the CA is in `state`.
///
/// | phase                          | trusted          |
/// |--------------------------------|------------------|
/// | standby, init, rollback        | active only      |
/// | update_clients, update_servers | active + standby |
///
/// Both audiences trust the same set in every phase; the audience only
/// labels the result.
pub fn compute_bundle(state: &RotationState, audience: Audience) -> TrustBundle {
    let mut certificates = vec![state.active.clone()];
    if matches!(state.phase, Phase::UpdateClients | Phase::UpdateServers) {
        if let Some(standby) = &state.standby {
            certificates.push(standby.clone());
        }
    }
    TrustBundle {
        audience,
        ca_type: state.ca_type,
        certificates,
    }
}

/// Key pair that signs new identities for `role` in `phase`.
///
/// Clients move to the new pair at UpdateClients and servers at
/// UpdateServers. Outside a rotation the active pair always signs.
pub fn signing_slot(phase: Phase, role: AgentRole) -> SigningSlot {
    match (phase, role) {
        (Phase::UpdateClients, AgentRole::Client) | (Phase::UpdateServers, _) => {
            SigningSlot::Standby
        }
        _ => SigningSlot::Active,
    }
}

/// Certificate that should have signed an identity with `role` right now.
pub fn signing_certificate(state: &RotationState, role: AgentRole) -> &Certificate {
    match (signing_slot(state.phase, role), &state.standby) {
        (SigningSlot::Standby, Some(standby)) => standby,
        _ => &state.active,
    }
}

/// Union of the bundles for every state in `states`, ordered by CA type and
/// then bundle order, without duplicate fingerprints.
pub fn required_trust<'a>(
    states: impl IntoIterator<Item = &'a RotationState>,
    audience: Audience,
) -> Vec<Certificate> {
    let mut sorted: Vec<&RotationState> = states.into_iter().collect();
    sorted.sort_by_key(|s| s.ca_type);

    let mut out: Vec<Certificate> = Vec::new();
    for state in sorted {
        for cert in compute_bundle(state, audience).certificates {
            if !out.iter().any(|c| c.fingerprint == cert.fingerprint) {
                out.push(cert);
            }
        }
    }
    out
}

/// Concatenate PEM blocks, each ending in a newline.
pub fn concat_pem(certificates: &[Certificate]) -> String {
    let mut out = String::new();
    for cert in certificates {
        out.push_str(cert.pem.trim_end());
        out.push('\n');
    }
    out
}
