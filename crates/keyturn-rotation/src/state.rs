//! Rotation state model shared by the control plane and its agents.
//!
//! A [`RotationState`] carries only public material, so it can be streamed
//! to agents and fed to [`crate::trust`] on either side of the wire.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RotationError;

/// Class of identities a CA issues. Each type rotates independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaType {
    Host,
    User,
}

impl CaType {
    pub const ALL: [CaType; 2] = [CaType::Host, CaType::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::User => "user",
        }
    }
}

impl fmt::Display for CaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "user" => Ok(Self::User),
            other => Err(format!("unknown CA type '{other}' (expected host or user)")),
        }
    }
}

/// Stage of a CA rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Standby,
    Init,
    UpdateClients,
    UpdateServers,
    Rollback,
}

impl Phase {
    /// The phase `AdvancePhase` moves to, or `None` when not rotating.
    pub fn next(self) -> Option<Phase> {
        match self {
            Self::Init => Some(Self::UpdateClients),
            Self::UpdateClients => Some(Self::UpdateServers),
            Self::UpdateServers => Some(Self::Standby),
            Self::Standby | Self::Rollback => None,
        }
    }

    pub fn is_rotating(self) -> bool {
        !matches!(self, Self::Standby)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standby => "standby",
            Self::Init => "init",
            Self::UpdateClients => "update_clients",
            Self::UpdateServers => "update_servers",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "standby" => Ok(Self::Standby),
            "init" => Ok(Self::Init),
            "update_clients" => Ok(Self::UpdateClients),
            "update_servers" => Ok(Self::UpdateServers),
            "rollback" => Ok(Self::Rollback),
            other => Err(format!("unknown rotation phase '{other}'")),
        }
    }
}

/// Whether phases advance on operator command or on grace-period expiry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    #[default]
    Manual,
    Automatic,
}

impl RotationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
        }
    }
}

impl FromStr for RotationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "auto" | "automatic" => Ok(Self::Automatic),
            other => Err(format!("unknown rotation mode '{other}'")),
        }
    }
}

/// Which side of a connection a trust bundle is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    /// Held by clients to verify the servers they dial.
    ClientFacing,
    /// Held by servers to verify the clients that dial them.
    ServerFacing,
}

/// Role an identity plays on its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Client,
    Server,
}

impl AgentRole {
    /// The bundle an identity with this role must hold.
    pub fn audience(self) -> Audience {
        match self {
            Self::Client => Audience::ClientFacing,
            Self::Server => Audience::ServerFacing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "server" => Ok(Self::Server),
            other => Err(format!("unknown role '{other}' (expected client or server)")),
        }
    }
}

/// A PEM certificate with its SHA-256 fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Certificate {
    pub pem: String,
    pub fingerprint: String,
}

impl Certificate {
    pub fn from_pem(pem: impl Into<String>) -> Result<Self, RotationError> {
        let pem = pem.into();
        let der = pem_to_der(&pem)?;
        Ok(Self {
            fingerprint: fingerprint_sha256(&der),
            pem,
        })
    }

    pub fn der(&self) -> Result<Vec<u8>, RotationError> {
        pem_to_der(&self.pem)
    }
}

/// Decode the first PEM block in `pem`.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>, RotationError> {
    let parsed =
        pem::parse(pem).map_err(|e| RotationError::Certificate(format!("invalid PEM: {e}")))?;
    Ok(parsed.contents().to_vec())
}

/// Lowercase hex SHA-256 of a DER blob.
pub fn fingerprint_sha256(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Authoritative rotation state of one CA, as published to agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationState {
    pub ca_type: CaType,
    pub phase: Phase,
    pub mode: RotationMode,
    /// Incremented on every transition; the fencing token for mutations.
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    #[serde(rename = "grace_period_ms", with = "duration_millis")]
    pub grace_period: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Certificate of the pre-rotation (currently active) key pair.
    pub active: Certificate,
    /// Certificate of the key pair being rotated in, while rotating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standby: Option<Certificate>,
}

impl RotationState {
    /// Time left before the phase may be advanced without forcing.
    pub fn grace_remaining(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = now
            .signed_duration_since(self.last_transition_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.grace_period.saturating_sub(elapsed)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_sequence_ends_in_standby() {
        let mut phase = Phase::Init;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            seen.push(next);
            phase = next;
        }
        assert_eq!(
            seen,
            vec![
                Phase::Init,
                Phase::UpdateClients,
                Phase::UpdateServers,
                Phase::Standby
            ]
        );
        assert_eq!(Phase::Standby.next(), None);
        assert_eq!(Phase::Rollback.next(), None);
    }

    #[test]
    fn phase_parses_cli_spellings() {
        assert_eq!("update-clients".parse::<Phase>(), Ok(Phase::UpdateClients));
        assert_eq!("UPDATE_SERVERS".parse::<Phase>(), Ok(Phase::UpdateServers));
        assert!("finished".parse::<Phase>().is_err());
    }

    #[test]
    fn ca_type_round_trips_through_display() {
        for ca in CaType::ALL {
            assert_eq!(ca.to_string().parse::<CaType>(), Ok(ca));
        }
    }

    #[test]
    fn roles_map_to_their_audience() {
        assert_eq!(AgentRole::Client.audience(), Audience::ClientFacing);
        assert_eq!(AgentRole::Server.audience(), Audience::ServerFacing);
    }

    #[test]
    fn fingerprint_is_64_hex_chars() {
        let fp = fingerprint_sha256(b"certificate bytes");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn grace_period_serializes_as_millis() {
        let state = RotationState {
            ca_type: CaType::Host,
            phase: Phase::Init,
            mode: RotationMode::Manual,
            version: 3,
            started_at: None,
            last_transition_at: Utc::now(),
            grace_period: Duration::from_millis(1500),
            last_error: None,
            active: Certificate {
                pem: "pem".into(),
                fingerprint: "fp".into(),
            },
            standby: None,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["grace_period_ms"], 1500);
        assert_eq!(json["phase"], "init");
        assert!(json.get("standby").is_none());

        let back: RotationState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn grace_remaining_counts_down_to_zero() {
        let now = Utc::now();
        let mut state = RotationState {
            ca_type: CaType::User,
            phase: Phase::Init,
            mode: RotationMode::Manual,
            version: 1,
            started_at: Some(now),
            last_transition_at: now - chrono::Duration::seconds(10),
            grace_period: Duration::from_secs(30),
            last_error: None,
            active: Certificate {
                pem: String::new(),
                fingerprint: String::new(),
            },
            standby: None,
        };
        let remaining = state.grace_remaining(now);
        assert!(remaining <= Duration::from_secs(20) && remaining >= Duration::from_secs(19));

        state.last_transition_at = now - chrono::Duration::seconds(60);
        assert_eq!(state.grace_remaining(now), Duration::ZERO);
    }
}
