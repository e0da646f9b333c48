//! Agent identity and the store every outbound connection reads from.
//!
//! The store is single-writer (the renewal loop), many-reader. Readers get
//! an `Arc<Identity>` snapshot; a swap publishes a whole new snapshot, so a
//! reader never observes a partially replaced identity.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use keyturn_rotation::protocol::RenewResponse;
use keyturn_rotation::{AgentRole, CaType, Certificate};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use zeroize::Zeroize;

use crate::error::AgentError;

/// A credential held by an agent plus the anchors it trusts.
#[derive(Clone, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    pub role: AgentRole,
    /// CA type that issued this identity.
    pub ca_type: CaType,
    pub certificate_pem: String,
    pub private_key_pem: String,
    /// Trusted CA certificates, ordered by CA type then active-before-standby.
    pub trusted_cas: Vec<Certificate>,
    /// Fingerprint of the CA certificate that signed `certificate_pem`.
    pub issuer_fingerprint: String,
    /// Strictly increases across renewals.
    pub generation: u64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Identity {
    /// Build an identity from a renewal response. Trust comes from the
    /// states in the response, not from the PEM bundle text.
    pub fn from_renewal(
        subject: &str,
        role: AgentRole,
        ca_type: CaType,
        trusted_cas: Vec<Certificate>,
        generation: u64,
        response: RenewResponse,
    ) -> Self {
        Self {
            subject: subject.to_string(),
            role,
            ca_type,
            certificate_pem: response.certificate_pem,
            private_key_pem: response.private_key_pem,
            trusted_cas,
            issuer_fingerprint: response.issuer_fingerprint,
            generation,
            issued_at: response.issued_at,
            expires_at: response.expires_at,
        }
    }

    /// Number of CA certificates this identity trusts.
    pub fn trusted_anchor_count(&self) -> usize {
        self.trusted_cas.len()
    }

    pub fn trusted_fingerprints(&self) -> Vec<&str> {
        self.trusted_cas
            .iter()
            .map(|c| c.fingerprint.as_str())
            .collect()
    }

    /// Point in the certificate lifetime at which renewal becomes due.
    pub fn renew_at(&self, fraction: f64) -> DateTime<Utc> {
        let lifetime = (self.expires_at - self.issued_at).num_milliseconds().max(0) as f64;
        let offset = chrono::Duration::milliseconds((lifetime * fraction) as i64);
        self.issued_at + offset
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("subject", &self.subject)
            .field("role", &self.role)
            .field("ca_type", &self.ca_type)
            .field("generation", &self.generation)
            .field("issuer_fingerprint", &self.issuer_fingerprint)
            .field("trusted_cas", &self.trusted_fingerprints())
            .field("expires_at", &self.expires_at)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        self.private_key_pem.zeroize();
    }
}

/// What readers see: the current identity and, until it is confirmed or
/// superseded, the one it replaced.
#[derive(Debug, Clone)]
pub struct IdentitySnapshot {
    pub current: Arc<Identity>,
    pub previous: Option<Arc<Identity>>,
    /// Generation of the last confirmed identity.
    pub confirmed: u64,
    /// Highest generation ever published, including reverted ones.
    pub high_water: u64,
}

/// Atomic holder of an agent's identity.
pub struct IdentityStore {
    tx: watch::Sender<IdentitySnapshot>,
}

impl IdentityStore {
    /// Start with `initial` as the current, confirmed identity.
    pub fn new(initial: Identity) -> Self {
        let generation = initial.generation;
        let (tx, _) = watch::channel(IdentitySnapshot {
            current: Arc::new(initial),
            previous: None,
            confirmed: generation,
            high_water: generation,
        });
        Self { tx }
    }

    pub fn get(&self) -> Arc<Identity> {
        Arc::clone(&self.tx.borrow().current)
    }

    pub fn previous(&self) -> Option<Arc<Identity>> {
        self.tx.borrow().previous.clone()
    }

    pub fn snapshot(&self) -> IdentitySnapshot {
        self.tx.borrow().clone()
    }

    /// Generation to use for the next identity.
    pub fn next_generation(&self) -> u64 {
        self.tx.borrow().high_water + 1
    }

    /// Publish `next` as current; the replaced identity becomes previous.
    /// `next` must be newer than every identity the store has held.
    pub fn swap(&self, next: Identity) -> Result<Arc<Identity>, AgentError> {
        let next = Arc::new(next);
        let mut outcome = Err(AgentError::ShuttingDown);
        self.tx.send_if_modified(|snap| {
            if next.generation <= snap.high_water {
                outcome = Err(AgentError::StaleGeneration {
                    high_water: snap.high_water,
                    attempted: next.generation,
                });
                return false;
            }
            snap.high_water = next.generation;
            let replaced = std::mem::replace(&mut snap.current, Arc::clone(&next));
            snap.previous = Some(Arc::clone(&replaced));
            outcome = Ok(replaced);
            true
        });
        outcome
    }

    /// Accept the current identity and release the previous one.
    pub fn confirm(&self, generation: u64) -> Result<(), AgentError> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|snap| {
            if snap.current.generation != generation {
                outcome = Err(AgentError::NotCurrent(generation));
                return false;
            }
            snap.previous = None;
            snap.confirmed = generation;
            true
        });
        outcome
    }

    /// Put the previous identity back after the swap to `generation` failed.
    /// The reverted identity's generation stays burned.
    pub fn revert(&self, generation: u64) -> Result<Arc<Identity>, AgentError> {
        let mut outcome = Err(AgentError::NothingToRevert);
        self.tx.send_if_modified(|snap| {
            if snap.current.generation != generation {
                outcome = Err(AgentError::NotCurrent(generation));
                return false;
            }
            let Some(previous) = snap.previous.take() else {
                return false;
            };
            outcome = Ok(std::mem::replace(&mut snap.current, previous));
            true
        });
        outcome
    }

    /// Receiver notified on every swap, confirm and revert.
    pub fn subscribe(&self) -> watch::Receiver<IdentitySnapshot> {
        self.tx.subscribe()
    }
}
