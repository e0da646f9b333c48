//! Authoritative rotation state machine, one instance per CA type.
//!
//! Mutations on a CA are serialized by its mutex and fenced by the caller's
//! expected version. Every successful mutation bumps the version and
//! publishes a fresh snapshot on the CA's watch channel before the lock is
//! released, so readers never need the mutex.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::ca::{CaKeyPair, IssuedCredential};
use crate::error::RotationError;
use crate::state::{AgentRole, Audience, CaType, Certificate, Phase, RotationMode, RotationState};
use crate::trust::{self, SigningSlot};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30 * 60);
const DEFAULT_CERT_TTL: Duration = Duration::from_secs(60 * 60);

/// Control-plane configuration.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Used in CA subject names.
    pub cluster_name: String,
    /// CA types this cluster runs. Each gets its own authority.
    pub ca_types: Vec<CaType>,
    /// Minimum time between phase transitions unless forced.
    pub grace_period: Duration,
    /// Lifetime of issued identity certificates.
    pub cert_ttl: Duration,
    /// Append-only audit log. `None` disables the file.
    pub audit_log: Option<PathBuf>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            cluster_name: "keyturn".to_string(),
            ca_types: CaType::ALL.to_vec(),
            grace_period: DEFAULT_GRACE_PERIOD,
            cert_ttl: DEFAULT_CERT_TTL,
            audit_log: None,
        }
    }
}

impl RotationConfig {
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_cert_ttl(mut self, cert_ttl: Duration) -> Self {
        self.cert_ttl = cert_ttl;
        self
    }

    pub fn with_ca_types(mut self, ca_types: Vec<CaType>) -> Self {
        self.ca_types = ca_types;
        self
    }

    pub fn with_audit_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log = Some(path.into());
        self
    }
}

/// One CA: its key pairs and rotation state.
pub struct CertificateAuthority {
    pub id: Uuid,
    pub ca_type: CaType,
    active: CaKeyPair,
    standby: Option<CaKeyPair>,
    /// Most recently superseded or discarded certificate. Accepted only to
    /// authenticate renewals from agents that have not caught up.
    retired: Option<Certificate>,
    state: RotationState,
}

impl CertificateAuthority {
    fn new(ca_type: CaType, cluster: &str, grace_period: Duration) -> Result<Self, RotationError> {
        let active = CaKeyPair::generate(ca_type, cluster)?;
        let state = RotationState {
            ca_type,
            phase: Phase::Standby,
            mode: RotationMode::Manual,
            version: 1,
            started_at: None,
            last_transition_at: Utc::now(),
            grace_period,
            last_error: None,
            active: active.certificate().clone(),
            standby: None,
        };
        Ok(Self {
            id: Uuid::new_v4(),
            ca_type,
            active,
            standby: None,
            retired: None,
            state,
        })
    }

    pub fn state(&self) -> &RotationState {
        &self.state
    }

    fn begin(
        &mut self,
        mode: RotationMode,
        cluster: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RotationError> {
        if self.state.phase != Phase::Standby {
            return Err(RotationError::RotationConflict {
                ca_type: self.ca_type,
                phase: self.state.phase,
            });
        }
        let standby = CaKeyPair::generate(self.ca_type, cluster)?;
        self.state.standby = Some(standby.certificate().clone());
        self.standby = Some(standby);
        self.state.phase = Phase::Init;
        self.state.mode = mode;
        self.state.started_at = Some(now);
        self.state.last_error = None;
        Ok(())
    }

    /// Move to the next phase. `target` pins the phase the caller expects
    /// to reach so a stale unfenced request cannot skip ahead.
    fn advance(
        &mut self,
        target: Option<Phase>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<(), RotationError> {
        let from = self.state.phase;
        let Some(next) = from.next() else {
            return Err(RotationError::NotInProgress(self.ca_type));
        };
        if let Some(to) = target {
            if to != next {
                return Err(RotationError::InvalidTransition {
                    ca_type: self.ca_type,
                    from,
                    to,
                });
            }
        }
        if !force {
            let remaining = self.state.grace_remaining(now);
            if !remaining.is_zero() {
                return Err(RotationError::GracePeriodNotElapsed {
                    ca_type: self.ca_type,
                    remaining,
                });
            }
        }

        if next == Phase::Standby {
            let Some(promoted) = self.standby.take() else {
                return Err(RotationError::Internal(format!(
                    "{} CA has no standby key pair to promote",
                    self.ca_type
                )));
            };
            let demoted = std::mem::replace(&mut self.active, promoted);
            self.retired = Some(demoted.certificate().clone());
            self.state.active = self.active.certificate().clone();
            self.state.standby = None;
            self.state.started_at = None;
        }
        self.state.phase = next;
        Ok(())
    }

    fn roll_back(&mut self) -> Result<(), RotationError> {
        let from = self.state.phase;
        if from == Phase::Standby {
            return Err(RotationError::NotInProgress(self.ca_type));
        }
        if let Some(discarded) = self.standby.take() {
            self.retired = Some(discarded.certificate().clone());
        }
        self.state.phase = Phase::Standby;
        self.state.standby = None;
        self.state.started_at = None;
        self.state.last_error = Some(format!("rolled back by operator during {from}"));
        Ok(())
    }

    fn signer(&self, role: AgentRole) -> &CaKeyPair {
        match (trust::signing_slot(self.state.phase, role), &self.standby) {
            (SigningSlot::Standby, Some(standby)) => standby,
            _ => &self.active,
        }
    }
}

struct CaSlot {
    authority: Mutex<CertificateAuthority>,
    published: watch::Sender<RotationState>,
}

impl CaSlot {
    fn lock(&self) -> Result<MutexGuard<'_, CertificateAuthority>, RotationError> {
        self.authority
            .lock()
            .map_err(|_| RotationError::Internal("CA lock poisoned".into()))
    }
}

/// Outcome of a successful mutation.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: Phase,
    pub state: RotationState,
}

pub struct RotationController {
    slots: BTreeMap<CaType, CaSlot>,
    cluster_name: String,
    cert_ttl: Duration,
}

impl RotationController {
    /// Create one authority per configured CA type, each in Standby.
    pub fn new(config: &RotationConfig) -> Result<Self, RotationError> {
        if config.ca_types.is_empty() {
            return Err(RotationError::InvalidRequest(
                "at least one CA type must be configured".into(),
            ));
        }
        let mut slots = BTreeMap::new();
        for &ca_type in &config.ca_types {
            if slots.contains_key(&ca_type) {
                continue;
            }
            let authority =
                CertificateAuthority::new(ca_type, &config.cluster_name, config.grace_period)?;
            let (published, _) = watch::channel(authority.state.clone());
            tracing::info!(%ca_type, id = %authority.id, fingerprint = %authority.state.active.fingerprint, "Certificate authority created");
            slots.insert(
                ca_type,
                CaSlot {
                    authority: Mutex::new(authority),
                    published,
                },
            );
        }
        Ok(Self {
            slots,
            cluster_name: config.cluster_name.clone(),
            cert_ttl: config.cert_ttl,
        })
    }

    pub fn ca_types(&self) -> Vec<CaType> {
        self.slots.keys().copied().collect()
    }

    fn slot(&self, ca_type: CaType) -> Result<&CaSlot, RotationError> {
        self.slots
            .get(&ca_type)
            .ok_or(RotationError::UnknownCa(ca_type))
    }

    /// Run `f` under the CA lock, then bump the version and publish.
    fn mutate<F>(
        &self,
        ca_type: CaType,
        expected_version: Option<u64>,
        f: F,
    ) -> Result<Transition, RotationError>
    where
        F: FnOnce(&mut CertificateAuthority, DateTime<Utc>) -> Result<(), RotationError>,
    {
        let slot = self.slot(ca_type)?;
        let mut authority = slot.lock()?;

        if let Some(expected) = expected_version {
            let actual = authority.state.version;
            if expected != actual {
                return Err(RotationError::VersionConflict {
                    ca_type,
                    expected,
                    actual,
                });
            }
        }

        let from = authority.state.phase;
        let now = Utc::now();
        f(&mut *authority, now)?;
        authority.state.version += 1;
        authority.state.last_transition_at = now;

        let state = authority.state.clone();
        slot.published.send_replace(state.clone());
        Ok(Transition { from, state })
    }

    /// Standby to Init with a freshly generated standby key pair.
    pub fn start_rotation(
        &self,
        ca_type: CaType,
        mode: RotationMode,
    ) -> Result<RotationState, RotationError> {
        self.start_rotation_fenced(ca_type, mode, None)
    }

    pub fn start_rotation_fenced(
        &self,
        ca_type: CaType,
        mode: RotationMode,
        expected_version: Option<u64>,
    ) -> Result<RotationState, RotationError> {
        let cluster = self.cluster_name.as_str();
        let t = self.mutate(ca_type, expected_version, |ca, now| ca.begin(mode, cluster, now))?;
        tracing::info!(
            %ca_type,
            ?mode,
            version = t.state.version,
            "Rotation started"
        );
        Ok(t.state)
    }

    /// Init to UpdateClients to UpdateServers to Standby.
    pub fn advance_phase(
        &self,
        ca_type: CaType,
        expected_version: Option<u64>,
        force: bool,
    ) -> Result<Transition, RotationError> {
        self.advance_to(ca_type, None, expected_version, force)
    }

    /// Advance only if the next phase is `target`.
    pub fn advance_to(
        &self,
        ca_type: CaType,
        target: Option<Phase>,
        expected_version: Option<u64>,
        force: bool,
    ) -> Result<Transition, RotationError> {
        let t = self.mutate(ca_type, expected_version, |ca, now| {
            ca.advance(target, force, now)
        })?;
        tracing::info!(
            %ca_type,
            from = %t.from,
            to = %t.state.phase,
            version = t.state.version,
            force,
            "Rotation phase advanced"
        );
        Ok(t)
    }

    /// Any rotating phase back to Standby with the pre-rotation pair.
    /// Never grace-checked.
    pub fn rollback(
        &self,
        ca_type: CaType,
        expected_version: Option<u64>,
    ) -> Result<Transition, RotationError> {
        let t = self.mutate(ca_type, expected_version, |ca, _| ca.roll_back())?;
        tracing::warn!(
            %ca_type,
            from = %t.from,
            version = t.state.version,
            "Rotation rolled back"
        );
        Ok(t)
    }

    /// Last published snapshot. Does not take the CA lock.
    pub fn get_state(&self, ca_type: CaType) -> Result<RotationState, RotationError> {
        Ok(self.slot(ca_type)?.published.borrow().clone())
    }

    /// Snapshots of every CA, ordered by CA type.
    pub fn states(&self) -> Vec<RotationState> {
        self.slots
            .values()
            .map(|slot| slot.published.borrow().clone())
            .collect()
    }

    /// Receiver that observes every published snapshot of one CA.
    pub fn subscribe(
        &self,
        ca_type: CaType,
    ) -> Result<watch::Receiver<RotationState>, RotationError> {
        Ok(self.slot(ca_type)?.published.subscribe())
    }

    /// Certificates that may have signed a credential presented for renewal:
    /// the server-facing bundle plus the retired certificate, if any.
    pub fn renewal_anchors(&self, ca_type: CaType) -> Result<Vec<Certificate>, RotationError> {
        let authority = self.slot(ca_type)?.lock()?;
        let mut anchors =
            trust::compute_bundle(&authority.state, Audience::ServerFacing).certificates;
        if let Some(retired) = &authority.retired {
            if !anchors.iter().any(|c| c.fingerprint == retired.fingerprint) {
                anchors.push(retired.clone());
            }
        }
        Ok(anchors)
    }

    /// Issue an identity signed by the pair currently assigned to `role`.
    pub fn issue(
        &self,
        ca_type: CaType,
        subject: &str,
        role: AgentRole,
    ) -> Result<(IssuedCredential, RotationState), RotationError> {
        let authority = self.slot(ca_type)?.lock()?;
        let issued = authority
            .signer(role)
            .issue(subject, role, ca_type, self.cert_ttl)?;
        Ok((issued, authority.state.clone()))
    }

    /// Automatic-mode CAs whose grace period has run out, with the version
    /// observed so the advance can be fenced.
    pub fn due_for_advance(&self, now: DateTime<Utc>) -> Vec<(CaType, u64)> {
        self.slots
            .iter()
            .filter_map(|(ca_type, slot)| {
                let state = slot.published.borrow();
                let due = state.mode == RotationMode::Automatic
                    && state.phase.next().is_some()
                    && state.grace_remaining(now).is_zero();
                due.then_some((*ca_type, state.version))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ca::verify_credential;

    fn controller(grace: Duration) -> RotationController {
        RotationController::new(&RotationConfig::default().with_grace_period(grace)).unwrap()
    }

    #[test]
    fn new_controller_is_in_standby() {
        let c = controller(Duration::ZERO);
        assert_eq!(c.ca_types(), vec![CaType::Host, CaType::User]);
        for state in c.states() {
            assert_eq!(state.phase, Phase::Standby);
            assert_eq!(state.version, 1);
            assert!(state.standby.is_none());
        }
    }

    #[test]
    fn full_rotation_promotes_the_standby_pair() {
        let c = controller(Duration::ZERO);
        let before = c.get_state(CaType::Host).unwrap();

        let init = c.start_rotation(CaType::Host, RotationMode::Manual).unwrap();
        assert_eq!(init.phase, Phase::Init);
        assert_eq!(init.version, before.version + 1);
        let new_fp = init.standby.clone().unwrap().fingerprint;

        let mut phases = vec![init.phase];
        let mut version = init.version;
        loop {
            let t = c.advance_phase(CaType::Host, Some(version), false).unwrap();
            assert_eq!(t.state.version, version + 1);
            version = t.state.version;
            phases.push(t.state.phase);
            if t.state.phase == Phase::Standby {
                break;
            }
        }
        assert_eq!(
            phases,
            vec![
                Phase::Init,
                Phase::UpdateClients,
                Phase::UpdateServers,
                Phase::Standby
            ]
        );

        let after = c.get_state(CaType::Host).unwrap();
        assert_eq!(after.active.fingerprint, new_fp);
        assert!(after.standby.is_none());
        assert!(after.started_at.is_none());
        // other CA types are untouched
        assert_eq!(c.get_state(CaType::User).unwrap().version, 1);
    }

    #[test]
    fn start_while_rotating_conflicts() {
        let c = controller(Duration::ZERO);
        c.start_rotation(CaType::Host, RotationMode::Manual).unwrap();
        let err = c.start_rotation(CaType::Host, RotationMode::Manual).unwrap_err();
        assert!(matches!(
            err,
            RotationError::RotationConflict {
                phase: Phase::Init,
                ..
            }
        ));
    }

    #[test]
    fn stale_version_is_fenced() {
        let c = controller(Duration::ZERO);
        let init = c.start_rotation(CaType::Host, RotationMode::Manual).unwrap();
        let err = c
            .advance_phase(CaType::Host, Some(init.version - 1), false)
            .unwrap_err();
        assert!(matches!(
            err,
            RotationError::VersionConflict { expected, actual, .. }
                if expected == init.version - 1 && actual == init.version
        ));
        assert_eq!(c.get_state(CaType::Host).unwrap(), init);
    }

    #[test]
    fn grace_period_blocks_unforced_advance() {
        let c = controller(Duration::from_secs(3600));
        let init = c.start_rotation(CaType::User, RotationMode::Manual).unwrap();

        let err = c.advance_phase(CaType::User, Some(init.version), false).unwrap_err();
        assert!(matches!(err, RotationError::GracePeriodNotElapsed { .. }));

        let t = c.advance_phase(CaType::User, Some(init.version), true).unwrap();
        assert_eq!(t.state.phase, Phase::UpdateClients);
    }

    #[test]
    fn advancing_from_standby_is_not_in_progress() {
        let c = controller(Duration::ZERO);
        assert!(matches!(
            c.advance_phase(CaType::Host, None, true),
            Err(RotationError::NotInProgress(CaType::Host))
        ));
        assert!(matches!(
            c.rollback(CaType::Host, None),
            Err(RotationError::NotInProgress(CaType::Host))
        ));
    }

    #[test]
    fn advance_to_rejects_skipping_a_phase() {
        let c = controller(Duration::ZERO);
        c.start_rotation(CaType::Host, RotationMode::Manual).unwrap();
        let err = c
            .advance_to(CaType::Host, Some(Phase::UpdateServers), None, false)
            .unwrap_err();
        assert!(matches!(
            err,
            RotationError::InvalidTransition {
                from: Phase::Init,
                to: Phase::UpdateServers,
                ..
            }
        ));
    }

    #[test]
    fn rollback_restores_the_pre_rotation_pair() {
        let c = RotationController::new(
            &RotationConfig::default().with_grace_period(Duration::from_secs(3600)),
        )
        .unwrap();
        let before = c.get_state(CaType::Host).unwrap();
        let init = c.start_rotation(CaType::Host, RotationMode::Manual).unwrap();
        let t = c.advance_phase(CaType::Host, Some(init.version), true).unwrap();
        assert_eq!(t.state.phase, Phase::UpdateClients);

        // rollback ignores the grace period
        let t = c.rollback(CaType::Host, Some(t.state.version)).unwrap();
        assert_eq!(t.from, Phase::UpdateClients);
        assert_eq!(t.state.phase, Phase::Standby);
        assert_eq!(t.state.active, before.active);
        assert!(t.state.standby.is_none());
        assert!(t.state.last_error.as_deref().unwrap().contains("update_clients"));

        let bundle = trust::compute_bundle(&t.state, Audience::ClientFacing);
        assert_eq!(
            bundle,
            trust::compute_bundle(&before, Audience::ClientFacing)
        );

        // a new rotation clears the error
        let again = c.start_rotation(CaType::Host, RotationMode::Manual).unwrap();
        assert!(again.last_error.is_none());
    }

    #[test]
    fn issue_uses_the_role_signing_slot() {
        let c = controller(Duration::ZERO);
        let init = c.start_rotation(CaType::Host, RotationMode::Manual).unwrap();
        let old_fp = init.active.fingerprint.clone();
        let new_fp = init.standby.clone().unwrap().fingerprint;

        let (client, _) = c.issue(CaType::Host, "c1", AgentRole::Client).unwrap();
        assert_eq!(client.issuer_fingerprint, old_fp);

        c.advance_phase(CaType::Host, None, false).unwrap();
        let (client, _) = c.issue(CaType::Host, "c1", AgentRole::Client).unwrap();
        let (server, _) = c.issue(CaType::Host, "s1", AgentRole::Server).unwrap();
        assert_eq!(client.issuer_fingerprint, new_fp);
        assert_eq!(server.issuer_fingerprint, old_fp);

        c.advance_phase(CaType::Host, None, false).unwrap();
        let (server, _) = c.issue(CaType::Host, "s1", AgentRole::Server).unwrap();
        assert_eq!(server.issuer_fingerprint, new_fp);
    }

    #[test]
    fn retired_pair_still_authenticates_renewals() {
        let c = controller(Duration::ZERO);
        let (old_cred, _) = c.issue(CaType::Host, "s1", AgentRole::Server).unwrap();

        c.start_rotation(CaType::Host, RotationMode::Manual).unwrap();
        for _ in 0..3 {
            c.advance_phase(CaType::Host, None, false).unwrap();
        }

        let anchors = c.renewal_anchors(CaType::Host).unwrap();
        assert_eq!(anchors.len(), 2);
        let verified = verify_credential(&old_cred.certificate_pem, &anchors, Utc::now()).unwrap();
        assert_eq!(verified.issuer_fingerprint, old_cred.issuer_fingerprint);
    }

    #[test]
    fn subscribers_see_every_transition() {
        let c = controller(Duration::ZERO);
        let mut rx = c.subscribe(CaType::User).unwrap();
        assert_eq!(rx.borrow_and_update().version, 1);

        c.start_rotation(CaType::User, RotationMode::Manual).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().phase, Phase::Init);
    }

    #[test]
    fn automatic_mode_is_due_after_grace() {
        let c = controller(Duration::ZERO);
        c.start_rotation(CaType::Host, RotationMode::Automatic).unwrap();
        c.start_rotation(CaType::User, RotationMode::Manual).unwrap();

        let due = c.due_for_advance(Utc::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, CaType::Host);
        assert_eq!(due[0].1, c.get_state(CaType::Host).unwrap().version);
    }

    #[test]
    fn unknown_ca_is_not_found() {
        let c = RotationController::new(
            &RotationConfig::default().with_ca_types(vec![CaType::Host]),
        )
        .unwrap();
        assert!(matches!(
            c.get_state(CaType::User),
            Err(RotationError::UnknownCa(CaType::User))
        ));
    }

    #[test]
    fn concurrent_starts_have_one_winner() {
        let c = Arc::new(controller(Duration::ZERO));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || c.start_rotation(CaType::Host, RotationMode::Manual))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, RotationError::RotationConflict { .. })));
    }

    #[test]
    fn concurrent_advances_with_one_version_have_one_winner() {
        let c = Arc::new(controller(Duration::ZERO));
        let version = c
            .start_rotation(CaType::Host, RotationMode::Manual)
            .unwrap()
            .version;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || c.advance_phase(CaType::Host, Some(version), false))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, RotationError::VersionConflict { .. })));
        assert_eq!(c.get_state(CaType::Host).unwrap().phase, Phase::UpdateClients);
    }
}
