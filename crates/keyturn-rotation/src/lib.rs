//! keyturn rotation control plane.
//!
//! Owns one certificate authority per CA type, drives each through the
//! rotation phases, issues identities from the key pair assigned to the
//! requester's role and publishes every state change to watchers.

pub mod audit;
pub mod ca;
pub mod controller;
pub mod error;
pub mod http;
pub mod protocol;
pub mod state;
pub mod trust;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use controller::{RotationConfig, RotationController, Transition};
pub use error::RotationError;
pub use state::{AgentRole, Audience, CaType, Certificate, Phase, RotationMode, RotationState};

use audit::AuditLog;
use ca::IssuedCredential;
use protocol::{RenewResponse, RotateRequest, VerifyResponse};

struct CoreInner {
    controller: RotationController,
    config: RotationConfig,
    audit: AuditLog,
    shutdown: CancellationToken,
}

/// Domain facade for the control plane.
///
/// Cheap to clone; every clone shares the same authorities. The binary
/// mounts [`RotationCore::routes`] and agents in the same process talk to
/// it directly.
#[derive(Clone)]
pub struct RotationCore {
    inner: Arc<CoreInner>,
}

impl RotationCore {
    /// Create the authorities described by `config`, all in Standby.
    pub fn new(config: RotationConfig) -> Result<Self, RotationError> {
        let controller = RotationController::new(&config)?;
        let audit = AuditLog::new(config.audit_log.clone());
        Ok(Self {
            inner: Arc::new(CoreInner {
                controller,
                config,
                audit,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &RotationConfig {
        &self.inner.config
    }

    pub fn controller(&self) -> &RotationController {
        &self.inner.controller
    }

    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    // ── Rotation ────────────────────────────────────────────────────

    pub fn start_rotation(
        &self,
        ca_type: CaType,
        mode: RotationMode,
    ) -> Result<RotationState, RotationError> {
        self.start_rotation_fenced(ca_type, mode, None)
    }

    fn start_rotation_fenced(
        &self,
        ca_type: CaType,
        mode: RotationMode,
        expected_version: Option<u64>,
    ) -> Result<RotationState, RotationError> {
        let state = self
            .inner
            .controller
            .start_rotation_fenced(ca_type, mode, expected_version)?;
        self.inner.audit.record(
            "rotation_started",
            &[
                ("ca_type", ca_type.as_str()),
                ("mode", mode.as_str()),
                ("version", &state.version.to_string()),
            ],
        );
        Ok(state)
    }

    pub fn advance_phase(
        &self,
        ca_type: CaType,
        expected_version: Option<u64>,
        force: bool,
    ) -> Result<RotationState, RotationError> {
        self.advance_to(ca_type, None, expected_version, force)
    }

    fn advance_to(
        &self,
        ca_type: CaType,
        target: Option<Phase>,
        expected_version: Option<u64>,
        force: bool,
    ) -> Result<RotationState, RotationError> {
        let t = self
            .inner
            .controller
            .advance_to(ca_type, target, expected_version, force)?;
        self.inner.audit.record(
            "phase_advanced",
            &[
                ("ca_type", ca_type.as_str()),
                ("from", t.from.as_str()),
                ("to", t.state.phase.as_str()),
                ("version", &t.state.version.to_string()),
                ("forced", if force { "true" } else { "false" }),
            ],
        );
        Ok(t.state)
    }

    pub fn rollback(
        &self,
        ca_type: CaType,
        expected_version: Option<u64>,
    ) -> Result<RotationState, RotationError> {
        let t = self.inner.controller.rollback(ca_type, expected_version)?;
        self.inner.audit.record(
            "rotation_rolled_back",
            &[
                ("ca_type", ca_type.as_str()),
                ("from", t.from.as_str()),
                ("version", &t.state.version.to_string()),
            ],
        );
        Ok(t.state)
    }

    /// Apply an operator request to one CA or, with no `ca_type`, to every
    /// CA in type order. Multi-CA requests stop at the first failure; CAs
    /// already transitioned stay transitioned. A multi-CA rollback skips
    /// CAs that are not rotating and fails only if none was.
    pub fn rotate(&self, request: &RotateRequest) -> Result<Vec<RotationState>, RotationError> {
        let targets = match request.ca_type {
            Some(ca_type) => vec![ca_type],
            None if request.expected_version.is_some() => {
                return Err(RotationError::InvalidRequest(
                    "expected_version requires a ca_type".into(),
                ));
            }
            None => self.inner.controller.ca_types(),
        };

        let every_ca = request.ca_type.is_none();
        let mut states = Vec::with_capacity(targets.len());
        let mut not_rotating = None;
        let mut skipped = 0;
        for ca_type in targets {
            let expected = request.expected_version;
            let state = match request.target_phase {
                Phase::Init => self.start_rotation_fenced(ca_type, request.mode, expected)?,
                Phase::Rollback => match self.rollback(ca_type, expected) {
                    Err(e @ RotationError::NotInProgress(_)) if every_ca => {
                        tracing::debug!(%ca_type, "Not rotating; nothing to roll back");
                        not_rotating.get_or_insert(e);
                        skipped += 1;
                        self.get_state(ca_type)?
                    }
                    other => other?,
                },
                target => self.advance_to(ca_type, Some(target), expected, request.force)?,
            };
            states.push(state);
        }
        match not_rotating {
            Some(e) if skipped == states.len() => Err(e),
            _ => Ok(states),
        }
    }

    pub fn get_state(&self, ca_type: CaType) -> Result<RotationState, RotationError> {
        self.inner.controller.get_state(ca_type)
    }

    pub fn states(&self) -> Vec<RotationState> {
        self.inner.controller.states()
    }

    pub fn subscribe(
        &self,
        ca_type: CaType,
    ) -> Result<watch::Receiver<RotationState>, RotationError> {
        self.inner.controller.subscribe(ca_type)
    }

    // ── Issuance ────────────────────────────────────────────────────

    /// Verify a presented identity and issue its replacement.
    ///
    /// The presented certificate must be within its validity window and
    /// signed by a certificate the CA's server-facing bundle trusts, or by
    /// the most recently retired pair.
    pub fn renew_credentials(&self, certificate_pem: &str) -> Result<RenewResponse, RotationError> {
        let verified = match self.verify_presented(certificate_pem) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Renewal rejected");
                self.inner
                    .audit
                    .record("credentials_rejected", &[("reason", &e.to_string())]);
                return Err(e);
            }
        };

        let (issued, own_state) =
            self.inner
                .controller
                .issue(verified.ca_type, &verified.subject, verified.role)?;
        self.record_issued(&verified.subject, verified.role, verified.ca_type, &issued, false);
        Ok(self.renew_response(issued, own_state, verified.role))
    }

    /// Check that a presented identity would be accepted for renewal,
    /// without issuing anything. Agents use it to confirm a new identity.
    pub fn verify_credentials(&self, certificate_pem: &str) -> Result<VerifyResponse, RotationError> {
        let verified = self.verify_presented(certificate_pem).map_err(|e| {
            tracing::debug!(error = %e, "Verification rejected");
            e
        })?;
        Ok(VerifyResponse {
            subject: verified.subject,
            role: verified.role,
            ca_type: verified.ca_type,
            issuer_fingerprint: verified.issuer_fingerprint,
            expires_at: verified.expires_at,
        })
    }

    fn verify_presented(
        &self,
        certificate_pem: &str,
    ) -> Result<ca::VerifiedCredential, RotationError> {
        let claims = ca::inspect(certificate_pem).map_err(|e| match e {
            RotationError::Certificate(msg) => RotationError::CredentialRejected(msg),
            other => other,
        })?;
        let anchors = self.inner.controller.renewal_anchors(claims.ca_type)?;
        ca::verify_credential(certificate_pem, &anchors, Utc::now())
    }

    /// Issue an identity without presenting one. In-process only; the
    /// binary uses it to seed an agent's first identity bundle.
    pub fn issue_bootstrap_credentials(
        &self,
        subject: &str,
        role: AgentRole,
        ca_type: CaType,
    ) -> Result<RenewResponse, RotationError> {
        let (issued, own_state) = self.inner.controller.issue(ca_type, subject, role)?;
        self.record_issued(subject, role, ca_type, &issued, true);
        Ok(self.renew_response(issued, own_state, role))
    }

    fn record_issued(
        &self,
        subject: &str,
        role: AgentRole,
        ca_type: CaType,
        issued: &IssuedCredential,
        bootstrap: bool,
    ) {
        tracing::info!(
            subject,
            %role,
            %ca_type,
            issuer = %issued.issuer_fingerprint,
            expires_at = %issued.expires_at,
            bootstrap,
            "Credentials issued"
        );
        self.inner.audit.record(
            "credentials_issued",
            &[
                ("subject", subject),
                ("role", role.as_str()),
                ("ca_type", ca_type.as_str()),
                ("issuer", &issued.issuer_fingerprint),
                ("expires_at", &issued.expires_at.to_rfc3339()),
                ("bootstrap", if bootstrap { "true" } else { "false" }),
            ],
        );
    }

    /// Pair an issued credential with the trust its role requires. The
    /// issuing CA's entry is the snapshot taken under its lock.
    fn renew_response(
        &self,
        issued: IssuedCredential,
        own_state: RotationState,
        role: AgentRole,
    ) -> RenewResponse {
        let states: Vec<RotationState> = self
            .states()
            .into_iter()
            .map(|s| {
                if s.ca_type == own_state.ca_type {
                    own_state.clone()
                } else {
                    s
                }
            })
            .collect();
        let trusted = trust::required_trust(&states, role.audience());
        RenewResponse {
            certificate_pem: issued.certificate_pem,
            private_key_pem: issued.private_key_pem,
            issuer_fingerprint: issued.issuer_fingerprint,
            issued_at: issued.issued_at,
            expires_at: issued.expires_at,
            ca_bundle: trust::concat_pem(&trusted),
            states,
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Axum router for the rotation endpoints. The binary mounts it at
    /// `/v1/rotation`.
    pub fn routes(&self) -> Router {
        http::routes(self.clone())
    }

    /// Advance Automatic-mode rotations whose grace period has elapsed,
    /// checking every `interval`, until shutdown.
    pub async fn run_auto_rotation(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for (ca_type, version) in self.inner.controller.due_for_advance(Utc::now()) {
                match self.advance_phase(ca_type, Some(version), false) {
                    Ok(state) => {
                        tracing::info!(%ca_type, phase = %state.phase, "Automatic rotation advanced")
                    }
                    Err(
                        e @ (RotationError::VersionConflict { .. }
                        | RotationError::GracePeriodNotElapsed { .. }
                        | RotationError::NotInProgress(_)),
                    ) => {
                        tracing::debug!(%ca_type, error = %e, "Automatic advance skipped")
                    }
                    Err(e) => tracing::warn!(%ca_type, error = %e, "Automatic advance failed"),
                }
            }
        }
        tracing::debug!("Automatic rotation loop stopped");
    }

    /// Token cancelled on shutdown. Watch streams end when it fires.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn shutdown(&self) {
        tracing::info!("Rotation core shutting down");
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::compute_bundle;

    fn core() -> RotationCore {
        RotationCore::new(RotationConfig::default().with_grace_period(Duration::ZERO)).unwrap()
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn core_is_send_sync() {
        assert_send_sync::<RotationCore>();
    }

    #[test]
    fn rotate_all_moves_every_ca() {
        let core = core();
        let states = core.rotate(&RotateRequest::new(None, Phase::Init)).unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.phase == Phase::Init));

        let states = core
            .rotate(&RotateRequest::new(None, Phase::UpdateClients))
            .unwrap();
        assert!(states.iter().all(|s| s.phase == Phase::UpdateClients));
    }

    #[test]
    fn rotate_all_refuses_a_shared_version() {
        let core = core();
        let mut req = RotateRequest::new(None, Phase::Init);
        req.expected_version = Some(1);
        assert!(matches!(
            core.rotate(&req),
            Err(RotationError::InvalidRequest(_))
        ));
    }

    #[test]
    fn rotate_all_rollback_skips_idle_cas() {
        let core = core();
        core.start_rotation(CaType::User, RotationMode::Manual).unwrap();

        let states = core.rotate(&RotateRequest::new(None, Phase::Rollback)).unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.phase == Phase::Standby));
        // host was idle and keeps its version; user moved
        assert_eq!(states[0].version, 1);
        assert_eq!(states[1].version, 3);

        assert!(matches!(
            core.rotate(&RotateRequest::new(None, Phase::Rollback)),
            Err(RotationError::NotInProgress(_))
        ));
        assert!(matches!(
            core.rotate(&RotateRequest::new(Some(CaType::Host), Phase::Rollback)),
            Err(RotationError::NotInProgress(_))
        ));
    }

    #[test]
    fn rotate_to_rollback_restores_standby() {
        let core = core();
        let before = core.get_state(CaType::User).unwrap();
        core.rotate(&RotateRequest::new(Some(CaType::User), Phase::Init))
            .unwrap();
        let states = core
            .rotate(&RotateRequest::new(Some(CaType::User), Phase::Rollback))
            .unwrap();
        assert_eq!(states[0].phase, Phase::Standby);
        assert_eq!(
            compute_bundle(&states[0], Audience::ServerFacing),
            compute_bundle(&before, Audience::ServerFacing)
        );
    }

    #[test]
    fn renewal_verifies_and_reissues() {
        let core = core();
        let boot = core
            .issue_bootstrap_credentials("node-1", AgentRole::Server, CaType::Host)
            .unwrap();
        assert_eq!(boot.states.len(), 2);
        assert_eq!(boot.ca_bundle.matches("BEGIN CERTIFICATE").count(), 2);

        core.start_rotation(CaType::Host, RotationMode::Manual).unwrap();
        core.advance_phase(CaType::Host, None, false).unwrap();

        let renewed = core.renew_credentials(&boot.certificate_pem).unwrap();
        // servers keep the old signer during update_clients
        assert_eq!(renewed.issuer_fingerprint, boot.issuer_fingerprint);
        // host old+new, user old
        assert_eq!(renewed.ca_bundle.matches("BEGIN CERTIFICATE").count(), 3);

        let claims = ca::inspect(&renewed.certificate_pem).unwrap();
        assert_eq!(claims.subject, "node-1");
        assert_eq!(claims.role, AgentRole::Server);
    }

    #[test]
    fn renewal_rejects_untrusted_certificates() {
        let ours = core();
        let theirs = core();
        let foreign = theirs
            .issue_bootstrap_credentials("intruder", AgentRole::Client, CaType::Host)
            .unwrap();
        assert!(matches!(
            ours.renew_credentials(&foreign.certificate_pem),
            Err(RotationError::CredentialRejected(_))
        ));
        assert!(matches!(
            ours.renew_credentials("garbage"),
            Err(RotationError::CredentialRejected(_))
        ));
    }

    #[test]
    fn audit_log_records_the_rotation() {
        let dir = keyturn_common::test::scratch_dir("rotation-core-audit");
        let path = dir.join("audit.log");
        let core = RotationCore::new(
            RotationConfig::default()
                .with_grace_period(Duration::ZERO)
                .with_audit_log(&path),
        )
        .unwrap();

        core.start_rotation(CaType::Host, RotationMode::Manual).unwrap();
        core.advance_phase(CaType::Host, None, false).unwrap();
        core.rollback(CaType::Host, None).unwrap();
        let _ = core.renew_credentials("garbage");

        let log = core.audit().read().unwrap();
        let events: Vec<&str> = log
            .lines()
            .filter_map(|l| l.split(" | ").nth(1))
            .collect();
        assert_eq!(
            events,
            vec![
                "rotation_started",
                "phase_advanced",
                "rotation_rolled_back",
                "credentials_rejected"
            ]
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn automatic_mode_runs_to_completion() {
        let core = core();
        core.start_rotation(CaType::Host, RotationMode::Automatic)
            .unwrap();

        let runner = core.clone();
        let task = tokio::spawn(async move {
            runner.run_auto_rotation(Duration::from_millis(5)).await;
        });

        let mut rx = core.subscribe(CaType::Host).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow_and_update().phase == Phase::Standby {
                    break;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        // user CA never started, so it stays untouched
        assert_eq!(core.get_state(CaType::User).unwrap().version, 1);
        assert_eq!(core.get_state(CaType::Host).unwrap().version, 5);

        core.shutdown();
        task.await.unwrap();
    }
}
