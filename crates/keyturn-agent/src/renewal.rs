//! Agent renewal loop.
//!
//! A single task owns the identity store's write side. It wakes on three
//! triggers: a rotation state change that makes the current identity
//! stale, the TTL renewal point, and an explicit force-renew request.
//!
//! The same task serves the handle's commands (force-renew, confirm,
//! revert), so the store and the identity directory have one writer.
//!
//! A renewal swaps the new identity in and persists it. A persistence
//! failure reverts the swap. The replaced identity is kept until the new
//! one is confirmed: by a successful verification call to the control
//! plane, or by the caller. Cancellation aborts an in-flight attempt before
//! anything is swapped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keyturn_rotation::protocol::RenewResponse;
use keyturn_rotation::trust::{required_trust, signing_certificate};
use keyturn_rotation::{AgentRole, CaType, Certificate, RotationState};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::{AgentConfig, ConfirmPolicy};
use crate::control::ControlPlane;
use crate::error::{AgentError, ControlPlaneError};
use crate::identity::{Identity, IdentityStore};
use crate::idfile;
use crate::watcher::WatchEvent;

/// Why a renewal ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalTrigger {
    /// The TTL renewal point passed.
    Expiry,
    /// A rotation state change made the identity stale.
    Rotation { ca_type: CaType, version: u64 },
    /// Follow-up after a renewal issued under older state than we observe,
    /// or after a failure backoff expired with the identity still stale.
    Recheck,
    Forced,
}

impl fmt::Display for RenewalTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expiry => f.write_str("expiry"),
            Self::Rotation { ca_type, version } => write!(f, "rotation({ca_type} v{version})"),
            Self::Recheck => f.write_str("recheck"),
            Self::Forced => f.write_str("forced"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    #[default]
    Idle,
    Renewing,
    Stopped,
}

/// Retry bookkeeping for the current renewal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenewalLease {
    pub attempts: u32,
    /// Set after a fatal failure. TTL renewal does not run before it.
    pub next_backoff_deadline: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Published after every change of loop state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenewalStatus {
    pub state: LoopState,
    pub generation: u64,
    pub renewals: u64,
    /// Renewal RPCs sent, including failed ones.
    pub attempts: u64,
    pub fatal_failures: u64,
    pub watch_disconnects: u64,
    pub last_renewed_at: Option<DateTime<Utc>>,
    pub last_fatal_error: Option<String>,
    pub lease: RenewalLease,
}

/// Request from the agent handle to the renewal loop.
pub(crate) enum Command {
    Renew {
        respond_to: oneshot::Sender<Result<Arc<Identity>, AgentError>>,
    },
    Confirm {
        generation: u64,
        respond_to: oneshot::Sender<Result<(), AgentError>>,
    },
    Revert {
        generation: u64,
        respond_to: oneshot::Sender<Result<Arc<Identity>, AgentError>>,
    },
}

/// Trust an identity with `role` needs, given the states of the CA types it
/// trusts.
pub fn trust_for<'a>(
    states: impl IntoIterator<Item = &'a RotationState>,
    trusted_ca_types: &[CaType],
    role: AgentRole,
) -> Vec<Certificate> {
    required_trust(
        states
            .into_iter()
            .filter(|s| trusted_ca_types.contains(&s.ca_type)),
        role.audience(),
    )
}

/// Why `identity` no longer matches the observed rotation state, if it
/// doesn't. Undecided until every trusted CA type has been observed.
pub fn renewal_reason(
    identity: &Identity,
    observed: &BTreeMap<CaType, RotationState>,
    trusted_ca_types: &[CaType],
) -> Option<&'static str> {
    let states: Vec<&RotationState> = trusted_ca_types
        .iter()
        .map(|ca| observed.get(ca))
        .collect::<Option<_>>()?;

    let required = trust_for(states, trusted_ca_types, identity.role);
    let required: Vec<&str> = required.iter().map(|c| c.fingerprint.as_str()).collect();
    if required != identity.trusted_fingerprints() {
        return Some("trust bundle changed");
    }

    let own = observed.get(&identity.ca_type)?;
    if signing_certificate(own, identity.role).fingerprint != identity.issuer_fingerprint {
        return Some("signing certificate changed");
    }
    None
}

struct Failure {
    transient: bool,
    reason: String,
}

pub struct AgentRenewalLoop {
    config: AgentConfig,
    control: Arc<dyn ControlPlane>,
    store: Arc<IdentityStore>,
    events: mpsc::Receiver<WatchEvent>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<RenewalStatus>,
    cancel: CancellationToken,
    /// Latest state per CA type, by version.
    observed: BTreeMap<CaType, RotationState>,
    lease: RenewalLease,
    pending: Option<RenewalTrigger>,
    /// Generation awaiting verification, and when to try again.
    unconfirmed: Option<(u64, DateTime<Utc>)>,
}

impl AgentRenewalLoop {
    pub(crate) fn new(
        config: AgentConfig,
        control: Arc<dyn ControlPlane>,
        store: Arc<IdentityStore>,
        events: mpsc::Receiver<WatchEvent>,
        commands: mpsc::Receiver<Command>,
        status: watch::Sender<RenewalStatus>,
        cancel: CancellationToken,
    ) -> Self {
        let generation = store.get().generation;
        status.send_modify(|s| s.generation = generation);
        Self {
            config,
            control,
            store,
            events,
            commands,
            status,
            cancel,
            observed: BTreeMap::new(),
            lease: RenewalLease::default(),
            pending: None,
            unconfirmed: None,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            subject = %self.config.subject,
            role = %self.config.role,
            generation = self.store.get().generation,
            "Renewal loop started"
        );
        let mut events_open = true;

        loop {
            if let Some(trigger) = self.pending.take() {
                if renewal_reason(&self.store.get(), &self.observed, &self.config.trusted_ca_types)
                    .is_some()
                {
                    let _ = self.renew(trigger).await;
                    continue;
                }
            }

            let wait = self.until_deadline();
            let trigger = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => {
                    self.handle(command).await;
                    continue;
                }
                event = self.events.recv(), if events_open => match event {
                    Some(WatchEvent::State(state)) => match self.observe(state) {
                        Some(trigger) => trigger,
                        None => continue,
                    },
                    Some(WatchEvent::Disconnected(e)) => {
                        tracing::debug!(error = %e, "Watch disconnect reported");
                        self.status.send_modify(|s| s.watch_disconnects += 1);
                        continue;
                    }
                    None => {
                        events_open = false;
                        continue;
                    }
                },
                _ = tokio::time::sleep(wait) => {
                    if self.confirmation_due() {
                        self.retry_confirmation().await;
                        continue;
                    }
                    match self.on_deadline() {
                        Some(trigger) => trigger,
                        None => continue,
                    }
                }
            };

            let _ = self.renew(trigger).await;
        }

        self.status.send_modify(|s| s.state = LoopState::Stopped);
        tracing::info!("Renewal loop stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Renew { respond_to } => {
                let result = self.renew(RenewalTrigger::Forced).await;
                let _ = respond_to.send(result);
            }
            Command::Confirm {
                generation,
                respond_to,
            } => {
                let result = self.store.confirm(generation);
                if result.is_ok() {
                    self.unconfirmed = None;
                    tracing::info!(generation, "Identity confirmed by caller");
                }
                let _ = respond_to.send(result);
            }
            Command::Revert {
                generation,
                respond_to,
            } => {
                let result = self.revert(generation);
                if result.is_ok() {
                    tracing::warn!(generation, "Identity reverted by caller");
                }
                let _ = respond_to.send(result);
            }
        }
    }

    /// Record `state`; returns a trigger when it makes the identity stale.
    /// Repeated or older versions are dropped.
    fn observe(&mut self, state: RotationState) -> Option<RenewalTrigger> {
        if !self.config.trusted_ca_types.contains(&state.ca_type) {
            return None;
        }
        if let Some(seen) = self.observed.get(&state.ca_type) {
            if state.version <= seen.version {
                tracing::trace!(
                    ca_type = %state.ca_type,
                    version = state.version,
                    seen = seen.version,
                    "Ignoring already-seen rotation state"
                );
                return None;
            }
        }
        let trigger = RenewalTrigger::Rotation {
            ca_type: state.ca_type,
            version: state.version,
        };
        tracing::debug!(
            ca_type = %state.ca_type,
            phase = %state.phase,
            version = state.version,
            "Rotation state observed"
        );
        self.observed.insert(state.ca_type, state);

        let identity = self.store.get();
        let reason = renewal_reason(&identity, &self.observed, &self.config.trusted_ca_types)?;
        tracing::info!(%trigger, reason, "Identity is stale");
        Some(trigger)
    }

    /// Time until the next TTL renewal point, or until a failure backoff
    /// ends, whichever governs.
    fn until_deadline(&self) -> Duration {
        let mut due = self
            .lease
            .next_backoff_deadline
            .unwrap_or_else(|| self.store.get().renew_at(self.config.renew_fraction));
        if let Some((_, retry_at)) = self.unconfirmed {
            due = due.min(retry_at);
        }
        (due - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    fn confirmation_due(&self) -> bool {
        matches!(self.unconfirmed, Some((_, retry_at)) if Utc::now() >= retry_at)
    }

    async fn retry_confirmation(&mut self) {
        let Some((generation, _)) = self.unconfirmed.take() else {
            return;
        };
        let identity = self.store.get();
        if identity.generation != generation {
            return;
        }
        if let Err(failure) = self.verify(&identity).await {
            tracing::error!(
                generation,
                reason = %failure.reason,
                "Unconfirmed identity rejected; previous identity restored"
            );
        }
    }

    fn on_deadline(&mut self) -> Option<RenewalTrigger> {
        let backing_off = self.lease.next_backoff_deadline.take().is_some();
        self.status
            .send_modify(|s| s.lease.next_backoff_deadline = None);

        let identity = self.store.get();
        if Utc::now() >= identity.renew_at(self.config.renew_fraction) {
            return Some(RenewalTrigger::Expiry);
        }
        if backing_off
            && renewal_reason(&identity, &self.observed, &self.config.trusted_ca_types).is_some()
        {
            return Some(RenewalTrigger::Recheck);
        }
        None
    }

    /// Run one renewal to completion: retry transient failures with backoff
    /// until the attempt budget is spent.
    async fn renew(&mut self, trigger: RenewalTrigger) -> Result<Arc<Identity>, AgentError> {
        self.lease.attempts = 0;
        self.status.send_modify(|s| s.state = LoopState::Renewing);
        tracing::info!(%trigger, "Renewing identity");

        let mut backoff = Backoff::new(self.config.retry.clone());
        let result = loop {
            self.lease.attempts += 1;
            let attempt = self.lease.attempts;
            let lease = self.lease.clone();
            self.status.send_modify(|s| {
                s.attempts += 1;
                s.lease = lease;
            });

            let presented = self.store.get();
            let call = tokio::time::timeout(
                self.config.attempt_timeout,
                self.control.renew_credentials(&presented.certificate_pem),
            );
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break Err(AgentError::ShuttingDown),
                outcome = call => outcome,
            };
            drop(presented);

            let failure = match outcome {
                Ok(Ok(response)) => match self.install(response) {
                    Ok(identity) => match self.verify(&identity).await {
                        Ok(()) => break Ok(identity),
                        Err(failure) => failure,
                    },
                    Err(e) => Failure {
                        transient: matches!(e, AgentError::Io(_)),
                        reason: e.to_string(),
                    },
                },
                Ok(Err(e)) => self.classify(attempt, e),
                Err(_) => self.classify(attempt, ControlPlaneError::Timeout(self.config.attempt_timeout)),
            };
            self.lease.last_error = Some(failure.reason.clone());

            if !failure.transient || self.config.retry.exhausted(attempt) {
                break Err(AgentError::RenewalFatalFailure {
                    attempts: attempt,
                    reason: failure.reason,
                });
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = self.cancel.cancelled() => break Err(AgentError::ShuttingDown),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        match &result {
            Ok(identity) => {
                self.lease = RenewalLease::default();
                let generation = identity.generation;
                self.status.send_modify(|s| {
                    s.state = LoopState::Idle;
                    s.generation = generation;
                    s.renewals += 1;
                    s.last_renewed_at = Some(Utc::now());
                    s.lease = RenewalLease::default();
                });
            }
            Err(AgentError::ShuttingDown) => {
                tracing::debug!(%trigger, "Renewal abandoned on shutdown");
                self.status.send_modify(|s| s.state = LoopState::Idle);
            }
            Err(e) => {
                let deadline = Utc::now()
                    + chrono::Duration::from_std(self.config.retry.max_delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                self.lease.next_backoff_deadline = Some(deadline);
                tracing::error!(
                    %trigger,
                    error = %e,
                    generation = self.store.get().generation,
                    retry_after = %deadline,
                    "Renewal failed; keeping current identity"
                );
                let lease = self.lease.clone();
                let message = e.to_string();
                self.status.send_modify(|s| {
                    s.state = LoopState::Idle;
                    s.fatal_failures += 1;
                    s.last_fatal_error = Some(message);
                    s.lease = lease;
                });
            }
        }
        result
    }

    fn classify(&self, attempt: u32, error: ControlPlaneError) -> Failure {
        let transient = error.is_transient();
        let error = AgentError::RenewalTransientFailure {
            attempt,
            source: error,
        };
        if transient {
            tracing::warn!(error = %error, "Renewal attempt failed");
        }
        Failure {
            transient,
            reason: error.to_string(),
        }
    }

    /// Swap in the identity carried by `response` and persist it. The new
    /// identity stays unconfirmed.
    fn install(&mut self, response: RenewResponse) -> Result<Arc<Identity>, AgentError> {
        let mut behind = false;
        for state in &response.states {
            if !self.config.trusted_ca_types.contains(&state.ca_type) {
                continue;
            }
            match self.observed.get(&state.ca_type) {
                Some(seen) if seen.version > state.version => behind = true,
                Some(seen) if seen.version == state.version => {}
                _ => {
                    self.observed.insert(state.ca_type, state.clone());
                }
            }
        }

        let trusted = trust_for(
            &response.states,
            &self.config.trusted_ca_types,
            self.config.role,
        );
        let generation = self.store.next_generation();
        let identity = Identity::from_renewal(
            &self.config.subject,
            self.config.role,
            self.config.identity_ca,
            trusted,
            generation,
            response,
        );
        self.store.swap(identity)?;

        let current = self.store.get();
        if let Some(dir) = &self.config.identity_dir {
            if let Err(e) = idfile::write_identity(dir, &current) {
                tracing::error!(
                    generation,
                    path = %dir.display(),
                    error = %e,
                    "Persisting identity failed; reverting"
                );
                drop(current);
                self.store.revert(generation)?;
                // Staging failures leave the old files in place; a failed
                // rename may not have.
                if let Err(restore) = idfile::write_identity(dir, &self.store.get()) {
                    tracing::warn!(error = %restore, "Restoring the previous identity bundle failed");
                }
                return Err(e);
            }
        }

        tracing::info!(
            generation,
            issuer = %current.issuer_fingerprint,
            trusted = current.trusted_anchor_count(),
            expires_at = %current.expires_at,
            "Identity renewed"
        );
        if behind {
            self.pending = Some(RenewalTrigger::Recheck);
        }
        Ok(current)
    }

    /// Confirm a freshly swapped identity by presenting it to the control
    /// plane. A rejection reverts it. A transport failure leaves it
    /// unconfirmed and schedules another try.
    async fn verify(&mut self, identity: &Identity) -> Result<(), Failure> {
        if self.config.confirm == ConfirmPolicy::Caller {
            return Ok(());
        }
        let generation = identity.generation;
        let call = tokio::time::timeout(
            self.config.attempt_timeout,
            self.control.verify_credentials(&identity.certificate_pem),
        );
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            outcome = call => outcome,
        };
        let error = match outcome {
            Ok(Ok(_)) => {
                self.unconfirmed = None;
                return match self.store.confirm(generation) {
                    Ok(()) => {
                        tracing::debug!(generation, "Identity confirmed");
                        Ok(())
                    }
                    Err(e) => Err(Failure {
                        transient: false,
                        reason: e.to_string(),
                    }),
                };
            }
            Ok(Err(e)) => e,
            Err(_) => ControlPlaneError::Timeout(self.config.attempt_timeout),
        };

        if error.is_transient() {
            let retry_at = Utc::now()
                + chrono::Duration::from_std(self.config.retry.max_delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
            tracing::warn!(
                generation,
                error = %error,
                "Could not confirm new identity; keeping the previous one"
            );
            self.unconfirmed = Some((generation, retry_at));
            return Ok(());
        }

        self.unconfirmed = None;
        tracing::error!(generation, error = %error, "New identity rejected; reverting");
        if let Err(e) = self.revert(generation) {
            tracing::error!(generation, error = %e, "Reverting rejected identity failed");
        }
        Err(Failure {
            transient: false,
            reason: format!("new identity rejected: {error}"),
        })
    }

    /// Put back the identity `generation` replaced, in memory and on disk.
    fn revert(&mut self, generation: u64) -> Result<Arc<Identity>, AgentError> {
        let reverted = self.store.revert(generation)?;
        if matches!(self.unconfirmed, Some((g, _)) if g == generation) {
            self.unconfirmed = None;
        }
        let current = self.store.get();
        self.status
            .send_modify(|s| s.generation = current.generation);
        if let Some(dir) = &self.config.identity_dir {
            idfile::write_identity(dir, &current)?;
        }
        Ok(reverted)
    }
}
