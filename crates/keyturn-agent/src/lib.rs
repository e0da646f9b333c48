//! keyturn agent: keeps a node's identity current across CA rotations.
//!
//! [`Agent::start`] spawns one [`watcher::EventWatcher`] per trusted CA type
//! and a single [`renewal::AgentRenewalLoop`], all tied to one cancellation
//! token. The returned [`AgentHandle`] is how the rest of the process reads
//! the identity, forces a renewal, confirms or reverts a new identity and
//! stops the agent.

pub mod backoff;
pub mod config;
pub mod control;
pub mod error;
pub mod identity;
pub mod idfile;
pub mod renewal;
pub mod watcher;

use std::sync::Arc;
use std::time::Duration;

use keyturn_rotation::protocol::RenewResponse;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use config::{AgentConfig, ConfirmPolicy, WatchConfig};
pub use control::{ControlPlane, HttpControlPlane, LocalControlPlane};
pub use error::{AgentError, ControlPlaneError};
pub use identity::{Identity, IdentitySnapshot, IdentityStore};
pub use renewal::{LoopState, RenewalStatus};

use renewal::{AgentRenewalLoop, Command};
use watcher::EventWatcher;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const COMMAND_QUEUE_CAPACITY: usize = 8;

pub struct Agent;

impl Agent {
    /// Start the agent. Must be called inside a Tokio runtime.
    ///
    /// The identity is `initial` when given (and is persisted when an
    /// identity directory is configured), otherwise the bundle stored in
    /// the identity directory.
    pub fn start(
        config: AgentConfig,
        control: Arc<dyn ControlPlane>,
        initial: Option<Identity>,
    ) -> Result<AgentHandle, AgentError> {
        config.validate()?;

        let identity = match initial {
            Some(identity) => {
                if let Some(dir) = &config.identity_dir {
                    idfile::write_identity(dir, &identity)?;
                }
                identity
            }
            None => {
                let dir = config.identity_dir.as_deref().ok_or_else(|| {
                    AgentError::InvalidConfig(
                        "no initial identity and no identity directory".into(),
                    )
                })?;
                idfile::load_identity(dir)?.ok_or_else(|| {
                    AgentError::InvalidIdentity(format!(
                        "no identity in {}; bootstrap the agent first",
                        dir.display()
                    ))
                })?
            }
        };
        check_identity(&config, &identity)?;

        let store = Arc::new(IdentityStore::new(identity));
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(RenewalStatus::default());

        let mut tasks = Vec::with_capacity(config.trusted_ca_types.len() + 1);
        for ca_type in &config.trusted_ca_types {
            let watcher = EventWatcher::new(
                *ca_type,
                Arc::clone(&control),
                config.watch.clone(),
                event_tx.clone(),
                cancel.clone(),
            );
            tasks.push(watcher.spawn());
        }
        drop(event_tx);

        tracing::info!(
            subject = %config.subject,
            role = %config.role,
            identity_ca = %config.identity_ca,
            watchers = config.trusted_ca_types.len(),
            "Agent started"
        );
        let renewal = AgentRenewalLoop::new(
            config,
            control,
            Arc::clone(&store),
            event_rx,
            command_rx,
            status_tx,
            cancel.clone(),
        );
        tasks.push(tokio::spawn(renewal.run()));

        Ok(AgentHandle {
            store,
            status: status_rx,
            commands: command_tx,
            cancel,
            tasks,
        })
    }
}

/// Build the first identity of an agent from a bootstrap issuance.
pub fn bootstrap_identity(config: &AgentConfig, response: RenewResponse) -> Identity {
    let trusted = renewal::trust_for(&response.states, &config.trusted_ca_types, config.role);
    Identity::from_renewal(
        &config.subject,
        config.role,
        config.identity_ca,
        trusted,
        1,
        response,
    )
}

fn check_identity(config: &AgentConfig, identity: &Identity) -> Result<(), AgentError> {
    if identity.subject != config.subject
        || identity.role != config.role
        || identity.ca_type != config.identity_ca
    {
        return Err(AgentError::InvalidIdentity(format!(
            "identity is {} {} from the {} CA, agent is configured as {} {} from the {} CA",
            identity.role,
            identity.subject,
            identity.ca_type,
            config.role,
            config.subject,
            config.identity_ca
        )));
    }
    Ok(())
}

pub struct AgentHandle {
    store: Arc<IdentityStore>,
    status: watch::Receiver<RenewalStatus>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    /// Identity to present on new connections.
    pub fn identity(&self) -> Arc<Identity> {
        self.store.get()
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub fn status(&self) -> RenewalStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RenewalStatus> {
        self.status.clone()
    }

    /// Renew now, regardless of rotation state or TTL.
    pub async fn force_renew(&self) -> Result<Arc<Identity>, AgentError> {
        self.request(|respond_to| Command::Renew { respond_to }).await
    }

    /// Accept the identity with `generation`, releasing the one it replaced.
    pub async fn confirm(&self, generation: u64) -> Result<(), AgentError> {
        self.request(|respond_to| Command::Confirm {
            generation,
            respond_to,
        })
        .await
    }

    /// Go back to the previous identity after `generation` proved unusable.
    /// The restored identity is persisted before this returns; the reverted
    /// one is returned.
    pub async fn revert(&self, generation: u64) -> Result<Arc<Identity>, AgentError> {
        self.request(|respond_to| Command::Revert {
            generation,
            respond_to,
        })
        .await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, AgentError>>) -> Command,
    ) -> Result<T, AgentError> {
        let (respond_to, rx) = oneshot::channel();
        self.commands
            .send(command(respond_to))
            .await
            .map_err(|_| AgentError::ShuttingDown)?;
        rx.await.map_err(|_| AgentError::ShuttingDown)?
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop the watchers and the renewal loop. An in-flight renewal is
    /// abandoned without swapping.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.drain(..).collect();
        let join = async {
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "Agent task ended abnormally");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, join).await.is_err() {
            tracing::warn!("Agent shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
        }
        tracing::info!("Agent stopped");
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
