//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use keyturn_rotation::{AgentRole, CaType};

use crate::backoff::RetryConfig;
use crate::error::AgentError;

const DEFAULT_RENEW_FRACTION: f64 = 0.5;
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECTS_BEFORE_POLL: u32 = 3;

/// How an agent follows rotation state.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Consecutive failed stream attempts before falling back to polling.
    pub reconnect_attempts_before_poll: u32,
    /// Interval between `GetState` polls while the stream is down.
    pub poll_interval: Duration,
    /// Delay between reconnect attempts. `max_attempts` is ignored.
    pub backoff: RetryConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts_before_poll: DEFAULT_RECONNECTS_BEFORE_POLL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
                backoff_multiplier: 2.0,
            },
        }
    }
}

/// When a swapped-in identity is confirmed and the one it replaced is
/// released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmPolicy {
    /// Present the new certificate to the control plane. Success confirms
    /// it; a rejection reverts to the previous identity.
    #[default]
    Verify,
    /// The caller confirms or reverts through the agent handle after its
    /// own first use of the identity.
    Caller,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name placed in the identity certificate's CN.
    pub subject: String,
    pub role: AgentRole,
    /// CA type that issues this agent's identity.
    pub identity_ca: CaType,
    /// CA types whose certificates this agent must trust. Must include
    /// `identity_ca`.
    pub trusted_ca_types: Vec<CaType>,
    /// Renew once this fraction of the certificate lifetime has passed.
    pub renew_fraction: f64,
    pub retry: RetryConfig,
    /// Deadline for a single renewal RPC, separate from the backoff cap.
    pub attempt_timeout: Duration,
    pub watch: WatchConfig,
    /// Where the identity bundle is persisted. `None` keeps it in memory.
    pub identity_dir: Option<PathBuf>,
    /// Capacity of the watcher to renewal-loop event queue.
    pub event_queue_capacity: usize,
    pub confirm: ConfirmPolicy,
}

impl AgentConfig {
    pub fn new(subject: impl Into<String>, role: AgentRole) -> Self {
        Self {
            subject: subject.into(),
            role,
            identity_ca: CaType::Host,
            trusted_ca_types: CaType::ALL.to_vec(),
            renew_fraction: DEFAULT_RENEW_FRACTION,
            retry: RetryConfig::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            watch: WatchConfig::default(),
            identity_dir: None,
            event_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            confirm: ConfirmPolicy::default(),
        }
    }

    pub fn with_identity_ca(mut self, ca_type: CaType) -> Self {
        self.identity_ca = ca_type;
        self
    }

    pub fn with_trusted_ca_types(mut self, ca_types: Vec<CaType>) -> Self {
        self.trusted_ca_types = ca_types;
        self
    }

    pub fn with_renew_fraction(mut self, fraction: f64) -> Self {
        self.renew_fraction = fraction;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_watch(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_identity_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.identity_dir = Some(dir.into());
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub fn with_confirm_policy(mut self, policy: ConfirmPolicy) -> Self {
        self.confirm = policy;
        self
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.subject.trim().is_empty() {
            return Err(AgentError::InvalidConfig("subject must not be empty".into()));
        }
        if !(self.renew_fraction > 0.0 && self.renew_fraction <= 1.0) {
            return Err(AgentError::InvalidConfig(format!(
                "renew_fraction must be in (0, 1], got {}",
                self.renew_fraction
            )));
        }
        if !self.trusted_ca_types.contains(&self.identity_ca) {
            return Err(AgentError::InvalidConfig(format!(
                "trusted CA types must include the identity CA ({})",
                self.identity_ca
            )));
        }
        if self.event_queue_capacity == 0 {
            return Err(AgentError::InvalidConfig(
                "event_queue_capacity must be positive".into(),
            ));
        }
        if self.attempt_timeout.is_zero() {
            return Err(AgentError::InvalidConfig(
                "attempt_timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = AgentConfig::new("node-1", AgentRole::Client);
        cfg.validate().unwrap();
        assert_eq!(cfg.confirm, ConfirmPolicy::Verify);
    }

    #[test]
    fn identity_ca_must_be_trusted() {
        let cfg = AgentConfig::new("node-1", AgentRole::Server)
            .with_identity_ca(CaType::User)
            .with_trusted_ca_types(vec![CaType::Host]);
        assert!(matches!(cfg.validate(), Err(AgentError::InvalidConfig(_))));
    }

    #[test]
    fn renew_fraction_is_bounded() {
        for bad in [0.0, -0.5, 1.5, f64::NAN] {
            let cfg = AgentConfig::new("n", AgentRole::Client).with_renew_fraction(bad);
            assert!(cfg.validate().is_err(), "{bad} accepted");
        }
        AgentConfig::new("n", AgentRole::Client)
            .with_renew_fraction(1.0)
            .validate()
            .unwrap();
    }
}
