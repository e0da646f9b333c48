//! Rotation event watcher, one task per trusted CA type.
//!
//! Holds a long-lived subscription and forwards every state it sees into
//! the renewal loop's bounded queue. Delivery is at-least-once and may
//! repeat or reorder states across reconnects; the renewal loop dedups by
//! version. After `reconnect_attempts_before_poll` consecutive failures the
//! watcher polls `GetState` every `poll_interval`, trying the stream again
//! before each poll until it recovers.

use std::sync::Arc;

use futures_util::StreamExt;
use keyturn_rotation::{CaType, RotationState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::WatchConfig;
use crate::control::ControlPlane;
use crate::error::AgentError;

/// Item delivered to the renewal loop.
#[derive(Debug)]
pub enum WatchEvent {
    State(RotationState),
    /// The subscription broke. Carries `AgentError::WatchStreamDisconnected`.
    Disconnected(AgentError),
}

pub struct EventWatcher {
    ca_type: CaType,
    control: Arc<dyn ControlPlane>,
    config: WatchConfig,
    tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
}

impl EventWatcher {
    pub fn new(
        ca_type: CaType,
        control: Arc<dyn ControlPlane>,
        config: WatchConfig,
        tx: mpsc::Sender<WatchEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ca_type,
            control,
            config,
            tx,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Forward `event`; false once the loop is gone or we are cancelled.
    async fn deliver(&self, event: WatchEvent) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    /// Sleep unless cancelled first; false on cancellation.
    async fn pause(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn run(self) {
        let ca_type = self.ca_type;
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut failures: u32 = 0;
        tracing::debug!(%ca_type, "Rotation watcher started");

        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                opened = self.control.watch_rotation_state(ca_type) => opened,
            };

            let reason = match opened {
                Ok(mut stream) => {
                    if failures > 0 {
                        tracing::info!(%ca_type, failures, "Rotation watch reconnected");
                    }
                    loop {
                        let next = tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            next = stream.next() => next,
                        };
                        match next {
                            Some(Ok(state)) => {
                                failures = 0;
                                backoff.reset();
                                if !self.deliver(WatchEvent::State(state)).await {
                                    return;
                                }
                            }
                            Some(Err(e)) => break e.to_string(),
                            None => break "stream ended".to_string(),
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            failures += 1;
            tracing::warn!(%ca_type, failures, reason = %reason, "Rotation watch disconnected");
            let disconnected = AgentError::WatchStreamDisconnected { ca_type, reason };
            if !self.deliver(WatchEvent::Disconnected(disconnected)).await {
                return;
            }

            if failures >= self.config.reconnect_attempts_before_poll {
                if failures == self.config.reconnect_attempts_before_poll {
                    tracing::warn!(
                        %ca_type,
                        interval_ms = self.config.poll_interval.as_millis(),
                        "Falling back to polling rotation state"
                    );
                }
                let polled = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    polled = self.control.get_rotation_state(ca_type) => polled,
                };
                match polled {
                    Ok(state) => {
                        if !self.deliver(WatchEvent::State(state)).await {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(%ca_type, error = %e, "Rotation state poll failed"),
                }
                if !self.pause(self.config.poll_interval).await {
                    break;
                }
            } else if !self.pause(backoff.next_delay()).await {
                break;
            }
        }
        tracing::debug!(%ca_type, "Rotation watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use keyturn_rotation::protocol::{RenewResponse, VerifyResponse};
    use keyturn_rotation::{RotationConfig, RotationCore, RotationMode};

    use super::*;
    use crate::backoff::RetryConfig;
    use crate::control::{LocalControlPlane, StateStream};
    use crate::error::ControlPlaneError;

    /// Stream fails to open, or with `open_then_break` opens and delivers
    /// one state before breaking. `GetState` works.
    struct BrokenStream {
        inner: LocalControlPlane,
        open_then_break: bool,
        stream_attempts: AtomicU32,
        polls: AtomicU32,
    }

    #[async_trait]
    impl ControlPlane for BrokenStream {
        async fn renew_credentials(
            &self,
            certificate_pem: &str,
        ) -> Result<RenewResponse, ControlPlaneError> {
            self.inner.renew_credentials(certificate_pem).await
        }

        async fn verify_credentials(
            &self,
            certificate_pem: &str,
        ) -> Result<VerifyResponse, ControlPlaneError> {
            self.inner.verify_credentials(certificate_pem).await
        }

        async fn get_rotation_state(
            &self,
            ca_type: CaType,
        ) -> Result<RotationState, ControlPlaneError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.inner.get_rotation_state(ca_type).await
        }

        async fn watch_rotation_state(
            &self,
            ca_type: CaType,
        ) -> Result<StateStream, ControlPlaneError> {
            let attempt = self.stream_attempts.fetch_add(1, Ordering::SeqCst);
            if !self.open_then_break {
                return Err(ControlPlaneError::Unavailable("connection refused".into()));
            }
            // first connection breaks mid-stream, later ones end cleanly
            let stream = self.inner.watch_rotation_state(ca_type).await?.take(1);
            if attempt == 0 {
                Ok(Box::pin(stream.chain(futures_util::stream::once(async {
                    Err(ControlPlaneError::Unavailable("connection reset".into()))
                }))))
            } else {
                Ok(Box::pin(stream))
            }
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<WatchEvent>) -> WatchEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn fast_watch() -> WatchConfig {
        WatchConfig {
            reconnect_attempts_before_poll: 2,
            poll_interval: Duration::from_millis(10),
            backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
        }
    }

    #[tokio::test]
    async fn delivers_snapshot_then_changes() {
        let core = RotationCore::new(RotationConfig::default()).unwrap();
        let control: Arc<dyn ControlPlane> = Arc::new(LocalControlPlane::new(core.clone()));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = EventWatcher::new(CaType::User, control, fast_watch(), tx, cancel.clone()).spawn();

        match rx.recv().await {
            Some(WatchEvent::State(s)) => assert_eq!(s.version, 1),
            other => panic!("unexpected: {other:?}"),
        }
        core.start_rotation(CaType::User, RotationMode::Manual).unwrap();
        match rx.recv().await {
            Some(WatchEvent::State(s)) => assert_eq!(s.version, 2),
            other => panic!("unexpected: {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn falls_back_to_polling_and_keeps_retrying_the_stream() {
        let core = RotationCore::new(RotationConfig::default()).unwrap();
        let broken = Arc::new(BrokenStream {
            inner: LocalControlPlane::new(core),
            open_then_break: false,
            stream_attempts: AtomicU32::new(0),
            polls: AtomicU32::new(0),
        });
        let control: Arc<dyn ControlPlane> = broken.clone();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = EventWatcher::new(CaType::Host, control, fast_watch(), tx, cancel.clone()).spawn();

        let polled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(WatchEvent::State(s)) => break s,
                    Some(WatchEvent::Disconnected(e)) => {
                        assert!(matches!(e, AgentError::WatchStreamDisconnected { .. }))
                    }
                    None => panic!("watcher exited"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(polled.ca_type, CaType::Host);

        // no poll before the threshold, and the stream is retried before each poll
        let streams = broken.stream_attempts.load(Ordering::SeqCst);
        let polls = broken.polls.load(Ordering::SeqCst);
        assert!(streams >= 2);
        assert!(polls >= 1);
        assert!(streams >= polls + 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_an_open_stream_breaks() {
        let core = RotationCore::new(RotationConfig::default()).unwrap();
        let flaky = Arc::new(BrokenStream {
            inner: LocalControlPlane::new(core.clone()),
            open_then_break: true,
            stream_attempts: AtomicU32::new(0),
            polls: AtomicU32::new(0),
        });
        let control: Arc<dyn ControlPlane> = flaky.clone();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = EventWatcher::new(CaType::Host, control, fast_watch(), tx, cancel.clone()).spawn();

        assert!(matches!(next_event(&mut rx).await, WatchEvent::State(s) if s.version == 1));
        match next_event(&mut rx).await {
            WatchEvent::Disconnected(AgentError::WatchStreamDisconnected { reason, .. }) => {
                assert!(reason.contains("connection reset"), "{reason}")
            }
            other => panic!("unexpected: {other:?}"),
        }

        core.start_rotation(CaType::Host, RotationMode::Manual).unwrap();
        let resumed = loop {
            if let WatchEvent::State(s) = next_event(&mut rx).await {
                if s.version == 2 {
                    break s;
                }
            }
        };
        assert_eq!(resumed.ca_type, CaType::Host);
        assert!(flaky.stream_attempts.load(Ordering::SeqCst) >= 2);
        assert_eq!(flaky.polls.load(Ordering::SeqCst), 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
