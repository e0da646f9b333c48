//! Control-plane capability used by the agent.
//!
//! One implementation per transport, chosen at construction:
//! [`LocalControlPlane`] calls a [`RotationCore`] in the same process and
//! [`HttpControlPlane`] talks to the `/v1/rotation` HTTP surface.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use keyturn_common::api::ErrorBody;
use keyturn_common::error::ErrorCode;
use keyturn_rotation::protocol::{
    RenewRequest, RenewResponse, VerifyRequest, VerifyResponse, WATCH_EVENT,
};
use keyturn_rotation::{CaType, RotationCore, RotationState};
use tokio_stream::wrappers::WatchStream;

use crate::error::ControlPlaneError;

/// Stream of rotation states for one CA. Ends or errors when the
/// subscription breaks.
pub type StateStream = Pin<Box<dyn Stream<Item = Result<RotationState, ControlPlaneError>> + Send>>;

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Exchange the current identity certificate for a fresh identity.
    async fn renew_credentials(
        &self,
        certificate_pem: &str,
    ) -> Result<RenewResponse, ControlPlaneError>;

    /// Check that the control plane accepts `certificate_pem`. A success is
    /// the first use that confirms a freshly swapped identity.
    async fn verify_credentials(
        &self,
        certificate_pem: &str,
    ) -> Result<VerifyResponse, ControlPlaneError>;

    async fn get_rotation_state(
        &self,
        ca_type: CaType,
    ) -> Result<RotationState, ControlPlaneError>;

    /// Subscribe to state changes. The current state is delivered first.
    async fn watch_rotation_state(&self, ca_type: CaType)
        -> Result<StateStream, ControlPlaneError>;
}

// ── In-process ──────────────────────────────────────────────────────

/// Control plane living in the same process.
#[derive(Clone)]
pub struct LocalControlPlane {
    core: RotationCore,
}

impl LocalControlPlane {
    pub fn new(core: RotationCore) -> Self {
        Self { core }
    }

    fn ensure_running(&self) -> Result<(), ControlPlaneError> {
        if self.core.is_shutting_down() {
            return Err(ControlPlaneError::Unavailable(
                "control plane is shutting down".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn renew_credentials(
        &self,
        certificate_pem: &str,
    ) -> Result<RenewResponse, ControlPlaneError> {
        self.ensure_running()?;
        Ok(self.core.renew_credentials(certificate_pem)?)
    }

    async fn verify_credentials(
        &self,
        certificate_pem: &str,
    ) -> Result<VerifyResponse, ControlPlaneError> {
        self.ensure_running()?;
        Ok(self.core.verify_credentials(certificate_pem)?)
    }

    async fn get_rotation_state(
        &self,
        ca_type: CaType,
    ) -> Result<RotationState, ControlPlaneError> {
        self.ensure_running()?;
        Ok(self.core.get_state(ca_type)?)
    }

    async fn watch_rotation_state(
        &self,
        ca_type: CaType,
    ) -> Result<StateStream, ControlPlaneError> {
        self.ensure_running()?;
        let rx = self.core.subscribe(ca_type)?;
        let stream = WatchStream::new(rx)
            .map(Ok::<_, ControlPlaneError>)
            .take_until(self.core.shutdown_token().cancelled_owned());
        Ok(Box::pin(stream))
    }
}

// ── HTTP ────────────────────────────────────────────────────────────

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Control plane reached over HTTP.
#[derive(Clone)]
pub struct HttpControlPlane {
    base: String,
    client: reqwest::Client,
}

impl HttpControlPlane {
    /// `endpoint` is the daemon root, e.g. `http://127.0.0.1:5740`.
    pub fn new(endpoint: &str) -> Result<Self, ControlPlaneError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ControlPlaneError::Unavailable(e.to_string()))?;
        Ok(Self {
            base: format!("{}/v1/rotation", endpoint.trim_end_matches('/')),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ControlPlaneError> {
        let resp = check_status(resp).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))
    }
}

fn map_transport(e: reqwest::Error) -> ControlPlaneError {
    if e.is_decode() {
        ControlPlaneError::Decode(e.to_string())
    } else {
        ControlPlaneError::Unavailable(e.to_string())
    }
}

/// Turn a non-2xx response into `Rejected`, using the JSON error body when
/// the server sent one.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ControlPlaneError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) => ControlPlaneError::Rejected {
            code: err.error,
            message: err.message,
        },
        Err(_) if status.is_server_error() => {
            ControlPlaneError::Unavailable(format!("HTTP {status}: {body}"))
        }
        Err(_) => ControlPlaneError::Rejected {
            code: ErrorCode::InvalidPayload,
            message: format!("HTTP {status}: {body}"),
        },
    })
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn renew_credentials(
        &self,
        certificate_pem: &str,
    ) -> Result<RenewResponse, ControlPlaneError> {
        let resp = self
            .client
            .post(format!("{}/renew", self.base))
            .json(&RenewRequest {
                certificate_pem: certificate_pem.to_string(),
            })
            .send()
            .await
            .map_err(map_transport)?;
        Self::decode(resp).await
    }

    async fn verify_credentials(
        &self,
        certificate_pem: &str,
    ) -> Result<VerifyResponse, ControlPlaneError> {
        let resp = self
            .client
            .post(format!("{}/verify", self.base))
            .json(&VerifyRequest {
                certificate_pem: certificate_pem.to_string(),
            })
            .send()
            .await
            .map_err(map_transport)?;
        Self::decode(resp).await
    }

    async fn get_rotation_state(
        &self,
        ca_type: CaType,
    ) -> Result<RotationState, ControlPlaneError> {
        let resp = self
            .client
            .get(format!("{}/state/{ca_type}", self.base))
            .send()
            .await
            .map_err(map_transport)?;
        Self::decode(resp).await
    }

    async fn watch_rotation_state(
        &self,
        ca_type: CaType,
    ) -> Result<StateStream, ControlPlaneError> {
        let resp = self
            .client
            .get(format!("{}/watch/{ca_type}", self.base))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(map_transport)?;
        let resp = check_status(resp).await?;

        let mut bytes = Box::pin(resp.bytes_stream());
        let stream = async_stream::stream! {
            let mut parser = SseParser::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ControlPlaneError::Unavailable(e.to_string()));
                        break;
                    }
                };
                for event in parser.push(&chunk) {
                    if event.name.as_deref().unwrap_or(WATCH_EVENT) != WATCH_EVENT {
                        continue;
                    }
                    yield serde_json::from_str::<RotationState>(&event.data)
                        .map_err(|e| ControlPlaneError::Decode(e.to_string()));
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

// ── SSE framing ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub name: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Comment lines (keep-alives) and
/// `id:` fields are skipped; multi-line `data:` fields are joined with `\n`.
///
/// Bytes are buffered until a line is complete, so a chunk boundary inside
/// a UTF-8 sequence or a `\r\n` pair does not corrupt the event.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buf: Vec<u8>,
    name: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                let name = self.name.take();
                if !self.data.is_empty() {
                    events.push(SseEvent {
                        name,
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
            } else if let Some(v) = line.strip_prefix("data:") {
                self.data.push(v.strip_prefix(' ').unwrap_or(v).to_string());
            } else if let Some(v) = line.strip_prefix("event:") {
                self.name = Some(v.trim().to_string());
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_handles_split_chunks() {
        let mut p = SseParser::default();
        assert!(p.push(b"event: rotation_state\nid: 3\nda").is_empty());
        let events = p.push(b"ta: {\"a\":1}\n\n:keep-alive\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                name: Some("rotation_state".into()),
                data: "{\"a\":1}".into()
            }]
        );
    }

    #[test]
    fn parser_joins_multiline_data_and_crlf() {
        let mut p = SseParser::default();
        let events = p.push(b"data: one\r\ndata: two\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
        assert_eq!(events[0].name, None);
    }

    #[test]
    fn parser_keeps_sequences_split_across_chunks() {
        let text = "event: rotation_state\r\ndata: {\"subject\":\"nœud\"}\r\n\r\n".as_bytes();
        let cr = text.iter().position(|&b| b == b'\r').unwrap();
        let multibyte = text.iter().position(|&b| b >= 0x80).unwrap();

        let mut p = SseParser::default();
        assert!(p.push(&text[..cr + 1]).is_empty());
        assert!(p.push(&text[cr + 1..multibyte + 1]).is_empty());
        let events = p.push(&text[multibyte + 1..]);
        assert_eq!(
            events,
            vec![SseEvent {
                name: Some("rotation_state".into()),
                data: "{\"subject\":\"nœud\"}".into()
            }]
        );
    }

    #[test]
    fn base_url_is_normalized() {
        let cp = HttpControlPlane::new("http://127.0.0.1:5740//").unwrap();
        assert_eq!(cp.base_url(), "http://127.0.0.1:5740/v1/rotation");
    }

    #[tokio::test]
    async fn local_watch_starts_with_the_snapshot() {
        let core = RotationCore::new(keyturn_rotation::RotationConfig::default()).unwrap();
        let cp = LocalControlPlane::new(core.clone());
        let mut stream = cp.watch_rotation_state(CaType::Host).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.version, 1);

        core.start_rotation(CaType::Host, keyturn_rotation::RotationMode::Manual)
            .unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.version, 2);

        core.shutdown();
        assert!(stream.next().await.is_none());
        assert!(matches!(
            cp.get_rotation_state(CaType::Host).await,
            Err(ControlPlaneError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn local_rejections_keep_their_code() {
        let core = RotationCore::new(keyturn_rotation::RotationConfig::default()).unwrap();
        let cp = LocalControlPlane::new(core);
        match cp.renew_credentials("garbage").await {
            Err(ControlPlaneError::Rejected { code, .. }) => {
                assert_eq!(code, ErrorCode::CredentialRejected)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
