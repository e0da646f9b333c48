//! HTTP client for operator commands against a running control plane.
//!
//! All rotation paths live under `/v1/rotation/`.

use std::time::Duration;

use keyturn_common::api::ErrorBody;
use keyturn_rotation::protocol::{RotateRequest, RotateResponse, StatesResponse};
use keyturn_rotation::{CaType, RotationState};

/// TCP connection timeout for API requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall timeout for a non-streaming request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Daemon not reachable: {0}")]
    Unreachable(String),

    #[error("{0}")]
    Api(ErrorBody),

    #[error("Request failed: HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub struct RotationClient {
    endpoint: String,
    client: reqwest::Client,
}

impl RotationClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Unreachable(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/rotation{path}", self.endpoint)
    }

    pub async fn health(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/healthz", self.endpoint))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| ClientError::Unreachable(e.to_string()))?;
        check(resp).await.map(|_| ())
    }

    pub async fn rotate(&self, request: &RotateRequest) -> Result<Vec<RotationState>> {
        let resp = self
            .client
            .post(self.url("/rotate"))
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Unreachable(e.to_string()))?;
        Ok(decode::<RotateResponse>(resp).await?.states)
    }

    pub async fn state(&self, ca_type: CaType) -> Result<RotationState> {
        let resp = self
            .client
            .get(self.url(&format!("/state/{ca_type}")))
            .send()
            .await
            .map_err(|e| ClientError::Unreachable(e.to_string()))?;
        decode(resp).await
    }

    pub async fn states(&self) -> Result<Vec<RotationState>> {
        let resp = self
            .client
            .get(self.url("/states"))
            .send()
            .await
            .map_err(|e| ClientError::Unreachable(e.to_string()))?;
        Ok(decode::<StatesResponse>(resp).await?.states)
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) => ClientError::Api(err),
        Err(_) => ClientError::Status {
            status: status.as_u16(),
            body,
        },
    })
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    check(resp)
        .await?
        .json::<T>()
        .await
        .map_err(|e| ClientError::Decode(e.to_string()))
}
