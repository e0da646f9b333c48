//! Rotation HTTP route handlers.
//!
//! Domain-owned routes mounted by the binary crate at `/v1/rotation/`.
//! Handlers delegate to [`RotationCore`]; errors render as the shared JSON
//! error body.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use keyturn_common::error::ErrorCode;
use keyturn_common::http::{domain_error_response, error_response};

use crate::protocol::{
    RenewRequest, RotateRequest, RotateResponse, StatesResponse, VerifyRequest, WATCH_EVENT,
};
use crate::state::CaType;
use crate::RotationCore;

/// Build the rotation router.
pub(crate) fn routes(core: RotationCore) -> Router {
    Router::new()
        .route("/rotate", post(rotate_handler))
        .route("/state/:ca_type", get(state_handler))
        .route("/states", get(states_handler))
        .route("/watch/:ca_type", get(watch_handler))
        .route("/renew", post(renew_handler))
        .route("/verify", post(verify_handler))
        .with_state(core)
}

fn parse_ca_type(raw: &str) -> Result<CaType, Response> {
    raw.parse::<CaType>()
        .map_err(|msg| error_response(ErrorCode::InvalidPayload, msg))
}

/// POST /rotate — Move one CA, or all of them, to a target phase.
async fn rotate_handler(
    State(core): State<RotationCore>,
    Json(request): Json<RotateRequest>,
) -> Response {
    match core.rotate(&request) {
        Ok(states) => Json(RotateResponse { states }).into_response(),
        Err(e) => domain_error_response(&e),
    }
}

/// GET /state/:ca_type — Current rotation state of one CA.
async fn state_handler(State(core): State<RotationCore>, Path(ca_type): Path<String>) -> Response {
    let ca_type = match parse_ca_type(&ca_type) {
        Ok(ca) => ca,
        Err(resp) => return resp,
    };
    match core.get_state(ca_type) {
        Ok(state) => Json(state).into_response(),
        Err(e) => domain_error_response(&e),
    }
}

/// GET /states — Current rotation state of every CA.
async fn states_handler(State(core): State<RotationCore>) -> Response {
    Json(StatesResponse {
        states: core.states(),
    })
    .into_response()
}

/// GET /watch/:ca_type — SSE stream of rotation states.
///
/// The current snapshot is sent first, then every published change. Slow
/// readers skip intermediate states but always see the latest one. The
/// event id is the state version.
async fn watch_handler(State(core): State<RotationCore>, Path(ca_type): Path<String>) -> Response {
    if core.is_shutting_down() {
        return error_response(ErrorCode::ShuttingDown, "control plane is shutting down");
    }
    let ca_type = match parse_ca_type(&ca_type) {
        Ok(ca) => ca,
        Err(resp) => return resp,
    };
    let mut rx = match core.subscribe(ca_type) {
        Ok(rx) => rx,
        Err(e) => return domain_error_response(&e),
    };
    let shutdown = core.shutdown_token();
    tracing::debug!(%ca_type, "Rotation watch stream opened");

    let stream = async_stream::stream! {
        loop {
            let state = rx.borrow_and_update().clone();
            match serde_json::to_string(&state) {
                Ok(data) => {
                    yield Ok::<_, Infallible>(
                        Event::default()
                            .event(WATCH_EVENT)
                            .id(state.version.to_string())
                            .data(data),
                    );
                }
                Err(e) => {
                    tracing::warn!(%ca_type, error = %e, "Failed to encode rotation state");
                    break;
                }
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        tracing::debug!(%ca_type, "Rotation watch stream closed");
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// POST /renew — Exchange a valid identity for a fresh one.
async fn renew_handler(
    State(core): State<RotationCore>,
    Json(request): Json<RenewRequest>,
) -> Response {
    match core.renew_credentials(&request.certificate_pem) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => domain_error_response(&e),
    }
}

/// POST /verify — Check a presented identity without issuing a new one.
async fn verify_handler(
    State(core): State<RotationCore>,
    Json(request): Json<VerifyRequest>,
) -> Response {
    match core.verify_credentials(&request.certificate_pem) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => domain_error_response(&e),
    }
}
