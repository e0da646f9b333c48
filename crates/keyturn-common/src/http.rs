use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::api::error_body;
use crate::error::ErrorCode;

/// Render an error code and message as a JSON error response.
pub fn error_response(code: ErrorCode, message: impl Into<String>) -> axum::response::Response {
    let status = StatusCode::from_u16(code.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error_body(code, message))).into_response()
}

/// Render a domain error whose wire code is derived from the error itself.
pub fn domain_error_response<E>(err: &E) -> axum::response::Response
where
    E: std::fmt::Display,
    for<'a> &'a E: Into<ErrorCode>,
{
    error_response(err.into(), err.to_string())
}
