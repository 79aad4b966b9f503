pub mod owners;
pub mod tokens;
pub mod workers;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::warn;

use crate::error::FleetError;

pub(crate) fn status_for(err: &FleetError) -> StatusCode {
    match err {
        FleetError::InvalidConfig(_) | FleetError::InvalidCredential(_) => StatusCode::BAD_REQUEST,
        FleetError::Forbidden { .. } => StatusCode::FORBIDDEN,
        FleetError::WorkerNotFound(_) | FleetError::OwnerNotFound(_) => StatusCode::NOT_FOUND,
        FleetError::AlreadyRunning(_)
        | FleetError::NotRunning(_)
        | FleetError::IllegalTransition { .. }
        | FleetError::WorkerLimitReached { .. } => StatusCode::CONFLICT,
        FleetError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        FleetError::NotConfirmed { .. } => StatusCode::GATEWAY_TIMEOUT,
        FleetError::GatewayUnavailable(_) | FleetError::Llm(_) => StatusCode::BAD_GATEWAY,
        FleetError::Storage(_) | FleetError::Serialization(_) | FleetError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub(crate) fn failure(err: FleetError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(code = err.code(), "request failed: {}", err);
    }
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": err.to_string(),
            "code": err.code(),
        })),
    )
        .into_response()
}

/// Wraps `value`'s fields with `"success": true`.
pub(crate) fn success<T: Serialize>(status: StatusCode, key: &str, value: T) -> Response {
    let mut body = serde_json::json!({ "success": true });
    match serde_json::to_value(value) {
        Ok(v) => body[key] = v,
        Err(e) => return failure(e.into()),
    }
    (status, Json(body)).into_response()
}

pub(crate) fn respond<T: Serialize>(key: &str, result: Result<T, FleetError>) -> Response {
    match result {
        Ok(value) => success(StatusCode::OK, key, value),
        Err(e) => failure(e),
    }
}
