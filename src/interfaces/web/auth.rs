use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use super::AppState;

fn is_loopback(host: &str) -> bool {
    host == "127.0.0.1" || host == "::1" || host == "localhost"
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "success": false, "error": message, "code": "unauthorized" })),
    )
        .into_response()
}

fn is_read(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let stored_tokens = match state.store.has_any_api_tokens().await {
        Ok(found) => found,
        Err(e) => {
            warn!("token lookup failed: {}", e);
            false
        }
    };

    // No tokens at all: loopback binds stay open for local administration.
    if !stored_tokens && state.admin_token.is_none() {
        if is_loopback(&state.api_host) {
            return next.run(req).await;
        }
        return unauthorized(
            "No API tokens configured. Create one with `botfactory token create` before exposing on a non-loopback address.",
        );
    }

    let raw_token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    let Some(raw_token) = raw_token else {
        return unauthorized("Missing or invalid Authorization header. Use: Bearer <token>");
    };

    if state.admin_token.as_deref() == Some(raw_token.as_str()) {
        return next.run(req).await;
    }

    if !stored_tokens {
        return unauthorized("Invalid or unauthorized API token");
    }
    match state.store.authenticate_api_token(&raw_token).await {
        Ok(Some(token)) if token.scope.allows_writes() || is_read(req.method()) => {
            next.run(req).await
        }
        Ok(Some(token)) => {
            warn!(token = %token.name, method = %req.method(), "read-only token used for a write");
            (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "success": false,
                    "error": "This token is read-only",
                    "code": "forbidden"
                })),
            )
                .into_response()
        }
        Ok(None) => unauthorized("Invalid or unauthorized API token"),
        Err(e) => {
            warn!("token lookup failed: {}", e);
            unauthorized("Invalid or unauthorized API token")
        }
    }
}
