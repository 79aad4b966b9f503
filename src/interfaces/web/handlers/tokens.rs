use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::{failure, respond};
use crate::core::store::TokenScope;
use crate::interfaces::web::AppState;

#[derive(serde::Deserialize)]
pub struct CreateTokenRequest {
    pub name: String,
    #[serde(default)]
    pub scope: TokenScope,
}

pub async fn list_tokens(State(state): State<AppState>) -> Response {
    respond("tokens", state.store.list_api_tokens().await)
}

pub async fn create_token(
    State(state): State<AppState>,
    Json(payload): Json<CreateTokenRequest>,
) -> Response {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "success": false, "error": "Token name is required", "code": "invalid_config" })),
        )
            .into_response();
    }

    match state.store.issue_api_token(&name, payload.scope).await {
        Ok((raw_token, record)) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "success": true,
                "token": raw_token,
                "record": record,
                "message": "Token created. Save the token value - it will not be shown again."
            })),
        )
            .into_response(),
        Err(e) => failure(e),
    }
}

pub async fn delete_token(State(state): State<AppState>, Path(token_id): Path<String>) -> Response {
    match state.store.revoke_api_token(&token_id).await {
        Ok(true) => Json(serde_json::json!({ "success": true, "message": "Token revoked" }))
            .into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "success": false, "error": "Token not found", "code": "not_found" })),
        )
            .into_response(),
        Err(e) => failure(e),
    }
}
