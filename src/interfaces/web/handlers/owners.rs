use axum::{
    Json,
    extract::{Path, State},
    response::Response,
};
use serde::Deserialize;

use super::respond;
use crate::interfaces::web::AppState;

#[derive(Debug, Deserialize)]
pub struct QuotaRequest {
    pub limit: i64,
}

pub async fn owner_usage(State(state): State<AppState>, Path(owner_id): Path<i64>) -> Response {
    respond("usage", state.control.usage(owner_id).await)
}

pub async fn raise_quota(
    State(state): State<AppState>,
    Path(owner_id): Path<i64>,
    Json(payload): Json<QuotaRequest>,
) -> Response {
    respond(
        "owner",
        state.control.raise_quota(owner_id, payload.limit).await,
    )
}
