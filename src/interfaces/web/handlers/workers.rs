use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;

use super::{failure, respond, success};
use crate::core::control::{Capability, CreateWorkerRequest};
use crate::core::store::ConfigPatch;
use crate::interfaces::web::AppState;

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub owner_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub capability: Capability,
    pub enabled: bool,
}

pub async fn list_workers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    respond("workers", state.control.list_workers(query.owner_id).await)
}

pub async fn create_worker(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkerRequest>,
) -> Response {
    match state.control.create_worker(payload).await {
        Ok(created) => success(StatusCode::CREATED, "worker", created),
        Err(e) => failure(e),
    }
}

pub async fn delete_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
) -> Response {
    respond(
        "deleted",
        state
            .control
            .delete_worker(owner.owner_id, worker_id)
            .await
            .map(|_| worker_id),
    )
}

pub async fn worker_status(
    State(state): State<AppState>,
    Path(worker_id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
) -> Response {
    respond(
        "worker",
        state.control.worker_status(owner.owner_id, worker_id).await,
    )
}

pub async fn restart_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
) -> Response {
    respond(
        "runtime",
        state.control.restart_worker(owner.owner_id, worker_id).await,
    )
}

pub async fn stop_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
) -> Response {
    respond(
        "runtime",
        state.control.stop_worker(owner.owner_id, worker_id).await,
    )
}

pub async fn start_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
) -> Response {
    respond(
        "runtime",
        state.control.start_worker(owner.owner_id, worker_id).await,
    )
}

pub async fn update_config(
    State(state): State<AppState>,
    Path(worker_id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
    Json(patch): Json<ConfigPatch>,
) -> Response {
    respond(
        "update",
        state
            .control
            .update_config(owner.owner_id, worker_id, patch)
            .await,
    )
}

pub async fn toggle_capability(
    State(state): State<AppState>,
    Path(worker_id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
    Json(payload): Json<ToggleRequest>,
) -> Response {
    respond(
        "update",
        state
            .control
            .toggle_capability(owner.owner_id, worker_id, payload.capability, payload.enabled)
            .await,
    )
}
