use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{delete, get, patch, post},
};
use tower_http::cors::CorsLayer;

use super::handlers::{owners, tokens, workers};
use super::{AppState, auth, sse_logs_endpoint};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/workers",
            get(workers::list_workers).post(workers::create_worker),
        )
        .route("/api/workers/{id}", delete(workers::delete_worker))
        .route("/api/workers/{id}/status", get(workers::worker_status))
        .route("/api/workers/{id}/restart", post(workers::restart_worker))
        .route("/api/workers/{id}/stop", post(workers::stop_worker))
        .route("/api/workers/{id}/start", post(workers::start_worker))
        .route("/api/workers/{id}/config", patch(workers::update_config))
        .route(
            "/api/workers/{id}/capabilities",
            post(workers::toggle_capability),
        )
        .route("/api/owners/{id}/usage", get(owners::owner_usage))
        .route("/api/owners/{id}/quota", post(owners::raise_quota))
        .route(
            "/api/tokens",
            get(tokens::list_tokens).post(tokens::create_token),
        )
        .route("/api/tokens/{id}", delete(tokens::delete_token))
        .route("/api/logs", get(sse_logs_endpoint))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}
