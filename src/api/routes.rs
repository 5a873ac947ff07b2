use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::StatusCode;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use super::middleware;
use super::sandboxes;
use super::AppState;

pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new().route(
        "/",
        get(|| async {
            Json(json!({
                "status": "ok",
            }))
        }),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/health", health_routes)
        .merge(lifecycle_router(state.clone()))
        .fallback(not_found)
        .with_state(state.clone())
        .layer(cors)
        .layer(axum::middleware::from_fn_with_state(
            state,
            middleware::route_data_plane,
        ))
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
}

fn lifecycle_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/sandboxes",
            get(sandboxes::list_sandboxes).post(sandboxes::create_sandbox),
        )
        .route("/v2/sandboxes", get(sandboxes::list_sandboxes))
        .route(
            "/sandboxes/{id}",
            get(sandboxes::get_sandbox).delete(sandboxes::delete_sandbox),
        )
        .route("/sandboxes/{id}/pause", post(sandboxes::pause_sandbox))
        .route("/sandboxes/{id}/resume", post(sandboxes::resume_sandbox))
        .route("/sandboxes/{id}/connect", post(sandboxes::connect_sandbox))
        .route("/sandboxes/{id}/timeout", post(sandboxes::set_sandbox_timeout))
        .route_layer(axum::middleware::from_fn_with_state(
            state,
            middleware::require_api_key,
        ))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}
