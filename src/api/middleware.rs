use axum::{
    body::Body,
    extract::State,
    http::{Request, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hyper::StatusCode;
use tracing::Span;

use super::{AppState, error_body};

pub const API_KEY_HEADER: &str = "x-api-key";

pub async fn enrich_current_span_middleware(req: Request<Body>, next: Next) -> Response {
    let uri: &Uri = req.uri();

    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("UNKNOWN");

    let current_span = Span::current();

    current_span.record("http.uri", uri.path());
    current_span.record("http.host", host);
    if let Some(query) = uri.query() {
        current_span.record("http.query", query);
    }

    next.run(req).await
}

/// Lifecycle routes require one of the configured pre-shared keys.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let authorized = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|key| state.api_keys.iter().any(|k| k == key));

    if authorized {
        return next.run(req).await;
    }
    tracing::debug!(path = %req.uri().path(), "rejected request without valid api key");
    error_body(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "Unauthorized, please check your credentials.",
    )
}

/// Claim sandbox traffic before it reaches the lifecycle router.
///
/// Data-plane requests never pass through api-key auth: holding the
/// sandbox's access token is the credential.
pub async fn route_data_plane(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let proxy = state.service.proxy();
    match proxy.classify(req.headers()) {
        None => next.run(req).await,
        Some(Err(e)) => e.into_response(),
        Some(Ok(sandbox_id)) => {
            tracing::trace!(sandbox_id = %sandbox_id, path = %req.uri().path(), "data-plane request");
            match proxy.forward(&sandbox_id, req).await {
                Ok(resp) => resp,
                Err(e) => e.into_response(),
            }
        }
    }
}
