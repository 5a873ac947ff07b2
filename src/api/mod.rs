pub mod middleware;
mod routes;
pub mod sandboxes;

use std::sync::Arc;

use axum::Json;
use axum::response::{IntoResponse, Response};
use hyper::StatusCode;
use serde_json::json;

use crate::proxy::ProxyError;
use crate::sandbox::{SandboxError, SandboxService};

pub use routes::build_router;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SandboxService>,
    /// Pre-shared keys accepted on lifecycle routes.
    pub api_keys: Arc<Vec<String>>,
    /// Reported to clients in credentials when set.
    pub domain: Option<String>,
}

/// Core errors translated to status codes at the HTTP boundary.
#[derive(Debug)]
pub struct ApiError(pub SandboxError);

impl From<SandboxError> for ApiError {
    fn from(e: SandboxError) -> Self {
        Self(e)
    }
}

pub fn error_body(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": code, "message": message.into() })),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.0 {
            SandboxError::NotFound(_) => {
                error_body(StatusCode::NOT_FOUND, "not_found", self.0.to_string())
            }
            SandboxError::Unsupported(_) => {
                error_body(StatusCode::NOT_IMPLEMENTED, "unsupported", self.0.to_string())
            }
            other => {
                tracing::error!(error = %other, "sandbox operation failed");
                error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    other.to_string(),
                )
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if let ProxyError::Backend(e) = &self {
            tracing::error!(error = %e, "data-plane resolution failed");
        }
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "code": 502, "message": self.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let resp = ApiError(SandboxError::NotFound("sbx-1".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "not_found");
    }

    #[tokio::test]
    async fn unsupported_maps_to_501() {
        let resp = ApiError(SandboxError::Unsupported("pause".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body_json(resp).await["error"], "unsupported");
    }

    #[tokio::test]
    async fn unexpected_errors_map_to_500() {
        let resp = ApiError(SandboxError::Backend("engine down".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn routing_errors_map_to_502() {
        for err in [
            ProxyError::InvalidHostname,
            ProxyError::Unavailable("sbx-1".into()),
            ProxyError::Unreachable("sbx-1".into()),
        ] {
            let message = err.to_string();
            let resp = err.into_response();
            assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
            let body = body_json(resp).await;
            assert_eq!(body["code"], 502);
            assert_eq!(body["message"], message);
        }
    }
}
