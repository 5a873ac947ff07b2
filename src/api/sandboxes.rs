use std::collections::BTreeMap;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use hyper::StatusCode;
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState, error_body};
use crate::sandbox::{
    CreateRequest, ListFilters, SandboxCredentials, SandboxDetail, SandboxError, SandboxState,
};

// ── Request bodies ──────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBody {
    #[serde(rename = "templateID")]
    pub template_id: Option<String>,
    pub timeout: Option<u64>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TimeoutBody {
    pub timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub state: Option<String>,
    pub metadata: Option<String>,
}

// ── Response bodies ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResponse {
    #[serde(rename = "sandboxID")]
    pub sandbox_id: String,
    #[serde(rename = "templateID")]
    pub template_id: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub envd_version: String,
    pub envd_access_token: String,
    pub traffic_access_token: Option<String>,
    pub domain: Option<String>,
}

impl SandboxResponse {
    fn new(creds: SandboxCredentials, domain: Option<String>) -> Self {
        Self {
            client_id: creds.sandbox_id.clone(),
            sandbox_id: creds.sandbox_id,
            template_id: creds.template_id,
            envd_version: creds.envd_version,
            envd_access_token: creds.access_token,
            traffic_access_token: None,
            domain,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxDetailResponse {
    #[serde(rename = "sandboxID")]
    pub sandbox_id: String,
    #[serde(rename = "templateID")]
    pub template_id: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub envd_version: String,
    pub domain: Option<String>,
    pub started_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub state: SandboxState,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl SandboxDetailResponse {
    fn new(detail: SandboxDetail, domain: Option<String>) -> Self {
        Self {
            client_id: detail.sandbox_id.clone(),
            sandbox_id: detail.sandbox_id,
            template_id: detail.template_id,
            envd_version: detail.envd_version,
            domain,
            started_at: detail.started_at,
            end_at: detail.end_at,
            state: detail.state,
            metadata: detail.metadata,
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Parse an optional JSON body; an empty body yields the default value.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        error_body(
            StatusCode::BAD_REQUEST,
            "bad_request",
            format!("invalid request body: {e}"),
        )
    })
}

/// `k1=v1&k2=v2`, each side percent-decoded.
pub fn parse_metadata_query(raw: &str) -> BTreeMap<String, String> {
    raw.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| {
            (
                percent_decode_str(k).decode_utf8_lossy().into_owned(),
                percent_decode_str(v).decode_utf8_lossy().into_owned(),
            )
        })
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

fn not_found(sandbox_id: &str) -> Response {
    ApiError(SandboxError::not_found(sandbox_id)).into_response()
}

// ── Handlers ────────────────────────────────────────────────────────

/// POST /sandboxes
#[tracing::instrument(skip_all)]
pub(crate) async fn create_sandbox(State(state): State<AppState>, body: Bytes) -> Response {
    let body: CreateBody = match optional_json(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let req = CreateRequest {
        template_id: body.template_id,
        timeout_sec: body.timeout,
        env_vars: body.env_vars,
        metadata: body.metadata,
    };
    match state.service.create(req).await {
        Ok(creds) => (
            StatusCode::CREATED,
            Json(SandboxResponse::new(creds, state.domain.clone())),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// GET /sandboxes and GET /v2/sandboxes
#[tracing::instrument(skip_all)]
pub(crate) async fn list_sandboxes(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SandboxDetailResponse>>, ApiError> {
    let filters = ListFilters {
        state: query.state,
        metadata: query
            .metadata
            .as_deref()
            .map(parse_metadata_query)
            .unwrap_or_default(),
    };
    let items = state
        .service
        .list(&filters)
        .await?
        .into_iter()
        .map(|d| SandboxDetailResponse::new(d, state.domain.clone()))
        .collect();
    Ok(Json(items))
}

/// GET /sandboxes/{id}
#[tracing::instrument(skip_all, fields(sandbox_id = %id))]
pub(crate) async fn get_sandbox(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.get_info(&id).await {
        Ok(Some(detail)) => Json(SandboxDetailResponse::new(detail, state.domain.clone())).into_response(),
        Ok(None) => not_found(&id),
        Err(e) => ApiError(e).into_response(),
    }
}

/// DELETE /sandboxes/{id}
#[tracing::instrument(skip_all, fields(sandbox_id = %id))]
pub(crate) async fn delete_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.service.kill(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found(&id),
        Err(e) => ApiError(e).into_response(),
    }
}

/// POST /sandboxes/{id}/pause
#[tracing::instrument(skip_all, fields(sandbox_id = %id))]
pub(crate) async fn pause_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.service.pause(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found(&id),
        Err(e) => ApiError(e).into_response(),
    }
}

/// POST /sandboxes/{id}/resume
#[tracing::instrument(skip_all, fields(sandbox_id = %id))]
pub(crate) async fn resume_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    connect_with_status(state, id, body, false).await
}

/// POST /sandboxes/{id}/connect, 201 when a paused sandbox was resumed.
#[tracing::instrument(skip_all, fields(sandbox_id = %id))]
pub(crate) async fn connect_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    connect_with_status(state, id, body, true).await
}

async fn connect_with_status(
    state: AppState,
    id: String,
    body: Bytes,
    created_on_resume: bool,
) -> Response {
    let body: TimeoutBody = match optional_json(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.service.connect(&id, body.timeout).await {
        Ok(outcome) => {
            let status = if created_on_resume && outcome.resumed {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (
                status,
                Json(SandboxResponse::new(outcome.credentials, state.domain.clone())),
            )
                .into_response()
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// POST /sandboxes/{id}/timeout
#[tracing::instrument(skip_all, fields(sandbox_id = %id))]
pub(crate) async fn set_sandbox_timeout(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let body: TimeoutBody = match optional_json(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let Some(timeout) = body.timeout else {
        return error_body(StatusCode::BAD_REQUEST, "bad_request", "timeout is required");
    };
    match state.service.set_timeout(&id, timeout).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}
