//! Data-plane router.
//!
//! Maps inbound traffic to a sandbox and streams it to the guest agent's
//! host port. Two caches back the lookup: sandbox id → host port and
//! access token → sandbox id. Both are last-writer-wins; a stale entry
//! costs one failed forward and a re-resolve, never a misroute.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HOST, HeaderName,
    TRANSFER_ENCODING,
};
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response};
use regex::Regex;

use crate::sandbox::{ContainerBackend, SandboxError, SandboxId, SandboxState};

pub const SANDBOX_ID_HEADER: &str = "e2b-sandbox-id";
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// `{port}-{sandboxId}.{domain}`
static ENVD_HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+-(sbx-[a-zA-Z0-9_-]+)\.").unwrap());

/// Hosts of this shape are always data-plane, even if they fail to parse.
static ENVD_HOST_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+-sbx-").unwrap());

const REQUEST_STRIP: [HeaderName; 5] = [
    HOST,
    ACCEPT_ENCODING,
    CONTENT_LENGTH,
    TRANSFER_ENCODING,
    CONNECTION,
];

const RESPONSE_STRIP: [HeaderName; 4] =
    [CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION];

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("Invalid sandbox hostname")]
    InvalidHostname,

    #[error("Sandbox {0} not available")]
    Unavailable(SandboxId),

    #[error("Failed to reach sandbox {0}")]
    Unreachable(SandboxId),

    #[error(transparent)]
    Backend(#[from] SandboxError),
}

pub fn parse_hostname(host: &str) -> Option<SandboxId> {
    ENVD_HOST
        .captures(host)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub struct ProxyRouter {
    backend: Arc<dyn ContainerBackend>,
    client: reqwest::Client,
    upstream_host: String,
    ports: RwLock<HashMap<SandboxId, u16>>,
    tokens: RwLock<HashMap<String, SandboxId>>,
}

impl ProxyRouter {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Result<Self, SandboxError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| SandboxError::Backend(format!("failed to build proxy client: {e}")))?;
        Ok(Self {
            backend,
            client,
            upstream_host: "127.0.0.1".to_string(),
            ports: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
        })
    }

    pub fn register_token(&self, access_token: &str, sandbox_id: &str) {
        if access_token.is_empty() {
            return;
        }
        write(&self.tokens).insert(access_token.to_string(), sandbox_id.to_string());
    }

    /// Drop the cached port and every token that points at `sandbox_id`.
    pub fn evict(&self, sandbox_id: &str) {
        write(&self.ports).remove(sandbox_id);
        write(&self.tokens).retain(|_, id| id != sandbox_id);
    }

    pub fn lookup_token(&self, access_token: &str) -> Option<SandboxId> {
        read(&self.tokens).get(access_token).cloned()
    }

    pub fn cached_port(&self, sandbox_id: &str) -> Option<u16> {
        read(&self.ports).get(sandbox_id).copied()
    }

    /// Decide whether a request belongs to the data plane.
    ///
    /// `None` means control plane. Resolution order: explicit sandbox-id
    /// header, structured hostname, then a cached access token.
    pub fn classify(&self, headers: &HeaderMap) -> Option<Result<SandboxId, ProxyError>> {
        if let Some(id) = header_str(headers, SANDBOX_ID_HEADER).filter(|v| !v.is_empty()) {
            return Some(Ok(id.to_string()));
        }

        let host = header_str(headers, HOST.as_str()).unwrap_or_default();
        if ENVD_HOST_PREFIX.is_match(host) {
            return Some(parse_hostname(host).ok_or(ProxyError::InvalidHostname));
        }

        header_str(headers, ACCESS_TOKEN_HEADER)
            .and_then(|token| self.lookup_token(token))
            .map(Ok)
    }

    pub async fn resolve_port(&self, sandbox_id: &str) -> Result<u16, ProxyError> {
        if let Some(port) = self.cached_port(sandbox_id) {
            return Ok(port);
        }

        let sandbox = self
            .backend
            .inspect_sandbox(sandbox_id)
            .await?
            .filter(|s| s.state == SandboxState::Running && s.host_port != 0)
            .ok_or_else(|| ProxyError::Unavailable(sandbox_id.to_string()))?;

        write(&self.ports).insert(sandbox_id.to_string(), sandbox.host_port);
        Ok(sandbox.host_port)
    }

    /// Stream `req` to the sandbox and its response back.
    pub async fn forward(
        &self,
        sandbox_id: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let host_port = self.resolve_port(sandbox_id).await?;

        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{}:{host_port}{path}", self.upstream_host);

        let mut headers = parts.headers;
        for name in &REQUEST_STRIP {
            headers.remove(name);
        }
        if let Ok(host) = HeaderValue::from_str(&format!("localhost:{host_port}")) {
            headers.insert(HOST, host);
        }

        let mut upstream = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers);
        if parts.method != Method::GET && parts.method != Method::HEAD {
            upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let resp = match upstream.send().await {
            Ok(resp) => resp,
            Err(e) => {
                write(&self.ports).remove(sandbox_id);
                tracing::warn!(sandbox_id = %sandbox_id, host_port, error = %e, "forward failed, evicted port");
                return Err(ProxyError::Unreachable(sandbox_id.to_string()));
            }
        };

        let status = resp.status();
        let mut resp_headers = resp.headers().clone();
        for name in &RESPONSE_STRIP {
            resp_headers.remove(name);
        }

        let mut out = Response::new(Body::from_stream(resp.bytes_stream()));
        *out.status_mut() = status;
        *out.headers_mut() = resp_headers;
        Ok(out)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
