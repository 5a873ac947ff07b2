//! Guest agent: the envd daemon running inside every sandbox.
//!
//! The control plane only needs two calls: a readiness probe and the
//! one-time init that sets the default user, env vars and (for backends
//! whose guest enforces it) the access token. Both go over plain HTTP to
//! the host port the backend mapped to envd.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::sandbox::error::SandboxError;
use crate::sandbox::retry::{PollOptions, poll_until};

/// Body of `POST /init`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub default_user: String,
    pub env_vars: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// Abstraction over the in-sandbox agent.
#[async_trait]
pub trait GuestAgent: Send + Sync {
    /// Block until the agent answers its health endpoint, within a bounded budget.
    async fn wait_for_health(&self, host_port: u16) -> Result<(), SandboxError>;

    /// Push the init payload once.
    async fn init(&self, host_port: u16, req: &InitRequest) -> Result<(), SandboxError>;
}

/// HTTP client for envd.
#[derive(Debug, Clone)]
pub struct EnvdClient {
    host: String,
    client: reqwest::Client,
    poll: PollOptions,
}

impl EnvdClient {
    pub fn new(host: impl Into<String>, poll: PollOptions) -> Result<Self, SandboxError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SandboxError::Backend(format!("failed to build envd client: {e}")))?;
        Ok(Self {
            host: host.into(),
            client,
            poll,
        })
    }

    fn url(&self, host_port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.host, host_port, path)
    }

    async fn probe_health(&self, host_port: u16) -> Result<(), SandboxError> {
        let resp = self
            .client
            .get(self.url(host_port, "/health"))
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("envd health request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SandboxError::GuestAgent {
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }
}

#[async_trait]
impl GuestAgent for EnvdClient {
    async fn wait_for_health(&self, host_port: u16) -> Result<(), SandboxError> {
        let start = tokio::time::Instant::now();
        poll_until(move || self.probe_health(host_port), self.poll).await?;
        tracing::info!(
            host_port,
            elapsed_ms = start.elapsed().as_millis(),
            "envd is healthy"
        );
        Ok(())
    }

    async fn init(&self, host_port: u16, req: &InitRequest) -> Result<(), SandboxError> {
        let resp = self
            .client
            .post(self.url(host_port, "/init"))
            .json(req)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("envd /init request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::GuestAgent {
                status: status.as_u16(),
                body,
            });
        }
        tracing::debug!(host_port, "envd init applied");
        Ok(())
    }
}
