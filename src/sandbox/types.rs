use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::SandboxError;

// ── Sandbox identity ────────────────────────────────────────────────

pub type SandboxId = String;

/// Template used when a create request names none.
pub const DEFAULT_TEMPLATE: &str = "base";

// ── Backend kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Docker,
    Shuru,
}

impl FromStr for BackendKind {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "shuru" => Ok(Self::Shuru),
            other => Err(SandboxError::Backend(format!("unknown backend: {other}"))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => f.write_str("docker"),
            Self::Shuru => f.write_str("shuru"),
        }
    }
}

// ── Backend info ────────────────────────────────────────────────────

/// Capability flags reported by the active backend.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub kind: BackendKind,
    /// Instances can be stopped and later started again.
    pub supports_pause: bool,
    /// The guest agent enforces the access token pushed at init.
    pub guest_token_auth: bool,
    /// Sandbox records outlive the control-plane process.
    pub durable: bool,
}

// ── Sandbox record ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Running,
    Paused,
}

impl SandboxState {
    /// Parse a list filter value. Anything unrecognised means "no filter".
    pub fn parse_filter(value: Option<&str>) -> Option<Self> {
        match value {
            Some("running") => Some(Self::Running),
            Some("paused") => Some(Self::Paused),
            _ => None,
        }
    }
}

/// A sandbox as reconstructed from the backend's own record.
#[derive(Debug, Clone, PartialEq)]
pub struct Sandbox {
    pub sandbox_id: SandboxId,
    /// Backend handle: container id or process id.
    pub instance_id: String,
    pub access_token: String,
    pub template_id: String,
    pub created_at: DateTime<Utc>,
    pub timeout_sec: u64,
    pub host_port: u16,
    pub state: SandboxState,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Sandbox {
    /// Absolute expiry computed from the declared timeout.
    pub fn end_at(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::seconds(self.timeout_sec as i64)
    }
}

// ── Backend inputs / outputs ────────────────────────────────────────

/// Everything a backend needs to provision one instance.
#[derive(Debug, Clone)]
pub struct CreateContainerSpec {
    pub sandbox_id: SandboxId,
    pub access_token: String,
    pub template_id: String,
    pub timeout_sec: u64,
    pub env_vars: BTreeMap<String, String>,
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstance {
    pub instance_id: String,
    pub host_port: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter {
    pub state: Option<SandboxState>,
}

// ── Orchestrator inputs / outputs ───────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub template_id: Option<String>,
    pub timeout_sec: Option<u64>,
    pub env_vars: BTreeMap<String, String>,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// What a client needs to reach a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCredentials {
    pub sandbox_id: SandboxId,
    pub template_id: String,
    pub access_token: String,
    pub envd_version: String,
}

#[derive(Debug, Clone)]
pub struct SandboxDetail {
    pub sandbox_id: SandboxId,
    pub template_id: String,
    pub envd_version: String,
    pub started_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub state: SandboxState,
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub state: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub credentials: SandboxCredentials,
    /// The sandbox was paused before this call.
    pub resumed: bool,
}
