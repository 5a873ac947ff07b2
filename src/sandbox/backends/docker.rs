//! Docker Engine backend.
//!
//! Containers are the only durable record: every piece of sandbox state
//! the control plane needs after a restart is stored as container labels
//! at create time and decoded again on inspect/list. Containers are named
//! after their sandbox id so the engine resolves `sbx-…` directly.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary, HostConfig, PortBinding};
use chrono::{DateTime, Utc};
use futures::StreamExt;

use crate::sandbox::backend::ContainerBackend;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::*;

pub const LABEL_SANDBOX_ID: &str = "e2b.sandbox-id";
pub const LABEL_ACCESS_TOKEN: &str = "e2b.access-token";
pub const LABEL_TEMPLATE_ID: &str = "e2b.template-id";
pub const LABEL_CREATED_AT: &str = "e2b.created-at";
pub const LABEL_TIMEOUT: &str = "e2b.timeout";
pub const LABEL_METADATA: &str = "e2b.metadata";

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub socket_path: String,
    pub registry: String,
    pub envd_port: u16,
    /// Used when a container predates the timeout label.
    pub default_timeout_sec: u64,
}

pub struct DockerBackend {
    docker: Docker,
    config: DockerConfig,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Result<Self, SandboxError> {
        let docker =
            Docker::connect_with_unix(&config.socket_path, 120, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { docker, config })
    }

    fn port_key(&self) -> String {
        format!("{}/tcp", self.config.envd_port)
    }

    async fn host_port_of(&self, sandbox_id: &str) -> Result<Option<u16>, SandboxError> {
        let info = self
            .docker
            .inspect_container(sandbox_id, None::<InspectContainerOptions>)
            .await?;
        Ok(inspect_host_port(&info, self.config.envd_port))
    }

    async fn force_remove(&self, sandbox_id: &str) {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(sandbox_id, Some(opts)).await {
            tracing::warn!(sandbox_id = %sandbox_id, error = %e, "failed to remove half-created container");
        }
    }
}

pub fn local_image_name(template_id: &str) -> String {
    format!("sandbox-{template_id}:latest")
}

pub fn registry_image_name(registry: &str, template_id: &str) -> String {
    format!("{}/sandbox-{template_id}:latest", registry.trim_end_matches('/'))
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Docker,
            supports_pause: true,
            guest_token_auth: true,
            durable: true,
        }
    }

    async fn resolve_image(&self, template_id: &str) -> Result<String, SandboxError> {
        let local = local_image_name(template_id);
        match self.docker.inspect_image(&local).await {
            Ok(_) => return Ok(local),
            // Unreachable engine, not a missing image.
            Err(e) if status_code(&e).is_none() => return Err(e.into()),
            Err(e) => {
                tracing::debug!(image = %local, error = %e, "local image not available");
            }
        }

        let remote = registry_image_name(&self.config.registry, template_id);
        tracing::info!(image = %remote, "pulling template image");
        let pulled = {
            let opts = CreateImageOptions {
                from_image: remote.as_str(),
                ..Default::default()
            };
            let mut progress = self.docker.create_image(Some(opts), None, None);
            let mut pulled = Ok(());
            while let Some(step) = progress.next().await {
                if let Err(e) = step {
                    pulled = Err(e);
                    break;
                }
            }
            pulled
        };

        match pulled {
            Ok(()) => Ok(remote),
            // Registry refusals arrive as a status or as an error frame in
            // the progress stream. Anything else means the engine itself failed.
            Err(e)
                if status_code(&e).is_none()
                    && !matches!(e, bollard::errors::Error::DockerStreamError { .. }) =>
            {
                Err(e.into())
            }
            Err(e) => {
                tracing::warn!(image = %remote, error = %e, "image pull failed");
                Err(SandboxError::NotFound(format!(
                    "template \"{template_id}\" not found. Checked:\n  - {local}\n  - {remote}"
                )))
            }
        }
    }

    async fn create_container(
        &self,
        spec: &CreateContainerSpec,
    ) -> Result<CreatedInstance, SandboxError> {
        let image = self.resolve_image(&spec.template_id).await?;
        let labels = encode_labels(spec, Utc::now())?;
        let env: Vec<String> = spec
            .env_vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let port_key = self.port_key();
        let port_bindings = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some("0".to_string()),
            }]),
        )]);

        let config = Config {
            image: Some(image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        tracing::info!(
            sandbox_id = %spec.sandbox_id,
            image = %image,
            timeout_sec = spec.timeout_sec,
            "creating sandbox container"
        );

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.sandbox_id.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::Provision(format!("container create failed: {e}")))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.force_remove(&spec.sandbox_id).await;
            return Err(SandboxError::Provision(format!("container start failed: {e}")));
        }

        match self.host_port_of(&created.id).await {
            Ok(Some(host_port)) => Ok(CreatedInstance {
                instance_id: created.id,
                host_port,
            }),
            Ok(None) => {
                self.force_remove(&spec.sandbox_id).await;
                Err(SandboxError::Provision(format!(
                    "failed to get host port for {}",
                    spec.sandbox_id
                )))
            }
            Err(e) => {
                self.force_remove(&spec.sandbox_id).await;
                Err(e)
            }
        }
    }

    async fn start_container(&self, sandbox_id: &str) -> Result<u16, SandboxError> {
        match self
            .docker
            .start_container(sandbox_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            // Already running.
            Err(e) if status_code(&e) == Some(304) => {}
            Err(e) if status_code(&e) == Some(404) => {
                return Err(SandboxError::not_found(sandbox_id));
            }
            Err(e) => return Err(e.into()),
        }

        self.host_port_of(sandbox_id).await?.ok_or_else(|| {
            SandboxError::Backend(format!("failed to get host port after starting {sandbox_id}"))
        })
    }

    async fn stop_container(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        match self
            .docker
            .stop_container(sandbox_id, None::<StopContainerOptions>)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if status_code(&e) == Some(304) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(sandbox_id, Some(opts)).await {
            Ok(()) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            // Removal already in progress from a concurrent call.
            Err(e) if status_code(&e) == Some(409) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn inspect_sandbox(&self, sandbox_id: &str) -> Result<Option<Sandbox>, SandboxError> {
        match self
            .docker
            .inspect_container(sandbox_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(sandbox_from_inspect(
                &info,
                self.config.envd_port,
                self.config.default_timeout_sec,
            )),
            Err(e) if status_code(&e) == Some(404) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_sandboxes(&self, filter: ListFilter) -> Result<Vec<Sandbox>, SandboxError> {
        let opts = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![LABEL_SANDBOX_ID.to_string()])]),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        Ok(containers
            .iter()
            .filter_map(|c| {
                sandbox_from_summary(c, self.config.envd_port, self.config.default_timeout_sec)
            })
            .filter(|s| filter.state.is_none_or(|state| s.state == state))
            .collect())
    }
}

fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

// ── Label codec ─────────────────────────────────────────────────────

pub fn encode_labels(
    spec: &CreateContainerSpec,
    created_at: DateTime<Utc>,
) -> Result<HashMap<String, String>, SandboxError> {
    let mut labels = HashMap::from([
        (LABEL_SANDBOX_ID.to_string(), spec.sandbox_id.clone()),
        (LABEL_ACCESS_TOKEN.to_string(), spec.access_token.clone()),
        (LABEL_TEMPLATE_ID.to_string(), spec.template_id.clone()),
        (LABEL_CREATED_AT.to_string(), created_at.to_rfc3339()),
        (LABEL_TIMEOUT.to_string(), spec.timeout_sec.to_string()),
    ]);
    if let Some(metadata) = &spec.metadata {
        let json = serde_json::to_string(metadata)
            .map_err(|e| SandboxError::Serde(format!("failed to encode metadata: {e}")))?;
        labels.insert(LABEL_METADATA.to_string(), json);
    }
    Ok(labels)
}

/// Fields the labels do not carry, taken from the engine's own view.
struct EngineView {
    instance_id: String,
    created_at: Option<DateTime<Utc>>,
    host_port: u16,
    running: bool,
}

fn decode_labels(
    labels: &HashMap<String, String>,
    engine: EngineView,
    default_timeout_sec: u64,
) -> Option<Sandbox> {
    let sandbox_id = labels.get(LABEL_SANDBOX_ID)?.clone();

    let created_at = labels
        .get(LABEL_CREATED_AT)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|d| d.with_timezone(&Utc))
        .or(engine.created_at)
        .unwrap_or_else(Utc::now);

    let metadata = labels.get(LABEL_METADATA).and_then(|raw| {
        serde_json::from_str::<BTreeMap<String, String>>(raw)
            .map_err(|e| {
                tracing::warn!(sandbox_id = %sandbox_id, error = %e, "ignoring unparseable metadata label");
            })
            .ok()
    });

    Some(Sandbox {
        instance_id: engine.instance_id,
        access_token: labels.get(LABEL_ACCESS_TOKEN).cloned().unwrap_or_default(),
        template_id: labels
            .get(LABEL_TEMPLATE_ID)
            .cloned()
            .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
        created_at,
        timeout_sec: labels
            .get(LABEL_TIMEOUT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_timeout_sec),
        host_port: engine.host_port,
        state: if engine.running {
            SandboxState::Running
        } else {
            SandboxState::Paused
        },
        metadata,
        sandbox_id,
    })
}

fn inspect_host_port(info: &ContainerInspectResponse, envd_port: u16) -> Option<u16> {
    info.network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&format!("{envd_port}/tcp"))?
        .as_ref()?
        .iter()
        .find_map(|b| b.host_port.as_deref().and_then(|p| p.parse::<u16>().ok()))
        .filter(|p| *p != 0)
}

pub fn sandbox_from_inspect(
    info: &ContainerInspectResponse,
    envd_port: u16,
    default_timeout_sec: u64,
) -> Option<Sandbox> {
    let labels = info.config.as_ref()?.labels.as_ref()?;
    let engine = EngineView {
        instance_id: info.id.clone().unwrap_or_default(),
        created_at: info
            .created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|d| d.with_timezone(&Utc)),
        host_port: inspect_host_port(info, envd_port).unwrap_or(0),
        running: info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false),
    };
    decode_labels(labels, engine, default_timeout_sec)
}

pub fn sandbox_from_summary(
    c: &ContainerSummary,
    envd_port: u16,
    default_timeout_sec: u64,
) -> Option<Sandbox> {
    let labels = c.labels.as_ref()?;
    let host_port = c
        .ports
        .as_ref()
        .and_then(|ports| ports.iter().find(|p| p.private_port == envd_port))
        .and_then(|p| p.public_port)
        .unwrap_or(0);
    let engine = EngineView {
        instance_id: c.id.clone().unwrap_or_default(),
        created_at: c
            .created
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        host_port,
        running: c.state.as_deref() == Some("running"),
    };
    decode_labels(labels, engine, default_timeout_sec)
}
