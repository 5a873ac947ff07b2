//! Shuru microVM backend.
//!
//! Each sandbox is a `shuru run` child process with envd as its entrypoint.
//! There is no durable record: the instance map lives in this process only,
//! so sandboxes do not survive a control-plane restart. Liveness comes from
//! polling the child handle, never from tracked state.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::sandbox::backend::ContainerBackend;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::*;

const CHECKPOINT_LIST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ShuruConfig {
    pub bin: PathBuf,
    pub envd_port: u16,
}

struct ShuruInstance {
    child: Child,
    pid: u32,
    host_port: u16,
    access_token: String,
    template_id: String,
    created_at: DateTime<Utc>,
    timeout_sec: u64,
    metadata: Option<BTreeMap<String, String>>,
}

impl ShuruInstance {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn to_sandbox(&self, sandbox_id: &str) -> Sandbox {
        Sandbox {
            sandbox_id: sandbox_id.to_string(),
            instance_id: self.pid.to_string(),
            access_token: self.access_token.clone(),
            template_id: self.template_id.clone(),
            created_at: self.created_at,
            timeout_sec: self.timeout_sec,
            host_port: self.host_port,
            state: SandboxState::Running,
            metadata: self.metadata.clone(),
        }
    }
}

pub struct ShuruBackend {
    config: ShuruConfig,
    instances: Mutex<HashMap<SandboxId, ShuruInstance>>,
}

impl ShuruBackend {
    pub fn new(config: ShuruConfig) -> Self {
        Self {
            config,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn instances(&self) -> std::sync::MutexGuard<'_, HashMap<SandboxId, ShuruInstance>> {
        self.instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn list_checkpoints(&self) -> Vec<String> {
        let output = Command::new(&self.config.bin)
            .args(["checkpoint", "list"])
            .stdin(Stdio::null())
            .output();

        match tokio::time::timeout(CHECKPOINT_LIST_TIMEOUT, output).await {
            Ok(Ok(out)) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            Ok(Ok(out)) => {
                tracing::warn!(status = %out.status, "shuru checkpoint list failed");
                Vec::new()
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to run shuru checkpoint list");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!("shuru checkpoint list timed out");
                Vec::new()
            }
        }
    }

    /// Take an instance out of the map and signal it if still alive.
    fn terminate(&self, sandbox_id: &str, sig: Signal) -> bool {
        let Some(mut instance) = self.instances().remove(sandbox_id) else {
            return false;
        };

        if instance.is_alive() {
            let sent = match sig {
                Signal::SIGKILL => instance.child.start_kill().map_err(|e| e.to_string()),
                _ => signal::kill(Pid::from_raw(instance.pid as i32), sig)
                    .map_err(|e| e.to_string()),
            };
            if let Err(e) = sent {
                tracing::debug!(sandbox_id = %sandbox_id, error = %e, "signal failed, process already gone");
            }
        }

        let id = sandbox_id.to_string();
        tokio::spawn(async move {
            match instance.child.wait().await {
                Ok(status) => tracing::debug!(sandbox_id = %id, %status, "shuru vm exited"),
                Err(e) => tracing::debug!(sandbox_id = %id, error = %e, "failed to reap shuru vm"),
            }
        });
        true
    }
}

pub fn checkpoint_name(template_id: &str) -> String {
    format!("sandbox-{template_id}")
}

fn find_free_port() -> Result<u16, SandboxError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[async_trait]
impl ContainerBackend for ShuruBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Shuru,
            supports_pause: false,
            guest_token_auth: false,
            durable: false,
        }
    }

    /// Empty string means "run the base VM without a checkpoint".
    async fn resolve_image(&self, template_id: &str) -> Result<String, SandboxError> {
        let name = checkpoint_name(template_id);
        if self
            .list_checkpoints()
            .await
            .iter()
            .any(|c| c.contains(&name))
        {
            return Ok(name);
        }

        if template_id == DEFAULT_TEMPLATE {
            return Ok(String::new());
        }

        Err(SandboxError::NotFound(format!(
            "template \"{template_id}\" not found. No shuru checkpoint \"{name}\" exists.\n\
             Create one with: shuru checkpoint create {name} --allow-net -- sh -c 'apk add ...'"
        )))
    }

    async fn create_container(
        &self,
        spec: &CreateContainerSpec,
    ) -> Result<CreatedInstance, SandboxError> {
        let image = self.resolve_image(&spec.template_id).await?;
        let host_port = find_free_port()?;

        let mut cmd = Command::new(&self.config.bin);
        cmd.arg("run");
        if !image.is_empty() {
            cmd.args(["--from", &image]);
        }
        cmd.arg("-p")
            .arg(format!("{host_port}:{}", self.config.envd_port))
            .arg("--allow-net")
            .args(["--", "envd", "-isnotfc"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            SandboxError::Provision(format!(
                "failed to spawn {}: {e}",
                self.config.bin.display()
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Provision("shuru exited before reporting a pid".into()))?;

        tracing::info!(
            sandbox_id = %spec.sandbox_id,
            pid,
            host_port,
            checkpoint = %image,
            "spawned shuru vm"
        );

        self.instances().insert(
            spec.sandbox_id.clone(),
            ShuruInstance {
                child,
                pid,
                host_port,
                access_token: spec.access_token.clone(),
                template_id: spec.template_id.clone(),
                created_at: Utc::now(),
                timeout_sec: spec.timeout_sec,
                metadata: spec.metadata.clone(),
            },
        );

        Ok(CreatedInstance {
            instance_id: pid.to_string(),
            host_port,
        })
    }

    async fn start_container(&self, sandbox_id: &str) -> Result<u16, SandboxError> {
        if let Some(instance) = self.instances().get_mut(sandbox_id) {
            if instance.is_alive() {
                return Ok(instance.host_port);
            }
        }
        Err(SandboxError::Unsupported(format!(
            "cannot resume shuru sandbox \"{sandbox_id}\". Shuru VMs are ephemeral: once stopped, \
             the VM is destroyed. Create a new sandbox instead."
        )))
    }

    async fn stop_container(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        Ok(self.terminate(sandbox_id, Signal::SIGTERM))
    }

    async fn remove_container(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        Ok(self.terminate(sandbox_id, Signal::SIGKILL))
    }

    async fn inspect_sandbox(&self, sandbox_id: &str) -> Result<Option<Sandbox>, SandboxError> {
        let mut instances = self.instances();
        let Some(instance) = instances.get_mut(sandbox_id) else {
            return Ok(None);
        };
        if !instance.is_alive() {
            instances.remove(sandbox_id);
            tracing::debug!(sandbox_id = %sandbox_id, "reaped dead shuru vm");
            return Ok(None);
        }
        Ok(Some(instance.to_sandbox(sandbox_id)))
    }

    async fn list_sandboxes(&self, filter: ListFilter) -> Result<Vec<Sandbox>, SandboxError> {
        let mut instances = self.instances();
        instances.retain(|_, instance| instance.is_alive());

        // Live VMs are always running.
        if filter.state.is_some_and(|s| s != SandboxState::Running) {
            return Ok(Vec::new());
        }
        Ok(instances
            .iter()
            .map(|(id, instance)| instance.to_sandbox(id))
            .collect())
    }
}
