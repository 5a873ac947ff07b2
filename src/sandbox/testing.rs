//! In-memory stand-ins for the backend and guest agent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::backend::ContainerBackend;
use super::error::SandboxError;
use super::guest_agent::{GuestAgent, InitRequest};
use super::types::*;

pub struct FakeBackend {
    supports_pause: bool,
    guest_token_auth: bool,
    durable: bool,
    sandboxes: Mutex<HashMap<SandboxId, Sandbox>>,
    next_port: AtomicU16,
    pub creates: AtomicU32,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub removes: AtomicU32,
    pub inspects: AtomicU32,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::with_caps(true, true)
    }

    pub fn with_caps(supports_pause: bool, guest_token_auth: bool) -> Self {
        Self {
            supports_pause,
            guest_token_auth,
            durable: true,
            sandboxes: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(40000),
            creates: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            removes: AtomicU32::new(0),
            inspects: AtomicU32::new(0),
        }
    }

    /// Behave like a backend whose instances die with the control plane.
    pub fn ephemeral(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn insert(&self, sandbox: Sandbox) {
        self.sandboxes
            .lock()
            .unwrap()
            .insert(sandbox.sandbox_id.clone(), sandbox);
    }

    pub fn get(&self, sandbox_id: &str) -> Option<Sandbox> {
        self.sandboxes.lock().unwrap().get(sandbox_id).cloned()
    }

    pub fn set_host_port(&self, sandbox_id: &str, host_port: u16) {
        if let Some(s) = self.sandboxes.lock().unwrap().get_mut(sandbox_id) {
            s.host_port = host_port;
        }
    }

    pub fn count(&self) -> usize {
        self.sandboxes.lock().unwrap().len()
    }
}

pub fn sandbox(
    sandbox_id: &str,
    created_at: DateTime<Utc>,
    timeout_sec: u64,
    state: SandboxState,
) -> Sandbox {
    Sandbox {
        sandbox_id: sandbox_id.to_string(),
        instance_id: format!("inst-{sandbox_id}"),
        access_token: format!("tok-{sandbox_id}"),
        template_id: DEFAULT_TEMPLATE.to_string(),
        created_at,
        timeout_sec,
        host_port: 40000,
        state,
        metadata: None,
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Docker,
            supports_pause: self.supports_pause,
            guest_token_auth: self.guest_token_auth,
            durable: self.durable,
        }
    }

    async fn resolve_image(&self, template_id: &str) -> Result<String, SandboxError> {
        if template_id == "missing" {
            return Err(SandboxError::NotFound(format!("template \"{template_id}\" not found")));
        }
        Ok(format!("sandbox-{template_id}:latest"))
    }

    async fn create_container(
        &self,
        spec: &CreateContainerSpec,
    ) -> Result<CreatedInstance, SandboxError> {
        self.resolve_image(&spec.template_id).await?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        let host_port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let sandbox = Sandbox {
            sandbox_id: spec.sandbox_id.clone(),
            instance_id: format!("inst-{}", spec.sandbox_id),
            access_token: spec.access_token.clone(),
            template_id: spec.template_id.clone(),
            created_at: Utc::now(),
            timeout_sec: spec.timeout_sec,
            host_port,
            state: SandboxState::Running,
            metadata: spec.metadata.clone(),
        };
        let instance_id = sandbox.instance_id.clone();
        self.insert(sandbox);
        Ok(CreatedInstance {
            instance_id,
            host_port,
        })
    }

    async fn start_container(&self, sandbox_id: &str) -> Result<u16, SandboxError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| SandboxError::not_found(sandbox_id))?;
        if sandbox.state == SandboxState::Paused && !self.supports_pause {
            return Err(SandboxError::Unsupported("resume".into()));
        }
        sandbox.state = SandboxState::Running;
        Ok(sandbox.host_port)
    }

    async fn stop_container(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        match self.sandboxes.lock().unwrap().get_mut(sandbox_id) {
            Some(s) => {
                s.state = SandboxState::Paused;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_container(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(self.sandboxes.lock().unwrap().remove(sandbox_id).is_some())
    }

    async fn inspect_sandbox(&self, sandbox_id: &str) -> Result<Option<Sandbox>, SandboxError> {
        self.inspects.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(sandbox_id))
    }

    async fn list_sandboxes(&self, filter: ListFilter) -> Result<Vec<Sandbox>, SandboxError> {
        let mut out: Vec<Sandbox> = self
            .sandboxes
            .lock()
            .unwrap()
            .values()
            .filter(|s| filter.state.is_none_or(|state| s.state == state))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        Ok(out)
    }
}

#[derive(Default)]
pub struct FakeGuest {
    pub unhealthy: AtomicBool,
    pub fail_init: AtomicBool,
    pub inits: Mutex<Vec<(u16, InitRequest)>>,
}

impl FakeGuest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_init(&self) -> Option<InitRequest> {
        self.inits.lock().unwrap().last().map(|(_, r)| r.clone())
    }

    pub fn init_count(&self) -> usize {
        self.inits.lock().unwrap().len()
    }
}

#[async_trait]
impl GuestAgent for FakeGuest {
    async fn wait_for_health(&self, _host_port: u16) -> Result<(), SandboxError> {
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(SandboxError::Timeout(std::time::Duration::from_millis(30_000)));
        }
        Ok(())
    }

    async fn init(&self, host_port: u16, req: &InitRequest) -> Result<(), SandboxError> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(SandboxError::GuestAgent {
                status: 500,
                body: "init failed".into(),
            });
        }
        self.inits.lock().unwrap().push((host_port, req.clone()));
        Ok(())
    }
}
