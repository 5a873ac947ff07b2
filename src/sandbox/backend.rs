use async_trait::async_trait;

use super::error::SandboxError;
use super::types::{BackendInfo, CreateContainerSpec, CreatedInstance, ListFilter, Sandbox};

/// Provisioning engine behind the orchestrator.
///
/// One backend instance is chosen at startup and shared through `AppState`.
/// The backend owns the durable record of each sandbox (container labels,
/// or an in-memory instance table); callers never cache it as truth.
///
/// `stop_container` and `remove_container` return `Ok(false)` for an
/// unknown id instead of failing, so concurrent duplicates stay harmless.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Backend kind and capability flags.
    fn info(&self) -> BackendInfo;

    /// Resolve a template id to something the backend can boot.
    async fn resolve_image(&self, template_id: &str) -> Result<String, SandboxError>;

    /// Provision and start a new instance, returning its guest-agent host port.
    async fn create_container(
        &self,
        spec: &CreateContainerSpec,
    ) -> Result<CreatedInstance, SandboxError>;

    /// Start (or keep running) an existing instance.
    async fn start_container(&self, sandbox_id: &str) -> Result<u16, SandboxError>;

    async fn stop_container(&self, sandbox_id: &str) -> Result<bool, SandboxError>;

    async fn remove_container(&self, sandbox_id: &str) -> Result<bool, SandboxError>;

    async fn inspect_sandbox(&self, sandbox_id: &str) -> Result<Option<Sandbox>, SandboxError>;

    async fn list_sandboxes(&self, filter: ListFilter) -> Result<Vec<Sandbox>, SandboxError>;
}
