pub mod backend;
pub mod backends;
pub mod error;
pub mod guest_agent;
pub mod ids;
pub mod retry;
pub mod service;
pub mod ttl;
pub mod types;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;

pub use backend::ContainerBackend;
pub use error::SandboxError;
pub use service::{SandboxService, ServiceConfig};
pub use types::*;

use crate::config::{Config, ENVD_PORT};
use backends::{DockerBackend, DockerConfig, ShuruBackend, ShuruConfig};

/// Build the backend selected by `SANDBOX_BACKEND`.
pub fn build_backend(config: &Config) -> Result<Arc<dyn ContainerBackend>, SandboxError> {
    match config.backend.parse::<BackendKind>()? {
        BackendKind::Docker => {
            tracing::info!(
                socket = %config.docker_socket,
                registry = %config.image_registry,
                "initializing docker sandbox backend"
            );
            Ok(Arc::new(DockerBackend::new(DockerConfig {
                socket_path: config.docker_socket.clone(),
                registry: config.image_registry.clone(),
                envd_port: ENVD_PORT,
                default_timeout_sec: config.default_timeout_sec,
            })?))
        }
        BackendKind::Shuru => {
            tracing::info!(
                bin = %config.shuru_bin.display(),
                "initializing shuru sandbox backend"
            );
            Ok(Arc::new(ShuruBackend::new(ShuruConfig {
                bin: config.shuru_bin.clone(),
                envd_port: ENVD_PORT,
            })))
        }
    }
}
