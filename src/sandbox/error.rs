use std::io;
use std::time::Duration;

/// Errors from sandbox operations.
///
/// Backends map their internal errors into these variants.
/// `Unsupported` is the expected return for capability-gated operations
/// the selected backend does not implement (pause on shuru, resuming a
/// stopped microVM). The API layer answers 501 for it and 404 for
/// `NotFound`.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("{0}")]
    NotFound(String),

    #[error("provision failed: {0}")]
    Provision(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("guest agent returned {status}: {body}")]
    GuestAgent { status: u16, body: String },

    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    pub fn not_found(sandbox_id: &str) -> Self {
        Self::NotFound(format!("sandbox {sandbox_id} not found"))
    }
}
