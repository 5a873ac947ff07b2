use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use super::error::SandboxError;

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

/// Run `probe` until it succeeds or the budget runs out.
///
/// A retry is only scheduled when a full interval still fits before the
/// deadline; otherwise this fails right away with `SandboxError::Timeout`
/// carrying the configured budget.
pub async fn poll_until<T, E, F, Fut>(mut probe: F, opts: PollOptions) -> Result<T, SandboxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = Instant::now();
    let deadline = start + opts.timeout;
    let mut attempts = 0u32;

    while Instant::now() < deadline {
        attempts += 1;
        match probe().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if Instant::now() + opts.interval >= deadline {
                    tracing::debug!(attempts, error = %e, "poll budget exhausted");
                    return Err(SandboxError::Timeout(opts.timeout));
                }
                tracing::trace!(attempts, error = %e, "probe failed, retrying");
                tokio::time::sleep(opts.interval).await;
            }
        }
    }

    Err(SandboxError::Timeout(opts.timeout))
}
