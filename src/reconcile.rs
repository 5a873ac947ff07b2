use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::sandbox::{ListFilter, SandboxError, SandboxService, SandboxState};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub rearmed: usize,
    pub expired: usize,
}

/// Re-arm TTLs for sandboxes that outlived a control-plane restart.
///
/// Anything whose `created_at + timeout_sec` already passed is killed
/// right away. Survivors get a timer for the remainder and their access
/// token back in the proxy cache.
pub async fn reconcile_ttls(
    service: &Arc<SandboxService>,
    now: DateTime<Utc>,
) -> Result<ReconcileReport, SandboxError> {
    let running = service
        .backend()
        .list_sandboxes(ListFilter {
            state: Some(SandboxState::Running),
        })
        .await?;

    let mut report = ReconcileReport::default();
    for sandbox in running {
        let remaining = (sandbox.end_at() - now).to_std().ok().filter(|d| !d.is_zero());
        match remaining {
            Some(remaining) => {
                service.arm_ttl(&sandbox.sandbox_id, remaining);
                service
                    .proxy()
                    .register_token(&sandbox.access_token, &sandbox.sandbox_id);
                report.rearmed += 1;
                tracing::debug!(
                    sandbox_id = %sandbox.sandbox_id,
                    instance_id = %sandbox.instance_id,
                    remaining_secs = remaining.as_secs(),
                    "re-armed sandbox TTL"
                );
            }
            None => {
                report.expired += 1;
                match service.kill(&sandbox.sandbox_id).await {
                    Ok(_) => {
                        tracing::info!(sandbox_id = %sandbox.sandbox_id, "killed sandbox expired during downtime")
                    }
                    Err(e) => {
                        tracing::error!(sandbox_id = %sandbox.sandbox_id, error = %e, "failed to kill expired sandbox")
                    }
                }
            }
        }
    }

    tracing::info!(
        rearmed = report.rearmed,
        expired = report.expired,
        tracked = service.ttl().len(),
        "reconciled sandbox TTLs"
    );
    Ok(report)
}
