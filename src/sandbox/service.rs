//! Sandbox orchestrator.
//!
//! Owns the lifecycle state machine (absent → provisioning → running ⇄
//! paused → absent) on top of one backend, the guest agent client, the TTL
//! registry and the proxy caches. Holds no durable state of its own:
//! every read goes through to the backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::backend::ContainerBackend;
use super::error::SandboxError;
use super::guest_agent::{GuestAgent, InitRequest};
use super::ids;
use super::ttl::TtlRegistry;
use super::types::*;
use crate::proxy::ProxyRouter;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub default_timeout_sec: u64,
    pub max_timeout_sec: u64,
    pub default_user: String,
    pub envd_version: String,
}

pub struct SandboxService {
    backend: Arc<dyn ContainerBackend>,
    guest: Arc<dyn GuestAgent>,
    ttl: TtlRegistry,
    proxy: Arc<ProxyRouter>,
    config: ServiceConfig,
}

impl SandboxService {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        guest: Arc<dyn GuestAgent>,
        ttl: TtlRegistry,
        proxy: Arc<ProxyRouter>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            backend,
            guest,
            ttl,
            proxy,
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ContainerBackend> {
        &self.backend
    }

    pub fn ttl(&self) -> &TtlRegistry {
        &self.ttl
    }

    pub fn proxy(&self) -> &Arc<ProxyRouter> {
        &self.proxy
    }

    fn clamp_timeout(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.config.default_timeout_sec)
            .min(self.config.max_timeout_sec)
    }

    fn credentials(&self, sandbox_id: &str, template_id: &str, token: &str) -> SandboxCredentials {
        SandboxCredentials {
            sandbox_id: sandbox_id.to_string(),
            template_id: template_id.to_string(),
            access_token: token.to_string(),
            envd_version: self.config.envd_version.clone(),
        }
    }

    /// Health then init. The token is only pushed to guests that enforce it.
    async fn bootstrap_guest(
        &self,
        host_port: u16,
        access_token: &str,
        env_vars: &std::collections::BTreeMap<String, String>,
    ) -> Result<(), SandboxError> {
        self.guest.wait_for_health(host_port).await?;
        let req = InitRequest {
            default_user: self.config.default_user.clone(),
            env_vars: env_vars.clone(),
            access_token: self
                .backend
                .info()
                .guest_token_auth
                .then(|| access_token.to_string()),
        };
        self.guest.init(host_port, &req).await
    }

    /// Kill path run when a sandbox's TTL expires.
    fn on_expire(self: &Arc<Self>, sandbox_id: &str) -> impl Future<Output = ()> + Send + use<> {
        let service = Arc::downgrade(self);
        let id = sandbox_id.to_string();
        async move {
            let Some(service) = service.upgrade() else {
                return;
            };
            match service.kill(&id).await {
                Ok(removed) => tracing::info!(sandbox_id = %id, removed, "expired sandbox killed"),
                Err(e) => tracing::error!(sandbox_id = %id, error = %e, "failed to kill expired sandbox"),
            }
        }
    }

    /// Arm (or replace) the expiry timer that kills `sandbox_id`.
    pub fn arm_ttl(self: &Arc<Self>, sandbox_id: &str, ttl: Duration) {
        self.ttl.start(sandbox_id, ttl, self.on_expire(sandbox_id));
    }

    pub async fn create(
        self: &Arc<Self>,
        req: CreateRequest,
    ) -> Result<SandboxCredentials, SandboxError> {
        let sandbox_id = ids::generate_sandbox_id()?;
        let access_token = ids::generate_access_token()?;
        let template_id = req
            .template_id
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());
        let timeout_sec = self.clamp_timeout(req.timeout_sec);

        let spec = CreateContainerSpec {
            sandbox_id: sandbox_id.clone(),
            access_token: access_token.clone(),
            template_id: template_id.clone(),
            timeout_sec,
            env_vars: req.env_vars,
            metadata: req.metadata,
        };
        let created = self.backend.create_container(&spec).await?;

        if let Err(e) = self
            .bootstrap_guest(created.host_port, &access_token, &spec.env_vars)
            .await
        {
            tracing::warn!(sandbox_id = %sandbox_id, error = %e, "guest bootstrap failed, removing instance");
            if let Err(cleanup) = self.backend.remove_container(&sandbox_id).await {
                tracing::error!(sandbox_id = %sandbox_id, error = %cleanup, "compensating remove failed");
            }
            return Err(e);
        }

        self.proxy.register_token(&access_token, &sandbox_id);
        self.arm_ttl(&sandbox_id, Duration::from_secs(timeout_sec));

        tracing::info!(
            sandbox_id = %sandbox_id,
            template_id = %template_id,
            instance_id = %created.instance_id,
            host_port = created.host_port,
            timeout_sec,
            "sandbox created"
        );
        Ok(self.credentials(&sandbox_id, &template_id, &access_token))
    }

    pub async fn get_info(&self, sandbox_id: &str) -> Result<Option<SandboxDetail>, SandboxError> {
        Ok(self
            .backend
            .inspect_sandbox(sandbox_id)
            .await?
            .map(|s| self.detail(s)))
    }

    fn detail(&self, s: Sandbox) -> SandboxDetail {
        SandboxDetail {
            end_at: s.end_at(),
            started_at: s.created_at,
            envd_version: self.config.envd_version.clone(),
            sandbox_id: s.sandbox_id,
            template_id: s.template_id,
            state: s.state,
            metadata: s.metadata,
        }
    }

    /// Idempotent: `Ok(false)` when there was nothing left to remove.
    pub async fn kill(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        self.ttl.clear(sandbox_id);
        self.proxy.evict(sandbox_id);
        let removed = self.backend.remove_container(sandbox_id).await?;
        if removed {
            tracing::info!(sandbox_id = %sandbox_id, "sandbox killed");
        }
        Ok(removed)
    }

    /// A paused sandbox has no TTL.
    pub async fn pause(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        if !self.backend.info().supports_pause {
            return Err(SandboxError::Unsupported(format!(
                "pause is not supported by the {} backend",
                self.backend.info().kind
            )));
        }
        self.ttl.clear(sandbox_id);
        self.proxy.evict(sandbox_id);
        let stopped = self.backend.stop_container(sandbox_id).await?;
        if stopped {
            tracing::info!(sandbox_id = %sandbox_id, "sandbox paused");
        }
        Ok(stopped)
    }

    /// Start (or confirm) the instance, re-run health/init and re-arm TTL.
    ///
    /// A failure after start leaves the instance in place: it existed
    /// before this call and still carries its own record.
    pub async fn connect(
        self: &Arc<Self>,
        sandbox_id: &str,
        timeout_sec: Option<u64>,
    ) -> Result<ConnectOutcome, SandboxError> {
        let sandbox = self
            .backend
            .inspect_sandbox(sandbox_id)
            .await?
            .ok_or_else(|| SandboxError::not_found(sandbox_id))?;
        let resumed = sandbox.state == SandboxState::Paused;

        let host_port = self.backend.start_container(sandbox_id).await?;
        self.bootstrap_guest(host_port, &sandbox.access_token, &Default::default())
            .await?;

        self.proxy.register_token(&sandbox.access_token, sandbox_id);
        let timeout_sec = self.clamp_timeout(timeout_sec);
        self.arm_ttl(sandbox_id, Duration::from_secs(timeout_sec));

        tracing::info!(sandbox_id = %sandbox_id, resumed, host_port, timeout_sec, "sandbox connected");
        Ok(ConnectOutcome {
            credentials: self.credentials(sandbox_id, &sandbox.template_id, &sandbox.access_token),
            resumed,
        })
    }

    pub async fn set_timeout(
        self: &Arc<Self>,
        sandbox_id: &str,
        timeout_sec: u64,
    ) -> Result<(), SandboxError> {
        if self.backend.inspect_sandbox(sandbox_id).await?.is_none() {
            return Err(SandboxError::not_found(sandbox_id));
        }
        let timeout_sec = self.clamp_timeout(Some(timeout_sec));
        self.ttl.update(
            sandbox_id,
            Duration::from_secs(timeout_sec),
            self.on_expire(sandbox_id),
        );
        tracing::debug!(sandbox_id = %sandbox_id, timeout_sec, "sandbox timeout updated");
        Ok(())
    }

    pub async fn list(&self, filters: &ListFilters) -> Result<Vec<SandboxDetail>, SandboxError> {
        let filter = ListFilter {
            state: SandboxState::parse_filter(filters.state.as_deref()),
        };
        let sandboxes = self.backend.list_sandboxes(filter).await?;
        Ok(sandboxes
            .into_iter()
            .filter(|s| matches_metadata(s, filters))
            .map(|s| self.detail(s))
            .collect())
    }

    /// Cancel every timer. On a backend without a durable store, also
    /// remove every instance it still lists.
    pub async fn shutdown(&self) -> usize {
        self.ttl.clear_all();
        if self.backend.info().durable {
            return 0;
        }

        let sandboxes = match self.backend.list_sandboxes(ListFilter::default()).await {
            Ok(sandboxes) => sandboxes,
            Err(e) => {
                tracing::error!(error = %e, "failed to list sandboxes at shutdown");
                return 0;
            }
        };
        let mut removed = 0;
        for sandbox in sandboxes {
            match self.kill(&sandbox.sandbox_id).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(sandbox_id = %sandbox.sandbox_id, error = %e, "failed to remove sandbox at shutdown")
                }
            }
        }
        tracing::info!(removed, "removed non-durable sandboxes");
        removed
    }
}

fn matches_metadata(s: &Sandbox, filters: &ListFilters) -> bool {
    if filters.metadata.is_empty() {
        return true;
    }
    let Some(metadata) = &s.metadata else {
        return false;
    };
    filters
        .metadata
        .iter()
        .all(|(k, v)| metadata.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    use chrono::Utc;

    use crate::sandbox::testing::{FakeBackend, FakeGuest, sandbox};

    struct Harness {
        backend: Arc<FakeBackend>,
        guest: Arc<FakeGuest>,
        service: Arc<SandboxService>,
    }

    fn harness_with(backend: FakeBackend) -> Harness {
        let backend = Arc::new(backend);
        let guest = Arc::new(FakeGuest::new());
        let proxy = Arc::new(ProxyRouter::new(backend.clone()).unwrap());
        let service = Arc::new(SandboxService::new(
            backend.clone(),
            guest.clone(),
            TtlRegistry::new(),
            proxy,
            ServiceConfig {
                default_timeout_sec: 300,
                max_timeout_sec: 3600,
                default_user: "user".into(),
                envd_version: "0.5.3".into(),
            },
        ));
        Harness {
            backend,
            guest,
            service,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeBackend::new())
    }

    #[tokio::test]
    async fn create_returns_credentials_and_arms_ttl() {
        let h = harness();
        let creds = h.service.create(CreateRequest::default()).await.unwrap();

        assert!(creds.sandbox_id.starts_with("sbx-"));
        assert_eq!(creds.template_id, "base");
        assert_eq!(creds.envd_version, "0.5.3");
        assert_eq!(creds.access_token.len(), 32);

        assert!(h.service.ttl().contains(&creds.sandbox_id));
        assert_eq!(
            h.service.proxy().lookup_token(&creds.access_token).as_deref(),
            Some(creds.sandbox_id.as_str())
        );
        let stored = h.backend.get(&creds.sandbox_id).unwrap();
        assert_eq!(stored.timeout_sec, 300);
        assert_eq!(stored.access_token, creds.access_token);
    }

    #[tokio::test]
    async fn create_clamps_timeout_to_maximum() {
        let h = harness();
        let creds = h
            .service
            .create(CreateRequest {
                timeout_sec: Some(99_999),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(h.backend.get(&creds.sandbox_id).unwrap().timeout_sec, 3600);
    }

    #[tokio::test]
    async fn init_carries_env_and_token_for_enforcing_guests() {
        let h = harness();
        let creds = h
            .service
            .create(CreateRequest {
                env_vars: BTreeMap::from([("A".to_string(), "1".to_string())]),
                ..Default::default()
            })
            .await
            .unwrap();

        let init = h.guest.last_init().unwrap();
        assert_eq!(init.default_user, "user");
        assert_eq!(init.env_vars["A"], "1");
        assert_eq!(init.access_token, Some(creds.access_token));
    }

    #[tokio::test]
    async fn init_omits_token_when_guest_does_not_enforce_it() {
        let h = harness_with(FakeBackend::with_caps(false, false));
        h.service.create(CreateRequest::default()).await.unwrap();
        assert_eq!(h.guest.last_init().unwrap().access_token, None);
    }

    #[tokio::test]
    async fn failed_health_removes_instance() {
        let h = harness();
        h.guest.unhealthy.store(true, Ordering::SeqCst);

        let err = h.service.create(CreateRequest::default()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
        assert_eq!(h.backend.removes.load(Ordering::SeqCst), 1);
        assert!(h.service.list(&ListFilters::default()).await.unwrap().is_empty());
        assert_eq!(h.service.ttl().len(), 0);
    }

    #[tokio::test]
    async fn failed_init_removes_instance() {
        let h = harness();
        h.guest.fail_init.store(true, Ordering::SeqCst);

        let err = h.service.create(CreateRequest::default()).await.unwrap_err();
        assert!(matches!(err, SandboxError::GuestAgent { status: 500, .. }));
        assert_eq!(h.backend.count(), 0);
    }

    #[tokio::test]
    async fn unknown_template_fails_before_provisioning() {
        let h = harness();
        let err = h
            .service
            .create(CreateRequest {
                template_id: Some("missing".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
        assert_eq!(h.backend.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn kill_twice_is_idempotent() {
        let h = harness();
        let creds = h.service.create(CreateRequest::default()).await.unwrap();

        assert!(h.service.kill(&creds.sandbox_id).await.unwrap());
        assert!(!h.service.kill(&creds.sandbox_id).await.unwrap());
        assert!(!h.service.ttl().contains(&creds.sandbox_id));
        assert_eq!(h.service.proxy().lookup_token(&creds.access_token), None);
        assert_eq!(h.service.proxy().cached_port(&creds.sandbox_id), None);
    }

    #[tokio::test]
    async fn concurrent_kills_remove_once() {
        let h = harness();
        let creds = h.service.create(CreateRequest::default()).await.unwrap();

        let (a, b) = tokio::join!(
            h.service.kill(&creds.sandbox_id),
            h.service.kill(&creds.sandbox_id)
        );
        let mut results = [a.unwrap(), b.unwrap()];
        results.sort();
        assert_eq!(results, [false, true]);
    }

    #[tokio::test]
    async fn pause_without_capability_never_stops() {
        let h = harness_with(FakeBackend::with_caps(false, false));
        let creds = h.service.create(CreateRequest::default()).await.unwrap();

        let err = h.service.pause(&creds.sandbox_id).await.unwrap_err();
        assert!(matches!(err, SandboxError::Unsupported(_)));
        assert_eq!(h.backend.stops.load(Ordering::SeqCst), 0);
        assert!(h.service.ttl().contains(&creds.sandbox_id));
    }

    #[tokio::test]
    async fn pause_clears_ttl_and_caches() {
        let h = harness();
        let creds = h.service.create(CreateRequest::default()).await.unwrap();

        assert!(h.service.pause(&creds.sandbox_id).await.unwrap());
        assert!(!h.service.ttl().contains(&creds.sandbox_id));
        assert_eq!(h.service.proxy().lookup_token(&creds.access_token), None);
        assert_eq!(
            h.backend.get(&creds.sandbox_id).unwrap().state,
            SandboxState::Paused
        );
        assert!(!h.service.pause("sbx-unknown").await.unwrap());
    }

    #[tokio::test]
    async fn connect_unknown_never_starts() {
        let h = harness();
        let err = h.service.connect("sbx-nope", None).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
        assert_eq!(h.backend.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connect_resumes_paused_sandbox() {
        let h = harness();
        let creds = h.service.create(CreateRequest::default()).await.unwrap();
        h.service.pause(&creds.sandbox_id).await.unwrap();

        let outcome = h
            .service
            .connect(&creds.sandbox_id, Some(120))
            .await
            .unwrap();
        assert!(outcome.resumed);
        assert_eq!(outcome.credentials, creds);
        assert!(h.service.ttl().contains(&creds.sandbox_id));
        assert_eq!(h.guest.init_count(), 2);
        assert_eq!(
            h.service.proxy().lookup_token(&creds.access_token).as_deref(),
            Some(creds.sandbox_id.as_str())
        );
    }

    #[tokio::test]
    async fn connect_running_sandbox_is_not_a_resume() {
        let h = harness();
        let creds = h.service.create(CreateRequest::default()).await.unwrap();
        let outcome = h.service.connect(&creds.sandbox_id, None).await.unwrap();
        assert!(!outcome.resumed);
        assert_eq!(h.backend.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_propagates_unsupported_resume() {
        let h = harness_with(FakeBackend::with_caps(false, false));
        h.backend
            .insert(sandbox("sbx-stopped", Utc::now(), 60, SandboxState::Paused));

        let err = h.service.connect("sbx-stopped", None).await.unwrap_err();
        assert!(matches!(err, SandboxError::Unsupported(_)));
        assert_eq!(h.backend.removes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn set_timeout_requires_known_sandbox() {
        let h = harness();
        let err = h.service.set_timeout("sbx-nope", 10).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
        assert_eq!(h.service.ttl().len(), 0);

        h.backend
            .insert(sandbox("sbx-a", Utc::now(), 60, SandboxState::Running));
        h.service.set_timeout("sbx-a", 10).await.unwrap();
        assert!(h.service.ttl().contains("sbx-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_kills_sandbox() {
        let h = harness();
        let creds = h
            .service
            .create(CreateRequest {
                timeout_sec: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(h.backend.get(&creds.sandbox_id).is_none());
        assert_eq!(h.service.proxy().lookup_token(&creds.access_token), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_timeout_replaces_deadline() {
        let h = harness();
        let creds = h
            .service
            .create(CreateRequest {
                timeout_sec: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        h.service.set_timeout(&creds.sandbox_id, 20).await.unwrap();

        tokio::time::advance(Duration::from_secs(19)).await;
        tokio::task::yield_now().await;
        assert!(h.backend.get(&creds.sandbox_id).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(h.backend.get(&creds.sandbox_id).is_none());
    }

    #[tokio::test]
    async fn list_filters_state_and_metadata() {
        let h = harness();
        let now = Utc::now();
        let mut a = sandbox("sbx-a", now, 60, SandboxState::Running);
        a.metadata = Some(BTreeMap::from([
            ("team".to_string(), "ml".to_string()),
            ("env".to_string(), "dev".to_string()),
        ]));
        let mut b = sandbox("sbx-b", now, 60, SandboxState::Paused);
        b.metadata = Some(BTreeMap::from([("team".to_string(), "ml".to_string())]));
        h.backend.insert(a);
        h.backend.insert(b);
        h.backend.insert(sandbox("sbx-c", now, 60, SandboxState::Running));

        let all = h.service.list(&ListFilters::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let bogus_state = ListFilters {
            state: Some("sleeping".into()),
            ..Default::default()
        };
        assert_eq!(h.service.list(&bogus_state).await.unwrap().len(), 3);

        let running = ListFilters {
            state: Some("running".into()),
            ..Default::default()
        };
        assert_eq!(h.service.list(&running).await.unwrap().len(), 2);

        let ml_dev = ListFilters {
            state: None,
            metadata: BTreeMap::from([
                ("team".to_string(), "ml".to_string()),
                ("env".to_string(), "dev".to_string()),
            ]),
        };
        let found = h.service.list(&ml_dev).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sandbox_id, "sbx-a");
    }

    #[tokio::test]
    async fn get_info_computes_end_at() {
        let h = harness();
        let now = Utc::now();
        h.backend
            .insert(sandbox("sbx-a", now, 90, SandboxState::Running));

        let detail = h.service.get_info("sbx-a").await.unwrap().unwrap();
        assert_eq!(detail.started_at, now);
        assert_eq!(detail.end_at, now + chrono::Duration::seconds(90));
        assert!(h.service.get_info("sbx-none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_removes_ephemeral_sandboxes() {
        let h = harness_with(FakeBackend::new().ephemeral());
        let a = h.service.create(CreateRequest::default()).await.unwrap();
        h.service.create(CreateRequest::default()).await.unwrap();

        assert_eq!(h.service.shutdown().await, 2);
        assert_eq!(h.backend.count(), 0);
        assert_eq!(h.service.ttl().len(), 0);
        assert!(h.service.proxy().lookup_token(&a.access_token).is_none());
    }

    #[tokio::test]
    async fn shutdown_keeps_durable_sandboxes() {
        let h = harness();
        h.service.create(CreateRequest::default()).await.unwrap();

        assert_eq!(h.service.shutdown().await, 0);
        assert_eq!(h.backend.count(), 1);
        assert_eq!(h.service.ttl().len(), 0);
        assert_eq!(h.backend.removes.load(Ordering::SeqCst), 0);
    }
}
