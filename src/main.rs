mod api;
mod config;
mod proxy;
mod reconcile;
mod sandbox;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, DEFAULT_USER, ENVD_VERSION};
use crate::proxy::ProxyRouter;
use crate::sandbox::guest_agent::EnvdClient;
use crate::sandbox::retry::PollOptions;
use crate::sandbox::ttl::TtlRegistry;
use crate::sandbox::{SandboxService, ServiceConfig};

#[derive(Parser)]
#[command(name = "sandboxd", about = "E2B-compatible sandbox control plane")]
enum Cli {
    /// Start the control plane (default when no subcommand is given)
    Serve {
        /// Listen port, overrides PORT
        #[arg(long)]
        port: Option<u16>,
        /// Sandbox backend (docker or shuru), overrides SANDBOX_BACKEND
        #[arg(long)]
        backend: Option<String>,
    },
    /// Report whether a control plane is up and how many sandboxes it manages
    Status {
        /// Control plane URL
        #[arg(long, default_value = "http://localhost:49982")]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but still allow
    // --help and --version to work.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve {
            port: None,
            backend: None,
        }
    } else {
        Cli::parse()
    };

    match cli {
        Cli::Serve { port, backend } => {
            let mut config = Config::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(backend) = backend {
                config.backend = backend;
            }
            run_server(config).await
        }
        Cli::Status { server } => run_status(Config::from_env(), &server).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sandboxd=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();
}

async fn run_server(mut config: Config) -> Result<()> {
    init_tracing();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    if config.api_keys.is_empty() {
        let key = sandbox::ids::generate_api_key().context("failed to generate API key")?;
        println!("API Key: {key}\n");
        config.api_keys.push(key);
    }

    let backend = sandbox::build_backend(&config).context("failed to initialize sandbox backend")?;
    let guest = EnvdClient::new(
        "127.0.0.1",
        PollOptions {
            timeout: config.envd_health_timeout,
            interval: config.envd_health_interval,
        },
    )
    .context("failed to build envd client")?;
    let proxy = Arc::new(ProxyRouter::new(backend.clone()).context("failed to build proxy")?);
    let service = Arc::new(SandboxService::new(
        backend,
        Arc::new(guest),
        TtlRegistry::new(),
        proxy,
        ServiceConfig {
            default_timeout_sec: config.default_timeout_sec,
            max_timeout_sec: config.max_timeout_sec,
            default_user: DEFAULT_USER.to_string(),
            envd_version: ENVD_VERSION.to_string(),
        },
    ));

    if let Err(e) = reconcile::reconcile_ttls(&service, chrono::Utc::now()).await {
        tracing::error!(error = %e, "startup TTL reconciliation failed");
    }

    let app_state = api::AppState {
        service: service.clone(),
        api_keys: Arc::new(config.api_keys.clone()),
        domain: config.domain.clone(),
    };

    let app = api::build_router(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    println!("Control plane listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    tracing::info!("control plane stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

async fn run_status(config: Config, server: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .context("failed to build HTTP client")?;
    let base = server.trim_end_matches('/');

    let health = match client.get(format!("{base}/health")).send().await {
        Ok(resp) if resp.status().is_success() => "healthy".to_string(),
        Ok(resp) => format!("unhealthy ({})", resp.status().as_u16()),
        Err(_) => "unreachable".to_string(),
    };

    let sandboxes = match config.api_keys.first() {
        Some(key) => match client
            .get(format!("{base}/sandboxes"))
            .header(api::middleware::API_KEY_HEADER, key)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp
                .json::<Vec<serde_json::Value>>()
                .await
                .map(|items| items.len().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            _ => "unknown".to_string(),
        },
        None => "unknown (API_KEYS not set)".to_string(),
    };

    println!("Control plane:  {health}");
    println!("Sandboxes:      {sandboxes}");
    Ok(())
}
