use std::path::PathBuf;
use std::time::Duration;

/// Guest agent (envd) port inside every sandbox.
pub const ENVD_PORT: u16 = 49983;
pub const ENVD_VERSION: &str = "0.5.3";
pub const DEFAULT_USER: &str = "user";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub api_keys: Vec<String>,
    pub backend: String,
    pub docker_socket: String,
    pub shuru_bin: PathBuf,
    pub image_registry: String,
    pub default_timeout_sec: u64,
    pub max_timeout_sec: u64,
    pub envd_health_timeout: Duration,
    pub envd_health_interval: Duration,
    pub domain: Option<String>,
    pub sentry_dsn: Option<String>,
    pub environment: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from an arbitrary key lookup.
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            non_empty(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let port = non_empty("PORT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(49982);

        let api_keys = get("API_KEYS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(String::from)
            .collect();

        Config {
            port,
            api_keys,
            backend: non_empty("SANDBOX_BACKEND").unwrap_or_else(|| "docker".to_string()),
            docker_socket: non_empty("DOCKER_SOCKET")
                .unwrap_or_else(|| "/var/run/docker.sock".to_string()),
            shuru_bin: non_empty("SHURU_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("shuru")),
            image_registry: non_empty("IMAGE_REGISTRY")
                .unwrap_or_else(|| "ghcr.io/circlesac".to_string()),
            default_timeout_sec: number("DEFAULT_TIMEOUT_SEC", 300),
            max_timeout_sec: number("MAX_TIMEOUT_SEC", 3600),
            envd_health_timeout: Duration::from_millis(number("ENVD_HEALTH_TIMEOUT_MS", 30_000)),
            envd_health_interval: Duration::from_millis(number("ENVD_HEALTH_INTERVAL_MS", 500)),
            domain: non_empty("DOMAIN"),
            sentry_dsn: non_empty("SENTRY_DSN"),
            environment: non_empty("ENVIRONMENT").unwrap_or_else(|| "local".to_string()),
        }
    }
}
