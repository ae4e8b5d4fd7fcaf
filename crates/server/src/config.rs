use std::env;
use std::time::Duration;

pub use common::Environment;
pub use inference::DetectorConfig;

/// Worker lifecycle limits, the in-process counterpart of a pre-fork
/// supervisor's worker settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of worker threads, each with its own model instance.
    pub workers: usize,
    /// Wall-clock bound on a single request; slower workers are replaced.
    pub timeout: Duration,
    /// Requests served before a worker is recycled; 0 disables recycling.
    pub max_requests: u64,
    /// Upper bound of the random extra added to `max_requests` per worker.
    pub max_requests_jitter: u64,
    /// Requests allowed to wait for a free worker.
    pub backlog: usize,
}

impl SupervisorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let workers = match env::var("WORKERS") {
            Ok(value) => {
                let workers: usize = value.trim().parse().map_err(|_| {
                    anyhow::anyhow!("WORKERS must be a positive integer, got `{}`", value)
                })?;
                if workers == 0 {
                    anyhow::bail!("WORKERS must be at least 1");
                }
                workers
            }
            Err(_) => default_workers(),
        };

        let timeout_secs = env::var("TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&secs: &u64| secs > 0)
            .unwrap_or(30);

        let max_requests = env::var("MAX_REQUESTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);

        let max_requests_jitter = env::var("MAX_REQUESTS_JITTER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50);

        let backlog = env::var("BACKLOG")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(2048);

        Ok(Self {
            workers,
            timeout: Duration::from_secs(timeout_secs),
            max_requests,
            max_requests_jitter,
            backlog,
        })
    }
}

/// `2 * cpus + 1`, falling back to a single CPU when the count is unknown.
fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus * 2 + 1
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub environment: Environment,
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
    pub otel_endpoint: Option<String>,
    pub supervisor: SupervisorConfig,
    pub detector: DetectorConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = Environment::from_env();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        let max_body_bytes = env::var("MAX_BODY_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(16 * 1024 * 1024);

        let otel_endpoint = env::var("OTEL_ENDPOINT").ok().filter(|s| !s.is_empty());

        Ok(Self {
            environment,
            host,
            port,
            max_body_bytes,
            otel_endpoint,
            supervisor: SupervisorConfig::from_env()?,
            detector: DetectorConfig::from_env(),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
