//! Configuration for Basalt

use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
}

/// Network layer implementation to run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum NetworkKind {
    /// One thread per client connection, blocking sockets
    Blocking,
    /// Single reactor thread that also accepts
    StNonblocking,
    /// Several reactor threads fed by acceptor tasks
    #[default]
    MtNonblocking,
}

/// How acceptors pick a reactor for a new connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    #[default]
    RoundRobin,
    LeastLoaded,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,

    /// Network implementation
    pub network: NetworkKind,

    /// Number of accept loops (mt_nonblocking only)
    pub acceptors: usize,

    /// Number of reactor threads (mt_nonblocking only)
    pub workers: usize,

    /// Reactor selection policy for accepted sockets
    pub placement: Placement,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Listen backlog
    pub backlog: i32,

    /// Read buffer size per connection (bytes)
    pub read_buffer_size: usize,

    /// Largest data block accepted by storage commands (bytes)
    pub max_value_size: usize,

    /// Queued responses above which a connection stops reading
    pub output_queue_limit: usize,

    /// Fraction of `output_queue_limit` at which reading resumes
    pub backpressure_release: f64,

    /// Readiness events fetched per poll
    pub max_events: usize,

    /// Connection idle/receive timeout in seconds (0 = no timeout)
    pub connection_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:11211".to_string(),
            network: NetworkKind::default(),
            acceptors: 1,
            workers: 4,
            placement: Placement::default(),
            max_connections: 10000,
            backlog: 1024,
            read_buffer_size: 4096,
            max_value_size: 1024 * 1024,
            output_queue_limit: 1024,
            backpressure_release: 0.9,
            max_events: 1024,
            connection_timeout_secs: 0,
        }
    }
}

impl ServerConfig {
    /// Idle timeout, `None` when disabled
    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_secs > 0).then(|| Duration::from_secs(self.connection_timeout_secs))
    }

    /// Output queue length at or below which a backpressured connection reads again
    pub fn backpressure_release_len(&self) -> usize {
        let ratio = self.backpressure_release.clamp(0.0, 1.0);
        (self.output_queue_limit as f64 * ratio) as usize
    }
}

/// Thread pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Threads kept alive while running
    pub low_watermark: usize,

    /// Upper bound on live threads
    pub high_watermark: usize,

    /// Maximum queued tasks
    pub max_queue_size: usize,

    /// How long an idle thread above the low watermark lingers (milliseconds)
    pub idle_time_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            low_watermark: 4,
            high_watermark: 8,
            max_queue_size: 64,
            idle_time_ms: 1024,
        }
    }
}

impl ExecutorConfig {
    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(self.idle_time_ms)
    }
}

/// In-memory storage configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Total bytes of keys and values held across all stripes
    pub max_size: usize,

    /// Number of independently locked LRU stripes (1 = single lock)
    pub stripes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_size: 64 * 1024 * 1024, // 64MB
            stripes: 8,
        }
    }
}

/// Metrics and health check configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,

    /// Address for metrics/health HTTP server
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::BasaltError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| crate::BasaltError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables or use defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BASALT_LISTEN_ADDR") {
            config.server.listen_addr = addr;
        }

        if let Ok(max_conn) = std::env::var("BASALT_MAX_CONNECTIONS")
            && let Ok(n) = max_conn.parse()
        {
            config.server.max_connections = n;
        }

        if let Ok(workers) = std::env::var("BASALT_WORKERS")
            && let Ok(n) = workers.parse()
        {
            config.server.workers = n;
        }

        if let Ok(max_size) = std::env::var("BASALT_STORAGE_MAX_SIZE")
            && let Ok(n) = max_size.parse()
        {
            config.storage.max_size = n;
        }

        if let Ok(addr) = std::env::var("BASALT_METRICS_ADDR") {
            config.metrics.listen_addr = addr;
        }

        if let Ok(enabled) = std::env::var("BASALT_METRICS_ENABLED") {
            config.metrics.enabled = enabled.to_lowercase() == "true" || enabled == "1";
        }

        config
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: &str| Err(crate::BasaltError::Config(msg.to_string()));

        if self.executor.high_watermark == 0 {
            return invalid("executor.high_watermark must be positive");
        }
        if self.executor.low_watermark > self.executor.high_watermark {
            return invalid("executor.low_watermark exceeds executor.high_watermark");
        }
        if self.server.read_buffer_size
            < crate::protocol::MAX_LINE_LENGTH + crate::protocol::ARGUMENT_TERMINATOR_LEN
        {
            return invalid("server.read_buffer_size is smaller than the longest command line");
        }
        if self.server.output_queue_limit == 0 {
            return invalid("server.output_queue_limit must be positive");
        }
        if self.server.workers == 0 || self.server.acceptors == 0 {
            return invalid("server.workers and server.acceptors must be positive");
        }
        if self.storage.stripes == 0 {
            return invalid("storage.stripes must be positive");
        }
        Ok(())
    }
}
