//! Server configuration.
//!
//! Configuration is read from a YAML file (path from `PORTICO_CONFIG`, or
//! `portico.yaml` in the working directory) and then patched by a handful of
//! environment variables. Every field has a default, so an empty file or no
//! file at all yields a runnable server.

use anyhow::{Context, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV: &str = "PORTICO_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "portico.yaml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub static_files: StaticFilesConfig,
    pub pool: PoolConfig,
    pub connection: ConnectionConfig,
}

/// Listening socket and logging.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub log_level: String,
    /// Seconds between pool statistics log lines, 0 disables them.
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StaticFilesConfig {
    pub document_root: PathBuf,
    pub index_file: String,
    /// Files larger than this are streamed instead of buffered.
    pub stream_threshold: u64,
}

/// What the acceptor does with a connection it could not enqueue in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Answer `503 Service Unavailable` and close.
    Reject,
    /// Close the socket without a response.
    Drop,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub worker_count: usize,
    /// Capacity of the queue between the acceptor and the workers.
    pub max_connections: usize,
    pub enqueue_timeout_ms: u64,
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub idle_timeout_ms: u64,
    pub max_requests_per_connection: usize,
    /// Refuse keep-alive while more connections than this are active.
    pub keep_alive_load_limit: Option<usize>,
    pub max_line_size: usize,
    pub max_header_size: usize,
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            stats_interval_secs: 30,
        }
    }
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            document_root: PathBuf::from("./public"),
            index_file: "index.html".to_string(),
            stream_threshold: 64 * 1024,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_connections: 64,
            enqueue_timeout_ms: 5_000,
            overflow: OverflowPolicy::Reject,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 5_000,
            max_requests_per_connection: 100,
            keep_alive_load_limit: None,
            max_line_size: 8 * 1024,
            max_header_size: 16 * 1024,
            max_body_size: 1024 * 1024,
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Config {
    /// Loads the configuration file (if any), applies environment overrides
    /// and validates the result.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            Err(_) => Self::default(),
        };

        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        // An empty document deserializes to unit, not to an empty map.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Applies `LISTEN`, `DOCUMENT_ROOT` and `WORKERS` through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("LISTEN") {
            let (host, port) = listen
                .rsplit_once(':')
                .with_context(|| format!("LISTEN must be host:port, got {listen:?}"))?;
            self.server.address = host.to_string();
            self.server.port = port
                .parse()
                .with_context(|| format!("invalid port in LISTEN: {port:?}"))?;
        }

        if let Some(root) = lookup("DOCUMENT_ROOT") {
            self.static_files.document_root = PathBuf::from(root);
        }

        if let Some(workers) = lookup("WORKERS") {
            self.pool.worker_count = workers
                .parse()
                .with_context(|| format!("invalid WORKERS value: {workers:?}"))?;
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool.worker_count == 0 {
            bail!("pool.worker_count must be at least 1");
        }
        if self.pool.max_connections == 0 {
            bail!("pool.max_connections must be at least 1");
        }
        if self.connection.max_requests_per_connection == 0 {
            bail!("connection.max_requests_per_connection must be at least 1");
        }
        if self.connection.idle_timeout_ms == 0 {
            bail!("connection.idle_timeout_ms must be greater than 0");
        }
        if self.connection.max_line_size > self.connection.max_header_size {
            bail!("connection.max_line_size cannot exceed connection.max_header_size");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.address, self.server.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.idle_timeout_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.enqueue_timeout_ms)
    }
}
