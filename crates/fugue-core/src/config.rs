use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FugueError, FugueResult};

/// Listener and per-connection limits for a [`Server`](crate::Server).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind (default: 127.0.0.1)
    pub host: String,

    /// Port to bind (default: 8080)
    pub port: u16,

    /// Number of event-loop threads, each with its own SO_REUSEPORT
    /// listener (default: hardware concurrency)
    pub workers: usize,

    /// Maximum unparsed bytes buffered per connection before it is closed
    /// without a response (default: 1 MiB)
    pub max_payload_size: usize,

    /// Bytes read from a socket per readiness event (default: 512)
    pub read_chunk_size: usize,

    /// listen(2) backlog (default: 1024)
    pub backlog: i32,

    /// Readiness events drained per wait (default: 32)
    pub max_events: usize,

    /// Connection slots per worker (default: 100 000)
    pub max_connections: usize,

    /// Pin each worker thread to a CPU core (default: true)
    pub pin_workers: bool,

    /// Seconds between metrics log lines, 0 disables the reporter (default: 5)
    pub metrics_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            workers: num_cpus::get(),
            max_payload_size: 1 << 20,
            read_chunk_size: 512,
            backlog: 1024,
            max_events: 32,
            max_connections: 100_000,
            pin_workers: true,
            metrics_interval_secs: 5,
        }
    }
}

fn env_var<T: FromStr>(key: &str) -> FugueResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| FugueError::Config(format!("{key}={raw:?} is not a valid value"))),
        Err(_) => Ok(None),
    }
}

impl ServerConfig {
    /// Defaults overlaid with `FUGUE_*` environment variables.
    pub fn from_env() -> FugueResult<Self> {
        let mut cfg = Self::default();
        if let Some(host) = env_var::<String>("FUGUE_HOST")? {
            cfg.host = host;
        }
        if let Some(port) = env_var("FUGUE_PORT")? {
            cfg.port = port;
        }
        if let Some(workers) = env_var("FUGUE_WORKERS")? {
            cfg.workers = workers;
        }
        if let Some(max) = env_var("FUGUE_MAX_PAYLOAD_SIZE")? {
            cfg.max_payload_size = max;
        }
        if let Some(chunk) = env_var("FUGUE_READ_CHUNK_SIZE")? {
            cfg.read_chunk_size = chunk;
        }
        if let Some(backlog) = env_var("FUGUE_BACKLOG")? {
            cfg.backlog = backlog;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> FugueResult<()> {
        if self.workers == 0 {
            return Err(FugueError::Config("workers must be at least 1".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(FugueError::Config("read_chunk_size must be at least 1".into()));
        }
        if self.max_payload_size == 0 {
            return Err(FugueError::Config("max_payload_size must be at least 1".into()));
        }
        if self.max_events == 0 {
            return Err(FugueError::Config("max_events must be at least 1".into()));
        }
        if self.max_connections == 0 || self.max_connections > u32::MAX as usize {
            return Err(FugueError::Config("max_connections out of range".into()));
        }
        if self.backlog <= 0 {
            return Err(FugueError::Config("backlog must be positive".into()));
        }
        Ok(())
    }

    pub fn metrics_interval(&self) -> Option<Duration> {
        (self.metrics_interval_secs > 0).then(|| Duration::from_secs(self.metrics_interval_secs))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ServerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.read_chunk_size, 512);
        assert_eq!(cfg.max_payload_size, 1 << 20);
        assert_eq!(cfg.address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_rejects_zero_workers() {
        let cfg = ServerConfig {
            workers: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(FugueError::Config(_))));
    }

    #[test]
    fn test_metrics_interval_disabled() {
        let cfg = ServerConfig {
            metrics_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.metrics_interval(), None);
    }
}
