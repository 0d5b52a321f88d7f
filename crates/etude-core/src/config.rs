use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

/// Smallest read buffer the parser can make progress with.
pub const MIN_READ_BUF: usize = 128;
/// Smallest write buffer that holds any of the canned error responses.
pub const MIN_WRITE_BUF: usize = 256;

/// Server configuration loaded from environment variables.
///
/// The engine treats this as a set of constructor parameters; it never
/// reads the environment itself after startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bind address (default: 0.0.0.0)
    pub host: String,

    /// Listening port (default: 8080)
    pub port: u16,

    /// Document root served to clients (default: ./public)
    pub doc_root: PathBuf,

    /// Worker pool size; 0 means one worker per core (default: 4)
    pub workers: usize,

    /// Maximum concurrent connections (default: 65536)
    pub max_connections: usize,

    /// Bound on connections queued for a pool worker (default: 10000)
    pub queue_capacity: usize,

    /// Interval in seconds between eviction ticks (default: 5)
    pub timeslot_secs: u64,

    /// Seconds a connection may sit idle before eviction (default: 15)
    pub idle_timeout_secs: u64,

    /// Per-connection read buffer size in bytes (default: 2048)
    pub read_buf_size: usize,

    /// Per-connection write buffer size in bytes (default: 2048)
    pub write_buf_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 8080,
            doc_root: PathBuf::from("./public"),
            workers: 4,
            max_connections: 65536,
            queue_capacity: 10_000,
            timeslot_secs: 5,
            idle_timeout_secs: 15,
            read_buf_size: 2048,
            write_buf_size: 2048,
        }
    }
}

impl Config {
    /// Load configuration from `ETUDE_*` environment variables (with .env
    /// support). Unset or unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let d = Config::default();
        Config {
            host: std::env::var("ETUDE_HOST").unwrap_or(d.host),
            port: std::env::var("ETUDE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.port),
            doc_root: std::env::var("ETUDE_DOC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.doc_root),
            workers: std::env::var("ETUDE_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.workers),
            max_connections: std::env::var("ETUDE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_connections),
            queue_capacity: std::env::var("ETUDE_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.queue_capacity),
            timeslot_secs: std::env::var("ETUDE_TIMESLOT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.timeslot_secs),
            idle_timeout_secs: std::env::var("ETUDE_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.idle_timeout_secs),
            read_buf_size: std::env::var("ETUDE_READ_BUF_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.read_buf_size),
            write_buf_size: std::env::var("ETUDE_WRITE_BUF_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.write_buf_size),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_connections == 0 {
            return Err(EngineError::Config("max_connections must be nonzero".into()));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::Config("queue_capacity must be nonzero".into()));
        }
        if self.timeslot_secs == 0 {
            return Err(EngineError::Config("timeslot_secs must be nonzero".into()));
        }
        if self.idle_timeout_secs == 0 {
            return Err(EngineError::Config("idle_timeout_secs must be nonzero".into()));
        }
        if self.read_buf_size < MIN_READ_BUF {
            return Err(EngineError::Config(format!(
                "read_buf_size must be at least {MIN_READ_BUF}"
            )));
        }
        if self.write_buf_size < MIN_WRITE_BUF {
            return Err(EngineError::Config(format!(
                "write_buf_size must be at least {MIN_WRITE_BUF}"
            )));
        }
        Ok(())
    }

    /// Worker count with the 0 = one-per-core rule applied.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    /// Get the full server address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_tiny_write_buffer() {
        let config = Config {
            write_buf_size: 64,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn rejects_zero_capacities() {
        for field in ["max_connections", "queue_capacity"] {
            let mut config = Config::default();
            match field {
                "max_connections" => config.max_connections = 0,
                _ => config.queue_capacity = 0,
            }
            assert!(config.validate().is_err(), "{field} = 0 should fail");
        }
    }

    #[test]
    fn zero_workers_means_one_per_core() {
        let config = Config {
            workers: 0,
            ..Config::default()
        };
        assert!(config.effective_workers() >= 1);
    }

    #[test]
    fn server_addr_joins_host_and_port() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 9000,
            ..Config::default()
        };
        assert_eq!(config.server_addr(), "127.0.0.1:9000");
    }
}
