//! Engine configuration, driven by flat environment variables.

use serde::{Deserialize, Serialize};

/// Main configuration for the engine process.
///
/// Field names match the environment keys (`STORE_DSN`, `BROKER_HOST`, …)
/// lowercased; the CLI flags `--workers`, `--queue`, and `--deadline`
/// override the corresponding fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Relational store connection string
    #[serde(default = "default_store_dsn")]
    pub store_dsn: String,

    /// Broker endpoint
    #[serde(default = "default_broker_host")]
    pub broker_host: String,

    #[serde(default = "default_broker_port")]
    pub broker_port: u16,

    /// Queue the bridge publishes to and dispatchers consume from
    #[serde(default = "default_task_queue")]
    pub task_queue: String,

    /// Dispatcher count per process
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-task deadline for agent/tool invocations
    #[serde(default = "default_task_deadline_seconds")]
    pub task_deadline_seconds: u64,

    /// Max attempts for store/broker operations
    #[serde(default = "default_store_retry_max")]
    pub store_retry_max: u32,

    /// Grace period on SIGTERM before in-flight work is abandoned
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,

    /// How long the bridge tolerates a broker outage before terminating
    #[serde(default = "default_bridge_horizon_seconds")]
    pub bridge_horizon_seconds: u64,

    /// Store connection pool size
    #[serde(default = "default_store_pool_size")]
    pub store_pool_size: u32,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_store_dsn() -> String {
    "postgres://localhost:5432/synapse".to_string()
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

const fn default_broker_port() -> u16 {
    6379
}

fn default_task_queue() -> String {
    "task_execution_queue".to_string()
}

const fn default_workers() -> usize {
    4
}

const fn default_task_deadline_seconds() -> u64 {
    300
}

const fn default_store_retry_max() -> u32 {
    5
}

const fn default_shutdown_grace_seconds() -> u64 {
    30
}

const fn default_bridge_horizon_seconds() -> u64 {
    60
}

const fn default_store_pool_size() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_dsn: default_store_dsn(),
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            task_queue: default_task_queue(),
            workers: default_workers(),
            task_deadline_seconds: default_task_deadline_seconds(),
            store_retry_max: default_store_retry_max(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            bridge_horizon_seconds: default_bridge_horizon_seconds(),
            store_pool_size: default_store_pool_size(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl EngineConfig {
    pub fn broker_url(&self) -> String {
        format!("redis://{}:{}/", self.broker_host, self.broker_port)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be at least 1".to_string());
        }
        if self.task_deadline_seconds == 0 {
            return Err("task_deadline_seconds must be positive".to_string());
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(format!(
                "log_format must be json or pretty, got '{}'",
                self.log_format
            ));
        }
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(format!("invalid log_level '{}'", self.log_level));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.task_queue, "task_execution_queue");
        assert_eq!(config.task_deadline_seconds, 300);
        assert_eq!(config.store_retry_max, 5);
        assert_eq!(config.shutdown_grace_seconds, 30);
    }

    #[test]
    fn test_broker_url() {
        let config = EngineConfig {
            broker_host: "queue.internal".to_string(),
            broker_port: 6380,
            ..Default::default()
        };
        assert_eq!(config.broker_url(), "redis://queue.internal:6380/");
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let config = EngineConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_log_format() {
        let config = EngineConfig {
            log_format: "xml".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
