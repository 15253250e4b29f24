//! Configuration loaded from environment variables.
//!
//! Every key has a default; a missing variable falls back silently, but a
//! present variable that fails to parse is a hard configuration error.
//! Durations use humantime syntax (`10ms`, `1s`, `2m`).

use snafu::prelude::*;
use std::env;
use std::time::Duration;

use crate::error::{ConfigError, InvalidDurationSnafu, InvalidIntSnafu};

// ENV keys
pub const ENV_GENERATOR_PAYLOAD_LEN: &str = "GEN_K";
pub const ENV_GENERATOR_INTERVAL: &str = "GEN_N";
pub const ENV_WORKER_POOL_SIZE: &str = "WORKER_POOL_SIZE";
pub const ENV_DB_DRIVER: &str = "DB_DRIVER";
pub const ENV_DB_DSN: &str = "DB_DSN";
pub const ENV_HTTP_PORT: &str = "HTTP_PORT";
pub const ENV_GRPC_PORT: &str = "GRPC_PORT";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_SHUTDOWN_TIMEOUT: &str = "SHUTDOWN_TIMEOUT";

// Defaults
const DEFAULT_PAYLOAD_LEN: i64 = 8;
const DEFAULT_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_WORKER_POOL_SIZE: i64 = 4;
const DEFAULT_DB_DRIVER: &str = "postgres";
const DEFAULT_HTTP_PORT: i64 = 8080;
const DEFAULT_GRPC_PORT: i64 = 50051;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Generator settings for the packet source.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Number of payload elements per packet.
    pub payload_len: i64,
    /// Emission cadence.
    pub interval: Duration,
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub generator: GeneratorConfig,
    pub worker_pool_size: i64,
    pub db_driver: String,
    pub db_dsn: String,
    pub http_port: i64,
    pub grpc_port: i64,
    pub log_level: String,
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            generator: GeneratorConfig {
                payload_len: env_int(ENV_GENERATOR_PAYLOAD_LEN, DEFAULT_PAYLOAD_LEN)?,
                interval: env_duration(ENV_GENERATOR_INTERVAL, DEFAULT_INTERVAL)?,
            },
            worker_pool_size: env_int(ENV_WORKER_POOL_SIZE, DEFAULT_WORKER_POOL_SIZE)?,
            db_driver: env_string(ENV_DB_DRIVER, DEFAULT_DB_DRIVER),
            db_dsn: env_string(ENV_DB_DSN, ""),
            http_port: env_int(ENV_HTTP_PORT, DEFAULT_HTTP_PORT)?,
            grpc_port: env_int(ENV_GRPC_PORT, DEFAULT_GRPC_PORT)?,
            log_level: normalize_log_level(&env_string(ENV_LOG_LEVEL, DEFAULT_LOG_LEVEL)),
            shutdown_timeout: env_duration(ENV_SHUTDOWN_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT)?,
        })
    }
}

fn env_string(key: &'static str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_int(key: &'static str, default: i64) -> Result<i64, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value.parse().context(InvalidIntSnafu { key }),
        _ => Ok(default),
    }
}

fn env_duration(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => {
            humantime::parse_duration(&value).context(InvalidDurationSnafu { key })
        }
        _ => Ok(default),
    }
}

/// Map a user-supplied log level onto the supported set.
///
/// `warning` is accepted as an alias for `warn`; anything unrecognised
/// falls back to `info`.
fn normalize_log_level(level: &str) -> String {
    match level {
        "debug" | "info" | "warn" | "error" => level.to_string(),
        "warning" => "warn".to_string(),
        _ => DEFAULT_LOG_LEVEL.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Serializes env-mutating tests; cargo runs tests in parallel threads.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_env_vars<F, R>(vars: &[(&str, Option<&str>)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ENV_LOCK
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Save original values
        let originals: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();

        // Set test values
        // SAFETY: These tests run within one process; values are restored after
        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        let result = f();

        // Restore original values
        // SAFETY: Restoring original environment state
        for (key, original) in originals {
            match original {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        result
    }

    #[test]
    fn test_defaults_when_unset() {
        with_env_vars(
            &[
                (ENV_GENERATOR_PAYLOAD_LEN, None),
                (ENV_GENERATOR_INTERVAL, None),
                (ENV_WORKER_POOL_SIZE, None),
                (ENV_DB_DRIVER, None),
                (ENV_DB_DSN, None),
                (ENV_HTTP_PORT, None),
                (ENV_GRPC_PORT, None),
                (ENV_LOG_LEVEL, None),
                (ENV_SHUTDOWN_TIMEOUT, None),
            ],
            || {
                let cfg = Config::from_env().unwrap();
                assert_eq!(cfg.generator.payload_len, 8);
                assert_eq!(cfg.generator.interval, Duration::from_millis(10));
                assert_eq!(cfg.worker_pool_size, 4);
                assert_eq!(cfg.db_driver, "postgres");
                assert_eq!(cfg.db_dsn, "");
                assert_eq!(cfg.http_port, 8080);
                assert_eq!(cfg.grpc_port, 50051);
                assert_eq!(cfg.log_level, "info");
                assert_eq!(cfg.shutdown_timeout, Duration::from_secs(30));
            },
        );
    }

    #[test]
    fn test_values_from_environment() {
        with_env_vars(
            &[
                (ENV_GENERATOR_PAYLOAD_LEN, Some("4")),
                (ENV_GENERATOR_INTERVAL, Some("250ms")),
                (ENV_WORKER_POOL_SIZE, Some("2")),
                (ENV_DB_DRIVER, Some("clickhouse")),
                (ENV_LOG_LEVEL, Some("debug")),
                (ENV_SHUTDOWN_TIMEOUT, Some("5s")),
            ],
            || {
                let cfg = Config::from_env().unwrap();
                assert_eq!(cfg.generator.payload_len, 4);
                assert_eq!(cfg.generator.interval, Duration::from_millis(250));
                assert_eq!(cfg.worker_pool_size, 2);
                assert_eq!(cfg.db_driver, "clickhouse");
                assert_eq!(cfg.log_level, "debug");
                assert_eq!(cfg.shutdown_timeout, Duration::from_secs(5));
            },
        );
    }

    #[test]
    fn test_malformed_int_is_an_error() {
        with_env_vars(&[(ENV_WORKER_POOL_SIZE, Some("not-a-number"))], || {
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidInt { key, .. } if key == ENV_WORKER_POOL_SIZE));
        });
    }

    #[test]
    fn test_malformed_duration_is_an_error() {
        with_env_vars(
            &[
                (ENV_GENERATOR_INTERVAL, Some("soon")),
                (ENV_WORKER_POOL_SIZE, None),
                (ENV_GENERATOR_PAYLOAD_LEN, None),
            ],
            || {
                let err = Config::from_env().unwrap_err();
                assert!(
                    matches!(err, ConfigError::InvalidDuration { key, .. } if key == ENV_GENERATOR_INTERVAL)
                );
            },
        );
    }

    #[test]
    fn test_log_level_normalization() {
        assert_eq!(normalize_log_level("debug"), "debug");
        assert_eq!(normalize_log_level("warn"), "warn");
        assert_eq!(normalize_log_level("warning"), "warn");
        assert_eq!(normalize_log_level("verbose"), "info");
        assert_eq!(normalize_log_level(""), "info");
    }
}
