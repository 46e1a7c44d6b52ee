// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Engine tuning shared by every pipeline component.
///
/// Built once at startup and passed by reference; nothing reads the environment
/// after [`Config::from_env`] returns.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Width of the fiber lane (concurrent flow steps).
    pub fiber_pool_size: usize,
    /// Width of the long-running lane.
    pub long_running_pool_size: usize,
    /// Deadline for a single external event attempt.
    pub external_event_timeout: Duration,
    /// Number of resends before an unanswered external event times out.
    pub external_event_max_retries: u32,
    /// Session inactivity timeout.
    pub session_timeout: Duration,
    /// Age after which an unacknowledged session message is sent again.
    pub session_resend_interval: Duration,
    /// Transient retry budget before the hospital escalates to fatal.
    pub hospital_max_retries: u32,
    /// Base delay of the hospital's exponential backoff.
    pub hospital_backoff: Duration,
    /// Delay before closed mapper state is removed.
    pub mapper_cleanup_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fiber_pool_size: default_parallelism(),
            long_running_pool_size: 4,
            external_event_timeout: Duration::from_millis(60_000),
            external_event_max_retries: 3,
            session_timeout: Duration::from_millis(300_000),
            session_resend_interval: Duration::from_millis(10_000),
            hospital_max_retries: 5,
            hospital_backoff: Duration::from_millis(1_000),
            mapper_cleanup_delay: Duration::from_millis(30_000),
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Ledgerflow worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite or PostgreSQL connection URL; the in-memory store is used when absent.
    pub database_url: Option<String>,
    /// Number of flow-event partitions processed in parallel.
    pub partitions: usize,
    /// Engine tuning.
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `LEDGERFLOW_DATABASE_URL`: checkpoint store connection string (default: in-memory)
    /// - `LEDGERFLOW_PARTITIONS`: flow-event partitions (default: 8)
    /// - `LEDGERFLOW_FIBER_POOL_SIZE`: fiber lane width (default: available parallelism)
    /// - `LEDGERFLOW_LONG_RUNNING_POOL_SIZE`: long-running lane width (default: 4)
    /// - `LEDGERFLOW_EXTERNAL_EVENT_TIMEOUT_MS`: external event deadline (default: 60000)
    /// - `LEDGERFLOW_EXTERNAL_EVENT_MAX_RETRIES`: external event resends (default: 3)
    /// - `LEDGERFLOW_SESSION_TIMEOUT_MS`: session inactivity timeout (default: 300000)
    /// - `LEDGERFLOW_SESSION_RESEND_MS`: unacknowledged message resend age (default: 10000)
    /// - `LEDGERFLOW_HOSPITAL_MAX_RETRIES`: transient retry budget (default: 5)
    /// - `LEDGERFLOW_HOSPITAL_BACKOFF_MS`: backoff base (default: 1000)
    /// - `LEDGERFLOW_MAPPER_CLEANUP_MS`: mapper cleanup delay (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("LEDGERFLOW_DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty());

        let partitions: usize = parse_var("LEDGERFLOW_PARTITIONS", 8, "must be a positive integer")?;
        if partitions == 0 {
            return Err(ConfigError::Invalid(
                "LEDGERFLOW_PARTITIONS",
                "must be a positive integer",
            ));
        }

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            fiber_pool_size: parse_var(
                "LEDGERFLOW_FIBER_POOL_SIZE",
                defaults.fiber_pool_size,
                "must be a positive integer",
            )?
            .max(1),
            long_running_pool_size: parse_var(
                "LEDGERFLOW_LONG_RUNNING_POOL_SIZE",
                defaults.long_running_pool_size,
                "must be a positive integer",
            )?
            .max(1),
            external_event_timeout: Duration::from_millis(parse_var(
                "LEDGERFLOW_EXTERNAL_EVENT_TIMEOUT_MS",
                60_000u64,
                "must be a duration in milliseconds",
            )?),
            external_event_max_retries: parse_var(
                "LEDGERFLOW_EXTERNAL_EVENT_MAX_RETRIES",
                defaults.external_event_max_retries,
                "must be a non-negative integer",
            )?,
            session_timeout: Duration::from_millis(parse_var(
                "LEDGERFLOW_SESSION_TIMEOUT_MS",
                300_000u64,
                "must be a duration in milliseconds",
            )?),
            session_resend_interval: Duration::from_millis(parse_var(
                "LEDGERFLOW_SESSION_RESEND_MS",
                10_000u64,
                "must be a duration in milliseconds",
            )?),
            hospital_max_retries: parse_var(
                "LEDGERFLOW_HOSPITAL_MAX_RETRIES",
                defaults.hospital_max_retries,
                "must be a non-negative integer",
            )?,
            hospital_backoff: Duration::from_millis(parse_var(
                "LEDGERFLOW_HOSPITAL_BACKOFF_MS",
                1_000u64,
                "must be a duration in milliseconds",
            )?),
            mapper_cleanup_delay: Duration::from_millis(parse_var(
                "LEDGERFLOW_MAPPER_CLEANUP_MS",
                30_000u64,
                "must be a duration in milliseconds",
            )?),
        };

        Ok(Self {
            database_url,
            partitions,
            engine,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name, reason)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "LEDGERFLOW_DATABASE_URL",
        "LEDGERFLOW_PARTITIONS",
        "LEDGERFLOW_FIBER_POOL_SIZE",
        "LEDGERFLOW_LONG_RUNNING_POOL_SIZE",
        "LEDGERFLOW_EXTERNAL_EVENT_TIMEOUT_MS",
        "LEDGERFLOW_EXTERNAL_EVENT_MAX_RETRIES",
        "LEDGERFLOW_SESSION_TIMEOUT_MS",
        "LEDGERFLOW_SESSION_RESEND_MS",
        "LEDGERFLOW_HOSPITAL_MAX_RETRIES",
        "LEDGERFLOW_HOSPITAL_BACKOFF_MS",
        "LEDGERFLOW_MAPPER_CLEANUP_MS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in ALL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = Config::from_env().unwrap();

        assert!(config.database_url.is_none());
        assert_eq!(config.partitions, 8);
        assert_eq!(config.engine.long_running_pool_size, 4);
        assert_eq!(
            config.engine.external_event_timeout,
            Duration::from_millis(60_000)
        );
        assert_eq!(config.engine.external_event_max_retries, 3);
        assert_eq!(config.engine.hospital_max_retries, 5);
        assert_eq!(
            config.engine.session_resend_interval,
            Duration::from_millis(10_000)
        );
        assert!(config.engine.fiber_pool_size >= 1);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("LEDGERFLOW_DATABASE_URL", "sqlite:flows.db");
        guard.set("LEDGERFLOW_PARTITIONS", "16");
        guard.set("LEDGERFLOW_FIBER_POOL_SIZE", "2");
        guard.set("LEDGERFLOW_EXTERNAL_EVENT_TIMEOUT_MS", "500");
        guard.set("LEDGERFLOW_EXTERNAL_EVENT_MAX_RETRIES", "0");
        guard.set("LEDGERFLOW_SESSION_TIMEOUT_MS", "1000");
        guard.set("LEDGERFLOW_HOSPITAL_BACKOFF_MS", "10");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url.as_deref(), Some("sqlite:flows.db"));
        assert_eq!(config.partitions, 16);
        assert_eq!(config.engine.fiber_pool_size, 2);
        assert_eq!(config.engine.external_event_timeout, Duration::from_millis(500));
        assert_eq!(config.engine.external_event_max_retries, 0);
        assert_eq!(config.engine.session_timeout, Duration::from_millis(1000));
        assert_eq!(config.engine.hospital_backoff, Duration::from_millis(10));
    }

    #[test]
    fn test_config_zero_partitions_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("LEDGERFLOW_PARTITIONS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("LEDGERFLOW_PARTITIONS", _)));
    }

    #[test]
    fn test_config_invalid_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("LEDGERFLOW_SESSION_TIMEOUT_MS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("LEDGERFLOW_SESSION_TIMEOUT_MS", _)
        ));
        assert!(err.to_string().contains("LEDGERFLOW_SESSION_TIMEOUT_MS"));
    }

    #[test]
    fn test_config_negative_retries_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("LEDGERFLOW_HOSPITAL_MAX_RETRIES", "-1");

        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_config_empty_database_url_is_none() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("LEDGERFLOW_DATABASE_URL", "");

        let config = Config::from_env().unwrap();
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
