//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Handles all scheduler settings from environment variables and files

use config::{Config as ConfigBuilder, Environment, File};
use cf_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub scheduler: SchedulerConfig,
    #[validate(nested)]
    pub health_check: HealthCheckConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub server: ServerConfig,
    pub log: LogConfig,
    #[validate(nested)]
    pub redis: RedisConfig,
}

/// Scheduler and leader-election configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SchedulerConfig {
    /// Identity of this replica; defaults to hostname:pid
    #[validate(length(min = 1))]
    pub instance_id: String,
    /// Named advisory-lock key shared by all replicas of one cluster
    #[validate(length(min = 1))]
    pub lock_key: String,
    /// How long one acquisition round may wait for the lock, in seconds
    #[validate(range(min = 1, max = 300))]
    pub lock_timeout_secs: u64,
    /// Leader-election tick interval, in seconds
    #[validate(range(min = 1, max = 3600))]
    pub heartbeat_interval_secs: u64,
    /// Dispatch worker pool size
    #[validate(range(min = 1, max = 256))]
    pub max_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            lock_key: "cronfleet_leader".to_string(),
            lock_timeout_secs: 5,
            heartbeat_interval_secs: 10,
            max_workers: 8,
        }
    }
}

/// Build the default replica identity from hostname and process id
pub fn default_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

/// Executor health probing configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// Probe loop interval, in seconds
    #[validate(range(min = 1, max = 3600))]
    pub interval_secs: u64,
    /// Per-probe request timeout, in seconds (clamped to 1..=5 at use)
    #[validate(range(min = 1, max = 60))]
    pub timeout_secs: u64,
    /// Consecutive probe failures before an executor goes offline
    #[validate(range(min = 1, max = 100))]
    pub failure_threshold: i32,
    /// Consecutive probe successes before an offline executor recovers
    #[validate(range(min = 1, max = 100))]
    pub recovery_threshold: i32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 3,
            failure_threshold: 3,
            recovery_threshold: 2,
        }
    }
}

/// Database configuration with secret redaction
#[derive(Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
    #[validate(length(min = 1))]
    pub dbname: String,
    #[validate(length(min = 1))]
    pub user: String,
    pub password: String,
    #[validate(range(min = 1, max = 200))]
    pub max_conns: u32,
    #[validate(range(min = 0, max = 200))]
    pub min_conns: u32,
    /// Maximum lifetime of a pooled connection, in seconds
    #[validate(range(min = 60, max = 86400))]
    pub conn_max_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            dbname: "cronfleet".to_string(),
            user: "cronfleet".to_string(),
            password: String::new(),
            max_conns: 10,
            min_conns: 1,
            conn_max_lifetime_secs: 1800,
        }
    }
}

impl DatabaseConfig {
    /// Build the Postgres connection URL
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.dbname
        )
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("max_conns", &self.max_conns)
            .field("min_conns", &self.min_conns)
            .field("conn_max_lifetime_secs", &self.conn_max_lifetime_secs)
            .finish()
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
    /// Client request timeout, in seconds
    #[validate(range(min = 1, max = 300))]
    pub client_timeout_secs: u64,
    /// Externally reachable base URL advertised to executors for callbacks.
    /// Empty means derive from host:port.
    pub callback_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            client_timeout_secs: 30,
            callback_base_url: String::new(),
        }
    }
}

impl ServerConfig {
    /// Base URL executors should call back on
    pub fn callback_base(&self) -> String {
        if self.callback_base_url.is_empty() {
            format!("http://{}:{}", self.host, self.port)
        } else {
            self.callback_base_url.trim_end_matches('/').to_string()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level when RUST_LOG is unset
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// "stdout" (reserved for future file output)
    pub output: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
        }
    }
}

impl LogConfig {
    pub fn json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Redis pub/sub configuration for the cross-replica event bus
#[derive(Clone, Deserialize, Serialize, Validate)]
pub struct RedisConfig {
    /// When false the in-process bus is used instead
    pub enabled: bool,
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
    pub password: String,
    #[validate(range(min = 0, max = 15))]
    pub db: u8,
    /// Pub/sub channel shared by all replicas of one cluster
    #[validate(length(min = 1))]
    pub channel: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: String::new(),
            db: 0,
            channel: "cronfleet:events".to_string(),
        }
    }
}

impl RedisConfig {
    /// Build the Redis connection URL
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"[REDACTED]")
            .field("db", &self.db)
            .field("channel", &self.channel)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables and optional .env file
    pub fn load() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        // Set defaults first
        builder = builder
            .set_default("scheduler.instance_id", default_instance_id())?
            .set_default("scheduler.lock_key", "cronfleet_leader")?
            .set_default("scheduler.lock_timeout_secs", 5)?
            .set_default("scheduler.heartbeat_interval_secs", 10)?
            .set_default("scheduler.max_workers", 8)?
            .set_default("health_check.enabled", true)?
            .set_default("health_check.interval_secs", 30)?
            .set_default("health_check.timeout_secs", 3)?
            .set_default("health_check.failure_threshold", 3)?
            .set_default("health_check.recovery_threshold", 2)?
            .set_default("database.host", "127.0.0.1")?
            .set_default("database.port", 5432)?
            .set_default("database.dbname", "cronfleet")?
            .set_default("database.user", "cronfleet")?
            .set_default("database.password", "")?
            .set_default("database.max_conns", 10)?
            .set_default("database.min_conns", 1)?
            .set_default("database.conn_max_lifetime_secs", 1800)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.client_timeout_secs", 30)?
            .set_default("server.callback_base_url", "")?
            .set_default("log.level", "info")?
            .set_default("log.format", "pretty")?
            .set_default("log.output", "stdout")?
            .set_default("redis.enabled", false)?
            .set_default("redis.host", "127.0.0.1")?
            .set_default("redis.port", 6379)?
            .set_default("redis.password", "")?
            .set_default("redis.db", 0)?
            .set_default("redis.channel", "cronfleet:events")?;

        // Try to load from a config file if one exists (optional)
        if std::path::Path::new("cronfleet.toml").exists() {
            builder = builder.add_source(File::with_name("cronfleet").required(false));
        }

        // Load from environment variables with CRONFLEET_ prefix (highest priority)
        builder = builder.add_source(
            Environment::with_prefix("CRONFLEET")
                .try_parsing(true)
                .separator("__"),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Config validation failed: {}", e)))?;

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Use a mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "CRONFLEET_SCHEDULER__LOCK_KEY",
            "CRONFLEET_SCHEDULER__MAX_WORKERS",
            "CRONFLEET_DATABASE__HOST",
            "CRONFLEET_DATABASE__PORT",
            "CRONFLEET_SERVER__PORT",
            "CRONFLEET_REDIS__ENABLED",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        let config = Config::load().expect("Should load with defaults");

        assert_eq!(config.scheduler.lock_key, "cronfleet_leader");
        assert_eq!(config.scheduler.heartbeat_interval_secs, 10);
        assert_eq!(config.scheduler.max_workers, 8);
        assert!(config.health_check.enabled);
        assert_eq!(config.health_check.failure_threshold, 3);
        assert_eq!(config.database.port, 5432);
        assert!(!config.redis.enabled);
        assert!(config.scheduler.instance_id.contains(':'));
    }

    #[test]
    fn test_config_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        env::set_var("CRONFLEET_SCHEDULER__LOCK_KEY", "cluster-a");
        env::set_var("CRONFLEET_SERVER__PORT", "9090");

        let config = Config::load().expect("Should load from env");

        assert_eq!(config.scheduler.lock_key, "cluster-a");
        assert_eq!(config.server.port, 9090);

        clear_env();
        env::remove_var("CRONFLEET_SCHEDULER__LOCK_KEY");
        env::remove_var("CRONFLEET_SERVER__PORT");
    }

    #[test]
    fn test_config_validation_failure() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        env::set_var("CRONFLEET_SCHEDULER__MAX_WORKERS", "0"); // Invalid - below range

        let result = Config::load();
        assert!(result.is_err());

        env::remove_var("CRONFLEET_SCHEDULER__MAX_WORKERS");
    }

    #[test]
    fn test_secret_redaction() {
        let mut db = DatabaseConfig::default();
        db.password = "super-secret".to_string();
        let debug_output = format!("{:?}", db);

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super-secret"));
    }

    #[test]
    fn test_database_url() {
        let mut db = DatabaseConfig::default();
        db.password = "pw".to_string();
        assert_eq!(db.url(), "postgres://cronfleet:pw@127.0.0.1:5432/cronfleet");
    }

    #[test]
    fn test_redis_url_with_and_without_password() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://127.0.0.1:6379/0");

        redis.password = "pw".to_string();
        redis.db = 2;
        assert_eq!(redis.url(), "redis://:pw@127.0.0.1:6379/2");
    }

    #[test]
    fn test_callback_base() {
        let mut server = ServerConfig::default();
        server.host = "10.0.0.5".to_string();
        server.port = 8088;
        assert_eq!(server.callback_base(), "http://10.0.0.5:8088");

        server.callback_base_url = "https://sched.example.com/".to_string();
        assert_eq!(server.callback_base(), "https://sched.example.com");
    }
}
