//! Configuration management for the SMS rate limiter.
//!
//! Configuration is read from an optional file (YAML, TOML or JSON, chosen by
//! extension) and then overridden from `SMS_RATELIMIT__*` environment
//! variables, using `__` to descend into sections:
//!
//! ```text
//! SMS_RATELIMIT__STORAGE__TYPE=redis_sentinel
//! SMS_RATELIMIT__STORAGE__SENTINEL__MASTER_NAME=issuer
//! SMS_RATELIMIT__STORAGE__SENTINEL__PASSWORD=...
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::storage::{RedisStorageConfig, RedisTarget};
use crate::ratelimit::{
    BreakpointPolicy, Clock, MemoryStorage, PhoneIpRateLimiter, RateLimiterStorage, RedisStorage,
    DEFAULT_FAILURE_PENALTY,
};

const ENV_PREFIX: &str = "SMS_RATELIMIT";

/// Main configuration for the rate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Where client state is kept
    #[serde(default)]
    pub storage: StorageConfig,

    /// Policies and penalties
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

impl LimiterConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would leave the limiter unable to work.
    pub fn validate(&self) -> Result<()> {
        if self.storage.max_transaction_retries == 0 {
            return Err(LimiterError::Config(
                "storage.max_transaction_retries must be at least 1".into(),
            ));
        }
        if self.storage.dial_timeout.is_zero() {
            return Err(LimiterError::Config(
                "storage.dial_timeout must be greater than zero".into(),
            ));
        }
        if self.rate_limiting.sweep_interval.is_zero() {
            return Err(LimiterError::Config(
                "rate_limiting.sweep_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which storage backend holds client state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    Memory,
    Redis,
    RedisSentinel,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type", default)]
    pub storage_type: StorageType,

    /// Connection settings for `type: redis`
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Connection settings for `type: redis_sentinel`
    #[serde(default)]
    pub sentinel: Option<RedisSentinelConfig>,

    /// Prefix for keys in a shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Attempts before a contended Redis transaction gives up
    #[serde(default = "default_max_transaction_retries")]
    pub max_transaction_retries: u32,

    /// Connection establishment timeout
    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::default(),
            redis: None,
            sentinel: None,
            key_prefix: default_key_prefix(),
            max_transaction_retries: default_max_transaction_retries(),
            dial_timeout: default_dial_timeout(),
        }
    }
}

impl StorageConfig {
    /// The Redis server to use, or `None` for in-memory storage.
    pub fn redis_target(&self) -> Result<Option<RedisTarget>> {
        match self.storage_type {
            StorageType::Memory => Ok(None),
            StorageType::Redis => {
                let redis = self.redis.as_ref().ok_or_else(|| {
                    LimiterError::Config("storage type 'redis' requires a 'redis' section".into())
                })?;
                Ok(Some(RedisTarget::Direct {
                    host: redis.host.clone(),
                    port: redis.port,
                    username: redis.username.clone(),
                    password: redis.password.clone(),
                    db: redis.db,
                }))
            }
            StorageType::RedisSentinel => {
                let sentinel = self.sentinel.as_ref().ok_or_else(|| {
                    LimiterError::Config(
                        "storage type 'redis_sentinel' requires a 'sentinel' section".into(),
                    )
                })?;
                if sentinel.master_name.is_empty() {
                    return Err(LimiterError::Config("sentinel master_name is empty".into()));
                }
                Ok(Some(RedisTarget::Sentinel {
                    sentinel_host: sentinel.sentinel_host.clone(),
                    sentinel_port: sentinel.sentinel_port,
                    sentinel_username: sentinel.sentinel_username.clone(),
                    sentinel_password: sentinel.sentinel_password.clone(),
                    master_name: sentinel.master_name.clone(),
                    password: sentinel.password.clone(),
                    db: sentinel.db,
                }))
            }
        }
    }

    /// Settings for `RedisStorage`, expiring keys after `ttl`.
    pub fn redis_storage_config(&self, ttl: Duration) -> RedisStorageConfig {
        RedisStorageConfig {
            key_prefix: self.key_prefix.clone(),
            ttl,
            max_retries: self.max_transaction_retries,
            dial_timeout: self.dial_timeout,
        }
    }
}

fn default_key_prefix() -> String {
    "sms-issuer:rate-limiter:".to_string()
}

fn default_max_transaction_retries() -> u32 {
    5
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}

/// A directly addressed Redis server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

/// A Sentinel-managed Redis group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSentinelConfig {
    #[serde(default = "default_redis_host")]
    pub sentinel_host: String,

    #[serde(default = "default_sentinel_port")]
    pub sentinel_port: u16,

    #[serde(default)]
    pub sentinel_username: Option<String>,

    #[serde(default)]
    pub sentinel_password: Option<String>,

    pub master_name: String,

    /// Password of the master
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,
}

fn default_sentinel_port() -> u16 {
    26379
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Timeout table for IP address keys
    #[serde(default)]
    pub ip_policy: BreakpointPolicy,

    /// Timeout table for phone number keys
    #[serde(default)]
    pub phone_policy: BreakpointPolicy,

    /// Penalty reported when storage cannot be reached
    #[serde(default = "default_failure_penalty", with = "humantime_serde")]
    pub failure_penalty: Duration,

    /// How long idle clients are remembered (also the Redis key TTL)
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// How often the in-memory store drops idle clients
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            ip_policy: BreakpointPolicy::default(),
            phone_policy: BreakpointPolicy::default(),
            failure_penalty: default_failure_penalty(),
            retention: default_retention(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_failure_penalty() -> Duration {
    DEFAULT_FAILURE_PENALTY
}

fn default_retention() -> Duration {
    Duration::from_secs(48 * 60 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

/// A storage backend built from [`StorageConfig`].
#[derive(Debug, Clone)]
pub enum StorageBackend {
    Memory(Arc<MemoryStorage>),
    Redis(Arc<RedisStorage>),
}

impl StorageBackend {
    pub fn storage(&self) -> Arc<dyn RateLimiterStorage> {
        match self {
            StorageBackend::Memory(memory) => memory.clone(),
            StorageBackend::Redis(redis) => redis.clone(),
        }
    }
}

impl LimiterConfig {
    /// Create the configured storage, connecting to Redis if required.
    pub async fn connect_storage(&self) -> Result<StorageBackend> {
        let retention = self.rate_limiting.retention;
        match self.storage.redis_target()? {
            None => {
                info!(retention = ?retention, "Using in-memory storage");
                Ok(StorageBackend::Memory(Arc::new(
                    MemoryStorage::with_retention(retention),
                )))
            }
            Some(target) => {
                let redis =
                    RedisStorage::connect(target, self.storage.redis_storage_config(retention))
                        .await?;
                Ok(StorageBackend::Redis(Arc::new(redis)))
            }
        }
    }

    /// Build the IP + phone limiter on top of `storage`.
    pub fn build_limiter(
        &self,
        storage: Arc<dyn RateLimiterStorage>,
        clock: Arc<dyn Clock>,
    ) -> PhoneIpRateLimiter {
        let limits = &self.rate_limiting;
        PhoneIpRateLimiter::with_storage(
            storage,
            clock,
            Arc::new(limits.ip_policy.clone()),
            Arc::new(limits.phone_policy.clone()),
        )
        .with_failure_penalty(limits.failure_penalty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{MockClock, TimeoutPolicy};

    #[test]
    fn test_defaults() {
        let config = LimiterConfig::default();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.storage.storage_type, StorageType::Memory);
        assert!(config.storage.redis_target().unwrap().is_none());
        assert_eq!(config.rate_limiting.retention, Duration::from_secs(172_800));
        assert_eq!(config.rate_limiting.failure_penalty, Duration::from_secs(1800));
        assert_eq!(config.rate_limiting.ip_policy, BreakpointPolicy::default());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = LimiterConfig::from_yaml("{}").unwrap();
        assert_eq!(config.storage.storage_type, StorageType::Memory);
        assert_eq!(config.storage.key_prefix, "sms-issuer:rate-limiter:");
        assert_eq!(config.rate_limiting.phone_policy, BreakpointPolicy::default());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
logging:
  level: debug
  format: json
storage:
  type: redis
  key_prefix: "issuer:"
  dial_timeout: 2s
  redis:
    host: cache.internal
    port: 6380
    password: secret
rate_limiting:
  failure_penalty: 10m
  retention: 24h
  ip_policy:
    - requests: 10
      timeout: 30m
  phone_policy:
    - requests: 5
      timeout: 30m
"#;
        let config = LimiterConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.storage.dial_timeout, Duration::from_secs(2));
        assert_eq!(
            config.storage.redis_target().unwrap(),
            Some(RedisTarget::Direct {
                host: "cache.internal".to_string(),
                port: 6380,
                username: None,
                password: Some("secret".to_string()),
                db: 0,
            })
        );

        let redis = config.storage.redis_storage_config(config.rate_limiting.retention);
        assert_eq!(redis.key_prefix, "issuer:");
        assert_eq!(redis.ttl, Duration::from_secs(86_400));

        let limits = &config.rate_limiting;
        assert_eq!(limits.failure_penalty, Duration::from_secs(600));
        assert_eq!(limits.ip_policy.timeout_for(9), Duration::ZERO);
        assert_eq!(limits.ip_policy.timeout_for(10), Duration::from_secs(1800));
        assert_eq!(limits.phone_policy.timeout_for(5), Duration::from_secs(1800));
    }

    #[test]
    fn test_parse_sentinel_config() {
        let yaml = r#"
storage:
  type: redis_sentinel
  sentinel:
    sentinel_host: sentinel.internal
    master_name: issuer
    password: secret
"#;
        let config = LimiterConfig::from_yaml(yaml).unwrap();

        match config.storage.redis_target().unwrap() {
            Some(RedisTarget::Sentinel {
                sentinel_host,
                sentinel_port,
                master_name,
                ..
            }) => {
                assert_eq!(sentinel_host, "sentinel.internal");
                assert_eq!(sentinel_port, 26379);
                assert_eq!(master_name, "issuer");
            }
            other => panic!("unexpected target: {:?}", other),
        }
    }

    #[test]
    fn test_redis_type_requires_section() {
        let config = LimiterConfig::from_yaml("storage:\n  type: redis\n").unwrap();
        assert!(matches!(
            config.storage.redis_target(),
            Err(LimiterError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let yaml = r#"
rate_limiting:
  ip_policy:
    - requests: 5
      timeout: 1h
    - requests: 6
      timeout: 1m
"#;
        assert!(LimiterConfig::from_yaml(yaml).is_err());
    }

    #[tokio::test]
    async fn test_build_limiter_from_config() {
        let yaml = r#"
rate_limiting:
  failure_penalty: 1m
  phone_policy:
    - requests: 1
      timeout: 10m
"#;
        let config = LimiterConfig::from_yaml(yaml).unwrap();
        let backend = config.connect_storage().await.unwrap();
        assert!(matches!(backend, StorageBackend::Memory(_)));

        let limiter = config.build_limiter(backend.storage(), Arc::new(MockClock::default()));
        assert_eq!(limiter.failure_penalty(), Duration::from_secs(60));

        assert!(limiter.allow("127.0.0.1", "+31612345678").await.allowed);
        let decision = limiter.allow("127.0.0.1", "+31612345678").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, Duration::from_secs(600));
    }

    #[test]
    fn test_zero_transaction_retries_is_rejected() {
        let result = LimiterConfig::from_yaml("storage:\n  max_transaction_retries: 0\n");
        assert!(matches!(result, Err(LimiterError::Config(_))));
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let result = LimiterConfig::from_yaml("rate_limiting:\n  sweep_interval: 0s\n");
        assert!(matches!(result, Err(LimiterError::Config(_))));
    }

    #[test]
    fn test_zero_dial_timeout_is_rejected() {
        let result = LimiterConfig::from_yaml("storage:\n  dial_timeout: 0s\n");
        assert!(matches!(result, Err(LimiterError::Config(_))));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(LimiterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_without_file() {
        let config = LimiterConfig::load(None).unwrap();
        assert_eq!(config.rate_limiting.sweep_interval, Duration::from_secs(3600));
    }
}
