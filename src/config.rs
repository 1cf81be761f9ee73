//! Configuration management

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::cache::{CacheConfig, DomainPolicy};
use crate::connection::{BackoffConfig, ConnectionConfig};
use crate::error::{CoreError, Result};
use crate::resilience::{CircuitBreakerConfig, QueueConfig, RateLimitConfig};
use crate::transport::websocket_url;

/// Service domains that can run arbitrary code on the remote host
pub const DEFAULT_BLOCKED_SERVICE_DOMAINS: [&str; 3] =
    ["shell_command", "python_script", "rest_command"];

/// Client configuration
#[derive(Clone)]
pub struct Config {
    /// Home Assistant base URL (`http(s)://` or `ws(s)://`)
    pub url: String,

    /// Long-lived access token
    pub access_token: Zeroizing<String>,

    /// Handshake, request and heartbeat timing plus reconnect backoff
    pub connection: ConnectionConfig,

    /// Entity cache staleness and domain filtering
    pub cache: CacheConfig,

    pub circuit_breaker: CircuitBreakerConfig,

    pub queue: QueueConfig,

    pub rate_limit: RateLimitConfig,

    /// Service domains `call_service` refuses
    pub blocked_service_domains: HashSet<String>,

    /// Period of queue purging and rate window cleanup
    pub maintenance_interval: Duration,

    /// Period of the stats line logged by the binary
    pub stats_interval: Duration,
}

impl Config {
    /// Defaults for everything except the endpoint and credential
    pub fn new(url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: Zeroizing::new(access_token.into()),
            connection: ConnectionConfig::default(),
            cache: CacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            queue: QueueConfig::default(),
            rate_limit: RateLimitConfig::default(),
            blocked_service_domains: DEFAULT_BLOCKED_SERVICE_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
            maintenance_interval: Duration::from_secs(10),
            stats_interval: Duration::from_secs(60),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("HASS_URL")
            .unwrap_or_else(|| "http://homeassistant.local:8123".to_string());
        let access_token = lookup("HASS_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| CoreError::Config("HASS_TOKEN is required".to_string()))?;

        let mut config = Self::new(url, access_token);

        let connection = &mut config.connection;
        connection.auth_timeout = secs(&lookup, "HASS_AUTH_TIMEOUT_SECS", connection.auth_timeout);
        connection.request_timeout =
            secs(&lookup, "HASS_REQUEST_TIMEOUT_SECS", connection.request_timeout);
        connection.heartbeat_interval =
            secs(&lookup, "HASS_HEARTBEAT_INTERVAL_SECS", connection.heartbeat_interval);
        connection.heartbeat_timeout =
            secs(&lookup, "HASS_HEARTBEAT_TIMEOUT_SECS", connection.heartbeat_timeout);

        let backoff = &mut connection.backoff;
        *backoff = BackoffConfig {
            max_attempts: parsed(&lookup, "HASS_RECONNECT_MAX_ATTEMPTS", backoff.max_attempts),
            initial_delay: millis(
                &lookup,
                "HASS_RECONNECT_INITIAL_DELAY_MS",
                backoff.initial_delay,
            ),
            max_delay: millis(&lookup, "HASS_RECONNECT_MAX_DELAY_MS", backoff.max_delay),
            jitter_factor: parsed(&lookup, "HASS_RECONNECT_JITTER", backoff.jitter_factor),
        };

        let cache = &mut config.cache;
        cache.staleness_bound = secs(&lookup, "HASS_CACHE_STALENESS_SECS", cache.staleness_bound);
        cache.refresh_wait = secs(&lookup, "HASS_CACHE_REFRESH_WAIT_SECS", cache.refresh_wait);
        cache.policy = DomainPolicy {
            allowed_domains: list(&lookup, "HASS_ALLOWED_DOMAINS").unwrap_or_default(),
            blocked_domains: list(&lookup, "HASS_BLOCKED_DOMAINS").unwrap_or_default(),
            blocked_entities: list(&lookup, "HASS_BLOCKED_ENTITIES").unwrap_or_default(),
        };

        let breaker = &mut config.circuit_breaker;
        breaker.failure_threshold =
            parsed(&lookup, "HASS_BREAKER_FAILURE_THRESHOLD", breaker.failure_threshold);
        breaker.reset_timeout = secs(&lookup, "HASS_BREAKER_RESET_SECS", breaker.reset_timeout);
        breaker.failure_window = secs(&lookup, "HASS_BREAKER_WINDOW_SECS", breaker.failure_window);

        let queue = &mut config.queue;
        queue.max_size = parsed(&lookup, "HASS_QUEUE_MAX_SIZE", queue.max_size);
        queue.max_age = secs(&lookup, "HASS_QUEUE_MAX_AGE_SECS", queue.max_age);

        let limits = &mut config.rate_limit;
        limits.max_requests = parsed(&lookup, "HASS_RATE_LIMIT", limits.max_requests);
        limits.window = secs(&lookup, "HASS_RATE_WINDOW_SECS", limits.window);
        limits.enable_global_limit = lookup("HASS_GLOBAL_RATE_LIMIT_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(limits.enable_global_limit);
        limits.global_max_requests =
            parsed(&lookup, "HASS_GLOBAL_RATE_LIMIT", limits.global_max_requests);

        if let Some(blocked) = list(&lookup, "HASS_BLOCKED_SERVICE_DOMAINS") {
            config.blocked_service_domains = blocked;
        }
        config.maintenance_interval =
            secs(&lookup, "HASS_MAINTENANCE_INTERVAL_SECS", config.maintenance_interval);
        config.stats_interval = secs(&lookup, "HASS_STATS_INTERVAL_SECS", config.stats_interval);

        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> Result<()> {
        websocket_url(&self.url)?;
        if self.access_token.trim().is_empty() {
            return Err(CoreError::Config("access token is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.connection.backoff.jitter_factor) {
            return Err(CoreError::Config(format!(
                "reconnect jitter must be within 0..=1, got {}",
                self.connection.backoff.jitter_factor
            )));
        }
        if self.connection.request_timeout.is_zero() || self.connection.auth_timeout.is_zero() {
            return Err(CoreError::Config("timeouts must be non-zero".to_string()));
        }
        if !self.connection.heartbeat_interval.is_zero()
            && self.connection.heartbeat_timeout.is_zero()
        {
            return Err(CoreError::Config(
                "heartbeat timeout must be non-zero while the heartbeat is enabled".to_string(),
            ));
        }
        if self.queue.max_size == 0 {
            return Err(CoreError::Config("queue size must be at least 1".to_string()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(CoreError::Config("breaker threshold must be at least 1".to_string()));
        }
        if self.maintenance_interval.is_zero() {
            return Err(CoreError::Config("maintenance interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("url", &self.url)
            .field("access_token", &"[redacted]")
            .field("connection", &self.connection)
            .field("cache", &self.cache)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("queue", &self.queue)
            .field("rate_limit", &self.rate_limit)
            .field("blocked_service_domains", &self.blocked_service_domains)
            .field("maintenance_interval", &self.maintenance_interval)
            .field("stats_interval", &self.stats_interval)
            .finish()
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unparsable {}={:?}", key, raw);
            default
        }),
        None => default,
    }
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(parsed(lookup, key, default.as_secs()))
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_millis(parsed(lookup, key, default.as_millis() as u64))
}

/// Comma separated set; `None` when the variable is unset
fn list<F>(lookup: &F, key: &str) -> Option<HashSet<String>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|raw| {
        raw.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("HASS_TOKEN", "secret")]).unwrap();
        assert_eq!(config.url, "http://homeassistant.local:8123");
        assert_eq!(config.connection.backoff.max_attempts, 10);
        assert_eq!(config.connection.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.connection.request_timeout, Duration::from_secs(60));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.queue.max_size, 100);
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.global_max_requests, 1000);
        assert!(config.blocked_service_domains.contains("shell_command"));
        assert!(config.cache.policy.allowed_domains.is_empty());
    }

    #[test]
    fn test_token_is_required_and_redacted() {
        assert!(matches!(load(&[]), Err(CoreError::Config(_))));
        assert!(matches!(load(&[("HASS_TOKEN", "  ")]), Err(CoreError::Config(_))));

        let config = load(&[("HASS_TOKEN", "very-secret-token")]).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("very-secret-token"));
        assert!(debug.contains("[redacted]"));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("HASS_URL", "https://ha.example.com"),
            ("HASS_TOKEN", "secret"),
            ("HASS_RECONNECT_MAX_ATTEMPTS", "3"),
            ("HASS_RECONNECT_INITIAL_DELAY_MS", "250"),
            ("HASS_HEARTBEAT_INTERVAL_SECS", "0"),
            ("HASS_ALLOWED_DOMAINS", "light, switch,,sensor"),
            ("HASS_BLOCKED_ENTITIES", "lock.front_door"),
            ("HASS_RATE_LIMIT", "20"),
            ("HASS_GLOBAL_RATE_LIMIT_ENABLED", "false"),
            ("HASS_BLOCKED_SERVICE_DOMAINS", "shell_command"),
        ])
        .unwrap();

        assert_eq!(config.url, "https://ha.example.com");
        assert_eq!(config.connection.backoff.max_attempts, 3);
        assert_eq!(config.connection.backoff.initial_delay, Duration::from_millis(250));
        assert!(config.connection.heartbeat_interval.is_zero());
        assert_eq!(config.cache.policy.allowed_domains.len(), 3);
        assert!(config.cache.policy.allowed_domains.contains("switch"));
        assert!(!config.cache.policy.admits("lock.front_door"));
        assert_eq!(config.rate_limit.max_requests, 20);
        assert!(!config.rate_limit.enable_global_limit);
        assert_eq!(config.blocked_service_domains.len(), 1);
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = load(&[("HASS_TOKEN", "secret"), ("HASS_QUEUE_MAX_SIZE", "lots")]).unwrap();
        assert_eq!(config.queue.max_size, 100);
    }

    #[test]
    fn test_validation() {
        assert!(load(&[("HASS_TOKEN", "secret"), ("HASS_URL", "ftp://ha")]).is_err());
        assert!(load(&[("HASS_TOKEN", "secret"), ("HASS_RECONNECT_JITTER", "1.5")]).is_err());
        assert!(load(&[("HASS_TOKEN", "secret"), ("HASS_QUEUE_MAX_SIZE", "0")]).is_err());
    }

    #[test]
    fn test_zero_heartbeat_timeout_needs_disabled_heartbeat() {
        let result = load(&[("HASS_TOKEN", "secret"), ("HASS_HEARTBEAT_TIMEOUT_SECS", "0")]);
        assert!(matches!(result, Err(CoreError::Config(_))));

        let config = load(&[
            ("HASS_TOKEN", "secret"),
            ("HASS_HEARTBEAT_INTERVAL_SECS", "0"),
            ("HASS_HEARTBEAT_TIMEOUT_SECS", "0"),
        ])
        .unwrap();
        assert!(config.connection.heartbeat_interval.is_zero());
    }
}
