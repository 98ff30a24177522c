//! Application configuration.
//!
//! Configuration is an explicit value handed to each component at
//! construction time. Only [`AppConfig::from_env`] reads the process
//! environment; the resolver, delivery client and worker pool never do.

use std::time::Duration;
use thiserror::Error;

/// Default Google Maps API base URL (geocode + timezone endpoints live below it).
pub const DEFAULT_MAPS_BASE_URL: &str = "https://maps.googleapis.com/maps/api";

/// Default messaging endpoint.
pub const DEFAULT_DELIVERY_ENDPOINT: &str = "https://email-service.digitalenvision.com.au";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Settings for the geocoding and time zone upstreams.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// API key for the maps upstream. `None` means the resolver is unconfigured.
    pub api_key: Option<String>,
    /// Base URL; `/geocode/json` and `/timezone/json` are appended.
    pub base_url: String,
    /// Timeout applied to each upstream call.
    pub timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_MAPS_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Settings for the outbound messaging channel.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Endpoint receiving the POST.
    pub endpoint: String,
    /// Bound on each outbound call.
    pub timeout: Duration,
    /// Subject line of the birthday message.
    pub subject: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_DELIVERY_ENDPOINT.to_string(),
            timeout: Duration::from_secs(5),
            subject: "Happy Birthday!".to_string(),
        }
    }
}

/// Settings for the delayed queue and the worker pool draining it.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Queue name, used as a prefix for every Redis key.
    pub queue_name: String,
    /// Number of workers.
    pub num_workers: usize,
    /// Sleep between polls when nothing is due.
    pub poll_interval: Duration,
    /// How long a claimed job stays invisible before it is redelivered.
    pub visibility_timeout: Duration,
    /// Delivery attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// Base delay before redelivering a failed job (doubles per attempt).
    pub retry_delay: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "birthdayQueue".to_string(),
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(300),
            max_attempts: 5,
            retry_delay: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// Notification policy.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Local wall-clock hour of delivery.
    pub delivery_hour: u32,
    /// Window after a successful send during which repeats are suppressed.
    pub dedup_window: chrono::Duration,
    /// How long a worker holds a person's delivery lease while sending.
    pub claim_lease: chrono::Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            delivery_hour: 9,
            dedup_window: chrono::Duration::hours(24),
            claim_lease: chrono::Duration::minutes(2),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection URL for person storage.
    pub database_url: String,
    pub resolver: ResolverConfig,
    pub delivery: DeliveryConfig,
    pub queue: QueueConfig,
    pub notify: NotifyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/birthday_courier".to_string(),
            resolver: ResolverConfig::default(),
            delivery: DeliveryConfig::default(),
            queue: QueueConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl AppConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `BIRTHDAY_QUEUE_NAME`: Queue key prefix (default: birthdayQueue)
    /// - `GOOGLE_MAPS_API_KEY` or `APIKEY`: Resolver credential
    /// - `GEOCODE_BASE_URL`: Maps API base URL
    /// - `RESOLVER_TIMEOUT_SECS`: Upstream timeout (default: 10)
    /// - `DELIVERY_ENDPOINT`: Messaging endpoint
    /// - `DELIVERY_TIMEOUT_SECS`: Outbound timeout (default: 5)
    /// - `NOTIFY_DEDUP_WINDOW_HOURS`: Dedup window (default: 24)
    /// - `NOTIFY_DELIVERY_HOUR`: Local delivery hour (default: 9)
    /// - `NOTIFY_CLAIM_LEASE_SECS`: Delivery lease held while sending (default: 120)
    /// - `WORKER_COUNT`: Number of workers (default: 4)
    /// - `WORKER_POLL_INTERVAL_MS`: Idle poll interval (default: 1000)
    /// - `QUEUE_VISIBILITY_TIMEOUT_SECS`: Claim visibility timeout (default: 300)
    /// - `QUEUE_MAX_ATTEMPTS`: Attempts before dead-letter (default: 5)
    /// - `QUEUE_RETRY_DELAY_SECS`: Base retry delay (default: 60)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        // Resolver
        config.resolver.api_key = std::env::var("GOOGLE_MAPS_API_KEY")
            .or_else(|_| std::env::var("APIKEY"))
            .ok()
            .filter(|key| !key.trim().is_empty());

        if let Ok(val) = std::env::var("GEOCODE_BASE_URL") {
            config.resolver.base_url = val;
        }

        if let Ok(val) = std::env::var("RESOLVER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "RESOLVER_TIMEOUT_SECS")?;
            config.resolver.timeout = Duration::from_secs(secs);
        }

        // Delivery
        if let Ok(val) = std::env::var("DELIVERY_ENDPOINT") {
            config.delivery.endpoint = val;
        }

        if let Ok(val) = std::env::var("DELIVERY_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DELIVERY_TIMEOUT_SECS")?;
            config.delivery.timeout = Duration::from_secs(secs);
        }

        // Notify policy
        if let Ok(val) = std::env::var("NOTIFY_DEDUP_WINDOW_HOURS") {
            let hours: i64 = parse_env_value(&val, "NOTIFY_DEDUP_WINDOW_HOURS")?;
            config.notify.dedup_window = chrono::Duration::hours(hours);
        }

        if let Ok(val) = std::env::var("NOTIFY_DELIVERY_HOUR") {
            config.notify.delivery_hour = parse_env_value(&val, "NOTIFY_DELIVERY_HOUR")?;
        }

        if let Ok(val) = std::env::var("NOTIFY_CLAIM_LEASE_SECS") {
            let secs: i64 = parse_env_value(&val, "NOTIFY_CLAIM_LEASE_SECS")?;
            config.notify.claim_lease = chrono::Duration::seconds(secs);
        }

        // Queue and workers
        if let Ok(val) = std::env::var("REDIS_URL") {
            config.queue.redis_url = val;
        }

        if let Ok(val) = std::env::var("BIRTHDAY_QUEUE_NAME") {
            config.queue.queue_name = val;
        }

        if let Ok(val) = std::env::var("WORKER_COUNT") {
            config.queue.num_workers = parse_env_value(&val, "WORKER_COUNT")?;
        }

        if let Ok(val) = std::env::var("WORKER_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "WORKER_POLL_INTERVAL_MS")?;
            config.queue.poll_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("QUEUE_VISIBILITY_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_VISIBILITY_TIMEOUT_SECS")?;
            config.queue.visibility_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("QUEUE_MAX_ATTEMPTS") {
            config.queue.max_attempts = parse_env_value(&val, "QUEUE_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("QUEUE_RETRY_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_RETRY_DELAY_SECS")?;
            config.queue.retry_delay = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.resolver.base_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "resolver base_url cannot be empty".to_string(),
            ));
        }

        if self.resolver.timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "resolver timeout must be greater than 0".to_string(),
            ));
        }

        if self.delivery.endpoint.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "delivery endpoint cannot be empty".to_string(),
            ));
        }

        if self.delivery.timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "delivery timeout must be greater than 0".to_string(),
            ));
        }

        if self.notify.delivery_hour > 23 {
            return Err(ConfigError::ValidationFailed(
                "delivery_hour must be between 0 and 23".to_string(),
            ));
        }

        if self.notify.dedup_window <= chrono::Duration::zero() {
            return Err(ConfigError::ValidationFailed(
                "dedup_window must be positive".to_string(),
            ));
        }

        // The lease must outlive a full outbound call or a slow send loses it.
        let lease_covers_send = chrono::Duration::from_std(self.delivery.timeout)
            .map(|timeout| self.notify.claim_lease > timeout)
            .unwrap_or(false);
        if !lease_covers_send {
            return Err(ConfigError::ValidationFailed(
                "claim_lease must be longer than the delivery timeout".to_string(),
            ));
        }

        if self.queue.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.queue.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.queue.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.queue.visibility_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "visibility_timeout must be greater than 0".to_string(),
            ));
        }

        // A redelivery that arrives while the lease is still held is skipped and acked.
        let lease_ends_before_redelivery =
            chrono::Duration::from_std(self.queue.visibility_timeout)
                .map(|visibility| self.notify.claim_lease < visibility)
                .unwrap_or(true);
        if !lease_ends_before_redelivery {
            return Err(ConfigError::ValidationFailed(
                "claim_lease must be shorter than visibility_timeout".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the resolver API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.resolver.api_key = Some(key.into());
        self
    }

    /// Builder method to set the maps API base URL.
    pub fn with_maps_base_url(mut self, url: impl Into<String>) -> Self {
        self.resolver.base_url = url.into();
        self
    }

    /// Builder method to set the delivery endpoint.
    pub fn with_delivery_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.delivery.endpoint = endpoint.into();
        self
    }

    /// Builder method to set the delivery timeout.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery.timeout = timeout;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.queue.redis_url = url.into();
        self
    }

    /// Builder method to set the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue.queue_name = name.into();
        self
    }

    /// Builder method to set the number of workers.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.queue.num_workers = num_workers;
        self
    }

    /// Builder method to set the dedup window.
    pub fn with_dedup_window(mut self, window: chrono::Duration) -> Self {
        self.notify.dedup_window = window;
        self
    }

    /// Builder method to set the local delivery hour.
    pub fn with_delivery_hour(mut self, hour: u32) -> Self {
        self.notify.delivery_hour = hour;
        self
    }

    /// Builder method to set the delivery lease.
    pub fn with_claim_lease(mut self, lease: chrono::Duration) -> Self {
        self.notify.claim_lease = lease;
        self
    }

    /// Builder method to set the maximum delivery attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.queue.max_attempts = attempts;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.resolver.base_url, DEFAULT_MAPS_BASE_URL);
        assert!(config.resolver.api_key.is_none());
        assert_eq!(config.delivery.endpoint, DEFAULT_DELIVERY_ENDPOINT);
        assert_eq!(config.delivery.timeout, Duration::from_secs(5));
        assert_eq!(config.delivery.subject, "Happy Birthday!");
        assert_eq!(config.queue.queue_name, "birthdayQueue");
        assert_eq!(config.queue.num_workers, 4);
        assert_eq!(config.notify.delivery_hour, 9);
        assert_eq!(config.notify.dedup_window, chrono::Duration::hours(24));
        assert_eq!(config.notify.claim_lease, chrono::Duration::minutes(2));
    }

    #[test]
    fn test_config_builder() {
        let config = AppConfig::new()
            .with_database_url("postgres://test/db")
            .with_api_key("maps-key")
            .with_maps_base_url("http://localhost:9000")
            .with_delivery_endpoint("http://localhost:9001/send")
            .with_delivery_timeout(Duration::from_secs(2))
            .with_redis_url("redis://custom:6380")
            .with_queue_name("bq")
            .with_num_workers(8)
            .with_dedup_window(chrono::Duration::hours(12))
            .with_delivery_hour(10)
            .with_max_attempts(3);

        assert_eq!(config.database_url, "postgres://test/db");
        assert_eq!(config.resolver.api_key.as_deref(), Some("maps-key"));
        assert_eq!(config.resolver.base_url, "http://localhost:9000");
        assert_eq!(config.delivery.endpoint, "http://localhost:9001/send");
        assert_eq!(config.delivery.timeout, Duration::from_secs(2));
        assert_eq!(config.queue.redis_url, "redis://custom:6380");
        assert_eq!(config.queue.queue_name, "bq");
        assert_eq!(config.queue.num_workers, 8);
        assert_eq!(config.notify.dedup_window, chrono::Duration::hours(12));
        assert_eq!(config.notify.delivery_hour, 10);
        assert_eq!(config.queue.max_attempts, 3);
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_empty_database_url() {
        let result = AppConfig::default().with_database_url("").validate();
        assert!(result.unwrap_err().to_string().contains("database_url"));
    }

    #[test]
    fn test_validation_invalid_delivery_hour() {
        let result = AppConfig::default().with_delivery_hour(24).validate();
        assert!(result.unwrap_err().to_string().contains("delivery_hour"));
    }

    #[test]
    fn test_validation_lease_shorter_than_delivery_timeout() {
        let result = AppConfig::default()
            .with_delivery_timeout(Duration::from_secs(30))
            .with_claim_lease(chrono::Duration::seconds(10))
            .validate();
        assert!(result.unwrap_err().to_string().contains("claim_lease"));
    }

    #[test]
    fn test_validation_lease_outlasting_visibility_timeout() {
        let mut config = AppConfig::default().with_claim_lease(chrono::Duration::minutes(10));
        config.queue.visibility_timeout = Duration::from_secs(300);
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("visibility_timeout"));
    }

    #[test]
    fn test_validation_zero_workers() {
        let result = AppConfig::default().with_num_workers(0).validate();
        assert!(result.unwrap_err().to_string().contains("num_workers"));
    }

    #[test]
    fn test_validation_zero_delivery_timeout() {
        let result = AppConfig::default()
            .with_delivery_timeout(Duration::ZERO)
            .validate();
        assert!(result.unwrap_err().to_string().contains("delivery timeout"));
    }

    #[test]
    fn test_validation_non_positive_dedup_window() {
        let result = AppConfig::default()
            .with_dedup_window(chrono::Duration::zero())
            .validate();
        assert!(result.unwrap_err().to_string().contains("dedup_window"));
    }

    #[test]
    fn test_validation_zero_attempts() {
        let result = AppConfig::default().with_max_attempts(0).validate();
        assert!(result.unwrap_err().to_string().contains("max_attempts"));
    }

    #[test]
    fn test_parse_env_value() {
        let parsed: u64 = parse_env_value("42", "KEY").unwrap();
        assert_eq!(parsed, 42);

        let err = parse_env_value::<u64>("forty-two", "KEY").unwrap_err();
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("forty-two"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingEnvVar("DATABASE_URL".to_string());
        assert!(err.to_string().contains("DATABASE_URL"));

        let err = ConfigError::ValidationFailed("test failure".to_string());
        assert!(err.to_string().contains("test failure"));
    }
}
