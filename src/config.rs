//! Coordinator configuration
//!
//! Every knob has a default; `from_env` overlays the recognized environment
//! variables on top of them and validates the result eagerly, so a bad
//! deployment fails at construction instead of at 3am under load.

use crate::error::ConfigError;
use crate::queue::OverflowStrategy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Retry knobs (`RETRY_*`).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(2000),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Circuit breaker knobs (`CB_*`).
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub half_open_after: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, half_open_after: Duration::from_secs(60) }
    }
}

/// Webhook broadcaster knobs (`FEEDBACK_HTTP_*`).
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub timeout: Duration,
    pub max_retries: usize,
    pub backoff_base: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            timeout: Duration::from_secs_f64(2.5),
            max_retries: 3,
            backoff_base: Duration::from_secs_f64(0.5),
        }
    }
}

/// Full coordinator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Identifier stamped on feedback events and metric labels. A builder
    /// argument takes precedence; without either, `"default"`.
    pub coord_id: Option<String>,
    pub capacity: usize,
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Defaults to 80% of capacity when unset.
    pub high_watermark: Option<usize>,
    /// Defaults to 50% of capacity when unset.
    pub low_watermark: Option<usize>,
    pub overflow: OverflowStrategy,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub metrics_poll_interval: Duration,
    pub feedback_http: WebhookConfig,
    /// Dead-letter file; `None` disables the DLQ.
    pub dlq_path: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coord_id: None,
            capacity: 10_000,
            workers: 4,
            batch_size: 500,
            flush_interval: Duration::from_secs_f64(0.25),
            high_watermark: None,
            low_watermark: None,
            overflow: OverflowStrategy::Block,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            metrics_poll_interval: Duration::from_secs_f64(0.25),
            feedback_http: WebhookConfig::default(),
            dlq_path: None,
        }
    }
}

impl CoordinatorConfig {
    /// Load from the process environment and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Effective high watermark (80% of capacity when unset).
    pub fn resolved_high_watermark(&self) -> usize {
        self.high_watermark.unwrap_or(self.capacity * 8 / 10)
    }

    /// Effective low watermark (50% of capacity when unset).
    pub fn resolved_low_watermark(&self) -> usize {
        self.low_watermark.unwrap_or(self.capacity / 2)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        set(&mut config.capacity, &lookup, "COORDINATOR_CAPACITY")?;
        set(&mut config.workers, &lookup, "COORDINATOR_WORKERS")?;
        set(&mut config.batch_size, &lookup, "COORDINATOR_BATCH_SIZE")?;
        set_secs(&mut config.flush_interval, &lookup, "COORDINATOR_FLUSH_INTERVAL")?;
        set_opt(&mut config.high_watermark, &lookup, "COORDINATOR_HIGH_WATERMARK")?;
        set_opt(&mut config.low_watermark, &lookup, "COORDINATOR_LOW_WATERMARK")?;
        set(&mut config.overflow, &lookup, "COORDINATOR_OVERFLOW")?;

        set(&mut config.retry.max_attempts, &lookup, "RETRY_MAX_ATTEMPTS")?;
        set_millis(&mut config.retry.initial_backoff, &lookup, "RETRY_INITIAL_BACKOFF_MS")?;
        set_millis(&mut config.retry.max_backoff, &lookup, "RETRY_MAX_BACKOFF_MS")?;
        set(&mut config.retry.backoff_multiplier, &lookup, "RETRY_BACKOFF_MULTIPLIER")?;
        set_bool(&mut config.retry.jitter, &lookup, "RETRY_JITTER")?;

        set(&mut config.breaker.failure_threshold, &lookup, "CB_FAILURE_THRESHOLD")?;
        set_secs(&mut config.breaker.half_open_after, &lookup, "CB_HALF_OPEN_AFTER_SEC")?;

        set_secs(&mut config.metrics_poll_interval, &lookup, "METRICS_QUEUE_POLL_SEC")?;

        set_bool(&mut config.feedback_http.enabled, &lookup, "FEEDBACK_HTTP_ENABLED")?;
        if let Some(endpoint) = lookup("FEEDBACK_HTTP_ENDPOINT") {
            config.feedback_http.endpoint = Some(endpoint);
        }
        set_secs(&mut config.feedback_http.timeout, &lookup, "FEEDBACK_HTTP_TIMEOUT")?;
        set(&mut config.feedback_http.max_retries, &lookup, "FEEDBACK_HTTP_MAX_RETRIES")?;
        set_secs(&mut config.feedback_http.backoff_base, &lookup, "FEEDBACK_HTTP_BACKOFF")?;

        if let Some(path) = lookup("DLQ_PATH") {
            config.dlq_path = Some(PathBuf::from(path));
        }

        Ok(config)
    }

    /// Reject invalid combinations eagerly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("COORDINATOR_CAPACITY", "must be > 0"));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("COORDINATOR_WORKERS", "must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("COORDINATOR_BATCH_SIZE", "must be > 0"));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::invalid("COORDINATOR_FLUSH_INTERVAL", "must be > 0"));
        }
        let high = self.resolved_high_watermark();
        let low = self.resolved_low_watermark();
        if high > self.capacity {
            return Err(ConfigError::invalid(
                "COORDINATOR_HIGH_WATERMARK",
                format!("{high} exceeds capacity {}", self.capacity),
            ));
        }
        if low >= high {
            return Err(ConfigError::invalid(
                "COORDINATOR_LOW_WATERMARK",
                format!("{low} must be below the high watermark {high}"),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("RETRY_MAX_ATTEMPTS", "must be > 0"));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(ConfigError::invalid("RETRY_BACKOFF_MULTIPLIER", "must be >= 1.0"));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ConfigError::invalid(
                "RETRY_INITIAL_BACKOFF_MS",
                "must not exceed RETRY_MAX_BACKOFF_MS",
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("CB_FAILURE_THRESHOLD", "must be > 0"));
        }
        if self.metrics_poll_interval.is_zero() {
            return Err(ConfigError::invalid("METRICS_QUEUE_POLL_SEC", "must be > 0"));
        }
        if self.feedback_http.enabled && self.feedback_http.endpoint.is_none() {
            return Err(ConfigError::invalid(
                "FEEDBACK_HTTP_ENDPOINT",
                "required when FEEDBACK_HTTP_ENABLED is set",
            ));
        }
        Ok(())
    }
}

fn set<T, F>(slot: &mut T, lookup: &F, key: &'static str) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot = raw.parse().map_err(|err| ConfigError::invalid(key, format!("{err}")))?;
    }
    Ok(())
}

fn set_opt<T, F>(slot: &mut Option<T>, lookup: &F, key: &'static str) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot =
            Some(raw.parse().map_err(|err| ConfigError::invalid(key, format!("{err}")))?);
    }
    Ok(())
}

fn set_bool<F>(slot: &mut bool, lookup: &F, key: &'static str) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot = match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                return Err(ConfigError::invalid(key, format!("not a boolean: {other:?}")))
            }
        };
    }
    Ok(())
}

fn set_millis<F>(slot: &mut Duration, lookup: &F, key: &'static str) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        let millis: u64 =
            raw.parse().map_err(|err| ConfigError::invalid(key, format!("{err}")))?;
        *slot = Duration::from_millis(millis);
    }
    Ok(())
}

fn set_secs<F>(slot: &mut Duration, lookup: &F, key: &'static str) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        let secs: f64 = raw.parse().map_err(|err| ConfigError::invalid(key, format!("{err}")))?;
        *slot = Duration::try_from_secs_f64(secs)
            .map_err(|err| ConfigError::invalid(key, format!("{err}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> Result<CoordinatorConfig, ConfigError> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        CoordinatorConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.capacity, 10_000);
        assert_eq!(config.workers, 4);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.resolved_high_watermark(), 8_000);
        assert_eq!(config.resolved_low_watermark(), 5_000);
        assert_eq!(config.overflow, OverflowStrategy::Block);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(50));
        assert_eq!(config.retry.max_backoff, Duration::from_millis(2000));
        assert!(config.retry.jitter);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.half_open_after, Duration::from_secs(60));
        assert!(!config.feedback_http.enabled);
        assert_eq!(config.feedback_http.timeout, Duration::from_secs_f64(2.5));
        assert_eq!(config.feedback_http.max_retries, 3);
        assert!(config.dlq_path.is_none());
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn env_overrides_apply() {
        let config = from_map(&[
            ("COORDINATOR_CAPACITY", "100"),
            ("COORDINATOR_WORKERS", "2"),
            ("COORDINATOR_BATCH_SIZE", "25"),
            ("COORDINATOR_FLUSH_INTERVAL", "0.5"),
            ("COORDINATOR_HIGH_WATERMARK", "80"),
            ("COORDINATOR_LOW_WATERMARK", "40"),
            ("COORDINATOR_OVERFLOW", "drop_oldest"),
            ("RETRY_MAX_ATTEMPTS", "3"),
            ("RETRY_INITIAL_BACKOFF_MS", "10"),
            ("RETRY_MAX_BACKOFF_MS", "100"),
            ("RETRY_BACKOFF_MULTIPLIER", "1.5"),
            ("RETRY_JITTER", "false"),
            ("CB_FAILURE_THRESHOLD", "2"),
            ("CB_HALF_OPEN_AFTER_SEC", "1.5"),
            ("METRICS_QUEUE_POLL_SEC", "0.1"),
            ("FEEDBACK_HTTP_ENABLED", "true"),
            ("FEEDBACK_HTTP_ENDPOINT", "http://localhost:9999/hook"),
            ("FEEDBACK_HTTP_TIMEOUT", "1.0"),
            ("FEEDBACK_HTTP_MAX_RETRIES", "1"),
            ("FEEDBACK_HTTP_BACKOFF", "0.25"),
            ("DLQ_PATH", "/var/lib/floodgate/dlq.jsonl"),
        ])
        .expect("parses");

        assert_eq!(config.coord_id, None, "coord_id is set programmatically, not via env");
        assert_eq!(config.capacity, 100);
        assert_eq!(config.workers, 2);
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.flush_interval, Duration::from_millis(500));
        assert_eq!(config.resolved_high_watermark(), 80);
        assert_eq!(config.resolved_low_watermark(), 40);
        assert_eq!(config.overflow, OverflowStrategy::DropOldest);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(10));
        assert!(!config.retry.jitter);
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.half_open_after, Duration::from_secs_f64(1.5));
        assert!(config.feedback_http.enabled);
        assert_eq!(
            config.feedback_http.endpoint.as_deref(),
            Some("http://localhost:9999/hook")
        );
        assert_eq!(config.dlq_path.as_deref(), Some(std::path::Path::new("/var/lib/floodgate/dlq.jsonl")));
        config.validate().expect("valid");
    }

    #[test]
    fn unparseable_values_name_the_key() {
        let err = from_map(&[("COORDINATOR_CAPACITY", "lots")]).unwrap_err();
        let ConfigError::Invalid { key, .. } = err;
        assert_eq!(key, "COORDINATOR_CAPACITY");

        let err = from_map(&[("RETRY_JITTER", "maybe")]).unwrap_err();
        let ConfigError::Invalid { key, .. } = err;
        assert_eq!(key, "RETRY_JITTER");

        let err = from_map(&[("COORDINATOR_OVERFLOW", "oldest")]).unwrap_err();
        let ConfigError::Invalid { key, .. } = err;
        assert_eq!(key, "COORDINATOR_OVERFLOW");
    }

    #[test]
    fn validation_rejects_inverted_watermarks() {
        let mut config = CoordinatorConfig { capacity: 100, ..Default::default() };
        config.high_watermark = Some(40);
        config.low_watermark = Some(40);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "COORDINATOR_LOW_WATERMARK", .. })
        ));

        config.high_watermark = Some(200);
        config.low_watermark = Some(10);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "COORDINATOR_HIGH_WATERMARK", .. })
        ));
    }

    #[test]
    fn validation_rejects_zero_knobs() {
        for (key, value) in [
            ("COORDINATOR_CAPACITY", "0"),
            ("COORDINATOR_WORKERS", "0"),
            ("COORDINATOR_BATCH_SIZE", "0"),
            ("RETRY_MAX_ATTEMPTS", "0"),
            ("CB_FAILURE_THRESHOLD", "0"),
        ] {
            let config = from_map(&[(key, value)]).expect("parses");
            let err = config.validate().unwrap_err();
            let ConfigError::Invalid { key: reported, .. } = err;
            assert_eq!(reported, key);
        }
    }

    #[test]
    fn enabled_webhook_requires_endpoint() {
        let config = from_map(&[("FEEDBACK_HTTP_ENABLED", "1")]).expect("parses");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "FEEDBACK_HTTP_ENDPOINT", .. })
        ));
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        for value in ["1", "true", "YES", "On"] {
            let config = from_map(&[("RETRY_JITTER", value)]).expect("parses");
            assert!(config.retry.jitter, "{value} should parse as true");
        }
        for value in ["0", "false", "No", "OFF"] {
            let config = from_map(&[("RETRY_JITTER", value)]).expect("parses");
            assert!(!config.retry.jitter, "{value} should parse as false");
        }
    }
}
