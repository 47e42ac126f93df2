//! Environment-driven runtime configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Runtime configuration for the delivery pipeline.
///
/// Every knob has a production default; `from_env` overrides from the
/// process environment and rejects inconsistent combinations at load
/// time rather than at the first delivery.
#[derive(Debug, Clone)]
pub struct CourierConfig {
    /// Number of concurrent queue consumers.
    pub worker_concurrency: usize,

    /// Total attempts allowed per delivery (not additional retries).
    pub retry_limit: u32,

    /// Backoff schedule; saturates at the last entry.
    pub retry_delays: Vec<Duration>,

    /// Attempt rows older than this are swept.
    pub log_retention: Duration,

    /// Hard per-attempt deadline covering connect, write and read.
    pub dispatch_timeout: Duration,

    /// How long a dequeued task stays invisible before redelivery.
    pub visibility_timeout: Duration,

    /// Cadence of the recovery scan for orphaned and stale deliveries.
    pub reconcile_interval: Duration,

    /// Cadence of the attempt-retention sweep.
    pub retention_sweep_interval: Duration,

    /// How long shutdown waits for in-flight attempts.
    pub shutdown_grace: Duration,

    /// Lifetime of cached subscription rows.
    pub subscription_cache_ttl: Duration,

    /// Reject unsigned ingestion when the subscription has a secret.
    /// Off by default: an absent signature is accepted as-is.
    pub require_signature_when_secret: bool,

    /// Store binding, consumed by the postgres backend.
    pub postgres_dsn: String,

    /// Queue binding, consumed by the redis backend.
    pub redis_url: String,

    /// Listen port, carried for the admin surface.
    pub port: u16,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 10,
            retry_limit: 5,
            retry_delays: vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(5 * 60),
                Duration::from_secs(15 * 60),
            ],
            log_retention: Duration::from_secs(72 * 3600),
            dispatch_timeout: Duration::from_secs(10),
            visibility_timeout: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(60),
            retention_sweep_interval: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(30),
            subscription_cache_ttl: Duration::from_secs(5 * 60),
            require_signature_when_secret: false,
            postgres_dsn: "host=localhost port=5432 user=postgres password=postgres \
                           dbname=webhook_courier"
                .to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            port: 8080,
        }
    }
}

impl CourierConfig {
    /// Loads configuration from the environment on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            worker_concurrency: env_parse("WORKER_CONCURRENCY", defaults.worker_concurrency)?,
            retry_limit: env_parse("RETRY_LIMIT", defaults.retry_limit)?,
            retry_delays: match env::var("RETRY_DELAYS") {
                Ok(raw) => parse_delay_list(&raw)
                    .ok_or(ConfigError::Invalid { var: "RETRY_DELAYS", value: raw })?,
                Err(_) => defaults.retry_delays,
            },
            log_retention: Duration::from_secs(
                env_parse::<u64>("LOG_RETENTION_HOURS", 72)? * 3600,
            ),
            dispatch_timeout: env_duration("DISPATCH_TIMEOUT", defaults.dispatch_timeout)?,
            visibility_timeout: env_duration("VISIBILITY_TIMEOUT", defaults.visibility_timeout)?,
            reconcile_interval: env_duration("RECONCILE_INTERVAL", defaults.reconcile_interval)?,
            retention_sweep_interval: env_duration(
                "RETENTION_SWEEP_INTERVAL",
                defaults.retention_sweep_interval,
            )?,
            shutdown_grace: env_duration("SHUTDOWN_GRACE", defaults.shutdown_grace)?,
            subscription_cache_ttl: env_duration(
                "SUBSCRIPTION_CACHE_TTL",
                defaults.subscription_cache_ttl,
            )?,
            require_signature_when_secret: env_parse(
                "REQUIRE_SIGNATURE",
                defaults.require_signature_when_secret,
            )?,
            postgres_dsn: env::var("POSTGRES_DSN").unwrap_or(defaults.postgres_dsn),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            port: env_parse("PORT", defaults.port)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.retry_delays.is_empty() && self.retry_limit > 1 {
            return Err(ConfigError::EmptyRetryDelays);
        }
        if self.visibility_timeout < self.dispatch_timeout {
            return Err(ConfigError::VisibilityBelowDispatchTimeout);
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        Err(_) => Ok(default),
    }
}

fn env_duration(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Ok(raw) => parse_duration(&raw).ok_or(ConfigError::Invalid { var, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Parses durations of the form `500ms`, `10s`, `5m` or `1h`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (value, unit) = raw.split_at(raw.find(|c: char| !c.is_ascii_digit())?);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// Parses a comma-separated backoff schedule such as `10s,30s,1m,5m,15m`.
pub fn parse_delay_list(raw: &str) -> Option<Vec<Duration>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_duration)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_durations() {
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn parses_the_default_schedule() {
        let delays = parse_delay_list("10s,30s,1m,5m,15m").unwrap();
        assert_eq!(delays, CourierConfig::default().retry_delays);
    }

    #[test]
    fn rejects_malformed_schedules() {
        assert_eq!(parse_delay_list("10s,oops"), None);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(CourierConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_empty_delays_with_budget_above_one() {
        let config = CourierConfig {
            retry_delays: Vec::new(),
            ..CourierConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyRetryDelays));

        // A single-attempt budget never consults the schedule.
        let config = CourierConfig {
            retry_delays: Vec::new(),
            retry_limit: 1,
            ..CourierConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_workers() {
        let config = CourierConfig {
            worker_concurrency: 0,
            ..CourierConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoWorkers));
    }

    #[test]
    fn rejects_visibility_below_dispatch_timeout() {
        let config = CourierConfig {
            visibility_timeout: Duration::from_secs(5),
            ..CourierConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::VisibilityBelowDispatchTimeout)
        );
    }
}
