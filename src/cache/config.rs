//! Cache configuration.
//!
//! Built from the validated `[cache]`, `[leak_monitor]`, `[metrics]` and
//! `[bypass]` settings, or from [`CacheConfig::default`] in tests.

use std::num::NonZeroUsize;
use std::time::Duration;

use thiserror::Error;

use super::bypass::BypassPolicy;
use super::monitor::LeakThresholds;

const DEFAULT_MAX_BYTES: usize = 256 * 1024 * 1024;
const DEFAULT_MAX_AGE_SECS: u64 = 90;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
const DEFAULT_LEAK_INTERVAL_SECS: u64 = 60;
const DEFAULT_HEALTH_CHECK_USER_AGENT: &str = "render-cache-healthcheck";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// When false every request bypasses the cache.
    pub enabled: bool,
    /// Approximate byte budget of the store.
    pub max_bytes: NonZeroUsize,
    /// Entries older than this are never served.
    pub max_age: Duration,
    /// Interval of the background purge and prune task.
    pub sweep_interval: Duration,
    /// Interval of the leak monitor.
    pub leak_interval: Duration,
    pub leak: LeakThresholds,
    /// User agent identifying the health checker.
    pub health_check_user_agent: String,
    pub bypass: BypassPolicy,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheConfigError {
    #[error("cache max age must be greater than zero")]
    ZeroMaxAge,
}

impl CacheConfig {
    pub(crate) fn validate(&self) -> Result<(), CacheConfigError> {
        if self.max_age.is_zero() {
            return Err(CacheConfigError::ZeroMaxAge);
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: NonZeroUsize::new(DEFAULT_MAX_BYTES).unwrap_or(NonZeroUsize::MIN),
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            leak_interval: Duration::from_secs(DEFAULT_LEAK_INTERVAL_SECS),
            leak: LeakThresholds::default(),
            health_check_user_agent: DEFAULT_HEALTH_CHECK_USER_AGENT.to_string(),
            bypass: BypassPolicy::default(),
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            enabled: settings.cache.enabled,
            max_bytes: settings.cache.max_bytes,
            max_age: settings.cache.max_age,
            sweep_interval: settings.cache.sweep_interval,
            leak_interval: settings.leak_monitor.interval,
            leak: LeakThresholds {
                max_base_keys: settings.leak_monitor.max_base_keys.get(),
                max_variants: settings.leak_monitor.max_variants.get(),
                max_in_flight: settings.leak_monitor.max_in_flight.get(),
                max_bytes: settings.leak_monitor.max_bytes.get(),
            },
            health_check_user_agent: settings.metrics.health_check_user_agent.clone(),
            bypass: BypassPolicy {
                excluded_path_prefixes: settings.bypass.excluded_path_prefixes.clone(),
                user_agent_prefixes: settings.bypass.user_agent_prefixes.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_bytes.get(), 256 * 1024 * 1024);
        assert_eq!(config.max_age, Duration::from_secs(90));
    }

    #[test]
    fn zero_max_age_is_rejected() {
        let config = CacheConfig {
            max_age: Duration::ZERO,
            ..CacheConfig::default()
        };
        assert_eq!(config.validate(), Err(CacheConfigError::ZeroMaxAge));
    }
}
