use std::time::Duration;

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};

use crate::{
    configuration_cache::CacheConfig, flag::CompileLimits, telemetry::TelemetryConfig,
    FailurePolicy,
};

/// Configuration for [`Evaluator`](crate::Evaluator).
///
/// Can be deserialized from JSON with camelCase keys and durations in milliseconds:
/// ```
/// # use toggle_core::EvaluatorConfig;
/// let config: EvaluatorConfig =
///     serde_json::from_str(r#"{"cacheTtl": 60000, "failurePolicy": "fail_open"}"#).unwrap();
/// assert_eq!(config.cache_ttl, std::time::Duration::from_secs(60));
/// ```
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EvaluatorConfig {
    /// Time-to-live of cached flag definitions.
    ///
    /// Defaults to [`EvaluatorConfig::DEFAULT_CACHE_TTL`].
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cache_ttl: Duration,
    /// Time-to-live of cached "flag not found" answers.
    ///
    /// Defaults to [`EvaluatorConfig::DEFAULT_NOT_FOUND_TTL`].
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub not_found_ttl: Duration,
    /// Jitter randomly shortens each entry's TTL by up to this amount. This helps to avoid
    /// entries loaded together expiring together and producing spiky load on the loader.
    ///
    /// Defaults to [`EvaluatorConfig::DEFAULT_TTL_JITTER`].
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ttl_jitter: Duration,
    /// After a failed refresh, the stale value is served for this long before retrying.
    ///
    /// Defaults to [`EvaluatorConfig::DEFAULT_REFRESH_FAILURE_BACKOFF`].
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub refresh_failure_backoff: Duration,
    /// Maximum number of flag keys held by the cache, definitions and confirmed absences
    /// together. Bounds memory when callers pass arbitrary flag keys.
    ///
    /// Defaults to [`EvaluatorConfig::DEFAULT_MAX_CACHE_ENTRIES`].
    pub max_cache_entries: usize,
    /// Deepest targeting rule tree accepted when a definition is loaded.
    ///
    /// Defaults to [`EvaluatorConfig::DEFAULT_MAX_RULE_DEPTH`].
    pub max_rule_depth: usize,
    /// Deadline applied to evaluations that do not specify one. `None` waits for the loader
    /// indefinitely.
    ///
    /// Defaults to [`EvaluatorConfig::DEFAULT_LOAD_TIMEOUT`].
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub load_timeout: Option<Duration>,
    /// Behavior when configuration cannot be loaded and no stale value is available.
    pub failure_policy: FailurePolicy,
    /// Capacity of the telemetry buffer. Events beyond it are dropped.
    ///
    /// Defaults to [`EvaluatorConfig::DEFAULT_TELEMETRY_CAPACITY`].
    pub telemetry_capacity: usize,
    /// Maximum number of events the telemetry worker takes from the buffer per wake-up.
    ///
    /// Defaults to [`EvaluatorConfig::DEFAULT_TELEMETRY_BATCH_SIZE`].
    pub telemetry_batch_size: usize,
    /// Upper bound on how long shutdown waits for queued telemetry to drain.
    ///
    /// Defaults to [`EvaluatorConfig::DEFAULT_TELEMETRY_SHUTDOWN_TIMEOUT`].
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub telemetry_shutdown_timeout: Duration,
    /// Attach attribute values (not only their names) to telemetry events. Attribute values may
    /// carry sensitive data.
    pub include_attribute_values: bool,
}

impl EvaluatorConfig {
    /// Default value for [`EvaluatorConfig::cache_ttl`].
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(120);
    /// Default value for [`EvaluatorConfig::not_found_ttl`].
    pub const DEFAULT_NOT_FOUND_TTL: Duration = Duration::from_secs(30);
    /// Default value for [`EvaluatorConfig::ttl_jitter`].
    pub const DEFAULT_TTL_JITTER: Duration = Duration::from_secs(5);
    /// Default value for [`EvaluatorConfig::refresh_failure_backoff`].
    pub const DEFAULT_REFRESH_FAILURE_BACKOFF: Duration = Duration::from_secs(5);
    /// Default value for [`EvaluatorConfig::max_cache_entries`].
    pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 10_000;
    /// Default value for [`EvaluatorConfig::max_rule_depth`].
    pub const DEFAULT_MAX_RULE_DEPTH: usize = CompileLimits::DEFAULT_MAX_RULE_DEPTH;
    /// Default value for [`EvaluatorConfig::load_timeout`].
    pub const DEFAULT_LOAD_TIMEOUT: Option<Duration> = Some(Duration::from_secs(1));
    /// Default value for [`EvaluatorConfig::telemetry_capacity`].
    pub const DEFAULT_TELEMETRY_CAPACITY: usize = 10_000;
    /// Default value for [`EvaluatorConfig::telemetry_batch_size`].
    pub const DEFAULT_TELEMETRY_BATCH_SIZE: usize = 100;
    /// Default value for [`EvaluatorConfig::telemetry_shutdown_timeout`].
    pub const DEFAULT_TELEMETRY_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

    /// Create a new `EvaluatorConfig` using default configuration.
    pub fn new() -> EvaluatorConfig {
        EvaluatorConfig::default()
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> EvaluatorConfig {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_not_found_ttl(mut self, ttl: Duration) -> EvaluatorConfig {
        self.not_found_ttl = ttl;
        self
    }

    pub fn with_ttl_jitter(mut self, jitter: Duration) -> EvaluatorConfig {
        self.ttl_jitter = jitter;
        self
    }

    pub fn with_refresh_failure_backoff(mut self, backoff: Duration) -> EvaluatorConfig {
        self.refresh_failure_backoff = backoff;
        self
    }

    pub fn with_max_cache_entries(mut self, max_entries: usize) -> EvaluatorConfig {
        self.max_cache_entries = max_entries;
        self
    }

    pub fn with_max_rule_depth(mut self, depth: usize) -> EvaluatorConfig {
        self.max_rule_depth = depth;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Option<Duration>) -> EvaluatorConfig {
        self.load_timeout = timeout;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> EvaluatorConfig {
        self.failure_policy = policy;
        self
    }

    pub fn with_telemetry_capacity(mut self, capacity: usize) -> EvaluatorConfig {
        self.telemetry_capacity = capacity;
        self
    }

    pub fn with_telemetry_batch_size(mut self, batch_size: usize) -> EvaluatorConfig {
        self.telemetry_batch_size = batch_size;
        self
    }

    pub fn with_telemetry_shutdown_timeout(mut self, timeout: Duration) -> EvaluatorConfig {
        self.telemetry_shutdown_timeout = timeout;
        self
    }

    pub fn with_attribute_values(mut self, include: bool) -> EvaluatorConfig {
        self.include_attribute_values = include;
        self
    }

    /// Settings for the configuration cache.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::from(self)
    }

    /// Settings for the telemetry emitter.
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            capacity: self.telemetry_capacity,
            batch_size: self.telemetry_batch_size,
            shutdown_timeout: self.telemetry_shutdown_timeout,
        }
    }
}

impl Default for EvaluatorConfig {
    fn default() -> EvaluatorConfig {
        EvaluatorConfig {
            cache_ttl: EvaluatorConfig::DEFAULT_CACHE_TTL,
            not_found_ttl: EvaluatorConfig::DEFAULT_NOT_FOUND_TTL,
            ttl_jitter: EvaluatorConfig::DEFAULT_TTL_JITTER,
            refresh_failure_backoff: EvaluatorConfig::DEFAULT_REFRESH_FAILURE_BACKOFF,
            max_cache_entries: EvaluatorConfig::DEFAULT_MAX_CACHE_ENTRIES,
            max_rule_depth: EvaluatorConfig::DEFAULT_MAX_RULE_DEPTH,
            load_timeout: EvaluatorConfig::DEFAULT_LOAD_TIMEOUT,
            failure_policy: FailurePolicy::default(),
            telemetry_capacity: EvaluatorConfig::DEFAULT_TELEMETRY_CAPACITY,
            telemetry_batch_size: EvaluatorConfig::DEFAULT_TELEMETRY_BATCH_SIZE,
            telemetry_shutdown_timeout: EvaluatorConfig::DEFAULT_TELEMETRY_SHUTDOWN_TIMEOUT,
            include_attribute_values: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::FailurePolicy;

    use super::EvaluatorConfig;

    #[test]
    fn empty_json_gives_defaults() {
        let config: EvaluatorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EvaluatorConfig::default());
        assert_eq!(config.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.max_rule_depth, 20);
    }

    #[test]
    fn durations_are_milliseconds() {
        let config: EvaluatorConfig = serde_json::from_str(
            r#"{
                "cacheTtl": 1500,
                "loadTimeout": null,
                "telemetryCapacity": 8,
                "maxCacheEntries": 50
            }"#,
        )
        .unwrap();
        assert_eq!(config.cache_config().max_entries, 50);
        assert_eq!(config.cache_ttl, Duration::from_millis(1500));
        assert_eq!(config.load_timeout, None);
        assert_eq!(config.telemetry_capacity, 8);
    }

    #[test]
    fn builders() {
        let config = EvaluatorConfig::new()
            .with_cache_ttl(Duration::from_secs(10))
            .with_ttl_jitter(Duration::ZERO)
            .with_failure_policy(FailurePolicy::FailOpen);
        let cache = config.cache_config();
        assert_eq!(cache.ttl, Duration::from_secs(10));
        assert_eq!(cache.ttl_jitter, Duration::ZERO);
        assert_eq!(cache.limits.max_rule_depth, 20);
    }
}
