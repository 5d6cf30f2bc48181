use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::Utc;
use tokio::time::Instant;

use crate::{
    configuration_cache::{CacheEntry, ConfigurationCache},
    configuration_loader::ConfigurationLoader,
    error::ErrorKind,
    metrics::{Metrics, MetricsSnapshot},
    sharder::Md5Sharder,
    telemetry::{EvaluationEvent, TelemetryEmitter, TelemetrySink},
    Error, EvaluationContext, EvaluatorConfig, Result, Str,
};

use super::{EvaluateOptions, EvaluationResult, FailurePolicy, Reason};

/// Entry point of the engine: evaluates flags for subjects.
///
/// An `Evaluator` owns the configuration cache and the telemetry worker. It is meant to be
/// created once per process and shared (e.g. behind an `Arc`) between all concurrent callers, so
/// that they share one warm cache.
///
/// # Examples
/// ```
/// # tokio_test_block_on(async {
/// use toggle_core::{EvaluationContext, Evaluator, EvaluatorConfig, NoopSink, StaticLoader};
///
/// let loader = StaticLoader::from_json(
///     r#"{"flags": {"new-checkout": {"key": "new-checkout", "enabled": true}}}"#,
/// )?;
/// let evaluator = Evaluator::new(loader, NoopSink, EvaluatorConfig::default())?;
///
/// let result = evaluator
///     .evaluate("new-checkout", &EvaluationContext::new("user-1"))
///     .await?;
/// assert!(result.enabled);
/// # Ok::<(), toggle_core::Error>(())
/// # }).unwrap();
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
pub struct Evaluator {
    cache: Arc<ConfigurationCache>,
    telemetry: TelemetryEmitter,
    metrics: Arc<Metrics>,
    config: EvaluatorConfig,
}

impl Evaluator {
    /// Create an evaluator and start its telemetry worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the telemetry worker thread cannot be spawned.
    pub fn new(
        loader: impl ConfigurationLoader + 'static,
        sink: impl TelemetrySink + 'static,
        config: EvaluatorConfig,
    ) -> Result<Evaluator> {
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(ConfigurationCache::new(
            Arc::new(loader),
            config.cache_config(),
            Arc::clone(&metrics),
        ));
        let telemetry = TelemetryEmitter::start(
            Arc::new(sink),
            config.telemetry_config(),
            Arc::clone(&metrics),
        )?;

        Ok(Evaluator {
            cache,
            telemetry,
            metrics,
            config,
        })
    }

    /// Evaluate `flag_key` for `context` with the configured defaults.
    ///
    /// # Errors
    ///
    /// See [`Evaluator::evaluate_with`].
    pub async fn evaluate(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
    ) -> Result<EvaluationResult> {
        self.evaluate_with(flag_key, context, &EvaluateOptions::default())
            .await
    }

    /// Evaluate `flag_key` for `context`.
    ///
    /// Absent, disabled and invalid flags are not errors: they produce a result with the
    /// corresponding [`Reason`]. Every result is sent to telemetry.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if the subject id or flag key is empty. No event is recorded.
    /// - Under [`FailurePolicy::FailClosed`], [`Error::Timeout`] or a load error if configuration
    ///   could not be obtained and no stale value was cached.
    pub async fn evaluate_with(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        options: &EvaluateOptions,
    ) -> Result<EvaluationResult> {
        validate(flag_key, context)?;
        let deadline = self.deadline(options);
        self.evaluate_valid(flag_key, context, options, deadline)
            .await
    }

    /// Evaluate several flags for one context with the configured defaults.
    ///
    /// # Errors
    ///
    /// See [`Evaluator::evaluate_all_with`].
    pub async fn evaluate_all<I, K>(
        &self,
        flag_keys: I,
        context: &EvaluationContext,
    ) -> Result<HashMap<Str, Result<EvaluationResult>>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.evaluate_all_with(flag_keys, context, &EvaluateOptions::default())
            .await
    }

    /// Evaluate several flags for one context. Repeated keys are evaluated once.
    ///
    /// Each key gets its own outcome: a key whose configuration cannot be obtained does not
    /// affect the others, and the failure policy applies per key. Loads of cold keys run
    /// concurrently under one deadline for the whole batch.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] if the subject id or any flag key is empty. Nothing is evaluated.
    /// Per-key errors are those of [`Evaluator::evaluate_with`].
    pub async fn evaluate_all_with<I, K>(
        &self,
        flag_keys: I,
        context: &EvaluationContext,
        options: &EvaluateOptions,
    ) -> Result<HashMap<Str, Result<EvaluationResult>>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut unique_keys = Vec::new();
        for flag_key in flag_keys {
            let flag_key = flag_key.as_ref();
            validate(flag_key, context)?;
            if seen.insert(Str::from(flag_key)) {
                unique_keys.push(Str::from(flag_key));
            }
        }

        let deadline = self.deadline(options);
        // Start every load before waiting on any of them.
        let loads: Vec<_> = unique_keys
            .into_iter()
            .map(|flag_key| {
                let cache = Arc::clone(&self.cache);
                let key = flag_key.clone();
                let load = tokio::spawn(async move { cache.get_or_load(&key, deadline).await });
                (flag_key, load)
            })
            .collect();

        let mut results = HashMap::with_capacity(loads.len());
        for (flag_key, load) in loads {
            let loaded = load.await.unwrap_or_else(|err| {
                Err(Error::LoadFailed(format!("flag load task failed: {err}")))
            });
            let result = self.finish(&flag_key, context, options, loaded);
            results.insert(flag_key, result);
        }
        Ok(results)
    }

    /// The configuration cache. Exposed for prefetching and push-based invalidation.
    pub fn cache(&self) -> &Arc<ConfigurationCache> {
        &self.cache
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Stop telemetry and wait (bounded) for queued events to be published. Evaluations keep
    /// working after shutdown, but their events are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TelemetryWorkerPanicked`] if the telemetry sink panicked.
    pub fn shutdown(&self) -> Result<()> {
        self.telemetry.shutdown()
    }

    fn deadline(&self, options: &EvaluateOptions) -> Option<Instant> {
        options
            .deadline
            .or_else(|| self.config.load_timeout.map(|timeout| Instant::now() + timeout))
    }

    async fn evaluate_valid(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        options: &EvaluateOptions,
        deadline: Option<Instant>,
    ) -> Result<EvaluationResult> {
        let loaded = self.cache.get_or_load(flag_key, deadline).await;
        self.finish(flag_key, context, options, loaded)
    }

    /// Evaluate against the loaded entry (or apply the failure policy) and report to telemetry.
    fn finish(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        options: &EvaluateOptions,
        loaded: Result<Arc<CacheEntry>>,
    ) -> Result<EvaluationResult> {
        let now = Utc::now();

        let result = match loaded {
            Ok(entry) => entry.value.eval(flag_key, context, now, &Md5Sharder),
            Err(err) => {
                let policy = options.failure_policy.unwrap_or(self.config.failure_policy);
                let recoverable = matches!(err.kind(), ErrorKind::LoadFailed | ErrorKind::Timeout);
                if policy == FailurePolicy::FailOpen && recoverable {
                    log::warn!(target: "toggle", flag_key; "configuration unavailable, failing open: {err}");
                    EvaluationResult::disabled(Reason::Default, None)
                } else {
                    return Err(err);
                }
            }
        };

        log::trace!(target: "toggle",
                    flag_key,
                    subject_id = context.subject_id,
                    result:serde;
                    "evaluated a flag");

        let include_attribute_values = options
            .include_attribute_values
            .unwrap_or(self.config.include_attribute_values);
        self.telemetry.emit(EvaluationEvent::new(
            Str::from(flag_key),
            context,
            &result,
            now,
            include_attribute_values,
        ));

        Ok(result)
    }
}

fn validate(flag_key: &str, context: &EvaluationContext) -> Result<()> {
    if context.subject_id.is_empty() {
        return Err(Error::InvalidInput("subject id must not be empty".to_owned()));
    }
    if flag_key.is_empty() {
        return Err(Error::InvalidInput("flag key must not be empty".to_owned()));
    }
    Ok(())
}
