//! Feature flag and experiment evaluation engine.
//!
//! # Overview
//!
//! The engine revolves around an [`Evaluator`] that decides, for a subject (usually a user) and a
//! flag key, whether the flag is enabled, which variant the subject receives, and why. Each
//! subject has a unique id and key-value attributes, bundled in an [`EvaluationContext`].
//! Evaluation results in an [`EvaluationResult`] carrying a [`Reason`].
//!
//! Assignment is deterministic: the same subject gets the same answer from every process that
//! holds the same flag definition, without any coordination. Rollout and variant buckets are
//! derived from an MD5 hash of the subject id (see [`sharder`]).
//!
//! Flag definitions are obtained from a [`ConfigurationLoader`] (for example
//! [`ConfigurationFetcher`] over HTTP, or [`StaticLoader`] in memory) and kept in a
//! [`ConfigurationCache`] that collapses concurrent loads and keeps serving the last good
//! definition when a refresh fails.
//!
//! Every evaluation is reported to a [`TelemetrySink`] from a background thread. Telemetry is
//! lossy by design: when the sink cannot keep up, events are dropped and counted in
//! [`MetricsSnapshot::dropped_telemetry`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Use [`Error::kind`] to classify them.
//!
//! Absent, disabled and invalid flags are not errors: they evaluate to a result with
//! [`Reason::NotFound`] or [`Reason::Disabled`]. With [`FailurePolicy::FailOpen`], configuration
//! outages also produce a result ([`Reason::Default`]) instead of an error.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with structured key-values,
//! under the `toggle` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into cache loads and degraded-mode events.

#![warn(rustdoc::missing_crate_level_docs)]

mod attributes;
mod config;
mod configuration_cache;
mod configuration_fetcher;
mod configuration_loader;
mod error;
mod eval;
mod metrics;
mod str;

pub mod flag;
pub mod sharder;
pub mod telemetry;

pub use crate::str::Str;
pub use attributes::{
    AttributeValue, Attributes, EvaluationContext, NOW_ATTRIBUTE, SUBJECT_ID_ATTRIBUTE,
};
pub use config::EvaluatorConfig;
pub use configuration_cache::{CacheConfig, CacheEntry, CachedFlag, ConfigurationCache};
pub use configuration_fetcher::{ConfigurationFetcher, ConfigurationFetcherConfig};
pub use configuration_loader::{ConfigurationLoader, LoadFuture, LoadOutcome, StaticLoader};
pub use error::{ConfigError, Error, ErrorKind, Result};
pub use eval::{EvaluateOptions, EvaluationResult, Evaluator, FailurePolicy, Reason};
pub use metrics::{Metrics, MetricsSnapshot};
pub use telemetry::{EvaluationEvent, LogSink, NoopSink, TelemetrySink};
