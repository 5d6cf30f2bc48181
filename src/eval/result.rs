use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::Str;

/// Why an evaluation produced its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// The flag's kill switch is off, or its definition is invalid.
    Disabled,
    /// The flag does not exist.
    NotFound,
    /// Targeting rules matched and the subject is within the rollout.
    TargetingMatch,
    /// Targeting rules did not match.
    TargetingMiss,
    /// The flag has no targeting rules and the subject is within the rollout.
    RolloutIncluded,
    /// The subject's rollout bucket is outside the rollout percentage.
    RolloutExcluded,
    /// Configuration was unavailable and the caller asked to fail open.
    Default,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Disabled => "DISABLED",
            Reason::NotFound => "NOT_FOUND",
            Reason::TargetingMatch => "TARGETING_MATCH",
            Reason::TargetingMiss => "TARGETING_MISS",
            Reason::RolloutIncluded => "ROLLOUT_INCLUDED",
            Reason::RolloutExcluded => "ROLLOUT_EXCLUDED",
            Reason::Default => "DEFAULT",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating one flag for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub enabled: bool,
    pub variant: Option<Str>,
    pub reason: Reason,
    /// Version of the definition used, for audit correlation. `None` if no valid definition was
    /// available.
    pub flag_version: Option<u64>,
}

impl EvaluationResult {
    pub(crate) fn disabled(reason: Reason, flag_version: Option<u64>) -> EvaluationResult {
        EvaluationResult {
            enabled: false,
            variant: None,
            reason,
            flag_version,
        }
    }
}

/// What to do when configuration cannot be obtained (`LOAD_FAILED` or `TIMEOUT` without a stale
/// value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Return the error to the caller.
    #[default]
    FailClosed,
    /// Return `{enabled: false, reason: DEFAULT}`.
    FailOpen,
}

/// Per-call overrides. Unset fields fall back to [`EvaluatorConfig`](crate::EvaluatorConfig).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluateOptions {
    /// Point in time after which a stale value (or `TIMEOUT`) is returned instead of waiting for
    /// the loader.
    pub deadline: Option<Instant>,
    pub failure_policy: Option<FailurePolicy>,
    pub include_attribute_values: Option<bool>,
}

impl EvaluateOptions {
    pub fn new() -> EvaluateOptions {
        EvaluateOptions::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> EvaluateOptions {
        self.deadline = Some(deadline);
        self
    }

    /// Set the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> EvaluateOptions {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> EvaluateOptions {
        self.failure_policy = Some(policy);
        self
    }

    pub fn with_attribute_values(mut self, include: bool) -> EvaluateOptions {
        self.include_attribute_values = Some(include);
        self
    }
}
