use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{Attributes, EvaluationContext, EvaluationResult, Reason, Str};

/// Record of one evaluation, handed to a [`TelemetrySink`](super::TelemetrySink).
///
/// Only attribute names are carried by default. Attribute values may hold sensitive data and are
/// attached only when the caller opts in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationEvent {
    pub subject_id: Str,
    pub flag_key: Str,
    pub flag_version: Option<u64>,
    pub enabled: bool,
    pub variant: Option<Str>,
    pub reason: Reason,
    /// Names of the attributes present in the context, sorted.
    pub context_snapshot_keys: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
}

impl EvaluationEvent {
    pub(crate) fn new(
        flag_key: Str,
        context: &EvaluationContext,
        result: &EvaluationResult,
        timestamp: DateTime<Utc>,
        include_attribute_values: bool,
    ) -> EvaluationEvent {
        EvaluationEvent {
            subject_id: context.subject_id.clone(),
            flag_key,
            flag_version: result.flag_version,
            enabled: result.enabled,
            variant: result.variant.clone(),
            reason: result.reason,
            context_snapshot_keys: context.attribute_keys(),
            timestamp,
            attributes: include_attribute_values.then(|| context.attributes.clone()),
        }
    }
}
