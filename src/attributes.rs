use std::{borrow::Cow, collections::HashMap};

use chrono::{DateTime, TimeZone, Utc};
use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::Str;

/// Type alias for a HashMap representing key-value pairs of attributes.
///
/// # Examples
/// ```
/// # use toggle_core::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("country".to_owned(), "US".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Built-in attribute resolving to the subject id when the context does not define it.
pub const SUBJECT_ID_ATTRIBUTE: &str = "$subject_id";
/// Built-in attribute resolving to the evaluation timestamp when the context does not define it.
pub const NOW_ATTRIBUTE: &str = "$now";

/// Enum representing possible values of an attribute for a subject.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, `bool`, timestamps and
/// lists.
///
/// When deserialized, strings always stay [`AttributeValue::String`]; temporal operators parse
/// RFC 3339 strings on demand.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A point in time.
    Timestamp(DateTime<Utc>),
    /// A list of values.
    List(Vec<AttributeValue>),
    /// Nested attributes, addressable with dotted paths.
    Object(HashMap<String, AttributeValue>),
    /// A null value or absence of value.
    #[from(ignore)]
    Null,
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numbers, and strings that parse as numbers.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Timestamps, RFC 3339 strings, and numbers interpreted as Unix epoch milliseconds.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            AttributeValue::Timestamp(t) => Some(*t),
            AttributeValue::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            AttributeValue::Number(n) if n.is_finite() => {
                Utc.timestamp_millis_opt(*n as i64).single()
            }
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AttributeValue]> {
        match self {
            AttributeValue::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// String form used for set membership, so that `42` matches `"42"` and `true` matches
    /// `"true"`.
    pub(crate) fn to_membership_key(&self) -> Option<Cow<'_, str>> {
        match self {
            AttributeValue::String(s) => Some(Cow::Borrowed(s)),
            AttributeValue::Number(n) => Some(Cow::Owned(n.to_string())),
            AttributeValue::Boolean(b) => Some(Cow::Borrowed(if *b { "true" } else { "false" })),
            AttributeValue::Timestamp(t) => Some(Cow::Owned(t.to_rfc3339())),
            AttributeValue::List(_) | AttributeValue::Object(_) | AttributeValue::Null => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<Vec<f64>> for AttributeValue {
    fn from(value: Vec<f64>) -> Self {
        Self::List(value.into_iter().map(AttributeValue::Number).collect())
    }
}

impl From<Vec<&str>> for AttributeValue {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(AttributeValue::from).collect())
    }
}

/// Input for a single evaluation: the subject and its attributes.
///
/// The context is read-only during evaluation and is never retained by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    /// Unit of consistent assignment, typically a user id. Must not be empty.
    pub subject_id: Str,
    #[serde(default)]
    pub attributes: Attributes,
}

impl EvaluationContext {
    pub fn new(subject_id: impl Into<Str>) -> EvaluationContext {
        EvaluationContext {
            subject_id: subject_id.into(),
            attributes: Attributes::new(),
        }
    }

    /// Add an attribute, replacing any previous value under the same name.
    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> EvaluationContext {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Resolve `path` against the context.
    ///
    /// Exact keys win over dotted paths, so an attribute literally named `"device.os"` shadows
    /// `device -> os`. Built-in attributes are resolved last.
    pub(crate) fn lookup(&self, path: &str, now: DateTime<Utc>) -> Option<Cow<'_, AttributeValue>> {
        if let Some(value) = self.attributes.get(path) {
            return Some(Cow::Borrowed(value));
        }

        if let Some((head, rest)) = path.split_once('.') {
            let nested = rest
                .split('.')
                .try_fold(self.attributes.get(head)?, |value, segment| match value {
                    AttributeValue::Object(map) => map.get(segment),
                    _ => None,
                });
            if let Some(value) = nested {
                return Some(Cow::Borrowed(value));
            }
        }

        match path {
            SUBJECT_ID_ATTRIBUTE => Some(Cow::Owned(AttributeValue::String(
                self.subject_id.to_string(),
            ))),
            NOW_ATTRIBUTE => Some(Cow::Owned(AttributeValue::Timestamp(now))),
            _ => None,
        }
    }

    /// Attribute names, sorted, for telemetry.
    pub(crate) fn attribute_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.attributes.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }
}
