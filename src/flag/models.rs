use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[allow(missing_docs)]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// A set of flag definitions keyed by flag key. Accepted by
/// [`StaticLoader`](crate::configuration_loader::StaticLoader).
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct FlagSet {
    pub flags: HashMap<String, FlagDefinition>,
}

/// Flag or experiment definition as produced by a configuration loader.
///
/// A definition is never mutated once loaded; a refresh produces a new value.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlagDefinition {
    pub key: String,
    /// Stable identifier that survives key renames.
    #[serde(default)]
    pub id: Option<String>,
    /// Global kill switch.
    pub enabled: bool,
    #[serde(default = "default_rollout_percentage")]
    pub rollout_percentage: u32,
    /// `None` means "no rules": everyone is eligible.
    #[serde(default)]
    pub targeting_rules: Option<RuleNode>,
    #[serde(default)]
    pub variants: Vec<VariantWeight>,
    #[serde(default)]
    pub default_variant: Option<String>,
    /// Monotonic marker. A refresh never replaces a cached definition with an older version.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

fn default_rollout_percentage() -> u32 {
    100
}

impl FlagDefinition {
    /// A minimal enabled definition with full rollout, no rules and no variants.
    pub fn new(key: impl Into<String>) -> FlagDefinition {
        FlagDefinition {
            key: key.into(),
            id: None,
            enabled: true,
            rollout_percentage: 100,
            targeting_rules: None,
            variants: Vec::new(),
            default_variant: None,
            version: 0,
            updated_at: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariantWeight {
    pub name: String,
    /// Relative weight. Weights are normalized by their sum, so `[50, 50]` and `[1, 1]` are
    /// equivalent.
    pub weight: u32,
}

impl VariantWeight {
    pub fn new(name: impl Into<String>, weight: u32) -> VariantWeight {
        VariantWeight {
            name: name.into(),
            weight,
        }
    }
}

/// Targeting rule tree.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuleNode {
    Condition(Condition),
    /// Matches when all children match. Empty matches everyone.
    And(Vec<RuleNode>),
    /// Matches when any child matches. Empty matches everyone.
    Or(Vec<RuleNode>),
    Not(Box<RuleNode>),
}

impl From<Condition> for RuleNode {
    fn from(value: Condition) -> Self {
        RuleNode::Condition(value)
    }
}

impl RuleNode {
    pub fn and(children: impl IntoIterator<Item = RuleNode>) -> RuleNode {
        RuleNode::And(children.into_iter().collect())
    }

    pub fn or(children: impl IntoIterator<Item = RuleNode>) -> RuleNode {
        RuleNode::Or(children.into_iter().collect())
    }

    pub fn not(child: impl Into<RuleNode>) -> RuleNode {
        RuleNode::Not(Box::new(child.into()))
    }
}

/// `Condition` is a check that the context `attribute` matches the condition `value` under the
/// given `operator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Attribute name or dotted path into nested attributes.
    pub attribute: String,
    pub operator: Operator,
    /// Operand literal. Its expected shape depends on `operator`.
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Condition {
    pub fn new(
        attribute: impl Into<String>,
        operator: Operator,
        value: impl Into<serde_json::Value>,
    ) -> Condition {
        Condition {
            attribute: attribute.into(),
            operator,
            value: value.into(),
        }
    }
}

/// Possible condition operators.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Equal. Scalars of the same type; a timestamp operand compares as a timestamp.
    Eq,
    NotEq,
    /// Case-insensitive string equality.
    EqIgnoreCase,
    /// Ordering. Numbers, numeric strings, or timestamps.
    Gt,
    Gte,
    Lt,
    Lte,
    /// Set membership. Operand is a list of literals.
    In,
    NotIn,
    /// Substring checks. Operand is a string.
    Contains,
    StartsWith,
    EndsWith,
    ContainsIgnoreCase,
    StartsWithIgnoreCase,
    EndsWithIgnoreCase,
    /// Regex match. Operand is a pattern compiled when the flag is loaded.
    Matches,
    NotMatches,
    /// Temporal. Operand is an RFC 3339 string or epoch milliseconds.
    Before,
    After,
    /// Inclusive temporal range. Operand is a two-element list.
    Between,
    /// List attribute contains every operand element.
    ContainsAll,
    /// List attribute contains at least one operand element.
    ContainsAny,
    /// List attribute contains no operand element.
    ContainsNone,
    /// List attribute length comparisons. Operand is a non-negative integer.
    LengthEq,
    LengthGt,
    LengthGte,
    LengthLt,
    LengthLte,
    /// Semantic version comparisons by precedence (build metadata ignored).
    SemverEq,
    SemverGt,
    SemverGte,
    SemverLt,
    SemverLte,
    /// Location within `radius` of `{lat, lon}`.
    GeoWithin,
    /// Local time of day within `[start, end)`.
    TimeOfDayBetween,
    /// Local weekday is one of `days`.
    DayOfWeekIn,
    /// Null check. Operand `true` matches absent or null attributes, `false` matches present ones.
    IsNull,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::NotEq => "not_eq",
            Operator::EqIgnoreCase => "eq_ignore_case",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Contains => "contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::ContainsIgnoreCase => "contains_ignore_case",
            Operator::StartsWithIgnoreCase => "starts_with_ignore_case",
            Operator::EndsWithIgnoreCase => "ends_with_ignore_case",
            Operator::Matches => "matches",
            Operator::NotMatches => "not_matches",
            Operator::Before => "before",
            Operator::After => "after",
            Operator::Between => "between",
            Operator::ContainsAll => "contains_all",
            Operator::ContainsAny => "contains_any",
            Operator::ContainsNone => "contains_none",
            Operator::LengthEq => "length_eq",
            Operator::LengthGt => "length_gt",
            Operator::LengthGte => "length_gte",
            Operator::LengthLt => "length_lt",
            Operator::LengthLte => "length_lte",
            Operator::SemverEq => "semver_eq",
            Operator::SemverGt => "semver_gt",
            Operator::SemverGte => "semver_gte",
            Operator::SemverLt => "semver_lt",
            Operator::SemverLte => "semver_lte",
            Operator::GeoWithin => "geo_within",
            Operator::TimeOfDayBetween => "time_of_day_between",
            Operator::DayOfWeekIn => "day_of_week_in",
            Operator::IsNull => "is_null",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
