//! Load-time compilation of condition operands.
//!
//! Every operand is parsed exactly once, when a flag definition enters the cache. Evaluation
//! never parses a regex, a semantic version or a timestamp operand.
use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, TimeZone, Utc, Weekday};
use regex::Regex;
use semver::Version;
use serde::Deserialize;
use serde_json::Value;

use crate::{error::ConfigError, flag::Operator, AttributeValue};

/// Ordering test shared by numeric, temporal, length and version operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Comparison {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    pub(crate) fn test<T: PartialOrd + ?Sized>(self, lhs: &T, rhs: &T) -> bool {
        match self {
            Comparison::Eq => lhs == rhs,
            Comparison::Gt => lhs > rhs,
            Comparison::Gte => lhs >= rhs,
            Comparison::Lt => lhs < rhs,
            Comparison::Lte => lhs <= rhs,
        }
    }
}

/// Literal operand for equality.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    String {
        value: String,
        /// Set when the string is also a valid RFC 3339 timestamp, so timestamp attributes can be
        /// compared against it.
        timestamp: Option<DateTime<Utc>>,
    },
    Number(f64),
    Boolean(bool),
}

/// Right-hand side of an ordering operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Bound {
    Number(f64),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TextMatch {
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectionMatch {
    All,
    Any,
    None,
}

/// A circle on the Earth's surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct GeoFence {
    pub lat: f64,
    pub lon: f64,
    pub radius_km: f64,
}

/// Local time-of-day window in a fixed UTC offset. `start` is inclusive, `end` exclusive; a
/// window with `start > end` wraps midnight, and `start == end` covers the whole day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TimeOfDayWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub offset: FixedOffset,
}

/// Set of weekdays in a fixed UTC offset. Bit `n` is set for the weekday `n` days from Monday.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WeekdaySet {
    pub days: u8,
    pub offset: FixedOffset,
}

/// Compiled form of an operator together with its operand.
#[derive(Debug, Clone)]
pub(crate) enum Check {
    Equals { literal: Literal, negate: bool },
    EqualsIgnoreCase { lowercase: String },
    Compare { comparison: Comparison, bound: Bound },
    InSet { members: HashSet<String>, negate: bool },
    Text { kind: TextMatch, needle: String, ignore_case: bool },
    Regex { regex: Regex, negate: bool },
    Between { start: DateTime<Utc>, end: DateTime<Utc> },
    Collection { kind: CollectionMatch, items: HashSet<String> },
    Length { comparison: Comparison, length: usize },
    Semver { comparison: Comparison, version: Version },
    Geo(GeoFence),
    TimeOfDay(TimeOfDayWindow),
    DayOfWeek(WeekdaySet),
    IsNull { expected: bool },
}

impl Check {
    pub(crate) fn compile(operator: Operator, value: &Value) -> Result<Check, ConfigError> {
        let invalid = |expected: &'static str| ConfigError::InvalidOperand {
            operator: operator.as_str(),
            expected,
        };

        Ok(match operator {
            Operator::Eq | Operator::NotEq => Check::Equals {
                literal: compile_literal(value)
                    .ok_or_else(|| invalid("a string, number or boolean"))?,
                negate: operator == Operator::NotEq,
            },

            Operator::EqIgnoreCase => Check::EqualsIgnoreCase {
                lowercase: value.as_str().ok_or_else(|| invalid("a string"))?.to_lowercase(),
            },

            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                let comparison = match operator {
                    Operator::Gt => Comparison::Gt,
                    Operator::Gte => Comparison::Gte,
                    Operator::Lt => Comparison::Lt,
                    _ => Comparison::Lte,
                };
                let bound = match value {
                    Value::Number(n) => n.as_f64().map(Bound::Number),
                    Value::String(s) => s
                        .trim()
                        .parse()
                        .ok()
                        .map(Bound::Number)
                        .or_else(|| parse_rfc3339(s).map(Bound::Timestamp)),
                    _ => None,
                }
                .ok_or_else(|| invalid("a number or a timestamp"))?;
                Check::Compare { comparison, bound }
            }

            Operator::Before | Operator::After => Check::Compare {
                comparison: if operator == Operator::Before {
                    Comparison::Lt
                } else {
                    Comparison::Gt
                },
                bound: Bound::Timestamp(compile_timestamp(value)?),
            },

            Operator::Between => {
                let [start, end] = value
                    .as_array()
                    .and_then(|items| <&[Value; 2]>::try_from(items.as_slice()).ok())
                    .ok_or_else(|| invalid("a two-element list [start, end]"))?;
                let (start, end) = (compile_timestamp(start)?, compile_timestamp(end)?);
                if start > end {
                    return Err(invalid("start <= end"));
                }
                Check::Between { start, end }
            }

            Operator::In | Operator::NotIn => Check::InSet {
                members: compile_members(value).ok_or_else(|| invalid("a list of literals"))?,
                negate: operator == Operator::NotIn,
            },

            Operator::Contains
            | Operator::StartsWith
            | Operator::EndsWith
            | Operator::ContainsIgnoreCase
            | Operator::StartsWithIgnoreCase
            | Operator::EndsWithIgnoreCase => {
                let (kind, ignore_case) = match operator {
                    Operator::Contains => (TextMatch::Contains, false),
                    Operator::StartsWith => (TextMatch::StartsWith, false),
                    Operator::EndsWith => (TextMatch::EndsWith, false),
                    Operator::ContainsIgnoreCase => (TextMatch::Contains, true),
                    Operator::StartsWithIgnoreCase => (TextMatch::StartsWith, true),
                    _ => (TextMatch::EndsWith, true),
                };
                let needle = value.as_str().ok_or_else(|| invalid("a string"))?;
                Check::Text {
                    kind,
                    needle: if ignore_case {
                        needle.to_lowercase()
                    } else {
                        needle.to_owned()
                    },
                    ignore_case,
                }
            }

            Operator::Matches | Operator::NotMatches => {
                let pattern = value.as_str().ok_or_else(|| invalid("a regex string"))?;
                let regex = Regex::new(pattern).map_err(|err| ConfigError::InvalidRegex {
                    pattern: pattern.to_owned(),
                    message: err.to_string(),
                })?;
                Check::Regex {
                    regex,
                    negate: operator == Operator::NotMatches,
                }
            }

            Operator::ContainsAll | Operator::ContainsAny | Operator::ContainsNone => {
                Check::Collection {
                    kind: match operator {
                        Operator::ContainsAll => CollectionMatch::All,
                        Operator::ContainsAny => CollectionMatch::Any,
                        _ => CollectionMatch::None,
                    },
                    items: compile_members(value).ok_or_else(|| invalid("a list of literals"))?,
                }
            }

            Operator::LengthEq
            | Operator::LengthGt
            | Operator::LengthGte
            | Operator::LengthLt
            | Operator::LengthLte => Check::Length {
                comparison: match operator {
                    Operator::LengthEq => Comparison::Eq,
                    Operator::LengthGt => Comparison::Gt,
                    Operator::LengthGte => Comparison::Gte,
                    Operator::LengthLt => Comparison::Lt,
                    _ => Comparison::Lte,
                },
                length: value
                    .as_u64()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| invalid("a non-negative integer"))?,
            },

            Operator::SemverEq
            | Operator::SemverGt
            | Operator::SemverGte
            | Operator::SemverLt
            | Operator::SemverLte => {
                let raw = value.as_str().ok_or_else(|| invalid("a version string"))?;
                let version = parse_semver(raw).map_err(|err| ConfigError::InvalidSemver {
                    version: raw.to_owned(),
                    message: err.to_string(),
                })?;
                Check::Semver {
                    comparison: match operator {
                        Operator::SemverEq => Comparison::Eq,
                        Operator::SemverGt => Comparison::Gt,
                        Operator::SemverGte => Comparison::Gte,
                        Operator::SemverLt => Comparison::Lt,
                        _ => Comparison::Lte,
                    },
                    version,
                }
            }

            Operator::GeoWithin => Check::Geo(compile_geofence(value).map_err(|err| match err {
                Some(err) => err,
                None => invalid("{lat, lon, radius, unit}"),
            })?),

            Operator::TimeOfDayBetween => {
                let operand: TimeOfDayOperand = serde_json::from_value(value.clone())
                    .map_err(|_| invalid("{start: \"HH:MM\", end: \"HH:MM\", utcOffset}"))?;
                Check::TimeOfDay(TimeOfDayWindow {
                    start: parse_time_of_day(&operand.start)?,
                    end: parse_time_of_day(&operand.end)?,
                    offset: parse_utc_offset(operand.utc_offset.as_deref())?,
                })
            }

            Operator::DayOfWeekIn => {
                let operand: DayOfWeekOperand = serde_json::from_value(value.clone())
                    .map_err(|_| invalid("{days: [...], utcOffset}"))?;
                let days = operand.days.iter().try_fold(0u8, |mask, day| {
                    let weekday: Weekday = day
                        .parse()
                        .map_err(|_| ConfigError::InvalidWeekday(day.clone()))?;
                    Ok::<_, ConfigError>(mask | (1 << weekday.num_days_from_monday()))
                })?;
                Check::DayOfWeek(WeekdaySet {
                    days,
                    offset: parse_utc_offset(operand.utc_offset.as_deref())?,
                })
            }

            Operator::IsNull => Check::IsNull {
                expected: value.as_bool().ok_or_else(|| invalid("a boolean"))?,
            },
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeoOperand {
    lat: f64,
    lon: f64,
    radius: f64,
    #[serde(default)]
    unit: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeOfDayOperand {
    start: String,
    end: String,
    #[serde(default)]
    utc_offset: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DayOfWeekOperand {
    days: Vec<String>,
    #[serde(default)]
    utc_offset: Option<String>,
}

fn compile_literal(value: &Value) -> Option<Literal> {
    match value {
        Value::String(s) => Some(Literal::String {
            value: s.clone(),
            timestamp: parse_rfc3339(s),
        }),
        Value::Number(n) => n.as_f64().map(Literal::Number),
        Value::Bool(b) => Some(Literal::Boolean(*b)),
        _ => None,
    }
}

/// Membership keys use the same stringification as
/// [`AttributeValue::to_membership_key`](crate::AttributeValue).
fn compile_members(value: &Value) -> Option<HashSet<String>> {
    value
        .as_array()?
        .iter()
        .map(|item| {
            let attribute: AttributeValue = match item {
                Value::String(s) => s.as_str().into(),
                Value::Number(n) => n.as_f64()?.into(),
                Value::Bool(b) => (*b).into(),
                _ => return None,
            };
            attribute.to_membership_key().map(|key| key.into_owned())
        })
        .collect()
}

fn compile_timestamp(value: &Value) -> Result<DateTime<Utc>, ConfigError> {
    let timestamp = match value {
        Value::String(s) => parse_rfc3339(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    };
    timestamp.ok_or_else(|| ConfigError::InvalidTimestamp(value.to_string()))
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Parse a semantic version, tolerating a leading `v` and missing minor/patch components
/// (`"v2"` parses as `2.0.0`, `"1.4-beta"` as `1.4.0-beta`).
pub(crate) fn parse_semver(raw: &str) -> Result<Version, semver::Error> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix(['v', 'V'])
        .unwrap_or(trimmed);

    Version::parse(trimmed).or_else(|err| {
        let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
        let (core, suffix) = trimmed.split_at(split);
        match core.split('.').count() {
            1 => Version::parse(&format!("{core}.0.0{suffix}")),
            2 => Version::parse(&format!("{core}.0{suffix}")),
            _ => Err(err),
        }
    })
}

/// `Err(None)` means the operand has the wrong shape.
fn compile_geofence(value: &Value) -> Result<GeoFence, Option<ConfigError>> {
    let operand: GeoOperand = serde_json::from_value(value.clone()).map_err(|_| None)?;
    let km_per_unit = match operand.unit.as_deref().unwrap_or("km") {
        "km" | "kilometers" | "kilometres" => 1.0,
        "mi" | "miles" => 1.609_344,
        "m" | "meters" | "metres" => 0.001,
        other => return Err(Some(ConfigError::InvalidDistanceUnit(other.to_owned()))),
    };
    if !(-90.0..=90.0).contains(&operand.lat)
        || !(-180.0..=180.0).contains(&operand.lon)
        || !(operand.radius >= 0.0)
    {
        return Err(None);
    }
    Ok(GeoFence {
        lat: operand.lat,
        lon: operand.lon,
        radius_km: operand.radius * km_per_unit,
    })
}

fn parse_time_of_day(raw: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| ConfigError::InvalidTimeOfDay(raw.to_owned()))
}

/// Parse `"Z"`, `"UTC"`, `"+05:30"`, `"-0800"`. Absent means UTC.
pub(crate) fn parse_utc_offset(raw: Option<&str>) -> Result<FixedOffset, ConfigError> {
    let utc = Utc.fix();
    let Some(raw) = raw.map(str::trim) else {
        return Ok(utc);
    };
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Ok(utc);
    }

    let invalid = || ConfigError::InvalidUtcOffset(raw.to_owned());
    let (sign, rest) = match raw.as_bytes().first() {
        Some(b'+') => (1, &raw[1..]),
        Some(b'-') => (-1, &raw[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if minutes >= 60 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}
