use std::{borrow::Cow, collections::HashSet};

use chrono::{DateTime, Datelike, Utc};
use semver::Version;

use crate::{
    error::ConfigError,
    flag::{
        operand::{
            parse_semver, Bound, Check, CollectionMatch, GeoFence, Literal, TextMatch,
            TimeOfDayWindow,
        },
        Condition, Operator,
    },
    AttributeValue, EvaluationContext,
};

/// Mean Earth radius in kilometers (IUGG).
const EARTH_RADIUS_KM: f64 = 6371.0088;

/// A condition whose operand has been parsed and validated.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub attribute: String,
    pub operator: Operator,
    check: Check,
}

impl CompiledCondition {
    pub fn compile(condition: &Condition) -> Result<CompiledCondition, ConfigError> {
        Ok(CompiledCondition {
            attribute: condition.attribute.clone(),
            operator: condition.operator,
            check: Check::compile(condition.operator, &condition.value)?,
        })
    }

    /// Evaluate against `context`. Never fails: an absent attribute or an attribute of the wrong
    /// type makes the condition `false`.
    pub fn eval(&self, context: &EvaluationContext, now: DateTime<Utc>) -> bool {
        let attribute = context.lookup(&self.attribute, now);
        self.check.eval(attribute.as_deref())
    }
}

impl Check {
    /// Applying the check to the attribute. Returns `false` if the check cannot be applied.
    pub(crate) fn eval(&self, attribute: Option<&AttributeValue>) -> bool {
        self.try_eval(attribute).unwrap_or(false)
    }

    /// Try applying the check, returning `None` if the attribute is absent or has an
    /// incompatible type.
    fn try_eval(&self, attribute: Option<&AttributeValue>) -> Option<bool> {
        if let Check::IsNull { expected } = self {
            let is_null = attribute.map_or(true, AttributeValue::is_null);
            return Some(is_null == *expected);
        }

        let attribute = attribute.filter(|it| !it.is_null())?;

        match self {
            Check::Equals { literal, negate } => {
                let equal = match (attribute, literal) {
                    (AttributeValue::String(a), Literal::String { value, timestamp }) => {
                        a == value
                            || timestamp.is_some_and(|t| attribute.as_timestamp() == Some(t))
                    }
                    (
                        AttributeValue::Timestamp(a),
                        Literal::String {
                            timestamp: Some(t), ..
                        },
                    ) => a == t,
                    (AttributeValue::Number(a), Literal::Number(b)) => a == b,
                    (AttributeValue::Boolean(a), Literal::Boolean(b)) => a == b,
                    _ => return None,
                };
                Some(equal != *negate)
            }

            Check::EqualsIgnoreCase { lowercase } => {
                Some(attribute.as_str()?.to_lowercase() == *lowercase)
            }

            Check::Compare { comparison, bound } => Some(match bound {
                Bound::Number(b) => comparison.test(&attribute.as_number()?, b),
                Bound::Timestamp(b) => comparison.test(&attribute.as_timestamp()?, b),
            }),

            Check::InSet { members, negate } => {
                let key = attribute.to_membership_key()?;
                Some(members.contains(&*key) != *negate)
            }

            Check::Text {
                kind,
                needle,
                ignore_case,
            } => {
                let haystack = attribute.as_str()?;
                let haystack = if *ignore_case {
                    Cow::Owned(haystack.to_lowercase())
                } else {
                    Cow::Borrowed(haystack)
                };
                Some(match kind {
                    TextMatch::Contains => haystack.contains(needle.as_str()),
                    TextMatch::StartsWith => haystack.starts_with(needle.as_str()),
                    TextMatch::EndsWith => haystack.ends_with(needle.as_str()),
                })
            }

            Check::Regex { regex, negate } => Some(regex.is_match(attribute.as_str()?) != *negate),

            Check::Between { start, end } => {
                let t = attribute.as_timestamp()?;
                Some(*start <= t && t <= *end)
            }

            Check::Collection { kind, items } => {
                let present: HashSet<Cow<str>> = attribute
                    .as_list()?
                    .iter()
                    .filter_map(AttributeValue::to_membership_key)
                    .collect();
                let any = || present.iter().any(|key| items.contains(&**key));
                Some(match kind {
                    CollectionMatch::All => {
                        items.iter().all(|item| present.contains(item.as_str()))
                    }
                    CollectionMatch::Any => any(),
                    CollectionMatch::None => !any(),
                })
            }

            Check::Length { comparison, length } => {
                Some(comparison.test(&attribute.as_list()?.len(), length))
            }

            Check::Semver {
                comparison,
                version,
            } => {
                let actual = parse_semver(attribute.as_str()?).ok()?;
                Some(comparison.test(&precedence(&actual), &precedence(version)))
            }

            Check::Geo(fence) => {
                let (lat, lon) = location(attribute)?;
                Some(distance_km(lat, lon, fence) <= fence.radius_km)
            }

            Check::TimeOfDay(window) => Some(window.contains(attribute.as_timestamp()?)),

            Check::DayOfWeek(days) => {
                let local = attribute.as_timestamp()?.with_timezone(&days.offset);
                Some(days.days & (1 << local.weekday().num_days_from_monday()) != 0)
            }

            Check::IsNull { .. } => None,
        }
    }
}

/// Ordering key for semantic-version precedence. Build metadata does not participate.
fn precedence(version: &Version) -> (u64, u64, u64, &semver::Prerelease) {
    (version.major, version.minor, version.patch, &version.pre)
}

fn location(attribute: &AttributeValue) -> Option<(f64, f64)> {
    match attribute {
        AttributeValue::List(items) => match items.as_slice() {
            [lat, lon] => Some((lat.as_number()?, lon.as_number()?)),
            _ => None,
        },
        AttributeValue::Object(map) => Some((
            map.get("lat")?.as_number()?,
            map.get("lon")?.as_number()?,
        )),
        _ => None,
    }
}

/// Great-circle distance by the haversine formula.
fn distance_km(lat: f64, lon: f64, fence: &GeoFence) -> f64 {
    let (phi1, phi2) = (lat.to_radians(), fence.lat.to_radians());
    let d_phi = (fence.lat - lat).to_radians();
    let d_lambda = (fence.lon - lon).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

impl TimeOfDayWindow {
    fn contains(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.offset).time();
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= local && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    use crate::{
        flag::{operand::Check, Condition, Operator},
        AttributeValue, EvaluationContext,
    };

    use super::CompiledCondition;

    fn check(operator: Operator, value: Value) -> Check {
        Check::compile(operator, &value).unwrap()
    }

    fn eval(operator: Operator, value: Value, attribute: impl Into<AttributeValue>) -> bool {
        check(operator, value).eval(Some(&attribute.into()))
    }

    #[test]
    fn eq() {
        assert!(eval(Operator::Eq, json!("US"), "US"));
        assert!(!eval(Operator::Eq, json!("US"), "us"));
        assert!(eval(Operator::Eq, json!(42), 42.0));
        assert!(eval(Operator::Eq, json!(true), true));
        // type mismatch
        assert!(!eval(Operator::Eq, json!(42), "42"));
        assert!(!eval(Operator::NotEq, json!(42), "42"));
        assert!(eval(Operator::NotEq, json!("US"), "CA"));
        assert!(!check(Operator::NotEq, json!("US")).eval(None));
    }

    #[test]
    fn eq_timestamp() {
        let t = Utc.with_ymd_and_hms(2024, 7, 18, 0, 0, 0).unwrap();
        assert!(eval(Operator::Eq, json!("2024-07-18T00:00:00Z"), t));
        assert!(eval(
            Operator::Eq,
            json!("2024-07-18T00:00:00Z"),
            "2024-07-18T02:00:00+02:00"
        ));
    }

    #[test]
    fn eq_ignore_case() {
        assert!(eval(Operator::EqIgnoreCase, json!("Premium"), "PREMIUM"));
        assert!(!eval(Operator::EqIgnoreCase, json!("Premium"), "basic"));
    }

    #[test]
    fn gte() {
        assert!(eval(Operator::Gte, json!(18), 18.0));
        assert!(!eval(Operator::Gte, json!(18), 17.0));
    }

    #[test]
    fn gt() {
        assert!(eval(Operator::Gt, json!(18), 19.0));
        assert!(!eval(Operator::Gt, json!(18), 18.0));
        assert!(eval(Operator::Gt, json!(18), "19"));
        assert!(!eval(Operator::Gt, json!(18), true));
    }

    #[test]
    fn lte() {
        assert!(eval(Operator::Lte, json!(18), 18.0));
        assert!(!eval(Operator::Lte, json!(18), 19.0));
    }

    #[test]
    fn lt() {
        assert!(eval(Operator::Lt, json!(18), 17.0));
        assert!(!eval(Operator::Lt, json!(18), 18.0));
        assert!(eval(
            Operator::Lt,
            json!("2024-07-18T00:00:00Z"),
            "2024-07-17T23:59:59Z"
        ));
    }

    #[test]
    fn in_set() {
        assert!(eval(Operator::In, json!(["US", "CA"]), "US"));
        assert!(eval(Operator::In, json!(["US", "CA"]), "CA"));
        assert!(!eval(Operator::In, json!(["US", "CA"]), "MX"));
        assert!(eval(Operator::In, json!(["42"]), 42.0));
        assert!(eval(Operator::In, json!([42]), "42"));
        assert!(eval(Operator::In, json!(["true"]), true));
        assert!(!eval(Operator::In, json!(["true"]), 1.0));
    }

    #[test]
    fn not_in_set() {
        assert!(!eval(Operator::NotIn, json!(["US", "CA"]), "US"));
        assert!(eval(Operator::NotIn, json!(["US", "CA"]), "MX"));

        // NOT_IN fails when attribute is not specified
        assert!(!check(Operator::NotIn, json!(["US", "CA"])).eval(None));
    }

    #[test]
    fn string_matching() {
        assert!(eval(Operator::Contains, json!("@example"), "bob@example.com"));
        assert!(!eval(Operator::Contains, json!("@Example"), "bob@example.com"));
        assert!(eval(Operator::ContainsIgnoreCase, json!("@Example"), "bob@example.com"));
        assert!(eval(Operator::StartsWith, json!("bob"), "bob@example.com"));
        assert!(eval(Operator::StartsWithIgnoreCase, json!("BOB"), "bob@example.com"));
        assert!(eval(Operator::EndsWith, json!(".com"), "bob@example.com"));
        assert!(eval(Operator::EndsWithIgnoreCase, json!(".COM"), "bob@example.com"));
        assert!(!eval(Operator::EndsWith, json!(".com"), 42.0));
    }

    #[test]
    fn matches_regex() {
        assert!(eval(Operator::Matches, json!("^test.*"), "test@example.com"));
        assert!(!eval(Operator::Matches, json!("^test.*"), "example@test.com"));
    }

    #[test]
    fn not_matches_regex() {
        assert!(!eval(Operator::NotMatches, json!("^test.*"), "test@example.com"));
        assert!(!check(Operator::NotMatches, json!("^test.*")).eval(None));
        assert!(eval(Operator::NotMatches, json!("^test.*"), "example@test.com"));
    }

    #[test]
    fn temporal() {
        let t = Utc.with_ymd_and_hms(2024, 7, 18, 12, 0, 0).unwrap();
        assert!(eval(Operator::Before, json!("2024-07-19T00:00:00Z"), t));
        assert!(!eval(Operator::Before, json!("2024-07-18T12:00:00Z"), t));
        assert!(eval(Operator::After, json!(t.timestamp_millis() - 1), t));
        assert!(!eval(Operator::After, json!("2024-07-18T12:00:00Z"), "soon"));
    }

    #[test]
    fn between_is_inclusive() {
        let range = json!(["2024-07-01T00:00:00Z", "2024-07-31T00:00:00Z"]);
        assert!(eval(Operator::Between, range.clone(), "2024-07-01T00:00:00Z"));
        assert!(eval(Operator::Between, range.clone(), "2024-07-31T00:00:00Z"));
        assert!(eval(Operator::Between, range.clone(), "2024-07-15T08:30:00Z"));
        assert!(!eval(Operator::Between, range, "2024-08-01T00:00:00Z"));
    }

    #[test]
    fn collections() {
        let tags = || AttributeValue::from(vec!["beta", "vip", "eu"]);
        assert!(eval(Operator::ContainsAll, json!(["beta", "vip"]), tags()));
        assert!(!eval(Operator::ContainsAll, json!(["beta", "staff"]), tags()));
        assert!(eval(Operator::ContainsAny, json!(["staff", "vip"]), tags()));
        assert!(!eval(Operator::ContainsAny, json!(["staff"]), tags()));
        assert!(eval(Operator::ContainsNone, json!(["staff"]), tags()));
        assert!(!eval(Operator::ContainsNone, json!(["eu"]), tags()));

        assert!(eval(Operator::ContainsAll, json!([]), tags()));
        assert!(!eval(Operator::ContainsAny, json!([]), tags()));
        assert!(eval(Operator::ContainsNone, json!([]), tags()));

        // not a list
        assert!(!eval(Operator::ContainsAny, json!(["beta"]), "beta"));
        assert!(!eval(Operator::ContainsNone, json!(["beta"]), "beta"));
    }

    #[test]
    fn lengths() {
        let tags = || AttributeValue::from(vec!["beta", "vip"]);
        assert!(eval(Operator::LengthEq, json!(2), tags()));
        assert!(eval(Operator::LengthGt, json!(1), tags()));
        assert!(eval(Operator::LengthGte, json!(2), tags()));
        assert!(eval(Operator::LengthLt, json!(3), tags()));
        assert!(eval(Operator::LengthLte, json!(2), tags()));
        assert!(!eval(Operator::LengthGt, json!(2), tags()));
        assert!(!eval(Operator::LengthEq, json!(2), "ab"));
    }

    #[test]
    fn semver_gte() {
        assert!(eval(Operator::SemverGte, json!("1.0.0"), "1.0.1"));
        assert!(eval(Operator::SemverGte, json!("1.0.0"), "1.0.0"));
        assert!(!eval(Operator::SemverGte, json!("1.0.1"), "1.0.0"));
    }

    #[test]
    fn semver_gt() {
        assert!(eval(Operator::SemverGt, json!("1.0.0"), "1.0.1"));
        assert!(!eval(Operator::SemverGt, json!("1.0.0"), "1.0.0"));
        assert!(eval(Operator::SemverGt, json!("1.9.0"), "1.10.0"));
    }

    #[test]
    fn semver_lt() {
        assert!(eval(Operator::SemverLt, json!("1.0.0"), "1.0.0-rc.1"));
        assert!(eval(Operator::SemverLt, json!("1.0.0-beta"), "1.0.0-alpha"));
        assert!(!eval(Operator::SemverLt, json!("1.0.0"), "1.0.0"));
        assert!(!eval(Operator::SemverLte, json!("1.0.0"), "not a version"));
    }

    #[test]
    fn semver_ignores_build_metadata() {
        assert!(eval(Operator::SemverEq, json!("1.2.3+build.1"), "1.2.3+build.2"));
        assert!(eval(Operator::SemverEq, json!("1.2.3"), "v1.2.3"));
    }

    #[test]
    fn geo_within() {
        // Manhattan to Brooklyn is roughly 8 km; Manhattan to Boston roughly 306 km.
        let fence = json!({"lat": 40.7128, "lon": -74.0060, "radius": 10});
        assert!(eval(Operator::GeoWithin, fence.clone(), vec![40.6782, -73.9442]));
        assert!(!eval(Operator::GeoWithin, fence.clone(), vec![42.3601, -71.0589]));

        let object: AttributeValue =
            serde_json::from_value(json!({"lat": 40.6782, "lon": -73.9442})).unwrap();
        assert!(eval(Operator::GeoWithin, fence.clone(), object));

        let miles = json!({"lat": 40.7128, "lon": -74.0060, "radius": 200, "unit": "mi"});
        assert!(eval(Operator::GeoWithin, miles, vec![42.3601, -71.0589]));

        // boundary is inclusive
        let zero = json!({"lat": 40.7128, "lon": -74.0060, "radius": 0});
        assert!(eval(Operator::GeoWithin, zero, vec![40.7128, -74.0060]));

        assert!(!eval(Operator::GeoWithin, fence, "New York"));
    }

    #[test]
    fn time_of_day_between() {
        let at = |h, m| Utc.with_ymd_and_hms(2024, 7, 18, h, m, 0).unwrap();
        let business = json!({"start": "09:00", "end": "17:00"});
        assert!(eval(Operator::TimeOfDayBetween, business.clone(), at(9, 0)));
        assert!(eval(Operator::TimeOfDayBetween, business.clone(), at(16, 59)));
        assert!(!eval(Operator::TimeOfDayBetween, business.clone(), at(17, 0)));
        assert!(!eval(Operator::TimeOfDayBetween, business, at(8, 59)));

        let night = json!({"start": "22:00", "end": "06:00"});
        assert!(eval(Operator::TimeOfDayBetween, night.clone(), at(23, 30)));
        assert!(eval(Operator::TimeOfDayBetween, night.clone(), at(5, 59)));
        assert!(!eval(Operator::TimeOfDayBetween, night, at(12, 0)));

        // 16:30 UTC is 09:30 at -07:00
        let pacific = json!({"start": "09:00", "end": "10:00", "utcOffset": "-07:00"});
        assert!(eval(Operator::TimeOfDayBetween, pacific, at(16, 30)));
    }

    #[test]
    fn day_of_week_in() {
        // 2024-07-18 is a Thursday.
        let thursday = Utc.with_ymd_and_hms(2024, 7, 18, 23, 0, 0).unwrap();
        assert!(eval(Operator::DayOfWeekIn, json!({"days": ["thu"]}), thursday));
        assert!(!eval(Operator::DayOfWeekIn, json!({"days": ["sat", "sun"]}), thursday));
        // Already Friday in Tokyo.
        assert!(eval(
            Operator::DayOfWeekIn,
            json!({"days": ["fri"], "utcOffset": "+09:00"}),
            thursday
        ));
    }

    #[test]
    fn is_null() {
        assert!(check(Operator::IsNull, json!(true)).eval(None));
        assert!(check(Operator::IsNull, json!(true)).eval(Some(&AttributeValue::Null)));
        assert!(!eval(Operator::IsNull, json!(true), 10.0));
    }

    #[test]
    fn is_not_null() {
        assert!(!check(Operator::IsNull, json!(false)).eval(None));
        assert!(eval(Operator::IsNull, json!(false), 10.0));
    }

    #[test]
    fn missing_attribute() {
        let now = Utc::now();
        let context = EvaluationContext::new("user-1").with_attribute("age", 30.0);
        for (operator, value) in [
            (Operator::Eq, json!("US")),
            (Operator::NotEq, json!("US")),
            (Operator::NotIn, json!(["US"])),
            (Operator::NotMatches, json!("^x")),
            (Operator::ContainsNone, json!(["x"])),
            (Operator::Gt, json!(1)),
        ] {
            let condition =
                CompiledCondition::compile(&Condition::new("country", operator, value)).unwrap();
            assert!(!condition.eval(&context, now), "{operator} on missing attribute");
        }
    }

    #[test]
    fn resolves_built_in_attributes() {
        let now = Utc.with_ymd_and_hms(2024, 7, 18, 10, 0, 0).unwrap();
        let context = EvaluationContext::new("user-1");
        let during_hours = CompiledCondition::compile(&Condition::new(
            "$now",
            Operator::TimeOfDayBetween,
            json!({"start": "09:00", "end": "17:00"}),
        ))
        .unwrap();
        assert!(during_hours.eval(&context, now));

        let by_subject = CompiledCondition::compile(&Condition::new(
            "$subject_id",
            Operator::In,
            json!(["user-1"]),
        ))
        .unwrap();
        assert!(by_subject.eval(&context, now));
    }
}
