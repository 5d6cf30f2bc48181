use chrono::{DateTime, Utc};

use crate::{
    configuration_cache::CachedFlag,
    flag::{allocate, CompiledFlag},
    sharder::{rollout_salt, variant_salt, Sharder, ROLLOUT_BUCKETS, VARIANT_BUCKETS},
    EvaluationContext,
};

use super::{EvaluationResult, Reason};

impl CachedFlag {
    /// Evaluate the cached state of `flag_key` for `context`.
    ///
    /// Absent flags evaluate to `NOT_FOUND` and invalid definitions to `DISABLED`. This never
    /// fails: every error case was either caught when the definition was compiled or maps to a
    /// reason.
    pub fn eval(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        now: DateTime<Utc>,
        sharder: &impl Sharder,
    ) -> EvaluationResult {
        match self {
            CachedFlag::Found(flag) => flag.eval(flag_key, context, now, sharder),
            CachedFlag::NotFound => EvaluationResult::disabled(Reason::NotFound, None),
            CachedFlag::Invalid(_) => EvaluationResult::disabled(Reason::Disabled, None),
        }
    }
}

impl CompiledFlag {
    /// Decide whether `context` gets the flag, and which variant.
    ///
    /// Checks run cheapest first: kill switch, targeting rules, rollout, then variant allocation.
    /// The rollout and variant buckets use independent salts derived from `flag_key`.
    pub fn eval(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        now: DateTime<Utc>,
        sharder: &impl Sharder,
    ) -> EvaluationResult {
        let flag_version = Some(self.version);

        if !self.enabled {
            return EvaluationResult::disabled(Reason::Disabled, flag_version);
        }

        if let Some(rules) = &self.rules {
            if !rules.eval(context, now) {
                return EvaluationResult {
                    variant: self.default_variant.clone(),
                    ..EvaluationResult::disabled(Reason::TargetingMiss, flag_version)
                };
            }
        }

        let rollout_bucket =
            sharder.bucket(&context.subject_id, &rollout_salt(flag_key), ROLLOUT_BUCKETS);
        if rollout_bucket >= u64::from(self.rollout_percentage) {
            return EvaluationResult {
                variant: self.default_variant.clone(),
                ..EvaluationResult::disabled(Reason::RolloutExcluded, flag_version)
            };
        }

        let variant_bucket =
            sharder.bucket(&context.subject_id, &variant_salt(flag_key), VARIANT_BUCKETS);
        let variant = allocate(variant_bucket, &self.variants, self.default_variant.as_ref());

        EvaluationResult {
            enabled: true,
            variant,
            reason: if self.has_targeting_rules() {
                Reason::TargetingMatch
            } else {
                Reason::RolloutIncluded
            },
            flag_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use chrono::Utc;

    use crate::{
        configuration_cache::CachedFlag,
        error::ConfigError,
        flag::{
            CompileLimits, CompiledFlag, Condition, FlagDefinition, Operator, RuleNode,
            VariantWeight,
        },
        sharder::{DeterministicSharder, Md5Sharder},
        EvaluationContext, EvaluationResult, Reason,
    };

    fn compile(definition: FlagDefinition) -> CompiledFlag {
        CompiledFlag::compile(&definition, &CompileLimits::default()).unwrap()
    }

    fn checkout_v2() -> FlagDefinition {
        let mut flag = FlagDefinition::new("checkout-v2");
        flag.rollout_percentage = 50;
        flag.variants = vec![VariantWeight::new("A", 50), VariantWeight::new("B", 50)];
        flag.version = 7;
        flag
    }

    fn sharder(rollout: u64, variant: u64) -> DeterministicSharder {
        DeterministicSharder(HashMap::from([
            ("subjectcheckout-v2:rollout".to_owned(), rollout),
            ("subjectcheckout-v2:variant".to_owned(), variant),
        ]))
    }

    #[test]
    fn golden_assignment_for_user_42() {
        let mut definition = checkout_v2();
        definition.rollout_percentage = 100;
        let flag = compile(definition);

        let result = flag.eval(
            "checkout-v2",
            &EvaluationContext::new("user-42"),
            Utc::now(),
            &Md5Sharder,
        );

        // Variant bucket 7308 of 10000 falls in B's half.
        assert_eq!(
            result,
            EvaluationResult {
                enabled: true,
                variant: Some("B".into()),
                reason: Reason::RolloutIncluded,
                flag_version: Some(7),
            }
        );
    }

    #[test]
    fn user_42_is_outside_half_rollout() {
        let mut definition = checkout_v2();
        definition.default_variant = Some("A".to_owned());
        let flag = compile(definition);

        // Rollout bucket 81 >= 50.
        let result = flag.eval(
            "checkout-v2",
            &EvaluationContext::new("user-42"),
            Utc::now(),
            &Md5Sharder,
        );

        assert!(!result.enabled);
        assert_eq!(result.reason, Reason::RolloutExcluded);
        assert_eq!(result.variant.as_deref(), Some("A"));
    }

    #[test]
    fn rollout_boundary() {
        let flag = compile(checkout_v2());
        let context = EvaluationContext::new("subject");

        let included = flag.eval("checkout-v2", &context, Utc::now(), &sharder(49, 0));
        assert_eq!(included.reason, Reason::RolloutIncluded);
        assert_eq!(included.variant.as_deref(), Some("A"));

        let excluded = flag.eval("checkout-v2", &context, Utc::now(), &sharder(50, 0));
        assert_eq!(excluded.reason, Reason::RolloutExcluded);
    }

    #[test]
    fn raising_rollout_keeps_included_subjects() {
        let at = |percentage| {
            let mut definition = checkout_v2();
            definition.rollout_percentage = percentage;
            compile(definition)
        };
        let (narrow, wide) = (at(30), at(60));
        let now = Utc::now();

        for i in 0..1000 {
            let context = EvaluationContext::new(format!("subject-{i}"));
            let before = narrow.eval("checkout-v2", &context, now, &Md5Sharder);
            let after = wide.eval("checkout-v2", &context, now, &Md5Sharder);
            if before.enabled {
                assert!(after.enabled);
                assert_eq!(before.variant, after.variant);
            }
        }
    }

    #[test]
    fn variant_bucket_selects_variant() {
        let flag = compile(checkout_v2());
        let context = EvaluationContext::new("subject");

        let a = flag.eval("checkout-v2", &context, Utc::now(), &sharder(0, 4999));
        let b = flag.eval("checkout-v2", &context, Utc::now(), &sharder(0, 5000));

        assert_eq!(a.variant.as_deref(), Some("A"));
        assert_eq!(b.variant.as_deref(), Some("B"));
    }

    #[test]
    fn disabled_flag_ignores_full_rollout() {
        let mut definition = FlagDefinition::new("killed");
        definition.enabled = false;
        definition.version = 3;
        let flag = compile(definition);

        let result = flag.eval(
            "killed",
            &EvaluationContext::new("user-1"),
            Utc::now(),
            &Md5Sharder,
        );

        assert_eq!(
            result,
            EvaluationResult {
                enabled: false,
                variant: None,
                reason: Reason::Disabled,
                flag_version: Some(3),
            }
        );
    }

    #[test]
    fn targeting_rules_gate_rollout() {
        let mut definition = FlagDefinition::new("na-banner");
        definition.targeting_rules = Some(RuleNode::and([RuleNode::from(Condition::new(
            "country",
            Operator::In,
            serde_json::json!(["US", "CA"]),
        ))]));
        let flag = compile(definition);

        let matched = flag.eval(
            "na-banner",
            &EvaluationContext::new("user-1").with_attribute("country", "US"),
            Utc::now(),
            &Md5Sharder,
        );
        assert!(matched.enabled);
        assert_eq!(matched.reason, Reason::TargetingMatch);
        assert_eq!(matched.variant, None);

        let missed = flag.eval(
            "na-banner",
            &EvaluationContext::new("user-1"),
            Utc::now(),
            &Md5Sharder,
        );
        assert!(!missed.enabled);
        assert_eq!(missed.reason, Reason::TargetingMiss);
    }

    #[test]
    fn empty_rule_tree_matches_everyone() {
        let mut definition = FlagDefinition::new("vacuous");
        definition.targeting_rules = Some(RuleNode::And(Vec::new()));
        let flag = compile(definition);

        let result = flag.eval(
            "vacuous",
            &EvaluationContext::new("user-1"),
            Utc::now(),
            &Md5Sharder,
        );

        assert_eq!(result.reason, Reason::TargetingMatch);
    }

    #[test]
    fn cached_states() {
        let context = EvaluationContext::new("user-1");
        let now = Utc::now();

        let not_found = CachedFlag::NotFound.eval("missing", &context, now, &Md5Sharder);
        assert_eq!(not_found, EvaluationResult::disabled(Reason::NotFound, None));

        let invalid = CachedFlag::Invalid(ConfigError::DuplicateVariant("A".to_owned()))
            .eval("broken", &context, now, &Md5Sharder);
        assert_eq!(invalid, EvaluationResult::disabled(Reason::Disabled, None));

        let found = CachedFlag::Found(Arc::new(compile(FlagDefinition::new("on"))))
            .eval("on", &context, now, &Md5Sharder);
        assert!(found.enabled);
    }
}
