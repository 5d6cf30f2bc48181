use crate::{
    error::ConfigError,
    flag::{CompiledRule, FlagDefinition, Timestamp, VariantTable},
    sharder::ROLLOUT_BUCKETS,
    Str,
};

/// Bounds applied while compiling a flag definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileLimits {
    /// Deepest rule tree accepted. Deeper trees are rejected with [`ConfigError::RuleTooDeep`].
    pub max_rule_depth: usize,
}

impl CompileLimits {
    pub const DEFAULT_MAX_RULE_DEPTH: usize = 20;
}

impl Default for CompileLimits {
    fn default() -> Self {
        CompileLimits {
            max_rule_depth: Self::DEFAULT_MAX_RULE_DEPTH,
        }
    }
}

/// Flag definition prepared for evaluation.
///
/// Compilation validates the definition and parses every operand, so evaluation itself cannot
/// fail. A `CompiledFlag` is immutable and shared between concurrent evaluations behind an
/// `Arc`.
#[derive(Debug, Clone)]
pub struct CompiledFlag {
    pub key: Str,
    pub id: Option<Str>,
    pub enabled: bool,
    pub rollout_percentage: u32,
    pub rules: Option<CompiledRule>,
    pub variants: VariantTable,
    pub default_variant: Option<Str>,
    pub version: u64,
    pub updated_at: Option<Timestamp>,
}

impl CompiledFlag {
    pub fn compile(
        definition: &FlagDefinition,
        limits: &CompileLimits,
    ) -> Result<CompiledFlag, ConfigError> {
        if u64::from(definition.rollout_percentage) > ROLLOUT_BUCKETS {
            return Err(ConfigError::RolloutOutOfRange(definition.rollout_percentage));
        }

        let rules = definition
            .targeting_rules
            .as_ref()
            .map(|node| CompiledRule::compile(node, limits.max_rule_depth))
            .transpose()?;

        Ok(CompiledFlag {
            key: definition.key.as_str().into(),
            id: definition.id.as_deref().map(Str::from),
            enabled: definition.enabled,
            rollout_percentage: definition.rollout_percentage,
            rules,
            variants: VariantTable::build(&definition.variants)?,
            default_variant: definition.default_variant.as_deref().map(Str::from),
            version: definition.version,
            updated_at: definition.updated_at,
        })
    }

    pub fn has_targeting_rules(&self) -> bool {
        self.rules.is_some()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{
        error::ConfigError,
        flag::{Condition, FlagDefinition, Operator, RuleNode, VariantWeight},
    };

    use super::{CompileLimits, CompiledFlag};

    #[test]
    fn compiles_full_definition() {
        let definition: FlagDefinition = serde_json::from_value(json!({
            "key": "checkout-v2",
            "id": "f_123",
            "enabled": true,
            "rolloutPercentage": 50,
            "targetingRules": {"and": [
                {"condition": {"attribute": "country", "operator": "in", "value": ["US", "CA"]}}
            ]},
            "variants": [{"name": "A", "weight": 50}, {"name": "B", "weight": 50}],
            "defaultVariant": "A",
            "version": 7,
            "updatedAt": "2024-07-18T00:00:00Z"
        }))
        .unwrap();

        let flag = CompiledFlag::compile(&definition, &CompileLimits::default()).unwrap();
        assert_eq!(flag.key, "checkout-v2");
        assert_eq!(flag.id.as_deref(), Some("f_123"));
        assert!(flag.has_targeting_rules());
        assert_eq!(flag.variants.len(), 2);
        assert_eq!(flag.default_variant.as_deref(), Some("A"));
        assert_eq!(flag.version, 7);
    }

    #[test]
    fn rejects_rollout_above_100() {
        let mut definition = FlagDefinition::new("f");
        definition.rollout_percentage = 101;
        assert_eq!(
            CompiledFlag::compile(&definition, &CompileLimits::default()).unwrap_err(),
            ConfigError::RolloutOutOfRange(101)
        );
    }

    #[test]
    fn rejects_bad_weights() {
        let mut definition = FlagDefinition::new("f");
        definition.variants = vec![VariantWeight::new("A", 0)];
        assert_eq!(
            CompiledFlag::compile(&definition, &CompileLimits::default()).unwrap_err(),
            ConfigError::ZeroTotalWeight
        );
    }

    #[test]
    fn honours_depth_limit() {
        let mut definition = FlagDefinition::new("f");
        definition.targeting_rules = Some(RuleNode::and([RuleNode::and([Condition::new(
            "age",
            Operator::Gt,
            18,
        )
        .into()])]));

        let shallow = CompileLimits { max_rule_depth: 2 };
        assert_eq!(
            CompiledFlag::compile(&definition, &shallow).unwrap_err(),
            ConfigError::RuleTooDeep { max: 2 }
        );
        assert!(CompiledFlag::compile(&definition, &CompileLimits::default()).is_ok());
    }
}
