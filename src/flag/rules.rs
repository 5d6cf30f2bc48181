use chrono::{DateTime, Utc};

use crate::{
    error::ConfigError,
    flag::{CompiledCondition, RuleNode},
    EvaluationContext,
};

/// Targeting rule tree with every condition compiled.
///
/// Children keep their declared order: evaluation order is never rearranged.
#[derive(Debug, Clone)]
pub enum CompiledRule {
    Condition(CompiledCondition),
    And(Box<[CompiledRule]>),
    Or(Box<[CompiledRule]>),
    Not(Box<CompiledRule>),
}

impl CompiledRule {
    /// Compile `node`, rejecting trees nested deeper than `max_depth` levels. A lone condition
    /// is one level deep.
    pub fn compile(node: &RuleNode, max_depth: usize) -> Result<CompiledRule, ConfigError> {
        compile_at(node, 1, max_depth)
    }

    /// Evaluate the tree against `context`.
    ///
    /// `And` stops at the first `false` child and `Or` at the first `true` one. Empty `And` and
    /// empty `Or` both match.
    pub fn eval(&self, context: &EvaluationContext, now: DateTime<Utc>) -> bool {
        match self {
            CompiledRule::Condition(condition) => condition.eval(context, now),
            CompiledRule::And(children) => children.iter().all(|child| child.eval(context, now)),
            CompiledRule::Or(children) => {
                children.is_empty() || children.iter().any(|child| child.eval(context, now))
            }
            CompiledRule::Not(child) => !child.eval(context, now),
        }
    }
}

fn compile_at(
    node: &RuleNode,
    depth: usize,
    max_depth: usize,
) -> Result<CompiledRule, ConfigError> {
    if depth > max_depth {
        return Err(ConfigError::RuleTooDeep { max: max_depth });
    }

    let compile_children = |children: &[RuleNode]| {
        children
            .iter()
            .map(|child| compile_at(child, depth + 1, max_depth))
            .collect::<Result<Box<[_]>, _>>()
    };

    Ok(match node {
        RuleNode::Condition(condition) => {
            CompiledRule::Condition(CompiledCondition::compile(condition)?)
        }
        RuleNode::And(children) => CompiledRule::And(compile_children(children)?),
        RuleNode::Or(children) => CompiledRule::Or(compile_children(children)?),
        RuleNode::Not(child) => {
            CompiledRule::Not(Box::new(compile_at(child, depth + 1, max_depth)?))
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use crate::{
        error::ConfigError,
        flag::{Condition, Operator, RuleNode},
        EvaluationContext,
    };

    use super::CompiledRule;

    fn compile(node: RuleNode) -> CompiledRule {
        CompiledRule::compile(&node, 20).unwrap()
    }

    fn age_gte_18() -> RuleNode {
        Condition::new("age", Operator::Gte, 18).into()
    }

    fn age_lt_100() -> RuleNode {
        Condition::new("age", Operator::Lt, 100).into()
    }

    #[test]
    fn empty_rule() {
        let context = EvaluationContext::new("user-1");
        assert!(compile(RuleNode::and([])).eval(&context, Utc::now()));
        assert!(compile(RuleNode::or([])).eval(&context, Utc::now()));
        // negating a vacuous match is an explicit "nobody"
        assert!(!compile(RuleNode::not(RuleNode::and([]))).eval(&context, Utc::now()));
    }

    #[test]
    fn single_condition_rule() {
        let rule = compile(RuleNode::and([age_gte_18()]));
        let adult = EvaluationContext::new("user-1").with_attribute("age", 20.0);
        let minor = EvaluationContext::new("user-1").with_attribute("age", 10.0);
        assert!(rule.eval(&adult, Utc::now()));
        assert!(!rule.eval(&minor, Utc::now()));
    }

    #[test]
    fn two_condition_rule() {
        let rule = compile(RuleNode::and([age_gte_18(), age_lt_100()]));
        let now = Utc::now();
        assert!(rule.eval(&EvaluationContext::new("s").with_attribute("age", 20.0), now));
        assert!(!rule.eval(&EvaluationContext::new("s").with_attribute("age", 17.0), now));
        assert!(!rule.eval(&EvaluationContext::new("s").with_attribute("age", 110.0), now));
    }

    #[test]
    fn or_and_not() {
        let rule = compile(RuleNode::or([
            Condition::new("country", Operator::In, json!(["US", "CA"])).into(),
            RuleNode::not(Condition::new("plan", Operator::Eq, "free")),
        ]));
        let now = Utc::now();
        let us = EvaluationContext::new("s").with_attribute("country", "US");
        let paying_mx = EvaluationContext::new("s")
            .with_attribute("country", "MX")
            .with_attribute("plan", "pro");
        let free_mx = EvaluationContext::new("s")
            .with_attribute("country", "MX")
            .with_attribute("plan", "free");
        assert!(rule.eval(&us, now));
        assert!(rule.eval(&paying_mx, now));
        assert!(!rule.eval(&free_mx, now));
    }

    #[test]
    fn missing_attribute() {
        let rule = compile(RuleNode::and([age_gte_18(), age_lt_100()]));
        let context = EvaluationContext::new("user-1").with_attribute("name", "alice");
        assert!(!rule.eval(&context, Utc::now()));
    }

    #[test]
    fn not_of_missing_attribute_matches() {
        // The condition is false for a missing attribute, so its negation is true.
        let rule = compile(RuleNode::not(age_gte_18()));
        assert!(rule.eval(&EvaluationContext::new("user-1"), Utc::now()));
    }

    #[test]
    fn rejects_deep_trees() {
        let mut node = age_gte_18();
        for _ in 0..20 {
            node = RuleNode::not(node);
        }
        // 21 levels
        assert_eq!(
            CompiledRule::compile(&node, 20).unwrap_err(),
            ConfigError::RuleTooDeep { max: 20 }
        );
        assert!(CompiledRule::compile(&node, 21).is_ok());
    }

    #[test]
    fn invalid_operand_fails_compilation() {
        let node = RuleNode::and([Condition::new("email", Operator::Matches, "(unclosed").into()]);
        assert!(matches!(
            CompiledRule::compile(&node, 20),
            Err(ConfigError::InvalidRegex { .. })
        ));
    }
}
