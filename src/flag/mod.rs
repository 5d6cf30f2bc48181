//! Flag definitions: the wire model, load-time compilation, and the pure evaluation pieces
//! (conditions, rule trees, variant allocation).
mod allocation;
mod compiled;
mod condition;
mod models;
mod operand;
mod rules;

pub use allocation::{allocate, VariantTable};
pub use compiled::{CompileLimits, CompiledFlag};
pub use condition::CompiledCondition;
pub use models::{
    Condition, FlagDefinition, FlagSet, Operator, RuleNode, Timestamp, VariantWeight,
};
pub use rules::CompiledRule;
