//! Flag evaluation: the per-flag decision procedure and the [`Evaluator`] orchestrating cache,
//! evaluation and telemetry.
mod eval_flag;
mod evaluator;
mod result;

pub use evaluator::Evaluator;
pub use result::{EvaluateOptions, EvaluationResult, FailurePolicy, Reason};
