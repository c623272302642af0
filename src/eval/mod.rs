//! Flag evaluation: targets, rules, rollouts, prerequisites and segments.
mod bucketing;
mod evaluator;
mod reason;
mod segments;

pub use evaluator::Evaluator;
pub use reason::{Detail, ErrorKind, Reason, ReasonKind};
