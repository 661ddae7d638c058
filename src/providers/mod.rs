pub mod evaluator;

pub use evaluator::{Evaluator, HttpEvaluator, Proposal, SimulatedEvaluator};
