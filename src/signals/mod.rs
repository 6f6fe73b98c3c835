// =============================================================================
// Signals Module
// =============================================================================
//
// On-chain signal pipeline:
// - Versioned signal definitions with tagged predicates and K-of-N quorum
// - The default eight-signal catalogue
// - Evaluation against rolling baselines

pub mod catalog;
pub mod definition;
pub mod evaluator;

pub use definition::SignalDefinition;
pub use evaluator::{EvaluationBatch, SignalEvaluation, SignalEvaluator, SignalValue};
