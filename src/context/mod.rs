//! Prompt construction: narrative descriptors, story text and the token budget.

mod assembler;
mod narrative;

pub use assembler::{available_budget, trailing_fit, ContextAssembler, PromptBundle, PromptFrame};
pub use narrative::{
    render_characters, render_plot_points, Character, InMemoryProject, NarrativeSource, PlotPoint,
    Selection,
};

use crate::backend::TokenEstimator;

/// Roughly four characters per token, rounded up.
pub fn heuristic_token_count(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Estimator used when no tokenizer is at hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate_tokens(&self, text: &str) -> usize {
        heuristic_token_count(text)
    }
}
