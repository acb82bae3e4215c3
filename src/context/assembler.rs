use crate::backend::TokenEstimator;
use crate::error::{LoomError, Result};

use super::narrative::Selection;

/// Fixed text wrapped around the story segment, used by suggestion templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptFrame {
    pub preamble: String,
    pub directive: String,
}

impl PromptFrame {
    /// No wrapping: the story text is continued directly.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn new(preamble: impl Into<String>, directive: impl Into<String>) -> Self {
        Self {
            preamble: preamble.into(),
            directive: directive.into(),
        }
    }

    fn is_plain(&self) -> bool {
        self.preamble.is_empty() && self.directive.is_empty()
    }
}

/// A prompt ready for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptBundle {
    pub prompt: String,
    pub estimated_tokens: usize,
    /// Whether older story text was dropped to fit the window.
    pub truncated: bool,
}

/// Tokens left for story text once everything else is reserved.
pub fn available_budget(
    max_context: usize,
    descriptor_tokens: usize,
    max_new_tokens: usize,
    instruction_overhead: usize,
) -> Result<usize> {
    let reserved = descriptor_tokens
        .saturating_add(max_new_tokens)
        .saturating_add(instruction_overhead);
    if reserved >= max_context {
        return Err(LoomError::ContextOverflow {
            max_context,
            required: reserved,
            max_new_tokens,
        });
    }
    Ok(max_context - reserved)
}

/// The longest suffix of `text` whose estimate fits in `budget`.
///
/// Binary search over char boundaries; relies on the estimator being monotonic.
pub fn trailing_fit<'t, E>(estimator: &E, text: &'t str, budget: usize) -> &'t str
where
    E: TokenEstimator + ?Sized,
{
    if estimator.estimate_tokens(text) <= budget {
        return text;
    }
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();

    // smallest boundary index whose suffix fits; the empty suffix always does
    let (mut lo, mut hi) = (0, boundaries.len() - 1);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if estimator.estimate_tokens(&text[boundaries[mid]..]) <= budget {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    &text[boundaries[lo]..]
}

/// Builds prompts that fit a model's context window.
pub struct ContextAssembler<'e, E: TokenEstimator + ?Sized> {
    estimator: &'e E,
    max_context: usize,
}

impl<'e, E: TokenEstimator + ?Sized> ContextAssembler<'e, E> {
    pub fn new(estimator: &'e E, max_context: usize) -> Self {
        Self {
            estimator,
            max_context,
        }
    }

    /// `[characters][plot points][preamble][story][directive]`, with the story
    /// trimmed from its oldest end if it does not fit.
    pub fn assemble(
        &self,
        story_text: &str,
        selection: &Selection,
        frame: &PromptFrame,
        max_new_tokens: usize,
    ) -> Result<PromptBundle> {
        let descriptors = selection.descriptor_text();
        let descriptor_tokens = self.estimator.estimate_tokens(&descriptors);
        let instruction_overhead = if frame.is_plain() {
            0
        } else {
            self.estimator
                .estimate_tokens(&format!("{}{}", frame.preamble, frame.directive))
        };

        let available = available_budget(
            self.max_context,
            descriptor_tokens,
            max_new_tokens,
            instruction_overhead,
        )?;

        // segment estimates can undercount the joined prompt (special tokens, merges
        // across segment edges), so the whole prompt is measured and the story shortened
        let mut budget = available;
        let mut story = trailing_fit(self.estimator, story_text, budget);
        loop {
            let prompt = compose(&descriptors, frame, story);
            let prompt_tokens = self.estimator.prompt_tokens(&prompt);
            let required = prompt_tokens.saturating_add(max_new_tokens);
            if required <= self.max_context {
                let truncated = story.len() < story_text.len();
                tracing::debug!(
                    max_context = self.max_context,
                    descriptor_tokens,
                    instruction_overhead,
                    max_new_tokens,
                    available,
                    prompt_tokens,
                    truncated,
                    "prompt assembled"
                );
                return Ok(PromptBundle {
                    prompt,
                    estimated_tokens: prompt_tokens,
                    truncated,
                });
            }
            if story.is_empty() {
                return Err(LoomError::ContextOverflow {
                    max_context: self.max_context,
                    required,
                    max_new_tokens,
                });
            }

            let excess = required - self.max_context;
            budget = self
                .estimator
                .estimate_tokens(story)
                .saturating_sub(excess)
                .min(budget.saturating_sub(1));
            let shorter = trailing_fit(self.estimator, story_text, budget);
            story = if shorter.len() < story.len() {
                shorter
            } else {
                drop_first_char(story)
            };
        }
    }
}

fn compose(descriptors: &str, frame: &PromptFrame, story: &str) -> String {
    let mut prompt = String::with_capacity(
        descriptors.len() + frame.preamble.len() + story.len() + frame.directive.len(),
    );
    prompt.push_str(descriptors);
    prompt.push_str(&frame.preamble);
    prompt.push_str(story);
    prompt.push_str(&frame.directive);
    prompt
}

fn drop_first_char(text: &str) -> &str {
    let mut chars = text.chars();
    chars.next();
    chars.as_str()
}
