//! Engine module: the orchestrator that validates requests, assembles prompts and
//! dispatches them to the primary or auxiliary model.

mod builder;
mod engine;
mod suggestions;

pub use builder::EngineBuilder;
pub use engine::StoryEngine;
pub use suggestions::{
    DirectiveSubjects, SuggestionOptions, SuggestionRequest, SuggestionTask, TaskProfile,
};
