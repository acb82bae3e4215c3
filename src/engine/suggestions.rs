//! Writer's-block suggestion templates. Each task is a row of data; all of them
//! run through the same assembly and generation path on the auxiliary model.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{Character, PromptFrame};
use crate::types::GenerationParams;

const SUGGESTION_TOP_K: usize = 50;
const SUGGESTION_TOP_P: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuggestionTask {
    NextScene,
    CharacterIdea,
    DialogueSparker,
    SettingDetail,
}

/// Fixed sampling settings and preamble of a task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskProfile {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub preamble: &'static str,
}

/// Optional per-task inputs. Fields that do not apply to a task are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestionOptions {
    /// character-idea: develop this existing character
    pub focus_character_id: Option<Uuid>,
    /// character-idea: role the new character should play
    pub desired_role: Option<String>,
    /// dialogue-sparker: who is talking
    pub dialogue_character_ids: Vec<Uuid>,
    /// dialogue-sparker: what they talk about
    pub topic: Option<String>,
    /// setting-detail
    pub setting_name: Option<String>,
    /// setting-detail: e.g. "sounds", "history"
    pub focus_aspect: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuggestionRequest {
    pub story_text: String,
    #[serde(default)]
    pub selected_character_ids: Vec<Uuid>,
    #[serde(default)]
    pub selected_plot_point_ids: Vec<Uuid>,
    #[serde(flatten)]
    pub options: SuggestionOptions,
}

impl SuggestionRequest {
    pub fn new(story_text: impl Into<String>) -> Self {
        Self {
            story_text: story_text.into(),
            ..Default::default()
        }
    }
}

/// Characters the directive refers to, looked up by the engine beforehand.
#[derive(Debug, Clone, Default)]
pub struct DirectiveSubjects {
    pub focus: Option<Character>,
    pub dialogue: Vec<Character>,
}

impl SuggestionTask {
    pub const ALL: [SuggestionTask; 4] = [
        SuggestionTask::NextScene,
        SuggestionTask::CharacterIdea,
        SuggestionTask::DialogueSparker,
        SuggestionTask::SettingDetail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionTask::NextScene => "next-scene",
            SuggestionTask::CharacterIdea => "character-idea",
            SuggestionTask::DialogueSparker => "dialogue-sparker",
            SuggestionTask::SettingDetail => "setting-detail",
        }
    }

    pub fn profile(&self) -> TaskProfile {
        match self {
            SuggestionTask::NextScene => TaskProfile {
                max_new_tokens: 50,
                temperature: 0.8,
                preamble: "Given the following story context:\n'",
            },
            SuggestionTask::CharacterIdea => TaskProfile {
                max_new_tokens: 70,
                temperature: 0.9,
                preamble: "Given the story context:\n'",
            },
            SuggestionTask::DialogueSparker => TaskProfile {
                max_new_tokens: 40,
                temperature: 0.9,
                preamble: "Given the current story context:\n'",
            },
            SuggestionTask::SettingDetail => TaskProfile {
                max_new_tokens: 60,
                temperature: 0.8,
                preamble: "Given the current story context:\n'",
            },
        }
    }

    pub fn params(&self) -> GenerationParams {
        let profile = self.profile();
        GenerationParams {
            max_new_tokens: profile.max_new_tokens,
            temperature: profile.temperature,
            top_k: SUGGESTION_TOP_K,
            top_p: SUGGESTION_TOP_P,
            seed: None,
        }
    }

    /// Preamble and directive wrapped around the story segment.
    pub fn frame(&self, options: &SuggestionOptions, subjects: &DirectiveSubjects) -> PromptFrame {
        let mut directive = String::from("'\n\n");
        directive.push_str(&self.directive(options, subjects));
        PromptFrame::new(self.profile().preamble, directive)
    }

    fn directive(&self, options: &SuggestionOptions, subjects: &DirectiveSubjects) -> String {
        let mut parts: Vec<String> = Vec::new();
        let closing = match self {
            SuggestionTask::NextScene => {
                parts.push(
                    "Suggest a concise and engaging idea for the very next scene. \
                     Focus on advancing the plot or character development."
                        .to_string(),
                );
                "Keep the suggestion brief, a few sentences at most."
            }
            SuggestionTask::CharacterIdea => {
                match &subjects.focus {
                    Some(character) => {
                        parts.push(format!(
                            "Focus on developing the character '{}' (Description: {}, Traits: {}).",
                            character.name,
                            character.description,
                            character.traits.as_deref().unwrap_or("unspecified")
                        ));
                        parts.push(
                            "Suggest a new internal conflict, a surprising past event, \
                             or a new skill they could acquire."
                                .to_string(),
                        );
                    }
                    None => parts.push("Suggest a new character idea.".to_string()),
                }
                if let Some(role) = non_blank(&options.desired_role) {
                    parts.push(format!("The character should ideally serve as a {role}."));
                }
                parts.push(
                    "Provide their name, a brief description, and their potential role \
                     in the story."
                        .to_string(),
                );
                "Keep the suggestion concise."
            }
            SuggestionTask::DialogueSparker => {
                if !subjects.dialogue.is_empty() {
                    let names: Vec<&str> =
                        subjects.dialogue.iter().map(|c| c.name.as_str()).collect();
                    parts.push(format!("Imagine a conversation between {}.", names.join(", ")));
                } else if !options.dialogue_character_ids.is_empty() {
                    parts.push(
                        "Imagine a conversation between unspecified characters.".to_string(),
                    );
                } else {
                    parts.push("Imagine a conversation between two characters.".to_string());
                }
                if let Some(topic) = non_blank(&options.topic) {
                    parts.push(format!("The dialogue should be about: '{topic}'."));
                }
                parts.push(
                    "Provide a brief opening line or a conflict that could spark dialogue."
                        .to_string(),
                );
                "Keep it very short and impactful."
            }
            SuggestionTask::SettingDetail => {
                match non_blank(&options.setting_name) {
                    Some(name) => parts.push(format!("Focus on the setting: '{name}'.")),
                    None => parts.push("Describe details for the current setting.".to_string()),
                }
                if let Some(aspect) = non_blank(&options.focus_aspect) {
                    parts.push(format!("Specifically, elaborate on its {aspect}."));
                }
                parts.push(
                    "Provide a few descriptive sentences about the atmosphere, objects, \
                     or sensory details."
                        .to_string(),
                );
                "Keep the description concise."
            }
        };
        parts.push(closing.to_string());
        parts.join(" ")
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl fmt::Display for SuggestionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
