use std::sync::Arc;

use crate::config::LoomConfig;
use crate::context::{ContextAssembler, NarrativeSource, PromptFrame, Selection};
use crate::error::Result;
use crate::model::{available_models, ModelRegistry, RoleStatus, UnloadReport};
use crate::types::{
    GenerateRequest, GenerationParams, GenerationResponse, InferenceLibrary, ModelFile, ModelRole,
    ModelSpec, StatusResponse, SuggestionResponse,
};

use super::builder::EngineBuilder;
use super::suggestions::{DirectiveSubjects, SuggestionRequest, SuggestionTask};

/// Main entry point: owns the model registry and turns story requests into
/// context-bounded prompts for the right model.
pub struct StoryEngine {
    pub(super) config: Arc<LoomConfig>,
    pub(super) registry: Arc<ModelRegistry>,
    pub(super) narrative: Arc<dyn NarrativeSource>,
}

impl StoryEngine {
    /// Create a new engine builder
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &LoomConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// A spec for `identifier` using the configured device and context window.
    pub fn spec_for(
        &self,
        identifier: impl Into<String>,
        inference_library: InferenceLibrary,
        role: ModelRole,
    ) -> ModelSpec {
        ModelSpec {
            identifier: identifier.into(),
            inference_library,
            device: self.config.models.default_device,
            role,
            max_context: self.config.models.default_max_context,
        }
    }

    /// Load a model into its role, replacing whatever that role held.
    pub async fn load_model(&self, mut spec: ModelSpec) -> Result<StatusResponse> {
        spec.identifier = self.config.resolve_identifier(&spec.identifier);
        let role = spec.role;
        let description = format!(
            "{} ({} on {})",
            spec.identifier, spec.inference_library, spec.device
        );
        self.registry.load(spec).await?;
        Ok(StatusResponse::success(format!(
            "Loaded {description} as the {role} model"
        )))
    }

    /// Unload both models. Always succeeds; unload errors are listed in the message.
    pub async fn unload_all(&self) -> StatusResponse {
        let UnloadReport { unloaded, errors } = self.registry.unload_all().await;
        let mut message = if unloaded.is_empty() {
            "No models were loaded".to_string()
        } else {
            let roles: Vec<&str> = unloaded.iter().map(|r| r.as_str()).collect();
            format!("Unloaded {} model(s)", roles.join(" and "))
        };
        for (role, error) in &errors {
            message.push_str(&format!("; {role} reported: {error}"));
        }
        StatusResponse::success(message)
    }

    pub fn available_models(&self) -> Vec<ModelFile> {
        available_models(&self.config.models.models_dir)
    }

    pub fn status(&self) -> Vec<RoleStatus> {
        self.registry.status()
    }

    pub fn cancel(&self, role: ModelRole) {
        self.registry.cancel(role);
    }

    /// Continue the story with the primary model.
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerationResponse> {
        self.registry.ensure_loaded(ModelRole::Primary)?;
        let params = request
            .params
            .unwrap_or_else(|| self.config.generation.clone());
        params.validate()?;

        let selection = Selection::resolve(
            self.narrative.as_ref(),
            &request.selected_character_ids,
            &request.selected_plot_point_ids,
        )
        .await;

        let generated_text = self
            .complete(
                ModelRole::Primary,
                request.story_text,
                selection,
                PromptFrame::plain(),
                params,
            )
            .await?;
        Ok(GenerationResponse { generated_text })
    }

    /// Writer's-block suggestion from the auxiliary model.
    pub async fn suggest(
        &self,
        task: SuggestionTask,
        request: SuggestionRequest,
    ) -> Result<SuggestionResponse> {
        self.registry.ensure_loaded(ModelRole::Auxiliary)?;
        let params = task.params();

        let selection = Selection::resolve(
            self.narrative.as_ref(),
            &request.selected_character_ids,
            &request.selected_plot_point_ids,
        )
        .await;
        let subjects = self.directive_subjects(task, &request).await;
        let frame = task.frame(&request.options, &subjects);

        tracing::debug!(%task, "suggestion requested");
        let suggestion = self
            .complete(
                ModelRole::Auxiliary,
                request.story_text,
                selection,
                frame,
                params,
            )
            .await?;
        Ok(SuggestionResponse { suggestion })
    }

    pub async fn suggest_next_scene(
        &self,
        request: SuggestionRequest,
    ) -> Result<SuggestionResponse> {
        self.suggest(SuggestionTask::NextScene, request).await
    }

    pub async fn suggest_character_idea(
        &self,
        request: SuggestionRequest,
    ) -> Result<SuggestionResponse> {
        self.suggest(SuggestionTask::CharacterIdea, request).await
    }

    pub async fn suggest_dialogue_sparker(
        &self,
        request: SuggestionRequest,
    ) -> Result<SuggestionResponse> {
        self.suggest(SuggestionTask::DialogueSparker, request).await
    }

    pub async fn suggest_setting_detail(
        &self,
        request: SuggestionRequest,
    ) -> Result<SuggestionResponse> {
        self.suggest(SuggestionTask::SettingDetail, request).await
    }

    async fn directive_subjects(
        &self,
        task: SuggestionTask,
        request: &SuggestionRequest,
    ) -> DirectiveSubjects {
        let options = &request.options;
        match task {
            SuggestionTask::CharacterIdea => {
                let focus = match options.focus_character_id {
                    Some(id) => self.narrative.character(id).await,
                    None => None,
                };
                DirectiveSubjects {
                    focus,
                    dialogue: Vec::new(),
                }
            }
            SuggestionTask::DialogueSparker => {
                let speakers = Selection::resolve(
                    self.narrative.as_ref(),
                    &options.dialogue_character_ids,
                    &[],
                )
                .await;
                DirectiveSubjects {
                    focus: None,
                    dialogue: speakers.characters,
                }
            }
            SuggestionTask::NextScene | SuggestionTask::SettingDetail => {
                DirectiveSubjects::default()
            }
        }
    }

    /// Assemble against the resident model and generate, under one role lock.
    async fn complete(
        &self,
        role: ModelRole,
        story_text: String,
        selection: Selection,
        frame: PromptFrame,
        params: GenerationParams,
    ) -> Result<String> {
        let max_new_tokens = params.max_new_tokens;
        let text = self
            .registry
            .run(role, params, move |model| {
                let bundle = ContextAssembler::new(model, model.max_context()).assemble(
                    &story_text,
                    &selection,
                    &frame,
                    max_new_tokens,
                )?;
                if bundle.truncated {
                    tracing::info!(
                        %role,
                        estimated_tokens = bundle.estimated_tokens,
                        "story text truncated to fit the context window"
                    );
                }
                Ok(bundle.prompt)
            })
            .await?;
        Ok(text.trim_start().to_string())
    }
}
