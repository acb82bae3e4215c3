use std::sync::Arc;

use crate::backend::{ModelLoader, NativeLoader};
use crate::config::LoomConfig;
use crate::context::{InMemoryProject, NarrativeSource};
use crate::error::Result;
use crate::model::ModelRegistry;

use super::engine::StoryEngine;

/// Builder for constructing a StoryEngine instance
pub struct EngineBuilder {
    config: Option<LoomConfig>,
    loader: Option<Arc<dyn ModelLoader>>,
    narrative: Option<Arc<dyn NarrativeSource>>,
}

impl EngineBuilder {
    /// Create a new builder instance
    pub fn new() -> Self {
        Self {
            config: None,
            loader: None,
            narrative: None,
        }
    }

    /// Set the engine configuration
    pub fn with_config(mut self, config: LoomConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the native candle loader, e.g. with a test double
    pub fn with_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Where selected characters and plot points are looked up
    pub fn with_narrative_source(mut self, source: Arc<dyn NarrativeSource>) -> Self {
        self.narrative = Some(source);
        self
    }

    /// Validate the configuration and assemble the engine
    pub fn build(self) -> Result<StoryEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(NativeLoader::new()));
        let narrative = self
            .narrative
            .unwrap_or_else(|| Arc::new(InMemoryProject::new()));

        tracing::debug!(
            models_dir = %config.models.models_dir.display(),
            default_max_context = config.models.default_max_context,
            "story engine configured"
        );

        Ok(StoryEngine {
            config: Arc::new(config),
            registry: Arc::new(ModelRegistry::new(loader)),
            narrative,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
