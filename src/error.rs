use std::error::Error as StdError;

use crate::types::ModelRole;

pub type Result<T> = std::result::Result<T, LoomError>;

type BoxedSource = Box<dyn StdError + Send + Sync>;

/// Every failure the engine reports to its callers.
#[derive(Debug, thiserror::Error)]
pub enum LoomError {
    /// Invalid library/device/role combination or malformed settings.
    #[error("Configuration error for {parameter}: {message}")]
    ConfigurationError {
        message: String,
        parameter: String,
    },

    /// Resource acquisition failed while loading a model.
    #[error("Failed to load model '{identifier}': {message}")]
    LoadError {
        identifier: String,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("No {role} model is loaded. Load a model for the {role} role first.")]
    ModelNotLoaded { role: ModelRole },

    #[error(
        "Context overflow: {required} tokens are needed but the model window is {max_context} \
         ({max_new_tokens} reserved for new tokens). Reduce max_new_tokens or increase max_context."
    )]
    ContextOverflow {
        max_context: usize,
        required: usize,
        max_new_tokens: usize,
    },

    /// The inference engine faulted while producing text.
    #[error("Generation failed: {message}")]
    GenerationError {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("Invalid value for {parameter}: {message}")]
    ValidationError {
        parameter: String,
        message: String,
    },
}

impl LoomError {
    pub(crate) fn load(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        LoomError::LoadError {
            identifier: identifier.into(),
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn load_with(identifier: impl Into<String>, err: anyhow::Error) -> Self {
        LoomError::LoadError {
            identifier: identifier.into(),
            message: format!("{:#}", err),
            source: Some(err.into()),
        }
    }

    pub(crate) fn generation(message: impl Into<String>) -> Self {
        LoomError::GenerationError {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn generation_with(err: anyhow::Error) -> Self {
        LoomError::GenerationError {
            message: format!("{:#}", err),
            source: Some(err.into()),
        }
    }

    pub(crate) fn validation(parameter: &str, message: impl Into<String>) -> Self {
        LoomError::ValidationError {
            parameter: parameter.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn configuration(parameter: &str, message: impl Into<String>) -> Self {
        LoomError::ConfigurationError {
            message: message.into(),
            parameter: parameter.to_string(),
        }
    }

    /// Stable snake_case name of the error kind, for mapping onto transport status codes.
    pub fn kind(&self) -> &'static str {
        match self {
            LoomError::ConfigurationError { .. } => "configuration_error",
            LoomError::LoadError { .. } => "load_error",
            LoomError::ModelNotLoaded { .. } => "model_not_loaded",
            LoomError::ContextOverflow { .. } => "context_overflow",
            LoomError::GenerationError { .. } => "generation_error",
            LoomError::ValidationError { .. } => "validation_error",
        }
    }

    /// Whether the caller can retry after changing its request or loading a model.
    pub fn is_recoverable(&self) -> bool {
        match self {
            LoomError::ModelNotLoaded { .. }
            | LoomError::ContextOverflow { .. }
            | LoomError::ValidationError { .. } => true,
            LoomError::LoadError { message, .. } => message.contains("out of memory"),
            _ => false,
        }
    }
}
