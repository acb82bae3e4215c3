use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{LoomError, Result};
use crate::types::{DeviceKind, GenerationParams};
use crate::utils::logging::LogConfig;

/// Engine settings, layered from defaults, an optional TOML file and `LOOM_*`
/// environment variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    pub models: ModelsConfig,
    /// Defaults applied to requests that omit sampling parameters
    pub generation: GenerationParams,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Directory scanned by `available_models` and used to resolve relative identifiers
    pub models_dir: PathBuf,
    pub default_max_context: usize,
    pub default_device: DeviceKind,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            default_max_context: 2048,
            default_device: DeviceKind::Cpu,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Log to this file instead of stdout
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn to_log_config(&self) -> LogConfig {
        LogConfig {
            level: self.level.into(),
            file_path: self.file.clone(),
            ..LogConfig::default()
        }
    }
}

impl LoomConfig {
    /// Defaults, then `path` if it exists, then `LOOM_` variables
    /// (`LOOM_MODELS__MODELS_DIR=/srv/models`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: LoomConfig = Figment::from(Serialized::defaults(LoomConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LOOM_").split("__"))
            .extract()
            .map_err(|e| LoomError::configuration("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.models.models_dir.as_os_str().is_empty() {
            return Err(LoomError::configuration(
                "models_dir",
                "Models directory cannot be empty",
            ));
        }
        if self.models.default_max_context == 0 {
            return Err(LoomError::configuration(
                "default_max_context",
                "Default context window must be positive",
            ));
        }
        self.generation.validate().map_err(|e| match e {
            LoomError::ValidationError { parameter, message } => LoomError::ConfigurationError {
                message,
                parameter: format!("generation.{parameter}"),
            },
            other => other,
        })
    }

    /// Resolve a model identifier: relative paths that exist under the models
    /// directory win over the identifier as given.
    pub fn resolve_identifier(&self, identifier: &str) -> String {
        let path = Path::new(identifier);
        if path.is_relative() {
            let candidate = self.models.models_dir.join(path);
            if candidate.exists() {
                return candidate.display().to_string();
            }
        }
        identifier.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_config() {
        let config = LoomConfig::default();
        assert_eq!(config.models.models_dir, PathBuf::from("models"));
        assert_eq!(config.models.default_max_context, 2048);
        assert_eq!(config.generation.max_new_tokens, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = LoomConfig::default();
        config.models.default_max_context = 0;
        assert!(config.validate().is_err());

        let mut config = LoomConfig::default();
        config.generation.top_p = 2.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("generation.top_p"));
    }

    #[test]
    fn test_layered_loading() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "loom.toml",
                r#"
                [models]
                models_dir = "/srv/models"
                default_max_context = 4096

                [generation]
                temperature = 0.9

                [logging]
                level = "debug"
                "#,
            )?;
            jail.set_env("LOOM_MODELS__DEFAULT_DEVICE", "cuda");

            let config = LoomConfig::load("loom.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.models.models_dir, PathBuf::from("/srv/models"));
            assert_eq!(config.models.default_max_context, 4096);
            assert_eq!(config.models.default_device, DeviceKind::Cuda);
            assert_eq!(config.generation.temperature, 0.9);
            assert_eq!(config.generation.top_k, 50);
            assert_eq!(config.logging.level, LogLevel::Debug);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_| {
            let config = LoomConfig::load("absent.toml").map_err(|e| e.to_string())?;
            assert_eq!(config, LoomConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_resolve_identifier_prefers_models_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("gpt2")).unwrap();
        let mut config = LoomConfig::default();
        config.models.models_dir = dir.path().to_path_buf();

        assert_eq!(
            config.resolve_identifier("gpt2"),
            dir.path().join("gpt2").display().to_string()
        );
        assert_eq!(
            config.resolve_identifier("TinyLlama/TinyLlama-1.1B"),
            "TinyLlama/TinyLlama-1.1B"
        );
        assert_eq!(config.resolve_identifier("/abs/model.gguf"), "/abs/model.gguf");
    }
}
