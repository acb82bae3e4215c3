//! Common type definitions shared by the registry, the adapters and the engine

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LoomError, Result};

/// Native inference engine family a model is run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InferenceLibrary {
    #[serde(rename = "transformers")]
    Transformers,
    #[serde(rename = "exllamav2")]
    ExLlamaV2,
    #[serde(rename = "llama_cpp")]
    LlamaCpp,
}

/// Hardware placement requested for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Vulkan,
}

/// Which resident slot a model occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    /// Story continuation.
    Primary,
    /// Writer's-block suggestions.
    Auxiliary,
}

/// Capability flags of an inference library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSupport {
    pub cpu: bool,
    pub cuda: bool,
    pub vulkan: bool,
}

impl DeviceSupport {
    pub fn allows(&self, device: DeviceKind) -> bool {
        match device {
            DeviceKind::Cpu => self.cpu,
            DeviceKind::Cuda => self.cuda,
            DeviceKind::Vulkan => self.vulkan,
        }
    }

    /// Devices allowed by these flags, in a fixed order.
    pub fn devices(&self) -> Vec<DeviceKind> {
        DeviceKind::ALL
            .into_iter()
            .filter(|d| self.allows(*d))
            .collect()
    }
}

impl InferenceLibrary {
    pub const ALL: [InferenceLibrary; 3] = [
        InferenceLibrary::Transformers,
        InferenceLibrary::ExLlamaV2,
        InferenceLibrary::LlamaCpp,
    ];

    /// Static library -> allowed device table, checked before any load.
    pub const fn supported_devices(self) -> DeviceSupport {
        match self {
            InferenceLibrary::Transformers => DeviceSupport {
                cpu: true,
                cuda: true,
                vulkan: false,
            },
            InferenceLibrary::ExLlamaV2 => DeviceSupport {
                cpu: false,
                cuda: true,
                vulkan: false,
            },
            InferenceLibrary::LlamaCpp => DeviceSupport {
                cpu: true,
                cuda: true,
                vulkan: true,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceLibrary::Transformers => "transformers",
            InferenceLibrary::ExLlamaV2 => "exllamav2",
            InferenceLibrary::LlamaCpp => "llama_cpp",
        }
    }
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Cpu, DeviceKind::Cuda, DeviceKind::Vulkan];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
            DeviceKind::Vulkan => "vulkan",
        }
    }
}

impl ModelRole {
    pub const ALL: [ModelRole; 2] = [ModelRole::Primary, ModelRole::Auxiliary];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Primary => "primary",
            ModelRole::Auxiliary => "auxiliary",
        }
    }
}

impl fmt::Display for InferenceLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InferenceLibrary {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self> {
        InferenceLibrary::ALL
            .into_iter()
            .find(|lib| lib.as_str() == s)
            .ok_or_else(|| {
                LoomError::configuration(
                    "inference_library",
                    format!(
                        "unknown library '{}', expected transformers, exllamav2 or llama_cpp",
                        s
                    ),
                )
            })
    }
}

impl FromStr for DeviceKind {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self> {
        DeviceKind::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| {
                LoomError::configuration(
                    "device",
                    format!("unknown device '{}', expected cpu, cuda or vulkan", s),
                )
            })
    }
}

impl FromStr for ModelRole {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self> {
        ModelRole::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| {
                LoomError::configuration(
                    "role",
                    format!("unknown role '{}', expected primary or auxiliary", s),
                )
            })
    }
}

/// A request to load one model into one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Local path, or a remote hub id for the transformers family
    pub identifier: String,
    pub inference_library: InferenceLibrary,
    pub device: DeviceKind,
    pub role: ModelRole,
    /// Upper bound on prompt + generated tokens
    pub max_context: usize,
}

impl ModelSpec {
    /// Rejects incompatible (library, device) pairs and malformed fields.
    ///
    /// Runs before any adapter is invoked, so nothing has been allocated when it fails.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(LoomError::configuration(
                "identifier",
                "model identifier cannot be empty",
            ));
        }

        if self.max_context == 0 {
            return Err(LoomError::configuration(
                "max_context",
                "max_context must be at least 1 token",
            ));
        }

        let support = self.inference_library.supported_devices();
        if !support.allows(self.device) {
            let allowed: Vec<&str> = support.devices().iter().map(|d| d.as_str()).collect();
            return Err(LoomError::configuration(
                "device",
                format!(
                    "{} cannot run on {}; supported devices: {}",
                    self.inference_library,
                    self.device,
                    allowed.join(", ")
                ),
            ));
        }

        Ok(())
    }
}

/// Sampling controls for one generation call. Omitted fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    /// Fixed sampling seed; a time-derived seed is used when absent
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 0.7,
            top_k: 50,
            top_p: 0.95,
            seed: None,
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(LoomError::validation(
                "temperature",
                format!("must be greater than 0, got {}", self.temperature),
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(LoomError::validation(
                "top_p",
                format!("must be in (0, 1], got {}", self.top_p),
            ));
        }
        if self.top_k < 1 {
            return Err(LoomError::validation("top_k", "must be at least 1"));
        }
        if self.max_new_tokens < 1 {
            return Err(LoomError::validation("max_new_tokens", "must be at least 1"));
        }
        Ok(())
    }
}

/// Story continuation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub story_text: String,
    /// Falls back to the configured defaults when absent
    #[serde(default)]
    pub params: Option<GenerationParams>,
    #[serde(default)]
    pub selected_character_ids: Vec<Uuid>,
    #[serde(default)]
    pub selected_plot_point_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub generated_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionResponse {
    pub suggestion: String,
}

/// Outcome of a load or unload operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: OperationStatus,
    pub message: String,
}

impl StatusResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Error,
            message: message.into(),
        }
    }
}

/// A model found in the models directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFile {
    pub path: PathBuf,
    pub filename: String,
    /// Size in bytes; summed over files for directory models
    pub size: u64,
    pub compatible_libraries: Vec<InferenceLibrary>,
    pub suggested_device: DeviceKind,
}
