//! Loom Engine - local story continuation and writer's-block suggestions
//!
//! This crate loads language models through three engine families (HuggingFace
//! transformers checkpoints, GPU-resident llama checkpoints and GGUF files), keeps
//! one model per role resident, and builds prompts from story text plus selected
//! characters and plot points without overflowing the model's context window.

use std::fmt;

// Public modules
pub mod backend;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod model;
pub mod types;
pub mod utils;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports for public API
pub use backend::{CancelFlag, LoadedModel, ModelLoader, NativeLoader, TokenEstimator};
pub use config::LoomConfig;
pub use context::{Character, InMemoryProject, NarrativeSource, PlotPoint};
pub use engine::{EngineBuilder, StoryEngine, SuggestionRequest, SuggestionTask};
pub use error::{LoomError, Result};
pub use model::{available_models, ModelRegistry, ModelState};
pub use types::{
    DeviceKind, GenerateRequest, GenerationParams, GenerationResponse, InferenceLibrary,
    ModelFile, ModelRole, ModelSpec, StatusResponse, SuggestionResponse,
};
pub use utils::{setup_logging, LogConfig};

/// Feature detection for supported backends
pub struct Features {
    /// Whether the crate was built with CUDA kernels
    pub cuda: bool,
    /// Number of detected CUDA devices
    pub cuda_devices: usize,
}

impl Features {
    /// Detect available features at runtime
    pub fn detect() -> Self {
        let cuda = cfg!(feature = "cuda");
        let cuda_devices = if cuda { backend::cuda_device_count() } else { 0 };
        Self { cuda, cuda_devices }
    }

    /// Devices a model can actually be placed on in this build.
    pub fn usable_devices(&self) -> Vec<DeviceKind> {
        let mut devices = vec![DeviceKind::Cpu];
        if self.cuda_devices > 0 {
            devices.push(DeviceKind::Cuda);
        }
        devices
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CUDA support: {}", if self.cuda { "yes" } else { "no" })?;
        if self.cuda {
            writeln!(f, "CUDA devices: {}", self.cuda_devices)?;
        }
        writeln!(f, "Vulkan support: no")
    }
}
