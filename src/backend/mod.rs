//! Backend adapters: one capability surface over the three inference engine families.
//!
//! Each engine family is a case of the [`Adapter`] enum. Loading goes through the
//! [`ModelLoader`] trait so the registry can be driven by a different loader in tests;
//! everything a loaded model can do is behind [`LoadedModel`].

mod device;
mod exllamav2;
mod gpt2;
mod llama_cpp;
mod runtime;
mod tokenizer;
mod transformers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::types::{DeviceSupport, GenerationParams, InferenceLibrary, ModelSpec};

pub use device::cuda_device_count;
pub(crate) use exllamav2::is_exl2_quantized;
pub use runtime::NativeModel;
pub use tokenizer::TextTokenizer;

/// Approximate token counting used for context budgeting.
///
/// Implementations must be monotonic: appending non-empty text never lowers the count.
pub trait TokenEstimator {
    fn estimate_tokens(&self, text: &str) -> usize;

    /// Tokens the engine will consume for `prompt` as a whole, special tokens included.
    fn prompt_tokens(&self, prompt: &str) -> usize {
        self.estimate_tokens(prompt)
    }
}

/// A model resident in memory, owned exclusively by the registry.
pub trait LoadedModel: TokenEstimator + Send {
    fn library(&self) -> InferenceLibrary;

    /// Effective context window (prompt + generated tokens).
    fn max_context(&self) -> usize;

    /// Run one completion. Checks `cancel` between decoding steps.
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelFlag,
    ) -> Result<String>;

    /// Release device memory. Calling it twice is a no-op.
    fn unload(&mut self) -> Result<()>;

    fn is_loaded(&self) -> bool;
}

/// Acquires models for the registry.
pub trait ModelLoader: Send + Sync {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn LoadedModel>>;
}

/// Cooperative cancellation shared between the registry and a running generation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One case per inference engine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    Transformers,
    ExLlamaV2,
    LlamaCpp,
}

impl Adapter {
    pub fn for_library(library: InferenceLibrary) -> Self {
        match library {
            InferenceLibrary::Transformers => Adapter::Transformers,
            InferenceLibrary::ExLlamaV2 => Adapter::ExLlamaV2,
            InferenceLibrary::LlamaCpp => Adapter::LlamaCpp,
        }
    }

    pub fn library(&self) -> InferenceLibrary {
        match self {
            Adapter::Transformers => InferenceLibrary::Transformers,
            Adapter::ExLlamaV2 => InferenceLibrary::ExLlamaV2,
            Adapter::LlamaCpp => InferenceLibrary::LlamaCpp,
        }
    }

    pub fn capabilities(&self) -> DeviceSupport {
        self.library().supported_devices()
    }

    /// Resolve the model source, place it on the requested device and build the network.
    pub fn load(&self, spec: &ModelSpec) -> Result<NativeModel> {
        match self {
            Adapter::Transformers => transformers::load(spec),
            Adapter::ExLlamaV2 => exllamav2::load(spec),
            Adapter::LlamaCpp => llama_cpp::load(spec),
        }
    }
}

/// Loads models with the candle-backed native adapters.
#[derive(Debug, Clone, Default)]
pub struct NativeLoader;

impl NativeLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ModelLoader for NativeLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn LoadedModel>> {
        spec.validate()?;
        let adapter = Adapter::for_library(spec.inference_library);
        tracing::debug!(
            library = %spec.inference_library,
            device = %spec.device,
            identifier = %spec.identifier,
            "dispatching load to adapter"
        );
        let model = adapter.load(spec)?;
        Ok(Box::new(model))
    }
}
