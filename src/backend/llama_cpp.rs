//! Adapter for single-file GGUF checkpoints (the llama.cpp format), run through
//! candle's quantized llama implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{ensure, Context, Result as AnyResult};
use candle_core::quantized::gguf_file;
use candle_transformers::models::quantized_llama::ModelWeights;

use crate::error::Result;
use crate::types::ModelSpec;

use super::device;
use super::runtime::{effective_context, Network, NativeModel};
use super::tokenizer::TextTokenizer;

const EOS_KEY: &str = "tokenizer.ggml.eos_token_id";

pub(crate) fn load(spec: &ModelSpec) -> Result<NativeModel> {
    let start = Instant::now();
    let model =
        load_inner(spec).map_err(|e| device::load_failure(&spec.identifier, spec.device, e))?;
    tracing::info!(
        identifier = %spec.identifier,
        device = %spec.device,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "gguf model loaded"
    );
    Ok(model)
}

fn load_inner(spec: &ModelSpec) -> AnyResult<NativeModel> {
    let path = Path::new(&spec.identifier);
    ensure!(path.is_file(), "model file {} does not exist", path.display());
    ensure!(
        path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gguf")),
        "{} is not a .gguf file",
        path.display()
    );
    let tokenizer_path = sibling_tokenizer(path)?;
    let device = device::resolve(spec.device)?;

    let mut file =
        std::fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let content = gguf_file::Content::read(&mut file).map_err(|e| e.with_path(path))?;

    let native_context = context_length(&content.metadata);
    let eos = metadata_u32(&content.metadata, EOS_KEY);
    tracing::debug!(
        identifier = %spec.identifier,
        tensors = content.tensor_infos.len(),
        native_context,
        "gguf header read"
    );

    let weights = ModelWeights::from_gguf(content, &mut file, &device)
        .context("failed to build quantized llama weights")?;
    let tokenizer =
        TextTokenizer::from_file(&tokenizer_path)?.with_eos_ids(eos.into_iter().collect());
    let max_context = effective_context(&spec.identifier, spec.max_context, native_context);

    Ok(NativeModel::new(
        spec.inference_library,
        spec.role,
        spec.identifier.clone(),
        device,
        max_context,
        Network::QuantizedLlama(weights),
        tokenizer,
    ))
}

/// `<stem>.tokenizer.json` next to the model, else `tokenizer.json` in the same directory.
pub(crate) fn sibling_tokenizer(model: &Path) -> AnyResult<PathBuf> {
    let dir = model.parent().unwrap_or_else(|| Path::new("."));
    let mut candidates = Vec::with_capacity(2);
    if let Some(stem) = model.file_stem().and_then(|s| s.to_str()) {
        candidates.push(dir.join(format!("{stem}.tokenizer.json")));
    }
    candidates.push(dir.join("tokenizer.json"));

    candidates
        .into_iter()
        .find(|p| p.is_file())
        .with_context(|| format!("no tokenizer.json found next to {}", model.display()))
}

fn metadata_u32(metadata: &HashMap<String, gguf_file::Value>, key: &str) -> Option<u32> {
    let value = metadata.get(key)?;
    value
        .to_u32()
        .ok()
        .or_else(|| value.to_u64().ok().and_then(|v| u32::try_from(v).ok()))
}

/// The architecture-prefixed `<arch>.context_length` entry.
fn context_length(metadata: &HashMap<String, gguf_file::Value>) -> Option<usize> {
    metadata
        .keys()
        .find(|k| k.ends_with(".context_length"))
        .and_then(|k| metadata_u32(metadata, k))
        .map(|v| v as usize)
}
