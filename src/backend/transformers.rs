//! Adapter for HuggingFace-format checkpoints: a directory holding `config.json`,
//! `tokenizer.json` and `*.safetensors` weights, local or fetched from the hub.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result as AnyResult};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::llama;

use crate::error::Result;
use crate::types::ModelSpec;

use super::device;
use super::gpt2::{Gpt2, Gpt2Config};
use super::runtime::{effective_context, Network, NativeModel};
use super::tokenizer::{eos_ids_from_config, TextTokenizer};

/// Where a checkpoint comes from.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Source<'a> {
    Local(&'a Path),
    Hub(&'a str),
}

pub(crate) struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Architecture {
    Gpt2,
    Llama,
}

impl Architecture {
    fn from_config(config: &serde_json::Value) -> AnyResult<Self> {
        match config.get("model_type").and_then(|v| v.as_str()) {
            Some("gpt2") => Ok(Architecture::Gpt2),
            Some("llama") | None => Ok(Architecture::Llama),
            Some(other) => bail!("unsupported architecture '{}'; supported: gpt2, llama", other),
        }
    }
}

pub(crate) fn load(spec: &ModelSpec) -> Result<NativeModel> {
    let start = Instant::now();
    let model = load_inner(spec)
        .map_err(|e| device::load_failure(&spec.identifier, spec.device, e))?;
    tracing::info!(
        identifier = %spec.identifier,
        device = %spec.device,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "transformers model loaded"
    );
    Ok(model)
}

fn load_inner(spec: &ModelSpec) -> AnyResult<NativeModel> {
    let device = device::resolve(spec.device)?;
    let files = match resolve_source(&spec.identifier)? {
        Source::Local(dir) => local_files(dir)?,
        Source::Hub(repo_id) => {
            tracing::info!(repo_id, "resolving model from the hub");
            hub_files(repo_id)?
        }
    };

    let dtype = device::preferred_dtype(&device);
    let built = build_network(&files, &device, dtype, &[Architecture::Gpt2, Architecture::Llama])?;
    let tokenizer = TextTokenizer::from_file(&files.tokenizer)?.with_eos_ids(built.eos_ids);
    let max_context = effective_context(&spec.identifier, spec.max_context, built.native_context);

    Ok(NativeModel::new(
        spec.inference_library,
        spec.role,
        spec.identifier.clone(),
        device,
        max_context,
        built.network,
        tokenizer,
    ))
}

/// Existing paths win; otherwise `owner/name` style ids go to the hub.
pub(crate) fn resolve_source(identifier: &str) -> AnyResult<Source<'_>> {
    let path = Path::new(identifier);
    if path.exists() {
        return Ok(Source::Local(path));
    }
    if is_hub_id(identifier) {
        return Ok(Source::Hub(identifier));
    }
    bail!("model path {} does not exist", path.display())
}

fn is_hub_id(identifier: &str) -> bool {
    let segments: Vec<&str> = identifier.split('/').collect();
    segments.len() <= 2
        && segments.iter().all(|s| {
            !s.is_empty()
                && !s.starts_with('.')
                && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        })
}

pub(crate) fn local_files(dir: &Path) -> AnyResult<ModelFiles> {
    ensure!(dir.is_dir(), "{} is not a model directory", dir.display());

    let config = dir.join("config.json");
    ensure!(config.is_file(), "missing config.json in {}", dir.display());
    let tokenizer = dir.join("tokenizer.json");
    ensure!(tokenizer.is_file(), "missing tokenizer.json in {}", dir.display());

    let mut weights: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    weights.sort();
    ensure!(!weights.is_empty(), "no .safetensors weights in {}", dir.display());

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

fn hub_files(repo_id: &str) -> AnyResult<ModelFiles> {
    let api = hf_hub::api::sync::Api::new()?;
    let repo = api.model(repo_id.to_string());

    let config = repo.get("config.json")?;
    let tokenizer = repo.get("tokenizer.json")?;
    let weights = match repo.get("model.safetensors") {
        Ok(single) => vec![single],
        Err(_) => {
            let index = repo
                .get("model.safetensors.index.json")
                .context("repository has neither model.safetensors nor a sharded index")?;
            let index: serde_json::Value = serde_json::from_slice(&std::fs::read(index)?)?;
            let mut shards: Vec<String> = index
                .get("weight_map")
                .and_then(|m| m.as_object())
                .context("sharded index has no weight_map")?
                .values()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            shards.sort();
            shards.dedup();
            shards
                .iter()
                .map(|shard| repo.get(shard).map_err(anyhow::Error::from))
                .collect::<AnyResult<Vec<_>>>()?
        }
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

pub(crate) struct BuiltNetwork {
    pub network: Network,
    pub native_context: Option<usize>,
    pub eos_ids: Vec<u32>,
}

pub(crate) fn read_config(path: &Path) -> AnyResult<serde_json::Value> {
    let raw = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
}

/// Build the network described by `config.json`, restricted to `allowed` architectures.
pub(crate) fn build_network(
    files: &ModelFiles,
    device: &Device,
    dtype: DType,
    allowed: &[Architecture],
) -> AnyResult<BuiltNetwork> {
    let config = read_config(&files.config)?;
    let architecture = Architecture::from_config(&config)?;
    ensure!(
        allowed.contains(&architecture),
        "architecture {:?} is not supported by this adapter",
        architecture
    );
    let eos_ids = eos_ids_from_config(&config);

    // SAFETY: the weight files are memory-mapped and must not change while loaded.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)? };

    match architecture {
        Architecture::Gpt2 => {
            let cfg: Gpt2Config = serde_json::from_value(config)?;
            let native_context = Some(cfg.n_positions);
            let model = Gpt2::load(vb, &cfg).context("failed to build GPT-2 weights")?;
            Ok(BuiltNetwork {
                network: Network::Gpt2(model),
                native_context,
                eos_ids,
            })
        }
        Architecture::Llama => {
            let native_context = config
                .get("max_position_embeddings")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize);
            let cfg: llama::LlamaConfig = serde_json::from_value(config)?;
            let cfg = cfg.into_config(false);
            let model = llama::Llama::load(vb, &cfg).context("failed to build llama weights")?;
            Ok(BuiltNetwork {
                network: Network::Llama {
                    model,
                    config: cfg,
                    dtype,
                    cache: None,
                },
                native_context,
                eos_ids,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hub_id_detection() {
        assert!(is_hub_id("gpt2"));
        assert!(is_hub_id("TinyLlama/TinyLlama-1.1B-Chat-v1.0"));
        assert!(!is_hub_id("/abs/path"));
        assert!(!is_hub_id("./relative"));
        assert!(!is_hub_id("a/b/c"));
        assert!(!is_hub_id("has space"));
    }

    #[test]
    fn test_resolve_prefers_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let id = dir.path().to_str().unwrap();
        assert_eq!(resolve_source(id).unwrap(), Source::Local(dir.path()));
        assert_eq!(resolve_source("gpt2").unwrap(), Source::Hub("gpt2"));
        assert!(resolve_source("/no/such/model/dir").is_err());
    }

    #[test]
    fn test_local_files_requires_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();
        let err = local_files(dir.path()).err().unwrap();
        assert!(err.to_string().contains("safetensors"));

        std::fs::write(dir.path().join("model-00002.safetensors"), b"").unwrap();
        std::fs::write(dir.path().join("model-00001.safetensors"), b"").unwrap();
        let files = local_files(dir.path()).unwrap();
        assert_eq!(files.weights.len(), 2);
        assert!(files.weights[0].ends_with("model-00001.safetensors"));
    }

    #[test]
    fn test_architecture_detection() {
        assert_eq!(
            Architecture::from_config(&json!({"model_type": "gpt2"})).unwrap(),
            Architecture::Gpt2
        );
        assert_eq!(
            Architecture::from_config(&json!({"model_type": "llama"})).unwrap(),
            Architecture::Llama
        );
        assert!(Architecture::from_config(&json!({"model_type": "t5"})).is_err());
    }

    #[test]
    fn test_corrupt_weights_fail_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"model_type": "gpt2"}"#).unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"not a safetensors file").unwrap();
        let files = local_files(dir.path()).unwrap();
        let result = build_network(&files, &Device::Cpu, DType::F32, &[Architecture::Gpt2]);
        assert!(result.is_err());
    }
}
