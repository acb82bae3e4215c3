//! GPU-only adapter for local llama-family checkpoints, run in half precision on CUDA.
//!
//! Directories produced by the EXL2 quantizer carry
//! `quantization_config.quant_method = "exl2"`; candle has no kernels for that format,
//! so those are refused with a message pointing at an fp16 export of the same model.

use std::path::Path;
use std::time::Instant;

use anyhow::{bail, ensure, Result as AnyResult};
use candle_core::DType;

use crate::error::Result;
use crate::types::{DeviceKind, ModelSpec};

use super::device;
use super::runtime::{effective_context, NativeModel};
use super::tokenizer::TextTokenizer;
use super::transformers::{build_network, local_files, read_config, Architecture};

pub(crate) fn load(spec: &ModelSpec) -> Result<NativeModel> {
    let start = Instant::now();
    let model =
        load_inner(spec).map_err(|e| device::load_failure(&spec.identifier, spec.device, e))?;
    tracing::info!(
        identifier = %spec.identifier,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "exllamav2 model loaded"
    );
    Ok(model)
}

fn load_inner(spec: &ModelSpec) -> AnyResult<NativeModel> {
    ensure!(
        spec.device == DeviceKind::Cuda,
        "exllamav2 models run on cuda only, got {}",
        spec.device
    );

    let dir = Path::new(&spec.identifier);
    ensure!(
        dir.is_dir(),
        "model directory {} does not exist (exllamav2 loads local directories only)",
        dir.display()
    );
    let files = local_files(dir)?;
    if is_exl2_quantized(&read_config(&files.config)?) {
        bail!(
            "EXL2-quantized weights are not supported by this build; \
             point exllamav2 at an fp16 safetensors export of the model"
        );
    }

    let device = device::resolve(spec.device)?;
    let built = build_network(&files, &device, DType::F16, &[Architecture::Llama])?;
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

/// `quantization_config.quant_method == "exl2"`.
pub(crate) fn is_exl2_quantized(config: &serde_json::Value) -> bool {
    config
        .pointer("/quantization_config/quant_method")
        .and_then(|v| v.as_str())
        .is_some_and(|m| m.eq_ignore_ascii_case("exl2"))
}
