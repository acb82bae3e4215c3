//! Discovery of loadable models under the models directory.

use std::path::Path;

use walkdir::WalkDir;

use crate::backend::is_exl2_quantized;
use crate::types::{DeviceKind, InferenceLibrary, ModelFile};

const SCAN_DEPTH: usize = 2;

/// List `.gguf` files and HuggingFace-layout directories up to two levels deep,
/// sorted by path. A missing directory yields an empty list.
pub fn available_models(models_dir: impl AsRef<Path>) -> Vec<ModelFile> {
    let models_dir = models_dir.as_ref();
    if !models_dir.is_dir() {
        tracing::debug!(dir = %models_dir.display(), "models directory not found");
        return Vec::new();
    }

    let mut found: Vec<ModelFile> = WalkDir::new(models_dir)
        .min_depth(1)
        .max_depth(SCAN_DEPTH)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry in models directory");
                None
            }
        })
        .filter_map(|entry| {
            let path = entry.path();
            if entry.file_type().is_file() {
                gguf_entry(path, entry.metadata().ok()?.len())
            } else if entry.file_type().is_dir() {
                directory_entry(path)
            } else {
                None
            }
        })
        .collect();

    found.sort_by(|a, b| a.path.cmp(&b.path));
    tracing::debug!(dir = %models_dir.display(), count = found.len(), "model scan complete");
    found
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn gguf_entry(path: &Path, size: u64) -> Option<ModelFile> {
    let is_gguf = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"));
    is_gguf.then(|| ModelFile {
        path: path.to_path_buf(),
        filename: file_name(path),
        size,
        compatible_libraries: vec![InferenceLibrary::LlamaCpp],
        suggested_device: DeviceKind::Cpu,
    })
}

fn directory_entry(dir: &Path) -> Option<ModelFile> {
    let config_path = dir.join("config.json");
    if !config_path.is_file() {
        return None;
    }
    let has_weights = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .any(|e| e.path().extension().is_some_and(|ext| ext == "safetensors"));
    if !has_weights {
        return None;
    }

    let exl2 = std::fs::read(&config_path)
        .ok()
        .and_then(|raw| serde_json::from_slice::<serde_json::Value>(&raw).ok())
        .is_some_and(|config| is_exl2_quantized(&config));
    let (compatible_libraries, suggested_device) = if exl2 {
        (vec![InferenceLibrary::ExLlamaV2], DeviceKind::Cuda)
    } else {
        (vec![InferenceLibrary::Transformers], DeviceKind::Cpu)
    };

    Some(ModelFile {
        path: dir.to_path_buf(),
        filename: file_name(dir),
        size: directory_size(dir),
        compatible_libraries,
        suggested_device,
    })
}

fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
