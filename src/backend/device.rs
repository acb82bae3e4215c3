use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};

use crate::error::LoomError;
use crate::types::DeviceKind;

/// Map a requested placement onto a candle device.
pub(crate) fn resolve(kind: DeviceKind) -> Result<Device> {
    match kind {
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Cuda => Device::new_cuda(0)
            .context("CUDA device 0 is unavailable (build with the `cuda` feature on a CUDA host)"),
        DeviceKind::Vulkan => bail!("no Vulkan compute backend is available in this build"),
    }
}

/// Half precision on accelerators, full precision on the CPU.
pub(crate) fn preferred_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}

/// Number of CUDA devices visible to candle.
pub fn cuda_device_count() -> usize {
    if !candle_core::utils::cuda_is_available() {
        return 0;
    }
    (0..8).filter(|&i| Device::new_cuda(i).is_ok()).count()
}

/// Whether an engine error message reports exhausted device memory.
pub(crate) fn is_out_of_memory(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("out of memory") || lower.contains("cuda_error_out_of_memory")
}

/// Turn an adapter failure into a `LoadError`, naming the device when memory ran out.
pub(crate) fn load_failure(identifier: &str, kind: DeviceKind, err: anyhow::Error) -> LoomError {
    let detail = format!("{:#}", err);
    tracing::error!(identifier, device = %kind, error = %detail, "model load failed");
    if is_out_of_memory(&detail) {
        return LoomError::load_with(identifier, err.context(format!("out of memory on {kind}")));
    }
    LoomError::load_with(identifier, err)
}
