//! Compute device selection for the candle backends.

use candle_core::{DType, Device};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Metal,
    Cuda,
}

#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub device: Device,
    pub kind: DeviceKind,
}

impl DeviceProfile {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            kind: DeviceKind::Cpu,
        }
    }

    /// Prefer Metal when requested and available, then CUDA, then CPU.
    pub fn detect(use_metal: bool) -> Self {
        if use_metal && candle_core::utils::metal_is_available() {
            match Device::new_metal(0) {
                Ok(device) => {
                    info!("Using Metal device for inference");
                    return Self {
                        device,
                        kind: DeviceKind::Metal,
                    };
                }
                Err(e) => warn!("Metal device unavailable: {e}"),
            }
        }

        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Using CUDA device for inference");
                    return Self {
                        device,
                        kind: DeviceKind::Cuda,
                    };
                }
                Err(e) => warn!("CUDA device unavailable: {e}"),
            }
        }

        info!("Falling back to CPU for inference");
        Self::cpu()
    }

    /// F32 on CPU and Metal, BF16 on CUDA.
    pub fn dtype(&self) -> DType {
        match self.kind {
            DeviceKind::Cuda => DType::BF16,
            DeviceKind::Cpu | DeviceKind::Metal => DType::F32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_profile_uses_f32() {
        let profile = DeviceProfile::cpu();
        assert_eq!(profile.kind, DeviceKind::Cpu);
        assert_eq!(profile.dtype(), DType::F32);
    }
}
