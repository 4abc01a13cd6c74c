//! Candle device selection for the chosen backend kind.

use candle_core::Device;
use tracing::info;

use super::BackendKind;
use crate::error::{Error, Result};

pub struct DeviceSelector;

impl DeviceSelector {
    fn try_cuda() -> Option<Device> {
        let device = std::panic::catch_unwind(|| Device::cuda_if_available(0))
            .ok()?
            .ok()?;
        device.is_cuda().then_some(device)
    }

    fn try_metal() -> Option<Device> {
        let device = std::panic::catch_unwind(|| Device::new_metal(0))
            .ok()?
            .ok()?;
        device.is_metal().then_some(device)
    }

    /// Device for `kind`. A GPU request with no usable accelerator is an error,
    /// so that the selector can fall back explicitly.
    pub fn for_kind(kind: BackendKind) -> Result<Device> {
        match kind {
            BackendKind::Cpu => Ok(Device::Cpu),
            BackendKind::Gpu => {
                if let Some(device) = Self::try_cuda() {
                    info!("Using CUDA device for inference");
                    return Ok(device);
                }
                if let Some(device) = Self::try_metal() {
                    info!("Using Metal device for inference");
                    return Ok(device);
                }
                Err(Error::BackendUnavailable(
                    "no CUDA or Metal device available in this build".to_string(),
                ))
            }
        }
    }

    pub fn describe(device: &Device) -> &'static str {
        if device.is_cuda() {
            "cuda"
        } else if device.is_metal() {
            "metal"
        } else {
            "cpu"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_kind_always_yields_cpu_device() {
        let device = DeviceSelector::for_kind(BackendKind::Cpu).unwrap();
        assert!(device.is_cpu());
        assert_eq!(DeviceSelector::describe(&device), "cpu");
    }

    #[test]
    fn gpu_kind_matches_device_or_errors() {
        match DeviceSelector::for_kind(BackendKind::Gpu) {
            Ok(device) => assert!(device.is_cuda() || device.is_metal()),
            Err(err) => assert!(matches!(err, Error::BackendUnavailable(_))),
        }
    }
}
