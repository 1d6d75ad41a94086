//! Where tensors live.
//!
//! Outputs and device-resident lookup tables go on the compute device; column
//! cache entries always go to host memory so many schemas do not hold
//! accelerator memory.

use candle_core::{Device, Tensor};
use tracing::info;

use crate::common::Result;

#[derive(Debug, Clone)]
pub struct Placement {
    device: Device,
}

impl Placement {
    pub fn host() -> Self {
        Self {
            device: Device::Cpu,
        }
    }

    /// Place on CUDA device `ordinal`. Fails when candle was built without CUDA support.
    pub fn cuda(ordinal: usize) -> Result<Self> {
        let device = Device::new_cuda(ordinal)?;
        info!("Using CUDA device: {:?}", device);
        Ok(Self { device })
    }

    /// `gpu = true` selects CUDA device 0, otherwise the host.
    pub fn from_flag(gpu: bool) -> Result<Self> {
        if gpu { Self::cuda(0) } else { Ok(Self::host()) }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_accelerated(&self) -> bool {
        !self.device.is_cpu()
    }

    /// Move `tensor` onto the compute device.
    pub fn upload(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.to_device(&self.device)?)
    }

    /// Copy `tensor` to host memory, cut off from any gradient tracking.
    pub fn download(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.detach().to_device(&Device::Cpu)?)
    }
}

impl Default for Placement {
    fn default() -> Self {
        Self::host()
    }
}
