//! Backend aliases selected by cargo feature.
//!
//! `cuda` wins over `wgpu`, which wins over the default `ndarray` CPU backend.

use burn::tensor::backend::Backend;
use kiln_config::Accelerator;

use crate::ModelError;

#[cfg(feature = "cuda")]
pub type ComputeBackend<F = f32> = burn::backend::Cuda<F>;

#[cfg(all(feature = "wgpu", not(feature = "cuda")))]
pub type ComputeBackend<F = f32> = burn::backend::Wgpu<F>;

#[cfg(all(feature = "ndarray", not(any(feature = "cuda", feature = "wgpu"))))]
pub type ComputeBackend<F = f32> = burn::backend::NdArray<F>;

#[cfg(not(any(feature = "ndarray", feature = "wgpu", feature = "cuda")))]
pub type ComputeBackend<F = f32> =
    compile_error!("One of the features 'ndarray', 'wgpu' or 'cuda' must be enabled");

pub type TrainingBackend<F = f32> = burn::backend::Autodiff<ComputeBackend<F>>;

pub type Device = <ComputeBackend as Backend>::Device;

/// Device list for `count` replicas on the requested accelerator.
#[cfg(feature = "cuda")]
pub fn devices(accelerator: Accelerator, count: usize) -> Result<Vec<Device>, ModelError> {
    use burn::backend::cuda::CudaDevice;

    if accelerator == Accelerator::Cpu {
        return Err(ModelError::UnsupportedAccelerator(accelerator.to_string()));
    }
    Ok((0..count.max(1)).map(CudaDevice::new).collect())
}

/// Device list for `count` replicas on the requested accelerator.
#[cfg(all(feature = "wgpu", not(feature = "cuda")))]
pub fn devices(accelerator: Accelerator, count: usize) -> Result<Vec<Device>, ModelError> {
    use burn::backend::wgpu::WgpuDevice;

    let count = count.max(1);
    Ok(match accelerator {
        Accelerator::Cpu => vec![WgpuDevice::Cpu; count],
        Accelerator::Auto if count == 1 => vec![WgpuDevice::DefaultDevice],
        Accelerator::Gpu | Accelerator::Auto => (0..count).map(WgpuDevice::DiscreteGpu).collect(),
    })
}

/// Device list for `count` replicas on the requested accelerator.
///
/// The CPU backend has a single device; replicas share it.
#[cfg(all(feature = "ndarray", not(any(feature = "cuda", feature = "wgpu"))))]
pub fn devices(accelerator: Accelerator, count: usize) -> Result<Vec<Device>, ModelError> {
    use burn::backend::ndarray::NdArrayDevice;

    if accelerator == Accelerator::Gpu {
        return Err(ModelError::UnsupportedAccelerator(accelerator.to_string()));
    }
    Ok(vec![NdArrayDevice::Cpu; count.max(1)])
}

#[cfg(all(test, feature = "ndarray", not(any(feature = "cuda", feature = "wgpu"))))]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_devices() {
        assert_eq!(devices(Accelerator::Auto, 1).unwrap().len(), 1);
        assert_eq!(devices(Accelerator::Cpu, 3).unwrap().len(), 3);
        assert_eq!(devices(Accelerator::Cpu, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_gpu_rejected_on_cpu_build() {
        assert!(matches!(
            devices(Accelerator::Gpu, 1),
            Err(ModelError::UnsupportedAccelerator(_))
        ));
    }
}
