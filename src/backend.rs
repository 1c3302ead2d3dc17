//! Backend abstraction - Multi-backend support
//!
//! Supports both CUDA (GPU) and NdArray (CPU) backends, picked at compile time,
//! and the execution context that carries the device through the pipeline.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

// --------------------------------------------------------------------------------
// BACKEND SELECTION: CUDA (preferred) or NdArray (fallback)
// --------------------------------------------------------------------------------

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), feature = "ndarray"))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray")))]
compile_error!("At least one backend (cuda or ndarray) must be enabled!");

/// The default autodiff backend for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(all(not(feature = "cuda"), feature = "ndarray"))]
    {
        "NdArray (CPU)"
    }
}

/// Device handle handed to every component that creates tensors
///
/// Components never fall back to a process-wide default device; they take
/// the device from the context they are given.
#[derive(Debug, Clone)]
pub struct ExecutionContext<B: Backend> {
    device: B::Device,
}

impl<B: Backend> ExecutionContext<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

impl ExecutionContext<TrainingBackend> {
    /// Context on the backend's default device
    pub fn default_training() -> Self {
        Self::new(<TrainingBackend as Backend>::Device::default())
    }
}
