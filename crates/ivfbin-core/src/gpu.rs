//! Compute backend selection for Hamming scoring.
//!
//! The host kernel is always compiled. Building with the `gpu` feature adds a
//! wgpu compute shader that the index uses for probed lists of at least 4096
//! codes. Shorter lists stay on the host, where dispatch and readback would
//! cost more than the scan.
//!
//! Vulkan, Metal and DirectX 12 adapters are supported through wgpu.

use std::fmt;

#[cfg(feature = "gpu")]
#[path = "gpu/gpu_backend.rs"]
mod gpu_backend;

#[cfg(all(test, feature = "gpu"))]
#[path = "gpu/gpu_backend_tests.rs"]
mod gpu_backend_tests;

#[cfg(feature = "gpu")]
pub use gpu_backend::GpuHammingAccelerator;

/// Where Hamming distances are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeBackend {
    /// Word-wise popcount on the host.
    #[default]
    Cpu,
    /// wgpu compute shader.
    #[cfg(feature = "gpu")]
    Gpu,
}

impl ComputeBackend {
    /// GPU when an adapter can be opened, CPU otherwise.
    #[must_use]
    pub fn best_available() -> Self {
        #[cfg(feature = "gpu")]
        if Self::gpu_available() {
            return Self::Gpu;
        }
        Self::Cpu
    }

    /// Returns true if this build can open a GPU adapter.
    #[must_use]
    pub fn gpu_available() -> bool {
        #[cfg(feature = "gpu")]
        {
            GpuHammingAccelerator::is_available()
        }
        #[cfg(not(feature = "gpu"))]
        {
            false
        }
    }

    /// Short lowercase name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            #[cfg(feature = "gpu")]
            Self::Gpu => "gpu",
        }
    }
}

impl fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
