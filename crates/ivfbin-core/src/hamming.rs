//! Hamming distance kernel over packed binary codes.
//!
//! Codes are `code_size` bytes long. The CPU path XORs 8-byte words and
//! counts set bits; with the `gpu` feature, large blocks of codes can be
//! scored by a compute shader instead.

use std::fmt;
#[cfg(feature = "gpu")]
use std::sync::Arc;

#[cfg(feature = "gpu")]
use crate::gpu::GpuHammingAccelerator;
use crate::gpu::ComputeBackend;
use crate::error::Result;

/// Blocks smaller than this are always scored on the CPU.
#[cfg(feature = "gpu")]
pub const GPU_MIN_BLOCK: usize = 4096;

/// Computes the Hamming distance between two packed codes.
///
/// # Panics
///
/// Panics if the codes have different lengths.
#[inline]
#[must_use]
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    assert_eq!(a.len(), b.len(), "Code sizes must match");

    let mut words_a = a.chunks_exact(8);
    let mut words_b = b.chunks_exact(8);
    let mut count = 0u32;

    for (x, y) in words_a.by_ref().zip(words_b.by_ref()) {
        let x = u64::from_le_bytes(x.try_into().unwrap_or([0; 8]));
        let y = u64::from_le_bytes(y.try_into().unwrap_or([0; 8]));
        count += (x ^ y).count_ones();
    }

    count
        + words_a
            .remainder()
            .iter()
            .zip(words_b.remainder())
            .map(|(&x, &y)| (x ^ y).count_ones())
            .sum::<u32>()
}

/// Distance kernel selected once per index.
#[derive(Clone, Default)]
pub enum HammingKernel {
    /// Word-wise popcount on the host.
    #[default]
    Cpu,
    /// wgpu compute shader (requires `gpu` feature).
    #[cfg(feature = "gpu")]
    Gpu(Arc<GpuHammingAccelerator>),
}

impl fmt::Debug for HammingKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("HammingKernel::Cpu"),
            #[cfg(feature = "gpu")]
            Self::Gpu(_) => f.write_str("HammingKernel::Gpu"),
        }
    }
}

impl HammingKernel {
    /// Builds the kernel for a compute backend.
    ///
    /// Falls back to the CPU kernel when no adapter can be opened.
    #[must_use]
    pub fn for_backend(backend: ComputeBackend) -> Self {
        match backend {
            ComputeBackend::Cpu => Self::Cpu,
            #[cfg(feature = "gpu")]
            ComputeBackend::Gpu => GpuHammingAccelerator::new()
                .map_or(Self::Cpu, |gpu| Self::Gpu(Arc::new(gpu))),
        }
    }

    /// Returns the backend this kernel runs on.
    #[must_use]
    pub fn backend(&self) -> ComputeBackend {
        match self {
            Self::Cpu => ComputeBackend::Cpu,
            #[cfg(feature = "gpu")]
            Self::Gpu(_) => ComputeBackend::Gpu,
        }
    }

    /// Scores `query` against every code in the contiguous block `codes`.
    ///
    /// `out` is cleared and receives one distance per code, in block order.
    ///
    /// # Errors
    ///
    /// Returns `DeviceExecution` if the GPU dispatch or readback fails.
    pub fn distances(
        &self,
        query: &[u8],
        codes: &[u8],
        code_size: usize,
        out: &mut Vec<u32>,
    ) -> Result<()> {
        out.clear();
        if code_size == 0 {
            return Ok(());
        }
        match self {
            #[cfg(feature = "gpu")]
            Self::Gpu(gpu) if codes.len() / code_size >= GPU_MIN_BLOCK => {
                *out = gpu.batch_hamming(query, codes, code_size)?;
            }
            _ => {
                out.extend(
                    codes
                        .chunks_exact(code_size)
                        .map(|code| hamming_distance(query, code)),
                );
            }
        }
        Ok(())
    }
}
