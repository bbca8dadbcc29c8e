//! Coarse quantizer: maps binary codes to their nearest centroids.
//!
//! The index only consumes [`BinaryQuantizer::assign`]; training is provided
//! by [`FlatBinaryQuantizer`] as binary k-modes (Lloyd iterations where each
//! centroid bit is the majority vote of its members).

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::hamming::hamming_distance;
use crate::select::HeapSelector;

/// Parameters of centroid training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusteringParameters {
    /// Lloyd iterations.
    pub niter: usize,
    /// RNG seed for sampling and initialization.
    pub seed: u64,
    /// Training points kept per centroid; larger sets are sub-sampled.
    pub max_points_per_centroid: usize,
}

impl Default for ClusteringParameters {
    fn default() -> Self {
        Self {
            niter: 25,
            seed: 1234,
            max_points_per_centroid: 256,
        }
    }
}

/// Nearest centroids for a batch of codes, row-major `n * k`.
///
/// Rows are ordered by ascending distance, ties by lower centroid id. Slots
/// beyond the number of centroids hold id `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Centroids per code.
    pub k: usize,
    /// Hamming distances to the centroids.
    pub distances: Vec<i32>,
    /// Centroid ids.
    pub labels: Vec<i64>,
}

impl Assignment {
    /// Centroid ids for code `i`.
    #[must_use]
    pub fn labels_of(&self, i: usize) -> &[i64] {
        &self.labels[i * self.k..(i + 1) * self.k]
    }
}

/// Nearest-centroid search over binary codes.
pub trait BinaryQuantizer: Send + Sync + Debug {
    /// Code size in bytes.
    fn code_size(&self) -> usize;

    /// Number of centroids.
    fn len(&self) -> usize;

    /// Returns true if there are no centroids.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once centroids are available.
    fn is_trained(&self) -> bool;

    /// Returns the `k` nearest centroids of each code.
    ///
    /// # Errors
    ///
    /// `NotTrained` before training, `DimensionMismatch` if `codes` is not a
    /// whole number of codes.
    fn assign(&self, codes: &[u8], k: usize) -> Result<Assignment>;

    /// Learns `nlist` centroids from `codes`, replacing existing ones.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if fewer than `nlist` training codes are given.
    fn train(&mut self, codes: &[u8], nlist: usize, params: &ClusteringParameters)
        -> Result<()>;
}

/// Exhaustive Hamming search over a flat centroid table.
#[derive(Debug, Clone)]
pub struct FlatBinaryQuantizer {
    code_size: usize,
    centroids: Vec<u8>,
}

impl FlatBinaryQuantizer {
    /// Creates an empty quantizer for `code_size`-byte codes.
    #[must_use]
    pub fn new(code_size: usize) -> Self {
        Self {
            code_size,
            centroids: Vec::new(),
        }
    }

    /// Appends caller-provided centroids.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if `codes` is not a whole number of codes.
    pub fn add_centroids(&mut self, codes: &[u8]) -> Result<()> {
        self.check_codes(codes)?;
        self.centroids.extend_from_slice(codes);
        Ok(())
    }

    /// Code of centroid `i`.
    #[must_use]
    pub fn centroid(&self, i: usize) -> Option<&[u8]> {
        let start = i.checked_mul(self.code_size)?;
        self.centroids.get(start..start + self.code_size)
    }

    fn check_codes(&self, codes: &[u8]) -> Result<()> {
        if self.code_size == 0 || codes.len() % self.code_size != 0 {
            return Err(Error::DimensionMismatch {
                expected: self.code_size * 8,
                actual: codes.len() * 8,
            });
        }
        Ok(())
    }

    fn nearest(&self, code: &[u8]) -> (usize, u32) {
        let mut best = (0, u32::MAX);
        for (c, centroid) in self.centroids.chunks_exact(self.code_size).enumerate() {
            let d = hamming_distance(code, centroid);
            if d < best.1 {
                best = (c, d);
            }
        }
        best
    }
}

impl BinaryQuantizer for FlatBinaryQuantizer {
    fn code_size(&self) -> usize {
        self.code_size
    }

    fn len(&self) -> usize {
        self.centroids.len() / self.code_size.max(1)
    }

    fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    fn assign(&self, codes: &[u8], k: usize) -> Result<Assignment> {
        if !self.is_trained() {
            return Err(Error::NotTrained);
        }
        self.check_codes(codes)?;
        let n = codes.len() / self.code_size;
        let mut distances = vec![0i32; n * k];
        let mut labels = vec![0i64; n * k];
        if k == 0 {
            return Ok(Assignment {
                k,
                distances,
                labels,
            });
        }

        distances
            .par_chunks_mut(k)
            .zip(labels.par_chunks_mut(k))
            .zip(codes.par_chunks_exact(self.code_size))
            .for_each(|((d_row, l_row), code)| {
                let mut heap = HeapSelector::new(k);
                for (c, centroid) in self.centroids.chunks_exact(self.code_size).enumerate() {
                    heap.push(hamming_distance(code, centroid), c as i64);
                }
                heap.drain_into(d_row, l_row);
            });

        Ok(Assignment {
            k,
            distances,
            labels,
        })
    }

    fn train(
        &mut self,
        codes: &[u8],
        nlist: usize,
        params: &ClusteringParameters,
    ) -> Result<()> {
        self.check_codes(codes)?;
        let cs = self.code_size;
        let n = codes.len() / cs;
        if nlist == 0 || n < nlist {
            return Err(Error::InvalidArgument(format!(
                "need at least {nlist} training codes, got {n}"
            )));
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let max_points = nlist.saturating_mul(params.max_points_per_centroid.max(1));
        let points: Vec<u8> = if n > max_points {
            tracing::debug!(n, kept = max_points, "sub-sampling training set");
            let mut picked = sample(&mut rng, n, max_points).into_vec();
            picked.sort_unstable();
            picked
                .iter()
                .flat_map(|&i| codes[i * cs..(i + 1) * cs].iter().copied())
                .collect()
        } else {
            codes.to_vec()
        };
        let npoints = points.len() / cs;

        self.centroids = sample(&mut rng, npoints, nlist)
            .iter()
            .flat_map(|i| points[i * cs..(i + 1) * cs].iter().copied())
            .collect();

        let nbits = cs * 8;
        let mut assign = vec![usize::MAX; npoints];
        for iter in 0..params.niter {
            let next: Vec<usize> = points
                .par_chunks_exact(cs)
                .map(|p| self.nearest(p).0)
                .collect();
            let changed = next.iter().zip(&assign).filter(|(a, b)| a != b).count();
            assign = next;

            let mut sizes = vec![0usize; nlist];
            let mut ones = vec![0u32; nlist * nbits];
            for (p, &c) in points.chunks_exact(cs).zip(&assign) {
                sizes[c] += 1;
                let counts = &mut ones[c * nbits..(c + 1) * nbits];
                for (bit, count) in counts.iter_mut().enumerate() {
                    *count += u32::from((p[bit / 8] >> (bit % 8)) & 1);
                }
            }

            let mut reseeded = 0usize;
            for c in 0..nlist {
                let centroid = &mut self.centroids[c * cs..(c + 1) * cs];
                if sizes[c] == 0 {
                    // Empty cluster: reseed from a random training point
                    let p = rng.gen_range(0..npoints);
                    centroid.copy_from_slice(&points[p * cs..(p + 1) * cs]);
                    reseeded += 1;
                    continue;
                }
                centroid.fill(0);
                let counts = &ones[c * nbits..(c + 1) * nbits];
                for (bit, &count) in counts.iter().enumerate() {
                    if count as usize * 2 > sizes[c] {
                        centroid[bit / 8] |= 1 << (bit % 8);
                    }
                }
            }

            tracing::trace!(iter, changed, reseeded, "k-modes iteration");
            if changed == 0 && reseeded == 0 {
                break;
            }
        }

        tracing::debug!(nlist, npoints, "coarse quantizer trained");
        Ok(())
    }
}

/// Coarse quantizer either owned by one index or shared with the caller.
#[derive(Debug)]
pub enum QuantizerHandle {
    /// Destroyed with the index; may be trained through it.
    Owned(Box<dyn BinaryQuantizer>),
    /// Caller-owned; must be trained by the caller.
    Shared(Arc<dyn BinaryQuantizer>),
}

impl QuantizerHandle {
    /// Returns true if the index owns the quantizer.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    /// Mutable access, available only for owned quantizers.
    pub fn as_owned_mut(&mut self) -> Option<&mut dyn BinaryQuantizer> {
        match self {
            Self::Owned(q) => Some(q.as_mut()),
            Self::Shared(_) => None,
        }
    }
}

impl std::ops::Deref for QuantizerHandle {
    type Target = dyn BinaryQuantizer;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Owned(q) => q.as_ref(),
            Self::Shared(q) => q.as_ref(),
        }
    }
}
