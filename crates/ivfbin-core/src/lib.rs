//! # `ivfbin` Core
//!
//! Inverted-file index for binary codes, searched by Hamming distance, with
//! codes kept resident in (simulated) device memory.
//!
//! ## Features
//!
//! - **IVF search**: probe the `nprobe` nearest partitions, scan only their members
//! - **Two top-k selectors**: bounded heap or distance histogram, identical results
//! - **Paged search**: double-buffered streaming of oversized host query batches
//! - **Direct map**: reconstruct stored codes by id
//! - **Optional GPU kernel**: wgpu compute shader for long lists (`gpu` feature)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ivfbin_core::{BinaryIvfIndex, IvfConfig, StandardResources};
//!
//! let config = IvfConfig::load()?;
//! let resources = StandardResources::from_config(&config.device);
//!
//! // 256-bit codes, 1024 partitions
//! let mut index = BinaryIvfIndex::with_flat_quantizer(&resources, 256, 1024, &config)?;
//! index.train(&training_codes)?;
//! index.add(&codes)?;
//!
//! index.set_nprobe(32)?;
//! let results = index.search(&queries, 10)?;
//! let (distances, ids) = results.row(0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// =============================================================================
// NUMERIC CAST LINTS
// =============================================================================
// Ids are i64 while offsets and counts are usize; Hamming distances fit u32.
// Prefer try_from() where a value may actually be out of range.
// =============================================================================
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
// =============================================================================
// STYLISTIC LINTS - Safe to allow globally (no bug risk)
// =============================================================================
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod direct_map;
#[cfg(test)]
mod direct_map_tests;
pub mod error;
#[cfg(test)]
mod error_tests;
pub mod gpu;
pub mod hamming;
pub mod invlists;
#[cfg(test)]
mod invlists_tests;
pub mod ivf;
pub mod logging;
pub mod paging;
pub mod quantizer;
pub mod resources;
pub mod scan;
pub mod select;

pub use config::{ConfigError, DeviceConfig, IvfConfig, LoggingConfig, PagingConfig, SearchParams};
pub use direct_map::{DirectMap, DirectMapType, Location};
pub use error::{Error, Result};
pub use gpu::ComputeBackend;
pub use hamming::{hamming_distance, HammingKernel};
pub use invlists::{DeviceInvertedLists, InvListsHandle};
pub use ivf::BinaryIvfIndex;
pub use logging::init_tracing;
pub use paging::PagedSearch;
pub use quantizer::{
    Assignment, BinaryQuantizer, ClusteringParameters, FlatBinaryQuantizer, QuantizerHandle,
};
pub use resources::{
    DeviceAllocation, DeviceBuffer, DeviceResources, MemorySpace, ResourcesProvider,
    StandardResources,
};
pub use scan::SearchStats;
pub use select::{SearchResults, SelectionStrategy, SENTINEL_DISTANCE, SENTINEL_ID};
