//! Binary IVF index: coarse quantizer + inverted lists + direct map.
//!
//! # Concurrency
//!
//! All operations except training take `&self`. Adds and searches lock only
//! the lists they touch, so they run concurrently across partitions. `reset`
//! and direct-map maintenance take the index gate exclusively and are
//! therefore atomic with respect to every add and search.
//!
//! An add claims its ids in the direct map before appending, so concurrent
//! adds of one id store it at most once. Indexes sharing inverted lists
//! detect a reset made through another index by the lists' generation and
//! rebuild their direct map before the next add or reconstruct.
//!
//! Search parameters are read once at the start of a search; setters affect
//! the next call only.
//!
//! # Example
//!
//! ```rust,ignore
//! use ivfbin_core::{BinaryIvfIndex, IvfConfig, StandardResources};
//!
//! let resources = StandardResources::new();
//! let mut index = BinaryIvfIndex::with_flat_quantizer(&resources, 256, 1024, &IvfConfig::default())?;
//! index.train(&training_codes)?;
//! index.add(&codes)?;
//! index.set_nprobe(16)?;
//! let results = index.search(&queries, 10)?;
//! ```

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{IvfConfig, PagingConfig, SearchParams};
use crate::direct_map::{DirectMap, DirectMapType};
use crate::error::{Error, Result};
use crate::gpu::ComputeBackend;
use crate::hamming::HammingKernel;
use crate::invlists::{DeviceInvertedLists, InvListsHandle};
use crate::paging::{PagedSearch, RESULT_ENTRY_BYTES};
use crate::quantizer::{ClusteringParameters, FlatBinaryQuantizer, QuantizerHandle};
use crate::resources::{DeviceBuffer, DeviceResources, MemorySpace, ResourcesProvider};
use crate::scan::{Scanner, SearchStats, StatsCounter};
use crate::select::SearchResults;

/// GPU-resident inverted-file index over binary codes, searched by Hamming
/// distance.
#[derive(Debug)]
pub struct BinaryIvfIndex {
    dims: usize,
    code_size: usize,
    resources: Arc<DeviceResources>,
    quantizer: QuantizerHandle,
    invlists: InvListsHandle,
    direct_map: DirectMap,
    /// Reset generation of the lists the direct map was built against.
    map_generation: AtomicU64,
    params: ArcSwap<SearchParams>,
    paging: PagingConfig,
    clustering: ClusteringParameters,
    kernel: HammingKernel,
    next_id: AtomicI64,
    /// Shared by add/search, exclusive for reset and map maintenance.
    gate: RwLock<()>,
    stats: StatsCounter,
}

fn code_size_for(dims: usize) -> Result<usize> {
    if dims == 0 || dims % 8 != 0 {
        return Err(Error::InvalidArgument(format!(
            "dims must be a positive multiple of 8, got {dims}"
        )));
    }
    Ok(dims / 8)
}

impl BinaryIvfIndex {
    /// Creates an index with its own inverted lists.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `dims` is not a positive multiple of 8, `nlist`
    ///   is zero or the default `nprobe` exceeds `nlist`
    /// - `DimensionMismatch` if the quantizer uses another code width
    /// - `Config` if `config` fails validation
    pub fn new(
        provider: &dyn ResourcesProvider,
        quantizer: QuantizerHandle,
        dims: usize,
        nlist: usize,
        config: &IvfConfig,
    ) -> Result<Self> {
        let code_size = code_size_for(dims)?;
        if nlist == 0 {
            return Err(Error::InvalidArgument("nlist must be >= 1".to_string()));
        }
        let resources = provider.resources();
        let invlists = InvListsHandle::Owned(Box::new(DeviceInvertedLists::new(
            nlist,
            code_size,
            Arc::clone(&resources),
        )));
        Self::assemble(resources, quantizer, invlists, dims, config)
    }

    /// Creates an index owning an untrained [`FlatBinaryQuantizer`].
    ///
    /// # Errors
    ///
    /// Same as [`BinaryIvfIndex::new`].
    pub fn with_flat_quantizer(
        provider: &dyn ResourcesProvider,
        dims: usize,
        nlist: usize,
        config: &IvfConfig,
    ) -> Result<Self> {
        let code_size = code_size_for(dims)?;
        let quantizer = QuantizerHandle::Owned(Box::new(FlatBinaryQuantizer::new(code_size)));
        Self::new(provider, quantizer, dims, nlist, config)
    }

    /// Creates an index over caller-owned inverted lists.
    ///
    /// Entries already stored in `invlists` are indexed in the direct map.
    ///
    /// # Errors
    ///
    /// Same as [`BinaryIvfIndex::new`], plus `DimensionMismatch` if the lists
    /// hold codes of another width.
    pub fn with_shared_invlists(
        provider: &dyn ResourcesProvider,
        quantizer: QuantizerHandle,
        invlists: Arc<DeviceInvertedLists>,
        dims: usize,
        config: &IvfConfig,
    ) -> Result<Self> {
        let code_size = code_size_for(dims)?;
        if invlists.code_size() != code_size {
            return Err(Error::DimensionMismatch {
                expected: dims,
                actual: invlists.code_size() * 8,
            });
        }
        let index = Self::assemble(
            provider.resources(),
            quantizer,
            InvListsHandle::Shared(invlists),
            dims,
            config,
        )?;
        if index.invlists.total_len() > 0 {
            index.direct_map.rebuild(&index.invlists)?;
            let next = index.invlists.total_len() as i64;
            index.next_id.store(next, Ordering::Release);
        }
        Ok(index)
    }

    fn assemble(
        resources: Arc<DeviceResources>,
        quantizer: QuantizerHandle,
        invlists: InvListsHandle,
        dims: usize,
        config: &IvfConfig,
    ) -> Result<Self> {
        config.validate()?;
        let code_size = code_size_for(dims)?;
        if quantizer.code_size() != code_size {
            return Err(Error::DimensionMismatch {
                expected: dims,
                actual: quantizer.code_size() * 8,
            });
        }
        let nlist = invlists.nlist();
        if config.search.nprobe > nlist {
            return Err(Error::InvalidArgument(format!(
                "nprobe {} out of range [1, {nlist}]",
                config.search.nprobe
            )));
        }

        if quantizer.is_trained() && quantizer.len() != nlist {
            return Err(Error::InvalidArgument(format!(
                "trained quantizer has {} centroids for {nlist} inverted lists",
                quantizer.len()
            )));
        }

        tracing::info!(
            dims,
            nlist,
            owns_quantizer = quantizer.is_owned(),
            owns_invlists = invlists.is_owned(),
            "binary IVF index created"
        );

        let generation = invlists.generation();
        Ok(Self {
            dims,
            code_size,
            resources,
            quantizer,
            invlists,
            direct_map: DirectMap::default(),
            map_generation: AtomicU64::new(generation),
            params: ArcSwap::from_pointee(config.search),
            paging: config.paging,
            clustering: ClusteringParameters::default(),
            kernel: HammingKernel::default(),
            next_id: AtomicI64::new(0),
            gate: RwLock::new(()),
            stats: StatsCounter::default(),
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Code width in bits.
    #[must_use]
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Code size in bytes.
    #[must_use]
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Number of inverted lists.
    #[must_use]
    pub fn nlist(&self) -> usize {
        self.invlists.nlist()
    }

    /// Number of stored vectors.
    #[must_use]
    pub fn ntotal(&self) -> usize {
        self.invlists.total_len()
    }

    /// Returns true if the coarse quantizer can assign codes.
    #[must_use]
    pub fn is_trained(&self) -> bool {
        self.quantizer.is_trained()
    }

    /// Returns true if the quantizer is destroyed with the index.
    #[must_use]
    pub fn owns_quantizer(&self) -> bool {
        self.quantizer.is_owned()
    }

    /// Returns true if the inverted lists are destroyed with the index.
    #[must_use]
    pub fn owns_invlists(&self) -> bool {
        self.invlists.is_owned()
    }

    /// Resource pools used by this index.
    #[must_use]
    pub fn resources(&self) -> &Arc<DeviceResources> {
        &self.resources
    }

    /// Entry counts of every inverted list.
    #[must_use]
    pub fn list_sizes(&self) -> Vec<usize> {
        self.invlists.list_sizes()
    }

    /// Imbalance factor of the inverted lists (1.0 = balanced).
    #[must_use]
    pub fn imbalance_factor(&self) -> f64 {
        self.invlists.imbalance_factor()
    }

    /// Search counters since creation or the last [`reset_stats`](Self::reset_stats).
    #[must_use]
    pub fn stats(&self) -> SearchStats {
        self.stats.snapshot()
    }

    /// Zeroes the search counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    // -------------------------------------------------------------------------
    // Search parameters
    // -------------------------------------------------------------------------

    /// Current default search parameters.
    #[must_use]
    pub fn search_params(&self) -> SearchParams {
        **self.params.load()
    }

    fn update_params(&self, f: impl Fn(&mut SearchParams)) {
        self.params.rcu(|current| {
            let mut next = **current;
            f(&mut next);
            next
        });
    }

    /// Lists probed per query.
    #[must_use]
    pub fn nprobe(&self) -> usize {
        self.params.load().nprobe
    }

    /// Sets the lists probed per query.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `nprobe` is outside `[1, nlist]`.
    pub fn set_nprobe(&self, nprobe: usize) -> Result<()> {
        self.check_nprobe(nprobe)?;
        self.update_params(|p| p.nprobe = nprobe);
        Ok(())
    }

    /// Codes scanned per query at most (0 = unlimited).
    #[must_use]
    pub fn max_codes(&self) -> usize {
        self.params.load().max_codes
    }

    /// Caps the codes scanned per query (0 = unlimited).
    pub fn set_max_codes(&self, max_codes: usize) {
        self.update_params(|p| p.max_codes = max_codes);
    }

    /// Heap selection when true, counting selection otherwise.
    #[must_use]
    pub fn use_heap(&self) -> bool {
        self.params.load().use_heap
    }

    /// Chooses the top-k selection algorithm.
    pub fn set_use_heap(&self, use_heap: bool) {
        self.update_params(|p| p.use_heap = use_heap);
    }

    /// Scan list by list instead of query by query.
    #[must_use]
    pub fn per_invlist_search(&self) -> bool {
        self.params.load().per_invlist_search
    }

    /// Chooses the scan order.
    pub fn set_per_invlist_search(&self, per_invlist: bool) {
        self.update_params(|p| p.per_invlist_search = per_invlist);
    }

    /// Parameters used when training an owned quantizer.
    pub fn set_clustering_parameters(&mut self, params: ClusteringParameters) {
        self.clustering = params;
    }

    /// Selects the Hamming kernel backend.
    ///
    /// Falls back to the CPU when the backend cannot be opened.
    pub fn set_compute_backend(&mut self, backend: ComputeBackend) {
        self.kernel = HammingKernel::for_backend(backend);
        tracing::info!(backend = ?self.kernel.backend(), "compute backend selected");
    }

    fn check_nprobe(&self, nprobe: usize) -> Result<()> {
        let nlist = self.nlist();
        if nprobe == 0 || nprobe > nlist {
            return Err(Error::InvalidArgument(format!(
                "nprobe {nprobe} out of range [1, {nlist}]"
            )));
        }
        Ok(())
    }

    fn check_codes(&self, codes: &[u8]) -> Result<usize> {
        if codes.len() % self.code_size != 0 {
            return Err(Error::DimensionMismatch {
                expected: self.dims,
                actual: codes.len() * 8,
            });
        }
        Ok(codes.len() / self.code_size)
    }

    /// A shared quantizer can be trained by its owner after construction,
    /// so its centroid count is checked on every use.
    fn check_trained(&self) -> Result<()> {
        if !self.quantizer.is_trained() {
            return Err(Error::NotTrained);
        }
        let (centroids, nlist) = (self.quantizer.len(), self.nlist());
        if centroids != nlist {
            return Err(Error::InvalidArgument(format!(
                "trained quantizer has {centroids} centroids for {nlist} inverted lists"
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Training and adding
    // -------------------------------------------------------------------------

    /// Trains the owned coarse quantizer on `codes`.
    ///
    /// A quantizer that already holds `nlist` centroids is left unchanged.
    ///
    /// # Errors
    ///
    /// - `DimensionMismatch` if `codes` is not a whole number of codes
    /// - `InvalidArgument` for a shared quantizer or too few training codes
    pub fn train(&mut self, codes: &[u8]) -> Result<()> {
        self.check_codes(codes)?;
        let nlist = self.nlist();
        if self.quantizer.is_trained() && self.quantizer.len() == nlist {
            tracing::debug!("coarse quantizer already trained");
            return Ok(());
        }
        let params = self.clustering;
        let quantizer = self.quantizer.as_owned_mut().ok_or_else(|| {
            Error::InvalidArgument("a shared quantizer must be trained by its owner".to_string())
        })?;
        quantizer.train(codes, nlist, &params)?;
        tracing::info!(nlist, n = codes.len() / self.code_size, "index trained");
        Ok(())
    }

    /// Adds codes with sequential ids following the last assigned id.
    ///
    /// # Errors
    ///
    /// Same as [`BinaryIvfIndex::add_with_ids`].
    pub fn add(&self, codes: &[u8]) -> Result<()> {
        let n = self.check_codes(codes)?;
        self.check_trained()?;
        let first = self.next_id.fetch_add(n as i64, Ordering::AcqRel);
        let ids: Vec<i64> = (first..first + n as i64).collect();
        self.add_inner(&ids, codes, usize::try_from(first).unwrap_or(0))
    }

    /// Adds codes under caller-chosen ids.
    ///
    /// Every argument is validated before anything is stored. Codes are then
    /// appended list by list; each list either receives all of its codes or
    /// none, together with the matching direct-map entries. When a later list
    /// runs out of device memory, the lists already written keep valid,
    /// fully mapped entries.
    ///
    /// # Errors
    ///
    /// - `DimensionMismatch` if `codes` is not a whole number of codes
    /// - `InvalidArgument` if `ids` and `codes` disagree in length, or the
    ///   ids do not fit the direct-map type
    /// - `NotTrained` before training
    /// - `DeviceOutOfMemory` if a list cannot grow
    pub fn add_with_ids(&self, codes: &[u8], ids: &[i64]) -> Result<()> {
        let n = self.check_codes(codes)?;
        if ids.len() != n {
            return Err(Error::InvalidArgument(format!(
                "{} ids given for {n} codes",
                ids.len()
            )));
        }
        self.add_inner(ids, codes, self.ntotal())
    }

    fn add_inner(&self, ids: &[i64], codes: &[u8], ntotal: usize) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.sync_direct_map();
        let _gate = self.gate.read();
        self.check_trained()?;
        self.direct_map.claim_ids(ids, ntotal)?;
        if let Some(&max) = ids.iter().max() {
            self.next_id.fetch_max(max.saturating_add(1), Ordering::AcqRel);
        }
        self.append_claimed(ids, codes).map_err(|err| {
            // Lists already committed keep their entries.
            self.direct_map.release(ids);
            err
        })?;
        tracing::debug!(n = ids.len(), "codes added");
        Ok(())
    }

    /// Appends codes whose ids are claimed in the direct map, list by list.
    fn append_claimed(&self, ids: &[i64], codes: &[u8]) -> Result<()> {
        let assignment = self.quantizer.assign(codes, 1)?;

        let cs = self.code_size;
        let mut groups: FxHashMap<usize, (Vec<i64>, Vec<u8>)> = FxHashMap::default();
        for (i, &label) in assignment.labels.iter().enumerate() {
            let list = usize::try_from(label).map_err(|_| {
                Error::DeviceExecution(format!("quantizer returned no centroid for code {i}"))
            })?;
            let group = groups.entry(list).or_default();
            group.0.push(ids[i]);
            group.1.extend_from_slice(&codes[i * cs..(i + 1) * cs]);
        }
        let mut groups: Vec<_> = groups.into_iter().collect();
        groups.sort_unstable_by_key(|(list, _)| *list);

        for (list, (list_ids, list_codes)) in &groups {
            let mut guard = self.invlists.write_list(*list)?;
            let first = guard.append_batch(list_ids, list_codes).map_err(|err| {
                tracing::warn!(list, n = list_ids.len(), error = %err, "append failed");
                err
            })?;
            // Mapped before the list lock is released.
            self.direct_map.insert_batch(list_ids, *list, first)?;
        }
        tracing::trace!(lists = groups.len(), "lists appended");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Search
    // -------------------------------------------------------------------------

    /// Searches with the current default parameters.
    ///
    /// # Errors
    ///
    /// Same as [`BinaryIvfIndex::search_with_params`].
    pub fn search(&self, queries: &[u8], k: usize) -> Result<SearchResults> {
        self.search_with_params(queries, k, &self.search_params())
    }

    /// Returns the `k` nearest stored ids of each query.
    ///
    /// Rows are sorted by ascending distance, ties by ascending id, and padded
    /// with sentinels. Host batches larger than `paging.min_paged_bytes` are
    /// streamed through [`PagedSearch`]. The call either returns every row or
    /// fails.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `k` is zero or `nprobe` is out of range
    /// - `DimensionMismatch` if `queries` is not a whole number of codes
    /// - `NotTrained` before training
    /// - `DeviceOutOfMemory` if the batch still does not fit after one retry
    pub fn search_with_params(
        &self,
        queries: &[u8],
        k: usize,
        params: &SearchParams,
    ) -> Result<SearchResults> {
        let nq = self.validate_search(queries, k, params)?;
        if nq == 0 {
            return Ok(SearchResults::sentinel(0, k));
        }
        let _gate = self.gate.read();

        if queries.len() > self.paging.min_paged_bytes {
            let pager = PagedSearch::new(&self.resources, self.paging);
            return self.search_paged(queries, k, params, pager);
        }

        let attempt = self
            .resources
            .upload(queries)
            .and_then(|device_queries| self.search_non_paged(device_queries.as_slice(), k, params));
        match attempt {
            Ok(results) => Ok(results),
            Err(err @ Error::DeviceOutOfMemory { .. }) if self.paging.retry_on_oom && nq > 1 => {
                tracing::warn!(error = %err, nq, "search out of device memory, paging");
                let config = PagingConfig {
                    retry_on_oom: false,
                    ..self.paging
                };
                let pager =
                    PagedSearch::new(&self.resources, config).with_chunk_rows(nq.div_ceil(2));
                self.search_paged(queries, k, params, pager)
            }
            Err(err) => Err(err),
        }
    }

    /// Searches queries that already live in device memory, without paging.
    ///
    /// # Errors
    ///
    /// Same as [`BinaryIvfIndex::search_with_params`].
    pub fn search_resident(&self, queries: &DeviceBuffer, k: usize) -> Result<SearchResults> {
        if queries.space() != MemorySpace::Device {
            return Err(Error::InvalidArgument(
                "resident queries must live in device memory".to_string(),
            ));
        }
        let params = self.search_params();
        let nq = self.validate_search(queries.as_slice(), k, &params)?;
        if nq == 0 {
            return Ok(SearchResults::sentinel(0, k));
        }
        let _gate = self.gate.read();
        self.search_non_paged(queries.as_slice(), k, &params)
    }

    /// Searches `queries` in forced chunks of `chunk_rows` queries.
    ///
    /// Results are identical to [`BinaryIvfIndex::search`] for any chunk size.
    ///
    /// # Errors
    ///
    /// Same as [`BinaryIvfIndex::search_with_params`].
    pub fn search_paged_with_chunk_rows(
        &self,
        queries: &[u8],
        k: usize,
        chunk_rows: usize,
    ) -> Result<SearchResults> {
        let params = self.search_params();
        let nq = self.validate_search(queries, k, &params)?;
        if nq == 0 {
            return Ok(SearchResults::sentinel(0, k));
        }
        let _gate = self.gate.read();
        let pager = PagedSearch::new(&self.resources, self.paging).with_chunk_rows(chunk_rows);
        self.search_paged(queries, k, &params, pager)
    }

    fn validate_search(&self, queries: &[u8], k: usize, params: &SearchParams) -> Result<usize> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be > 0".to_string()));
        }
        self.check_nprobe(params.nprobe)?;
        let nq = self.check_codes(queries)?;
        self.check_trained()?;
        Ok(nq)
    }

    fn search_non_paged(
        &self,
        queries: &[u8],
        k: usize,
        params: &SearchParams,
    ) -> Result<SearchResults> {
        let nq = queries.len() / self.code_size;
        let _scratch = self
            .resources
            .allocate(nq * k * RESULT_ENTRY_BYTES, MemorySpace::Device)?;
        let (results, stats) = self.search_chunk(queries, k, params)?;
        self.stats.record(stats);
        Ok(results)
    }

    fn search_paged(
        &self,
        queries: &[u8],
        k: usize,
        params: &SearchParams,
        pager: PagedSearch<'_>,
    ) -> Result<SearchResults> {
        // Only the attempt that completes is counted.
        let total = Cell::new(SearchStats::default());
        let results = pager.run_with_restart(
            queries,
            self.code_size,
            k,
            |chunk| {
                let (results, stats) = self.search_chunk(chunk, k, params)?;
                let mut sum = total.get();
                sum.nq += stats.nq;
                sum.nlist += stats.nlist;
                sum.ndis += stats.ndis;
                total.set(sum);
                Ok(results)
            },
            || total.set(SearchStats::default()),
        )?;
        self.stats.record(total.get());
        Ok(results)
    }

    /// Quantizer, scan and selection for one device-resident chunk.
    fn search_chunk(
        &self,
        queries: &[u8],
        k: usize,
        params: &SearchParams,
    ) -> Result<(SearchResults, SearchStats)> {
        let _handle = self.resources.acquire_handle();
        let probes = self.quantizer.assign(queries, params.nprobe)?;
        let scanner = Scanner {
            invlists: &self.invlists,
            kernel: &self.kernel,
            params: *params,
            k,
        };
        let out = scanner.scan(queries, &probes)?;
        tracing::trace!(nq = out.1.nq, ndis = out.1.ndis, "chunk searched");
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Reconstruction and maintenance
    // -------------------------------------------------------------------------

    /// Returns the stored code of `id`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id is not stored, `InvalidArgument` without a direct map.
    pub fn reconstruct(&self, id: i64) -> Result<Vec<u8>> {
        self.sync_direct_map();
        let _gate = self.gate.read();
        let location = self.direct_map.lookup(id)?;
        let guard = self.invlists.read_list(location.list)?;
        // Shared lists can be reset and refilled under a stale entry.
        if guard.ids().get(location.offset) != Some(&id) {
            return Err(Error::NotFound(id));
        }
        guard
            .code(location.offset)
            .map(<[u8]>::to_vec)
            .ok_or(Error::NotFound(id))
    }

    /// Returns the codes of ids `first..first + n`, concatenated.
    ///
    /// # Errors
    ///
    /// Fails on the first id that cannot be reconstructed.
    pub fn reconstruct_n(&self, first: i64, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n * self.code_size);
        for id in (first..).take(n) {
            out.extend_from_slice(&self.reconstruct(id)?);
        }
        Ok(out)
    }

    /// Removes every stored vector. The quantizer stays trained and ids
    /// restart at 0.
    pub fn reset(&self) {
        let _gate = self.gate.write();
        let removed = self.invlists.total_len();
        self.invlists.reset();
        self.direct_map.clear();
        self.map_generation.store(self.invlists.generation(), Ordering::Release);
        self.next_id.store(0, Ordering::Release);
        tracing::info!(removed, "index reset");
    }

    /// Current direct-map type.
    #[must_use]
    pub fn direct_map_type(&self) -> DirectMapType {
        self.direct_map.kind()
    }

    /// Switches the direct-map type, rebuilding it from the stored entries.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the stored ids do not fit the new type.
    pub fn set_direct_map_type(&self, kind: DirectMapType) -> Result<()> {
        let _gate = self.gate.write();
        let generation = self.invlists.generation();
        self.direct_map.set_type(kind, &self.invlists)?;
        self.map_generation.store(generation, Ordering::Release);
        Ok(())
    }

    /// Rebuilds the direct map from the inverted lists.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the stored ids do not fit the map type.
    pub fn rebuild_direct_map(&self) -> Result<()> {
        let _gate = self.gate.write();
        tracing::info!("rebuilding direct map");
        let generation = self.invlists.generation();
        self.direct_map.rebuild(&self.invlists)?;
        self.map_generation.store(generation, Ordering::Release);
        Ok(())
    }

    /// Returns the ids whose direct-map entry disagrees with the stored
    /// entries; empty when consistent.
    #[must_use]
    pub fn verify_direct_map(&self) -> Vec<i64> {
        self.sync_direct_map();
        let _gate = self.gate.write();
        self.direct_map.verify(&self.invlists)
    }

    /// Rebuilds the direct map when the lists were reset through another
    /// index sharing them. Must be called without holding the gate.
    fn sync_direct_map(&self) {
        if self.map_generation.load(Ordering::Acquire) == self.invlists.generation() {
            return;
        }
        let _gate = self.gate.write();
        let generation = self.invlists.generation();
        if self.map_generation.load(Ordering::Acquire) == generation {
            return;
        }
        tracing::info!(generation, "inverted lists were reset elsewhere, rebuilding direct map");
        if let Err(err) = self.direct_map.rebuild(&self.invlists) {
            tracing::warn!(error = %err, "direct map cannot index the shared lists, clearing it");
            self.direct_map.clear();
        }
        self.map_generation.store(generation, Ordering::Release);
    }
}
