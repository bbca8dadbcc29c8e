//! Paged search over host-resident query batches.
//!
//! A batch too large for one device pass is split into chunks and streamed
//! through three bounded stages:
//!
//! ```text
//!  transfer-in ──filled──▶ compute ──done──▶ transfer-out
//!       ▲                     │
//!       └────────free─────────┘
//! ```
//!
//! Staging slots circulate on the `free` queue. A slot goes back only after
//! compute on it has finished, so the copy of chunk `i + 1` overlaps the
//! compute of chunk `i` but never overwrites a slot still being read. Two
//! slots are used when a second stream can be leased; otherwise one slot makes
//! the stages run back to back.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread;

use crate::config::PagingConfig;
use crate::error::{Error, Result};
use crate::resources::{DeviceBuffer, DeviceResources, MemorySpace};
use crate::select::SearchResults;

/// Device bytes of one result slot (distance + id).
pub(crate) const RESULT_ENTRY_BYTES: usize = std::mem::size_of::<i32>() + std::mem::size_of::<i64>();

struct FilledChunk {
    first: usize,
    rows: usize,
    slot: DeviceBuffer,
}

/// Chunked search driver for host-resident batches.
#[derive(Debug)]
pub struct PagedSearch<'a> {
    resources: &'a DeviceResources,
    config: PagingConfig,
    chunk_rows: Option<usize>,
}

impl<'a> PagedSearch<'a> {
    /// Creates a driver drawing staging memory and streams from `resources`.
    #[must_use]
    pub fn new(resources: &'a DeviceResources, config: PagingConfig) -> Self {
        Self {
            resources,
            config,
            chunk_rows: None,
        }
    }

    /// Forces a chunk size in queries instead of deriving it from the budget.
    #[must_use]
    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = Some(rows.max(1));
        self
    }

    /// Queries per chunk for codes of `code_size` bytes, from the paging
    /// configuration alone.
    #[must_use]
    pub fn chunk_rows(&self, code_size: usize) -> usize {
        if let Some(rows) = self.chunk_rows {
            return rows;
        }
        let budget = if self.config.pinned_staging_bytes > 0 {
            self.config.page_bytes.min(self.config.pinned_staging_bytes / 2)
        } else {
            self.config.page_bytes
        };
        (budget / code_size.max(1)).max(1)
    }

    /// Queries per chunk for a run returning `k` results per query.
    ///
    /// [`PagedSearch::chunk_rows`] further capped so that one chunk's result
    /// scratch, and its staging when pinned memory is disabled, fits in the
    /// device memory available now. A forced chunk size is used as is.
    #[must_use]
    pub fn planned_rows(&self, code_size: usize, k: usize) -> usize {
        let rows = self.chunk_rows(code_size);
        if self.chunk_rows.is_some() {
            return rows;
        }
        let mut per_row = k * RESULT_ENTRY_BYTES;
        if self.config.pinned_staging_bytes == 0 {
            per_row += code_size;
        }
        let available = self.resources.available_memory(MemorySpace::Device);
        rows.min((available / per_row.max(1)).max(1))
    }

    /// Searches `queries` chunk by chunk with `compute`, returning the
    /// concatenated results.
    ///
    /// `compute` receives one chunk of whole codes and returns its results.
    /// On `DeviceOutOfMemory` the whole batch is restarted once with half the
    /// chunk size. Either every row is returned or the call fails.
    ///
    /// # Errors
    ///
    /// Propagates staging, transfer and compute errors.
    pub fn run<F>(
        &self,
        queries: &[u8],
        code_size: usize,
        k: usize,
        compute: F,
    ) -> Result<SearchResults>
    where
        F: FnMut(&[u8]) -> Result<SearchResults>,
    {
        self.run_with_restart(queries, code_size, k, compute, || {})
    }

    /// Same as [`PagedSearch::run`], calling `on_restart` before the batch is
    /// restarted so per-chunk side effects of the failed attempt can be
    /// discarded.
    ///
    /// # Errors
    ///
    /// Propagates staging, transfer and compute errors.
    pub fn run_with_restart<F, R>(
        &self,
        queries: &[u8],
        code_size: usize,
        k: usize,
        mut compute: F,
        mut on_restart: R,
    ) -> Result<SearchResults>
    where
        F: FnMut(&[u8]) -> Result<SearchResults>,
        R: FnMut(),
    {
        let rows = self.planned_rows(code_size, k);
        match self.run_chunks(queries, code_size, k, rows, &mut compute) {
            Err(err @ Error::DeviceOutOfMemory { .. }) if self.config.retry_on_oom && rows > 1 => {
                let retry_rows = rows.div_ceil(2);
                tracing::warn!(
                    error = %err,
                    rows,
                    retry_rows,
                    "paged search out of device memory, retrying with smaller chunks"
                );
                on_restart();
                self.run_chunks(queries, code_size, k, retry_rows, &mut compute)
            }
            other => other,
        }
    }

    fn staging_slot(&self, bytes: usize) -> Result<DeviceBuffer> {
        if self.config.pinned_staging_bytes >= bytes {
            match self.resources.alloc_buffer(bytes, MemorySpace::Pinned) {
                Ok(slot) => return Ok(slot),
                Err(err) => {
                    tracing::debug!(error = %err, "pinned staging unavailable, using device pages");
                }
            }
        }
        self.resources.alloc_buffer(bytes, MemorySpace::Device)
    }

    fn run_chunks<F>(
        &self,
        queries: &[u8],
        code_size: usize,
        k: usize,
        rows: usize,
        compute: &mut F,
    ) -> Result<SearchResults>
    where
        F: FnMut(&[u8]) -> Result<SearchResults>,
    {
        let nq = queries.len() / code_size.max(1);
        let nchunks = nq.div_ceil(rows);
        if nchunks == 0 {
            return Ok(SearchResults::sentinel(0, k));
        }

        let _compute_stream = self.resources.acquire_stream();
        let copy_stream = if nchunks > 1 {
            self.resources.try_acquire_stream()
        } else {
            None
        };
        let nslots = if copy_stream.is_some() { 2 } else { 1 };
        let slot_bytes = rows.min(nq) * code_size;

        let (free_tx, free_rx) = bounded::<DeviceBuffer>(nslots);
        for _ in 0..nslots {
            let slot = self.staging_slot(slot_bytes)?;
            free_tx
                .send(slot)
                .map_err(|_| Error::DeviceExecution("staging queue closed".to_string()))?;
        }

        tracing::debug!(nq, rows, nchunks, nslots, "paged search");

        thread::scope(|s| -> Result<SearchResults> {
            let (filled_tx, filled_rx) = bounded::<Result<FilledChunk>>(nslots);
            let (done_tx, done_rx) = bounded::<(usize, SearchResults)>(nslots);

            let page_in = thread::Builder::new()
                .name("ivfbin-page-in".to_string())
                .spawn_scoped(s, move || transfer_in(queries, code_size, rows, &free_rx, &filled_tx))
                .map_err(|e| Error::DeviceExecution(format!("cannot start transfer stage: {e}")))?;

            let page_out = thread::Builder::new()
                .name("ivfbin-page-out".to_string())
                .spawn_scoped(s, move || transfer_out(nq, k, &done_rx))
                .map_err(|e| Error::DeviceExecution(format!("cannot start transfer stage: {e}")))?;

            let computed =
                compute_stage(self.resources, code_size, k, &filled_rx, &free_tx, &done_tx, compute);

            // Closing the queues lets both stages drain and exit.
            drop(free_tx);
            drop(filled_rx);
            drop(done_tx);

            page_in
                .join()
                .map_err(|_| Error::DeviceExecution("transfer-in stage panicked".to_string()))?;
            let results = page_out
                .join()
                .map_err(|_| Error::DeviceExecution("transfer-out stage panicked".to_string()))?;

            computed?;
            Ok(results)
        })
    }
}

fn transfer_in(
    queries: &[u8],
    code_size: usize,
    rows: usize,
    free: &Receiver<DeviceBuffer>,
    filled: &Sender<Result<FilledChunk>>,
) {
    let nq = queries.len() / code_size.max(1);
    let mut first = 0;
    while first < nq {
        let Ok(mut slot) = free.recv() else {
            return;
        };
        let rows = rows.min(nq - first);
        let copied = slot
            .copy_from(&queries[first * code_size..(first + rows) * code_size])
            .map(|()| FilledChunk { first, rows, slot });
        let failed = copied.is_err();
        if filled.send(copied).is_err() || failed {
            return;
        }
        first += rows;
    }
}

fn compute_stage<F>(
    resources: &DeviceResources,
    code_size: usize,
    k: usize,
    filled: &Receiver<Result<FilledChunk>>,
    free: &Sender<DeviceBuffer>,
    done: &Sender<(usize, SearchResults)>,
    compute: &mut F,
) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<SearchResults>,
{
    for chunk in filled {
        let chunk = chunk?;
        let _results_scratch =
            resources.allocate(chunk.rows * k * RESULT_ENTRY_BYTES, MemorySpace::Device)?;
        let out = compute(&chunk.slot.as_slice()[..chunk.rows * code_size]);

        // Slot reuse point: compute on it has finished.
        let FilledChunk { first, slot, .. } = chunk;
        let _ = free.send(slot);

        let out = out?;
        if done.send((first, out)).is_err() {
            return Err(Error::DeviceExecution("transfer-out stage closed".to_string()));
        }
    }
    Ok(())
}

fn transfer_out(nq: usize, k: usize, done: &Receiver<(usize, SearchResults)>) -> SearchResults {
    let mut results = SearchResults::sentinel(nq, k);
    for (first, chunk) in done {
        results.write_rows(first, &chunk);
    }
    results
}
