//! Candidate scanning over probed inverted lists.
//!
//! Two traversal orders produce the same results:
//!
//! - **per query**: each query walks its probed lists in probe order;
//! - **per inverted list**: queries are grouped by list, each list is read
//!   once and scored against every query that probes it.
//!
//! List sizes are snapshotted when a scan starts and every list is read as a
//! prefix of that length, so appends running concurrently are either fully
//! visible to a search or not at all. `max_codes` is split in probe order:
//! probe rank `r` of a query may scan what ranks `0..r` left over.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::SearchParams;
use crate::error::Result;
use crate::hamming::HammingKernel;
use crate::invlists::DeviceInvertedLists;
use crate::quantizer::Assignment;
use crate::select::{KSelector, SearchResults, SelectionStrategy};

/// Search counters accumulated by an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    /// Queries searched.
    pub nq: u64,
    /// Inverted lists scanned (non-empty probes).
    pub nlist: u64,
    /// Distances computed.
    pub ndis: u64,
}

/// Lock-free accumulator behind [`SearchStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    nq: AtomicU64,
    nlist: AtomicU64,
    ndis: AtomicU64,
}

impl StatsCounter {
    pub(crate) fn record(&self, delta: SearchStats) {
        self.nq.fetch_add(delta.nq, Ordering::Relaxed);
        self.nlist.fetch_add(delta.nlist, Ordering::Relaxed);
        self.ndis.fetch_add(delta.ndis, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SearchStats {
        SearchStats {
            nq: self.nq.load(Ordering::Relaxed),
            nlist: self.nlist.load(Ordering::Relaxed),
            ndis: self.ndis.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.nq.store(0, Ordering::Relaxed);
        self.nlist.store(0, Ordering::Relaxed);
        self.ndis.store(0, Ordering::Relaxed);
    }
}

/// Everything one scan needs besides the queries.
pub(crate) struct Scanner<'a> {
    pub invlists: &'a DeviceInvertedLists,
    pub kernel: &'a HammingKernel,
    pub params: SearchParams,
    pub k: usize,
}

/// Scan length of every `(query, probe rank)`, row-major like `probes`.
///
/// Probe ids outside `[0, nlist)` (unfilled quantizer slots) scan nothing.
pub(crate) fn probe_limits(
    probes: &Assignment,
    sizes: &[usize],
    budget: Option<usize>,
) -> Vec<usize> {
    let nprobe = probes.k;
    let mut limits = vec![0usize; probes.labels.len()];
    if nprobe == 0 {
        return limits;
    }
    for (row, out) in probes.labels.chunks(nprobe).zip(limits.chunks_mut(nprobe)) {
        let mut left = budget.unwrap_or(usize::MAX);
        for (&list, limit) in row.iter().zip(out.iter_mut()) {
            let size = usize::try_from(list)
                .ok()
                .and_then(|l| sizes.get(l).copied())
                .unwrap_or(0);
            *limit = size.min(left);
            left -= *limit;
        }
    }
    limits
}

impl Scanner<'_> {
    fn strategy(&self) -> SelectionStrategy {
        SelectionStrategy::from_use_heap(self.params.use_heap)
    }

    fn nbits(&self) -> usize {
        self.invlists.code_size() * 8
    }

    /// Scores `queries` against the lists in `probes` and keeps the top k.
    ///
    /// # Errors
    ///
    /// Propagates kernel failures; no partial result is returned.
    pub fn scan(
        &self,
        queries: &[u8],
        probes: &Assignment,
    ) -> Result<(SearchResults, SearchStats)> {
        let code_size = self.invlists.code_size();
        let nq = queries.len() / code_size.max(1);
        let sizes = self.invlists.list_sizes();
        let limits = probe_limits(probes, &sizes, self.params.code_budget());

        let mut results = SearchResults::sentinel(nq, self.k);
        if self.k == 0 || nq == 0 {
            return Ok((results, SearchStats::default()));
        }

        if self.params.per_invlist_search {
            self.scan_by_list(queries, probes, &limits, &mut results)?;
        } else {
            self.scan_by_query(queries, probes, &limits, &mut results)?;
        }

        let stats = SearchStats {
            nq: nq as u64,
            nlist: limits.iter().filter(|&&l| l > 0).count() as u64,
            ndis: limits.iter().sum::<usize>() as u64,
        };
        Ok((results, stats))
    }

    fn scan_by_query(
        &self,
        queries: &[u8],
        probes: &Assignment,
        limits: &[usize],
        results: &mut SearchResults,
    ) -> Result<()> {
        let code_size = self.invlists.code_size();
        let nprobe = probes.k.max(1);
        let k = self.k;

        results
            .distances
            .par_chunks_mut(k)
            .zip(results.labels.par_chunks_mut(k))
            .zip(queries.par_chunks_exact(code_size))
            .zip(probes.labels.par_chunks(nprobe))
            .zip(limits.par_chunks(nprobe))
            .try_for_each_init(
                || (KSelector::new(self.strategy(), k, self.nbits()), Vec::new()),
                |(selector, buf), ((((d_row, l_row), query), lists), caps)| -> Result<()> {
                    for (&list, &limit) in lists.iter().zip(caps) {
                        if limit == 0 {
                            continue;
                        }
                        let guard = self.invlists.read_list(list as usize)?;
                        let (ids, codes) = guard.prefix(limit);
                        self.kernel.distances(query, codes, code_size, buf)?;
                        selector.push_block(buf, ids);
                    }
                    selector.drain_into(d_row, l_row);
                    Ok(())
                },
            )
    }

    fn scan_by_list(
        &self,
        queries: &[u8],
        probes: &Assignment,
        limits: &[usize],
        results: &mut SearchResults,
    ) -> Result<()> {
        let code_size = self.invlists.code_size();
        let nprobe = probes.k.max(1);

        let mut by_list: FxHashMap<usize, Vec<(usize, usize)>> = FxHashMap::default();
        for (slot, (&list, &limit)) in probes.labels.iter().zip(limits).enumerate() {
            if limit > 0 {
                by_list
                    .entry(list as usize)
                    .or_default()
                    .push((slot / nprobe, limit));
            }
        }
        let mut work: Vec<(usize, Vec<(usize, usize)>)> = by_list.into_iter().collect();
        work.sort_unstable_by_key(|(list, _)| *list);

        // One read per list: copy the id prefix, score every probing query.
        let blocks = work
            .par_iter()
            .map(|(list, entries)| -> Result<(Vec<i64>, Vec<(usize, Vec<u32>)>)> {
                let guard = self.invlists.read_list(*list)?;
                let longest = entries.iter().map(|&(_, l)| l).max().unwrap_or(0);
                let (ids, codes) = guard.prefix(longest);
                let mut scored = Vec::with_capacity(entries.len());
                for &(q, limit) in entries {
                    // A reset through another index sharing the lists can
                    // leave the list shorter than its snapshot.
                    let limit = limit.min(ids.len());
                    let query = &queries[q * code_size..(q + 1) * code_size];
                    let mut buf = Vec::with_capacity(limit);
                    self.kernel
                        .distances(query, &codes[..limit * code_size], code_size, &mut buf)?;
                    scored.push((q, buf));
                }
                Ok((ids.to_vec(), scored))
            })
            .collect::<Result<Vec<_>>>()?;

        let nq = results.nq();
        let mut selectors: Vec<KSelector> = (0..nq)
            .map(|_| KSelector::new(self.strategy(), self.k, self.nbits()))
            .collect();
        for (ids, scored) in &blocks {
            for (q, distances) in scored {
                selectors[*q].push_block(distances, &ids[..distances.len()]);
            }
        }
        for (q, selector) in selectors.iter_mut().enumerate() {
            let (d_row, l_row) = results.row_mut(q);
            selector.drain_into(d_row, l_row);
        }
        Ok(())
    }
}
