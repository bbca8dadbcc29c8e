//! Top-k selection over (distance, id) candidates.
//!
//! Two interchangeable strategies:
//!
//! | Strategy | Cost | Bookkeeping |
//! |----------|------|-------------|
//! | Heap     | O(C log k) | k entries |
//! | Counting | O(C + n)   | n + 1 buckets for n-bit codes |
//!
//! Both return the k smallest candidates ordered by `(distance, id)`, so for
//! the same candidate pool they produce identical results. Missing slots are
//! filled with [`SENTINEL_ID`] and [`SENTINEL_DISTANCE`].

use std::collections::BinaryHeap;

/// Id reported for result slots with no candidate.
pub const SENTINEL_ID: i64 = -1;

/// Distance reported for result slots with no candidate.
pub const SENTINEL_DISTANCE: i32 = i32::MAX;

/// Selection algorithm, chosen once per search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Bounded max-heap of size k.
    #[default]
    Heap,
    /// Histogram over the bounded Hamming distance range.
    Counting,
}

impl SelectionStrategy {
    /// Maps the `use_heap` switch to a strategy.
    #[must_use]
    pub const fn from_use_heap(use_heap: bool) -> Self {
        if use_heap {
            Self::Heap
        } else {
            Self::Counting
        }
    }
}

/// Writes sorted `(distance, id)` pairs and pads the rest with sentinels.
fn write_row(
    entries: impl Iterator<Item = (u32, i64)>,
    distances: &mut [i32],
    labels: &mut [i64],
) {
    let mut written = 0;
    for ((d, id), (out_d, out_id)) in entries.zip(distances.iter_mut().zip(labels.iter_mut())) {
        *out_d = i32::try_from(d).unwrap_or(SENTINEL_DISTANCE);
        *out_id = id;
        written += 1;
    }
    distances[written..].fill(SENTINEL_DISTANCE);
    labels[written..].fill(SENTINEL_ID);
}

/// Bounded max-heap keeping the k smallest `(distance, id)` pairs.
#[derive(Debug, Clone)]
pub struct HeapSelector {
    k: usize,
    heap: BinaryHeap<(u32, i64)>,
}

impl HeapSelector {
    /// Creates an empty selector for `k` results.
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k),
        }
    }

    /// Offers a candidate; it replaces the current maximum if smaller.
    #[inline]
    pub fn push(&mut self, distance: u32, id: i64) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push((distance, id));
        } else if let Some(mut top) = self.heap.peek_mut() {
            if (distance, id) < *top {
                *top = (distance, id);
            }
        }
    }

    /// Writes the sorted result row and empties the selector for reuse.
    pub fn drain_into(&mut self, distances: &mut [i32], labels: &mut [i64]) {
        let sorted = std::mem::take(&mut self.heap).into_sorted_vec();
        write_row(sorted.into_iter(), distances, labels);
    }
}

/// Histogram selector for distances bounded by the code width in bits.
///
/// Candidates are bucketed by exact distance. Once strictly-smaller buckets
/// already hold k candidates, the boundary bucket is discarded and the
/// threshold drops, so each candidate is handled in O(1) amortized.
/// Buckets are sorted by id when drained.
#[derive(Debug, Clone)]
pub struct CountingSelector {
    k: usize,
    buckets: Vec<Vec<i64>>,
    /// Largest distance still accepted.
    thres: usize,
    /// Candidates kept with distance strictly below `thres`.
    count_lt: usize,
}

impl CountingSelector {
    /// Creates an empty selector for `k` results over `nbits`-bit codes.
    #[must_use]
    pub fn new(k: usize, nbits: usize) -> Self {
        Self {
            k,
            buckets: vec![Vec::new(); nbits + 1],
            thres: nbits,
            count_lt: 0,
        }
    }

    /// Offers a candidate.
    #[inline]
    pub fn push(&mut self, distance: u32, id: i64) {
        let d = distance as usize;
        if self.k == 0 || d > self.thres {
            return;
        }
        self.buckets[d].push(id);
        if d < self.thres {
            self.count_lt += 1;
            while self.count_lt >= self.k && self.thres > 0 {
                self.buckets[self.thres].clear();
                self.thres -= 1;
                self.count_lt -= self.buckets[self.thres].len();
            }
        }
    }

    /// Writes the sorted result row and empties the selector for reuse.
    pub fn drain_into(&mut self, distances: &mut [i32], labels: &mut [i64]) {
        let k = self.k;
        let thres = self.thres;
        let mut selected = Vec::with_capacity(k);
        for (d, bucket) in self.buckets[..=thres].iter_mut().enumerate() {
            if selected.len() < k && !bucket.is_empty() {
                bucket.sort_unstable();
                let take = (k - selected.len()).min(bucket.len());
                selected.extend(bucket[..take].iter().map(|&id| (d as u32, id)));
            }
            bucket.clear();
        }
        self.thres = self.buckets.len() - 1;
        self.count_lt = 0;
        write_row(selected.into_iter(), distances, labels);
    }
}

/// Strategy-dispatched selector for one query.
#[derive(Debug, Clone)]
pub enum KSelector {
    /// Heap-based selection.
    Heap(HeapSelector),
    /// Counting-based selection.
    Counting(CountingSelector),
}

impl KSelector {
    /// Creates a selector for `k` results over `nbits`-bit codes.
    #[must_use]
    pub fn new(strategy: SelectionStrategy, k: usize, nbits: usize) -> Self {
        match strategy {
            SelectionStrategy::Heap => Self::Heap(HeapSelector::new(k)),
            SelectionStrategy::Counting => Self::Counting(CountingSelector::new(k, nbits)),
        }
    }

    /// Offers a candidate.
    #[inline]
    pub fn push(&mut self, distance: u32, id: i64) {
        match self {
            Self::Heap(h) => h.push(distance, id),
            Self::Counting(c) => c.push(distance, id),
        }
    }

    /// Offers a block of candidates with matching distances and ids.
    pub fn push_block(&mut self, distances: &[u32], ids: &[i64]) {
        match self {
            Self::Heap(h) => distances
                .iter()
                .zip(ids)
                .for_each(|(&d, &id)| h.push(d, id)),
            Self::Counting(c) => distances
                .iter()
                .zip(ids)
                .for_each(|(&d, &id)| c.push(d, id)),
        }
    }

    /// Writes the sorted result row and empties the selector for reuse.
    pub fn drain_into(&mut self, distances: &mut [i32], labels: &mut [i64]) {
        match self {
            Self::Heap(h) => h.drain_into(distances, labels),
            Self::Counting(c) => c.drain_into(distances, labels),
        }
    }
}

/// k-NN results for a batch of queries, stored row-major (`nq * k`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResults {
    k: usize,
    /// Hamming distances, `SENTINEL_DISTANCE` for empty slots.
    pub distances: Vec<i32>,
    /// Vector ids, `SENTINEL_ID` for empty slots.
    pub labels: Vec<i64>,
}

impl SearchResults {
    /// Creates results for `nq` queries with every slot set to the sentinel.
    #[must_use]
    pub fn sentinel(nq: usize, k: usize) -> Self {
        Self {
            k,
            distances: vec![SENTINEL_DISTANCE; nq * k],
            labels: vec![SENTINEL_ID; nq * k],
        }
    }

    /// Results per query.
    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of queries.
    #[must_use]
    pub fn nq(&self) -> usize {
        if self.k == 0 {
            0
        } else {
            self.labels.len() / self.k
        }
    }

    /// Distances and ids of query `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= nq()`.
    #[must_use]
    pub fn row(&self, i: usize) -> (&[i32], &[i64]) {
        let range = i * self.k..(i + 1) * self.k;
        (&self.distances[range.clone()], &self.labels[range])
    }

    /// Mutable distances and ids of query `i`.
    pub(crate) fn row_mut(&mut self, i: usize) -> (&mut [i32], &mut [i64]) {
        let range = i * self.k..(i + 1) * self.k;
        (&mut self.distances[range.clone()], &mut self.labels[range])
    }

    /// Copies the rows of `chunk` into this batch starting at query `first`.
    pub(crate) fn write_rows(&mut self, first: usize, chunk: &SearchResults) {
        let start = first * self.k;
        let end = start + chunk.labels.len();
        self.distances[start..end].copy_from_slice(&chunk.distances);
        self.labels[start..end].copy_from_slice(&chunk.labels);
    }
}
