//! Device-resident inverted lists.
//!
//! Each partition stores its ids and codes in two contiguous arrays guarded by
//! its own `RwLock`: one writer or many readers per list, while unrelated
//! lists stay fully concurrent. Device memory for a list is reserved through
//! [`DeviceResources`] and grows geometrically, so appends are amortized O(1).
//!
//! # Performance Characteristics
//!
//! | Operation | Cost | Lock |
//! |-----------|------|------|
//! | append    | O(1) amortized | list write |
//! | scan      | O(list length) | list read  |
//! | reset     | O(nlist)       | each list write, in order |

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::resources::{DeviceAllocation, DeviceResources, MemorySpace};

/// Smallest capacity (in entries) reserved for a non-empty list.
pub const MIN_LIST_CAPACITY: usize = 16;

/// One partition: parallel id and code arrays.
#[derive(Debug, Default)]
pub struct InvertedList {
    ids: Vec<i64>,
    codes: Vec<u8>,
    capacity: usize,
    reservation: Option<DeviceAllocation>,
}

impl InvertedList {
    fn clear(&mut self) {
        self.ids = Vec::new();
        self.codes = Vec::new();
        self.capacity = 0;
        self.reservation = None;
    }
}

/// Per-partition storage of `(id, code)` entries.
#[derive(Debug)]
pub struct DeviceInvertedLists {
    code_size: usize,
    lists: Vec<RwLock<InvertedList>>,
    total: AtomicUsize,
    generation: AtomicU64,
    resources: Arc<DeviceResources>,
}

impl DeviceInvertedLists {
    /// Creates `nlist` empty lists for codes of `code_size` bytes.
    #[must_use]
    pub fn new(nlist: usize, code_size: usize, resources: Arc<DeviceResources>) -> Self {
        Self {
            code_size,
            lists: (0..nlist).map(|_| RwLock::new(InvertedList::default())).collect(),
            total: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            resources,
        }
    }

    /// Number of lists.
    #[inline]
    #[must_use]
    pub fn nlist(&self) -> usize {
        self.lists.len()
    }

    /// Code size in bytes.
    #[inline]
    #[must_use]
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Device bytes needed per stored entry.
    #[inline]
    #[must_use]
    pub fn entry_bytes(&self) -> usize {
        std::mem::size_of::<i64>() + self.code_size
    }

    /// Total entries across all lists.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    fn slot(&self, list: usize) -> Result<&RwLock<InvertedList>> {
        self.lists.get(list).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "list {list} out of range [0, {})",
                self.lists.len()
            ))
        })
    }

    /// Locks a list for appending.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `list` is out of range.
    pub fn write_list(&self, list: usize) -> Result<ListWriteGuard<'_>> {
        let guard = self.slot(list)?.write();
        Ok(ListWriteGuard { owner: self, guard })
    }

    /// Locks a list for scanning.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `list` is out of range.
    pub fn read_list(&self, list: usize) -> Result<ListReadGuard<'_>> {
        let guard = self.slot(list)?.read();
        Ok(ListReadGuard {
            code_size: self.code_size,
            guard,
        })
    }

    /// Appends one entry and returns its offset in the list.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument`, `DimensionMismatch` or `DeviceOutOfMemory`.
    pub fn append(&self, list: usize, id: i64, code: &[u8]) -> Result<usize> {
        self.write_list(list)?.append_batch(&[id], code)
    }

    /// Number of entries in `list` (0 if out of range).
    #[must_use]
    pub fn list_len(&self, list: usize) -> usize {
        self.lists.get(list).map_or(0, |l| l.read().ids.len())
    }

    /// Entry counts of every list.
    #[must_use]
    pub fn list_sizes(&self) -> Vec<usize> {
        self.lists.iter().map(|l| l.read().ids.len()).collect()
    }

    /// Returns the id and a copy of the code stored at `(list, offset)`.
    #[must_use]
    pub fn get(&self, list: usize, offset: usize) -> Option<(i64, Vec<u8>)> {
        let guard = self.read_list(list).ok()?;
        let id = *guard.ids().get(offset)?;
        guard.code(offset).map(|c| (id, c.to_vec()))
    }

    /// Empties every list and releases its device reservation.
    pub fn reset(&self) {
        for list in &self.lists {
            let mut guard = list.write();
            let removed = guard.ids.len();
            guard.clear();
            self.total.fetch_sub(removed, Ordering::AcqRel);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of completed resets.
    ///
    /// Indexes sharing these lists compare it against the value their direct
    /// map was built at.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Imbalance factor of the list sizes (1.0 = perfectly balanced).
    #[must_use]
    pub fn imbalance_factor(&self) -> f64 {
        let sizes = self.list_sizes();
        let total: usize = sizes.iter().sum();
        if total == 0 {
            return 0.0;
        }
        let sum_sq: f64 = sizes.iter().map(|&s| (s as f64) * (s as f64)).sum();
        sum_sq * sizes.len() as f64 / ((total as f64) * (total as f64))
    }

    /// Device bytes currently reserved by all lists.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.lists
            .iter()
            .map(|l| l.read().reservation.as_ref().map_or(0, DeviceAllocation::bytes))
            .sum()
    }
}

/// Exclusive access to one list.
pub struct ListWriteGuard<'a> {
    owner: &'a DeviceInvertedLists,
    guard: RwLockWriteGuard<'a, InvertedList>,
}

impl ListWriteGuard<'_> {
    /// Entries currently in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guard.ids.len()
    }

    /// Returns true if the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guard.ids.is_empty()
    }

    /// Ensures room for `additional` entries, growing the device reservation.
    ///
    /// On failure the list is unchanged.
    ///
    /// # Errors
    ///
    /// Returns `DeviceOutOfMemory` if the reservation cannot grow.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let needed = self.guard.ids.len() + additional;
        if needed <= self.guard.capacity {
            return Ok(());
        }
        let new_capacity = needed
            .max(self.guard.capacity * 2)
            .max(MIN_LIST_CAPACITY);
        let bytes = new_capacity * self.owner.entry_bytes();

        let owner = self.owner;
        let list = &mut *self.guard;
        if let Some(reservation) = list.reservation.as_mut() {
            reservation.resize(bytes)?;
        } else {
            list.reservation = Some(owner.resources.allocate(bytes, MemorySpace::Device)?);
        }

        list.ids.reserve_exact(new_capacity - list.ids.len());
        list.codes
            .reserve_exact(new_capacity * owner.code_size - list.codes.len());
        list.capacity = new_capacity;
        Ok(())
    }

    /// Appends entries and returns the offset of the first one.
    ///
    /// Either every entry is appended or none is.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if `codes` is not `ids.len()` codes long,
    /// or `DeviceOutOfMemory` if the list cannot grow.
    pub fn append_batch(&mut self, ids: &[i64], codes: &[u8]) -> Result<usize> {
        let code_size = self.owner.code_size;
        if codes.len() != ids.len() * code_size {
            return Err(Error::DimensionMismatch {
                expected: ids.len() * code_size * 8,
                actual: codes.len() * 8,
            });
        }
        self.reserve(ids.len())?;

        let first = self.guard.ids.len();
        self.guard.ids.extend_from_slice(ids);
        self.guard.codes.extend_from_slice(codes);
        self.owner.total.fetch_add(ids.len(), Ordering::AcqRel);
        Ok(first)
    }
}

/// Shared access to one list for scanning.
pub struct ListReadGuard<'a> {
    code_size: usize,
    guard: RwLockReadGuard<'a, InvertedList>,
}

impl ListReadGuard<'_> {
    /// Entries in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guard.ids.len()
    }

    /// Returns true if the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guard.ids.is_empty()
    }

    /// All ids, in storage order.
    #[must_use]
    pub fn ids(&self) -> &[i64] {
        &self.guard.ids
    }

    /// All codes, concatenated in storage order.
    #[must_use]
    pub fn codes(&self) -> &[u8] {
        &self.guard.codes
    }

    /// Code stored at `offset`.
    #[must_use]
    pub fn code(&self, offset: usize) -> Option<&[u8]> {
        let start = offset.checked_mul(self.code_size)?;
        self.guard.codes.get(start..start + self.code_size)
    }

    /// The first `n` entries (or all, if shorter) as id and code slices.
    #[must_use]
    pub fn prefix(&self, n: usize) -> (&[i64], &[u8]) {
        let n = n.min(self.len());
        (&self.guard.ids[..n], &self.guard.codes[..n * self.code_size])
    }

    /// Candidate stream of `(id, code)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &[u8])> + '_ {
        self.guard
            .ids
            .iter()
            .copied()
            .zip(self.guard.codes.chunks_exact(self.code_size.max(1)))
    }
}

/// Inverted lists either owned by one index or shared with the caller.
#[derive(Debug)]
pub enum InvListsHandle {
    /// Destroyed with the index.
    Owned(Box<DeviceInvertedLists>),
    /// Caller-owned; outlives the index.
    Shared(Arc<DeviceInvertedLists>),
}

impl InvListsHandle {
    /// Returns true if the index owns the lists.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

impl std::ops::Deref for InvListsHandle {
    type Target = DeviceInvertedLists;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Owned(lists) => lists,
            Self::Shared(lists) => lists,
        }
    }
}
