//! Direct map from vector id to storage location.
//!
//! Enables `reconstruct(id)`. An add first claims its ids, which marks them
//! pending so a concurrent add of the same id fails. Claimed entries are
//! filled in while the index still holds the write lock of the list the
//! vectors were appended to, so a reader never sees a map entry without the
//! stored code or the other way round. Claims that are never filled are
//! released.
//!
//! | Type | Ids | Storage |
//! |------|-----|---------|
//! | `NoMap`     | any | none, reconstruct disabled |
//! | `Array`     | sequential from 0 | dense vector |
//! | `Hashtable` | any unique | sharded `DashMap` |

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::invlists::DeviceInvertedLists;

/// Storage strategy of a [`DirectMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectMapType {
    /// No map maintained.
    NoMap,
    /// Dense array indexed by id; ids must be sequential.
    Array,
    /// Hash table; any unique ids.
    #[default]
    Hashtable,
}

/// Where a vector is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// Inverted list number.
    pub list: usize,
    /// Offset within the list.
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Slot {
    #[default]
    Vacant,
    /// Claimed by an add that has not appended yet.
    Pending,
    Stored(Location),
}

impl Slot {
    fn location(self) -> Option<Location> {
        match self {
            Self::Stored(loc) => Some(loc),
            Self::Vacant | Self::Pending => None,
        }
    }
}

#[derive(Debug)]
enum MapState {
    NoMap,
    Array(Vec<Slot>),
    Hashtable(DashMap<i64, Slot>),
}

impl MapState {
    fn empty(kind: DirectMapType) -> Self {
        match kind {
            DirectMapType::NoMap => Self::NoMap,
            DirectMapType::Array => Self::Array(Vec::new()),
            DirectMapType::Hashtable => Self::Hashtable(DashMap::new()),
        }
    }

    fn kind(&self) -> DirectMapType {
        match self {
            Self::NoMap => DirectMapType::NoMap,
            Self::Array(_) => DirectMapType::Array,
            Self::Hashtable(_) => DirectMapType::Hashtable,
        }
    }
}

fn array_slot(id: i64) -> Result<usize> {
    usize::try_from(id).map_err(|_| {
        Error::InvalidArgument(format!("array direct map cannot hold negative id {id}"))
    })
}

/// Id to `(list, offset)` lookup.
#[derive(Debug)]
pub struct DirectMap {
    state: RwLock<MapState>,
}

impl Default for DirectMap {
    fn default() -> Self {
        Self::new(DirectMapType::default())
    }
}

impl DirectMap {
    /// Creates an empty map of the given type.
    #[must_use]
    pub fn new(kind: DirectMapType) -> Self {
        Self {
            state: RwLock::new(MapState::empty(kind)),
        }
    }

    /// Current storage type.
    #[must_use]
    pub fn kind(&self) -> DirectMapType {
        self.state.read().kind()
    }

    /// Number of mapped ids.
    #[must_use]
    pub fn len(&self) -> usize {
        match &*self.state.read() {
            MapState::NoMap => 0,
            MapState::Array(slots) => slots.iter().filter(|s| s.location().is_some()).count(),
            MapState::Hashtable(table) => table.iter().filter(|e| e.location().is_some()).count(),
        }
    }

    /// Returns true if no id is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims a batch of ids before anything is appended.
    ///
    /// `ntotal` is the number of vectors stored when the batch is added. On
    /// success every id is pending until [`DirectMap::insert_batch`] records
    /// its location or [`DirectMap::release`] gives it back. On failure
    /// nothing stays claimed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for non-sequential ids on an array map, or
    /// for ids that are duplicated, already stored or claimed by another add.
    pub fn claim_ids(&self, ids: &[i64], ntotal: usize) -> Result<()> {
        {
            let state = self.state.read();
            match &*state {
                MapState::NoMap => return Ok(()),
                MapState::Hashtable(table) => return claim_in_table(table, ids),
                MapState::Array(_) => {}
            }
        }

        let mut state = self.state.write();
        let MapState::Array(slots) = &mut *state else {
            return Ok(());
        };
        let sequential = ids
            .iter()
            .enumerate()
            .all(|(i, &id)| usize::try_from(id).is_ok_and(|id| id == ntotal + i));
        if !sequential {
            return Err(Error::InvalidArgument(format!(
                "array direct map requires sequential ids starting at {ntotal}"
            )));
        }
        let end = ntotal + ids.len();
        if slots[ntotal.min(slots.len())..end.min(slots.len())]
            .iter()
            .any(|s| *s != Slot::Vacant)
        {
            return Err(Error::InvalidArgument(format!(
                "ids {ntotal}..{end} are already claimed"
            )));
        }
        if end > slots.len() {
            slots.resize(end, Slot::Vacant);
        }
        slots[ntotal..end].fill(Slot::Pending);
        Ok(())
    }

    /// Records that `ids` were appended to `list` starting at `first_offset`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if an array map receives a negative id.
    pub fn insert_batch(&self, ids: &[i64], list: usize, first_offset: usize) -> Result<()> {
        let locations = ids.iter().enumerate().map(|(i, &id)| {
            (
                id,
                Slot::Stored(Location {
                    list,
                    offset: first_offset + i,
                }),
            )
        });

        {
            let state = self.state.read();
            match &*state {
                MapState::NoMap => return Ok(()),
                MapState::Hashtable(table) => {
                    for (id, slot) in locations {
                        table.insert(id, slot);
                    }
                    return Ok(());
                }
                MapState::Array(_) => {}
            }
        }

        let mut state = self.state.write();
        if let MapState::Array(slots) = &mut *state {
            for (id, slot) in locations {
                let index = array_slot(id)?;
                if index >= slots.len() {
                    slots.resize(index + 1, Slot::Vacant);
                }
                slots[index] = slot;
            }
        }
        Ok(())
    }

    /// Gives back the ids of `ids` that are still pending.
    ///
    /// Stored entries are left alone, so a partly committed batch can be
    /// released as a whole.
    pub fn release(&self, ids: &[i64]) {
        {
            let state = self.state.read();
            match &*state {
                MapState::NoMap => return,
                MapState::Hashtable(table) => {
                    for id in ids {
                        table.remove_if(id, |_, slot| *slot == Slot::Pending);
                    }
                    return;
                }
                MapState::Array(_) => {}
            }
        }

        let mut state = self.state.write();
        if let MapState::Array(slots) = &mut *state {
            for &id in ids {
                if let Some(slot) = usize::try_from(id).ok().and_then(|i| slots.get_mut(i)) {
                    if *slot == Slot::Pending {
                        *slot = Slot::Vacant;
                    }
                }
            }
            let used = slots.iter().rposition(|s| *s != Slot::Vacant).map_or(0, |i| i + 1);
            slots.truncate(used);
        }
    }

    /// Returns the storage location of `id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the id is not stored, or `InvalidArgument` if
    /// no map is maintained.
    pub fn lookup(&self, id: i64) -> Result<Location> {
        match &*self.state.read() {
            MapState::NoMap => Err(Error::InvalidArgument(
                "direct map is disabled; set a map type to enable reconstruct".to_string(),
            )),
            MapState::Array(slots) => usize::try_from(id)
                .ok()
                .and_then(|slot| slots.get(slot).and_then(|s| s.location()))
                .ok_or(Error::NotFound(id)),
            MapState::Hashtable(table) => table
                .get(&id)
                .and_then(|e| e.location())
                .ok_or(Error::NotFound(id)),
        }
    }

    /// Removes every entry, keeping the storage type.
    pub fn clear(&self) {
        let mut state = self.state.write();
        let kind = state.kind();
        *state = MapState::empty(kind);
    }

    /// Switches the storage type and rebuilds it from `invlists`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the stored ids do not fit the new type;
    /// the previous map is kept in that case.
    pub fn set_type(&self, kind: DirectMapType, invlists: &DeviceInvertedLists) -> Result<()> {
        let rebuilt = Self::scan(kind, invlists)?;
        *self.state.write() = rebuilt;
        Ok(())
    }

    /// Rebuilds the map from the inverted lists.
    ///
    /// Recovery path after [`DirectMap::verify`] reports inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the stored ids do not fit the map type.
    pub fn rebuild(&self, invlists: &DeviceInvertedLists) -> Result<()> {
        let kind = self.kind();
        self.set_type(kind, invlists)
    }

    fn scan(kind: DirectMapType, invlists: &DeviceInvertedLists) -> Result<MapState> {
        let mut state = MapState::empty(kind);
        if kind == DirectMapType::NoMap {
            return Ok(state);
        }
        for list in 0..invlists.nlist() {
            let guard = invlists.read_list(list)?;
            for (offset, &id) in guard.ids().iter().enumerate() {
                let slot = Slot::Stored(Location { list, offset });
                match &mut state {
                    MapState::NoMap => {}
                    MapState::Array(slots) => {
                        let index = array_slot(id)?;
                        if index >= slots.len() {
                            slots.resize(index + 1, Slot::Vacant);
                        }
                        slots[index] = slot;
                    }
                    MapState::Hashtable(table) => {
                        table.insert(id, slot);
                    }
                }
            }
        }
        if let MapState::Array(slots) = &state {
            if slots.iter().any(|s| s.location().is_none()) {
                return Err(Error::InvalidArgument(
                    "array direct map requires dense ids".to_string(),
                ));
            }
        }
        Ok(state)
    }

    /// Checks every stored entry against the map.
    ///
    /// Returns the ids whose mapping is missing or points elsewhere, plus
    /// mapped ids that are no longer stored. An empty result means the map is
    /// consistent. Always empty for `NoMap`.
    #[must_use]
    pub fn verify(&self, invlists: &DeviceInvertedLists) -> Vec<i64> {
        if self.kind() == DirectMapType::NoMap {
            return Vec::new();
        }
        let mut bad = Vec::new();
        let mut stored = 0usize;
        for list in 0..invlists.nlist() {
            let Ok(guard) = invlists.read_list(list) else {
                continue;
            };
            for (offset, &id) in guard.ids().iter().enumerate() {
                stored += 1;
                if self.lookup(id).ok() != Some(Location { list, offset }) {
                    bad.push(id);
                }
            }
        }
        if self.len() != stored {
            let extra: Vec<i64> = match &*self.state.read() {
                MapState::NoMap => Vec::new(),
                MapState::Array(slots) => slots
                    .iter()
                    .enumerate()
                    .filter_map(|(id, slot)| slot.location().map(|l| (id as i64, l)))
                    .filter(|&(id, l)| invlists.get(l.list, l.offset).map(|(s, _)| s) != Some(id))
                    .map(|(id, _)| id)
                    .collect(),
                MapState::Hashtable(table) => table
                    .iter()
                    .filter(|e| {
                        e.location().is_some_and(|l| {
                            invlists.get(l.list, l.offset).map(|(s, _)| s) != Some(*e.key())
                        })
                    })
                    .map(|e| *e.key())
                    .collect(),
            };
            bad.extend(extra);
            bad.sort_unstable();
            bad.dedup();
        }
        if !bad.is_empty() {
            tracing::warn!(inconsistent = bad.len(), "direct map out of sync with inverted lists");
        }
        bad
    }
}

fn claim_in_table(table: &DashMap<i64, Slot>, ids: &[i64]) -> Result<()> {
    for (i, &id) in ids.iter().enumerate() {
        match table.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(Slot::Pending);
            }
            Entry::Occupied(_) => {
                // Claims made so far are still pending; later ones were never made.
                for claimed in &ids[..i] {
                    table.remove_if(claimed, |_, slot| *slot == Slot::Pending);
                }
                return Err(Error::InvalidArgument(format!("duplicate vector id {id}")));
            }
        }
    }
    Ok(())
}
