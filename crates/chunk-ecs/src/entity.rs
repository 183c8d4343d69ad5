//! Stable entity handles.
//!
//! Entities physically live in an archetype slot, and that slot changes
//! whenever the entity migrates or another entity is swap-removed from the
//! same archetype. Callers hold an [`EntityId`] instead: a generational index
//! into the [`HandleTable`], which maps it to the current
//! [`EntityLocation`].
//!
//! An [`EntityId`] packs a *generation* counter in the high 32 bits and an
//! *index* in the low 32 bits. The generation is bumped every time an index
//! is released, so a handle to a deallocated entity stays stale forever even
//! after its index is handed out again.

use std::collections::VecDeque;
use std::fmt;

use crate::archetype::ArchetypeId;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A generational entity handle.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityLocation
// ---------------------------------------------------------------------------

/// Where an entity's components physically live.
///
/// `slot / entities_per_chunk` selects the block and the remainder the row
/// inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub slot: usize,
}

// ---------------------------------------------------------------------------
// HandleTable
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct HandleEntry {
    generation: u32,
    /// `None` while the index is free, or reserved but not yet placed.
    location: Option<EntityLocation>,
}

/// Generation-checked map from [`EntityId`] to [`EntityLocation`].
///
/// Free indices are kept in a FIFO queue so that generations are spread out
/// over time rather than concentrated on a hot index.
#[derive(Debug, Default)]
pub struct HandleTable {
    entries: Vec<HandleEntry>,
    free_indices: VecDeque<u32>,
    live: usize,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a handle. It is not alive until [`place`](Self::place)d.
    pub fn reserve(&mut self) -> EntityId {
        if let Some(index) = self.free_indices.pop_front() {
            // Generation was already bumped on release.
            EntityId::new(index, self.entries[index as usize].generation)
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(HandleEntry {
                generation: 0,
                location: None,
            });
            EntityId::new(index, 0)
        }
    }

    /// Point a reserved or live handle at `location`.
    pub fn place(&mut self, id: EntityId, location: EntityLocation) -> bool {
        let Some(entry) = entry_mut(&mut self.entries, id) else {
            return false;
        };
        if entry.location.is_none() {
            self.live += 1;
        }
        entry.location = Some(location);
        true
    }

    /// Update only the slot of a live handle, after swap-removal moved it
    /// within its archetype.
    pub fn relocate(&mut self, id: EntityId, slot: usize) -> bool {
        match entry_mut(&mut self.entries, id).and_then(|e| e.location.as_mut()) {
            Some(location) => {
                location.slot = slot;
                true
            }
            None => false,
        }
    }

    /// Invalidate a reserved or live handle and recycle its index.
    ///
    /// Returns the location the handle pointed at, if it was placed.
    pub fn release(&mut self, id: EntityId) -> Option<EntityLocation> {
        let entry = entry_mut(&mut self.entries, id)?;
        let location = entry.location.take();
        entry.generation = entry.generation.wrapping_add(1);
        if location.is_some() {
            self.live -= 1;
        }
        self.free_indices.push_back(id.index());
        location
    }

    pub fn locate(&self, id: EntityId) -> Option<EntityLocation> {
        self.entries
            .get(id.index() as usize)
            .filter(|e| e.generation == id.generation())
            .and_then(|e| e.location)
    }

    pub fn is_alive(&self, id: EntityId) -> bool {
        self.locate(id).is_some()
    }

    /// Number of live (placed) handles.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over every live handle and its location.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, EntityLocation)> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.location
                .map(|loc| (EntityId::new(i as u32, e.generation), loc))
        })
    }

    /// Release every live handle.
    pub fn clear(&mut self) {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.location.take().is_some() {
                entry.generation = entry.generation.wrapping_add(1);
                self.free_indices.push_back(index as u32);
            }
        }
        self.live = 0;
    }
}

fn entry_mut(entries: &mut [HandleEntry], id: EntityId) -> Option<&mut HandleEntry> {
    entries
        .get_mut(id.index() as usize)
        .filter(|e| e.generation == id.generation())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(archetype: u32, slot: usize) -> EntityLocation {
        EntityLocation {
            archetype: ArchetypeId(archetype),
            slot,
        }
    }

    fn spawn(table: &mut HandleTable, slot: usize) -> EntityId {
        let id = table.reserve();
        assert!(table.place(id, loc(0, slot)));
        id
    }

    #[test]
    fn handles_are_unique() {
        let mut table = HandleTable::new();
        let ids: Vec<EntityId> = (0..100).map(|i| spawn(&mut table, i)).collect();
        let mut indices: Vec<u32> = ids.iter().map(|id| id.index()).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 100);
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn reserved_handle_is_not_alive_until_placed() {
        let mut table = HandleTable::new();
        let id = table.reserve();
        assert!(!table.is_alive(id));
        assert!(table.place(id, loc(2, 5)));
        assert_eq!(table.locate(id), Some(loc(2, 5)));
    }

    #[test]
    fn released_handle_stays_stale_after_recycle() {
        let mut table = HandleTable::new();
        let e0 = spawn(&mut table, 0);
        assert_eq!(table.release(e0), Some(loc(0, 0)));
        assert!(!table.is_alive(e0));

        let e1 = spawn(&mut table, 0);
        assert_eq!(e1.index(), e0.index());
        assert_eq!(e1.generation(), e0.generation() + 1);
        assert!(!table.is_alive(e0));
        assert!(table.is_alive(e1));
        assert_eq!(table.release(e0), None);
    }

    #[test]
    fn releasing_a_reserved_handle_recycles_it() {
        let mut table = HandleTable::new();
        let id = table.reserve();
        assert_eq!(table.release(id), None);
        assert_eq!(table.len(), 0);
        let next = table.reserve();
        assert_eq!(next.index(), id.index());
        assert_ne!(next, id);
    }

    #[test]
    fn relocate_moves_only_the_slot() {
        let mut table = HandleTable::new();
        let id = table.reserve();
        table.place(id, loc(3, 9));
        assert!(table.relocate(id, 1));
        assert_eq!(table.locate(id), Some(loc(3, 1)));
    }

    #[test]
    fn fifo_recycling_spreads_generations() {
        let mut table = HandleTable::new();
        let a = spawn(&mut table, 0);
        let b = spawn(&mut table, 1);
        table.release(a);
        table.release(b);
        assert_eq!(table.reserve().index(), a.index());
        assert_eq!(table.reserve().index(), b.index());
    }

    #[test]
    fn clear_invalidates_everything() {
        let mut table = HandleTable::new();
        let ids: Vec<EntityId> = (0..5).map(|i| spawn(&mut table, i)).collect();
        table.clear();
        assert!(table.is_empty());
        assert!(ids.iter().all(|&id| !table.is_alive(id)));
        assert_eq!(table.iter().count(), 0);
    }
}
