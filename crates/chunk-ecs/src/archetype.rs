//! Archetype storage: chunked, structure-of-arrays component data.
//!
//! An [`Archetype`] owns every entity that carries exactly the same set of
//! component types. Its data lives in a list of equally sized blocks taken
//! from the world's [`BlockPool`]; inside a block each type occupies one
//! contiguous sub-array at the offset given by the archetype's
//! [`ChunkLayout`]. Slot `s` lives in block `s / entities_per_chunk`, row
//! `s % entities_per_chunk`.
//!
//! Storage stays dense: removing a slot moves the last occupied slot into
//! the hole (swap-removal) and the caller is told which entity moved so it
//! can repair that entity's handle.

use std::fmt;
use std::ops::Range;

use crate::block::{Block, BlockPool};
use crate::component::{ComponentInfo, ComponentTypeId};
use crate::entity::EntityId;
use crate::layout::{ChunkCapacity, ChunkLayout, ItemLayout, MAX_ARCHETYPE_TYPES};
use crate::system::ChunkView;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Index of an archetype in the world's archetype list.
///
/// IDs of released archetypes are recycled for new type sets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchetypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// TypeSet
// ---------------------------------------------------------------------------

/// Ascending, de-duplicated list of at most [`MAX_ARCHETYPE_TYPES`]
/// component type IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TypeSet(Vec<ComponentTypeId>);

impl TypeSet {
    /// Sort and de-duplicate `types`.
    pub fn new(mut types: Vec<ComponentTypeId>) -> Result<Self, EcsError> {
        types.sort_unstable();
        types.dedup();
        if types.len() > MAX_ARCHETYPE_TYPES {
            return Err(EcsError::TooManyTypes {
                max: MAX_ARCHETYPE_TYPES,
                requested: types.len(),
            });
        }
        Ok(Self(types))
    }

    pub fn as_slice(&self) -> &[ComponentTypeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: ComponentTypeId) -> bool {
        self.position(id).is_some()
    }

    /// Column of `id` in this set.
    pub fn position(&self, id: ComponentTypeId) -> Option<usize> {
        self.removal_index(id)
    }

    /// Index at which `id` would be inserted, or `None` if already present.
    pub fn insertion_index(&self, id: ComponentTypeId) -> Option<usize> {
        for (i, &t) in self.0.iter().enumerate() {
            if t == id {
                return None;
            }
            if t > id {
                return Some(i);
            }
        }
        Some(self.0.len())
    }

    /// Index of `id`, or `None` if absent.
    pub fn removal_index(&self, id: ComponentTypeId) -> Option<usize> {
        for (i, &t) in self.0.iter().enumerate() {
            if t == id {
                return Some(i);
            }
            if t > id {
                return None;
            }
        }
        None
    }

    /// Copy of this set with `id` inserted at `index`.
    pub fn with_inserted(&self, index: usize, id: ComponentTypeId) -> Result<Self, EcsError> {
        if self.0.len() >= MAX_ARCHETYPE_TYPES {
            return Err(EcsError::TooManyTypes {
                max: MAX_ARCHETYPE_TYPES,
                requested: self.0.len() + 1,
            });
        }
        let mut types = self.0.clone();
        types.insert(index, id);
        Ok(Self(types))
    }

    /// Copy of this set with the type at `index` removed.
    pub fn with_removed(&self, index: usize) -> Self {
        let mut types = self.0.clone();
        types.remove(index);
        Self(types)
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ArchetypeStorage {
    entity_count: usize,
    free_slots_in_last_block: usize,
    blocks: Vec<Block>,
    /// Handle of the entity in each slot.
    owners: Vec<EntityId>,
}

/// Counts reported by [`Archetype::for_each_chunk`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ChunkWalk {
    pub blocks: usize,
    pub entities: usize,
}

/// Byte location of one column within a chunk, as handed to systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ColumnDesc {
    pub offset: usize,
    pub size: usize,
    pub info: usize,
}

/// Storage for all entities sharing one exact set of component types.
pub struct Archetype {
    id: ArchetypeId,
    types: TypeSet,
    infos: Vec<ComponentInfo>,
    layout: ChunkLayout,
    storage: ArchetypeStorage,
}

impl Archetype {
    /// `infos` must describe `types` in the same order.
    pub(crate) fn new(
        id: ArchetypeId,
        types: TypeSet,
        infos: Vec<ComponentInfo>,
        layout: ChunkLayout,
    ) -> Self {
        Self {
            id,
            types,
            infos,
            layout,
            storage: ArchetypeStorage::default(),
        }
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub fn types(&self) -> &TypeSet {
        &self.types
    }

    pub fn component_types(&self) -> &[ComponentTypeId] {
        self.types.as_slice()
    }

    pub fn infos(&self) -> &[ComponentInfo] {
        &self.infos
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Number of entities stored.
    pub fn len(&self) -> usize {
        self.storage.entity_count
    }

    pub fn is_empty(&self) -> bool {
        self.storage.entity_count == 0
    }

    pub fn block_count(&self) -> usize {
        self.storage.blocks.len()
    }

    pub fn free_slots_in_last_block(&self) -> usize {
        self.storage.free_slots_in_last_block
    }

    /// Entity handles, indexed by slot.
    pub fn entities(&self) -> &[EntityId] {
        &self.storage.owners
    }

    // -- slot management ----------------------------------------------------

    /// Claim a slot for `owner` and return its index.
    pub(crate) fn allocate_slot(
        &mut self,
        pool: &mut BlockPool,
        owner: EntityId,
    ) -> Result<usize, EcsError> {
        let storage = &mut self.storage;
        if let ChunkCapacity::Entities(epc) = self.layout.capacity() {
            if storage.free_slots_in_last_block > 0 {
                storage.free_slots_in_last_block -= 1;
            } else {
                storage.blocks.push(pool.acquire()?);
                storage.free_slots_in_last_block = epc - 1;
            }
        }
        let slot = storage.entity_count;
        storage.entity_count += 1;
        storage.owners.push(owner);
        Ok(slot)
    }

    /// Vacate `slot` by moving the last occupied slot into it.
    ///
    /// Returns the owner of the moved entity, now living at `slot`, or
    /// `None` if `slot` was the last one.
    pub(crate) fn deallocate_slot(&mut self, pool: &mut BlockPool, slot: usize) -> Option<EntityId> {
        let last = self.storage.entity_count - 1;
        if slot != last {
            self.copy_slot_within(last, slot);
        }
        self.storage.owners.swap_remove(slot);
        self.storage.entity_count = last;

        if let ChunkCapacity::Entities(epc) = self.layout.capacity() {
            self.storage.free_slots_in_last_block += 1;
            if self.storage.free_slots_in_last_block == epc {
                if let Some(block) = self.storage.blocks.pop() {
                    pool.release(block);
                }
                self.storage.free_slots_in_last_block = 0;
            }
        }

        (slot != last).then(|| self.storage.owners[slot])
    }

    /// Give every block back to the pool, forgetting all entities.
    pub(crate) fn release_storage(&mut self, pool: &mut BlockPool) {
        for block in self.storage.blocks.drain(..) {
            pool.release(block);
        }
        self.storage.owners.clear();
        self.storage.entity_count = 0;
        self.storage.free_slots_in_last_block = 0;
    }

    // -- byte access --------------------------------------------------------

    /// Zero-sized columns have no range, in tag and sized archetypes alike.
    fn slot_range(&self, column: usize, slot: usize) -> Option<(usize, Range<usize>)> {
        let epc = self.layout.entities_per_chunk()?;
        let size = self.infos[column].size;
        if size == 0 {
            return None;
        }
        let start = self.layout.offset(column) + (slot % epc) * size;
        Some((slot / epc, start..start + size))
    }

    /// Bytes of `column` for the entity in `slot`; `None` for zero-sized
    /// columns.
    pub fn slot_bytes(&self, column: usize, slot: usize) -> Option<&[u8]> {
        let (block, range) = self.slot_range(column, slot)?;
        Some(&self.storage.blocks[block].bytes()[range])
    }

    pub fn slot_bytes_mut(&mut self, column: usize, slot: usize) -> Option<&mut [u8]> {
        let (block, range) = self.slot_range(column, slot)?;
        Some(&mut self.storage.blocks[block].bytes_mut()[range])
    }

    /// The column's info and the slot's bytes, empty for zero-sized columns.
    fn hook_target(&mut self, column: usize, slot: usize) -> (&ComponentInfo, &mut [u8]) {
        let range = self.slot_range(column, slot);
        let info = &self.infos[column];
        let bytes = match range {
            Some((block, range)) => &mut self.storage.blocks[block].bytes_mut()[range],
            None => Default::default(),
        };
        (info, bytes)
    }

    pub(crate) fn construct(&mut self, column: usize, slot: usize) {
        let (info, bytes) = self.hook_target(column, slot);
        info.construct(bytes);
    }

    pub(crate) fn destruct(&mut self, column: usize, slot: usize) {
        let (info, bytes) = self.hook_target(column, slot);
        info.destruct(bytes);
    }

    pub(crate) fn construct_all(&mut self, slot: usize) {
        for column in 0..self.infos.len() {
            self.construct(column, slot);
        }
    }

    pub(crate) fn destruct_all(&mut self, slot: usize) {
        for column in 0..self.infos.len() {
            self.destruct(column, slot);
        }
    }

    /// Copy `columns` of `src_slot` into `dst`, starting at column
    /// `dst_first` of `dst_slot`. Construct and destruct hooks do not run.
    pub(crate) fn copy_columns_to(
        &self,
        src_slot: usize,
        columns: Range<usize>,
        dst: &mut Archetype,
        dst_slot: usize,
        dst_first: usize,
    ) {
        for (k, column) in columns.enumerate() {
            let from = self.slot_bytes(column, src_slot);
            let to = dst.slot_bytes_mut(dst_first + k, dst_slot);
            if let (Some(from), Some(to)) = (from, to) {
                to.copy_from_slice(from);
            }
        }
    }

    fn copy_slot_within(&mut self, from: usize, to: usize) {
        let Some(epc) = self.layout.entities_per_chunk() else {
            return;
        };
        let (from_block, from_row) = (from / epc, from % epc);
        let (to_block, to_row) = (to / epc, to % epc);
        let columns: Vec<(usize, usize)> = self
            .infos
            .iter()
            .enumerate()
            .map(|(c, info)| (self.layout.offset(c), info.size))
            .collect();

        let blocks = &mut self.storage.blocks;
        if from_block == to_block {
            let bytes = blocks[from_block].bytes_mut();
            for &(offset, size) in &columns {
                let src = offset + from_row * size;
                bytes.copy_within(src..src + size, offset + to_row * size);
            }
            return;
        }

        let (src, dst) = if from_block > to_block {
            let (head, tail) = blocks.split_at_mut(from_block);
            (&tail[0], &mut head[to_block])
        } else {
            let (head, tail) = blocks.split_at_mut(to_block);
            (&head[from_block], &mut tail[0])
        };
        let (src, dst) = (src.bytes(), dst.bytes_mut());
        for &(offset, size) in &columns {
            let s = offset + from_row * size;
            let d = offset + to_row * size;
            dst[d..d + size].copy_from_slice(&src[s..s + size]);
        }
    }

    // -- iteration ----------------------------------------------------------

    /// Column descriptors for the given archetype columns.
    pub(crate) fn column_descs(&self, columns: &[usize]) -> Vec<ColumnDesc> {
        columns
            .iter()
            .map(|&c| ColumnDesc {
                offset: self.layout.offset(c),
                size: self.infos[c].size,
                info: c,
            })
            .collect()
    }

    /// Invoke `f` once per occupied block, or once for all entities of a
    /// tag archetype.
    pub(crate) fn for_each_chunk<F>(
        &mut self,
        columns: &[usize],
        f: &mut F,
    ) -> Result<ChunkWalk, EcsError>
    where
        F: FnMut(&mut ChunkView<'_>) -> Result<(), EcsError> + ?Sized,
    {
        let descs = self.column_descs(columns);
        let infos = &self.infos;
        let storage = &mut self.storage;
        let mut walk = ChunkWalk::default();
        if storage.entity_count == 0 {
            return Ok(walk);
        }

        match self.layout.capacity() {
            ChunkCapacity::Tag => {
                let mut empty: [u8; 0] = [];
                let mut view = ChunkView::new(self.id, &mut empty, &descs, infos, &storage.owners);
                f(&mut view)?;
                walk.entities = storage.entity_count;
            }
            ChunkCapacity::Entities(epc) => {
                let last = storage.blocks.len() - 1;
                let tail_len = epc - storage.free_slots_in_last_block;
                for (b, block) in storage.blocks.iter_mut().enumerate() {
                    let len = if b == last { tail_len } else { epc };
                    if len == 0 {
                        continue;
                    }
                    let first = b * epc;
                    let owners = &storage.owners[first..first + len];
                    let mut view = ChunkView::new(self.id, block.bytes_mut(), &descs, infos, owners);
                    f(&mut view)?;
                    walk.blocks += 1;
                    walk.entities += len;
                }
            }
        }
        Ok(walk)
    }

    // -- verification -------------------------------------------------------

    /// Describe the first broken storage invariant, if any.
    pub(crate) fn verify(&self, block_size: usize) -> Result<(), String> {
        let storage = &self.storage;
        let types = self.types.as_slice();
        if types.windows(2).any(|w| w[0] >= w[1]) {
            return Err(format!("{:?} type list is not strictly ascending", self.id));
        }
        if self.infos.len() != types.len() || self.layout.offsets().len() != types.len() {
            return Err(format!("{:?} metadata does not match its type list", self.id));
        }
        if storage.owners.len() != storage.entity_count {
            return Err(format!(
                "{:?} has {} owners for {} entities",
                self.id,
                storage.owners.len(),
                storage.entity_count
            ));
        }
        for (c, info) in self.infos.iter().enumerate() {
            if self.layout.offset(c) % info.align != 0 {
                return Err(format!("{:?} column {c} is misaligned", self.id));
            }
        }
        if self.layout.used_bytes() > block_size {
            return Err(format!("{:?} layout overflows its block", self.id));
        }

        match self.layout.capacity() {
            ChunkCapacity::Tag => {
                if !storage.blocks.is_empty() || storage.free_slots_in_last_block != 0 {
                    return Err(format!("tag {:?} owns blocks", self.id));
                }
            }
            ChunkCapacity::Entities(epc) => {
                let expected_blocks = storage.entity_count.div_ceil(epc);
                if storage.blocks.len() != expected_blocks {
                    return Err(format!(
                        "{:?} owns {} blocks for {} entities at {epc} per block",
                        self.id,
                        storage.blocks.len(),
                        storage.entity_count
                    ));
                }
                let free = expected_blocks * epc - storage.entity_count;
                if storage.free_slots_in_last_block != free {
                    return Err(format!(
                        "{:?} reports {} free slots, expected {free}",
                        self.id, storage.free_slots_in_last_block
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("types", &self.types)
            .field("capacity", &self.layout.capacity())
            .field("entities", &self.storage.entity_count)
            .field("blocks", &self.storage.blocks.len())
            .finish()
    }
}

pub(crate) fn item_layouts(infos: &[ComponentInfo]) -> Vec<ItemLayout> {
    infos
        .iter()
        .map(|info| ItemLayout {
            size: info.size,
            align: info.align,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentHooks, ComponentRegistry};

    const BLOCK: usize = 256;

    fn archetype(reg: &ComponentRegistry, ids: &[ComponentTypeId]) -> Archetype {
        let types = TypeSet::new(ids.to_vec()).unwrap();
        let infos: Vec<ComponentInfo> = types
            .as_slice()
            .iter()
            .map(|&t| reg.info(t).unwrap().clone())
            .collect();
        let layout = ChunkLayout::compute(&item_layouts(&infos), BLOCK).unwrap();
        Archetype::new(ArchetypeId(0), types, infos, layout)
    }

    fn registry() -> (ComponentRegistry, ComponentTypeId, ComponentTypeId) {
        let mut reg = ComponentRegistry::new();
        let a = reg.register_raw("a", 4, 4, ComponentHooks::NONE).unwrap();
        let b = reg.register_raw("b", 8, 8, ComponentHooks::NONE).unwrap();
        (reg, a, b)
    }

    fn write_u32(arch: &mut Archetype, column: usize, slot: usize, value: u32) {
        arch.slot_bytes_mut(column, slot)
            .unwrap()
            .copy_from_slice(&value.to_ne_bytes());
    }

    fn read_u32(arch: &Archetype, column: usize, slot: usize) -> u32 {
        u32::from_ne_bytes(arch.slot_bytes(column, slot).unwrap().try_into().unwrap())
    }

    #[test]
    fn type_set_sorts_and_dedups() {
        let ids = [ComponentTypeId(5), ComponentTypeId(1), ComponentTypeId(5)];
        let set = TypeSet::new(ids.to_vec()).unwrap();
        assert_eq!(set.as_slice(), &[ComponentTypeId(1), ComponentTypeId(5)]);
    }

    #[test]
    fn type_set_rejects_too_many_types() {
        let ids: Vec<ComponentTypeId> = (0..16).map(ComponentTypeId).collect();
        assert!(matches!(
            TypeSet::new(ids),
            Err(EcsError::TooManyTypes { requested: 16, .. })
        ));

        let full = TypeSet::new((0..15).map(ComponentTypeId).collect()).unwrap();
        let index = full.insertion_index(ComponentTypeId(20)).unwrap();
        assert!(matches!(
            full.with_inserted(index, ComponentTypeId(20)),
            Err(EcsError::TooManyTypes { .. })
        ));
    }

    #[test]
    fn insertion_and_removal_indices() {
        let set = TypeSet::new(vec![ComponentTypeId(2), ComponentTypeId(4)]).unwrap();
        assert_eq!(set.insertion_index(ComponentTypeId(1)), Some(0));
        assert_eq!(set.insertion_index(ComponentTypeId(3)), Some(1));
        assert_eq!(set.insertion_index(ComponentTypeId(9)), Some(2));
        assert_eq!(set.insertion_index(ComponentTypeId(4)), None);

        assert_eq!(set.removal_index(ComponentTypeId(4)), Some(1));
        assert_eq!(set.removal_index(ComponentTypeId(3)), None);
        assert_eq!(set.removal_index(ComponentTypeId(9)), None);
    }

    #[test]
    fn slots_fill_blocks_in_order() {
        let (reg, a, _) = registry();
        let mut pool = BlockPool::new(BLOCK, None);
        let mut arch = archetype(&reg, &[a]);
        assert_eq!(arch.layout().entities_per_chunk(), Some(64));

        for i in 0..65 {
            let slot = arch.allocate_slot(&mut pool, EntityId::new(i, 0)).unwrap();
            assert_eq!(slot, i as usize);
        }
        assert_eq!(arch.block_count(), 2);
        assert_eq!(arch.free_slots_in_last_block(), 63);
        assert_eq!(pool.stats().in_use, 2);
        assert!(arch.verify(BLOCK).is_ok());
    }

    #[test]
    fn swap_remove_moves_last_slot_across_blocks() {
        let (reg, a, b) = registry();
        let mut pool = BlockPool::new(BLOCK, None);
        let mut arch = archetype(&reg, &[a, b]);
        let epc = arch.layout().entities_per_chunk().unwrap();

        for i in 0..=epc {
            let slot = arch.allocate_slot(&mut pool, EntityId::new(i as u32, 0)).unwrap();
            write_u32(&mut arch, 0, slot, i as u32 * 10);
        }
        assert_eq!(arch.block_count(), 2);

        // The last entity lives alone in the second block.
        let moved = arch.deallocate_slot(&mut pool, 3);
        assert_eq!(moved, Some(EntityId::new(epc as u32, 0)));
        assert_eq!(read_u32(&arch, 0, 3), epc as u32 * 10);
        assert_eq!(arch.entities()[3], EntityId::new(epc as u32, 0));
        assert_eq!(arch.block_count(), 1);
        assert_eq!(pool.stats().pooled, 1);
        assert!(arch.verify(BLOCK).is_ok());
    }

    #[test]
    fn swap_remove_within_one_block() {
        let (reg, a, _) = registry();
        let mut pool = BlockPool::new(BLOCK, None);
        let mut arch = archetype(&reg, &[a]);
        for i in 0..3 {
            let slot = arch.allocate_slot(&mut pool, EntityId::new(i, 0)).unwrap();
            write_u32(&mut arch, 0, slot, 100 + i);
        }
        assert_eq!(arch.deallocate_slot(&mut pool, 0), Some(EntityId::new(2, 0)));
        assert_eq!(read_u32(&arch, 0, 0), 102);
        assert_eq!(read_u32(&arch, 0, 1), 101);

        assert_eq!(arch.deallocate_slot(&mut pool, 1), None);
        assert_eq!(arch.deallocate_slot(&mut pool, 0), None);
        assert!(arch.is_empty());
        assert_eq!(arch.block_count(), 0);
        assert_eq!(pool.stats().pooled, 1);
    }

    #[test]
    fn tag_archetype_needs_no_blocks() {
        let mut reg = ComponentRegistry::new();
        let tag = reg.register_raw("tag", 0, 1, ComponentHooks::NONE).unwrap();
        let mut pool = BlockPool::new(BLOCK, None);
        let mut arch = archetype(&reg, &[tag]);

        for i in 0..1000 {
            arch.allocate_slot(&mut pool, EntityId::new(i, 0)).unwrap();
        }
        assert_eq!(arch.len(), 1000);
        assert_eq!(arch.block_count(), 0);
        assert_eq!(pool.stats().allocated, 0);
        assert!(arch.slot_bytes(0, 5).is_none());
        assert_eq!(arch.deallocate_slot(&mut pool, 0), Some(EntityId::new(999, 0)));
        assert!(arch.verify(BLOCK).is_ok());
    }

    #[test]
    fn copy_columns_between_archetypes() {
        let (reg, a, b) = registry();
        let mut pool = BlockPool::new(BLOCK, None);
        let mut src = archetype(&reg, &[a]);
        let mut dst = archetype(&reg, &[a, b]);

        let s = src.allocate_slot(&mut pool, EntityId::new(0, 0)).unwrap();
        write_u32(&mut src, 0, s, 7);
        let d = dst.allocate_slot(&mut pool, EntityId::new(0, 0)).unwrap();
        src.copy_columns_to(s, 0..1, &mut dst, d, 0);
        assert_eq!(read_u32(&dst, 0, d), 7);
    }

    #[test]
    fn release_storage_returns_blocks() {
        let (reg, a, _) = registry();
        let mut pool = BlockPool::new(BLOCK, None);
        let mut arch = archetype(&reg, &[a]);
        for i in 0..200 {
            arch.allocate_slot(&mut pool, EntityId::new(i, 0)).unwrap();
        }
        arch.release_storage(&mut pool);
        assert!(arch.is_empty());
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().pooled, 4);
    }
}
