//! The [`World`] is the top-level container of the store. It owns the
//! component registry, the block pool, every archetype and the handle table.
//!
//! Archetypes live in a slot list. Released archetypes leave a free slot
//! behind that is threaded onto a free list and recycled by the next new
//! type set, so [`ArchetypeId`]s stay small and dense.

use std::collections::HashMap;
use std::fmt;

use bytemuck::Pod;
use tracing::{debug, trace};

use crate::archetype::{item_layouts, Archetype, ArchetypeId, TypeSet};
use crate::block::{BlockPool, PoolStats};
use crate::component::{ComponentHooks, ComponentInfo, ComponentRegistry, ComponentTypeId};
use crate::config::StoreConfig;
use crate::entity::{EntityId, EntityLocation, HandleTable};
use crate::layout::ChunkLayout;
use crate::system::{match_columns, ChunkView, System, SystemStats};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Archetype slots
// ---------------------------------------------------------------------------

enum ArchetypeSlot {
    Live(Archetype),
    Free { next: Option<ArchetypeId> },
}

fn live(slots: &[ArchetypeSlot], id: ArchetypeId) -> &Archetype {
    match &slots[id.index()] {
        ArchetypeSlot::Live(archetype) => archetype,
        ArchetypeSlot::Free { .. } => unreachable!("{id:?} is not a live archetype"),
    }
}

fn live_mut(slots: &mut [ArchetypeSlot], id: ArchetypeId) -> &mut Archetype {
    match &mut slots[id.index()] {
        ArchetypeSlot::Live(archetype) => archetype,
        ArchetypeSlot::Free { .. } => unreachable!("{id:?} is not a live archetype"),
    }
}

/// Two distinct live archetypes, both mutable.
fn live_pair(
    slots: &mut [ArchetypeSlot],
    a: ArchetypeId,
    b: ArchetypeId,
) -> (&mut Archetype, &mut Archetype) {
    debug_assert_ne!(a, b);
    let (first, second) = if a.index() < b.index() {
        let (head, tail) = slots.split_at_mut(b.index());
        (&mut head[a.index()], &mut tail[0])
    } else {
        let (head, tail) = slots.split_at_mut(a.index());
        (&mut tail[0], &mut head[b.index()])
    };
    match (first, second) {
        (ArchetypeSlot::Live(x), ArchetypeSlot::Live(y)) => (x, y),
        _ => unreachable!("{a:?} or {b:?} is not a live archetype"),
    }
}

#[derive(Debug, Clone, Copy)]
enum Migration {
    /// A type was inserted at this column of the target.
    Attach(usize),
    /// The type at this column of the source was removed.
    Detach(usize),
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The archetype store.
pub struct World {
    config: StoreConfig,
    registry: ComponentRegistry,
    pool: BlockPool,
    archetypes: Vec<ArchetypeSlot>,
    free_archetype: Option<ArchetypeId>,
    /// Exact type set -> live archetype.
    archetype_index: HashMap<TypeSet, ArchetypeId>,
    handles: HandleTable,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.handles.len())
            .field("archetype_count", &self.archetype_index.len())
            .field("pool", &self.pool.stats())
            .finish()
    }
}

impl World {
    /// Create an empty world with the default configuration.
    pub fn new() -> Self {
        Self::build(StoreConfig::default())
    }

    /// Create an empty world, validating `config` and preallocating its
    /// initial blocks.
    pub fn with_config(config: StoreConfig) -> Result<Self, EcsError> {
        config.validate()?;
        let mut world = Self::build(config);
        world.pool.preallocate(world.config.initial_blocks)?;
        Ok(world)
    }

    fn build(config: StoreConfig) -> Self {
        Self {
            pool: BlockPool::new(config.block_size, config.max_blocks),
            config,
            registry: ComponentRegistry::new(),
            archetypes: Vec::new(),
            free_archetype: None,
            archetype_index: HashMap::new(),
            handles: HandleTable::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Read-only access to the component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    // -- registration -------------------------------------------------------

    /// Register an opaque component type.
    pub fn register_type(
        &mut self,
        name: &str,
        size: usize,
        align: usize,
        hooks: ComponentHooks,
    ) -> Result<ComponentTypeId, EcsError> {
        self.check_fits(size)?;
        self.registry.register_raw(name, size, align, hooks)
    }

    /// Register a plain-old-data Rust type, enabling the typed accessors.
    pub fn register<T: Pod + Default>(&mut self, name: &str) -> Result<ComponentTypeId, EcsError> {
        self.check_fits(std::mem::size_of::<T>())?;
        self.registry.register::<T>(name)
    }

    fn check_fits(&self, size: usize) -> Result<(), EcsError> {
        let block_size = self.pool.block_size();
        if size > block_size {
            return Err(EcsError::ComponentTooLarge {
                entity_size: size,
                block_size,
            });
        }
        Ok(())
    }

    pub fn component_type_id<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.registry.lookup::<T>()
    }

    // -- archetype management -----------------------------------------------

    /// Find the live archetype for `types` or create it.
    ///
    /// `derived_from` names an archetype whose type list differs from
    /// `types` by one type at the given column; its layout seeds the new one.
    fn resolve_archetype(
        &mut self,
        types: TypeSet,
        derived_from: Option<(ArchetypeId, usize)>,
    ) -> Result<ArchetypeId, EcsError> {
        if let Some(&id) = self.archetype_index.get(&types) {
            return Ok(id);
        }

        let infos = types
            .as_slice()
            .iter()
            .map(|&t| self.registry.info(t).cloned())
            .collect::<Result<Vec<ComponentInfo>, EcsError>>()?;
        let items = item_layouts(&infos);
        let block_size = self.pool.block_size();
        let layout = match derived_from {
            Some((source, changed)) => {
                live(&self.archetypes, source)
                    .layout()
                    .relayout(&items, changed, block_size)?
            }
            None => ChunkLayout::compute(&items, block_size)?,
        };

        let id = match self.free_archetype {
            Some(id) => {
                if let ArchetypeSlot::Free { next } = self.archetypes[id.index()] {
                    self.free_archetype = next;
                }
                id
            }
            None => {
                self.archetypes.push(ArchetypeSlot::Free { next: None });
                ArchetypeId((self.archetypes.len() - 1) as u32)
            }
        };
        debug!(
            archetype = ?id,
            types = ?types.as_slice(),
            capacity = ?layout.capacity(),
            "created archetype"
        );
        self.archetype_index.insert(types.clone(), id);
        self.archetypes[id.index()] = ArchetypeSlot::Live(Archetype::new(id, types, infos, layout));
        Ok(id)
    }

    /// Return an archetype's blocks to the pool and recycle its slot.
    fn release_archetype(&mut self, id: ArchetypeId) {
        if !matches!(self.archetypes[id.index()], ArchetypeSlot::Live(_)) {
            return;
        }
        let slot = std::mem::replace(
            &mut self.archetypes[id.index()],
            ArchetypeSlot::Free {
                next: self.free_archetype,
            },
        );
        if let ArchetypeSlot::Live(mut archetype) = slot {
            archetype.release_storage(&mut self.pool);
            self.archetype_index.remove(archetype.types());
        }
        self.free_archetype = Some(id);
        debug!(archetype = ?id, "released archetype");
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Create an entity carrying `types` and run their construct hooks.
    pub fn allocate_entity(&mut self, types: &[ComponentTypeId]) -> Result<EntityId, EcsError> {
        let types = TypeSet::new(types.to_vec())?;
        let archetype = self.resolve_archetype(types, None)?;
        let entity = self.handles.reserve();

        let target = live_mut(&mut self.archetypes, archetype);
        let slot = match target.allocate_slot(&mut self.pool, entity) {
            Ok(slot) => slot,
            Err(err) => {
                let emptied = target.is_empty();
                self.handles.release(entity);
                if emptied {
                    self.release_archetype(archetype);
                }
                return Err(err);
            }
        };
        target.construct_all(slot);
        self.handles.place(entity, EntityLocation { archetype, slot });
        trace!(%entity, ?archetype, slot, "allocated entity");
        Ok(entity)
    }

    /// Run destruct hooks, free the entity's slot and invalidate its handle.
    pub fn deallocate_entity(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let loc = self.locate(entity)?;
        let source = live_mut(&mut self.archetypes, loc.archetype);
        source.destruct_all(loc.slot);
        let moved = source.deallocate_slot(&mut self.pool, loc.slot);
        let emptied = source.is_empty();

        self.handles.release(entity);
        if let Some(moved) = moved {
            self.handles.relocate(moved, loc.slot);
        }
        if emptied {
            self.release_archetype(loc.archetype);
        }
        trace!(%entity, archetype = ?loc.archetype, "deallocated entity");
        Ok(())
    }

    /// Add a component type to an entity, migrating it to the matching
    /// archetype. Attaching a type the entity already has does nothing.
    pub fn attach(
        &mut self,
        entity: EntityId,
        type_id: ComponentTypeId,
    ) -> Result<EntityId, EcsError> {
        self.registry.info(type_id)?;
        let loc = self.locate(entity)?;
        let source = live(&self.archetypes, loc.archetype);
        let Some(index) = source.types().insertion_index(type_id) else {
            return Ok(entity);
        };
        let types = source.types().with_inserted(index, type_id)?;
        let target = self.resolve_archetype(types, Some((loc.archetype, index)))?;
        self.migrate(entity, loc, target, Migration::Attach(index))?;
        Ok(entity)
    }

    /// Remove a component type from an entity, migrating it to the matching
    /// archetype. Detaching a type the entity lacks does nothing.
    pub fn detach(
        &mut self,
        entity: EntityId,
        type_id: ComponentTypeId,
    ) -> Result<EntityId, EcsError> {
        self.registry.info(type_id)?;
        let loc = self.locate(entity)?;
        let source = live(&self.archetypes, loc.archetype);
        let Some(index) = source.types().removal_index(type_id) else {
            return Ok(entity);
        };
        let types = source.types().with_removed(index);
        let target = self.resolve_archetype(types, Some((loc.archetype, index)))?;
        self.migrate(entity, loc, target, Migration::Detach(index))?;
        Ok(entity)
    }

    fn migrate(
        &mut self,
        entity: EntityId,
        from: EntityLocation,
        to: ArchetypeId,
        change: Migration,
    ) -> Result<(), EcsError> {
        let target = live_mut(&mut self.archetypes, to);
        let slot = match target.allocate_slot(&mut self.pool, entity) {
            Ok(slot) => slot,
            Err(err) => {
                if target.is_empty() {
                    self.release_archetype(to);
                }
                return Err(err);
            }
        };

        let (source, target) = live_pair(&mut self.archetypes, from.archetype, to);
        let width = source.types().len();
        match change {
            Migration::Attach(index) => {
                source.copy_columns_to(from.slot, 0..index, target, slot, 0);
                source.copy_columns_to(from.slot, index..width, target, slot, index + 1);
                target.construct(index, slot);
            }
            Migration::Detach(index) => {
                source.destruct(index, from.slot);
                source.copy_columns_to(from.slot, 0..index, target, slot, 0);
                source.copy_columns_to(from.slot, index + 1..width, target, slot, index);
            }
        }
        let moved = source.deallocate_slot(&mut self.pool, from.slot);
        let emptied = source.is_empty();

        self.handles.place(entity, EntityLocation { archetype: to, slot });
        if let Some(moved) = moved {
            self.handles.relocate(moved, from.slot);
        }
        if emptied {
            self.release_archetype(from.archetype);
        }
        trace!(%entity, from = ?from.archetype, ?to, ?change, "migrated entity");
        Ok(())
    }

    /// Deallocate every entity (running destruct hooks) and release every
    /// archetype. Registered types and pooled blocks are kept.
    pub fn clear(&mut self) {
        self.run_all_destructors();
        for slot in self.archetypes.drain(..) {
            if let ArchetypeSlot::Live(mut archetype) = slot {
                archetype.release_storage(&mut self.pool);
            }
        }
        self.free_archetype = None;
        self.archetype_index.clear();
        self.handles.clear();
    }

    fn run_all_destructors(&mut self) {
        for slot in &mut self.archetypes {
            let ArchetypeSlot::Live(archetype) = slot else {
                continue;
            };
            if archetype.infos().iter().all(|i| i.hooks.destruct.is_none()) {
                continue;
            }
            for s in 0..archetype.len() {
                archetype.destruct_all(s);
            }
        }
    }

    // -- component access ---------------------------------------------------

    /// Archetype column holding `type_id` for `entity`, if any.
    fn column_of(
        &self,
        entity: EntityId,
        type_id: ComponentTypeId,
    ) -> Result<(EntityLocation, Option<usize>), EcsError> {
        self.registry.info(type_id)?;
        let loc = self.locate(entity)?;
        let column = live(&self.archetypes, loc.archetype)
            .types()
            .position(type_id);
        Ok((loc, column))
    }

    /// The entity's bytes for `type_id`.
    ///
    /// `None` if the entity lacks the type or its archetype has no storage
    /// (every type zero-sized).
    pub fn component_memory(
        &self,
        entity: EntityId,
        type_id: ComponentTypeId,
    ) -> Result<Option<&[u8]>, EcsError> {
        let (loc, column) = self.column_of(entity, type_id)?;
        let archetype = live(&self.archetypes, loc.archetype);
        Ok(column.and_then(|c| archetype.slot_bytes(c, loc.slot)))
    }

    pub fn component_memory_mut(
        &mut self,
        entity: EntityId,
        type_id: ComponentTypeId,
    ) -> Result<Option<&mut [u8]>, EcsError> {
        let (loc, column) = self.column_of(entity, type_id)?;
        let archetype = live_mut(&mut self.archetypes, loc.archetype);
        Ok(column.and_then(|c| archetype.slot_bytes_mut(c, loc.slot)))
    }

    /// Whether the entity carries `type_id`, including zero-sized types.
    pub fn has(&self, entity: EntityId, type_id: ComponentTypeId) -> Result<bool, EcsError> {
        Ok(self.column_of(entity, type_id)?.1.is_some())
    }

    /// Typed read of `T`. `None` if the entity lacks `T` or `T` is
    /// zero-sized.
    pub fn get<T: Pod>(&self, entity: EntityId) -> Result<Option<&T>, EcsError> {
        let id = self.registry.expect_type::<T>()?;
        let (loc, column) = self.column_of(entity, id)?;
        let Some(column) = column else {
            return Ok(None);
        };
        match live(&self.archetypes, loc.archetype).slot_bytes(column, loc.slot) {
            Some(bytes) => cast_ref::<T>(column, bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_mut<T: Pod>(&mut self, entity: EntityId) -> Result<Option<&mut T>, EcsError> {
        let id = self.registry.expect_type::<T>()?;
        let (loc, column) = self.column_of(entity, id)?;
        let Some(column) = column else {
            return Ok(None);
        };
        match live_mut(&mut self.archetypes, loc.archetype).slot_bytes_mut(column, loc.slot) {
            Some(bytes) => cast_mut::<T>(column, bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Overwrite a component the entity already has. Returns `false` if the
    /// entity lacks it.
    pub fn set<T: Pod>(&mut self, entity: EntityId, value: T) -> Result<bool, EcsError> {
        match self.get_mut::<T>(entity)? {
            Some(slot) => {
                *slot = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Attach `T` if missing, then write `value`.
    pub fn insert<T: Pod>(&mut self, entity: EntityId, value: T) -> Result<EntityId, EcsError> {
        let id = self.registry.expect_type::<T>()?;
        let entity = self.attach(entity, id)?;
        self.set(entity, value)?;
        Ok(entity)
    }

    /// Detach `T`.
    pub fn remove<T: Pod>(&mut self, entity: EntityId) -> Result<EntityId, EcsError> {
        let id = self.registry.expect_type::<T>()?;
        self.detach(entity, id)
    }

    // -- introspection ------------------------------------------------------

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.handles.is_alive(entity)
    }

    /// Current archetype and slot of a live entity.
    pub fn locate(&self, entity: EntityId) -> Result<EntityLocation, EcsError> {
        self.handles
            .locate(entity)
            .ok_or(EcsError::StaleEntity { entity })
    }

    /// Sorted component types of a live entity.
    pub fn types_of(&self, entity: EntityId) -> Result<&[ComponentTypeId], EcsError> {
        let loc = self.locate(entity)?;
        Ok(live(&self.archetypes, loc.archetype).component_types())
    }

    pub fn entity_count(&self) -> usize {
        self.handles.len()
    }

    /// Number of live archetypes.
    pub fn archetype_count(&self) -> usize {
        self.archetype_index.len()
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        match self.archetypes.get(id.index()) {
            Some(ArchetypeSlot::Live(archetype)) => Some(archetype),
            _ => None,
        }
    }

    pub fn archetypes(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter().filter_map(|slot| match slot {
            ArchetypeSlot::Live(archetype) => Some(archetype),
            ArchetypeSlot::Free { .. } => None,
        })
    }

    /// Layout of the live archetype with exactly `types`, in any order.
    pub fn archetype_layout(&self, types: &[ComponentTypeId]) -> Option<&ChunkLayout> {
        let types = TypeSet::new(types.to_vec()).ok()?;
        let id = self.archetype_index.get(&types)?;
        self.archetype(*id).map(Archetype::layout)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Release pooled blocks back to the allocator.
    pub fn flush_pool(&mut self) -> usize {
        self.pool.flush()
    }

    // -- systems ------------------------------------------------------------

    /// Build a system over `types`. The types are validated and sorted; the
    /// callback sees columns in that sorted order.
    pub fn make_system<'s, F>(
        &self,
        name: &str,
        types: &[ComponentTypeId],
        callback: F,
    ) -> Result<System<'s>, EcsError>
    where
        F: FnMut(&mut ChunkView<'_>) -> Result<(), EcsError> + 's,
    {
        for &t in types {
            self.registry.info(t)?;
        }
        let types = TypeSet::new(types.to_vec())?;
        Ok(System::new(name, types, Box::new(callback)))
    }

    /// Run `system` over every chunk of every archetype carrying all of its
    /// types. The first callback error aborts the run.
    pub fn execute_system(&mut self, system: &mut System<'_>) -> Result<SystemStats, EcsError> {
        let mut stats = SystemStats::default();
        let (required, callback) = system.parts_mut();
        for slot in &mut self.archetypes {
            let ArchetypeSlot::Live(archetype) = slot else {
                continue;
            };
            let Some(columns) = match_columns(archetype.component_types(), required) else {
                continue;
            };
            stats.archetypes_matched += 1;
            let walk = archetype.for_each_chunk(&columns, &mut *callback)?;
            stats.blocks_visited += walk.blocks;
            stats.entities_visited += walk.entities;
        }
        trace!(system = system.name(), ?stats, "executed system");
        Ok(stats)
    }

    /// Execute `systems` in order.
    pub fn run_systems(
        &mut self,
        systems: &mut [System<'_>],
    ) -> Result<Vec<SystemStats>, EcsError> {
        systems
            .iter_mut()
            .map(|system| self.execute_system(system))
            .collect()
    }

    // -- verification -------------------------------------------------------

    /// Check every structural invariant of the store.
    pub fn check_invariants(&self) -> Result<(), EcsError> {
        let violated = |detail: String| EcsError::InvariantViolated { detail };
        let block_size = self.pool.block_size();
        let mut live_count = 0;
        let mut entities = 0;
        let mut blocks = 0;

        for (index, slot) in self.archetypes.iter().enumerate() {
            let ArchetypeSlot::Live(archetype) = slot else {
                continue;
            };
            let id = archetype.id();
            live_count += 1;
            if id.index() != index {
                return Err(violated(format!("{id:?} stored at index {index}")));
            }
            archetype.verify(block_size).map_err(violated)?;
            if archetype.is_empty() {
                return Err(violated(format!("live {id:?} is empty")));
            }
            if self.archetype_index.get(archetype.types()) != Some(&id) {
                return Err(violated(format!("{id:?} is missing from the type index")));
            }
            for (s, &owner) in archetype.entities().iter().enumerate() {
                let expected = EntityLocation {
                    archetype: id,
                    slot: s,
                };
                if self.handles.locate(owner) != Some(expected) {
                    return Err(violated(format!(
                        "{owner:?} in {id:?} slot {s} has a stale handle"
                    )));
                }
            }
            entities += archetype.len();
            blocks += archetype.block_count();
        }

        if live_count != self.archetype_index.len() {
            return Err(violated(format!(
                "{live_count} live archetypes but {} indexed type sets",
                self.archetype_index.len()
            )));
        }
        if entities != self.handles.len() {
            return Err(violated(format!(
                "{entities} stored entities but {} live handles",
                self.handles.len()
            )));
        }

        let mut free = 0;
        let mut cursor = self.free_archetype;
        while let Some(id) = cursor {
            match self.archetypes.get(id.index()) {
                Some(ArchetypeSlot::Free { next }) if free < self.archetypes.len() => {
                    free += 1;
                    cursor = *next;
                }
                _ => return Err(violated(format!("broken archetype free list at {id:?}"))),
            }
        }
        if free + live_count != self.archetypes.len() {
            return Err(violated(format!(
                "{free} free and {live_count} live slots out of {}",
                self.archetypes.len()
            )));
        }

        let pool = self.pool.stats();
        if pool.in_use != blocks {
            return Err(violated(format!(
                "pool reports {} blocks in use, archetypes own {blocks}",
                pool.in_use
            )));
        }
        Ok(())
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        self.run_all_destructors();
    }
}

fn cast_ref<T: Pod>(column: usize, bytes: &[u8]) -> Result<&T, EcsError> {
    bytemuck::try_from_bytes(bytes).map_err(|e| EcsError::ColumnCast {
        column,
        requested: std::any::type_name::<T>(),
        reason: format!("{e:?}"),
    })
}

fn cast_mut<T: Pod>(column: usize, bytes: &mut [u8]) -> Result<&mut T, EcsError> {
    bytemuck::try_from_bytes_mut(bytes).map_err(|e| EcsError::ColumnCast {
        column,
        requested: std::any::type_name::<T>(),
        reason: format!("{e:?}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytemuck_derive::{Pod, Zeroable};

    #[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Health(u32);

    impl Default for Health {
        fn default() -> Self {
            Health(100)
        }
    }

    fn setup_world() -> (World, ComponentTypeId, ComponentTypeId, ComponentTypeId) {
        let mut world = World::new();
        let pos = world.register::<Pos>("position").unwrap();
        let vel = world.register::<Vel>("velocity").unwrap();
        let health = world.register::<Health>("health").unwrap();
        (world, pos, vel, health)
    }

    fn read_u32(world: &World, e: EntityId, t: ComponentTypeId) -> Option<u32> {
        world
            .component_memory(e, t)
            .unwrap()
            .map(|b| u32::from_ne_bytes(b.try_into().unwrap()))
    }

    #[test]
    fn allocate_runs_construct_hooks() {
        let (mut world, pos, _, health) = setup_world();
        let e = world.allocate_entity(&[health, pos]).unwrap();
        assert_eq!(world.get::<Health>(e).unwrap(), Some(&Health(100)));
        assert_eq!(world.get::<Pos>(e).unwrap(), Some(&Pos::default()));
        assert_eq!(world.types_of(e).unwrap(), &[pos, health]);
        world.check_invariants().unwrap();
    }

    #[test]
    fn identical_type_sets_share_an_archetype() {
        let (mut world, pos, vel, _) = setup_world();
        let a = world.allocate_entity(&[pos, vel]).unwrap();
        let b = world.allocate_entity(&[vel, pos, vel]).unwrap();
        assert_eq!(world.archetype_count(), 1);
        assert_eq!(
            world.locate(a).unwrap().archetype,
            world.locate(b).unwrap().archetype
        );
    }

    #[test]
    fn attach_and_detach_scenario() {
        let mut world = World::new();
        let a = world.register_type("A", 4, 4, ComponentHooks::NONE).unwrap();
        let b = world.register_type("B", 8, 8, ComponentHooks::NONE).unwrap();

        let e = world.allocate_entity(&[]).unwrap();
        let e = world.attach(e, a).unwrap();
        world
            .component_memory_mut(e, a)
            .unwrap()
            .unwrap()
            .copy_from_slice(&7u32.to_ne_bytes());

        let e = world.attach(e, b).unwrap();
        assert_eq!(read_u32(&world, e, a), Some(7));
        world
            .component_memory_mut(e, b)
            .unwrap()
            .unwrap()
            .copy_from_slice(&42u64.to_ne_bytes());

        let e = world.detach(e, a).unwrap();
        assert_eq!(world.component_memory(e, a).unwrap(), None);
        let b_bytes = world.component_memory(e, b).unwrap().unwrap();
        assert_eq!(u64::from_ne_bytes(b_bytes.try_into().unwrap()), 42);

        let only_b = world.locate(e).unwrap().archetype;
        let e = world.detach(e, b).unwrap();
        assert!(world.archetype(only_b).is_none());
        assert!(world.types_of(e).unwrap().is_empty());
        assert_eq!(world.archetype_count(), 1);
        assert_eq!(world.pool_stats().in_use, 0);
        world.check_invariants().unwrap();
    }

    #[test]
    fn attach_present_and_detach_absent_are_no_ops() {
        let (mut world, pos, vel, _) = setup_world();
        let e = world.allocate_entity(&[pos]).unwrap();
        world.set(e, Pos { x: 1.0, y: 2.0 }).unwrap();
        let before = world.locate(e).unwrap();

        assert_eq!(world.attach(e, pos).unwrap(), e);
        assert_eq!(world.detach(e, vel).unwrap(), e);
        assert_eq!(world.locate(e).unwrap(), before);
        assert_eq!(world.get::<Pos>(e).unwrap(), Some(&Pos { x: 1.0, y: 2.0 }));
    }

    #[test]
    fn deallocate_repairs_moved_handle() {
        let (mut world, pos, _, _) = setup_world();
        let ids: Vec<EntityId> = (0..3)
            .map(|i| {
                let e = world.allocate_entity(&[pos]).unwrap();
                world.set(e, Pos { x: i as f32, y: 0.0 }).unwrap();
                e
            })
            .collect();

        world.deallocate_entity(ids[0]).unwrap();
        assert!(!world.is_alive(ids[0]));
        assert_eq!(world.locate(ids[2]).unwrap().slot, 0);
        assert_eq!(world.get::<Pos>(ids[2]).unwrap().unwrap().x, 2.0);
        assert_eq!(world.get::<Pos>(ids[1]).unwrap().unwrap().x, 1.0);
        world.check_invariants().unwrap();
    }

    #[test]
    fn stale_handles_are_rejected() {
        let (mut world, pos, _, _) = setup_world();
        let e = world.allocate_entity(&[pos]).unwrap();
        world.deallocate_entity(e).unwrap();
        let reused = world.allocate_entity(&[pos]).unwrap();
        assert_eq!(reused.index(), e.index());

        assert!(matches!(
            world.deallocate_entity(e),
            Err(EcsError::StaleEntity { .. })
        ));
        assert!(matches!(world.attach(e, pos), Err(EcsError::StaleEntity { .. })));
        assert!(matches!(world.get::<Pos>(e), Err(EcsError::StaleEntity { .. })));
        assert!(world.is_alive(reused));
    }

    #[test]
    fn typed_insert_and_remove() {
        let (mut world, pos, vel, _) = setup_world();
        let e = world.allocate_entity(&[pos]).unwrap();
        world.insert(e, Vel { dx: 3.0, dy: 4.0 }).unwrap();
        assert_eq!(world.types_of(e).unwrap(), &[pos, vel]);
        assert_eq!(world.get::<Vel>(e).unwrap(), Some(&Vel { dx: 3.0, dy: 4.0 }));

        // Inserting again overwrites in place.
        world.insert(e, Vel { dx: 5.0, dy: 6.0 }).unwrap();
        assert_eq!(world.archetype_count(), 1);
        assert_eq!(world.get::<Vel>(e).unwrap().unwrap().dx, 5.0);

        world.remove::<Vel>(e).unwrap();
        assert_eq!(world.get::<Vel>(e).unwrap(), None);
        assert!(!world.set(e, Vel::default()).unwrap());
    }

    #[test]
    fn unregistered_types_are_errors() {
        let mut world = World::new();
        let e = world.allocate_entity(&[]).unwrap();
        assert!(matches!(
            world.get::<Pos>(e),
            Err(EcsError::UnregisteredType { .. })
        ));
        assert!(matches!(
            world.allocate_entity(&[ComponentTypeId(9)]),
            Err(EcsError::UnknownComponent { .. })
        ));
        assert!(matches!(
            world.attach(e, ComponentTypeId(9)),
            Err(EcsError::UnknownComponent { .. })
        ));
    }

    #[test]
    fn attach_beyond_type_limit_is_an_error() {
        let mut world = World::new();
        let ids: Vec<ComponentTypeId> = (0..16)
            .map(|i| {
                world
                    .register_type(&format!("t{i}"), 4, 4, ComponentHooks::NONE)
                    .unwrap()
            })
            .collect();
        let e = world.allocate_entity(&ids[..15]).unwrap();
        assert!(matches!(
            world.attach(e, ids[15]),
            Err(EcsError::TooManyTypes { .. })
        ));
        assert_eq!(world.types_of(e).unwrap().len(), 15);
        world.check_invariants().unwrap();
    }

    #[test]
    fn tag_archetypes_allocate_no_blocks() {
        let mut world = World::new();
        let tag = world.register_type("tag", 0, 1, ComponentHooks::NONE).unwrap();
        for _ in 0..500 {
            world.allocate_entity(&[tag]).unwrap();
        }
        assert_eq!(world.pool_stats().allocated, 0);
        assert_eq!(world.archetype_layout(&[tag]).unwrap().entities_per_chunk(), None);
        let e = world.allocate_entity(&[tag]).unwrap();
        assert!(world.has(e, tag).unwrap());
        assert_eq!(world.component_memory(e, tag).unwrap(), None);
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Marker([u8; 0]);

    #[test]
    fn zero_sized_components_have_no_memory_in_sized_archetypes() {
        let (mut world, pos, _, _) = setup_world();
        let marker = world.register::<Marker>("marker").unwrap();
        let e = world.allocate_entity(&[pos, marker]).unwrap();
        let tagged = world.allocate_entity(&[marker]).unwrap();

        for entity in [e, tagged] {
            assert!(world.has(entity, marker).unwrap());
            assert_eq!(world.component_memory(entity, marker).unwrap(), None);
            assert!(world.component_memory_mut(entity, marker).unwrap().is_none());
            assert_eq!(world.get::<Marker>(entity).unwrap(), None);
        }
        assert_eq!(world.get::<Pos>(e).unwrap(), Some(&Pos::default()));

        // Migrations across the zero-sized column keep the sized bytes.
        world.set(e, Pos { x: 3.0, y: 4.0 }).unwrap();
        world.detach(e, marker).unwrap();
        world.attach(e, marker).unwrap();
        assert_eq!(world.get::<Pos>(e).unwrap(), Some(&Pos { x: 3.0, y: 4.0 }));
        world.check_invariants().unwrap();
    }

    #[test]
    fn misaligned_block_size_never_reaches_the_pool() {
        for block_size in [0, 100, 16_000] {
            let result = World::with_config(StoreConfig {
                block_size,
                ..StoreConfig::default()
            });
            assert!(matches!(result, Err(EcsError::InvalidConfig { .. })));
        }
    }

    #[test]
    fn accessors_expose_config_and_registry() {
        let config = StoreConfig {
            block_size: 4096,
            initial_blocks: 2,
            ..StoreConfig::default()
        };
        let mut world = World::with_config(config.clone()).unwrap();
        assert_eq!(world.config(), &config);
        assert_eq!(world.pool_stats().pooled, 2);

        let pos = world.register::<Pos>("position").unwrap();
        assert_eq!(world.component_type_id::<Pos>(), Some(pos));
        assert_eq!(world.component_type_id::<Vel>(), None);
        assert_eq!(world.registry().lookup_by_name("position"), Some(pos));
        assert_eq!(world.registry().info(pos).unwrap().size, 8);
        assert_eq!(world.registry().len(), 1);
    }

    #[test]
    fn large_single_type_layout() {
        let mut world = World::new();
        let big = world.register_type("big", 1024, 8, ComponentHooks::NONE).unwrap();
        world.allocate_entity(&[big]).unwrap();
        let layout = world.archetype_layout(&[big]).unwrap();
        assert_eq!(layout.entities_per_chunk(), Some(16));
    }

    #[test]
    fn oversized_type_is_rejected() {
        let mut world = World::with_config(StoreConfig {
            block_size: 128,
            ..StoreConfig::default()
        })
        .unwrap();
        assert!(matches!(
            world.register_type("huge", 256, 8, ComponentHooks::NONE),
            Err(EcsError::ComponentTooLarge { .. })
        ));

        // Each type fits alone but not together.
        let a = world.register_type("a", 128, 8, ComponentHooks::NONE).unwrap();
        let b = world.register_type("b", 8, 8, ComponentHooks::NONE).unwrap();
        assert!(matches!(
            world.allocate_entity(&[a, b]),
            Err(EcsError::ComponentTooLarge { .. })
        ));
        assert_eq!(world.archetype_count(), 0);
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn block_limit_failure_leaves_no_partial_state() {
        let mut world = World::with_config(StoreConfig {
            block_size: 64,
            initial_blocks: 0,
            max_blocks: Some(1),
        })
        .unwrap();
        let a = world.register_type("a", 32, 8, ComponentHooks::NONE).unwrap();
        let c = world.register_type("c", 32, 8, ComponentHooks::NONE).unwrap();

        let first = world.allocate_entity(&[a]).unwrap();
        world
            .component_memory_mut(first, a)
            .unwrap()
            .unwrap()
            .fill(7);

        assert!(matches!(
            world.allocate_entity(&[c]),
            Err(EcsError::BlockAllocation { .. })
        ));
        assert_eq!(world.entity_count(), 1);
        assert_eq!(world.archetype_count(), 1);

        // Migration fails before anything is copied.
        assert!(matches!(
            world.attach(first, c),
            Err(EcsError::BlockAllocation { .. })
        ));
        assert_eq!(world.types_of(first).unwrap(), &[a]);
        assert_eq!(world.component_memory(first, a).unwrap(), Some(&[7u8; 32][..]));
        assert_eq!(world.archetype_count(), 1);
        world.check_invariants().unwrap();

        // The existing block still has room for a second entity.
        world.allocate_entity(&[a]).unwrap();
        world.check_invariants().unwrap();
    }

    static DESTRUCTED: AtomicUsize = AtomicUsize::new(0);

    fn count_destruct(_: &mut [u8]) {
        DESTRUCTED.fetch_add(1, Ordering::SeqCst);
    }

    fn fill_construct(bytes: &mut [u8]) {
        bytes.fill(0x5A);
    }

    #[test]
    fn hooks_run_on_lifecycle_edges_only() {
        let mut world = World::new();
        let plain = world.register_type("plain", 4, 4, ComponentHooks::NONE).unwrap();
        let hooked = world
            .register_type(
                "hooked",
                4,
                4,
                ComponentHooks {
                    construct: Some(fill_construct),
                    destruct: Some(count_destruct),
                },
            )
            .unwrap();

        let e = world.allocate_entity(&[plain]).unwrap();
        let e = world.attach(e, hooked).unwrap();
        assert_eq!(read_u32(&world, e, hooked), Some(0x5A5A_5A5A));

        let destructed = || DESTRUCTED.load(Ordering::SeqCst);
        let before = destructed();
        // Migration that keeps the hooked type runs no hooks.
        let e = world.detach(e, plain).unwrap();
        assert_eq!(destructed(), before);
        assert_eq!(read_u32(&world, e, hooked), Some(0x5A5A_5A5A));

        world.deallocate_entity(e).unwrap();
        assert_eq!(destructed(), before + 1);

        let e = world.allocate_entity(&[plain, hooked]).unwrap();
        world.detach(e, hooked).unwrap();
        assert_eq!(destructed(), before + 2);
        world.deallocate_entity(e).unwrap();
        assert_eq!(destructed(), before + 2);

        for _ in 0..3 {
            world.allocate_entity(&[plain, hooked]).unwrap();
        }
        world.allocate_entity(&[hooked]).unwrap();
        world.allocate_entity(&[plain]).unwrap();
        world.clear();
        assert_eq!(destructed(), before + 6);
        assert_eq!(world.entity_count(), 0);

        world.allocate_entity(&[hooked]).unwrap();
        world.allocate_entity(&[plain, hooked]).unwrap();
        drop(world);
        assert_eq!(destructed(), before + 8);
    }

    #[test]
    fn archetype_slots_are_recycled() {
        let (mut world, pos, vel, health) = setup_world();
        let e = world.allocate_entity(&[pos]).unwrap();
        let first = world.locate(e).unwrap().archetype;
        world.deallocate_entity(e).unwrap();
        assert_eq!(world.archetype_count(), 0);

        let e = world.allocate_entity(&[vel, health]).unwrap();
        assert_eq!(world.locate(e).unwrap().archetype, first);
        world.check_invariants().unwrap();
    }

    #[test]
    fn flush_pool_releases_free_blocks() {
        let (mut world, pos, _, _) = setup_world();
        let ids: Vec<EntityId> = (0..5000)
            .map(|_| world.allocate_entity(&[pos]).unwrap())
            .collect();
        let peak = world.pool_stats().allocated;
        assert!(peak >= 2);
        for e in ids {
            world.deallocate_entity(e).unwrap();
        }
        assert_eq!(world.pool_stats().pooled, peak);
        assert_eq!(world.flush_pool(), peak);
        assert_eq!(world.pool_stats(), PoolStats::default());
    }

    #[test]
    fn clear_invalidates_all_handles() {
        let (mut world, pos, vel, _) = setup_world();
        let a = world.allocate_entity(&[pos]).unwrap();
        let b = world.allocate_entity(&[pos, vel]).unwrap();
        world.clear();
        assert!(!world.is_alive(a));
        assert!(!world.is_alive(b));
        assert_eq!(world.archetype_count(), 0);
        assert_eq!(world.pool_stats().in_use, 0);
        world.check_invariants().unwrap();
        world.allocate_entity(&[vel]).unwrap();
        world.check_invariants().unwrap();
    }
}
