//! Chunk ECS -- archetype-based entity storage in fixed-size memory blocks.
//!
//! Entities that carry exactly the same set of component types share an
//! archetype. Each archetype stores its components in equally sized blocks
//! drawn from a shared pool, one contiguous sub-array per type
//! (structure-of-arrays), so systems can walk a block's columns linearly.
//! Adding or removing a component migrates the entity to another archetype;
//! generational [`EntityId`](entity::EntityId) handles stay valid across
//! every move.
//!
//! Component bytes are opaque to the store. Types registered through
//! [`World::register`](world::World::register) additionally get checked,
//! typed access via `bytemuck`.
//!
//! # Quick Start
//!
//! ```
//! use chunk_ecs::prelude::*;
//! use bytemuck_derive::{Pod, Zeroable};
//!
//! #[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
//! #[repr(C)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
//! #[repr(C)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut world = World::new();
//! let pos = world.register::<Position>("position").unwrap();
//! let vel = world.register::<Velocity>("velocity").unwrap();
//!
//! let entity = world.allocate_entity(&[pos, vel]).unwrap();
//! world.set(entity, Velocity { dx: 1.0, dy: 0.5 }).unwrap();
//!
//! let mut movement = world
//!     .make_system("movement", &[pos, vel], |chunk: &mut ChunkView<'_>| {
//!         let mut columns = chunk.columns_mut().into_iter();
//!         let positions = columns.next().unwrap().cast::<Position>()?;
//!         let velocities = columns.next().unwrap().cast::<Velocity>()?;
//!         for (p, v) in positions.iter_mut().zip(velocities.iter()) {
//!             p.x += v.dx;
//!             p.y += v.dy;
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//! world.execute_system(&mut movement).unwrap();
//!
//! assert_eq!(world.get::<Position>(entity).unwrap(), Some(&Position { x: 1.0, y: 0.5 }));
//! ```

#![deny(unsafe_code)]

pub mod archetype;
pub mod block;
pub mod component;
pub mod config;
pub mod entity;
pub mod layout;
pub mod system;
pub mod world;

pub use config::StoreConfig;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: entity::EntityId },

    /// A component type ID was never handed out by the registry.
    #[error("component type {id:?} is not registered")]
    UnknownComponent { id: component::ComponentTypeId },

    /// A typed accessor was used with a Rust type that was never registered.
    #[error("Rust type '{type_name}' is not registered as a component")]
    UnregisteredType { type_name: &'static str },

    #[error("component name '{name}' is already registered")]
    DuplicateComponent { name: String },

    /// Size or alignment unusable inside a block.
    #[error("component '{name}' has an invalid layout (size {size}, align {align}): {reason}")]
    InvalidComponentLayout {
        name: String,
        size: usize,
        align: usize,
        reason: &'static str,
    },

    /// An archetype would exceed the per-archetype type limit.
    #[error("an archetype holds at most {max} component types, {requested} requested")]
    TooManyTypes { max: usize, requested: usize },

    /// Not even one entity fits in a block.
    #[error("one entity needs {entity_size} bytes but a block holds {block_size}")]
    ComponentTooLarge {
        entity_size: usize,
        block_size: usize,
    },

    /// A typed view was requested with the wrong Rust type.
    #[error("component {id:?} is registered as '{stored}', not '{requested}'")]
    TypeMismatch {
        id: component::ComponentTypeId,
        stored: String,
        requested: &'static str,
    },

    /// Bytes could not be viewed as the requested type.
    #[error("column {column} cannot be viewed as '{requested}': {reason}")]
    ColumnCast {
        column: usize,
        requested: &'static str,
        reason: String,
    },

    #[error("invalid store configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The allocator failed or the configured block limit was reached.
    #[error("could not obtain a {block_size}-byte block ({allocated} blocks allocated)")]
    BlockAllocation { block_size: usize, allocated: usize },

    /// Reported by [`World::check_invariants`](world::World::check_invariants).
    #[error("storage invariant violated: {detail}")]
    InvariantViolated { detail: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId};
    pub use crate::block::PoolStats;
    pub use crate::component::{ComponentHooks, ComponentInfo, ComponentRegistry, ComponentTypeId};
    pub use crate::config::StoreConfig;
    pub use crate::entity::{EntityId, EntityLocation};
    pub use crate::layout::{ChunkCapacity, ChunkLayout};
    pub use crate::system::{ChunkView, ColumnMut, System, SystemStats};
    pub use crate::world::World;
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
