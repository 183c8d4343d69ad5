//! Component type registration and metadata.
//!
//! Every component type must be registered in a [`ComponentRegistry`] before
//! an entity can carry it. Registration records the byte size, alignment and
//! optional construct/destruct hooks of the type and hands back a small
//! [`ComponentTypeId`]. Archetypes sort their type lists by this ID, so the
//! registration order also fixes the order of sub-arrays inside a block.
//!
//! Types can be registered two ways:
//!
//! - [`ComponentRegistry::register_raw`] for opaque byte ranges described
//!   only by size and alignment (the engine never interprets the bytes);
//! - [`ComponentRegistry::register`] for plain-old-data Rust types, which
//!   additionally enables the checked typed accessors on
//!   [`World`](crate::world::World).

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;

use bytemuck::Pod;

use crate::block::BLOCK_ALIGN;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    /// Position of this type in the registry.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// A lifecycle hook invoked on the bytes of one component instance.
pub type ComponentHook = fn(&mut [u8]);

/// Optional lifecycle hooks for a component type.
///
/// `construct` runs when an instance comes into existence (entity allocation
/// or attach), `destruct` when it goes away (entity deallocation or detach).
/// Migration between archetypes copies bytes and runs neither.
#[derive(Clone, Copy, Default)]
pub struct ComponentHooks {
    pub construct: Option<ComponentHook>,
    pub destruct: Option<ComponentHook>,
}

impl ComponentHooks {
    /// No hooks: new instances keep whatever bytes the block slot held.
    pub const NONE: ComponentHooks = ComponentHooks {
        construct: None,
        destruct: None,
    };
}

impl fmt::Debug for ComponentHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHooks")
            .field("construct", &self.construct.is_some())
            .field("destruct", &self.destruct.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Metadata about a registered component type. Immutable once registered.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Unique ID assigned at registration time.
    pub id: ComponentTypeId,
    /// Human-readable name (supplied by the caller).
    pub name: String,
    /// Byte size of one instance.
    pub size: usize,
    /// Required alignment of one instance.
    pub align: usize,
    /// Lifecycle hooks.
    pub hooks: ComponentHooks,
    /// Rust `TypeId`, present only for types registered through
    /// [`ComponentRegistry::register`].
    pub rust_type: Option<TypeId>,
}

impl ComponentInfo {
    pub(crate) fn construct(&self, bytes: &mut [u8]) {
        if let Some(hook) = self.hooks.construct {
            hook(bytes);
        }
    }

    pub(crate) fn destruct(&self, bytes: &mut [u8]) {
        if let Some(hook) = self.hooks.destruct {
            hook(bytes);
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping component names and Rust types to [`ComponentTypeId`]s.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    /// TypeId -> ComponentTypeId for typed registrations.
    by_type: HashMap<TypeId, ComponentTypeId>,
    /// Name -> ComponentTypeId.
    by_name: HashMap<String, ComponentTypeId>,
    /// Indexed by ComponentTypeId.0.
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an opaque component type described by size and alignment.
    ///
    /// The alignment must be a power of two no larger than the block
    /// alignment, and the size a multiple of the alignment so that every
    /// element of a sub-array stays aligned.
    pub fn register_raw(
        &mut self,
        name: &str,
        size: usize,
        align: usize,
        hooks: ComponentHooks,
    ) -> Result<ComponentTypeId, EcsError> {
        self.insert(name, size, align, hooks, None)
    }

    /// Register a plain-old-data Rust type under `name`.
    ///
    /// The construct hook writes `T::default()`. Registering the same Rust
    /// type again returns the existing ID and ignores `name`.
    pub fn register<T: Pod + Default>(&mut self, name: &str) -> Result<ComponentTypeId, EcsError> {
        let rust_type = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type) {
            return Ok(existing);
        }

        fn write_default<T: Pod + Default>(bytes: &mut [u8]) {
            bytes.copy_from_slice(bytemuck::bytes_of(&T::default()));
        }

        let hooks = ComponentHooks {
            construct: Some(write_default::<T>),
            destruct: None,
        };
        let id = self.insert(
            name,
            std::mem::size_of::<T>(),
            std::mem::align_of::<T>(),
            hooks,
            Some(rust_type),
        )?;
        self.by_type.insert(rust_type, id);
        Ok(id)
    }

    fn insert(
        &mut self,
        name: &str,
        size: usize,
        align: usize,
        hooks: ComponentHooks,
        rust_type: Option<TypeId>,
    ) -> Result<ComponentTypeId, EcsError> {
        if self.by_name.contains_key(name) {
            return Err(EcsError::DuplicateComponent {
                name: name.to_owned(),
            });
        }
        let invalid = |reason| EcsError::InvalidComponentLayout {
            name: name.to_owned(),
            size,
            align,
            reason,
        };
        if !align.is_power_of_two() {
            return Err(invalid("alignment is not a power of two"));
        }
        if align > BLOCK_ALIGN {
            return Err(invalid("alignment exceeds the block alignment"));
        }
        if size % align != 0 {
            return Err(invalid("size is not a multiple of the alignment"));
        }

        let id = ComponentTypeId(self.infos.len() as u32);
        self.infos.push(ComponentInfo {
            id,
            name: name.to_owned(),
            size,
            align,
            hooks,
            rust_type,
        });
        self.by_name.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Look up a component type by its Rust type.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Like [`lookup`](Self::lookup), but reports an unregistered type as an
    /// error.
    pub fn expect_type<T: 'static>(&self) -> Result<ComponentTypeId, EcsError> {
        self.lookup::<T>().ok_or(EcsError::UnregisteredType {
            type_name: type_name::<T>(),
        })
    }

    /// Look up a component type by its registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Get the [`ComponentInfo`] for a registered component type ID.
    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.index())
    }

    /// Like [`get_info`](Self::get_info), but reports an unknown ID as an
    /// error.
    pub fn info(&self, id: ComponentTypeId) -> Result<&ComponentInfo, EcsError> {
        self.get_info(id).ok_or(EcsError::UnknownComponent { id })
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
