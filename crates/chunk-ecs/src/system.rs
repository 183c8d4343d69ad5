//! Systems: callbacks that run over every chunk holding a set of component
//! types.
//!
//! A [`System`] names an ascending set of component types. Executing it (see
//! [`World::execute_system`](crate::world::World::execute_system)) finds
//! every archetype whose type list is a superset and calls the callback once
//! per occupied block with a [`ChunkView`]. Columns of the view follow the
//! system's type order, not the archetype's.
//!
//! Byte columns are turned into typed slices only through `bytemuck`, which
//! checks size and alignment; types registered as Rust types are also
//! checked by `TypeId`.

use std::any::{type_name, TypeId};
use std::fmt;
use std::ops::Range;

use bytemuck::Pod;

use crate::archetype::{ArchetypeId, ColumnDesc, TypeSet};
use crate::component::{ComponentInfo, ComponentTypeId};
use crate::entity::EntityId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Single ascending merge-scan of two sorted type lists.
///
/// Returns the archetype column of every required type, in required order,
/// or `None` if some required type is missing.
pub fn match_columns(
    archetype: &[ComponentTypeId],
    required: &[ComponentTypeId],
) -> Option<Vec<usize>> {
    let mut columns = Vec::with_capacity(required.len());
    let mut i = 0;
    for &want in required {
        loop {
            let &have = archetype.get(i)?;
            i += 1;
            if have == want {
                columns.push(i - 1);
                break;
            }
            if have > want {
                return None;
            }
        }
    }
    Some(columns)
}

// ---------------------------------------------------------------------------
// ChunkView
// ---------------------------------------------------------------------------

fn check_cast<T: Pod>(column: usize, size: usize, info: &ComponentInfo) -> Result<(), EcsError> {
    if let Some(stored) = info.rust_type {
        if stored != TypeId::of::<T>() {
            return Err(EcsError::TypeMismatch {
                id: info.id,
                stored: info.name.clone(),
                requested: type_name::<T>(),
            });
        }
    }
    let cast_error = |reason: String| EcsError::ColumnCast {
        column,
        requested: type_name::<T>(),
        reason,
    };
    if size == 0 {
        return Err(cast_error("zero-sized column has no bytes".into()));
    }
    if std::mem::size_of::<T>() != size {
        return Err(cast_error(format!(
            "element is {} bytes, column stores {size}",
            std::mem::size_of::<T>()
        )));
    }
    Ok(())
}

/// One block's worth of entities of a matching archetype.
pub struct ChunkView<'a> {
    archetype: ArchetypeId,
    bytes: &'a mut [u8],
    columns: &'a [ColumnDesc],
    infos: &'a [ComponentInfo],
    entities: &'a [EntityId],
}

impl<'a> ChunkView<'a> {
    pub(crate) fn new(
        archetype: ArchetypeId,
        bytes: &'a mut [u8],
        columns: &'a [ColumnDesc],
        infos: &'a [ComponentInfo],
        entities: &'a [EntityId],
    ) -> Self {
        Self {
            archetype,
            bytes,
            columns,
            infos,
            entities,
        }
    }

    pub fn archetype(&self) -> ArchetypeId {
        self.archetype
    }

    /// Number of entities in this chunk.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entity handles, one per row.
    pub fn entities(&self) -> &[EntityId] {
        self.entities
    }

    /// Number of columns (the system's type count).
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Byte offset of each column's sub-array inside the block, in system
    /// type order.
    pub fn offsets(&self) -> Vec<usize> {
        self.columns.iter().map(|c| c.offset).collect()
    }

    /// Component type stored in `column`.
    pub fn component_type(&self, column: usize) -> Option<ComponentTypeId> {
        self.columns.get(column).map(|c| self.infos[c.info].id)
    }

    /// The whole block; empty for tag archetypes.
    pub fn raw_block(&self) -> &[u8] {
        &*self.bytes
    }

    pub fn raw_block_mut(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }

    fn range(&self, column: usize) -> Result<(Range<usize>, &'a ColumnDesc), EcsError> {
        let columns: &'a [ColumnDesc] = self.columns;
        let desc = columns.get(column).ok_or_else(|| EcsError::ColumnCast {
            column,
            requested: "bytes",
            reason: format!("view has {} columns", self.columns.len()),
        })?;
        let start = desc.offset;
        Ok((start..start + desc.size * self.len(), desc))
    }

    /// Raw bytes of one column's live rows.
    pub fn column_bytes(&self, column: usize) -> Result<&[u8], EcsError> {
        let (range, _) = self.range(column)?;
        Ok(&self.bytes[range])
    }

    pub fn column_bytes_mut(&mut self, column: usize) -> Result<&mut [u8], EcsError> {
        let (range, _) = self.range(column)?;
        Ok(&mut self.bytes[range])
    }

    /// Typed view of one column.
    pub fn column<T: Pod>(&self, column: usize) -> Result<&[T], EcsError> {
        let (range, desc) = self.range(column)?;
        check_cast::<T>(column, desc.size, &self.infos[desc.info])?;
        bytemuck::try_cast_slice(&self.bytes[range]).map_err(|e| EcsError::ColumnCast {
            column,
            requested: type_name::<T>(),
            reason: format!("{e:?}"),
        })
    }

    /// Mutable typed view of one column.
    pub fn column_mut<T: Pod>(&mut self, column: usize) -> Result<&mut [T], EcsError> {
        let (range, desc) = self.range(column)?;
        check_cast::<T>(column, desc.size, &self.infos[desc.info])?;
        bytemuck::try_cast_slice_mut(&mut self.bytes[range]).map_err(|e| EcsError::ColumnCast {
            column,
            requested: type_name::<T>(),
            reason: format!("{e:?}"),
        })
    }

    /// Split the chunk into one independently borrowable column per system
    /// type, in system type order.
    pub fn columns_mut(&mut self) -> Vec<ColumnMut<'_>> {
        let len = self.len();
        let columns = self.columns;
        let infos = self.infos;

        let mut order: Vec<usize> = (0..columns.len()).collect();
        order.sort_by_key(|&c| (columns[c].offset, columns[c].size));

        let mut slots: Vec<Option<ColumnMut<'_>>> = (0..columns.len()).map(|_| None).collect();
        let mut rest: &mut [u8] = &mut *self.bytes;
        let mut cursor = 0;
        for c in order {
            let desc = &columns[c];
            let bytes_len = desc.size * len;
            let tail = std::mem::take(&mut rest);
            let (_, tail) = tail.split_at_mut(desc.offset - cursor);
            let (bytes, tail) = tail.split_at_mut(bytes_len);
            rest = tail;
            cursor = desc.offset + bytes_len;
            slots[c] = Some(ColumnMut {
                column: c,
                bytes,
                size: desc.size,
                info: &infos[desc.info],
            });
        }
        slots.into_iter().flatten().collect()
    }
}

impl fmt::Debug for ChunkView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkView")
            .field("archetype", &self.archetype)
            .field("len", &self.len())
            .field("columns", &self.columns.len())
            .finish()
    }
}

/// One mutable column split off a [`ChunkView`].
pub struct ColumnMut<'v> {
    column: usize,
    bytes: &'v mut [u8],
    size: usize,
    info: &'v ComponentInfo,
}

impl<'v> ColumnMut<'v> {
    pub fn column(&self) -> usize {
        self.column
    }

    pub fn component_type(&self) -> ComponentTypeId {
        self.info.id
    }

    pub fn bytes(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }

    pub fn cast<T: Pod>(self) -> Result<&'v mut [T], EcsError> {
        check_cast::<T>(self.column, self.size, self.info)?;
        let column = self.column;
        bytemuck::try_cast_slice_mut(self.bytes).map_err(|e| EcsError::ColumnCast {
            column,
            requested: type_name::<T>(),
            reason: format!("{e:?}"),
        })
    }
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// Callback invoked once per matching chunk.
pub type SystemFn<'s> = dyn FnMut(&mut ChunkView<'_>) -> Result<(), EcsError> + 's;

/// A named callback plus the component types it requires.
///
/// Built with [`World::make_system`](crate::world::World::make_system).
pub struct System<'s> {
    name: String,
    types: TypeSet,
    callback: Box<SystemFn<'s>>,
}

impl<'s> System<'s> {
    pub(crate) fn new(name: &str, types: TypeSet, callback: Box<SystemFn<'s>>) -> Self {
        Self {
            name: name.to_owned(),
            types,
            callback,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Required types, ascending.
    pub fn types(&self) -> &[ComponentTypeId] {
        self.types.as_slice()
    }

    pub(crate) fn parts_mut(&mut self) -> (&[ComponentTypeId], &mut SystemFn<'s>) {
        (self.types.as_slice(), &mut *self.callback)
    }
}

impl fmt::Debug for System<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("name", &self.name)
            .field("types", &self.types)
            .finish_non_exhaustive()
    }
}

/// What one system execution touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemStats {
    pub archetypes_matched: usize,
    pub blocks_visited: usize,
    pub entities_visited: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentHooks, ComponentRegistry};

    fn ids(raw: &[u32]) -> Vec<ComponentTypeId> {
        raw.iter().map(|&i| ComponentTypeId(i)).collect()
    }

    #[test]
    fn merge_scan_finds_columns() {
        assert_eq!(match_columns(&ids(&[1, 3, 5, 7]), &ids(&[3, 7])), Some(vec![1, 3]));
        assert_eq!(match_columns(&ids(&[1, 3, 5]), &ids(&[1, 3, 5])), Some(vec![0, 1, 2]));
        assert_eq!(match_columns(&ids(&[1, 3]), &[]), Some(vec![]));
    }

    #[test]
    fn merge_scan_rejects_missing_types() {
        assert_eq!(match_columns(&ids(&[1, 3, 5]), &ids(&[2])), None);
        assert_eq!(match_columns(&ids(&[1, 3, 5]), &ids(&[5, 9])), None);
        assert_eq!(match_columns(&[], &ids(&[0])), None);
    }

    struct Fixture {
        words: Vec<u64>,
        columns: Vec<ColumnDesc>,
        infos: Vec<ComponentInfo>,
        entities: Vec<EntityId>,
    }

    /// Two rows: a u32 column at 0 and a u64 column at 8 (system order is
    /// reversed relative to the archetype).
    fn fixture() -> Fixture {
        let mut reg = ComponentRegistry::new();
        let a = reg.register::<u32>("a").unwrap();
        let b = reg.register_raw("b", 8, 8, ComponentHooks::NONE).unwrap();
        let infos = vec![reg.info(a).unwrap().clone(), reg.info(b).unwrap().clone()];
        let mut words = vec![0u64; 8];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
        bytes[0..4].copy_from_slice(&1u32.to_ne_bytes());
        bytes[4..8].copy_from_slice(&2u32.to_ne_bytes());
        Fixture {
            words,
            columns: vec![
                ColumnDesc {
                    offset: 8,
                    size: 8,
                    info: 1,
                },
                ColumnDesc {
                    offset: 0,
                    size: 4,
                    info: 0,
                },
            ],
            infos,
            entities: vec![EntityId::new(0, 0), EntityId::new(1, 0)],
        }
    }

    fn view(fx: &mut Fixture) -> ChunkView<'_> {
        ChunkView::new(
            ArchetypeId(0),
            bytemuck::cast_slice_mut(&mut fx.words),
            &fx.columns,
            &fx.infos,
            &fx.entities,
        )
    }

    #[test]
    fn typed_columns_follow_system_order() {
        let mut fx = fixture();
        let mut view = view(&mut fx);
        assert_eq!(view.len(), 2);
        assert_eq!(view.offsets(), vec![8, 0]);
        assert_eq!(view.column::<u32>(1).unwrap(), &[1, 2]);
        view.column_mut::<u64>(0).unwrap()[1] = 99;
        assert_eq!(view.column::<u64>(0).unwrap(), &[0, 99]);
    }

    #[test]
    fn wrong_type_or_size_is_rejected() {
        let mut fx = fixture();
        let view = view(&mut fx);
        assert!(matches!(
            view.column::<i32>(1),
            Err(EcsError::TypeMismatch { .. })
        ));
        assert!(matches!(
            view.column::<u32>(0),
            Err(EcsError::ColumnCast { column: 0, .. })
        ));
        assert!(matches!(
            view.column_bytes(2),
            Err(EcsError::ColumnCast { column: 2, .. })
        ));
    }

    #[test]
    fn columns_mut_are_disjoint() {
        let mut fx = fixture();
        let mut view = view(&mut fx);
        let mut cols = view.columns_mut().into_iter();
        let wide = cols.next().unwrap().cast::<u64>().unwrap();
        let narrow = cols.next().unwrap().cast::<u32>().unwrap();
        for (w, n) in wide.iter_mut().zip(narrow.iter_mut()) {
            *w = u64::from(*n) * 10;
            *n += 1;
        }
        assert_eq!(view.column::<u64>(0).unwrap(), &[10, 20]);
        assert_eq!(view.column::<u32>(1).unwrap(), &[2, 3]);
    }
}
