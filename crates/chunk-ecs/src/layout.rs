//! Structure-of-arrays layout of component sub-arrays inside a block.
//!
//! A block stores `entities_per_chunk` instances of every component type of
//! an archetype. Type 0's whole sub-array comes first, then type 1's, and so
//! on; each sub-array starts at an offset aligned to its type's alignment.
//! The block base is aligned to [`BLOCK_ALIGN`](crate::block::BLOCK_ALIGN),
//! which is at least as strict as any registered alignment, so an offset
//! aligned relative to the block is aligned in memory too.

use crate::EcsError;

/// Maximum number of component types one archetype may carry.
pub const MAX_ARCHETYPE_TYPES: usize = 15;

/// Size and alignment of one component type, as seen by the layout engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemLayout {
    pub size: usize,
    pub align: usize,
}

/// How many entities one block of an archetype holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkCapacity {
    /// Every type of the archetype is zero-sized; no blocks are needed.
    Tag,
    /// Number of entities per block.
    Entities(usize),
}

impl ChunkCapacity {
    pub fn entities(self) -> Option<usize> {
        match self {
            ChunkCapacity::Tag => None,
            ChunkCapacity::Entities(n) => Some(n),
        }
    }
}

/// Offset table and chunk capacity of one archetype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    offsets: Vec<usize>,
    capacity: ChunkCapacity,
    used_bytes: usize,
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Appends one offset per item, starting at `start`, and returns the end of
/// the last sub-array.
fn place(items: &[ItemLayout], epc: usize, start: usize, offsets: &mut Vec<usize>) -> usize {
    let mut cursor = start;
    for item in items {
        cursor = align_up(cursor, item.align);
        offsets.push(cursor);
        cursor += item.size * epc;
    }
    cursor
}

/// Every element of a sub-array stays aligned only if the alignment is a
/// power of two and divides the size.
fn check_items(items: &[ItemLayout]) -> Result<(), EcsError> {
    for (index, item) in items.iter().enumerate() {
        let reason = if !item.align.is_power_of_two() {
            "alignment must be a power of two"
        } else if item.size % item.align != 0 {
            "size must be a multiple of the alignment"
        } else {
            continue;
        };
        return Err(EcsError::InvalidComponentLayout {
            name: format!("item {index}"),
            size: item.size,
            align: item.align,
            reason,
        });
    }
    Ok(())
}

impl ChunkLayout {
    /// Computes the layout of `items` from scratch.
    pub fn compute(items: &[ItemLayout], block_size: usize) -> Result<Self, EcsError> {
        check_items(items)?;
        let entity_size: usize = items.iter().map(|i| i.size).sum();
        if entity_size == 0 {
            return Ok(Self::tag(items.len()));
        }
        Self::fit(items, block_size, entity_size, block_size / entity_size)
    }

    /// Computes the layout of `items`, which differ from the items this
    /// layout was built for only at and after index `changed` (one type was
    /// inserted or removed there).
    ///
    /// Offsets before `changed` are kept when the naive capacity did not
    /// move. The result always equals [`ChunkLayout::compute`].
    pub fn relayout(
        &self,
        items: &[ItemLayout],
        changed: usize,
        block_size: usize,
    ) -> Result<Self, EcsError> {
        check_items(items)?;
        let entity_size: usize = items.iter().map(|i| i.size).sum();
        if entity_size == 0 {
            return Ok(Self::tag(items.len()));
        }
        let naive = block_size / entity_size;

        // Prefix offsets depend only on the prefix items and the capacity.
        let reusable = self.capacity == ChunkCapacity::Entities(naive)
            && changed <= self.offsets.len()
            && changed <= items.len();
        if !reusable {
            return Self::fit(items, block_size, entity_size, naive);
        }

        let mut offsets = Vec::with_capacity(items.len());
        offsets.extend_from_slice(&self.offsets[..changed]);
        let start = match changed {
            0 => 0,
            n => offsets[n - 1] + items[n - 1].size * naive,
        };
        let end = place(&items[changed..], naive, start, &mut offsets);
        if end <= block_size {
            return Ok(Self {
                offsets,
                capacity: ChunkCapacity::Entities(naive),
                used_bytes: end,
            });
        }
        Self::fit(items, block_size, entity_size, naive - 1)
    }

    fn tag(type_count: usize) -> Self {
        Self {
            offsets: vec![0; type_count],
            capacity: ChunkCapacity::Tag,
            used_bytes: 0,
        }
    }

    fn fit(
        items: &[ItemLayout],
        block_size: usize,
        entity_size: usize,
        mut epc: usize,
    ) -> Result<Self, EcsError> {
        let mut offsets = Vec::with_capacity(items.len());
        while epc > 0 {
            offsets.clear();
            let end = place(items, epc, 0, &mut offsets);
            if end <= block_size {
                return Ok(Self {
                    offsets,
                    capacity: ChunkCapacity::Entities(epc),
                    used_bytes: end,
                });
            }
            epc -= 1;
        }
        Err(EcsError::ComponentTooLarge {
            entity_size,
            block_size,
        })
    }

    /// Byte offset of each type's sub-array, in archetype type order.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn offset(&self, column: usize) -> usize {
        self.offsets[column]
    }

    pub fn capacity(&self) -> ChunkCapacity {
        self.capacity
    }

    /// `None` for tag archetypes.
    pub fn entities_per_chunk(&self) -> Option<usize> {
        self.capacity.entities()
    }

    pub fn is_tag(&self) -> bool {
        self.capacity == ChunkCapacity::Tag
    }

    /// End of the last sub-array; never exceeds the block size.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
