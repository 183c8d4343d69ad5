//! Fixed-size memory blocks and the pool that recycles them.
//!
//! Every archetype stores its components in blocks of the same size. Blocks
//! that an archetype gives back go onto the pool's free list and are handed
//! out again before any new memory is requested from the allocator. Reused
//! blocks keep their previous contents; only freshly allocated blocks are
//! zeroed.

use bytemuck::Zeroable;
use bytemuck_derive::{Pod, Zeroable};
use tracing::{debug, warn};

use crate::EcsError;

/// Alignment of every block base address, in bytes.
pub const BLOCK_ALIGN: usize = 64;

/// Default block size, in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// One cache line; blocks are built from these so the base stays aligned.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(64))]
struct Line([u8; BLOCK_ALIGN]);

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A fixed-size, 64-byte aligned byte buffer.
pub struct Block {
    lines: Box<[Line]>,
}

impl Block {
    fn allocate(block_size: usize) -> Option<Block> {
        let count = block_size / BLOCK_ALIGN;
        let mut lines = Vec::new();
        lines.try_reserve_exact(count).ok()?;
        lines.resize(count, Line::zeroed());
        Some(Block {
            lines: lines.into_boxed_slice(),
        })
    }

    /// Size of the block in bytes.
    pub fn len(&self) -> usize {
        self.lines.len() * BLOCK_ALIGN
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.lines)
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.lines)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block").field("len", &self.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// BlockPool
// ---------------------------------------------------------------------------

/// Block counters reported by [`BlockPool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks obtained from the allocator and not yet flushed.
    pub allocated: usize,
    /// Blocks sitting on the free list.
    pub pooled: usize,
    /// Blocks currently owned by archetypes.
    pub in_use: usize,
}

/// Free list of same-sized blocks shared by every archetype of a world.
#[derive(Debug)]
pub struct BlockPool {
    block_size: usize,
    free: Vec<Block>,
    allocated: usize,
    max_blocks: Option<usize>,
}

impl BlockPool {
    /// `block_size` must be a positive multiple of [`BLOCK_ALIGN`]; the
    /// world validates this through its configuration.
    pub(crate) fn new(block_size: usize, max_blocks: Option<usize>) -> Self {
        Self {
            block_size,
            free: Vec::new(),
            allocated: 0,
            max_blocks,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocate `count` blocks up front and put them on the free list.
    pub fn preallocate(&mut self, count: usize) -> Result<(), EcsError> {
        self.free.reserve(count);
        for _ in 0..count {
            let block = self.allocate_new()?;
            self.free.push(block);
        }
        Ok(())
    }

    /// Take a block from the free list, or allocate one if the list is empty.
    pub fn acquire(&mut self) -> Result<Block, EcsError> {
        match self.free.pop() {
            Some(block) => Ok(block),
            None => self.allocate_new(),
        }
    }

    /// Return a block to the free list.
    pub fn release(&mut self, block: Block) {
        self.free.push(block);
    }

    /// Drop every pooled block, returning their memory to the allocator.
    /// Returns the number of blocks released.
    pub fn flush(&mut self) -> usize {
        let released = self.free.len();
        self.free.clear();
        self.allocated -= released;
        if released > 0 {
            debug!(released, allocated = self.allocated, "flushed block pool");
        }
        released
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated,
            pooled: self.free.len(),
            in_use: self.allocated - self.free.len(),
        }
    }

    fn allocate_new(&mut self) -> Result<Block, EcsError> {
        let failure = EcsError::BlockAllocation {
            block_size: self.block_size,
            allocated: self.allocated,
        };
        if self.max_blocks.is_some_and(|max| self.allocated >= max) {
            warn!(
                allocated = self.allocated,
                block_size = self.block_size,
                "block limit reached"
            );
            return Err(failure);
        }
        let block = Block::allocate(self.block_size).ok_or(failure)?;
        self.allocated += 1;
        debug!(
            allocated = self.allocated,
            block_size = self.block_size,
            "allocated block"
        );
        Ok(block)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
