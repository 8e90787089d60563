use std::ops::Range;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// 1k blocks. Small enough that a full image of the store stays at 64MiB.
pub const BLOCK_SIZE_BYTES: usize = 1024;
/// Total number of addressable blocks, including the ones holding the free map.
pub const BLOCK_STORE_NUM_BLOCKS: usize = 65536;
pub const BLOCK_STORE_NUM_BYTES: usize = BLOCK_STORE_NUM_BLOCKS * BLOCK_SIZE_BYTES;

/// Known locations.
///
/// # Layout
/// ===========================================================================
/// | Blocks 0..1022 | Free map (blocks 1022..1030) | Blocks 1030..65536     |
/// ===========================================================================
///
/// The free map tracks one bit per block, its own eight blocks included.
pub const BITMAP_START_BLOCK: usize = 1022;
pub const BITMAP_NUM_BLOCKS: usize = 8;
pub const BITMAP_SIZE_BYTES: usize = BITMAP_NUM_BLOCKS * BLOCK_SIZE_BYTES;
pub const BITMAP_SIZE_BITS: usize = BLOCK_STORE_NUM_BLOCKS;

const _: () = assert!(BITMAP_SIZE_BYTES * 8 >= BITMAP_SIZE_BITS);
const _: () = assert!(BITMAP_START_BLOCK + BITMAP_NUM_BLOCKS <= BLOCK_STORE_NUM_BLOCKS);

/// The block number to access ranging from 0 (the first block) to n - 1 (the last
/// block) where n is `BLOCK_STORE_NUM_BLOCKS`.
pub type BlockId = usize;

/// Blocks holding the free map. These are marked used when a store is created
/// and can never be handed out or released.
pub const fn reserved_blocks() -> Range<BlockId> {
    BITMAP_START_BLOCK..BITMAP_START_BLOCK + BITMAP_NUM_BLOCKS
}

pub const fn is_reserved(block_id: BlockId) -> bool {
    block_id >= BITMAP_START_BLOCK && block_id < BITMAP_START_BLOCK + BITMAP_NUM_BLOCKS
}

/// A single fixed-size record of the store. The store is a flat array of these,
/// which lets the same memory be viewed as raw bytes for persistence and for the
/// free map overlay.
#[repr(transparent)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy)]
pub struct Block([u8; BLOCK_SIZE_BYTES]);

impl Block {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}
