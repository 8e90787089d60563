//! A fixed-size block store over a single in-memory buffer, meant to sit beneath
//! a file system. Blocks are allocated, read and written whole, and the whole
//! buffer can be persisted to and restored from a flat image file.
//!
//! The free block map is not a separate structure. It occupies a reserved run of
//! the store's own blocks (see [`layout`]), so an image of the blocks is always a
//! complete image of the store.

pub mod bitmap;
pub mod io;
pub mod layout;
mod store;

pub use crate::bitmap::{BitVector, BitVectorOverlay, BitVectorView, OwnedBitVector};
pub use crate::io::BlockStorage;
pub use crate::layout::{BlockId, BLOCK_SIZE_BYTES, BLOCK_STORE_NUM_BLOCKS};
pub use crate::store::{BlockStore, BlockStoreError, Result};
