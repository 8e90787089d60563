use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use log::{debug, info, trace, warn};
use tempfile::NamedTempFile;
use thiserror::Error;
use zerocopy::{AsBytes, FromZeroes};

use crate::bitmap::{BitVector, BitVectorOverlay, BitVectorView, Bits};
use crate::io::BlockStorage;
use crate::layout::{
    is_reserved, reserved_blocks, Block, BlockId, BITMAP_SIZE_BITS, BLOCK_SIZE_BYTES,
    BLOCK_STORE_NUM_BLOCKS, BLOCK_STORE_NUM_BYTES,
};

#[derive(Error, Debug)]
pub enum BlockStoreError {
    #[error("not enough memory to allocate the block store")]
    OutOfMemory,
    #[error("block {0} is out of range")]
    OutOfRange(BlockId),
    #[error("block {0} holds the free map and is permanently reserved")]
    Reserved(BlockId),
    #[error("block {0} is already allocated")]
    AlreadyAllocated(BlockId),
    #[error("no free blocks left")]
    NoSpace,
    #[error("buffer holds {found} bytes, a block needs {expected}")]
    BufferTooSmall { expected: usize, found: usize },
    #[error("image holds {found} bytes, a full store needs {expected}")]
    ShortImage { expected: u64, found: u64 },
    #[error("block store image I/O failed")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BlockStoreError>;

/// An in-memory disk of `BLOCK_STORE_NUM_BLOCKS` fixed-size blocks.
///
/// The free map is not kept beside the blocks, it lives inside them: blocks
/// `BITMAP_START_BLOCK..BITMAP_START_BLOCK + BITMAP_NUM_BLOCKS` are read as one bit
/// per block, set when the block is allocated. Writing the blocks out therefore
/// writes the allocation state with them.
pub struct BlockStore {
    blocks: Box<[Block]>,
}

impl BlockStore {
    /// Creates an empty store where only the free map's own blocks are in use.
    pub fn create() -> Result<Self> {
        let mut store = Self::zeroed()?;

        let mut free_map = store.free_map_mut();
        for block_id in reserved_blocks() {
            free_map.set(block_id);
        }

        debug!(
            "created block store with blocks {:?} reserved for the free map",
            reserved_blocks()
        );
        Ok(store)
    }

    fn zeroed() -> Result<Self> {
        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(BLOCK_STORE_NUM_BLOCKS)
            .map_err(|_| BlockStoreError::OutOfMemory)?;
        blocks.resize(BLOCK_STORE_NUM_BLOCKS, Block::new_zeroed());

        Ok(Self {
            blocks: blocks.into_boxed_slice(),
        })
    }

    fn bitmap_bits(&self) -> &Bits {
        let bytes = self.blocks[reserved_blocks()].as_bytes();
        &Bits::from_slice(bytes)[..BITMAP_SIZE_BITS]
    }

    fn free_map(&self) -> BitVectorView<'_> {
        BitVector::from_bits(self.bitmap_bits())
    }

    fn free_map_mut(&mut self) -> BitVectorOverlay<'_> {
        let bytes = self.blocks[reserved_blocks()].as_bytes_mut();
        BitVector::from_bits(&mut Bits::from_slice_mut(bytes)[..BITMAP_SIZE_BITS])
    }

    /// Claims the lowest numbered free block. Allocation order is deterministic,
    /// a released block is handed out again before any higher numbered one.
    ///
    /// The free map's own blocks are never handed out, even when a restored image
    /// has their bits clear.
    pub fn allocate(&mut self) -> Result<BlockId> {
        let reserved = reserved_blocks();
        let mut free_map = self.free_map_mut();
        let block_id = free_map
            .first_zero_in(0..reserved.start)
            .or_else(|| free_map.first_zero_in(reserved.end..BLOCK_STORE_NUM_BLOCKS))
            .ok_or(BlockStoreError::NoSpace)?;
        free_map.set(block_id);

        trace!("allocated block {}", block_id);
        Ok(block_id)
    }

    /// Claims a specific block, used when restoring a layout where block numbers
    /// were assigned up front. Fails without side effects if the block can't be
    /// handed out.
    pub fn request(&mut self, block_id: BlockId) -> Result<()> {
        if block_id >= BLOCK_STORE_NUM_BLOCKS {
            return Err(BlockStoreError::OutOfRange(block_id));
        }
        if is_reserved(block_id) {
            return Err(BlockStoreError::Reserved(block_id));
        }

        let mut free_map = self.free_map_mut();
        if free_map.test(block_id) {
            return Err(BlockStoreError::AlreadyAllocated(block_id));
        }
        free_map.set(block_id);

        trace!("requested block {}", block_id);
        Ok(())
    }

    /// Returns a block to the free pool. Releasing an out of range or already free
    /// block does nothing.
    ///
    /// # Errors
    ///
    /// Blocks holding the free map can't be released.
    pub fn release(&mut self, block_id: BlockId) -> Result<()> {
        if block_id >= BLOCK_STORE_NUM_BLOCKS {
            warn!("ignoring release of out of range block {}", block_id);
            return Ok(());
        }
        if is_reserved(block_id) {
            return Err(BlockStoreError::Reserved(block_id));
        }

        self.free_map_mut().reset(block_id);
        trace!("released block {}", block_id);
        Ok(())
    }

    pub fn is_allocated(&self, block_id: BlockId) -> bool {
        block_id < BLOCK_STORE_NUM_BLOCKS && self.free_map().test(block_id)
    }

    /// Allocated block numbers in ascending order, reserved blocks included.
    pub fn allocated_blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.free_map().into_iter_ones()
    }

    /// Copies one block into `buf`. Reserved blocks can be read like any other,
    /// reservation only keeps them from being allocated.
    pub fn read(&self, block_id: BlockId, buf: &mut [u8]) -> Result<usize> {
        check_buffer(buf.len())?;
        let block = self
            .blocks
            .get(block_id)
            .ok_or(BlockStoreError::OutOfRange(block_id))?;

        buf[..BLOCK_SIZE_BYTES].copy_from_slice(block.as_slice());
        Ok(BLOCK_SIZE_BYTES)
    }

    /// Copies the first block's worth of `buf` into a block. Bytes past the block
    /// size are ignored.
    pub fn write(&mut self, block_id: BlockId, buf: &[u8]) -> Result<usize> {
        check_buffer(buf.len())?;
        let block = self
            .blocks
            .get_mut(block_id)
            .ok_or(BlockStoreError::OutOfRange(block_id))?;

        block.as_mut_slice().copy_from_slice(&buf[..BLOCK_SIZE_BYTES]);
        Ok(BLOCK_SIZE_BYTES)
    }

    pub fn used_blocks(&self) -> usize {
        self.free_map().count_ones()
    }

    pub fn free_blocks(&self) -> usize {
        BLOCK_STORE_NUM_BLOCKS - self.used_blocks()
    }

    pub const fn total_blocks() -> usize {
        BLOCK_STORE_NUM_BLOCKS
    }

    /// Writes the whole store, free map included, to `dest`. The image is staged
    /// in a temporary file next to `dest` and renamed over it, so `dest` either
    /// keeps its old content or holds the complete new image.
    ///
    /// # Errors
    ///
    /// The directory holding `dest` must exist and be writable, a writable `dest`
    /// alone is not enough. Otherwise `Io` is returned and `dest` is left as it was.
    pub fn persist<P: AsRef<Path>>(&self, dest: P) -> Result<usize> {
        let dest = dest.as_ref();
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut image = NamedTempFile::new_in(dir)?;
        image.write_all(self.blocks.as_bytes())?;
        image.as_file().sync_all()?;
        image.persist(dest).map_err(|err| err.error)?;

        info!(
            "persisted {} bytes ({} blocks used) to {}",
            BLOCK_STORE_NUM_BYTES,
            self.used_blocks(),
            dest.display()
        );
        Ok(BLOCK_STORE_NUM_BYTES)
    }

    /// Loads a store previously written by `persist`. The free map is taken as
    /// found in the image, reserved blocks are not marked again.
    pub fn restore<P: AsRef<Path>>(src: P) -> Result<Self> {
        let src = src.as_ref();
        let image = File::open(src)?;
        let store = Self::from_reader(image)?;

        info!(
            "restored block store from {} ({} blocks used)",
            src.display(),
            store.used_blocks()
        );
        Ok(store)
    }

    /// Loads a store from any byte source holding a persisted image, pipes
    /// included. Exactly one image's worth of bytes is consumed, a source that
    /// ends early yields `ShortImage`.
    pub fn from_reader<R: Read>(mut image: R) -> Result<Self> {
        let mut store = Self::zeroed()?;
        let expected = BLOCK_STORE_NUM_BYTES as u64;

        let found = fill_from(&mut image, store.blocks.as_bytes_mut())? as u64;
        if found < expected {
            return Err(BlockStoreError::ShortImage { expected, found });
        }

        let mut trailing = [0u8; 1];
        if fill_from(&mut image, &mut trailing)? > 0 {
            warn!("ignoring trailing bytes past the end of the image");
        }
        Ok(store)
    }
}

/// Reads until `buf` is full or the source ends, returning the bytes read.
fn fill_from<R: Read>(src: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn check_buffer(found: usize) -> Result<()> {
    if found < BLOCK_SIZE_BYTES {
        return Err(BlockStoreError::BufferTooSmall {
            expected: BLOCK_SIZE_BYTES,
            found,
        });
    }
    Ok(())
}

impl fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStore")
            .field("total_blocks", &BLOCK_STORE_NUM_BLOCKS)
            .field("used_blocks", &self.used_blocks())
            .finish()
    }
}

impl BlockStorage for BlockStore {
    fn block_count(&self) -> usize {
        BLOCK_STORE_NUM_BLOCKS
    }

    fn read_block(&self, blocknr: BlockId, buf: &mut [u8]) -> Result<usize> {
        self.read(blocknr, buf)
    }

    fn write_block(&mut self, blocknr: BlockId, buf: &[u8]) -> Result<usize> {
        self.write(blocknr, buf)
    }

    fn sync_disk(&mut self, dest: &Path) -> Result<usize> {
        self.persist(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BITMAP_NUM_BLOCKS, BITMAP_START_BLOCK};

    fn create_test_store() -> BlockStore {
        BlockStore::create().expect("Could not create block store.")
    }

    #[test]
    fn new_store_only_uses_free_map_blocks() {
        let store = create_test_store();
        assert_eq!(store.used_blocks(), BITMAP_NUM_BLOCKS);
        assert_eq!(
            store.free_blocks(),
            BLOCK_STORE_NUM_BLOCKS - BITMAP_NUM_BLOCKS
        );
        assert_eq!(
            store.allocated_blocks().collect::<Vec<_>>(),
            reserved_blocks().collect::<Vec<_>>()
        );
    }

    #[test]
    fn free_map_is_stored_inside_its_blocks() {
        let store = create_test_store();
        let mut buf = vec![0; BLOCK_SIZE_BYTES];

        // Bits BITMAP_START_BLOCK.. live in the first free map block at byte
        // BITMAP_START_BLOCK / 8.
        store.read(BITMAP_START_BLOCK, &mut buf).unwrap();
        let first = BITMAP_START_BLOCK / 8;
        assert_eq!(buf[first], 0b1100_0000);
        assert_eq!(buf[first + 1], 0b0011_1111);
        assert!(buf
            .iter()
            .enumerate()
            .all(|(i, &b)| i == first || i == first + 1 || b == 0));
    }

    #[test]
    fn allocation_is_first_fit() {
        let mut store = create_test_store();
        assert_eq!(store.allocate().unwrap(), 0);
        assert_eq!(store.allocate().unwrap(), 1);
        assert_eq!(store.allocate().unwrap(), 2);

        store.release(1).unwrap();
        assert_eq!(store.allocate().unwrap(), 1);
        assert_eq!(store.allocate().unwrap(), 3);
    }

    #[test]
    fn allocation_skips_free_map_blocks() {
        let mut store = create_test_store();
        for expected in 0..BITMAP_START_BLOCK {
            assert_eq!(store.allocate().unwrap(), expected);
        }
        assert_eq!(
            store.allocate().unwrap(),
            BITMAP_START_BLOCK + BITMAP_NUM_BLOCKS
        );
    }

    #[test]
    fn release_restores_free_count() {
        let mut store = create_test_store();
        let before = store.free_blocks();

        let block = store.allocate().unwrap();
        assert_eq!(store.free_blocks(), before - 1);
        assert!(store.is_allocated(block));

        store.release(block).unwrap();
        assert_eq!(store.free_blocks(), before);
        assert!(!store.is_allocated(block));
    }

    #[test]
    fn releasing_free_or_out_of_range_block_is_noop() {
        let mut store = create_test_store();
        store.release(5).unwrap();
        store.release(BLOCK_STORE_NUM_BLOCKS).unwrap();
        store.release(usize::MAX).unwrap();
        assert_eq!(store.used_blocks(), BITMAP_NUM_BLOCKS);
    }

    #[test]
    fn free_map_blocks_cannot_be_released() {
        let mut store = create_test_store();
        for block in reserved_blocks() {
            match store.release(block) {
                Err(BlockStoreError::Reserved(b)) => assert_eq!(b, block),
                other => panic!("expected reserved error, got {:?}", other),
            }
            assert!(store.is_allocated(block));
        }
        assert_eq!(store.used_blocks(), BITMAP_NUM_BLOCKS);
    }

    #[test]
    fn request_claims_specific_block_once() {
        let mut store = create_test_store();
        store.request(42).unwrap();
        assert!(store.is_allocated(42));
        assert_eq!(store.used_blocks(), BITMAP_NUM_BLOCKS + 1);

        match store.request(42) {
            Err(BlockStoreError::AlreadyAllocated(42)) => (),
            other => panic!("expected already allocated, got {:?}", other),
        }
        assert_eq!(store.used_blocks(), BITMAP_NUM_BLOCKS + 1);
    }

    #[test]
    fn request_rejects_reserved_and_out_of_range_blocks() {
        let mut store = create_test_store();
        for block in reserved_blocks() {
            assert!(matches!(
                store.request(block),
                Err(BlockStoreError::Reserved(_))
            ));
        }
        assert!(matches!(
            store.request(BLOCK_STORE_NUM_BLOCKS),
            Err(BlockStoreError::OutOfRange(_))
        ));
        assert_eq!(store.used_blocks(), BITMAP_NUM_BLOCKS);
    }

    #[test]
    fn saturated_store_reports_no_space() {
        let mut store = create_test_store();
        for block in 0..BLOCK_STORE_NUM_BLOCKS {
            if !is_reserved(block) {
                store.request(block).unwrap();
            }
        }
        assert_eq!(store.free_blocks(), 0);
        assert!(matches!(store.allocate(), Err(BlockStoreError::NoSpace)));
    }

    #[test]
    fn can_read_and_write_start_and_end_blocks() {
        let mut store = create_test_store();

        for &block in &[0, BITMAP_START_BLOCK + 1, BLOCK_STORE_NUM_BLOCKS - 1] {
            let data = vec![(block % 251) as u8 + 1; BLOCK_SIZE_BYTES];
            assert_eq!(store.write(block, &data).unwrap(), BLOCK_SIZE_BYTES);

            let mut read_block = vec![0x00; BLOCK_SIZE_BYTES];
            assert_eq!(store.read(block, &mut read_block).unwrap(), BLOCK_SIZE_BYTES);
            assert_eq!(read_block, data);
        }
    }

    #[test]
    fn io_beyond_range_returns_error() {
        let mut store = create_test_store();
        let mut block = vec![0x55; BLOCK_SIZE_BYTES];

        assert!(matches!(
            store.write(BLOCK_STORE_NUM_BLOCKS, &block),
            Err(BlockStoreError::OutOfRange(_))
        ));
        assert!(matches!(
            store.read(BLOCK_STORE_NUM_BLOCKS, &mut block),
            Err(BlockStoreError::OutOfRange(_))
        ));
        // The caller's buffer is untouched on failure.
        assert_eq!(block, vec![0x55; BLOCK_SIZE_BYTES]);
    }

    #[test]
    fn partial_blocks_are_rejected() {
        let mut store = create_test_store();
        let half = vec![0x55; BLOCK_SIZE_BYTES / 2];
        assert!(matches!(
            store.write(0, &half),
            Err(BlockStoreError::BufferTooSmall { .. })
        ));

        let mut read_block = vec![0x00; BLOCK_SIZE_BYTES];
        store.read(0, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x00; BLOCK_SIZE_BYTES]);
    }

    #[test]
    fn oversized_buffers_transfer_one_block() {
        let mut store = create_test_store();
        let data = vec![0x55; BLOCK_SIZE_BYTES * 2];
        assert_eq!(store.write(7, &data).unwrap(), BLOCK_SIZE_BYTES);

        let mut read_block = vec![0x00; BLOCK_SIZE_BYTES + 3];
        assert_eq!(store.read(8, &mut read_block).unwrap(), BLOCK_SIZE_BYTES);
        assert_eq!(read_block, vec![0x00; BLOCK_SIZE_BYTES + 3]);

        store.read(7, &mut read_block).unwrap();
        assert_eq!(&read_block[..BLOCK_SIZE_BYTES], &data[..BLOCK_SIZE_BYTES]);
        assert_eq!(&read_block[BLOCK_SIZE_BYTES..], &[0, 0, 0]);
    }

    #[test]
    fn total_blocks_matches_layout() {
        assert_eq!(BlockStore::total_blocks(), BLOCK_STORE_NUM_BLOCKS);
        let store = create_test_store();
        assert_eq!(store.block_count(), BLOCK_STORE_NUM_BLOCKS);
        assert_eq!(
            store.used_blocks() + store.free_blocks(),
            BlockStore::total_blocks()
        );
    }
}
