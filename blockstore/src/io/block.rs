use std::path::Path;

use crate::layout::BlockId;
use crate::store::Result;

/// The block level interface a file system mounts on top of. Tried to map as
/// closely as possible to the prescribed interface found here:
/// http://web.mit.edu/6.033/1997/handouts/html/04sfs.html.
///
/// Blocks are always transferred whole, there is no partial block I/O.
pub trait BlockStorage {
    /// The number of addressable blocks, reserved ones included.
    fn block_count(&self) -> usize;
    /// Reads disk block number into provided buffer, returning the number of
    /// bytes copied.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range, or into a buffer smaller than a
    /// block, will return an error.
    fn read_block(&self, blocknr: BlockId, buf: &mut [u8]) -> Result<usize>;
    /// Writes the leading block's worth of the provided buffer into the specified
    /// block number.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range, or from a buffer smaller than a
    /// block, will return an error.
    fn write_block(&mut self, blocknr: BlockId, buf: &[u8]) -> Result<usize>;
    /// Flush the whole disk to `dest`. This must complete before the disk is
    /// considered durable, for instance, if being re-read from disk.
    fn sync_disk(&mut self, dest: &Path) -> Result<usize>;
}
