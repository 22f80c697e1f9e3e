//! 2 MiB blocks in the layout of a VHD dynamic disk.

use crate::error::{Error, Result};

/// Size of the data part of a block (2 MiB).
pub const BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Size of the sector bitmap stored in front of each block's data.
pub const BITMAP_SIZE: usize = 512;

/// Number of 4 KiB grains in one block.
pub const GRAINS_PER_BLOCK: usize = 512;

/// Full size of a block buffer: bitmap followed by data.
pub const BLOCK_BUFFER_SIZE: usize = BITMAP_SIZE + BLOCK_SIZE as usize;

/// One 2 MiB block of a virtual disk.
///
/// The buffer holds the 512-byte sector bitmap followed by the block data.
/// Blocks are handed out as `Arc<Block>` so layers can pass a parent's block
/// through without copying it.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    id: u64,
    buffer: Vec<u8>,
}

impl Block {
    /// Wraps a bitmap-prefixed buffer.
    pub fn new(id: u64, buffer: Vec<u8>) -> Result<Self> {
        if buffer.len() != BLOCK_BUFFER_SIZE {
            return Err(Error::format(format!(
                "block {} buffer has {} bytes, expected {}",
                id,
                buffer.len(),
                BLOCK_BUFFER_SIZE
            )));
        }
        Ok(Self { id, buffer })
    }

    /// A block of zeros whose bitmap marks every sector as present.
    pub fn zeroed(id: u64) -> Self {
        let mut buffer = vec![0u8; BLOCK_BUFFER_SIZE];
        buffer[..BITMAP_SIZE].fill(0xFF);
        Self { id, buffer }
    }

    /// The block number (byte offset / 2 MiB).
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The sector bitmap.
    #[inline]
    pub fn bitmap(&self) -> &[u8] {
        &self.buffer[..BITMAP_SIZE]
    }

    /// The 2 MiB of block data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buffer[BITMAP_SIZE..]
    }

    /// Bitmap and data as one contiguous buffer.
    #[inline]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("len", &self.buffer.len())
            .finish()
    }
}
