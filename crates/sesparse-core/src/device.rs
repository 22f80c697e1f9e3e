//! The block-device contract shared by every disk layer, and the base
//! devices a chain of deltas can be rooted on.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::block::{Block, BITMAP_SIZE, BLOCK_BUFFER_SIZE, BLOCK_SIZE};
use crate::error::Result;
use crate::source::{read_range, ByteRangeSource};
use crate::vhd::{container_metadata, vhd_timestamp, VhdConverter, VhdFooter, VhdHeader};

/// A disk readable in 2 MiB blocks.
///
/// Any layer can act as the parent of a SESparse delta, whatever its on-disk
/// format.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Whether this device, or its ancestors, hold data for the block.
    fn contains_block(&self, block_id: u64) -> Result<bool>;

    /// Reads one block.
    async fn read_block(&self, block_id: u64) -> Result<Arc<Block>>;

    /// Dynamic disk header describing this device.
    fn header(&self) -> &VhdHeader;

    /// Footer describing this device.
    fn footer(&self) -> &VhdFooter;
}

/// A disk of zeros that holds no blocks. Roots a chain with no base image.
#[derive(Debug, Clone)]
pub struct ZeroDisk {
    header: VhdHeader,
    footer: VhdFooter,
}

impl ZeroDisk {
    /// A disk of `size_bytes` zeros.
    pub fn new(size_bytes: u64) -> Self {
        let (header, footer) =
            container_metadata(&VhdConverter, size_bytes, vhd_timestamp(SystemTime::now()));
        Self { header, footer }
    }
}

#[async_trait]
impl BlockDevice for ZeroDisk {
    fn contains_block(&self, _block_id: u64) -> Result<bool> {
        Ok(false)
    }

    async fn read_block(&self, block_id: u64) -> Result<Arc<Block>> {
        Ok(Arc::new(Block::zeroed(block_id)))
    }

    fn header(&self) -> &VhdHeader {
        &self.header
    }

    fn footer(&self) -> &VhdFooter {
        &self.footer
    }
}

/// A raw flat disk image.
///
/// Holds every block within its size. The last block is padded with zeros
/// when the size is not a multiple of 2 MiB.
pub struct FlatDisk {
    source: Arc<dyn ByteRangeSource>,
    size_bytes: u64,
    header: VhdHeader,
    footer: VhdFooter,
}

impl FlatDisk {
    /// Exposes the first `size_bytes` of `source` as a disk.
    pub fn new(source: Arc<dyn ByteRangeSource>, size_bytes: u64) -> Self {
        let (header, footer) =
            container_metadata(&VhdConverter, size_bytes, vhd_timestamp(SystemTime::now()));
        Self {
            source,
            size_bytes,
            header,
            footer,
        }
    }

    fn block_count(&self) -> u64 {
        self.size_bytes.div_ceil(BLOCK_SIZE)
    }
}

#[async_trait]
impl BlockDevice for FlatDisk {
    fn contains_block(&self, block_id: u64) -> Result<bool> {
        Ok(block_id < self.block_count())
    }

    async fn read_block(&self, block_id: u64) -> Result<Arc<Block>> {
        if block_id >= self.block_count() {
            return Ok(Arc::new(Block::zeroed(block_id)));
        }

        let start = block_id * BLOCK_SIZE;
        let length = (self.size_bytes - start).min(BLOCK_SIZE);
        let data = read_range(self.source.as_ref(), start, length).await?;

        let mut buffer = vec![0u8; BLOCK_BUFFER_SIZE];
        buffer[..BITMAP_SIZE].fill(0xFF);
        buffer[BITMAP_SIZE..BITMAP_SIZE + data.len()].copy_from_slice(&data);
        Ok(Arc::new(Block::new(block_id, buffer)?))
    }

    fn header(&self) -> &VhdHeader {
        &self.header
    }

    fn footer(&self) -> &VhdFooter {
        &self.footer
    }
}
