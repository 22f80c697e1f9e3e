//! SESparse delta layers.
//!
//! A [`SparseDiskLayer`] presents one SESparse file as a [`BlockDevice`]
//! stacked on a parent device. Opening a layer only reads its header; the
//! grain overlay is built on an explicit [`SparseDiskLayer::build_index`]
//! call, since many opened layers are only used for containment checks.
//!
//! # Example
//!
//! ```no_run
//! use sesparse_core::{BlockDevice, MmapSource, OpenOptions, SparseDiskLayer, ZeroDisk};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> sesparse_core::Result<()> {
//! let source = Arc::new(MmapSource::open(Path::new("disk-000001-sesparse.vmdk"))?);
//! let parent = Arc::new(ZeroDisk::new(10 * 1024 * 1024 * 1024));
//! let mut layer = SparseDiskLayer::open(source, parent, OpenOptions::default()).await?;
//! layer.build_index().await?;
//!
//! let block = layer.read_block(0).await?;
//! println!("first block has {} data bytes", block.data().len());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::debug;

use crate::block::{Block, BITMAP_SIZE};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::header::{parse_header, Geometry, HEADER_PREFIX_SIZE};
use crate::index::{build_overlay, GrainSlot, Overlay};
use crate::source::{read_range, ByteRangeSource};
use crate::vhd::{
    container_metadata, vhd_timestamp, ContainerConverter, VhdConverter, VhdFooter, VhdHeader,
};

/// Options for opening a layer.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Report blocks missing from this layer as present when an ancestor
    /// holds them.
    pub look_missing_block_in_parent: bool,
    /// Creation time written to the VHD footer. Defaults to now.
    pub timestamp: Option<SystemTime>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            look_missing_block_in_parent: true,
            timestamp: None,
        }
    }
}

impl OpenOptions {
    /// Create new open options with specified settings.
    pub fn new(look_missing_block_in_parent: bool, timestamp: Option<SystemTime>) -> Self {
        Self {
            look_missing_block_in_parent,
            timestamp,
        }
    }

    /// Options that only consider this layer's own blocks.
    pub fn own_blocks_only() -> Self {
        Self {
            look_missing_block_in_parent: false,
            timestamp: None,
        }
    }
}

/// Lifecycle of a layer. There are no backward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    /// Header parsed; only the geometry is available.
    HeaderParsed,
    /// Overlay built; blocks can be read.
    IndexBuilt,
}

/// Fetches and parses the header of a SESparse file.
pub async fn read_geometry(source: &dyn ByteRangeSource) -> Result<Geometry> {
    let prefix = read_range(source, 0, HEADER_PREFIX_SIZE as u64).await?;
    parse_header(&prefix)
}

/// One SESparse delta stacked on a parent device.
pub struct SparseDiskLayer {
    source: Arc<dyn ByteRangeSource>,
    parent: Arc<dyn BlockDevice>,
    look_missing_block_in_parent: bool,
    geometry: Geometry,
    header: VhdHeader,
    footer: VhdFooter,
    overlay: Option<Overlay>,
}

impl SparseDiskLayer {
    /// Opens a layer, reading only its header.
    ///
    /// VHD metadata is built with the standard [`VhdConverter`].
    ///
    /// # Arguments
    ///
    /// * `source` - Byte ranges of the SESparse file.
    /// * `parent` - The device this delta was taken from.
    /// * `options` - Containment and timestamp settings.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the header cannot be fetched, and a
    /// format error if it does not describe a SESparse image.
    pub async fn open(
        source: Arc<dyn ByteRangeSource>,
        parent: Arc<dyn BlockDevice>,
        options: OpenOptions,
    ) -> Result<Self> {
        Self::open_with(source, parent, options, &VhdConverter).await
    }

    /// Opens a layer, building its VHD metadata through `converter`.
    pub async fn open_with(
        source: Arc<dyn ByteRangeSource>,
        parent: Arc<dyn BlockDevice>,
        options: OpenOptions,
        converter: &dyn ContainerConverter,
    ) -> Result<Self> {
        let geometry = read_geometry(source.as_ref()).await?;
        let timestamp = vhd_timestamp(options.timestamp.unwrap_or_else(SystemTime::now));
        let (header, footer) = container_metadata(converter, geometry.disk_size_bytes, timestamp);

        Ok(Self {
            source,
            parent,
            look_missing_block_in_parent: options.look_missing_block_in_parent,
            geometry,
            header,
            footer,
            overlay: None,
        })
    }

    /// Geometry parsed from the header.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Whether the grain index has been built yet.
    pub fn state(&self) -> LayerState {
        if self.overlay.is_some() {
            LayerState::IndexBuilt
        } else {
            LayerState::HeaderParsed
        }
    }

    /// Reads the grain directory and tables.
    ///
    /// The overlay is write-once.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The index is already built (precondition error)
    /// - A directory or table entry is corrupt (format error)
    /// - A range fetch fails (transport error)
    pub async fn build_index(&mut self) -> Result<()> {
        if self.overlay.is_some() {
            return Err(Error::precondition("grain index is already built"));
        }
        let overlay = build_overlay(self.source.as_ref(), &self.geometry).await?;
        self.overlay = Some(overlay);
        Ok(())
    }

    /// The overlay built by [`Self::build_index`].
    pub fn overlay(&self) -> Result<&Overlay> {
        self.overlay.as_ref().ok_or_else(|| {
            Error::precondition("grain index must be built before blocks can be queried")
        })
    }

    async fn read_grain(&self, offset: u64) -> Result<bytes::Bytes> {
        read_range(self.source.as_ref(), offset, self.geometry.grain_size_bytes).await
    }
}

#[async_trait]
impl BlockDevice for SparseDiskLayer {
    fn contains_block(&self, block_id: u64) -> Result<bool> {
        if self.overlay()?.contains(block_id) {
            return Ok(true);
        }
        if self.look_missing_block_in_parent {
            return self.parent.contains_block(block_id);
        }
        Ok(false)
    }

    async fn read_block(&self, block_id: u64) -> Result<Arc<Block>> {
        let overlay = self.overlay()?;

        // The parent is always read, even when this layer has no entry.
        let parent_block = self.parent.read_block(block_id).await?;
        let Some(slots) = overlay.get(block_id) else {
            return Ok(parent_block);
        };

        let grain_size = self.geometry.grain_size_bytes as usize;
        let mut merged: Option<Vec<u8>> = None;

        for (index, slot) in slots.iter().enumerate() {
            let position = BITMAP_SIZE + index * grain_size;
            match *slot {
                GrainSlot::Allocated(offset) => {
                    let grain = self.read_grain(offset.get()).await?;
                    let buffer = merged.get_or_insert_with(|| parent_block.buffer().to_vec());
                    buffer[position..position + grain_size].copy_from_slice(&grain);
                }
                GrainSlot::Zero | GrainSlot::Unmapped => {
                    let buffer = merged.get_or_insert_with(|| parent_block.buffer().to_vec());
                    buffer[position..position + grain_size].fill(0);
                }
                GrainSlot::NonAllocated => {}
            }
        }

        match merged {
            Some(buffer) => {
                debug!(block_id, "merged SESparse grains over parent block");
                Ok(Arc::new(Block::new(block_id, buffer)?))
            }
            None => Ok(parent_block),
        }
    }

    fn header(&self) -> &VhdHeader {
        &self.header
    }

    fn footer(&self) -> &VhdFooter {
        &self.footer
    }
}

/// Opens and indexes a chain of deltas, oldest first, on top of `base`.
///
/// Returns the newest layer.
pub async fn open_chain(
    sources: Vec<Arc<dyn ByteRangeSource>>,
    base: Arc<dyn BlockDevice>,
    options: OpenOptions,
) -> Result<Arc<SparseDiskLayer>> {
    let mut parent = base;
    let mut top = None;
    for source in sources {
        let mut layer = SparseDiskLayer::open(source, parent, options.clone()).await?;
        layer.build_index().await?;
        let layer = Arc::new(layer);
        parent = Arc::clone(&layer) as Arc<dyn BlockDevice>;
        top = Some(layer);
    }
    top.ok_or_else(|| Error::precondition("a chain needs at least one SESparse layer"))
}
