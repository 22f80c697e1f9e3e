//! sesparse Core Library
//!
//! This crate decodes SESparse virtual disk deltas, the sparse format ESXi
//! uses for snapshot children of large disks, without ever writing to them.
//!
//! # Overview
//!
//! A delta stores grains of 4 KiB through a two-level index: a grain
//! directory pointing at grain tables, and grain tables pointing at grain
//! data or marking grains as zero, unmapped, or inherited. Each delta is
//! exposed as a [`BlockDevice`] of 2 MiB blocks in VHD dynamic disk layout,
//! merged grain by grain over its parent device, so a whole snapshot chain
//! reads like a single disk.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`source`] - Byte-range access to disk files
//! - [`header`] - Header parsing into a [`Geometry`]
//! - [`entry`] - Tagged grain directory and grain table entries
//! - [`index`] - Grain directory walk producing an [`Overlay`]
//! - [`block`] - 2 MiB blocks
//! - [`device`] - The block-device contract and base devices
//! - [`layer`] - SESparse layers and chains
//! - [`vhd`] - VHD footer and header for decoded disks

pub mod block;
pub mod device;
pub mod entry;
pub mod error;
pub mod header;
pub mod index;
pub mod layer;
pub mod source;
pub mod vhd;

pub use error::{BoxError, Error, Result};

pub use block::{Block, BITMAP_SIZE, BLOCK_SIZE, GRAINS_PER_BLOCK};
pub use device::{BlockDevice, FlatDisk, ZeroDisk};
pub use entry::{DirectoryEntry, DirectoryKind, GrainKind, TableEntry};
pub use header::{parse_header, Geometry, GRAIN_SIZE, SECTOR_SIZE};
pub use index::{build_overlay, GrainSlot, Overlay, SlotStats};
pub use layer::{open_chain, read_geometry, LayerState, OpenOptions, SparseDiskLayer};
pub use source::{ByteRangeSource, MemorySource, MmapSource};
pub use vhd::{ChsGeometry, ContainerConverter, VhdConverter, VhdFooter, VhdHeader};
