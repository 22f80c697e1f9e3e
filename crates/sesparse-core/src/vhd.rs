//! VHD dynamic disk metadata for decoded disks.
//!
//! Blocks produced by this crate follow the VHD dynamic disk layout, and the
//! backup target needs a matching footer and dynamic header. Both are
//! described by value here and serialized big-endian with `to_bytes()`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::BLOCK_SIZE;
use crate::header::SECTOR_SIZE;

/// Size of a serialized VHD footer.
pub const FOOTER_SIZE: usize = 512;

/// Size of a serialized dynamic disk header.
pub const HEADER_SIZE: usize = 1024;

/// Footer cookie.
pub const FOOTER_COOKIE: &[u8; 8] = b"conectix";

/// Dynamic disk header cookie.
pub const HEADER_COOKIE: &[u8; 8] = b"cxsparse";

/// Disk type value for dynamic disks.
pub const DISK_TYPE_DYNAMIC: u32 = 3;

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z.
const VHD_EPOCH_OFFSET: u64 = 946_684_800;

const FEATURES_RESERVED: u32 = 2;
const FILE_FORMAT_VERSION: u32 = 0x0001_0000;
const HEADER_VERSION: u32 = 0x0001_0000;
const CREATOR_APPLICATION: &[u8; 4] = b"sesp";
const CREATOR_VERSION: u32 = 0x0001_0000;
const CREATOR_HOST_OS: u32 = 0x5769_326B; // "Wi2k"

/// Largest CHS geometry a VHD can describe.
const MAX_CHS_SECTORS: u64 = 65535 * 16 * 255;

/// Cylinder/head/sector geometry of a VHD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChsGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl ChsGeometry {
    /// Computes the geometry for a disk of `size_bytes`.
    ///
    /// Follows the VHD specification, rounding the cylinder count up so the
    /// geometry always covers the whole disk (up to the CHS maximum).
    pub fn for_size(size_bytes: u64) -> Self {
        let total_sectors = size_bytes.div_ceil(SECTOR_SIZE).min(MAX_CHS_SECTORS);

        let (sectors_per_track, heads) = if total_sectors >= 65535 * 16 * 63 {
            (255, 16)
        } else {
            let mut sectors_per_track = 17;
            // floor((total / spt + 1023) / 1024) without leaving integers
            let mut heads = ((total_sectors + 1023 * sectors_per_track)
                / (1024 * sectors_per_track))
                .max(4);
            if total_sectors >= heads * 1024 * sectors_per_track || heads > 16 {
                sectors_per_track = 31;
                heads = 16;
            }
            if total_sectors >= heads * 1024 * sectors_per_track {
                sectors_per_track = 63;
                heads = 16;
            }
            (sectors_per_track, heads)
        };

        let cylinders = total_sectors.div_ceil(sectors_per_track * heads);

        Self {
            cylinders: cylinders as u16,
            heads: heads as u8,
            sectors_per_track: sectors_per_track as u8,
        }
    }

    /// Number of bytes addressable with this geometry.
    pub fn actual_size(&self) -> u64 {
        u64::from(self.cylinders)
            * u64::from(self.heads)
            * u64::from(self.sectors_per_track)
            * SECTOR_SIZE
    }
}

/// Converts a point in time to VHD seconds since 2000-01-01.
pub fn vhd_timestamp(time: SystemTime) -> u32 {
    let unix = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix.saturating_sub(VHD_EPOCH_OFFSET).min(u64::from(u32::MAX)) as u32
}

/// One's complement of the byte sum, as used by both VHD structures.
fn checksum(bytes: &[u8]) -> u32 {
    !bytes
        .iter()
        .fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b)))
}

/// VHD hard disk footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdFooter {
    /// Offset of the dynamic header.
    pub data_offset: u64,
    /// Creation time, seconds since 2000-01-01.
    pub timestamp: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: ChsGeometry,
    pub disk_type: u32,
    pub unique_id: [u8; 16],
}

impl VhdFooter {
    /// Serializes the footer to 512 bytes, checksum included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; FOOTER_SIZE];

        buf[0..8].copy_from_slice(FOOTER_COOKIE);
        buf[8..12].copy_from_slice(&FEATURES_RESERVED.to_be_bytes());
        buf[12..16].copy_from_slice(&FILE_FORMAT_VERSION.to_be_bytes());
        buf[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[28..32].copy_from_slice(CREATOR_APPLICATION);
        buf[32..36].copy_from_slice(&CREATOR_VERSION.to_be_bytes());
        buf[36..40].copy_from_slice(&CREATOR_HOST_OS.to_be_bytes());
        buf[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        buf[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        buf[56..58].copy_from_slice(&self.geometry.cylinders.to_be_bytes());
        buf[58] = self.geometry.heads;
        buf[59] = self.geometry.sectors_per_track;
        buf[60..64].copy_from_slice(&self.disk_type.to_be_bytes());
        buf[68..84].copy_from_slice(&self.unique_id);

        let sum = checksum(&buf);
        buf[64..68].copy_from_slice(&sum.to_be_bytes());
        buf
    }
}

/// VHD dynamic disk header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdHeader {
    /// Offset of the block allocation table.
    pub table_offset: u64,
    /// Number of blocks, one allocation table entry each.
    pub max_table_entries: u32,
    pub block_size: u32,
}

impl VhdHeader {
    /// Serializes the header to 1024 bytes, checksum included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];

        buf[0..8].copy_from_slice(HEADER_COOKIE);
        buf[8..16].copy_from_slice(&u64::MAX.to_be_bytes());
        buf[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&HEADER_VERSION.to_be_bytes());
        buf[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        buf[32..36].copy_from_slice(&self.block_size.to_be_bytes());

        let sum = checksum(&buf);
        buf[36..40].copy_from_slice(&sum.to_be_bytes());
        buf
    }
}

/// Builds target-container metadata for a decoded disk.
pub trait ContainerConverter: Send + Sync {
    /// Dynamic header for a disk of `block_count` 2 MiB blocks.
    fn header(&self, block_count: u32) -> VhdHeader;

    /// Footer for a disk of `size_bytes` created at `timestamp`.
    fn footer(&self, size_bytes: u64, timestamp: u32, geometry: ChsGeometry) -> VhdFooter;
}

/// Standard VHD dynamic disk layout: footer copy, header, then the table.
#[derive(Debug, Clone, Copy, Default)]
pub struct VhdConverter;

impl ContainerConverter for VhdConverter {
    fn header(&self, block_count: u32) -> VhdHeader {
        VhdHeader {
            table_offset: (FOOTER_SIZE + HEADER_SIZE) as u64,
            max_table_entries: block_count,
            block_size: BLOCK_SIZE as u32,
        }
    }

    fn footer(&self, _size_bytes: u64, timestamp: u32, geometry: ChsGeometry) -> VhdFooter {
        let actual_size = geometry.actual_size();
        VhdFooter {
            data_offset: FOOTER_SIZE as u64,
            timestamp,
            original_size: actual_size,
            current_size: actual_size,
            geometry,
            disk_type: DISK_TYPE_DYNAMIC,
            unique_id: [0u8; 16],
        }
    }
}

/// Builds header and footer for a disk through `converter`.
pub fn container_metadata(
    converter: &dyn ContainerConverter,
    size_bytes: u64,
    timestamp: u32,
) -> (VhdHeader, VhdFooter) {
    let block_count = size_bytes.div_ceil(BLOCK_SIZE).min(u64::from(u32::MAX)) as u32;
    let geometry = ChsGeometry::for_size(size_bytes);
    (
        converter.header(block_count),
        converter.footer(size_bytes, timestamp, geometry),
    )
}
