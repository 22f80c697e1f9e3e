//! SESparse constant header parsing.
//!
//! The header is an array of little-endian 64-bit words at the start of the
//! file. Every size and offset in it is expressed in 512-byte sectors.

use tracing::debug;

use crate::block::BLOCK_SIZE;
use crate::entry::ENTRY_SIZE;
use crate::error::{Error, Result};

/// SESparse magic number stored in the first header word.
pub const SESPARSE_MAGIC: u64 = 0xCAFE_BABE;

/// Supported version: major 2 in the high half, minor 1 in the low half.
pub const SESPARSE_VERSION: u64 = 0x0000_0002_0000_0001;

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// The only grain size this generation of the format uses.
pub const GRAIN_SIZE: u64 = 4096;

/// Number of bytes read from the start of the file to parse the header.
pub const HEADER_PREFIX_SIZE: usize = 2048;

/// Largest byte offset accepted from the header or grain tables (2^53 - 1).
pub const MAX_SAFE_OFFSET: u64 = (1 << 53) - 1;

const WORD_MAGIC: usize = 0;
const WORD_VERSION: usize = 1;
const WORD_CAPACITY: usize = 2;
const WORD_GRAIN_SIZE: usize = 3;
const WORD_GRAIN_TABLE_SIZE: usize = 4;
const WORD_FLAGS: usize = 5;
const WORD_GRAIN_DIR_OFFSET: usize = 16;
const WORD_GRAIN_DIR_SIZE: usize = 17;
const WORD_GRAIN_TABLES_OFFSET: usize = 18;
const WORD_GRAINS_OFFSET: usize = 24;

/// Layout of a SESparse file, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Size of one grain (always [`GRAIN_SIZE`]).
    pub grain_size_bytes: u64,
    /// Start of the grain directory.
    pub grain_dir_offset_bytes: u64,
    /// Size of the grain directory.
    pub grain_dir_size_bytes: u64,
    /// Number of 64-bit entries in the grain directory.
    pub grain_dir_count: u64,
    /// Start of the grain tables region.
    pub grain_table_offset_bytes: u64,
    /// Number of 64-bit entries in each grain table.
    pub grain_table_count: u64,
    /// Start of the grain data region.
    pub grain_offset_bytes: u64,
    /// Virtual disk size.
    pub disk_size_bytes: u64,
    /// Raw header flags.
    pub flags: u64,
}

impl Geometry {
    /// Size of one grain table in bytes.
    pub fn grain_table_size_bytes(&self) -> u64 {
        self.grain_table_count * ENTRY_SIZE
    }

    /// Number of 2 MiB blocks needed to cover the virtual disk.
    pub fn block_count(&self) -> u64 {
        self.disk_size_bytes.div_ceil(BLOCK_SIZE)
    }
}

fn word(data: &[u8], index: usize) -> u64 {
    let start = index * 8;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[start..start + 8]);
    u64::from_le_bytes(bytes)
}

/// Converts a sector count read from the header into bytes.
fn sectors_to_bytes(sectors: u64, field: &str) -> Result<u64> {
    sectors
        .checked_mul(SECTOR_SIZE)
        .filter(|bytes| *bytes <= MAX_SAFE_OFFSET)
        .ok_or_else(|| Error::format(format!("{field} of {sectors} sectors is out of range")))
}

/// Parses the header prefix of a SESparse file.
///
/// Only the first [`HEADER_PREFIX_SIZE`] bytes are looked at.
///
/// # Arguments
///
/// * `data` - The start of the file, at least [`HEADER_PREFIX_SIZE`] bytes.
///
/// # Errors
///
/// Returns a format error if:
/// - The buffer is shorter than the header prefix
/// - The magic or the version do not match
/// - The grain size is not 4 KiB
/// - A sector field does not fit in a safe byte offset
pub fn parse_header(data: &[u8]) -> Result<Geometry> {
    if data.len() < HEADER_PREFIX_SIZE {
        return Err(Error::format(format!(
            "SESparse header too short: expected {} bytes, got {}",
            HEADER_PREFIX_SIZE,
            data.len()
        )));
    }

    let magic = word(data, WORD_MAGIC);
    if magic != SESPARSE_MAGIC {
        return Err(Error::format(format!(
            "Invalid SESparse magic: expected 0x{:X}, got 0x{:X}",
            SESPARSE_MAGIC, magic
        )));
    }

    let version = word(data, WORD_VERSION);
    if version != SESPARSE_VERSION {
        return Err(Error::format(format!(
            "Unsupported SESparse version {}.{}",
            version >> 32,
            version & 0xFFFF_FFFF
        )));
    }

    let grain_size_bytes = sectors_to_bytes(word(data, WORD_GRAIN_SIZE), "grain size")?;
    if grain_size_bytes != GRAIN_SIZE {
        return Err(Error::format(format!(
            "Unsupported grain size: expected {} bytes, got {}",
            GRAIN_SIZE, grain_size_bytes
        )));
    }

    let grain_dir_offset_bytes =
        sectors_to_bytes(word(data, WORD_GRAIN_DIR_OFFSET), "grain directory offset")?;
    let grain_dir_size_bytes =
        sectors_to_bytes(word(data, WORD_GRAIN_DIR_SIZE), "grain directory size")?;
    let grain_table_offset_bytes =
        sectors_to_bytes(word(data, WORD_GRAIN_TABLES_OFFSET), "grain tables offset")?;
    let grain_table_size_bytes =
        sectors_to_bytes(word(data, WORD_GRAIN_TABLE_SIZE), "grain table size")?;
    let grain_offset_bytes = sectors_to_bytes(word(data, WORD_GRAINS_OFFSET), "grains offset")?;
    let disk_size_bytes = sectors_to_bytes(word(data, WORD_CAPACITY), "capacity")?;

    let geometry = Geometry {
        grain_size_bytes,
        grain_dir_offset_bytes,
        grain_dir_size_bytes,
        grain_dir_count: grain_dir_size_bytes / ENTRY_SIZE,
        grain_table_offset_bytes,
        grain_table_count: grain_table_size_bytes / ENTRY_SIZE,
        grain_offset_bytes,
        disk_size_bytes,
        flags: word(data, WORD_FLAGS),
    };

    debug!(
        grain_dir_offset_bytes,
        grain_dir_size_bytes,
        grain_size_bytes,
        grain_table_offset_bytes,
        grain_table_count = geometry.grain_table_count,
        grain_offset_bytes,
        disk_size_bytes,
        "parsed SESparse header"
    );

    Ok(geometry)
}
