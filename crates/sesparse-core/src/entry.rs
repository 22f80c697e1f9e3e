//! Tagged 64-bit entries of the grain directory and grain tables.
//!
//! Both levels pack a type discriminator in the top nibble and a 60-bit
//! payload below it. Directory entries carry their payload verbatim, while
//! grain table entries store the grain index with its 12 high bits and 48
//! low bits swapped, so the two levels must be decoded differently.

use crate::error::{Error, Result};

/// Size of a directory or table entry in bytes.
pub const ENTRY_SIZE: u64 = 8;

const PAYLOAD_BITS: u32 = 60;
const PAYLOAD_MASK: u64 = (1 << PAYLOAD_BITS) - 1;
const LOW_PART_BITS: u32 = 48;
const LOW_PART_MASK: u64 = (1 << LOW_PART_BITS) - 1;
const HIGH_PART_BITS: u32 = PAYLOAD_BITS - LOW_PART_BITS;

/// Splits a raw entry into its type nibble and 60-bit payload.
fn split(raw: u64) -> (u8, u64) {
    ((raw >> PAYLOAD_BITS) as u8, raw & PAYLOAD_MASK)
}

/// Reconstructs a grain index from the payload of a grain table entry.
///
/// The top 12 bits of the payload become the low 12 bits of the index and
/// the bottom 48 bits become the high 48 bits.
pub fn rotate_grain_index(payload: u64) -> u64 {
    let payload = payload & PAYLOAD_MASK;
    let top = payload >> LOW_PART_BITS;
    let bottom = payload & LOW_PART_MASK;
    (bottom << HIGH_PART_BITS) | top
}

/// Inverse of [`rotate_grain_index`].
pub fn unrotate_grain_index(grain_index: u64) -> u64 {
    let grain_index = grain_index & PAYLOAD_MASK;
    let low = grain_index & ((1 << HIGH_PART_BITS) - 1);
    let high = grain_index >> HIGH_PART_BITS;
    (low << LOW_PART_BITS) | high
}

/// State of a grain directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DirectoryKind {
    /// No grain table exists for this range.
    NonAllocated = 0,
    /// A grain table exists at the entry's table index.
    Allocated = 1,
}

/// A decoded grain directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub kind: DirectoryKind,
    pub table_index: u64,
}

impl DirectoryEntry {
    /// Decodes a raw little-endian directory entry.
    pub fn decode(raw: u64) -> Result<Self> {
        let (tag, payload) = split(raw);
        let kind = match tag {
            0 => DirectoryKind::NonAllocated,
            1 => DirectoryKind::Allocated,
            other => {
                return Err(Error::format(format!(
                    "unrecognized grain directory entry type {other} (raw 0x{raw:016X})"
                )))
            }
        };
        Ok(Self {
            kind,
            table_index: payload,
        })
    }

    /// Packs the entry back into its raw form.
    pub fn encode(&self) -> u64 {
        ((self.kind as u64) << PAYLOAD_BITS) | (self.table_index & PAYLOAD_MASK)
    }
}

/// State of a single grain in a grain table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GrainKind {
    /// The grain is not stored in this layer; read it from the parent.
    NonAllocated = 0,
    /// The grain was unmapped by the guest. Reads as zeros.
    Unmapped = 1,
    /// The grain reads as zeros.
    Zero = 2,
    /// The grain data lives in this layer at the entry's grain index.
    Allocated = 3,
}

/// A decoded grain table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub kind: GrainKind,
    pub grain_index: u64,
}

impl TableEntry {
    /// Decodes a raw little-endian grain table entry.
    pub fn decode(raw: u64) -> Result<Self> {
        let (tag, payload) = split(raw);
        let kind = match tag {
            0 => GrainKind::NonAllocated,
            1 => GrainKind::Unmapped,
            2 => GrainKind::Zero,
            3 => GrainKind::Allocated,
            other => {
                return Err(Error::format(format!(
                    "unrecognized grain table entry type {other} (raw 0x{raw:016X})"
                )))
            }
        };
        Ok(Self {
            kind,
            grain_index: rotate_grain_index(payload),
        })
    }

    /// Packs the entry back into its raw on-disk form.
    pub fn encode(&self) -> u64 {
        ((self.kind as u64) << PAYLOAD_BITS) | unrotate_grain_index(self.grain_index)
    }
}

/// Reads the `index`-th little-endian entry of a directory or table buffer.
pub(crate) fn read_raw(buffer: &[u8], index: usize) -> u64 {
    let start = index * ENTRY_SIZE as usize;
    let mut word = [0u8; ENTRY_SIZE as usize];
    word.copy_from_slice(&buffer[start..start + ENTRY_SIZE as usize]);
    u64::from_le_bytes(word)
}
