//! Grain directory walk and the per-block overlay it produces.

use std::collections::hash_map::{Entry, HashMap};
use std::num::NonZeroU64;

use tracing::{info, trace};

use crate::block::GRAINS_PER_BLOCK;
use crate::entry::{read_raw, DirectoryEntry, DirectoryKind, GrainKind, TableEntry, ENTRY_SIZE};
use crate::error::{Error, Result};
use crate::header::{Geometry, MAX_SAFE_OFFSET};
use crate::source::{read_range, ByteRangeSource};

/// Number of 2 MiB blocks covered by one grain directory entry.
pub const BLOCKS_PER_DIRECTORY_ENTRY: u64 = 8;

/// What a layer asserts about one grain of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrainSlot {
    /// Grain data lives in this layer at the given byte offset.
    Allocated(NonZeroU64),
    /// Fall through to the parent.
    NonAllocated,
    /// Unmapped by the guest; reads as zeros.
    Unmapped,
    /// Reads as zeros.
    Zero,
}

/// Grain counts for one block of an overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub allocated: usize,
    pub zero: usize,
    pub unmapped: usize,
    pub non_allocated: usize,
}

impl SlotStats {
    /// Tallies a block's slots.
    pub fn of(slots: &[GrainSlot]) -> Self {
        let mut stats = Self::default();
        for slot in slots {
            match slot {
                GrainSlot::Allocated(_) => stats.allocated += 1,
                GrainSlot::Zero => stats.zero += 1,
                GrainSlot::Unmapped => stats.unmapped += 1,
                GrainSlot::NonAllocated => stats.non_allocated += 1,
            }
        }
        stats
    }
}

/// Grain modifications a layer asserts onto its parent, keyed by block id.
///
/// Each present block holds exactly [`GRAINS_PER_BLOCK`] slots. Blocks
/// without an entry are entirely inherited from the parent.
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    blocks: HashMap<u64, Box<[GrainSlot]>>,
}

impl Overlay {
    /// Slots for a block, if this layer has any.
    pub fn get(&self, block_id: u64) -> Option<&[GrainSlot]> {
        self.blocks.get(&block_id).map(|slots| &slots[..])
    }

    /// Whether this layer has an entry for the block.
    pub fn contains(&self, block_id: u64) -> bool {
        self.blocks.contains_key(&block_id)
    }

    /// Number of blocks with an entry.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True when no block is overlaid.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block ids with an entry, in ascending order.
    pub fn block_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.blocks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn insert(&mut self, block_id: u64, slots: Vec<GrainSlot>) -> Result<()> {
        if slots.len() != GRAINS_PER_BLOCK {
            return Err(Error::format(format!(
                "block {} has {} grain slots, expected {}",
                block_id,
                slots.len(),
                GRAINS_PER_BLOCK
            )));
        }
        match self.blocks.entry(block_id) {
            Entry::Occupied(_) => Err(Error::format(format!(
                "block {block_id} is described by more than one grain table"
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(slots.into_boxed_slice());
                Ok(())
            }
        }
    }
}

/// Turns a decoded table entry into an overlay slot.
fn slot_for(entry: TableEntry, geometry: &Geometry) -> Result<GrainSlot> {
    match entry.kind {
        GrainKind::NonAllocated => Ok(GrainSlot::NonAllocated),
        GrainKind::Unmapped => Ok(GrainSlot::Unmapped),
        GrainKind::Zero => Ok(GrainSlot::Zero),
        GrainKind::Allocated => {
            let offset = entry
                .grain_index
                .checked_mul(geometry.grain_size_bytes)
                .and_then(|bytes| bytes.checked_add(geometry.grain_offset_bytes))
                .filter(|offset| *offset <= MAX_SAFE_OFFSET)
                .ok_or_else(|| {
                    Error::format(format!(
                        "grain index {} is out of range",
                        entry.grain_index
                    ))
                })?;
            NonZeroU64::new(offset).map(GrainSlot::Allocated).ok_or_else(|| {
                Error::format(format!(
                    "grain index {} resolves to offset zero",
                    entry.grain_index
                ))
            })
        }
    }
}

/// Walks the grain directory and its tables and builds the overlay.
///
/// The directory is fetched in one range read, then every allocated grain
/// table with its own range read. Unallocated directory entries are skipped,
/// leaving the blocks they cover without an overlay entry.
pub async fn build_overlay(source: &dyn ByteRangeSource, geometry: &Geometry) -> Result<Overlay> {
    let directory = read_range(
        source,
        geometry.grain_dir_offset_bytes,
        geometry.grain_dir_count * ENTRY_SIZE,
    )
    .await?;

    let table_size = geometry.grain_table_size_bytes();
    let mut overlay = Overlay::default();
    let mut tables = 0usize;

    for directory_index in 0..geometry.grain_dir_count as usize {
        let dir_entry = DirectoryEntry::decode(read_raw(&directory, directory_index))?;
        if dir_entry.kind == DirectoryKind::NonAllocated {
            continue;
        }

        let table_offset = dir_entry
            .table_index
            .checked_mul(table_size)
            .and_then(|bytes| bytes.checked_add(geometry.grain_table_offset_bytes))
            .filter(|offset| *offset <= MAX_SAFE_OFFSET)
            .ok_or_else(|| {
                Error::format(format!(
                    "grain table index {} is out of range",
                    dir_entry.table_index
                ))
            })?;
        trace!(directory_index, table_offset, "reading grain table");
        let table = read_range(source, table_offset, table_size).await?;
        tables += 1;

        let mut block_id = directory_index as u64 * BLOCKS_PER_DIRECTORY_ENTRY;
        let mut slots = Vec::with_capacity(GRAINS_PER_BLOCK);
        for table_index in 0..geometry.grain_table_count as usize {
            let entry = TableEntry::decode(read_raw(&table, table_index))?;
            slots.push(slot_for(entry, geometry)?);
            if slots.len() == GRAINS_PER_BLOCK {
                let sealed = std::mem::replace(&mut slots, Vec::with_capacity(GRAINS_PER_BLOCK));
                overlay.insert(block_id, sealed)?;
                block_id += 1;
            }
        }

        if !slots.is_empty() {
            return Err(Error::format(format!(
                "grain table for directory entry {} leaves {} grains outside a full block",
                directory_index,
                slots.len()
            )));
        }
    }

    info!(
        tables,
        blocks = overlay.len(),
        "built SESparse grain overlay"
    );

    Ok(overlay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            grain_size_bytes: 4096,
            grain_dir_offset_bytes: 2048,
            grain_dir_size_bytes: 512,
            grain_dir_count: 64,
            grain_table_offset_bytes: 4096,
            grain_table_count: 4096,
            grain_offset_bytes: 1 << 20,
            disk_size_bytes: 1 << 30,
            flags: 0,
        }
    }

    #[test]
    fn test_slot_for_allocated_offset() {
        let entry = TableEntry {
            kind: GrainKind::Allocated,
            grain_index: 3,
        };
        let slot = slot_for(entry, &geometry()).unwrap();
        assert_eq!(
            slot,
            GrainSlot::Allocated(NonZeroU64::new(3 * 4096 + (1 << 20)).unwrap())
        );
    }

    #[test]
    fn test_slot_for_sentinels() {
        for (kind, expected) in [
            (GrainKind::NonAllocated, GrainSlot::NonAllocated),
            (GrainKind::Unmapped, GrainSlot::Unmapped),
            (GrainKind::Zero, GrainSlot::Zero),
        ] {
            let entry = TableEntry {
                kind,
                grain_index: 99,
            };
            assert_eq!(slot_for(entry, &geometry()).unwrap(), expected);
        }
    }

    #[test]
    fn test_slot_for_zero_offset_is_corruption() {
        let mut geometry = geometry();
        geometry.grain_offset_bytes = 0;
        let entry = TableEntry {
            kind: GrainKind::Allocated,
            grain_index: 0,
        };
        assert!(slot_for(entry, &geometry).unwrap_err().is_format());
    }

    #[test]
    fn test_slot_for_beyond_safe_range() {
        let entry = TableEntry {
            kind: GrainKind::Allocated,
            grain_index: 1 << 42,
        };
        assert!(slot_for(entry, &geometry()).unwrap_err().is_format());
    }

    #[test]
    fn test_overlay_rejects_duplicates_and_wrong_counts() {
        let mut overlay = Overlay::default();
        overlay
            .insert(4, vec![GrainSlot::Zero; GRAINS_PER_BLOCK])
            .unwrap();
        assert!(overlay
            .insert(4, vec![GrainSlot::Zero; GRAINS_PER_BLOCK])
            .unwrap_err()
            .is_format());
        assert!(overlay
            .insert(5, vec![GrainSlot::Zero; 511])
            .unwrap_err()
            .is_format());
        assert_eq!(overlay.block_ids(), vec![4]);
    }

    #[test]
    fn test_slot_stats() {
        let mut slots = vec![GrainSlot::NonAllocated; GRAINS_PER_BLOCK];
        slots[0] = GrainSlot::Zero;
        slots[1] = GrainSlot::Unmapped;
        slots[2] = GrainSlot::Allocated(NonZeroU64::new(4096).unwrap());
        let stats = SlotStats::of(&slots);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.zero, 1);
        assert_eq!(stats.unmapped, 1);
        assert_eq!(stats.non_allocated, 509);
    }
}
