//! Shared fixtures: synthetic SESparse images and test parent devices.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sesparse_core::entry::ENTRY_SIZE;
use sesparse_core::header::{SESPARSE_MAGIC, SESPARSE_VERSION};
use sesparse_core::vhd::{container_metadata, VhdConverter};
use sesparse_core::{
    Block, BlockDevice, BoxError, ByteRangeSource, DirectoryEntry, DirectoryKind, GrainKind,
    MemorySource, Result, TableEntry, VhdFooter, VhdHeader, BITMAP_SIZE, BLOCK_SIZE,
    GRAINS_PER_BLOCK,
};

pub const GRAIN: usize = 4096;
const SECTOR: u64 = 512;
const HEADER_SECTORS: u64 = 4;
const BLOCKS_PER_TABLE: u64 = 8;

/// Builds a SESparse image in memory.
///
/// Layout: 2 KiB header, grain directory, grain tables, then grain data.
pub struct ImageBuilder {
    magic: u64,
    version: u64,
    grain_size_sectors: u64,
    table_size_sectors: u64,
    grains_offset_override: Option<u64>,
    directory: Vec<u64>,
    tables: Vec<Vec<u64>>,
    table_of_directory: HashMap<usize, usize>,
    grains: Vec<Vec<u8>>,
}

impl ImageBuilder {
    /// An image with `directory_entries` grain directory entries, each
    /// covering 16 MiB of virtual disk.
    pub fn new(directory_entries: usize) -> Self {
        Self {
            magic: SESPARSE_MAGIC,
            version: SESPARSE_VERSION,
            grain_size_sectors: 8,
            table_size_sectors: 64,
            grains_offset_override: None,
            directory: vec![0; directory_entries],
            tables: Vec::new(),
            table_of_directory: HashMap::new(),
            grains: Vec::new(),
        }
    }

    pub fn magic(mut self, magic: u64) -> Self {
        self.magic = magic;
        self
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn grain_size_sectors(mut self, sectors: u64) -> Self {
        self.grain_size_sectors = sectors;
        self
    }

    /// Size of every grain table. 64 sectors holds 4096 entries.
    pub fn table_size_sectors(mut self, sectors: u64) -> Self {
        self.table_size_sectors = sectors;
        self
    }

    /// Overrides the grain data offset written in the header.
    pub fn grains_offset_sectors(mut self, sectors: u64) -> Self {
        self.grains_offset_override = Some(sectors);
        self
    }

    fn table_entries(&self) -> usize {
        (self.table_size_sectors * SECTOR / ENTRY_SIZE) as usize
    }

    /// Allocates (or returns) the grain table of a directory entry.
    pub fn allocate_table(&mut self, directory_index: usize) -> usize {
        if let Some(&table) = self.table_of_directory.get(&directory_index) {
            return table;
        }
        let table = self.tables.len();
        self.tables.push(vec![0; self.table_entries()]);
        self.table_of_directory.insert(directory_index, table);
        self.directory[directory_index] = DirectoryEntry {
            kind: DirectoryKind::Allocated,
            table_index: table as u64,
        }
        .encode();
        table
    }

    /// Writes a raw directory entry.
    pub fn set_directory_raw(&mut self, directory_index: usize, raw: u64) {
        self.directory[directory_index] = raw;
    }

    /// Writes a raw table entry for a grain of a block.
    pub fn set_grain_raw(&mut self, block_id: u64, grain: usize, raw: u64) {
        let directory_index = (block_id / BLOCKS_PER_TABLE) as usize;
        let slot = (block_id % BLOCKS_PER_TABLE) as usize * GRAINS_PER_BLOCK + grain;
        let table = self.allocate_table(directory_index);
        self.tables[table][slot] = raw;
    }

    /// Stores grain data for a grain of a block.
    pub fn put_grain(&mut self, block_id: u64, grain: usize, data: &[u8]) {
        assert_eq!(data.len(), GRAIN);
        let grain_index = self.grains.len() as u64;
        self.grains.push(data.to_vec());
        self.set_grain_raw(
            block_id,
            grain,
            TableEntry {
                kind: GrainKind::Allocated,
                grain_index,
            }
            .encode(),
        );
    }

    /// Marks a grain with a non-data state.
    pub fn mark(&mut self, block_id: u64, grain: usize, kind: GrainKind) {
        self.set_grain_raw(
            block_id,
            grain,
            TableEntry {
                kind,
                grain_index: 0,
            }
            .encode(),
        );
    }

    fn directory_sectors(&self) -> u64 {
        (self.directory.len() as u64 * ENTRY_SIZE).div_ceil(SECTOR).max(1)
    }

    fn tables_offset_sectors(&self) -> u64 {
        HEADER_SECTORS + self.directory_sectors()
    }

    fn grains_offset_sectors_actual(&self) -> u64 {
        self.tables_offset_sectors() + self.tables.len() as u64 * self.table_size_sectors
    }

    /// Byte offset where grain `grain_index` is stored.
    pub fn grain_offset(&self, grain_index: u64) -> u64 {
        self.grains_offset_sectors_actual() * SECTOR + grain_index * GRAIN as u64
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.directory.len() as u64 * BLOCKS_PER_TABLE * BLOCK_SIZE
    }

    pub fn build(&self) -> Vec<u8> {
        let grains_offset = self.grains_offset_sectors_actual();
        let total = grains_offset * SECTOR + (self.grains.len() * GRAIN) as u64;
        let mut image = vec![0u8; total as usize];

        fn put_word(image: &mut [u8], index: usize, value: u64) {
            image[index * 8..index * 8 + 8].copy_from_slice(&value.to_le_bytes());
        }
        put_word(&mut image, 0, self.magic);
        put_word(&mut image, 1, self.version);
        put_word(&mut image, 2, self.capacity_bytes() / SECTOR);
        put_word(&mut image, 3, self.grain_size_sectors);
        put_word(&mut image, 4, self.table_size_sectors);
        put_word(&mut image, 16, HEADER_SECTORS);
        put_word(&mut image, 17, self.directory_sectors());
        put_word(&mut image, 18, self.tables_offset_sectors());
        put_word(
            &mut image,
            24,
            self.grains_offset_override.unwrap_or(grains_offset),
        );

        let dir_start = (HEADER_SECTORS * SECTOR) as usize;
        for (i, raw) in self.directory.iter().enumerate() {
            let at = dir_start + i * 8;
            image[at..at + 8].copy_from_slice(&raw.to_le_bytes());
        }

        let table_bytes = (self.table_size_sectors * SECTOR) as usize;
        let tables_start = (self.tables_offset_sectors() * SECTOR) as usize;
        for (t, table) in self.tables.iter().enumerate() {
            for (i, raw) in table.iter().enumerate() {
                let at = tables_start + t * table_bytes + i * 8;
                image[at..at + 8].copy_from_slice(&raw.to_le_bytes());
            }
        }

        let data_start = (grains_offset * SECTOR) as usize;
        for (g, grain) in self.grains.iter().enumerate() {
            let at = data_start + g * GRAIN;
            image[at..at + GRAIN].copy_from_slice(grain);
        }

        image
    }

    pub fn source(&self) -> Arc<MemorySource> {
        Arc::new(MemorySource::new(self.build()))
    }
}

/// A grain filled with one byte value.
pub fn grain_of(value: u8) -> Vec<u8> {
    vec![value; GRAIN]
}

/// Byte range of a grain inside a block's data.
pub fn grain_window(grain: usize) -> std::ops::Range<usize> {
    grain * GRAIN..(grain + 1) * GRAIN
}

/// Wraps a source and counts fetches.
pub struct CountingSource<S> {
    inner: S,
    fetches: AtomicUsize,
}

impl<S> CountingSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: ByteRangeSource> ByteRangeSource for CountingSource<S> {
    async fn fetch(&self, start: u64, end_inclusive: u64) -> std::result::Result<Bytes, BoxError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(start, end_inclusive).await
    }
}

/// Fails every fetch starting at or after `fail_from`.
pub struct FailingSource<S> {
    inner: S,
    fail_from: u64,
}

impl<S> FailingSource<S> {
    pub fn new(inner: S, fail_from: u64) -> Self {
        Self { inner, fail_from }
    }
}

#[async_trait]
impl<S: ByteRangeSource> ByteRangeSource for FailingSource<S> {
    async fn fetch(&self, start: u64, end_inclusive: u64) -> std::result::Result<Bytes, BoxError> {
        if start >= self.fail_from {
            return Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "datastore connection reset",
            )));
        }
        self.inner.fetch(start, end_inclusive).await
    }
}

/// A parent device holding a fixed set of blocks.
///
/// Block `id` is filled with `fill_for(id)`, and the same `Arc` is returned
/// on every read so identity can be checked.
pub struct PatternDisk {
    blocks: HashMap<u64, Arc<Block>>,
    header: VhdHeader,
    footer: VhdFooter,
}

pub fn fill_for(block_id: u64) -> u8 {
    0x40u8.wrapping_add(block_id as u8)
}

impl PatternDisk {
    pub fn new(size_bytes: u64, block_ids: &[u64]) -> Self {
        let blocks = block_ids
            .iter()
            .map(|&id| {
                let mut buffer = vec![fill_for(id); BITMAP_SIZE + BLOCK_SIZE as usize];
                buffer[..BITMAP_SIZE].fill(0xFF);
                (id, Arc::new(Block::new(id, buffer).unwrap()))
            })
            .collect();
        let (header, footer) = container_metadata(&VhdConverter, size_bytes, 0);
        Self {
            blocks,
            header,
            footer,
        }
    }
}

#[async_trait]
impl BlockDevice for PatternDisk {
    fn contains_block(&self, block_id: u64) -> Result<bool> {
        Ok(self.blocks.contains_key(&block_id))
    }

    async fn read_block(&self, block_id: u64) -> Result<Arc<Block>> {
        Ok(self
            .blocks
            .get(&block_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(Block::zeroed(block_id))))
    }

    fn header(&self) -> &VhdHeader {
        &self.header
    }

    fn footer(&self) -> &VhdFooter {
        &self.footer
    }
}
