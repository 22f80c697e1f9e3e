//! Byte-range access to the storage holding a disk file.
//!
//! The decoder never reads a file directly. It asks a [`ByteRangeSource`] for
//! inclusive byte ranges and decides itself how large those ranges are.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use memmap2::Mmap;

use crate::error::{BoxError, Error, Result};

/// Fetches arbitrary byte ranges from backing storage.
#[async_trait]
pub trait ByteRangeSource: Send + Sync {
    /// Returns the bytes in `start..=end_inclusive`.
    async fn fetch(&self, start: u64, end_inclusive: u64) -> std::result::Result<Bytes, BoxError>;
}

#[async_trait]
impl<T: ByteRangeSource + ?Sized> ByteRangeSource for Arc<T> {
    async fn fetch(&self, start: u64, end_inclusive: u64) -> std::result::Result<Bytes, BoxError> {
        (**self).fetch(start, end_inclusive).await
    }
}

/// Reads exactly `length` bytes at `start`.
///
/// Transport failures are wrapped untouched. A source returning a different
/// number of bytes than asked for is treated as a format error, since the
/// decoder would otherwise misalign every entry after it.
pub(crate) async fn read_range(
    source: &dyn ByteRangeSource,
    start: u64,
    length: u64,
) -> Result<Bytes> {
    if length == 0 {
        return Ok(Bytes::new());
    }
    let end_inclusive = start
        .checked_add(length - 1)
        .ok_or_else(|| Error::format(format!("range {start}+{length} overflows")))?;
    let bytes = source
        .fetch(start, end_inclusive)
        .await
        .map_err(Error::transport)?;
    if bytes.len() as u64 != length {
        return Err(Error::format(format!(
            "short read at offset {}: expected {} bytes, got {}",
            start,
            length,
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn out_of_bounds(start: u64, end_inclusive: u64, size: u64) -> BoxError {
    Box::new(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("range {start}-{end_inclusive} is outside of {size} bytes"),
    ))
}

/// Clamps a range to the data size the way an HTTP range request does.
///
/// A range running past the end yields the bytes that exist; only a range
/// starting at or past the end fails.
fn clamped_range(
    start: u64,
    end_inclusive: u64,
    size: u64,
) -> std::result::Result<std::ops::Range<usize>, BoxError> {
    if start > end_inclusive || start >= size {
        return Err(out_of_bounds(start, end_inclusive, size));
    }
    let end = end_inclusive.min(size - 1);
    Ok(start as usize..end as usize + 1)
}

/// A local file exposed through a read-only memory map.
pub struct MmapSource {
    mmap: Arc<Mmap>,
}

impl MmapSource {
    /// Opens and maps a file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SESparse or raw disk file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] with the path attached if the file cannot be
    /// opened or memory-mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;

        // Safety: the file is opened read-only and the map lives as long as
        // the source. Callers must not truncate the file while it is mapped.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };

        Ok(Self {
            mmap: Arc::new(mmap),
        })
    }

    /// Size of the mapped file in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }
}

#[async_trait]
impl ByteRangeSource for MmapSource {
    async fn fetch(&self, start: u64, end_inclusive: u64) -> std::result::Result<Bytes, BoxError> {
        let range = clamped_range(start, end_inclusive, self.size())?;
        Ok(Bytes::copy_from_slice(&self.mmap[range]))
    }
}

/// An in-memory disk file.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    /// Wraps a buffer holding a whole disk file.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Size of the buffer in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[async_trait]
impl ByteRangeSource for MemorySource {
    async fn fetch(&self, start: u64, end_inclusive: u64) -> std::result::Result<Bytes, BoxError> {
        let range = clamped_range(start, end_inclusive, self.size())?;
        Ok(self.data.slice(range))
    }
}
