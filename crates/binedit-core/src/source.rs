//! Byte sources: the random-access containers segments point into.
//!
//! The engine never touches a file directly. Every physical read and write goes through the
//! small [`ByteSource`] contract, which has two implementations here:
//!
//! - [`MemorySource`]: a growable in-memory buffer (also used as a stand-in for a file in tests)
//! - [`FileSource`]: a file handle with a single-block read cache
//!
//! All positions and lengths are `u64` so files larger than the address space can be edited.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

slotmap::new_key_type! {
    /// Stable handle of a source registered in a [`crate::Repository`].
    pub struct SourceId;
}

/// Default block size of the [`FileSource`] read cache.
pub const DEFAULT_CACHE_BLOCK_SIZE: usize = 4096;

/// Random-access byte container consumed by the engine.
pub trait ByteSource: fmt::Debug {
    /// Current length in bytes.
    fn length(&self) -> u64;

    /// Truncate or extend (with zero bytes) to `length`.
    fn set_length(&mut self, length: u64) -> io::Result<()>;

    /// Read up to `buffer.len()` bytes starting at `position`.
    ///
    /// Returns the number of bytes read, which may be short; `0` means end of source.
    fn read(&mut self, position: u64, buffer: &mut [u8]) -> io::Result<usize>;

    /// Write `data` at `position`, extending the source when writing past its end.
    fn write(&mut self, position: u64, data: &[u8]) -> io::Result<()>;

    /// Drop any cached content so the next read observes the underlying storage.
    fn clear_cache(&mut self) {}

    /// Release the underlying resource.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Fill `buffer` completely from `position`, failing with `UnexpectedEof` on a short source.
    fn read_fully(&mut self, position: u64, buffer: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buffer.len() {
            let count = self.read(position + filled as u64, &mut buffer[filled..])?;
            if count == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "source ended at {} while reading {} bytes from {}",
                        position + filled as u64,
                        buffer.len(),
                        position
                    ),
                ));
            }
            filled += count;
        }
        Ok(())
    }
}

pub(crate) fn to_index(value: u64) -> io::Result<usize> {
    usize::try_from(value).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("position {value} exceeds addressable memory"),
        )
    })
}

/// In-memory byte source backed by a `Vec<u8>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    /// Create an empty memory source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Borrow the whole content.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Unwrap into the underlying bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    /// Append bytes, returning the position they were stored at.
    pub(crate) fn append(&mut self, data: &[u8]) -> u64 {
        let position = self.data.len() as u64;
        self.data.extend_from_slice(data);
        position
    }

    /// Append `count` zero bytes, returning their position.
    pub(crate) fn append_zeros(&mut self, count: u64) -> io::Result<u64> {
        let position = self.data.len() as u64;
        let new_len = to_index(position + count)?;
        self.data.resize(new_len, 0);
        Ok(position)
    }
}

impl ByteSource for MemorySource {
    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn set_length(&mut self, length: u64) -> io::Result<()> {
        self.data.resize(to_index(length)?, 0);
        Ok(())
    }

    fn read(&mut self, position: u64, buffer: &mut [u8]) -> io::Result<usize> {
        if position >= self.length() {
            return Ok(0);
        }
        let start = to_index(position)?;
        let count = buffer.len().min(self.data.len() - start);
        buffer[..count].copy_from_slice(&self.data[start..start + count]);
        Ok(count)
    }

    fn write(&mut self, position: u64, data: &[u8]) -> io::Result<()> {
        let start = to_index(position)?;
        let end = start + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }
}

#[derive(Debug)]
struct CacheBlock {
    position: u64,
    data: Vec<u8>,
}

/// File-backed byte source with a single-block read cache.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    length: u64,
    block_size: usize,
    cache: Option<CacheBlock>,
}

impl FileSource {
    /// Open an existing file for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(file)
    }

    /// Create (or truncate) a file for reading and writing.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::from_file(file)
    }

    /// Wrap an already opened file handle.
    pub fn from_file(file: File) -> io::Result<Self> {
        let length = file.metadata()?.len();
        Ok(Self {
            file,
            length,
            block_size: DEFAULT_CACHE_BLOCK_SIZE,
            cache: None,
        })
    }

    /// Change the read cache block size (minimum 1).
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self.cache = None;
        self
    }

    fn load_block(&mut self, position: u64) -> io::Result<()> {
        let block_start = position - position % self.block_size as u64;
        let wanted = (self.length - block_start).min(self.block_size as u64) as usize;
        let mut data = vec![0; wanted];
        self.file.seek(SeekFrom::Start(block_start))?;
        let mut filled = 0;
        while filled < wanted {
            let count = self.file.read(&mut data[filled..])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        data.truncate(filled);
        self.cache = Some(CacheBlock {
            position: block_start,
            data,
        });
        Ok(())
    }
}

impl ByteSource for FileSource {
    fn length(&self) -> u64 {
        self.length
    }

    fn set_length(&mut self, length: u64) -> io::Result<()> {
        self.cache = None;
        self.file.set_len(length)?;
        self.length = length;
        Ok(())
    }

    fn read(&mut self, position: u64, buffer: &mut [u8]) -> io::Result<usize> {
        if position >= self.length || buffer.is_empty() {
            return Ok(0);
        }
        let cached = self.cache.as_ref().is_some_and(|block| {
            position >= block.position && position < block.position + block.data.len() as u64
        });
        if !cached {
            self.load_block(position)?;
        }
        let Some(block) = self.cache.as_ref() else {
            return Ok(0);
        };
        let offset = (position - block.position) as usize;
        let available = block.data.len().saturating_sub(offset);
        let count = buffer.len().min(available);
        buffer[..count].copy_from_slice(&block.data[offset..offset + count]);
        Ok(count)
    }

    fn write(&mut self, position: u64, data: &[u8]) -> io::Result<()> {
        self.cache = None;
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(data)?;
        self.length = self.length.max(position + data.len() as u64);
        Ok(())
    }

    fn clear_cache(&mut self) {
        self.cache = None;
    }

    fn close(&mut self) -> io::Result<()> {
        self.cache = None;
        self.file.flush()?;
        self.file.sync_data()
    }
}
