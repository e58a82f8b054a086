// src/io/file.rs

//! A single data file accessed with unbuffered direct I/O.
//!
//! Every file starts with a fixed 4096-byte directory region followed by
//! containers packed end to end:
//!
//! ```text
//! offset 0    : DirectoryHeader { magic, version, entries, padding }  (16 B)
//! offset 16   : u64[entries]      cumulative container end offsets
//! offset 4096 : container 0
//! offset end0 : container 1
//! ...
//! ```
//!
//! Entry `i` holds the exclusive end offset of container `i`; container 0
//! begins right after the directory. Writers fill the directory in memory
//! and persist it once, when the file is finished.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use tracing::error;

use crate::error::{Result, StoreError};
use crate::format::Container;

use super::{
    direct_io_enabled, AlignedBuf, DIRECTORY_STORAGE_SIZE, IO_BLOCK_SIZE, MAX_DIRECTORY,
};

/// "PICF"
pub const DIRECTORY_MAGIC: u32 = 0x5049_4346;

pub const DIRECTORY_VERSION: u32 = 1;

const DIRECTORY_HEADER_SIZE: usize = 16;

fn open_custom_flags() -> i32 {
    if direct_io_enabled() {
        libc::O_DIRECT | libc::O_SYNC
    } else {
        0
    }
}

/// In-memory image of the directory region: cumulative container end
/// offsets.
#[derive(Debug, Default)]
struct Directory {
    ends: Vec<u64>,
}

impl Directory {
    fn len(&self) -> usize {
        self.ends.len()
    }

    /// End offset of the last container, or the start of the data region
    /// for an empty file.
    fn back(&self) -> u64 {
        self.ends
            .last()
            .copied()
            .unwrap_or(DIRECTORY_STORAGE_SIZE as u64)
    }

    /// Byte range `[begin, end)` of container `index`.
    fn container_range(&self, index: usize) -> (u64, u64) {
        let begin = if index == 0 {
            DIRECTORY_STORAGE_SIZE as u64
        } else {
            self.ends[index - 1]
        };
        (begin, self.ends[index])
    }

    fn container_sizes(&self) -> Vec<u64> {
        (0..self.len())
            .map(|i| {
                let (begin, end) = self.container_range(i);
                end - begin
            })
            .collect()
    }

    fn can_append(&self, size: u64, max_size: u64) -> bool {
        self.ends.len() < MAX_DIRECTORY && self.back().saturating_add(size) <= max_size
    }

    /// Reserves space for a container of `size` bytes and returns its write
    /// offset.
    fn append(&mut self, size: u64, max_size: u64) -> Result<u64> {
        if !self.can_append(size, max_size) {
            return Err(StoreError::EndOfSpace);
        }
        let offset = self.back();
        self.ends.push(offset + size);
        Ok(offset)
    }

    fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != DIRECTORY_MAGIC {
            return Err(StoreError::corrupt(
                path,
                format!("bad directory magic {magic:#010x}"),
            ));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != DIRECTORY_VERSION {
            return Err(StoreError::corrupt(
                path,
                format!("unsupported directory version {version}"),
            ));
        }
        let entries = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        if entries > MAX_DIRECTORY {
            return Err(StoreError::corrupt(
                path,
                format!("directory claims {entries} entries"),
            ));
        }

        let mut ends = Vec::with_capacity(entries);
        let mut previous = DIRECTORY_STORAGE_SIZE as u64;
        for i in 0..entries {
            let at = DIRECTORY_HEADER_SIZE + i * 8;
            let end = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
            if end <= previous || end % IO_BLOCK_SIZE as u64 != 0 {
                return Err(StoreError::corrupt(
                    path,
                    format!("directory entry {i} has invalid end offset {end}"),
                ));
            }
            ends.push(end);
            previous = end;
        }
        Ok(Self { ends })
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&DIRECTORY_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&DIRECTORY_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.ends.len() as u32).to_le_bytes());
        buf[12..16].fill(0);
        for (i, end) in self.ends.iter().enumerate() {
            let at = DIRECTORY_HEADER_SIZE + i * 8;
            buf[at..at + 8].copy_from_slice(&end.to_le_bytes());
        }
    }
}

/// One on-disk data file: a directory plus up to [`MAX_DIRECTORY`]
/// containers.
#[derive(Debug)]
pub struct DirectFile {
    file: File,
    path: PathBuf,
    dir: Directory,
    /// Read cursor over containers.
    index: usize,
    max_size: u64,
    writable: bool,
    finished: bool,
}

impl DirectFile {
    /// Opens an existing file for reading and validates its directory.
    pub fn open_read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(open_custom_flags())
            .open(&path)
            .map_err(|e| StoreError::io_with_source(&path, "failed to open for reading", e))?;

        let mut buf = AlignedBuf::zeroed(DIRECTORY_STORAGE_SIZE);
        file.read_exact_at(&mut buf, 0)
            .map_err(|e| StoreError::io_with_source(&path, "failed to read directory", e))?;
        let dir = Directory::decode(&buf, &path)?;

        Ok(Self {
            file,
            path,
            dir,
            index: 0,
            max_size: 0,
            writable: false,
            finished: true,
        })
    }

    /// Creates a new file for writing with capacity `max_size`.
    ///
    /// The file must not exist; an existing dataset can never be reopened
    /// for writing.
    pub fn open_write(path: impl AsRef<Path>, max_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o666)
            .custom_flags(open_custom_flags())
            .open(&path)
            .map_err(|e| StoreError::io_with_source(&path, "failed to create for writing", e))?;

        Ok(Self {
            file,
            path,
            dir: Directory::default(),
            index: 0,
            max_size,
            writable: true,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of containers in the file.
    pub fn container_count(&self) -> usize {
        self.dir.len()
    }

    /// Whether a container of `size` packed bytes still fits.
    pub fn has_space(&self, size: usize) -> bool {
        self.dir.can_append(size as u64, self.max_size)
    }

    /// Reads the next container into a freshly allocated aligned buffer and
    /// advances the cursor. Raises `EndOfStream` when the directory is
    /// exhausted.
    pub fn alloc_read(&mut self) -> Result<AlignedBuf> {
        if self.index >= self.dir.len() {
            return Err(StoreError::EndOfStream);
        }
        let (begin, end) = self.dir.container_range(self.index);
        self.index += 1;

        let mut buf = AlignedBuf::zeroed((end - begin) as usize);
        self.file
            .read_exact_at(&mut buf, begin)
            .map_err(|e| StoreError::io_with_source(&self.path, "container read failed", e))?;
        Ok(buf)
    }

    /// Appends a packed container of `size` bytes, taking ownership of the
    /// buffer; it is released once the write completes. Raises `EndOfSpace`
    /// when the directory is full or the container would cross `max_size`.
    pub fn write_free(&mut self, buf: AlignedBuf, size: usize) -> Result<()> {
        assert!(size % IO_BLOCK_SIZE == 0, "unaligned container size {size}");
        assert!(size <= buf.len());
        let offset = self.dir.append(size as u64, self.max_size)?;
        self.file
            .write_all_at(&buf[..size], offset)
            .map_err(|e| StoreError::io_with_source(&self.path, "container write failed", e))?;
        Ok(())
    }

    /// Persists the in-memory directory. Must be called once when a written
    /// file is complete; further writes are not allowed.
    pub fn finish(&mut self) -> Result<()> {
        if !self.writable || self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut buf = AlignedBuf::zeroed(DIRECTORY_STORAGE_SIZE);
        self.dir.encode(&mut buf);
        self.file
            .write_all_at(&buf, 0)
            .map_err(|e| StoreError::io_with_source(&self.path, "directory write failed", e))
    }

    /// Reads only the directory of `path` and returns the per-container
    /// sizes. Used by offline re-striping planners.
    pub fn ping(path: impl AsRef<Path>) -> Result<Vec<u64>> {
        Ok(Self::open_read(path)?.dir.container_sizes())
    }

    /// Loads every container of `path` into memory.
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<Container>> {
        let mut file = Self::open_read(path)?;
        let mut containers = Vec::with_capacity(file.container_count());
        loop {
            match file.alloc_read() {
                Ok(buf) => containers.push(Container::from_buffer(buf)?),
                Err(e) if e.is_end_of_stream() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(containers)
    }

    /// Rewrites `input` into `output` with its records in uniformly random
    /// order. The record multiset is preserved; output containers are sized
    /// to the largest input container.
    pub fn shuffle(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<()> {
        let all = Self::load(input)?;
        let capacity = all
            .iter()
            .map(Container::capacity)
            .max()
            .unwrap_or(IO_BLOCK_SIZE);

        let mut index: Vec<(usize, usize)> = Vec::new();
        for (ci, container) in all.iter().enumerate() {
            for ri in 0..container.len() {
                index.push((ci, ri));
            }
        }
        index.shuffle(&mut rand::thread_rng());

        let mut out = Self::open_write(output, u64::MAX)?;
        let mut current = Container::empty(capacity);
        for (ci, ri) in index {
            let record = all[ci].get(ri).expect("index in range");
            if !current.add(&record)? {
                let full = std::mem::replace(&mut current, Container::empty(capacity));
                let (buf, size) = full.pack();
                out.write_free(buf, size)?;
                if !current.add(&record)? {
                    return Err(StoreError::config(format!(
                        "record of {} bytes does not fit an empty container of {capacity} bytes",
                        record.storage_size()
                    )));
                }
            }
        }
        if !current.is_empty() {
            let (buf, size) = current.pack();
            out.write_free(buf, size)?;
        }
        out.finish()
    }
}

impl Drop for DirectFile {
    fn drop(&mut self) {
        if self.writable && !self.finished {
            if let Err(e) = self.finish() {
                error!(path = %self.path.display(), "failed to finish data file: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Meta, Record};
    use crate::io::set_direct_io;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn container_with(serials: std::ops::Range<i32>, capacity: usize) -> Container {
        let mut c = Container::empty(capacity);
        for serial in serials {
            let image = vec![(serial % 251) as u8; 64];
            let rec = Record::new(Meta { label: -1, serial }, &image, b"e");
            assert!(c.add(&rec).unwrap());
        }
        c
    }

    #[test]
    fn test_write_then_read_back() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0");

        let mut sizes = Vec::new();
        {
            let mut file = DirectFile::open_write(&path, 1 << 20).unwrap();
            for i in 0..4 {
                let c = container_with(i * 10..i * 10 + 5, 4096);
                let (buf, size) = c.pack();
                sizes.push(size as u64);
                file.write_free(buf, size).unwrap();
            }
            file.finish().unwrap();
        }

        let mut file = DirectFile::open_read(&path).unwrap();
        assert_eq!(file.container_count(), 4);
        for i in 0..4 {
            let buf = file.alloc_read().unwrap();
            assert_eq!(buf.len() as u64, sizes[i as usize]);
            let c = Container::from_buffer(buf).unwrap();
            assert_eq!(c.len(), 5);
            assert_eq!(c.get(0).unwrap().meta.serial, i * 10);
        }
        assert!(file.alloc_read().unwrap_err().is_end_of_stream());
    }

    #[test]
    fn test_ping_reports_container_sizes() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0");

        let mut expected = Vec::new();
        {
            let mut file = DirectFile::open_write(&path, 1 << 20).unwrap();
            for n in [1, 8, 3] {
                let c = container_with(0..n, 4096);
                let (buf, size) = c.pack();
                expected.push(size as u64);
                file.write_free(buf, size).unwrap();
            }
        } // directory persisted on drop

        assert_eq!(DirectFile::ping(&path).unwrap(), expected);
    }

    #[test]
    fn test_max_size_raises_end_of_space() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0");

        // Room for the directory plus exactly two 512-byte containers.
        let max_size = (DIRECTORY_STORAGE_SIZE + 2 * IO_BLOCK_SIZE) as u64;
        let mut file = DirectFile::open_write(&path, max_size).unwrap();
        for _ in 0..2 {
            let (buf, size) = Container::empty(512).pack();
            assert!(file.has_space(size));
            file.write_free(buf, size).unwrap();
        }
        let (buf, size) = Container::empty(512).pack();
        assert!(!file.has_space(size));
        assert!(file.write_free(buf, size).unwrap_err().is_end_of_space());
    }

    #[test]
    fn test_directory_cap_raises_end_of_space() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0");

        let mut file = DirectFile::open_write(&path, u64::MAX).unwrap();
        for _ in 0..MAX_DIRECTORY {
            let (buf, size) = Container::empty(512).pack();
            file.write_free(buf, size).unwrap();
        }
        let (buf, size) = Container::empty(512).pack();
        assert!(file.write_free(buf, size).unwrap_err().is_end_of_space());
        file.finish().unwrap();

        let reopened = DirectFile::open_read(&path).unwrap();
        assert_eq!(reopened.container_count(), MAX_DIRECTORY);
    }

    #[test]
    fn test_existing_file_cannot_be_rewritten() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0");
        let file = DirectFile::open_write(&path, 1 << 20).unwrap();
        drop(file);
        assert!(DirectFile::open_write(&path, 1 << 20).is_err());
    }

    #[test]
    fn test_truncated_file_is_fatal() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0");
        std::fs::write(&path, b"short").unwrap();
        assert!(DirectFile::open_read(&path).is_err());
    }

    #[test]
    fn test_zeroed_directory_is_fatal() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0");
        std::fs::write(&path, vec![0u8; DIRECTORY_STORAGE_SIZE]).unwrap();
        let err = DirectFile::open_read(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_corrupted_payload_on_disk_detected() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0");
        {
            let mut file = DirectFile::open_write(&path, 1 << 20).unwrap();
            let c = container_with(0..10, 4096);
            let (buf, size) = c.pack();
            file.write_free(buf, size).unwrap();
        }

        // Flip one byte in the payload region of the container.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[DIRECTORY_STORAGE_SIZE + 64] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let mut file = DirectFile::open_read(&path).unwrap();
        let buf = file.alloc_read().unwrap();
        let err = Container::from_buffer(buf).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_shuffle_preserves_records() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");

        {
            let mut file = DirectFile::open_write(&input, 1 << 20).unwrap();
            for i in 0..6 {
                let c = container_with(i * 100..i * 100 + 40, 8192);
                let (buf, size) = c.pack();
                file.write_free(buf, size).unwrap();
            }
        }

        DirectFile::shuffle(&input, &output).unwrap();

        let mut counts: HashMap<i32, i64> = HashMap::new();
        for c in DirectFile::load(&input).unwrap() {
            for rec in c.records() {
                *counts.entry(rec.meta.serial).or_default() += 1;
            }
        }
        for c in DirectFile::load(&output).unwrap() {
            for rec in c.records() {
                *counts.entry(rec.meta.serial).or_default() -= 1;
            }
        }
        assert!(counts.values().all(|&v| v == 0));
    }
}
