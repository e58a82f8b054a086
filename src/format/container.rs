// src/format/container.rs

//! Containers: aligned buffers holding a packed run of records.
//!
//! A container is the unit of disk I/O. Its buffer starts with a 16-byte
//! packed header followed by `count` records laid end to end; the packed
//! image is zero-padded up to a multiple of the I/O block size and protected
//! by a checksum over exactly `data_size` payload bytes:
//!
//! ```text
//! ┌───────┬───────┬───────────┬──────────┬──────────────────────┬─────┐
//! │ magic │ count │ data_size │ data_crc │ record 0 .. record n │ pad │
//! │ 4B    │ 4B    │ 4B        │ 4B       │ data_size bytes      │     │
//! └───────┴───────┴───────────┴──────────┴──────────────────────┴─────┘
//! ```
//!
//! There are two ways to obtain a container: [`Container::empty`] allocates
//! a write-side container of a fixed capacity, and [`Container::from_buffer`]
//! adopts a buffer read back from disk. [`Container::pack`] finalizes the
//! header and hands the buffer to the caller; the container is consumed, so
//! a buffer is owned by exactly one of container, flush slot, or I/O worker
//! at any time.

use crate::error::{Result, StoreError};
use crate::format::crc;
use crate::format::record::{Meta, Record};
use crate::io::{round_up, AlignedBuf, IO_BLOCK_SIZE};

/// "PICC"
pub const CONTAINER_MAGIC: u32 = 0x5049_4343;

/// Size of the packed container header.
pub const CONTAINER_HEADER_SIZE: usize = 16;

/// Largest accepted container (10 GiB).
pub const MAX_CONTAINER_SIZE: usize = 10_737_418_240;

/// Location of one record inside the container buffer.
#[derive(Debug, Clone, Copy)]
struct Entry {
    meta: Meta,
    image_off: usize,
    image_len: usize,
    extra_len: usize,
}

/// An aligned buffer of packed records.
#[derive(Debug)]
pub struct Container {
    buf: AlignedBuf,
    /// First free byte (write side) or end of parsed data (read side).
    write_pos: usize,
    entries: Vec<Entry>,
}

impl Container {
    /// Allocates an empty write-side container of exactly `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a multiple of the I/O block size, does
    /// not exceed the header size, or exceeds [`MAX_CONTAINER_SIZE`].
    pub fn empty(capacity: usize) -> Self {
        assert!(
            capacity % IO_BLOCK_SIZE == 0,
            "container capacity {capacity} is not a multiple of {IO_BLOCK_SIZE}"
        );
        assert!(capacity > CONTAINER_HEADER_SIZE);
        assert!(capacity <= MAX_CONTAINER_SIZE);
        Self {
            buf: AlignedBuf::zeroed(capacity),
            write_pos: CONTAINER_HEADER_SIZE,
            entries: Vec::new(),
        }
    }

    /// Adopts a buffer read back from disk, validating the header and
    /// indexing the records it holds.
    ///
    /// The checksum is verified when [`crc::crc_checking_enabled`] is set;
    /// magic numbers and size fields are validated unconditionally.
    pub fn from_buffer(buf: AlignedBuf) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != CONTAINER_MAGIC {
            return Err(StoreError::corrupt(
                "<container>",
                format!("bad container magic {magic:#010x}"),
            ));
        }
        let count = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        let data_size = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        let data_crc = u32::from_le_bytes(buf[12..16].try_into().unwrap());

        let data_end = CONTAINER_HEADER_SIZE
            .checked_add(data_size)
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| {
                StoreError::corrupt(
                    "<container>",
                    format!("data size {data_size} exceeds buffer of {}", buf.len()),
                )
            })?;

        if crc::crc_checking_enabled() {
            let computed = crc::checksum(&buf[CONTAINER_HEADER_SIZE..data_end]);
            if computed != data_crc {
                return Err(StoreError::corrupt(
                    "<container>",
                    format!("checksum mismatch: stored {data_crc:#010x}, computed {computed:#010x}"),
                ));
            }
        }

        let mut entries = Vec::with_capacity(count);
        let mut pos = CONTAINER_HEADER_SIZE;
        for i in 0..count {
            if pos >= data_end {
                return Err(StoreError::corrupt(
                    "<container>",
                    format!("record {i} of {count} overruns data region"),
                ));
            }
            let (record, consumed) = Record::decode(&buf[pos..data_end])?;
            entries.push(Entry {
                meta: record.meta,
                image_off: pos + crate::format::record::RECORD_HEADER_SIZE,
                image_len: record.image.len(),
                extra_len: record.extra.len(),
            });
            pos += consumed;
        }

        Ok(Self {
            buf,
            write_pos: pos,
            entries,
        })
    }

    /// Number of records in the container.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes the container occupies once packed: the used prefix rounded up
    /// to the I/O block size.
    pub fn packed_size(&self) -> usize {
        round_up(self.write_pos, IO_BLOCK_SIZE)
    }

    /// Returns a view of record `index`, borrowing from the container.
    pub fn get(&self, index: usize) -> Option<Record<'_>> {
        let entry = self.entries.get(index)?;
        let image_end = entry.image_off + entry.image_len;
        Some(Record {
            meta: entry.meta,
            image: &self.buf[entry.image_off..image_end],
            extra: &self.buf[image_end..image_end + entry.extra_len],
        })
    }

    /// Iterates over all records in insertion order.
    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        (0..self.entries.len()).map(move |i| self.get(i).expect("index in range"))
    }

    /// Appends a record. Returns `Ok(false)` when the container cannot hold
    /// it; the caller flushes and retries with a fresh container.
    pub fn add(&mut self, record: &Record<'_>) -> Result<bool> {
        record.validate()?;
        let need = record.storage_size();
        if self.write_pos + need >= self.buf.len() {
            return Ok(false);
        }
        let written = record.encode(&mut self.buf[self.write_pos..]);
        self.entries.push(Entry {
            meta: record.meta,
            image_off: self.write_pos + crate::format::record::RECORD_HEADER_SIZE,
            image_len: record.image.len(),
            extra_len: record.extra.len(),
        });
        self.write_pos += written;
        Ok(true)
    }

    /// Finalizes the header and checksum, zero-fills the tail padding, and
    /// hands the aligned buffer to the caller together with the packed size.
    ///
    /// The container is consumed; the buffer is released by whoever ends up
    /// holding it (normally the I/O worker, after the write completes).
    pub fn pack(self) -> (AlignedBuf, usize) {
        let Container {
            mut buf,
            write_pos,
            entries,
        } = self;
        let size = round_up(write_pos, IO_BLOCK_SIZE);
        let data_size = write_pos - CONTAINER_HEADER_SIZE;

        buf[write_pos..size].fill(0);
        let data_crc = crc::checksum(&buf[CONTAINER_HEADER_SIZE..write_pos]);

        buf[0..4].copy_from_slice(&CONTAINER_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        buf[8..12].copy_from_slice(&(data_size as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&data_crc.to_le_bytes());

        (buf, size)
    }
}
