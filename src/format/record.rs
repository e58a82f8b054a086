// src/format/record.rs

//! The image record: one encoded image plus metadata.
//!
//! On disk a record is a 20-byte packed little-endian header followed by the
//! image bytes, the extra bytes, and zero padding up to a 16-byte multiple:
//!
//! ```text
//! ┌───────┬───────┬────────┬────────────┬────────────┬─────────┬─────────┬─────┐
//! │ magic │ label │ serial │ image_size │ extra_size │ image.. │ extra.. │ pad │
//! │ 4B    │ 4B    │ 4B     │ 4B         │ 4B         │ N bytes │ M bytes │     │
//! └───────┴───────┴────────┴────────────┴────────────┴─────────┴─────────┴─────┘
//! ```
//!
//! A `Record` is a view: its payload slices borrow from the container buffer
//! that holds them and the record itself owns no memory.

use crate::error::{Result, StoreError};
use crate::io::round_up;

/// "PICR"
pub const RECORD_MAGIC: u32 = 0x5049_4352;

/// Alignment of record headers within a container.
pub const HEADER_ALIGN: usize = 16;

/// Size of the packed record header.
pub const RECORD_HEADER_SIZE: usize = 20;

/// Largest accepted encoded image payload (32 MiB).
pub const MAX_IMAGE_SIZE: usize = 33_554_432;

/// Largest accepted extra payload (1 MiB).
pub const MAX_EXTRA_SIZE: usize = 1_048_576;

/// Essential metadata of an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Meta {
    /// Category label; -1 means unknown.
    pub label: i32,
    /// Serial number, unique within a dataset.
    pub serial: i32,
}

/// A borrowed view of one image record.
///
/// The `image` blob is opaque to the engine (typically JPEG); `extra` carries
/// side-channel data such as JSON. Both borrow from the enclosing container
/// buffer and are valid for its lifetime.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub meta: Meta,
    pub image: &'a [u8],
    pub extra: &'a [u8],
}

impl<'a> Record<'a> {
    pub fn new(meta: Meta, image: &'a [u8], extra: &'a [u8]) -> Self {
        Self { meta, image, extra }
    }

    /// Bytes this record occupies on disk: header plus payloads, rounded up
    /// to the header alignment.
    pub fn storage_size(&self) -> usize {
        round_up(
            RECORD_HEADER_SIZE + self.image.len() + self.extra.len(),
            HEADER_ALIGN,
        )
    }

    /// Rejects records whose payloads exceed the format limits.
    pub fn validate(&self) -> Result<()> {
        if self.image.len() > MAX_IMAGE_SIZE {
            return Err(StoreError::corrupt(
                "<record>",
                format!("image size {} exceeds {MAX_IMAGE_SIZE}", self.image.len()),
            ));
        }
        if self.extra.len() > MAX_EXTRA_SIZE {
            return Err(StoreError::corrupt(
                "<record>",
                format!("extra size {} exceeds {MAX_EXTRA_SIZE}", self.extra.len()),
            ));
        }
        Ok(())
    }

    /// Serializes the record into the front of `dst`, zero-filling the
    /// trailing padding. Returns the number of bytes written, which is
    /// exactly [`Record::storage_size`].
    ///
    /// `dst` must be at least `storage_size()` long; the caller has already
    /// checked capacity.
    pub(crate) fn encode(&self, dst: &mut [u8]) -> usize {
        let total = self.storage_size();
        debug_assert!(dst.len() >= total);

        dst[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        dst[4..8].copy_from_slice(&self.meta.label.to_le_bytes());
        dst[8..12].copy_from_slice(&self.meta.serial.to_le_bytes());
        dst[12..16].copy_from_slice(&(self.image.len() as u32).to_le_bytes());
        dst[16..20].copy_from_slice(&(self.extra.len() as u32).to_le_bytes());

        let image_end = RECORD_HEADER_SIZE + self.image.len();
        let extra_end = image_end + self.extra.len();
        dst[RECORD_HEADER_SIZE..image_end].copy_from_slice(self.image);
        dst[image_end..extra_end].copy_from_slice(self.extra);
        dst[extra_end..total].fill(0);
        total
    }

    /// Parses one record from the front of `src`, borrowing the payload
    /// bytes. Returns the record and its storage size.
    pub(crate) fn decode(src: &'a [u8]) -> Result<(Record<'a>, usize)> {
        if src.len() < RECORD_HEADER_SIZE {
            return Err(StoreError::corrupt(
                "<container>",
                "truncated record header",
            ));
        }
        let magic = u32::from_le_bytes(src[0..4].try_into().unwrap());
        if magic != RECORD_MAGIC {
            return Err(StoreError::corrupt(
                "<container>",
                format!("bad record magic {magic:#010x}"),
            ));
        }
        let label = i32::from_le_bytes(src[4..8].try_into().unwrap());
        let serial = i32::from_le_bytes(src[8..12].try_into().unwrap());
        let image_size = u32::from_le_bytes(src[12..16].try_into().unwrap()) as usize;
        let extra_size = u32::from_le_bytes(src[16..20].try_into().unwrap()) as usize;

        if image_size > MAX_IMAGE_SIZE || extra_size > MAX_EXTRA_SIZE {
            return Err(StoreError::corrupt(
                "<container>",
                format!("record payload sizes out of range: image {image_size}, extra {extra_size}"),
            ));
        }
        let total = round_up(
            RECORD_HEADER_SIZE + image_size + extra_size,
            HEADER_ALIGN,
        );
        if src.len() < total {
            return Err(StoreError::corrupt(
                "<container>",
                format!("record spans past container end ({total} > {})", src.len()),
            ));
        }

        let image_end = RECORD_HEADER_SIZE + image_size;
        let record = Record {
            meta: Meta { label, serial },
            image: &src[RECORD_HEADER_SIZE..image_end],
            extra: &src[image_end..image_end + extra_size],
        };
        Ok((record, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_size_alignment() {
        let rec = Record::new(Meta::default(), &[], &[]);
        assert_eq!(rec.storage_size(), 32); // 20-byte header rounds to 32

        let image = vec![0u8; 12];
        let rec = Record::new(Meta::default(), &image, &[]);
        assert_eq!(rec.storage_size(), 32); // 20 + 12 = 32 exactly

        let image = vec![0u8; 13];
        let rec = Record::new(Meta::default(), &image, &[]);
        assert_eq!(rec.storage_size(), 48);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let image: Vec<u8> = (0..4189u32).map(|i| (i % 251) as u8).collect();
        let extra: Vec<u8> = (0..523u32).map(|i| (i % 7) as u8).collect();
        let meta = Meta {
            label: 17,
            serial: 123_456,
        };
        let rec = Record::new(meta, &image, &extra);

        let mut buf = vec![0xFFu8; rec.storage_size()];
        let written = rec.encode(&mut buf);
        assert_eq!(written, rec.storage_size());

        let (parsed, consumed) = Record::decode(&buf).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(parsed.meta, meta);
        assert_eq!(parsed.image, image.as_slice());
        assert_eq!(parsed.extra, extra.as_slice());
    }

    #[test]
    fn test_padding_is_zeroed() {
        let rec = Record::new(Meta::default(), b"abc", b"");
        let mut buf = vec![0xFFu8; rec.storage_size()];
        rec.encode(&mut buf);
        // 20 + 3 = 23, padded to 32
        assert!(buf[23..32].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let rec = Record::new(Meta::default(), b"x", b"");
        let mut buf = vec![0u8; rec.storage_size()];
        rec.encode(&mut buf);
        buf[0] ^= 0x01;
        let err = Record::decode(&buf).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_decode_rejects_oversized_fields() {
        let rec = Record::new(Meta::default(), b"x", b"");
        let mut buf = vec![0u8; rec.storage_size()];
        rec.encode(&mut buf);
        // Claim a 64 MiB image.
        buf[12..16].copy_from_slice(&(64u32 * 1024 * 1024).to_le_bytes());
        assert!(Record::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let image = vec![1u8; 100];
        let rec = Record::new(Meta::default(), &image, &[]);
        let mut buf = vec![0u8; rec.storage_size()];
        rec.encode(&mut buf);
        assert!(Record::decode(&buf[..64]).is_err());
    }

    #[test]
    fn test_validate_limits() {
        let image = vec![0u8; 8];
        let rec = Record::new(Meta::default(), &image, &[]);
        assert!(rec.validate().is_ok());

        let image = vec![0u8; MAX_IMAGE_SIZE + 1];
        let rec = Record::new(Meta::default(), &image, &[]);
        assert!(rec.validate().is_err());
    }
}
