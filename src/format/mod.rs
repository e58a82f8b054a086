// src/format/mod.rs

//! Binary serialization of records and containers.

pub mod container;
pub mod crc;
pub mod record;

pub use container::{Container, CONTAINER_HEADER_SIZE, CONTAINER_MAGIC, MAX_CONTAINER_SIZE};
pub use crc::{checksum, crc_checking_enabled, set_crc_checking};
pub use record::{
    Meta, Record, HEADER_ALIGN, MAX_EXTRA_SIZE, MAX_IMAGE_SIZE, RECORD_HEADER_SIZE, RECORD_MAGIC,
};
