// src/lib.rs

//! pixpack - striped direct-I/O storage for image-record training datasets
//!
//! This crate packs millions of small image records into CRC-protected
//! containers, stripes them across parallel streams of direct-I/O data
//! files, and reads them back sequentially or round-robin at device
//! bandwidth, overlapping computation with storage latency through
//! per-device worker threads and single-slot prefetch.
//!
//! The main entry points:
//!
//! - [`DataSetWriter`] / [`DataSetReader`]: striped datasets of records.
//! - [`DataMux`]: several datasets multiplexed into decoded, shuffled
//!   training batches.
//! - [`rotate`] / [`verify_content`]: offline re-striping and checking.

pub mod config;
pub mod dataset;
pub mod error;
pub mod format;
pub mod io;
pub mod mux;
pub mod stream;

// Re-export commonly used types for convenience
pub use config::{Geometry, ReadOptions, WriteOptions};
pub use dataset::{ping, rotate, verify_content, DataSetReader, DataSetWriter};
pub use error::{Result, StoreError};
pub use format::{set_crc_checking, Container, Meta, Record};
pub use io::{global_io, set_direct_io, DirectFile, IoScheduler};
pub use mux::{DataMux, ImageCodec, Pixels, Sample, SourceSpec};
pub use stream::{InputStream, OutputStream};
