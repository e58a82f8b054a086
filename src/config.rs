// src/config.rs

//! Dataset geometry and access options.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, StoreError};
use crate::format::{CONTAINER_HEADER_SIZE, MAX_CONTAINER_SIZE};
use crate::io::{DIRECTORY_STORAGE_SIZE, IO_BLOCK_SIZE};

/// Shape of a dataset being written: how many parallel streams, how large
/// each data file may grow, and the capacity of the in-memory containers
/// records are packed into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Geometry {
    /// Number of parallel streams records are striped across.
    pub n_stream: usize,
    /// Maximal size of one data file in bytes.
    pub file_size: u64,
    /// Capacity of one container in bytes.
    pub container_size: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            n_stream: 20,
            file_size: 4 << 30,       // 4 GiB
            container_size: 200 << 20, // 200 MiB
        }
    }
}

impl FromStr for Geometry {
    type Err = StoreError;

    /// Parses a geometry from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        let geometry: Self = toml::from_str(s)
            .map_err(|e| StoreError::config_with_source("failed to parse TOML geometry", e))?;
        geometry.validate()?;
        Ok(geometry)
    }
}

impl Geometry {
    /// Loads a geometry from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::io_with_source(path, "failed to read geometry file", e))?;
        content.parse()
    }

    /// Checks the geometry against the format limits.
    pub fn validate(&self) -> Result<()> {
        if self.n_stream == 0 {
            return Err(StoreError::config("n_stream must be greater than 0"));
        }
        if self.container_size % IO_BLOCK_SIZE != 0 {
            return Err(StoreError::config(format!(
                "container_size must be a multiple of {IO_BLOCK_SIZE}"
            )));
        }
        if self.container_size <= CONTAINER_HEADER_SIZE {
            return Err(StoreError::config(format!(
                "container_size must exceed the container header of {CONTAINER_HEADER_SIZE} bytes"
            )));
        }
        if self.container_size > MAX_CONTAINER_SIZE {
            return Err(StoreError::config(format!(
                "container_size must not exceed {MAX_CONTAINER_SIZE}"
            )));
        }
        if self.file_size < DIRECTORY_STORAGE_SIZE as u64 + self.container_size as u64 {
            return Err(StoreError::config(
                "file_size must hold the directory plus at least one container",
            ));
        }
        Ok(())
    }
}

/// How a dataset is read back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Rotate one record per stream per call instead of draining streams in
    /// sequence.
    pub round_robin: bool,
    /// Restart iteration instead of raising `EndOfStream` after a full
    /// pass.
    pub looping: bool,
}

impl ReadOptions {
    pub fn round_robin() -> Self {
        Self {
            round_robin: true,
            looping: false,
        }
    }

    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }
}

/// How a dataset is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Re-shuffle the stream permutation after every full striping pass, so
    /// consecutive records land on unpredictable streams.
    pub shuffle: bool,
}
