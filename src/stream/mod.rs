// src/stream/mod.rs

//! Streams: ordered sequences of data files in one directory.
//!
//! Files are named `0`, `1`, `2`, … and visited in integer order. An input
//! stream keeps exactly one prefetched container in flight; an output stream
//! keeps exactly one flush in flight and rolls over to the next file id when
//! the current file reports it is full. Each stream is bound to the device
//! slot its directory lives on.

use std::path::Path;

use tracing::warn;

use crate::error::{Result, StoreError};

pub mod input;
pub mod output;

pub use input::InputStream;
pub use output::OutputStream;

/// Lists the integer-named children of `dir` in ascending order.
///
/// Non-integer names are skipped with a complaint; they are not part of the
/// layout.
pub(crate) fn list_numeric(dir: &Path, directories: bool) -> Result<Vec<u64>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| StoreError::io_with_source(dir, "failed to list directory", e))?;

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|e| StoreError::io_with_source(dir, "failed to read directory entry", e))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| StoreError::io_with_source(dir, "failed to stat directory entry", e))?
            .is_dir();
        if is_dir != directories {
            continue;
        }
        let name = entry.file_name();
        match name.to_str().and_then(|s| s.parse::<u64>().ok()) {
            Some(id) => ids.push(id),
            None => warn!(
                dir = %dir.display(),
                name = %name.to_string_lossy(),
                "ignoring non-integer entry"
            ),
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Reads only the file listing of a stream directory: the sorted file ids.
pub fn ping(dir: impl AsRef<Path>) -> Result<Vec<u64>> {
    list_numeric(dir.as_ref(), false)
}
