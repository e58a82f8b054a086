// src/dataset/mod.rs

//! Datasets: striped collections of parallel streams.
//!
//! A dataset directory holds subdirectories `0` .. `n_stream-1`, each a
//! stream. Writes stripe records across all streams one record at a time;
//! reads either drain streams in sequence or rotate one record per stream
//! per call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::warn;

use crate::config::{Geometry, ReadOptions, WriteOptions};
use crate::error::{Result, StoreError};
use crate::format::{Container, Record};
use crate::io::{global_io, IoScheduler};
use crate::stream::{list_numeric, InputStream, OutputStream};

mod rotate;

pub use rotate::{rotate, verify_content};

/// Reads only the stream listing of a dataset directory: the sorted stream
/// ids.
pub fn ping(dir: impl AsRef<Path>) -> Result<Vec<u64>> {
    list_numeric(dir.as_ref(), true)
}

struct WriteSub {
    stream: OutputStream,
    container: Option<Container>,
}

/// Writes a new dataset, striping records across `n_stream` output streams.
///
/// One mutable container per stream accumulates records; a full container is
/// handed to its stream (which flushes it in the background) and replaced.
/// [`finish`] flushes the partial containers and persists every file; it is
/// also attempted on drop.
///
/// [`finish`]: DataSetWriter::finish
pub struct DataSetWriter {
    geometry: Geometry,
    subs: Vec<WriteSub>,
    /// Permutation of stream indices the current striping pass follows.
    write_index: Vec<usize>,
    next: usize,
    shuffle: bool,
}

impl DataSetWriter {
    /// Creates the dataset directory layout and its output streams.
    ///
    /// Data files are created exclusively, so writing over an existing
    /// dataset fails at the first flush.
    pub fn create(
        dir: impl AsRef<Path>,
        geometry: Geometry,
        options: WriteOptions,
    ) -> Result<Self> {
        geometry.validate()?;
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::io_with_source(dir, "failed to create dataset directory", e))?;

        let io = global_io();
        let mut subs = Vec::with_capacity(geometry.n_stream);
        for i in 0..geometry.n_stream {
            let sub_dir = dir.join(i.to_string());
            std::fs::create_dir_all(&sub_dir).map_err(|e| {
                StoreError::io_with_source(&sub_dir, "failed to create stream directory", e)
            })?;
            let stream = OutputStream::create(Arc::clone(&io), &sub_dir, geometry.file_size)?;
            subs.push(WriteSub {
                stream,
                container: Some(Container::empty(geometry.container_size)),
            });
        }

        Ok(Self {
            geometry,
            write_index: (0..subs.len()).collect(),
            subs,
            next: 0,
            shuffle: options.shuffle,
        })
    }

    /// Appends one record to the stream the current striping pass selects.
    pub fn write(&mut self, record: &Record<'_>) -> Result<()> {
        let sub = &mut self.subs[self.write_index[self.next]];
        loop {
            let container = sub.container.as_mut().expect("container present");
            if container.add(record)? {
                break;
            }
            if container.is_empty() {
                return Err(StoreError::config(format!(
                    "record of {} bytes does not fit an empty container of {} bytes",
                    record.storage_size(),
                    self.geometry.container_size
                )));
            }
            let full = sub.container.take().expect("container present");
            sub.stream.write(full)?;
            sub.container = Some(Container::empty(self.geometry.container_size));
        }

        self.next += 1;
        if self.next == self.subs.len() {
            self.next = 0;
            if self.shuffle {
                self.write_index.shuffle(&mut rand::thread_rng());
            }
        }
        Ok(())
    }

    /// Flushes every non-empty per-stream container and persists all files.
    pub fn finish(&mut self) -> Result<()> {
        for sub in &mut self.subs {
            if let Some(container) = sub.container.take() {
                if !container.is_empty() {
                    sub.stream.write(container)?;
                }
            }
            sub.stream.finish()?;
        }
        Ok(())
    }
}

impl Drop for DataSetWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("failed to finish dataset writer: {e}");
        }
    }
}

struct ReadSub {
    id: u64,
    /// `None` once exhausted within the current pass (looping sequential
    /// iteration only; other modes drop exhausted subs).
    stream: Option<InputStream>,
    container: Option<Container>,
    offset: usize,
}

impl ReadSub {
    fn consumed(&self) -> bool {
        self.container
            .as_ref()
            .map_or(true, |c| self.offset >= c.len())
    }
}

/// Reads an existing dataset.
///
/// Iteration order depends on [`ReadOptions`]:
///
/// - default: drain stream 0, then stream 1, …; `EndOfStream` after the
///   last.
/// - `round_robin`: one record per stream per call; exhausted streams drop
///   out.
/// - `looping`: drain streams in sequence, skip exhausted ones, and restart
///   every stream once all are exhausted; never ends.
/// - `round_robin` + `looping`: infinite round-robin over streams that
///   individually restart from their first file.
pub struct DataSetReader {
    dir: PathBuf,
    subs: Vec<ReadSub>,
    next: usize,
    options: ReadOptions,
    io: Arc<IoScheduler>,
    /// Whether the current looping pass has yielded a record; guards
    /// against spinning on a dataset with no records at all.
    pass_progress: bool,
}

impl DataSetReader {
    /// Opens the dataset at `dir` with one input stream per subdirectory.
    pub fn open(dir: impl AsRef<Path>, options: ReadOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let ids = list_numeric(&dir, true)?;
        if ids.is_empty() {
            return Err(StoreError::corrupt(&dir, "dataset has no stream directories"));
        }

        let io = global_io();
        // Individual streams only loop in round-robin mode; looping
        // sequential iteration restarts whole passes instead.
        let stream_loop = options.round_robin && options.looping;
        let mut subs = Vec::with_capacity(ids.len());
        for id in ids {
            let stream = InputStream::open(Arc::clone(&io), dir.join(id.to_string()), stream_loop)?;
            subs.push(ReadSub {
                id,
                stream: Some(stream),
                container: None,
                offset: 0,
            });
        }

        Ok(Self {
            dir,
            subs,
            next: 0,
            options,
            io,
            pass_progress: false,
        })
    }

    /// Returns the next record according to the configured iteration order.
    ///
    /// The record borrows from the reader's current container and is valid
    /// until the next call.
    pub fn read(&mut self) -> Result<Record<'_>> {
        let idx = self.position()?;
        self.pass_progress = true;
        let sub = &mut self.subs[idx];
        let offset = sub.offset;
        sub.offset += 1;
        let record = sub
            .container
            .as_ref()
            .expect("container loaded")
            .get(offset)
            .expect("offset within container");
        Ok(record)
    }

    /// Finds a sub with a record available at its cursor, loading containers
    /// and handling exhausted streams along the way. Leaves `self.next`
    /// positioned for the call after this one.
    fn position(&mut self) -> Result<usize> {
        if self.options.looping && !self.options.round_robin {
            return self.position_looping_sequential();
        }

        loop {
            if self.subs.is_empty() {
                return Err(StoreError::EndOfStream);
            }
            if self.next >= self.subs.len() {
                self.next = 0;
            }
            let idx = self.next;
            let sub = &mut self.subs[idx];

            if sub.consumed() {
                match sub.stream.as_mut().expect("stream open").read() {
                    Ok(container) => {
                        sub.container = Some(container);
                        sub.offset = 0;
                    }
                    Err(e) if e.is_end_of_stream() => {
                        // The following streams shift down one slot; `next`
                        // already points at the successor.
                        self.subs.remove(idx);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            self.next = if self.options.round_robin {
                (idx + 1) % self.subs.len()
            } else {
                idx
            };
            return Ok(idx);
        }
    }

    fn position_looping_sequential(&mut self) -> Result<usize> {
        loop {
            if self.subs.iter().all(|s| s.stream.is_none()) {
                if !self.pass_progress {
                    return Err(StoreError::EndOfStream);
                }
                // Pass complete; reopen every stream for the next one.
                self.pass_progress = false;
                for sub in &mut self.subs {
                    let path = self.dir.join(sub.id.to_string());
                    sub.stream = Some(InputStream::open(Arc::clone(&self.io), path, false)?);
                    sub.container = None;
                    sub.offset = 0;
                }
                self.next = 0;
            }
            if self.next >= self.subs.len() {
                self.next = 0;
            }
            let idx = self.next;
            if self.subs[idx].stream.is_none() {
                self.next = idx + 1;
                continue;
            }
            let sub = &mut self.subs[idx];

            if sub.consumed() {
                match sub.stream.as_mut().expect("stream open").read() {
                    Ok(container) => {
                        sub.container = Some(container);
                        sub.offset = 0;
                    }
                    Err(e) if e.is_end_of_stream() => {
                        sub.stream = None;
                        sub.container = None;
                        self.next = idx + 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            self.next = idx;
            return Ok(idx);
        }
    }

    /// Number of live streams.
    pub fn stream_count(&self) -> usize {
        self.subs.len()
    }
}
