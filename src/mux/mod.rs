// src/mux/mod.rs

//! Multiplexing several datasets into decoded training batches.
//!
//! A mux is configured by a plain-text source list, one source per line:
//!
//! ```text
//! <relative_path>  <label_base>  <batch_size>
//! ```
//!
//! Paths resolve against the source list's directory. Every batch draws
//! `batch_size` records from each source, decodes the image payloads on the
//! scheduler's cpu worker, rebases labels by `label_base` (so categorically
//! numbered sources share one global label space), and shuffles the
//! assembled batch. Two batches exist at any time: the one being consumed
//! and the one being built in the background.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use tracing::warn;

use crate::config::ReadOptions;
use crate::dataset::DataSetReader;
use crate::error::{Result, StoreError};
use crate::io::{global_io, IoHandle, IoScheduler};

/// A decoded pixel matrix, produced by the external image codec.
#[derive(Debug, Clone)]
pub struct Pixels {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Vec<u8>,
}

/// The image codec boundary: a pure function from encoded bytes to pixels.
///
/// Codecs are supplied by the caller; the engine treats image payloads as
/// opaque otherwise.
pub trait ImageCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Pixels>;
}

/// One decoded training sample.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Source label rebased into the global label space.
    pub label: i32,
    pub serial: i32,
    pub pixels: Pixels,
    pub extra: Vec<u8>,
}

/// One line of the source list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub path: PathBuf,
    pub label_base: i32,
    pub batch_size: u32,
}

/// Parses the whitespace-delimited source list format.
pub fn parse_source_list(text: &str) -> Result<Vec<SourceSpec>> {
    let mut sources = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(path), Some(base), Some(batch)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(StoreError::config(format!(
                "source list line {}: expected '<path> <label_base> <batch_size>'",
                lineno + 1
            )));
        };
        let label_base: i32 = base.parse().map_err(|_| {
            StoreError::config(format!(
                "source list line {}: invalid label base '{base}'",
                lineno + 1
            ))
        })?;
        let batch_size: u32 = batch.parse().map_err(|_| {
            StoreError::config(format!(
                "source list line {}: invalid batch size '{batch}'",
                lineno + 1
            ))
        })?;
        if batch_size == 0 {
            return Err(StoreError::config(format!(
                "source list line {}: batch size must be greater than 0",
                lineno + 1
            )));
        }
        sources.push(SourceSpec {
            path: PathBuf::from(path),
            label_base,
            batch_size,
        });
    }
    if sources.is_empty() {
        return Err(StoreError::config("source list names no sources"));
    }
    Ok(sources)
}

struct MuxSource {
    path: PathBuf,
    reader: DataSetReader,
    label_base: i32,
    batch_size: u32,
}

struct MuxState {
    sources: Vec<MuxSource>,
    codec: Arc<dyn ImageCodec>,
    /// Output slot of the background batch build.
    batch: Vec<Sample>,
}

/// Multiplexes several looping datasets into shuffled, decoded batches.
pub struct DataMux {
    io: Arc<IoScheduler>,
    shared: Arc<Mutex<MuxState>>,
    pending: Option<IoHandle>,
    current: VecDeque<Sample>,
    batch_size: usize,
}

impl DataMux {
    /// Opens every source named by the list at `config_path` and schedules
    /// the first batch build.
    pub fn open(config_path: impl AsRef<Path>, codec: Arc<dyn ImageCodec>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let text = std::fs::read_to_string(config_path)
            .map_err(|e| StoreError::io_with_source(config_path, "failed to read source list", e))?;
        let specs = parse_source_list(&text)?;
        let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

        let io = global_io();
        let mut batch_size = 0usize;
        let mut sources = Vec::with_capacity(specs.len());
        for spec in specs {
            let path = base_dir.join(&spec.path);
            let reader = DataSetReader::open(
                &path,
                ReadOptions {
                    round_robin: false,
                    looping: true,
                },
            )?;
            batch_size += spec.batch_size as usize;
            sources.push(MuxSource {
                path,
                reader,
                label_base: spec.label_base,
                batch_size: spec.batch_size,
            });
        }

        let shared = Arc::new(Mutex::new(MuxState {
            sources,
            codec,
            batch: Vec::new(),
        }));
        let mut mux = Self {
            io,
            shared,
            pending: None,
            current: VecDeque::new(),
            batch_size,
        };
        mux.pending = Some(mux.schedule_prefetch());
        Ok(mux)
    }

    /// Records per assembled batch, summed over all sources.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn schedule_prefetch(&self) -> IoHandle {
        let shared = Arc::clone(&self.shared);
        self.io.schedule(self.io.cpu(), move || build_batch(&shared))
    }

    /// Returns the next sample, swapping in the prefetched batch when the
    /// current one is consumed.
    pub fn read(&mut self) -> Result<Sample> {
        if self.current.is_empty() {
            let pending = match self.pending.take() {
                Some(handle) => handle,
                None => self.schedule_prefetch(),
            };
            pending.wait()?;
            self.current = {
                let mut state = self.shared.lock().unwrap();
                std::mem::take(&mut state.batch)
            }
            .into();
            self.pending = Some(self.schedule_prefetch());
            if self.current.is_empty() {
                return Err(StoreError::EndOfStream);
            }
        }
        Ok(self.current.pop_front().expect("batch not empty"))
    }
}

impl Drop for DataMux {
    fn drop(&mut self) {
        // Join the in-flight batch build before the sources go away.
        if let Some(pending) = self.pending.take() {
            let _ = pending.wait();
        }
    }
}

/// Batch build body, run on the cpu worker: pull, decode, rebase, shuffle.
fn build_batch(shared: &Mutex<MuxState>) -> Result<()> {
    let mut state = shared.lock().unwrap();
    let codec = Arc::clone(&state.codec);

    let mut batch = Vec::new();
    for source in &mut state.sources {
        let want = source.batch_size;
        let mut got = 0u32;
        while got < want {
            let record = match source.reader.read() {
                Ok(record) => record,
                Err(e) if e.is_end_of_stream() => break,
                Err(e) => return Err(e),
            };
            match codec.decode(record.image) {
                Ok(pixels) => {
                    batch.push(Sample {
                        label: record.meta.label + source.label_base,
                        serial: record.meta.serial,
                        pixels,
                        extra: record.extra.to_vec(),
                    });
                    got += 1;
                }
                Err(e) => {
                    warn!(
                        serial = record.meta.serial,
                        source = %source.path.display(),
                        "skipping undecodable image: {e}"
                    );
                }
            }
        }
    }

    batch.shuffle(&mut rand::thread_rng());
    state.batch = batch;
    Ok(())
}
