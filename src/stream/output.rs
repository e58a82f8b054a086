// src/stream/output.rs

//! Write side of a stream: asynchronous single-slot flush with file
//! rollover.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::format::Container;
use crate::io::{AlignedBuf, DeviceId, DirectFile, IoHandle, IoScheduler};

/// State shared between the stream and its scheduled flush task.
struct OutputState {
    dir: PathBuf,
    /// Id of the next file to create.
    next_id: u64,
    file: Option<DirectFile>,
    file_size: u64,
}

/// A writer appending containers to the data files of one stream directory.
///
/// [`write`] packs the container, hands its buffer to a flush task on the
/// stream's device, and returns; the previous flush is awaited first, so at
/// most one container of I/O is outstanding per stream. When the current
/// file raises `EndOfSpace` the flush closes it and retries once on the next
/// integer-named file.
///
/// [`write`]: OutputStream::write
pub struct OutputStream {
    shared: Arc<Mutex<OutputState>>,
    pending: Option<IoHandle>,
    dev: DeviceId,
    io: Arc<IoScheduler>,
}

impl OutputStream {
    /// Creates a writer over the existing directory `dir`. Data files are
    /// created lazily, capped at `file_size` bytes each.
    pub fn create(
        io: Arc<IoScheduler>,
        dir: impl Into<PathBuf>,
        file_size: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        let dev = io.device_for_path(&dir)?;
        Ok(Self {
            shared: Arc::new(Mutex::new(OutputState {
                dir,
                next_id: 0,
                file: None,
                file_size,
            })),
            pending: None,
            dev,
            io,
        })
    }

    /// Queues `container` for writing. Waits for the previous flush, then
    /// detaches the packed buffer into a new flush task and returns.
    pub fn write(&mut self, container: Container) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            pending.wait()?;
        }
        let (buf, size) = container.pack();
        let shared = Arc::clone(&self.shared);
        self.pending = Some(self.io.schedule(self.dev, move || flush(&shared, buf, size)));
        Ok(())
    }

    /// Waits for the in-flight flush and persists the current file's
    /// directory. The stream can keep writing afterwards; a new file is
    /// opened on the next flush.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            pending.wait()?;
        }
        let mut state = self.shared.lock().unwrap();
        if let Some(mut file) = state.file.take() {
            file.finish()?;
        }
        Ok(())
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("failed to finish output stream: {e}");
        }
    }
}

/// Flush body, run on the stream's device worker.
fn flush(shared: &Mutex<OutputState>, buf: AlignedBuf, size: usize) -> Result<()> {
    let mut state = shared.lock().unwrap();
    let file_size = state.file_size;

    for _ in 0..2 {
        if state.file.is_none() {
            let path = state.dir.join(state.next_id.to_string());
            state.next_id += 1;
            debug!(path = %path.display(), "opening next output file");
            state.file = Some(DirectFile::open_write(path, file_size)?);
        }

        let file = state.file.as_mut().expect("file opened above");
        if file.has_space(size) {
            return file.write_free(buf, size);
        }
        let mut full = state.file.take().expect("file opened above");
        full.finish()?;
    }

    Err(StoreError::config(format!(
        "container of {size} bytes exceeds the file capacity {file_size}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Meta, Record};
    use crate::io::{global_io, set_direct_io, DIRECTORY_STORAGE_SIZE};
    use crate::stream::{list_numeric, InputStream};
    use tempfile::TempDir;

    fn small_container(first_serial: i32) -> Container {
        let mut c = Container::empty(1024);
        for serial in first_serial..first_serial + 8 {
            let image = vec![7u8; 24];
            let rec = Record::new(Meta { label: 0, serial }, &image, b"");
            assert!(c.add(&rec).unwrap());
        }
        c
    }

    #[test]
    fn test_write_and_read_back() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();

        let mut out = OutputStream::create(global_io(), dir.path(), 1 << 20).unwrap();
        for i in 0..4 {
            out.write(small_container(i * 8)).unwrap();
        }
        out.finish().unwrap();

        let mut input = InputStream::open(global_io(), dir.path(), false).unwrap();
        let mut serials = Vec::new();
        loop {
            match input.read() {
                Ok(c) => serials.extend(c.records().map(|r| r.meta.serial)),
                Err(e) if e.is_end_of_stream() => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(serials, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_rollover_to_next_file() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();

        // Each container packs to 512 bytes; each file fits exactly two.
        let file_size = (DIRECTORY_STORAGE_SIZE + 2 * 512) as u64;
        let mut out = OutputStream::create(global_io(), dir.path(), file_size).unwrap();
        for i in 0..5 {
            out.write(small_container(i * 8)).unwrap();
        }
        out.finish().unwrap();

        let files = list_numeric(dir.path(), false).unwrap();
        assert_eq!(files, vec![0, 1, 2]);

        // Order survives the rollover.
        let mut input = InputStream::open(global_io(), dir.path(), false).unwrap();
        let mut serials = Vec::new();
        loop {
            match input.read() {
                Ok(c) => serials.extend(c.records().map(|r| r.meta.serial)),
                Err(e) if e.is_end_of_stream() => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(serials, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_oversized_container_is_fatal() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();

        // No file can hold even one container of this size.
        let file_size = DIRECTORY_STORAGE_SIZE as u64;
        let mut out = OutputStream::create(global_io(), dir.path(), file_size).unwrap();
        out.write(small_container(0)).unwrap();
        let err = out.finish().unwrap_err();
        assert!(matches!(err, StoreError::Config { .. }));
    }
}
