// src/stream/input.rs

//! Read side of a stream: asynchronous single-slot prefetch.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{Result, StoreError};
use crate::format::Container;
use crate::io::{AlignedBuf, DeviceId, DirectFile, IoHandle, IoScheduler};

use super::list_numeric;

/// State shared between the stream and its scheduled prefetch task. At most
/// one task references it at a time, so the lock is never contended.
struct InputState {
    dir: PathBuf,
    file_ids: Vec<u64>,
    /// Index of the next file to open.
    index: usize,
    file: Option<DirectFile>,
    /// Buffer deposited by the last prefetch.
    slot: Option<AlignedBuf>,
    /// Restart from file 0 when the listing is exhausted.
    looping: bool,
}

/// A reader over the data files of one stream directory.
///
/// A prefetch for the next container is always in flight; [`read`] waits for
/// it, steals the buffer, and immediately schedules the next one, so at most
/// one container of I/O is outstanding per stream.
///
/// [`read`]: InputStream::read
pub struct InputStream {
    shared: Arc<Mutex<InputState>>,
    pending: Option<IoHandle>,
    dev: DeviceId,
    io: Arc<IoScheduler>,
    dir: PathBuf,
}

impl InputStream {
    /// Opens the stream at `dir` and schedules the first prefetch.
    ///
    /// With `looping`, the stream restarts from its first file after the
    /// last one drains and never raises `EndOfStream` (unless the stream
    /// holds no records at all).
    pub fn open(io: Arc<IoScheduler>, dir: impl Into<PathBuf>, looping: bool) -> Result<Self> {
        let dir = dir.into();
        let file_ids = list_numeric(&dir, false)?;
        if file_ids.is_empty() {
            return Err(StoreError::corrupt(&dir, "stream directory has no data files"));
        }
        let dev = io.device_for_path(&dir)?;

        let shared = Arc::new(Mutex::new(InputState {
            dir: dir.clone(),
            file_ids,
            index: 0,
            file: None,
            slot: None,
            looping,
        }));
        let mut stream = Self {
            shared,
            pending: None,
            dev,
            io,
            dir,
        };
        stream.pending = Some(stream.schedule_prefetch());
        Ok(stream)
    }

    fn schedule_prefetch(&self) -> IoHandle {
        let shared = Arc::clone(&self.shared);
        self.io.schedule(self.dev, move || prefetch(&shared))
    }

    /// Returns the next container in file order.
    ///
    /// Waits on the pending prefetch, takes its buffer, reschedules, and
    /// parses the buffer into a container. Propagates `EndOfStream` once
    /// every file has drained (non-looping streams only).
    pub fn read(&mut self) -> Result<Container> {
        let pending = match self.pending.take() {
            Some(handle) => handle,
            None => self.schedule_prefetch(),
        };
        pending.wait()?;

        let buf = self
            .shared
            .lock()
            .unwrap()
            .slot
            .take()
            .ok_or_else(|| {
                StoreError::io(&self.dir, "prefetch completed without producing a buffer")
            })?;
        self.pending = Some(self.schedule_prefetch());
        Container::from_buffer(buf)
    }
}

impl Drop for InputStream {
    fn drop(&mut self) {
        // Join the in-flight prefetch before the state goes away.
        if let Some(pending) = self.pending.take() {
            let _ = pending.wait();
        }
    }
}

/// Prefetch body, run on the stream's device worker: open files in integer
/// order and deposit the next container buffer into the slot.
fn prefetch(shared: &Mutex<InputState>) -> Result<()> {
    let mut state = shared.lock().unwrap();

    // One extra pass bounds the scan when every file turns out to be empty.
    for _ in 0..=state.file_ids.len() {
        if state.file.is_none() {
            if state.index >= state.file_ids.len() {
                if state.looping {
                    state.index = 0;
                } else {
                    return Err(StoreError::EndOfStream);
                }
            }
            let path = state.dir.join(state.file_ids[state.index].to_string());
            state.index += 1;
            state.file = Some(DirectFile::open_read(path)?);
        }

        let file = state.file.as_mut().expect("file opened above");
        match file.alloc_read() {
            Ok(buf) => {
                state.slot = Some(buf);
                return Ok(());
            }
            Err(e) if e.is_end_of_stream() => {
                state.file = None;
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::EndOfStream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Meta, Record};
    use crate::io::{global_io, set_direct_io};
    use tempfile::TempDir;

    fn write_stream_files(dir: &std::path::Path, per_file: &[Vec<i32>]) {
        let mut serial_containers = 0;
        for (fid, containers) in per_file.iter().enumerate() {
            let mut file = DirectFile::open_write(dir.join(fid.to_string()), u64::MAX).unwrap();
            for &first in containers.iter() {
                let mut c = Container::empty(4096);
                for serial in first..first + 4 {
                    let image = vec![1u8; 32];
                    let rec = Record::new(Meta { label: 0, serial }, &image, b"");
                    assert!(c.add(&rec).unwrap());
                }
                let (buf, size) = c.pack();
                file.write_free(buf, size).unwrap();
                serial_containers += 1;
            }
            file.finish().unwrap();
        }
        assert!(serial_containers > 0);
    }

    #[test]
    fn test_reads_containers_in_file_order() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        write_stream_files(dir.path(), &[vec![0, 4], vec![8], vec![12, 16]]);

        let mut stream = InputStream::open(global_io(), dir.path(), false).unwrap();
        let mut serials = Vec::new();
        loop {
            match stream.read() {
                Ok(container) => {
                    serials.extend(container.records().map(|r| r.meta.serial));
                }
                Err(e) if e.is_end_of_stream() => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(serials, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_loop_mode_wraps_around() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        write_stream_files(dir.path(), &[vec![0], vec![4]]);

        let mut stream = InputStream::open(global_io(), dir.path(), true).unwrap();
        let mut serials = Vec::new();
        for _ in 0..4 {
            let container = stream.read().unwrap();
            serials.extend(container.records().map(|r| r.meta.serial));
        }
        // Two containers, read twice over.
        assert_eq!(serials, vec![0, 1, 2, 3, 4, 5, 6, 7, 0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_empty_directory_rejected() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        assert!(InputStream::open(global_io(), dir.path(), false).is_err());
    }

    #[test]
    fn test_end_of_stream_after_empty_files() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        // A file with a directory but zero containers.
        DirectFile::open_write(dir.path().join("0"), u64::MAX)
            .unwrap()
            .finish()
            .unwrap();

        let mut stream = InputStream::open(global_io(), dir.path(), false).unwrap();
        assert!(stream.read().unwrap_err().is_end_of_stream());
    }
}
