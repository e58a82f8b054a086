// src/io/sched.rs

//! Per-device I/O scheduling.
//!
//! Each physical disk gets one worker thread running a single-task-at-a-time
//! FIFO loop, so concurrent streams on the same disk never interleave their
//! requests, while streams on different disks proceed in parallel. A
//! dedicated pseudo-device ("cpu") carries non-I/O work such as image
//! decoding.
//!
//! [`IoScheduler::schedule`] enqueues a task and returns a completion handle;
//! the caller blocks on [`IoHandle::wait`] at its next suspension point.
//! Task failures travel through the handle; workers never abort on them.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use tracing::info;

use crate::error::{Result, StoreError};

type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct Job {
    task: Task,
    done: Sender<Result<()>>,
}

/// Opaque handle to one worker slot of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(usize);

/// Completion handle for a scheduled task.
///
/// Becomes ready exactly when the task's function returns, normally or with
/// an error.
#[derive(Debug)]
pub struct IoHandle {
    rx: Receiver<Result<()>>,
}

impl IoHandle {
    /// Blocks until the task completes and returns its result.
    pub fn wait(self) -> Result<()> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(StoreError::io(
                "<scheduler>",
                "I/O worker exited before completing the task",
            )),
        }
    }
}

struct Worker {
    tx: Sender<Job>,
    thread: Option<JoinHandle<()>>,
}

/// The per-device worker pool.
///
/// Constructed once per process through [`global_io`]; dropping the last
/// reference drains the queues and joins every worker. The device table is
/// immutable after construction.
pub struct IoScheduler {
    /// Physical-disk identifier to worker-slot index, fixed at
    /// construction.
    by_disk: HashMap<i64, usize>,
    workers: Vec<Worker>,
    cpu: DeviceId,
}

/// Coarsens a device number into a physical-disk identifier, folding the
/// partitions of one disk onto a single worker (Linux allots 16 minor
/// numbers per disk).
fn physical_disk_id(dev: u64) -> i64 {
    (dev / 16) as i64
}

fn spawn_worker(workers: &mut Vec<Worker>, name: &str) -> usize {
    let (tx, rx) = unbounded::<Job>();
    let thread = std::thread::Builder::new()
        .name(format!("pixpack-io-{name}"))
        .spawn(move || worker_loop(rx))
        .expect("failed to spawn I/O worker thread");
    workers.push(Worker {
        tx,
        thread: Some(thread),
    });
    workers.len() - 1
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        let result = (job.task)();
        // The awaiting side may already be gone; completion is then
        // unobserved.
        let _ = job.done.send(result);
    }
}

impl IoScheduler {
    fn new() -> Self {
        let mut by_disk = HashMap::new();
        let mut workers = Vec::new();
        let cpu = DeviceId(spawn_worker(&mut workers, "cpu"));
        Self::scan_mounts(&mut by_disk, &mut workers);
        Self {
            by_disk,
            workers,
            cpu,
        }
    }

    /// Scans the mount table once, assigning every mounted filesystem's
    /// disk a worker slot. Slots are keyed by the mount point's filesystem
    /// device id, which is what `stat` reports for every file below it, so
    /// non-block filesystems such as tmpfs are covered too. This is the
    /// sole source of slots; paths on devices mounted later are rejected.
    fn scan_mounts(by_disk: &mut HashMap<i64, usize>, workers: &mut Vec<Worker>) {
        let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
            return;
        };
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(_dev), Some(dir)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(meta) = std::fs::metadata(dir) else {
                continue;
            };
            let disk = physical_disk_id(meta.dev());
            if !by_disk.contains_key(&disk) {
                let slot = spawn_worker(workers, &format!("disk{disk}"));
                by_disk.insert(disk, slot);
            }
            info!(mount = dir, disk, "found mount");
        }
    }

    /// The pseudo-device for compute tasks.
    pub fn cpu(&self) -> DeviceId {
        self.cpu
    }

    /// Resolves a path to its device slot by `stat`.
    ///
    /// The device table is fixed at construction; a path on a device that
    /// was not mounted when the scheduler started is a fatal error.
    pub fn device_for_path(&self, path: &Path) -> Result<DeviceId> {
        let meta = std::fs::metadata(path)
            .map_err(|e| StoreError::io_with_source(path, "failed to stat path", e))?;
        let disk = physical_disk_id(meta.dev());

        match self.by_disk.get(&disk) {
            Some(&slot) => Ok(DeviceId(slot)),
            None => Err(StoreError::io(
                path,
                format!("device {disk} is not in the mount table scanned at startup"),
            )),
        }
    }

    /// Enqueues `task` on `device` and returns its completion handle.
    ///
    /// Never blocks the caller. Tasks on the same device run in FIFO order;
    /// tasks on different devices run concurrently.
    pub fn schedule<F>(&self, device: DeviceId, task: F) -> IoHandle
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let (done_tx, done_rx) = bounded(1);
        // A failed send drops the job and its completion sender; the handle
        // then reports the worker as gone.
        let _ = self.workers[device.0].tx.send(Job {
            task: Box::new(task),
            done: done_tx,
        });
        IoHandle { rx: done_rx }
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        for worker in self.workers.drain(..) {
            let Worker { tx, thread } = worker;
            // Closing the channel lets the worker drain its queue and exit.
            drop(tx);
            if let Some(thread) = thread {
                let _ = thread.join();
            }
        }
    }
}

static GLOBAL: Mutex<Option<Weak<IoScheduler>>> = Mutex::new(None);

/// Returns the process-wide scheduler, creating it on first use.
///
/// Every dataset and mux holds one reference; when the last reference drops,
/// the scheduler's workers drain and join. A later call starts a fresh one.
pub fn global_io() -> Arc<IoScheduler> {
    let mut slot = GLOBAL.lock().unwrap();
    if let Some(existing) = slot.as_ref().and_then(Weak::upgrade) {
        return existing;
    }
    let sched = Arc::new(IoScheduler::new());
    *slot = Some(Arc::downgrade(&sched));
    sched
}
