// src/io/mod.rs

//! Low-level I/O: aligned buffers, direct files, and the per-device
//! scheduler.

use std::sync::atomic::{AtomicBool, Ordering};

pub mod buffer;
pub mod file;
pub mod sched;

pub use buffer::AlignedBuf;
pub use file::DirectFile;
pub use sched::{global_io, DeviceId, IoHandle, IoScheduler};

/// Unit of disk I/O. Every buffer address, offset, and transfer size is a
/// multiple of this, which satisfies the kernel's `O_DIRECT` requirements.
pub const IO_BLOCK_SIZE: usize = 512;

/// Fixed size of the directory region at the front of every data file.
pub const DIRECTORY_STORAGE_SIZE: usize = 4096;

/// Maximum number of containers per data file.
pub const MAX_DIRECTORY: usize = 255;

// Files are opened with O_DIRECT | O_SYNC by default. Filesystems without
// O_DIRECT support (tmpfs) can fall back to buffered positioned I/O; the
// alignment discipline is enforced either way.
static DIRECT_IO: AtomicBool = AtomicBool::new(true);

/// Enables or disables unbuffered direct I/O process-wide.
pub fn set_direct_io(enabled: bool) {
    DIRECT_IO.store(enabled, Ordering::Relaxed);
}

/// Whether files are opened with `O_DIRECT | O_SYNC`.
pub fn direct_io_enabled() -> bool {
    DIRECT_IO.load(Ordering::Relaxed)
}

/// Rounds `n` up to the next multiple of `align` (a power of two or any
/// positive step).
pub(crate) fn round_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}
