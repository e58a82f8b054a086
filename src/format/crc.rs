// src/format/crc.rs

//! Container payload checksums.
//!
//! The on-disk format uses CRC-32C (Castagnoli polynomial, reflected input
//! and output) with an initial value of zero and no final xor. These are the
//! parameters the hardware `crc32` instruction family computes directly, so
//! accelerated writers and this table-driven implementation produce
//! bit-identical checksums.

use std::sync::atomic::{AtomicBool, Ordering};

use crc::{Algorithm, Crc};

const CRC32C_RAW: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x1edc6f41,
    init: 0x00000000,
    refin: true,
    refout: true,
    xorout: 0x00000000,
    check: 0x58e3fa20,
    residue: 0x00000000,
};

const CRC: Crc<u32> = Crc::<u32>::new(&CRC32C_RAW);

/// Computes the checksum of `data`.
pub fn checksum(data: &[u8]) -> u32 {
    CRC.checksum(data)
}

// Verification can be switched off for trusted local reads; magic numbers
// are still validated.
static CRC_CHECKING: AtomicBool = AtomicBool::new(true);

/// Enables or disables checksum verification on read, process-wide.
pub fn set_crc_checking(enabled: bool) {
    CRC_CHECKING.store(enabled, Ordering::Relaxed);
}

/// Whether container checksums are verified when parsing.
pub fn crc_checking_enabled() -> bool {
    CRC_CHECKING.load(Ordering::Relaxed)
}
