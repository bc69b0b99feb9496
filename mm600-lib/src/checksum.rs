//! Checksums used at the different protocol layers.
//!
//! The Minimed envelope carries a one-byte additive checksum. The NGP frame,
//! the decrypted ComD payload and every decompressed history block carry a
//! CCITT CRC-16 seeded with `0xFFFF` (CRC-16/IBM-3740).

use crate::error::PumpError;
use crc::{CRC_16_IBM_3740, Crc};

const CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Additive checksum: `sum(bytes) mod 256`.
pub fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// CCITT CRC-16 with a `0xFFFF` seed.
pub fn crc16(bytes: &[u8]) -> u16 {
    CCITT.checksum(bytes)
}

pub fn verify_sum8(bytes: &[u8], expected: u8) -> Result<(), PumpError> {
    let computed = sum8(bytes);
    if computed != expected {
        return Err(PumpError::Checksum {
            expected: expected as u16,
            computed: computed as u16,
        });
    }
    Ok(())
}

pub fn verify_crc16(bytes: &[u8], expected: u16) -> Result<(), PumpError> {
    let computed = crc16(bytes);
    if computed != expected {
        return Err(PumpError::Checksum { expected, computed });
    }
    Ok(())
}
