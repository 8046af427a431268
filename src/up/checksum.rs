//! Streaming checksum used by every UART frame (spec §4.3):
//!
//! ```text
//! state_0 = 0xDEADBEEF
//! state_i = state_{i-1} * 31337 + (byte_i XOR 0x5A)   (mod 2^32)
//! output  = state_n XOR 0xADDEDBAD
//! ```

const SEED: u32 = 0xDEAD_BEEF;
const MULTIPLIER: u32 = 31337;
const XOR_BYTE: u8 = 0x5A;
const FINAL_XOR: u32 = 0xADDE_DBAD;

/// Starts a new streaming checksum, optionally continuing from a prior span
/// of bytes (pass `&[]` for a fresh checksum).
pub fn start(bytes: &[u8]) -> u32 {
    add(bytes, SEED)
}

/// Continues a streaming checksum from a previously returned state.
pub fn add(bytes: &[u8], state: u32) -> u32 {
    bytes.iter().fold(state, |state, &byte| {
        state
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(u32::from(byte ^ XOR_BYTE))
    })
}

/// Finalizes a streaming state into the checksum value placed on the wire.
pub const fn finish(state: u32) -> u32 {
    state ^ FINAL_XOR
}

/// Computes the checksum of a single contiguous byte slice.
pub fn checksum(bytes: &[u8]) -> u32 {
    finish(start(bytes))
}
