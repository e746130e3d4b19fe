//! Wire-level definitions shared by the guest transport and the host stream renderer.
//!
//! Everything here is little-endian and laid out in 32-bit words. 64-bit identities (fence
//! handles, device handles, image handles) travel as two consecutive `lo`/`hi` words.

#![forbid(unsafe_code)]

pub mod stream_cmd;
pub mod transfer;

pub use stream_cmd::{StreamCmd, StreamDecodeError, StreamOpcode};
pub use transfer::{ResourceFormat, TransferBox, TransferError, TransferLayout};

/// Split a 64-bit value into its `(lo, hi)` 32-bit halves.
#[inline]
pub const fn split_u64(v: u64) -> (u32, u32) {
    (v as u32, (v >> 32) as u32)
}

/// Recombine a `lo`/`hi` pair into a 64-bit value.
#[inline]
pub const fn join_u64(lo: u32, hi: u32) -> u64 {
    (lo as u64) | ((hi as u64) << 32)
}
