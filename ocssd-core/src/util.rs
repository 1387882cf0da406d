// vim: tw=80
//! Common utility functions used throughout the library

/// Number of bits needed to represent every value in `0..count`.
///
/// That is `ceil(log2(count))`, with 0 for counts of 0 or 1.
pub fn bits_for(count: u64) -> u8 {
    if count <= 1 {
        0
    } else {
        (u64::BITS - (count - 1).leading_zeros()) as u8
    }
}

/// Mask of the `len` least significant bits
pub fn mask(len: u8) -> u64 {
    if len >= 64 {
        u64::MAX
    } else {
        (1u64 << len) - 1
    }
}

// LCOV_EXCL_STOP
