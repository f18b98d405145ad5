// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `util` module provides a repository of commonly used utility functions sorted into
//! distinct categories.

pub mod bits {
    //! Utilities for bit manipulation.

    /// Sign extends an arbitrary, 32-bit or less, signed two's complement integer stored within
    /// an u32 to a full width i32.
    #[inline(always)]
    pub fn sign_extend_leq32_to_i32(value: u32, width: u32) -> i32 {
        // Rust uses an arithmetic shift right (the original sign bit is repeatedly shifted on)
        // for signed integer types. Therefore, shift the value to the left-hand side of the
        // integer, then shift it back to extend the sign bit.
        (value.wrapping_shl(32 - width) as i32).wrapping_shr(32 - width)
    }

    /// Sign extends an arbitrary, 64-bit or less, signed two's complement integer stored within
    /// an u64 to a full width i64.
    #[inline(always)]
    pub fn sign_extend_leq64_to_i64(value: u64, width: u32) -> i64 {
        (value.wrapping_shl(64 - width) as i64).wrapping_shr(64 - width)
    }

    /// Truncates a signed integer to an arbitrary bit width, returning the unsigned bit pattern.
    /// The inverse of `sign_extend_leq32_to_i32`.
    #[inline(always)]
    pub fn truncate_i32_to_leq32(value: i32, width: u32) -> u32 {
        debug_assert!(width >= 1 && width <= 32);
        (value as u32) & (!0u32).wrapping_shr(32 - width)
    }

    /// Returns the number of bits required to represent `value` in an unsigned binary
    /// representation, i.e. `floor(log2(value)) + 1` for a non-zero value, and 0 for zero.
    #[inline(always)]
    pub fn bit_width_u64(value: u64) -> u32 {
        u64::BITS - value.leading_zeros()
    }

}
