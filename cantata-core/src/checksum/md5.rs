// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp;

use crate::io::Monitor;

/// Per-round left-rotation amounts (RFC 1321).
#[rustfmt::skip]
const S: [u32; 64] = [
    7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22,
    5,  9, 14, 20, 5,  9, 14, 20, 5,  9, 14, 20, 5,  9, 14, 20,
    4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23,
    6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
];

/// Sine-derived additive constants, K[i] = floor(2^32 * abs(sin(i + 1))) (RFC 1321).
#[rustfmt::skip]
const K: [u32; 64] = [
    0xd76a_a478, 0xe8c7_b756, 0x2420_70db, 0xc1bd_ceee,
    0xf57c_0faf, 0x4787_c62a, 0xa830_4613, 0xfd46_9501,
    0x6980_98d8, 0x8b44_f7af, 0xffff_5bb1, 0x895c_d7be,
    0x6b90_1122, 0xfd98_7193, 0xa679_438e, 0x49b4_0821,
    0xf61e_2562, 0xc040_b340, 0x265e_5a51, 0xe9b6_c7aa,
    0xd62f_105d, 0x0244_1453, 0xd8a1_e681, 0xe7d3_fbc8,
    0x21e1_cde6, 0xc337_07d6, 0xf4d5_0d87, 0x455a_14ed,
    0xa9e3_e905, 0xfcef_a3f8, 0x676f_02d9, 0x8d2a_4c8a,
    0xfffa_3942, 0x8771_f681, 0x6d9d_6122, 0xfde5_380c,
    0xa4be_ea44, 0x4bde_cfa9, 0xf6bb_4b60, 0xbebf_bc70,
    0x289b_7ec6, 0xeaa1_27fa, 0xd4ef_3085, 0x0488_1d05,
    0xd9d4_d039, 0xe6db_99e5, 0x1fa2_7cf8, 0xc4ac_5665,
    0xf429_2244, 0x432a_ff97, 0xab94_23a7, 0xfc93_a039,
    0x655b_59c3, 0x8f0c_cc92, 0xffef_f47d, 0x8584_5dd1,
    0x6fa8_7e4f, 0xfe2c_e6e0, 0xa301_4314, 0x4e08_11a1,
    0xf753_7e82, 0xbd3a_f235, 0x2ad7_d2bb, 0xeb86_d391,
];

/// Performs one MD5 transformation over a full 64-byte block.
fn transform(state: &mut [u32; 4], block: &[u8]) {
    // Assert to hopefully force the compiler to elide bounds checks on block.
    assert!(block.len() == 64);

    // The message block as sixteen little-endian 32-bit words.
    let mut m = [0u32; 16];

    for (word, bytes) in m.iter_mut().zip(block.chunks_exact(4)) {
        *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }

    let [mut a, mut b, mut c, mut d] = *state;

    for i in 0..64 {
        // Round function and message word index for each of the four rounds.
        let (f, g) = match i >> 4 {
            0 => (d ^ (b & (c ^ d)), i),
            1 => (c ^ (d & (b ^ c)), (5 * i + 1) & 0xf),
            2 => (b ^ c ^ d, (3 * i + 5) & 0xf),
            _ => (c ^ (b | !d), (7 * i) & 0xf),
        };

        let t = a.wrapping_add(f).wrapping_add(K[i]).wrapping_add(m[g]);

        a = d;
        d = c;
        c = b;
        b = b.wrapping_add(t.rotate_left(S[i]));
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
}

/// `Md5` implements the MD5 hashing algorithm.
pub struct Md5 {
    state: [u32; 4],
    block: [u8; Md5::BLOCK_LEN],
    len: u64,
}

impl Default for Md5 {
    fn default() -> Self {
        Md5 {
            state: [0x6745_2301, 0xefcd_ab89, 0x98ba_dcfe, 0x1032_5476],
            block: [0; Md5::BLOCK_LEN],
            len: 0,
        }
    }
}

impl Md5 {
    const BLOCK_LEN: usize = 64;
    const BLOCK_LEN_MASK: u64 = 0x3f;

    /// Finalizes and returns the computed MD5 hash. The hasher itself is not modified and may
    /// continue to be fed data.
    pub fn md5(&self) -> [u8; 16] {
        let mut state = self.state;
        let mut block = [0u8; Md5::BLOCK_LEN];

        // The number of bytes buffered for the current, incomplete, block. Always less than the
        // block length since full blocks are transformed immediately.
        let buffered = (self.len & Md5::BLOCK_LEN_MASK) as usize;

        block[..buffered].copy_from_slice(&self.block[..buffered]);

        // Append the 0x80 message terminator.
        block[buffered] = 0x80;

        // If there is no room left in this block for the 8-byte message length, transform it and
        // continue finalization in a fresh block.
        if buffered + 1 > Md5::BLOCK_LEN - 8 {
            transform(&mut state, &block);
            block = [0u8; Md5::BLOCK_LEN];
        }

        // The message length in bits, modulo 2^64, terminates the final block.
        block[Md5::BLOCK_LEN - 8..].copy_from_slice(&self.len.wrapping_shl(3).to_le_bytes());
        transform(&mut state, &block);

        let mut hash = [0u8; 16];

        for (out, word) in hash.chunks_exact_mut(4).zip(&state) {
            out.copy_from_slice(&word.to_le_bytes());
        }

        hash
    }
}

impl Monitor for Md5 {
    fn process_byte(&mut self, byte: u8) {
        self.block[(self.len & Md5::BLOCK_LEN_MASK) as usize] = byte;
        self.len += 1;

        if self.len & Md5::BLOCK_LEN_MASK == 0 {
            transform(&mut self.state, &self.block);
        }
    }

    fn process_buf_bytes(&mut self, buf: &[u8]) {
        let mut rem = buf;

        while !rem.is_empty() {
            let buffered = (self.len & Md5::BLOCK_LEN_MASK) as usize;
            let copy_len = cmp::min(rem.len(), Md5::BLOCK_LEN - buffered);

            self.len += copy_len as u64;

            // Whole, unbuffered, blocks are transformed directly from the source.
            if buffered == 0 && copy_len == Md5::BLOCK_LEN {
                transform(&mut self.state, &rem[..Md5::BLOCK_LEN]);
            }
            else {
                self.block[buffered..buffered + copy_len].copy_from_slice(&rem[..copy_len]);

                if self.len & Md5::BLOCK_LEN_MASK == 0 {
                    transform(&mut self.state, &self.block);
                }
            }

            rem = &rem[copy_len..];
        }
    }
}
