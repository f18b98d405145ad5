// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use cantata_core::checksum::Md5;
use cantata_core::io::Monitor;

/// `Validator` computes the MD5 signature of an audio stream taking into account the
/// peculiarities of FLAC's signature scheme: samples are interleaved, truncated to the stream
/// bit width rounded up to a whole number of bytes, and packed little-endian regardless of host
/// byte order.
///
/// The same signature is computed over the input of the encoder and the output of the decoder.
#[derive(Default)]
pub struct Validator {
    state: Md5,
    buf: Vec<u8>,
}

impl Validator {
    /// Processes one block of planar channel data.
    pub fn update(&mut self, channels: &[&[i32]], bps: u32) {
        let bytes_per_sample = match bps {
            0 => return,
            1..=8 => 1,
            9..=16 => 2,
            17..=24 => 3,
            25..=32 => 4,
            _ => unreachable!(),
        };

        let n_channels = channels.len();
        let n_frames = channels.first().map_or(0, |c| c.len());

        let len = n_channels * n_frames * bytes_per_sample;

        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }

        // Interleave sample-major, truncating each sample to its little-endian prefix.
        let mut pos = 0;

        for i in 0..n_frames {
            for chan in channels {
                let bytes = chan[i].to_le_bytes();
                self.buf[pos..pos + bytes_per_sample].copy_from_slice(&bytes[..bytes_per_sample]);
                pos += bytes_per_sample;
            }
        }

        self.state.process_buf_bytes(&self.buf[..len]);
    }

    /// Gets the signature of all data processed so far.
    pub fn md5(&self) -> [u8; 16] {
        self.state.md5()
    }
}

#[cfg(test)]
mod tests {
    use super::Validator;

    #[test]
    fn verify_validator_silence() {
        // Two channels of 16-bit silence must hash identically to the equivalent zero bytes.
        let left = vec![0i32; 100];
        let right = vec![0i32; 100];

        let mut validator = Validator::default();
        validator.update(&[&left, &right], 16);

        let mut reference = cantata_core::checksum::Md5::default();
        cantata_core::io::Monitor::process_buf_bytes(&mut reference, &[0u8; 400]);

        assert_eq!(validator.md5(), reference.md5());
    }

    #[test]
    fn verify_validator_interleaving() {
        // Samples interleave channel-by-channel within each frame, little-endian.
        let left = vec![0x0102i32, -1];
        let right = vec![0x0304i32, 2];

        let mut validator = Validator::default();
        validator.update(&[&left, &right], 16);

        let mut reference = cantata_core::checksum::Md5::default();
        cantata_core::io::Monitor::process_buf_bytes(
            &mut reference,
            &[0x02, 0x01, 0x04, 0x03, 0xff, 0xff, 0x02, 0x00],
        );

        assert_eq!(validator.md5(), reference.md5());
    }

    #[test]
    fn verify_validator_24_bit() {
        let chan = vec![0x0102_03i32, -0x0102_03];

        let mut validator = Validator::default();
        validator.update(&[&chan], 20);

        let mut reference = cantata_core::checksum::Md5::default();
        cantata_core::io::Monitor::process_buf_bytes(
            &mut reference,
            &[0x03, 0x02, 0x01, 0xfd, 0xfd, 0xfe],
        );

        assert_eq!(validator.md5(), reference.md5());
    }
}
