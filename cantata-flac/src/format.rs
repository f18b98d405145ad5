// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Format constants and validity predicates for the FLAC bitstream.

/// The FLAC start of stream marker: "fLaC" in ASCII.
pub const STREAM_MARKER: [u8; 4] = *b"fLaC";

/// The minimum number of samples per block a stream may declare.
pub const MIN_BLOCK_SIZE: u32 = 16;
/// The maximum number of samples per block.
pub const MAX_BLOCK_SIZE: u32 = 65_535;

/// The maximum sample rate in Hz. Rates must also fit the 20-bit stream information field.
pub const MAX_SAMPLE_RATE: u32 = 655_350;

/// The minimum and maximum number of channels.
pub const MIN_CHANNELS: u32 = 1;
pub const MAX_CHANNELS: u32 = 8;

/// The minimum and maximum sample bit widths.
pub const MIN_BITS_PER_SAMPLE: u32 = 4;
pub const MAX_BITS_PER_SAMPLE: u32 = 32;

/// The maximum order of the fixed predictors.
pub const MAX_FIXED_ORDER: u32 = 4;

/// The maximum LPC order.
pub const MAX_LPC_ORDER: u32 = 32;

/// The minimum and maximum quantized linear predictor coefficient precision in bits.
pub const MIN_QLP_COEFF_PRECISION: u32 = 5;
pub const MAX_QLP_COEFF_PRECISION: u32 = 15;

/// The maximum quantized linear predictor coefficient shift.
pub const MAX_QLP_COEFF_SHIFT: i32 = 15;

/// The maximum partition order of a partitioned Rice coded residual.
pub const MAX_RICE_PARTITION_ORDER: u32 = 15;

/// The width of a Rice parameter field for coding method 0, and its escape value.
pub const RICE_PARAMETER_LEN: u32 = 4;
pub const RICE_PARAMETER_ESCAPE: u32 = (1 << RICE_PARAMETER_LEN) - 1;

/// The sentinel seek point sample number designating a placeholder point.
pub const SEEK_POINT_PLACEHOLDER: u64 = u64::MAX;

/// Returns true if the sample rate is valid for a FLAC stream.
pub fn is_valid_sample_rate(sample_rate: u32) -> bool {
    sample_rate > 0 && sample_rate <= MAX_SAMPLE_RATE
}

/// Returns true if the channel count is valid for a FLAC stream.
pub fn is_valid_channel_count(channels: u32) -> bool {
    channels >= MIN_CHANNELS && channels <= MAX_CHANNELS
}

/// Returns true if the sample bit width is valid for a FLAC stream.
pub fn is_valid_bits_per_sample(bits_per_sample: u32) -> bool {
    bits_per_sample >= MIN_BITS_PER_SAMPLE && bits_per_sample <= MAX_BITS_PER_SAMPLE
}

/// Returns true if the block size is valid for a FLAC stream.
pub fn is_valid_block_size(block_size: u32) -> bool {
    block_size >= MIN_BLOCK_SIZE && block_size <= MAX_BLOCK_SIZE
}

/// Returns true if the sample rate may be used in the streamable subset, i.e. it is encodable
/// within the compact frame header sample rate codes without reference to the stream information
/// block.
pub fn is_subset_sample_rate(sample_rate: u32) -> bool {
    if !is_valid_sample_rate(sample_rate) {
        return false;
    }

    // Rates with a direct header code.
    #[rustfmt::skip]
    const CODED_RATES: [u32; 11] = [
        88_200, 176_400, 192_000, 8_000, 16_000, 22_050, 24_000, 32_000, 44_100, 48_000, 96_000,
    ];

    if CODED_RATES.contains(&sample_rate) {
        return true;
    }

    // Rates encodable via the follow-up kHz, Hz, or daHz fields.
    (sample_rate % 1000 == 0 && sample_rate <= 255_000)
        || sample_rate <= 65_535
        || sample_rate % 10 == 0
}

/// Returns true if the sample bit width may be used in the streamable subset.
pub fn is_subset_bits_per_sample(bits_per_sample: u32) -> bool {
    matches!(bits_per_sample, 8 | 12 | 16 | 20 | 24)
}
