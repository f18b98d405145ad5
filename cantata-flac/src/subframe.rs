// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subframe and partitioned-Rice residual coding.

use cantata_core::errors::{decode_error, Result};
use cantata_core::io::{BitWriterMsb, ReadBitsLtr};
use cantata_core::util::bits::sign_extend_leq32_to_i32;

use crate::fixed;
use crate::format::{MAX_FIXED_ORDER, RICE_PARAMETER_ESCAPE, RICE_PARAMETER_LEN};
use crate::lpc;
use crate::lpc::QlpCoeffs;

// Subframe decoding.

#[derive(Debug)]
enum SubframeType {
    Constant,
    Verbatim,
    FixedLinear(u32),
    Linear(u32),
}

/// Reads one subframe from the bitstream, producing `buf.len()` samples at the given frame bit
/// width.
pub fn read_subframe<B: ReadBitsLtr>(bs: &mut B, frame_bps: u32, buf: &mut [i32]) -> Result<()> {
    // The first subframe header bit must always be 0.
    if bs.read_bit()? {
        return decode_error("flac: subframe padding is not 0");
    }

    // The next 6 bits designate the subframe type.
    let subframe_type_enc = bs.read_bits_leq32(6)?;

    let subframe_type = match subframe_type_enc {
        0x00 => SubframeType::Constant,
        0x01 => SubframeType::Verbatim,
        0x08..=0x0f => {
            let order = subframe_type_enc & 0x07;
            if order > MAX_FIXED_ORDER {
                return decode_error("flac: fixed predictor orders greater than 4 are invalid");
            }
            SubframeType::FixedLinear(order)
        }
        0x20..=0x3f => SubframeType::Linear((subframe_type_enc & 0x1f) + 1),
        _ => return decode_error("flac: subframe type set to reserved value"),
    };

    // The final header bit flags wasted (dropped) low-order bits. When set, the count of wasted
    // bits per sample follows, unary coded, offset by one.
    let wasted_bits = if bs.read_bit()? { bs.read_unary_zeros()? + 1 } else { 0 };

    if wasted_bits >= frame_bps {
        return decode_error("flac: wasted bits exceed the sample bit width");
    }

    // Samples are coded at the reduced width and shifted back up after decoding.
    let bps = frame_bps - wasted_bits;

    match subframe_type {
        SubframeType::Constant => decode_constant(bs, bps, buf)?,
        SubframeType::Verbatim => decode_verbatim(bs, bps, buf)?,
        SubframeType::FixedLinear(order) => decode_fixed(bs, bps, order, buf)?,
        SubframeType::Linear(order) => decode_lpc(bs, bps, order, buf)?,
    }

    if wasted_bits > 0 {
        for sample in buf.iter_mut() {
            *sample = sample.wrapping_shl(wasted_bits);
        }
    }

    Ok(())
}

fn decode_constant<B: ReadBitsLtr>(bs: &mut B, bps: u32, buf: &mut [i32]) -> Result<()> {
    let const_sample = sign_extend_leq32_to_i32(bs.read_bits_leq32(bps)?, bps);

    for sample in buf.iter_mut() {
        *sample = const_sample;
    }

    Ok(())
}

fn decode_verbatim<B: ReadBitsLtr>(bs: &mut B, bps: u32, buf: &mut [i32]) -> Result<()> {
    for sample in buf.iter_mut() {
        *sample = sign_extend_leq32_to_i32(bs.read_bits_leq32(bps)?, bps);
    }

    Ok(())
}

fn decode_fixed<B: ReadBitsLtr>(bs: &mut B, bps: u32, order: u32, buf: &mut [i32]) -> Result<()> {
    if order as usize > buf.len() {
        return decode_error("flac: fixed predictor order exceeds the block size");
    }

    // The first `order` samples are coded verbatim to warm up the predictor.
    decode_verbatim(bs, bps, &mut buf[..order as usize])?;

    // The residual of the predicted samples follows.
    decode_residual(bs, order, buf)?;

    fixed::restore_signal(order, buf);

    Ok(())
}

fn decode_lpc<B: ReadBitsLtr>(bs: &mut B, bps: u32, order: u32, buf: &mut [i32]) -> Result<()> {
    if order as usize > buf.len() {
        return decode_error("flac: lpc order exceeds the block size");
    }

    decode_verbatim(bs, bps, &mut buf[..order as usize])?;

    // Quantized linear predictor coefficient precision, offset by one.
    let precision = bs.read_bits_leq32(4)? + 1;

    if precision > 15 {
        return decode_error("flac: qlp precision set to reserved value");
    }

    // The coefficient quantisation level (shift) is signed. Negative levels scale the
    // prediction up.
    let shift = bs.read_bits_leq32_signed(5)?;

    // Coefficients appear most-recent-sample first.
    let mut coeffs = QlpCoeffs::new();

    for _ in 0..order {
        coeffs.push(sign_extend_leq32_to_i32(bs.read_bits_leq32(precision)?, precision));
    }

    decode_residual(bs, order, buf)?;

    lpc::restore_signal(&coeffs, shift, buf);

    Ok(())
}

fn decode_residual<B: ReadBitsLtr>(
    bs: &mut B,
    n_prelude_samples: u32,
    buf: &mut [i32],
) -> Result<()> {
    let method_enc = bs.read_bits_leq32(2)?;

    // Two residual coding methods are defined: Rice with a 4-bit parameter, and Rice with a
    // 5-bit parameter. They share a code path, differing only in the parameter width.
    let param_bit_width = match method_enc {
        0x0 => 4,
        0x1 => 5,
        _ => return decode_error("flac: residual method set to reserved value"),
    };

    let partition_order = bs.read_bits_leq32(4)?;

    // The number of partitions is 2^partition_order.
    let n_partitions = 1usize << partition_order;

    // All partitions hold block_size / 2^order samples, except the first which cedes its
    // leading positions to the warm-up samples stored in the subframe header.
    let n_partition_samples = buf.len() >> partition_order;

    if n_prelude_samples as usize > n_partition_samples {
        return decode_error("flac: residual partition too small for given predictor order");
    }

    if n_partitions * n_partition_samples != buf.len() {
        return decode_error("flac: block size is not divisible by the partition count");
    }

    // The first partition is short by the warm-up count.
    decode_rice_partition(
        bs,
        param_bit_width,
        &mut buf[n_prelude_samples as usize..n_partition_samples],
    )?;

    for chunk in buf[n_partition_samples..].chunks_mut(n_partition_samples) {
        decode_rice_partition(bs, param_bit_width, chunk)?;
    }

    Ok(())
}

fn decode_rice_partition<B: ReadBitsLtr>(
    bs: &mut B,
    param_bit_width: u32,
    buf: &mut [i32],
) -> Result<()> {
    let rice_param = bs.read_bits_leq32(param_bit_width)?;

    // An all-ones parameter is the escape code: the partition stores binary coded residuals at
    // an explicit width instead of Rice codes.
    if rice_param < (1 << param_bit_width) - 1 {
        for sample in buf.iter_mut() {
            let quotient = bs.read_unary_zeros()?;
            let remainder = bs.read_bits_leq32(rice_param)?;
            *sample = rice_unsigned_to_i32((quotient << rice_param) | remainder);
        }
    }
    else {
        let residual_bits = bs.read_bits_leq32(5)?;

        for sample in buf.iter_mut() {
            *sample = sign_extend_leq32_to_i32(bs.read_bits_leq32(residual_bits)?, residual_bits);
        }
    }

    Ok(())
}

/// Unfolds a zigzag-coded unsigned Rice value into a signed integer.
///
/// Inputs 0, 1, 2, 3, 4, ... map to 0, -1, 1, -2, 2, ...
#[inline(always)]
fn rice_unsigned_to_i32(word: u32) -> i32 {
    // Half the value carries the magnitude, the LSB selects the sign via a XOR with either all
    // zeros (even, non-negative) or all ones (odd, negative).
    ((word >> 1) as i32) ^ -((word & 0x1) as i32)
}

/// Folds a signed integer into the zigzag-coded unsigned Rice value. The inverse of
/// [`rice_unsigned_to_i32`].
#[inline(always)]
fn rice_i32_to_unsigned(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

/// The number of bits a value occupies under a Rice parameter: the unary quotient, the stop bit,
/// and the binary remainder.
#[inline(always)]
fn rice_encoded_len(value: i32, param: u32) -> u64 {
    u64::from(rice_i32_to_unsigned(value) >> param) + 1 + u64::from(param)
}

// Residual encoding.

/// The partition-order search policy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PartitionSearch {
    /// Evaluate every legal partition order and keep the global minimum.
    #[default]
    Full,
    /// Stop as soon as increasing the partition order no longer reduces the size.
    FirstMinimum,
}

/// A chosen residual partitioning: the partition order and one Rice parameter per partition.
#[derive(Clone, Debug)]
pub(crate) struct RicePartitions {
    pub order: u32,
    pub params: Vec<u32>,
}

/// Computes the Rice parameters for the residual under the given partition order, and the total
/// size in bits of the coded residual (including the method, partition order, and parameter
/// fields). Returns `None` when the partition order is not usable for this residual.
fn partitioned_rice_len(
    residual: &[i32],
    predictor_order: u32,
    block_size: u32,
    rice_estimate: u32,
    partition_order: u32,
) -> Option<(Vec<u32>, u64)> {
    // The residual coding method and partition order fields.
    let mut bits: u64 = 2 + 4;

    let max_param = RICE_PARAMETER_ESCAPE - 1;

    if partition_order == 0 {
        // A single partition: use the caller's parameter estimate directly.
        let param = rice_estimate.min(max_param);

        bits += u64::from(RICE_PARAMETER_LEN);
        bits += residual.iter().map(|r| rice_encoded_len(*r, param)).sum::<u64>();

        return Some((vec![param], bits));
    }

    let n_partitions = 1usize << partition_order;
    let n_partition_samples = (block_size >> partition_order) as usize;

    // The first partition must retain at least one residual after the warm-up discount.
    if n_partition_samples <= predictor_order as usize {
        return None;
    }

    let mut params = Vec::with_capacity(n_partitions);
    let mut pos = 0;

    for i in 0..n_partitions {
        let count =
            if i == 0 { n_partition_samples - predictor_order as usize } else { n_partition_samples };

        let chunk = &residual[pos..pos + count];
        pos += count;

        // Derive the partition's parameter from the mean residual magnitude,
        // ceil(log2(mean)), clamped to the non-escape parameter range.
        let sum: u64 = chunk.iter().map(|r| r.unsigned_abs() as u64).sum();
        let mean = (sum + (count as u64 >> 1)) / count as u64;

        let param = if mean > 1 {
            let floor_log2 = 63 - mean.leading_zeros();
            let ceil_log2 = if mean.is_power_of_two() { floor_log2 } else { floor_log2 + 1 };
            ceil_log2.min(max_param)
        }
        else {
            0
        };

        bits += u64::from(RICE_PARAMETER_LEN);
        bits += chunk.iter().map(|r| rice_encoded_len(*r, param)).sum::<u64>();

        params.push(param);
    }

    Some((params, bits))
}

/// Searches partition orders `0..=max_partition_order` for the partitioning that minimizes the
/// coded residual size. Returns the winning partitioning and its size in bits.
pub(crate) fn find_best_partitions(
    residual: &[i32],
    predictor_order: u32,
    block_size: u32,
    rice_estimate: u32,
    max_partition_order: u32,
    search: PartitionSearch,
) -> (RicePartitions, u64) {
    // Partitions must divide the block evenly.
    let max_order = max_partition_order.min(block_size.trailing_zeros());

    let (mut best_params, mut best_bits) =
        partitioned_rice_len(residual, predictor_order, block_size, rice_estimate, 0)
            .expect("partition order 0 is always usable");

    let mut best_order = 0;

    for order in 1..=max_order {
        match partitioned_rice_len(residual, predictor_order, block_size, rice_estimate, order) {
            Some((params, bits)) => {
                if bits < best_bits {
                    best_bits = bits;
                    best_order = order;
                    best_params = params;
                }
                else if search == PartitionSearch::FirstMinimum {
                    break;
                }
            }
            None => break,
        }
    }

    (RicePartitions { order: best_order, params: best_params }, best_bits)
}

/// A per-channel subframe coding decision, produced by the encoder's candidate search and
/// serialised by [`write_subframe`].
#[derive(Clone, Debug)]
pub(crate) enum SubframePlan {
    Constant {
        value: i32,
    },
    Verbatim,
    Fixed {
        order: u32,
        residual: Vec<i32>,
        partitions: RicePartitions,
    },
    Lpc {
        precision: u32,
        shift: i32,
        coeffs: QlpCoeffs,
        residual: Vec<i32>,
        partitions: RicePartitions,
    },
}

fn write_subframe_header(bw: &mut BitWriterMsb, type_code: u32) {
    // Padding bit, type code, and a cleared wasted-bits flag.
    bw.write_bits_leq32(0, 1);
    bw.write_bits_leq32(type_code, 6);
    bw.write_bits_leq32(0, 1);
}

/// Serialises one subframe. `signal` supplies the channel's samples for verbatim coding and
/// predictor warm-up.
pub(crate) fn write_subframe(
    bw: &mut BitWriterMsb,
    plan: &SubframePlan,
    signal: &[i32],
    bps: u32,
) {
    match plan {
        SubframePlan::Constant { value } => {
            write_subframe_header(bw, 0x00);
            bw.write_bits_leq32_signed(*value, bps);
        }
        SubframePlan::Verbatim => {
            write_subframe_header(bw, 0x01);

            for sample in signal {
                bw.write_bits_leq32_signed(*sample, bps);
            }
        }
        SubframePlan::Fixed { order, residual, partitions } => {
            write_subframe_header(bw, 0x08 | order);

            for sample in &signal[..*order as usize] {
                bw.write_bits_leq32_signed(*sample, bps);
            }

            write_residual(bw, residual, *order, signal.len() as u32, partitions);
        }
        SubframePlan::Lpc { precision, shift, coeffs, residual, partitions } => {
            write_subframe_header(bw, 0x20 | (coeffs.len() as u32 - 1));

            for sample in &signal[..coeffs.len()] {
                bw.write_bits_leq32_signed(*sample, bps);
            }

            bw.write_bits_leq32(precision - 1, 4);
            bw.write_bits_leq32_signed(*shift, 5);

            for coeff in coeffs {
                bw.write_bits_leq32_signed(*coeff, *precision);
            }

            write_residual(bw, residual, coeffs.len() as u32, signal.len() as u32, partitions);
        }
    }
}

fn write_residual(
    bw: &mut BitWriterMsb,
    residual: &[i32],
    predictor_order: u32,
    block_size: u32,
    partitions: &RicePartitions,
) {
    // Coding method 0: partitioned Rice with 4-bit parameters.
    bw.write_bits_leq32(0x0, 2);
    bw.write_bits_leq32(partitions.order, 4);

    let n_partition_samples = (block_size >> partitions.order) as usize;

    let mut pos = 0;

    for (i, param) in partitions.params.iter().enumerate() {
        let count = if i == 0 {
            n_partition_samples - predictor_order as usize
        }
        else {
            n_partition_samples
        };

        bw.write_bits_leq32(*param, RICE_PARAMETER_LEN);

        for value in &residual[pos..pos + count] {
            let folded = rice_i32_to_unsigned(*value);

            bw.write_unary_zeros(folded >> param);
            bw.write_bits_leq32(folded & ((1 << param) - 1), *param);
        }

        pos += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantata_core::io::{BitReaderLtr, BitWriterMsb};

    #[test]
    fn verify_rice_fold_unfold() {
        assert_eq!(rice_unsigned_to_i32(0), 0);
        assert_eq!(rice_unsigned_to_i32(1), -1);
        assert_eq!(rice_unsigned_to_i32(2), 1);
        assert_eq!(rice_unsigned_to_i32(3), -2);
        assert_eq!(rice_unsigned_to_i32(4), 2);
        assert_eq!(rice_unsigned_to_i32(u32::MAX), i32::MIN);

        for value in [0, -1, 1, -2, 2, 1000, -1000, i32::MAX, i32::MIN] {
            assert_eq!(rice_unsigned_to_i32(rice_i32_to_unsigned(value)), value);
        }
    }

    fn roundtrip_plan(plan: &SubframePlan, signal: &[i32], bps: u32) -> Vec<i32> {
        let mut bw = BitWriterMsb::new();
        write_subframe(&mut bw, plan, signal, bps);
        bw.byte_align();

        let bytes = bw.into_bytes();
        let mut bs = BitReaderLtr::new(&bytes);

        let mut out = vec![0i32; signal.len()];
        read_subframe(&mut bs, bps, &mut out).unwrap();
        out
    }

    #[test]
    fn verify_subframe_constant_roundtrip() {
        let signal = vec![-123i32; 64];
        let out = roundtrip_plan(&SubframePlan::Constant { value: -123 }, &signal, 16);
        assert_eq!(out, signal);
    }

    #[test]
    fn verify_subframe_verbatim_roundtrip() {
        let signal: Vec<i32> = (0..64).map(|i| (i * 37 % 255) - 128).collect();
        let out = roundtrip_plan(&SubframePlan::Verbatim, &signal, 9);
        assert_eq!(out, signal);
    }

    #[test]
    fn verify_subframe_fixed_roundtrip() {
        let signal: Vec<i32> = (0..256).map(|i| i * 3 - 100).collect();

        let order = 1;
        let mut residual = Vec::new();
        crate::fixed::compute_residual(&signal, order, &mut residual);

        let (partitions, _) =
            find_best_partitions(&residual, order, 256, 0, 4, PartitionSearch::Full);

        let plan = SubframePlan::Fixed { order, residual, partitions };

        let out = roundtrip_plan(&plan, &signal, 16);
        assert_eq!(out, signal);
    }

    #[test]
    fn verify_subframe_lpc_roundtrip() {
        let signal: Vec<i32> =
            (0..512).map(|i| (2000.0 * (i as f64 * 0.2).sin()) as i32).collect();

        let coeffs: QlpCoeffs = [1205i32, -497].into_iter().collect();
        let shift = 10;

        let mut residual = Vec::new();
        crate::lpc::compute_residual(&signal, &coeffs, shift, &mut residual);

        let (partitions, _) =
            find_best_partitions(&residual, 2, 512, 8, 4, PartitionSearch::Full);

        let plan = SubframePlan::Lpc { precision: 12, shift, coeffs, residual, partitions };

        let out = roundtrip_plan(&plan, &signal, 16);
        assert_eq!(out, signal);
    }

    #[test]
    fn verify_partitioned_len_matches_written() {
        // The size estimate used for candidate selection must match the bits actually written.
        let residual: Vec<i32> = (0..128).map(|i| (i * 53 % 31) - 15).collect();

        for order in 0..=3 {
            if let Some((params, bits)) = partitioned_rice_len(&residual, 0, 128, 4, order) {
                let partitions = RicePartitions { order, params };

                let mut bw = BitWriterMsb::new();
                write_residual(&mut bw, &residual, 0, 128, &partitions);

                assert_eq!(bw.num_bits_written(), bits, "order {}", order);
            }
        }
    }

    #[test]
    fn verify_escape_partition_decode() {
        // Hand-build a fixed order 0 subframe whose single partition uses the escape code:
        // 17-bit binary residuals instead of Rice codes.
        let signal = [1i32, -2, 30000, -30000];

        let mut bw = BitWriterMsb::new();

        // Subframe header: fixed, order 0.
        bw.write_bits_leq32(0, 1);
        bw.write_bits_leq32(0x08, 6);
        bw.write_bits_leq32(0, 1);

        // Residual: method 0, partition order 0, escape parameter, 17-bit samples.
        bw.write_bits_leq32(0x0, 2);
        bw.write_bits_leq32(0, 4);
        bw.write_bits_leq32(RICE_PARAMETER_ESCAPE, RICE_PARAMETER_LEN);
        bw.write_bits_leq32(17, 5);

        for sample in &signal {
            bw.write_bits_leq32_signed(*sample, 17);
        }

        bw.byte_align();

        let bytes = bw.into_bytes();
        let mut bs = BitReaderLtr::new(&bytes);

        let mut out = [0i32; 4];
        read_subframe(&mut bs, 17, &mut out).unwrap();

        assert_eq!(out, signal);
    }

    #[test]
    fn verify_wasted_bits_decode() {
        // A verbatim subframe with 2 wasted bits: samples are coded at bps - 2 and shifted
        // back up by the decoder.
        let mut bw = BitWriterMsb::new();

        bw.write_bits_leq32(0, 1);
        bw.write_bits_leq32(0x01, 6);
        bw.write_bits_leq32(1, 1);
        // Unary-coded wasted bit count, offset by one: one zero then the stop bit.
        bw.write_unary_zeros(1);

        for sample in [5i32, -5, 100, -100] {
            bw.write_bits_leq32_signed(sample, 14);
        }

        bw.byte_align();

        let bytes = bw.into_bytes();
        let mut bs = BitReaderLtr::new(&bytes);

        let mut out = [0i32; 4];
        read_subframe(&mut bs, 16, &mut out).unwrap();

        assert_eq!(out, [20, -20, 400, -400]);
    }
}
