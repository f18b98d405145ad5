// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The FLAC stream encoder: per-block candidate search over channel assignments and subframe
//! types, emission of the smallest coded frame, and post-encode stream header patch-up.

use std::cmp::min;
use std::io::SeekFrom;

use cantata_core::checksum::Crc16Ansi;
use cantata_core::io::{BitWriterMsb, MediaSink, Monitor};

use log::{debug, warn};

use smallvec::SmallVec;

use thiserror::Error as ThisError;

use crate::fixed;
use crate::format::{
    self, MAX_FIXED_ORDER, MAX_LPC_ORDER, MAX_QLP_COEFF_PRECISION, MIN_QLP_COEFF_PRECISION,
    RICE_PARAMETER_ESCAPE,
};
use crate::frame::{write_frame_header, ChannelAssignment};
use crate::lpc;
use crate::metadata::chain::write_metadata_area;
use crate::metadata::{
    MetadataBlock, MetadataBlockData, MetadataBlockHeader, Padding, SeekTable, StreamInfo,
};
use crate::subframe::{find_best_partitions, write_subframe, PartitionSearch, SubframePlan};
use crate::validate::Validator;

/// The sentinel carried in the frame size minimum while no frame has been encoded.
const MIN_FRAME_SIZE_SENTINEL: u32 = (1 << 24) - 1;

/// The error type of the stream encoder. Every error is fatal to the current stream.
#[derive(Debug, ThisError)]
pub enum EncoderError {
    #[error("invalid number of channels")]
    InvalidNumberOfChannels,
    #[error("invalid bits per sample")]
    InvalidBitsPerSample,
    #[error("invalid sample rate")]
    InvalidSampleRate,
    #[error("invalid block size")]
    InvalidBlockSize,
    #[error("invalid qlp coefficient precision")]
    InvalidQlpCoeffPrecision,
    #[error("mid/side coding requires exactly two channels")]
    MidSideChannelsMismatch,
    #[error("parameters are outside the streamable subset")]
    NotStreamable,
    #[error("framing error")]
    FramingError,
    #[error("internal encoder error: {0}")]
    Internal(&'static str),
    #[error("fatal error while writing")]
    Write(#[from] std::io::Error),
}

pub type EncoderResult<T> = std::result::Result<T, EncoderError>;

/// Options for a [`StreamEncoder`].
#[derive(Clone, Debug)]
pub struct EncoderOptions {
    pub channels: u32,
    pub bits_per_sample: u32,
    pub sample_rate: u32,
    /// The number of samples per frame. Fixed for the whole stream; only the final frame may be
    /// shorter.
    pub block_size: u32,
    /// An estimate of the total stream length in samples, 0 if unknown. The true count is
    /// patched into the stream header at `finish` when the sink is seekable.
    pub total_samples_estimate: u64,
    /// Restrict parameters to the streamable subset profile.
    pub streamable_subset: bool,
    /// Try the stereo decorrelation channel pairings (requires exactly two channels).
    pub do_mid_side: bool,
    /// Search every predictor order instead of the estimated best.
    pub do_exhaustive_model_search: bool,
    /// The maximum LPC order. 0 disables LPC and uses fixed predictors only.
    pub max_lpc_order: u32,
    /// Quantized LPC coefficient precision in bits, or 0 to pick a default.
    pub qlp_coeff_precision: u32,
    /// Search every usable coefficient precision instead of just the configured one.
    pub do_qlp_coeff_precision_search: bool,
    /// The maximum residual partition order to search.
    pub max_partition_order: u32,
    /// The partition order search policy.
    pub partition_search: PartitionSearch,
    /// Append a PADDING block of this many bytes after the metadata.
    pub padding: Option<u32>,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        EncoderOptions {
            channels: 2,
            bits_per_sample: 16,
            sample_rate: 44_100,
            block_size: 4096,
            total_samples_estimate: 0,
            streamable_subset: true,
            do_mid_side: true,
            do_exhaustive_model_search: false,
            max_lpc_order: 8,
            qlp_coeff_precision: 0,
            do_qlp_coeff_precision_search: false,
            max_partition_order: 4,
            partition_search: PartitionSearch::default(),
            padding: Some(4096),
        }
    }
}

/// A FLAC stream encoder.
///
/// The encoder writes the stream header and metadata on construction, then consumes planar PCM
/// through [`StreamEncoder::process`], emitting one coded frame per `block_size` samples.
/// [`StreamEncoder::finish`] flushes the final partial frame and, when the sink is seekable,
/// patches the stream information (and any seek table) with the values only known at the end.
pub struct StreamEncoder<S: MediaSink> {
    sink: S,
    opts: EncoderOptions,
    /// Resolved coefficient precision (options may request the default with 0).
    qlp_precision: u32,
    stream_info: StreamInfo,
    /// Sink offset of the stream information block body.
    stream_info_offset: u64,
    /// A seek table awaiting frame offsets, and the sink offset of its body.
    seek_table: Option<(SeekTable, u64)>,
    /// Sink offset of the first audio frame.
    first_frame_offset: u64,
    /// Total bytes written to the sink.
    bytes_written: u64,
    validator: Validator,
    /// Per-channel sample accumulators for the current block.
    pending: Vec<Vec<i32>>,
    frame_number: u64,
    samples_written: u64,
    min_frame_len: u32,
    max_frame_len: u32,
}

impl<S: MediaSink> StreamEncoder<S> {
    /// Validates the options, writes the stream header and all metadata, and returns the ready
    /// encoder. `extra_metadata` blocks are written after the stream information block; a
    /// SEEKTABLE among them will have its offsets filled in as frames are emitted.
    pub fn new(
        sink: S,
        options: EncoderOptions,
        extra_metadata: Vec<MetadataBlock>,
    ) -> EncoderResult<StreamEncoder<S>> {
        let opts = options;

        if !format::is_valid_channel_count(opts.channels) {
            return Err(EncoderError::InvalidNumberOfChannels);
        }

        if !format::is_valid_bits_per_sample(opts.bits_per_sample) {
            return Err(EncoderError::InvalidBitsPerSample);
        }

        if !format::is_valid_sample_rate(opts.sample_rate) {
            return Err(EncoderError::InvalidSampleRate);
        }

        if !format::is_valid_block_size(opts.block_size) {
            return Err(EncoderError::InvalidBlockSize);
        }

        if opts.do_mid_side && opts.channels != 2 {
            return Err(EncoderError::MidSideChannelsMismatch);
        }

        if opts.max_lpc_order > MAX_LPC_ORDER {
            return Err(EncoderError::Internal("maximum lpc order is 32"));
        }

        if opts.qlp_coeff_precision != 0
            && (opts.qlp_coeff_precision < MIN_QLP_COEFF_PRECISION
                || opts.qlp_coeff_precision > MAX_QLP_COEFF_PRECISION)
        {
            return Err(EncoderError::InvalidQlpCoeffPrecision);
        }

        if opts.streamable_subset {
            if !format::is_subset_sample_rate(opts.sample_rate) {
                return Err(EncoderError::NotStreamable);
            }

            if !format::is_subset_bits_per_sample(opts.bits_per_sample) {
                return Err(EncoderError::NotStreamable);
            }
        }

        // Resolve the default coefficient precision from the sample width.
        let qlp_precision = if opts.qlp_coeff_precision == 0 {
            (2 + opts.bits_per_sample / 2)
                .clamp(MIN_QLP_COEFF_PRECISION, MAX_QLP_COEFF_PRECISION)
        }
        else {
            opts.qlp_coeff_precision
        };

        let stream_info = StreamInfo {
            min_block_size: opts.block_size as u16,
            max_block_size: opts.block_size as u16,
            min_frame_size: 0,
            max_frame_size: 0,
            sample_rate: opts.sample_rate,
            channels: opts.channels,
            bits_per_sample: opts.bits_per_sample,
            total_samples: opts.total_samples_estimate,
            md5: [0; 16],
        };

        // Assemble the metadata area: STREAMINFO first, caller blocks, then default padding.
        let mut blocks = Vec::with_capacity(2 + extra_metadata.len());

        blocks.push(MetadataBlock::new(MetadataBlockData::StreamInfo(stream_info.clone())));

        for block in extra_metadata {
            if matches!(block.data, MetadataBlockData::StreamInfo(_)) {
                return Err(EncoderError::Internal("stream info supplied as extra metadata"));
            }
            blocks.push(block);
        }

        if let Some(padding) = opts.padding {
            blocks.push(MetadataBlock::new(MetadataBlockData::Padding(Padding {
                length: padding,
            })));
        }

        // Serialise the whole stream header so the first sink write is a single byte run.
        let mut header_bytes = Vec::new();
        write_metadata_area(&mut blocks, &mut header_bytes)?;

        // Locate the byte offsets that will be patched at finish.
        let mut seek_table = None;
        let mut offset = u64::from(format::STREAM_MARKER.len() as u32);

        for block in &blocks {
            let body_offset = offset + u64::from(MetadataBlockHeader::LEN);

            if let MetadataBlockData::SeekTable(table) = &block.data {
                if seek_table.is_some() {
                    return Err(EncoderError::Internal("more than one seek table"));
                }
                seek_table = Some((table.clone(), body_offset));
            }

            offset = body_offset + u64::from(block.data.len());
        }

        let stream_info_offset =
            u64::from(format::STREAM_MARKER.len() as u32) + u64::from(MetadataBlockHeader::LEN);

        let first_frame_offset = header_bytes.len() as u64;

        let mut sink = sink;
        sink.write_all(&header_bytes)?;

        let pending =
            vec![Vec::with_capacity(opts.block_size as usize); opts.channels as usize];

        Ok(StreamEncoder {
            sink,
            opts,
            qlp_precision,
            stream_info,
            stream_info_offset,
            seek_table,
            first_frame_offset,
            bytes_written: first_frame_offset,
            validator: Validator::default(),
            pending,
            frame_number: 0,
            samples_written: 0,
            min_frame_len: MIN_FRAME_SIZE_SENTINEL,
            max_frame_len: 0,
        })
    }

    /// Consumes one run of planar samples, `channels[ch][i]`, encoding every completed block.
    /// All channel slices must be the same length.
    pub fn process(&mut self, channels: &[&[i32]]) -> EncoderResult<()> {
        if channels.len() != self.opts.channels as usize {
            return Err(EncoderError::Internal("wrong number of channels"));
        }

        let n_samples = channels[0].len();

        if channels.iter().any(|c| c.len() != n_samples) {
            return Err(EncoderError::Internal("channel lengths differ"));
        }

        let block_size = self.opts.block_size as usize;
        let mut done = 0;

        while done < n_samples {
            let take = min(block_size - self.pending[0].len(), n_samples - done);

            for (pending, chan) in self.pending.iter_mut().zip(channels) {
                pending.extend_from_slice(&chan[done..done + take]);
            }

            done += take;

            if self.pending[0].len() == block_size {
                self.flush_block()?;
            }
        }

        Ok(())
    }

    /// Consumes interleaved samples (`LRLR...`). The sample count must be a multiple of the
    /// channel count.
    pub fn process_interleaved(&mut self, samples: &[i32]) -> EncoderResult<()> {
        let n_channels = self.opts.channels as usize;

        if samples.len() % n_channels != 0 {
            return Err(EncoderError::Internal("partial interleaved frame"));
        }

        let n_frames = samples.len() / n_channels;

        let planar: Vec<Vec<i32>> = (0..n_channels)
            .map(|ch| samples.iter().skip(ch).step_by(n_channels).copied().collect())
            .collect();

        let refs: SmallVec<[&[i32]; 8]> = planar.iter().map(|c| c.as_slice()).collect();

        debug_assert!(refs.iter().all(|c| c.len() == n_frames));

        self.process(&refs)
    }

    /// Encodes any buffered partial block, patches the stream header, and returns the final
    /// stream information along with the sink.
    pub fn finish(mut self) -> EncoderResult<(StreamInfo, S)> {
        if !self.pending[0].is_empty() {
            self.flush_block()?;
        }

        self.stream_info.total_samples = self.samples_written;
        self.stream_info.md5 = self.validator.md5();

        self.stream_info.min_frame_size =
            if self.min_frame_len == MIN_FRAME_SIZE_SENTINEL { 0 } else { self.min_frame_len };
        self.stream_info.max_frame_size = self.max_frame_len;

        if self.sink.is_seekable() {
            self.sink.seek(SeekFrom::Start(self.stream_info_offset))?;
            self.stream_info.write_to(&mut self.sink)?;

            if let Some((table, offset)) = &self.seek_table {
                self.sink.seek(SeekFrom::Start(*offset))?;
                table.write_to(&mut self.sink)?;
            }

            self.sink.seek(SeekFrom::End(0))?;
        }
        else {
            warn!("sink is unseekable; stream header fields are left unpatched");
        }

        self.sink.flush()?;

        Ok((self.stream_info, self.sink))
    }

    fn flush_block(&mut self) -> EncoderResult<()> {
        let block = std::mem::take(&mut self.pending);

        let result = self.encode_frame(&block);

        self.pending = block;

        for pending in self.pending.iter_mut() {
            pending.clear();
        }

        result
    }

    fn encode_frame(&mut self, block: &[Vec<i32>]) -> EncoderResult<()> {
        let n = block[0].len() as u32;
        let bps = self.opts.bits_per_sample;

        // The stream signature covers the raw input.
        let refs: SmallVec<[&[i32]; 8]> = block.iter().map(|c| c.as_slice()).collect();
        self.validator.update(&refs, bps);

        // The final, partial, frame is coded with a single residual partition.
        let max_partition_order =
            if n == self.opts.block_size { self.opts.max_partition_order } else { 0 };

        // Choose the channel assignment and per-channel subframes minimizing the coded size.
        let mut bw = BitWriterMsb::new();

        if self.opts.do_mid_side && self.opts.channels == 2 && bps < format::MAX_BITS_PER_SAMPLE {
            let left = &block[0];
            let right = &block[1];

            // The mid channel is the floored average; the side channel is the difference at one
            // extra bit of width.
            let mut mid = Vec::with_capacity(left.len());
            let mut side = Vec::with_capacity(left.len());

            for (l, r) in left.iter().zip(right) {
                mid.push((l + r) >> 1);
                side.push(l - r);
            }

            let plan_l = self.evaluate_subframe(left, bps, max_partition_order);
            let plan_r = self.evaluate_subframe(right, bps, max_partition_order);
            let plan_m = self.evaluate_subframe(&mid, bps, max_partition_order);
            let plan_s = self.evaluate_subframe(&side, bps + 1, max_partition_order);

            // Candidate pairings in preference order on equal size.
            let candidates = [
                (ChannelAssignment::Independent(2), plan_l.1 + plan_r.1),
                (ChannelAssignment::LeftSide, plan_l.1 + plan_s.1),
                (ChannelAssignment::RightSide, plan_s.1 + plan_r.1),
                (ChannelAssignment::MidSide, plan_m.1 + plan_s.1),
            ];

            // Keep the first candidate on ties so equal sizes prefer independent coding.
            let mut assignment = candidates[0].0;
            let mut smallest = candidates[0].1;

            for (candidate, bits) in candidates.iter().skip(1) {
                if *bits < smallest {
                    assignment = *candidate;
                    smallest = *bits;
                }
            }

            write_frame_header(
                &mut bw,
                self.frame_number,
                n,
                self.opts.sample_rate,
                bps,
                assignment,
            );

            match assignment {
                ChannelAssignment::Independent(_) => {
                    write_subframe(&mut bw, &plan_l.0, left, bps);
                    write_subframe(&mut bw, &plan_r.0, right, bps);
                }
                ChannelAssignment::LeftSide => {
                    write_subframe(&mut bw, &plan_l.0, left, bps);
                    write_subframe(&mut bw, &plan_s.0, &side, bps + 1);
                }
                ChannelAssignment::RightSide => {
                    write_subframe(&mut bw, &plan_s.0, &side, bps + 1);
                    write_subframe(&mut bw, &plan_r.0, right, bps);
                }
                ChannelAssignment::MidSide => {
                    write_subframe(&mut bw, &plan_m.0, &mid, bps);
                    write_subframe(&mut bw, &plan_s.0, &side, bps + 1);
                }
            }
        }
        else {
            write_frame_header(
                &mut bw,
                self.frame_number,
                n,
                self.opts.sample_rate,
                bps,
                ChannelAssignment::Independent(self.opts.channels),
            );

            for chan in block {
                let plan = self.evaluate_subframe(chan, bps, max_partition_order);
                write_subframe(&mut bw, &plan.0, chan, bps);
            }
        }

        bw.byte_align();

        if bw.num_bits_written() % 8 != 0 {
            return Err(EncoderError::FramingError);
        }

        // The frame footer is the CRC-16 of every frame byte preceding it.
        let mut crc16 = Crc16Ansi::new(0);
        crc16.process_buf_bytes(bw.as_bytes());
        bw.write_bits_leq32(u32::from(crc16.crc()), 16);

        let bytes = bw.into_bytes();

        let first_sample = self.samples_written;
        let frame_offset = self.bytes_written;

        // Fill any seek point targeting this frame.
        if let Some((table, _)) = &mut self.seek_table {
            for point in table.points.iter_mut() {
                if point.is_placeholder() || point.frame_samples != 0 {
                    continue;
                }

                if point.sample_number >= first_sample
                    && point.sample_number < first_sample + u64::from(n)
                {
                    point.sample_number = first_sample;
                    point.stream_offset = frame_offset - self.first_frame_offset;
                    point.frame_samples = n as u16;
                }
            }
        }

        self.sink.write_all(&bytes)?;
        self.bytes_written += bytes.len() as u64;

        debug!(
            "frame {}: {} samples in {} bytes",
            self.frame_number,
            n,
            bytes.len()
        );

        self.min_frame_len = min(self.min_frame_len, bytes.len() as u32);
        self.max_frame_len = self.max_frame_len.max(bytes.len() as u32);

        self.samples_written += u64::from(n);
        self.frame_number += 1;

        Ok(())
    }

    /// Evaluates the subframe candidates for one channel and returns the smallest, along with
    /// its exact coded size in bits.
    fn evaluate_subframe(
        &self,
        signal: &[i32],
        bps: u32,
        max_partition_order: u32,
    ) -> (SubframePlan, u64) {
        let n = signal.len() as u32;

        // Verbatim is the baseline every compressed candidate must beat.
        let mut best = (SubframePlan::Verbatim, 8 + u64::from(n) * u64::from(bps));

        // A constant subframe requires the entire signal, warm-up included, to be one value,
        // and nothing can beat it.
        if signal.iter().all(|s| *s == signal[0]) {
            return (SubframePlan::Constant { value: signal[0] }, 8 + u64::from(bps));
        }

        if n <= MAX_FIXED_ORDER {
            return best;
        }

        // Fixed predictors.
        let (guess_order, estimates) = fixed::best_order(signal);

        let (min_fixed, max_fixed) = if self.opts.do_exhaustive_model_search {
            (0, MAX_FIXED_ORDER)
        }
        else {
            (guess_order, guess_order)
        };

        for order in min_fixed..=max_fixed {
            let estimate = estimates[order as usize];

            // An estimate at or above the raw sample width cannot win.
            if estimate >= f64::from(bps) {
                continue;
            }

            let rice_estimate = ((estimate + 0.5) as u32).min(RICE_PARAMETER_ESCAPE - 1);

            let mut residual = Vec::new();
            fixed::compute_residual(signal, order, &mut residual);

            let (partitions, residual_bits) = find_best_partitions(
                &residual,
                order,
                n,
                rice_estimate,
                max_partition_order,
                self.opts.partition_search,
            );

            let bits = 8 + u64::from(order) * u64::from(bps) + residual_bits;

            if bits < best.1 {
                best = (SubframePlan::Fixed { order, residual, partitions }, bits);
            }
        }

        // Linear predictors.
        if self.opts.max_lpc_order > 0 {
            let max_order = min(self.opts.max_lpc_order, n - 1) as usize;

            let mut windowed = Vec::new();
            lpc::window_welch(signal, &mut windowed);

            let mut autoc = [0.0f64; MAX_LPC_ORDER as usize + 1];
            lpc::compute_autocorrelation(&windowed, max_order, &mut autoc);

            let mut lp_coeff = [[0.0f64; MAX_LPC_ORDER as usize]; MAX_LPC_ORDER as usize];
            let mut error = [0.0f64; MAX_LPC_ORDER as usize];

            let usable =
                lpc::compute_lp_coefficients(&autoc[..=max_order], &mut lp_coeff, &mut error);

            if usable > 0 {
                let (min_order, max_order) = if self.opts.do_exhaustive_model_search {
                    (1, usable)
                }
                else {
                    let guess =
                        lpc::best_order_estimate(&error, usable, signal.len(), bps);
                    (guess, guess)
                };

                let precisions = if self.opts.do_qlp_coeff_precision_search {
                    let hi = (32 - bps).saturating_sub(1).clamp(
                        MIN_QLP_COEFF_PRECISION,
                        MAX_QLP_COEFF_PRECISION,
                    );
                    MIN_QLP_COEFF_PRECISION..=hi
                }
                else {
                    self.qlp_precision..=self.qlp_precision
                };

                for order in min_order..=max_order {
                    let estimate =
                        lpc::expected_bits_per_residual_sample(error[order - 1], signal.len());

                    if estimate >= f64::from(bps) {
                        continue;
                    }

                    let rice_estimate =
                        ((estimate + 0.5) as u32).min(RICE_PARAMETER_ESCAPE - 1);

                    for precision in precisions.clone() {
                        let Some((coeffs, shift)) =
                            lpc::quantize_coefficients(&lp_coeff[order - 1][..order], precision)
                        else {
                            continue;
                        };

                        let mut residual = Vec::new();
                        lpc::compute_residual(signal, &coeffs, shift, &mut residual);

                        let (partitions, residual_bits) = find_best_partitions(
                            &residual,
                            order as u32,
                            n,
                            rice_estimate,
                            max_partition_order,
                            self.opts.partition_search,
                        );

                        let bits = 8
                            + 4
                            + 5
                            + u64::from(order as u32) * (u64::from(precision) + u64::from(bps))
                            + residual_bits;

                        if bits < best.1 {
                            best = (
                                SubframePlan::Lpc { precision, shift, coeffs, residual, partitions },
                                bits,
                            );
                        }
                    }
                }
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encoder(opts: EncoderOptions) -> EncoderResult<StreamEncoder<Cursor<Vec<u8>>>> {
        StreamEncoder::new(Cursor::new(Vec::new()), opts, Vec::new())
    }

    #[test]
    fn verify_option_validation() {
        let mut opts = EncoderOptions { channels: 0, ..Default::default() };
        assert!(matches!(encoder(opts.clone()), Err(EncoderError::InvalidNumberOfChannels)));

        opts.channels = 1;
        opts.do_mid_side = false;
        opts.bits_per_sample = 3;
        assert!(matches!(encoder(opts.clone()), Err(EncoderError::InvalidBitsPerSample)));

        opts.bits_per_sample = 16;
        opts.sample_rate = 0;
        assert!(matches!(encoder(opts.clone()), Err(EncoderError::InvalidSampleRate)));

        opts.sample_rate = 44_100;
        opts.block_size = 8;
        assert!(matches!(encoder(opts.clone()), Err(EncoderError::InvalidBlockSize)));

        opts.block_size = 4096;
        opts.qlp_coeff_precision = 3;
        assert!(matches!(encoder(opts.clone()), Err(EncoderError::InvalidQlpCoeffPrecision)));

        opts.qlp_coeff_precision = 0;
        opts.do_mid_side = true;
        assert!(matches!(encoder(opts.clone()), Err(EncoderError::MidSideChannelsMismatch)));

        // 17 bits per sample is legal, but not in the streamable subset.
        opts.do_mid_side = false;
        opts.bits_per_sample = 17;
        assert!(matches!(encoder(opts.clone()), Err(EncoderError::NotStreamable)));

        opts.streamable_subset = false;
        assert!(encoder(opts).is_ok());
    }

    #[test]
    fn verify_empty_stream_finish() {
        let opts = EncoderOptions { padding: Some(128), ..Default::default() };

        let encoder = encoder(opts).unwrap();
        let (info, _sink) = encoder.finish().unwrap();

        // No samples were processed: the counts stay at their unknown values.
        assert_eq!(info.total_samples, 0);
        assert_eq!(info.min_frame_size, 0);
        assert_eq!(info.max_frame_size, 0);
    }
}
