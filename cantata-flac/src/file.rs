// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seekable decoder: a [`StreamDecoder`] over a random-access source with sample-accurate
//! seeking driven by the seek table and interpolated bisection.

use std::io::SeekFrom;
use std::path::Path;

use cantata_core::errors::{seek_error, Error, Result, SeekErrorKind};
use cantata_core::io::MediaSource;

use log::debug;

use crate::decoder::{
    DecoderObserver, DecoderOptions, DecoderState, FrameInfo, MetadataFilter, NullObserver,
    StreamDecoder,
};
use crate::metadata::StreamInfo;

/// A FLAC decoder over a seekable source, adding [`FileDecoder::seek_absolute`] on top of the
/// state machine of [`StreamDecoder`].
pub struct FileDecoder {
    inner: StreamDecoder,
}

impl FileDecoder {
    /// Opens a FLAC file for decoding.
    pub fn open<P: AsRef<Path>>(path: P, options: DecoderOptions) -> Result<FileDecoder> {
        let file = std::fs::File::open(path)?;
        Ok(FileDecoder::new(Box::new(file), options))
    }

    /// Instantiate a decoder over any seekable source.
    pub fn new(source: Box<dyn MediaSource>, options: DecoderOptions) -> FileDecoder {
        FileDecoder { inner: StreamDecoder::new(source, options) }
    }

    pub fn state(&self) -> DecoderState {
        self.inner.state()
    }

    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.inner.stream_info()
    }

    pub fn metadata_filter_mut(&mut self) -> &mut MetadataFilter {
        self.inner.metadata_filter_mut()
    }

    pub fn process_single(&mut self, observer: &mut dyn DecoderObserver) -> Result<bool> {
        self.inner.process_single(observer)
    }

    pub fn process_until_end_of_metadata(
        &mut self,
        observer: &mut dyn DecoderObserver,
    ) -> Result<()> {
        self.inner.process_until_end_of_metadata(observer)
    }

    pub fn process_until_end_of_stream(
        &mut self,
        observer: &mut dyn DecoderObserver,
    ) -> Result<()> {
        self.inner.process_until_end_of_stream(observer)
    }

    /// Finishes decoding, verifying the MD5 signature unless checking was disabled or a seek
    /// was performed.
    pub fn finish(&mut self) -> bool {
        self.inner.finish()
    }

    pub fn reset(&mut self) -> Result<()> {
        self.inner.reset()
    }

    /// Seeks so that the next sample delivered is stream sample `target`. The tail of the frame
    /// containing the target is delivered to the observer before this returns; decoding then
    /// continues normally from the following frame.
    ///
    /// Seeking disables MD5 verification for the remainder of the stream, since the signature
    /// can no longer be computed over the full output.
    pub fn seek_absolute(
        &mut self,
        target: u64,
        observer: &mut dyn DecoderObserver,
    ) -> Result<()> {
        // The stream parameters are required, process metadata if it has not been done yet.
        if matches!(
            self.inner.state(),
            DecoderState::SearchForMetadata | DecoderState::ReadMetadata
        ) {
            self.inner.process_until_end_of_metadata(observer)?;
        }

        let Some(info) = self.inner.stream_info().cloned() else {
            return seek_error(SeekErrorKind::Unseekable);
        };

        if !self.inner.reader.is_seekable() {
            return seek_error(SeekErrorKind::Unseekable);
        }

        // A stream of unknown length cannot be position-interpolated.
        if info.total_samples == 0 {
            return seek_error(SeekErrorKind::Indeterminate);
        }

        if target >= info.total_samples {
            return seek_error(SeekErrorKind::OutOfRange);
        }

        let stream_len = match self.inner.reader.byte_len() {
            Some(len) => len,
            None => return seek_error(SeekErrorKind::Indeterminate),
        };

        // The verification signature is unattainable once frames are skipped.
        self.inner.md5_checking = false;

        // The search window, in bytes and in samples.
        let mut lower = self.inner.first_frame_offset;
        let mut upper = stream_len;
        let mut lower_sample = 0u64;
        let mut upper_sample = info.total_samples;

        // Tighten the window with the seek table: the greatest point at or before the target,
        // and the smallest point past it.
        if let Some(table) = &self.inner.seek_table {
            for point in &table.points {
                if point.is_placeholder() || point.frame_samples == 0 {
                    continue;
                }

                let offset = self.inner.first_frame_offset + point.stream_offset;

                if offset >= stream_len {
                    continue;
                }

                if point.sample_number <= target && point.sample_number >= lower_sample {
                    lower = offset;
                    lower_sample = point.sample_number;
                }

                if point.sample_number > target && point.sample_number < upper_sample {
                    upper = offset;
                    upper_sample = point.sample_number;
                }
            }

            debug!(
                "seek table narrowed the search to bytes [{}, {}), samples [{}, {})",
                lower, upper, lower_sample, upper_sample
            );
        }

        // A rough upper bound on the byte length of one frame, used to bias landings to just
        // before a target rather than just after.
        let mut approx_frame_bytes = if info.max_frame_size > 0 {
            u64::from(info.max_frame_size)
        }
        else {
            u64::from(info.max_block_size) * u64::from(info.channels)
                * u64::from(info.bits_per_sample)
                / 8
                + 64
        };

        let mut last_frame_start: Option<u64> = None;

        for _ in 0..64 {
            // Interpolate a byte position proportional to the target within the window, backed
            // off by the frame size estimate.
            let span = (upper_sample - lower_sample).max(1);
            let frac = (target - lower_sample) as f64 / span as f64;

            let hi = if upper > lower { upper - 1 } else { lower };

            let pos = (lower + ((upper - lower) as f64 * frac) as u64)
                .saturating_sub(approx_frame_bytes)
                .clamp(lower, hi);

            self.inner.reader.seek(SeekFrom::Start(pos))?;

            let desc = match self.inner.read_frame(&mut NullObserver, false)? {
                Some(desc) => desc,
                None => {
                    // Ran off the end of the stream: every remaining frame starts before pos.
                    if pos <= lower {
                        return seek_error(SeekErrorKind::OutOfRange);
                    }

                    upper = pos;
                    continue;
                }
            };

            let frame_end_sample = desc.first_sample + u64::from(desc.block_size);

            if target >= desc.first_sample && target < frame_end_sample {
                // Landed. Deliver the tail of this frame from the target onward; subsequent
                // frames then follow in order.
                let skip = (target - desc.first_sample) as usize;

                self.inner.buf.trim_start(skip);

                let frame_info = FrameInfo {
                    first_sample: target,
                    block_size: desc.block_size - skip as u32,
                    ..desc.info
                };

                self.inner.deliver_frame(observer, &frame_info)?;

                return Ok(());
            }

            // Two landings on the same frame would interpolate identically forever; widen the
            // back-step to escape.
            if last_frame_start == Some(desc.start_pos) {
                approx_frame_bytes = approx_frame_bytes.saturating_mul(2);
                continue;
            }

            last_frame_start = Some(desc.start_pos);

            if desc.first_sample > target {
                upper = desc.start_pos;
                upper_sample = desc.first_sample;
            }
            else {
                lower = desc.end_pos;
                lower_sample = frame_end_sample;
            }
        }

        Err(Error::SeekError(SeekErrorKind::OutOfRange))
    }
}
