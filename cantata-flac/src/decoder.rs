// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The FLAC stream decoder: a state machine fed from a [`MediaSource`] that parses the stream
//! marker and metadata blocks, then decodes audio frames, resynchronising across corrupt data.

use std::io::SeekFrom;

use cantata_core::audio::{AudioBuffer, Channels, SignalSpec};
use cantata_core::checksum::Crc16Ansi;
use cantata_core::errors::{decode_error, reset_error, Error, Result};
use cantata_core::io::{
    BitStreamLtr, MediaSource, MediaSourceStream, Monitor, MonitorStream, ReadBitsLtr, ReadBytes,
};

use log::warn;

use smallvec::SmallVec;

use crate::frame::{self, BlockSequence, ChannelAssignment, FrameHeader};
use crate::metadata::{
    read_stream_marker, Application, MetadataBlock, MetadataBlockData, MetadataBlockHeader,
    MetadataType, SeekTable, StreamInfo,
};
use crate::subframe::read_subframe;
use crate::validate::Validator;

/// The processing state of a [`StreamDecoder`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecoderState {
    /// Searching for the stream marker (or an ID3v2 tag preceding it).
    SearchForMetadata,
    /// Reading metadata blocks.
    ReadMetadata,
    /// Scanning for the next audio frame header.
    SearchForFrameSync,
    /// Decoding an audio frame.
    ReadFrame,
    /// The end of the stream was reached.
    EndOfStream,
    /// An observer aborted processing. The decoder must be reset before further use.
    Aborted,
}

/// The recoverable and fatal conditions reported through [`DecoderObserver::on_error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Synchronisation to the frame stream was lost. The decoder resynchronises.
    LostSync,
    /// A frame header was structurally valid but contradicts the stream information. The
    /// decoder resynchronises.
    BadHeader,
    /// A whole-frame CRC failed. The frame is discarded and the decoder resynchronises.
    FrameCrcMismatch,
    /// The stream cannot be parsed at all. Fatal.
    UnparseableStream,
}

/// An observer's verdict on continued processing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reaction {
    Continue,
    Abort,
}

/// Descriptive fields of one decoded frame.
#[derive(Copy, Clone, Debug)]
pub struct FrameInfo {
    /// The stream sample number of the first sample of this frame.
    pub first_sample: u64,
    /// The number of samples per channel in this frame.
    pub block_size: u32,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    pub channels: u32,
}

/// The callbacks of the decoder. Sample buffers passed to `on_frame` are borrowed for the
/// duration of the call and must not be retained.
pub trait DecoderObserver {
    /// A metadata block passed the respond/ignore filter.
    fn on_metadata(&mut self, _block: &MetadataBlock) -> Reaction {
        Reaction::Continue
    }

    /// One frame of audio was decoded. Channel `i` of the frame is `buf.chan(i)`.
    fn on_frame(&mut self, _info: &FrameInfo, _buf: &AudioBuffer) -> Reaction {
        Reaction::Continue
    }

    /// A non-fatal decoding condition occurred. No partial frame accompanies it.
    fn on_error(&mut self, _status: DecodeStatus) -> Reaction {
        Reaction::Continue
    }
}

/// An observer that ignores everything, used when probing frames internally.
pub(crate) struct NullObserver;

impl DecoderObserver for NullObserver {}

/// Selects which metadata blocks are delivered to [`DecoderObserver::on_metadata`].
///
/// The effective set is the respond set minus the ignore set, with per-identifier exceptions
/// for APPLICATION blocks. By default only the STREAMINFO block is delivered.
pub struct MetadataFilter {
    respond: [bool; 128],
    respond_apps: Vec<[u8; 4]>,
    ignore_apps: Vec<[u8; 4]>,
}

impl Default for MetadataFilter {
    fn default() -> Self {
        let mut respond = [false; 128];
        respond[usize::from(MetadataType::StreamInfo.code())] = true;

        MetadataFilter { respond, respond_apps: Vec::new(), ignore_apps: Vec::new() }
    }
}

impl MetadataFilter {
    /// Deliver blocks of the given type.
    pub fn respond(&mut self, block_type: MetadataType) {
        self.respond[usize::from(block_type.code()) & 0x7f] = true;
    }

    /// Deliver every block type.
    pub fn respond_all(&mut self) {
        self.respond = [true; 128];
        self.ignore_apps.clear();
    }

    /// Deliver APPLICATION blocks with the given identifier even if the type is ignored.
    pub fn respond_application(&mut self, id: [u8; 4]) {
        self.ignore_apps.retain(|other| *other != id);
        self.respond_apps.push(id);
    }

    /// Do not deliver blocks of the given type.
    pub fn ignore(&mut self, block_type: MetadataType) {
        self.respond[usize::from(block_type.code()) & 0x7f] = false;
    }

    /// Deliver no blocks at all.
    pub fn ignore_all(&mut self) {
        self.respond = [false; 128];
        self.respond_apps.clear();
    }

    /// Do not deliver APPLICATION blocks with the given identifier even if the type is
    /// responded.
    pub fn ignore_application(&mut self, id: [u8; 4]) {
        self.respond_apps.retain(|other| *other != id);
        self.ignore_apps.push(id);
    }

    fn is_responded(&self, block_type: MetadataType, app_id: Option<[u8; 4]>) -> bool {
        if let Some(id) = app_id {
            if self.ignore_apps.contains(&id) {
                return false;
            }
            if self.respond_apps.contains(&id) {
                return true;
            }
        }

        self.respond[usize::from(block_type.code()) & 0x7f]
    }
}

/// Options for a [`StreamDecoder`].
pub struct DecoderOptions {
    /// Verify the decoded audio against the MD5 signature stored in the stream information
    /// block. Checking is abandoned if the stream is seeked.
    pub md5_checking: bool,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        DecoderOptions { md5_checking: true }
    }
}

/// Everything known about one successfully decoded frame, including its byte extent within the
/// stream. Used by the seek machinery.
#[derive(Copy, Clone, Debug)]
pub(crate) struct FrameDesc {
    pub first_sample: u64,
    pub block_size: u32,
    pub start_pos: u64,
    pub end_pos: u64,
    pub info: FrameInfo,
}

/// A FLAC stream decoder.
pub struct StreamDecoder {
    pub(crate) reader: MediaSourceStream,
    pub(crate) state: DecoderState,
    filter: MetadataFilter,
    pub(crate) stream_info: Option<StreamInfo>,
    pub(crate) seek_table: Option<SeekTable>,
    pub(crate) buf: AudioBuffer,
    validator: Validator,
    pub(crate) md5_checking: bool,
    pub(crate) first_frame_offset: u64,
}

impl StreamDecoder {
    /// Instantiate a decoder over the given source.
    pub fn new(source: Box<dyn MediaSource>, options: DecoderOptions) -> StreamDecoder {
        StreamDecoder {
            reader: MediaSourceStream::new(source),
            state: DecoderState::SearchForMetadata,
            filter: MetadataFilter::default(),
            stream_info: None,
            seek_table: None,
            buf: AudioBuffer::new(0, SignalSpec::new(0, Channels::empty())),
            validator: Validator::default(),
            md5_checking: options.md5_checking,
            first_frame_offset: 0,
        }
    }

    /// Gets the decoder's processing state.
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Gets the stream information block, available once metadata processing has begun.
    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    /// Gets the metadata filter for mutation. Must be configured before metadata is processed.
    pub fn metadata_filter_mut(&mut self) -> &mut MetadataFilter {
        &mut self.filter
    }

    /// Advances the decoder by one step: the stream marker, one metadata block, or one audio
    /// frame. Returns false once the end of the stream is reached.
    pub fn process_single(&mut self, observer: &mut dyn DecoderObserver) -> Result<bool> {
        match self.state {
            DecoderState::Aborted => reset_error(),
            DecoderState::EndOfStream => Ok(false),
            DecoderState::SearchForMetadata => {
                match read_stream_marker(&mut self.reader) {
                    Ok(()) => {
                        self.state = DecoderState::ReadMetadata;
                        Ok(true)
                    }
                    Err(err) => {
                        observer.on_error(DecodeStatus::UnparseableStream);
                        Err(err)
                    }
                }
            }
            DecoderState::ReadMetadata => match self.read_metadata_block(observer) {
                Ok(()) => Ok(true),
                Err(err @ Error::DecodeError(_)) => {
                    observer.on_error(DecodeStatus::UnparseableStream);
                    Err(err)
                }
                Err(err) => Err(err),
            },
            DecoderState::SearchForFrameSync | DecoderState::ReadFrame => {
                Ok(self.read_frame(observer, true)?.is_some())
            }
        }
    }

    /// Processes the stream up-to the first audio frame, delivering metadata on the way.
    pub fn process_until_end_of_metadata(
        &mut self,
        observer: &mut dyn DecoderObserver,
    ) -> Result<()> {
        while matches!(
            self.state,
            DecoderState::SearchForMetadata | DecoderState::ReadMetadata
        ) {
            self.process_single(observer)?;
        }

        Ok(())
    }

    /// Processes the remainder of the stream.
    pub fn process_until_end_of_stream(
        &mut self,
        observer: &mut dyn DecoderObserver,
    ) -> Result<()> {
        while self.process_single(observer)? {}

        Ok(())
    }

    /// Finishes decoding. Returns false if and only if MD5 checking was enabled, the stream
    /// carried a signature, and the decoded audio does not match it.
    pub fn finish(&mut self) -> bool {
        if !self.md5_checking {
            return true;
        }

        match &self.stream_info {
            Some(info) if info.has_md5() => {
                let decoded = self.validator.md5();

                if decoded != info.md5 {
                    warn!("decoded audio does not match the stream md5 signature");
                    return false;
                }

                true
            }
            _ => true,
        }
    }

    /// Resets the decoder to decode the stream again from the start. Fails if the source is
    /// unseekable.
    pub fn reset(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;

        self.state = DecoderState::SearchForMetadata;
        self.stream_info = None;
        self.seek_table = None;
        self.validator = Validator::default();
        self.first_frame_offset = 0;

        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.state = DecoderState::Aborted;
        reset_error()
    }

    fn observe(&mut self, reaction: Reaction) -> Result<()> {
        match reaction {
            Reaction::Continue => Ok(()),
            Reaction::Abort => self.abort(),
        }
    }

    /// Hands the current contents of the sample buffer to the observer. Used by the seek
    /// machinery to deliver the tail of the frame containing a seek target.
    pub(crate) fn deliver_frame(
        &mut self,
        observer: &mut dyn DecoderObserver,
        info: &FrameInfo,
    ) -> Result<()> {
        let reaction = observer.on_frame(info, &self.buf);
        self.observe(reaction)
    }

    fn read_metadata_block(&mut self, observer: &mut dyn DecoderObserver) -> Result<()> {
        let header = MetadataBlockHeader::read(&mut self.reader)?;

        // The stream information block is mandatory and always first.
        if self.stream_info.is_none() && header.block_type != MetadataType::StreamInfo {
            return decode_error("flac: first metadata block is not stream info");
        }

        match header.block_type {
            MetadataType::StreamInfo => {
                if self.stream_info.is_some() {
                    return decode_error("flac: found more than one stream info block");
                }

                if header.block_len != StreamInfo::LEN {
                    return decode_error("flac: invalid stream info block size");
                }

                let info = StreamInfo::read(&mut self.reader)?;

                // Size the sample buffer for the largest block the stream declares.
                let channels = Channels::from_count(info.channels as usize)
                    .ok_or(Error::DecodeError("flac: invalid channel count"))?;

                self.buf = AudioBuffer::new(
                    u64::from(info.max_block_size),
                    SignalSpec::new(info.sample_rate, channels),
                );

                let responded = self.filter.is_responded(MetadataType::StreamInfo, None);

                self.stream_info = Some(info.clone());

                if responded {
                    let block = MetadataBlock {
                        is_last: header.is_last,
                        data: MetadataBlockData::StreamInfo(info),
                    };

                    let reaction = observer.on_metadata(&block);
                    self.observe(reaction)?;
                }
            }
            MetadataType::SeekTable => {
                // The seek table is always retained for seeking, responded or not.
                let table = SeekTable::read(&mut self.reader, header.block_len)?;

                let responded = self.filter.is_responded(MetadataType::SeekTable, None);

                self.seek_table = Some(table.clone());

                if responded {
                    let block = MetadataBlock {
                        is_last: header.is_last,
                        data: MetadataBlockData::SeekTable(table),
                    };

                    let reaction = observer.on_metadata(&block);
                    self.observe(reaction)?;
                }
            }
            MetadataType::Application => {
                if header.block_len < 4 {
                    return decode_error("flac: application block is shorter than its identifier");
                }

                // The respond decision may hinge on the application identifier.
                let id = self.reader.read_quad_bytes()?;

                if self.filter.is_responded(MetadataType::Application, Some(id)) {
                    let data =
                        self.reader.read_boxed_slice_exact(header.block_len as usize - 4)?;

                    let block = MetadataBlock {
                        is_last: header.is_last,
                        data: MetadataBlockData::Application(Application { id, data }),
                    };

                    let reaction = observer.on_metadata(&block);
                    self.observe(reaction)?;
                }
                else {
                    self.reader.ignore_bytes(u64::from(header.block_len) - 4)?;
                }
            }
            _ => {
                if self.filter.is_responded(header.block_type, None) {
                    let mut scoped = cantata_core::io::ScopedStream::new(
                        &mut self.reader,
                        u64::from(header.block_len),
                    );

                    let data =
                        MetadataBlockData::read(&mut scoped, header.block_type, header.block_len)?;

                    scoped.ignore()?;

                    let block = MetadataBlock { is_last: header.is_last, data };

                    let reaction = observer.on_metadata(&block);
                    self.observe(reaction)?;
                }
                else {
                    self.reader.ignore_bytes(u64::from(header.block_len))?;
                }
            }
        }

        if header.is_last {
            self.first_frame_offset = self.reader.pos();
            self.state = DecoderState::SearchForFrameSync;
        }

        Ok(())
    }

    /// Synchronises to, and decodes, the next frame of the stream. With `deliver`, the decoded
    /// samples feed MD5 validation and the frame is passed to the observer; without, the frame
    /// is only decoded (seek probing).
    ///
    /// Returns `None` at the end of the stream.
    pub(crate) fn read_frame(
        &mut self,
        observer: &mut dyn DecoderObserver,
        deliver: bool,
    ) -> Result<Option<FrameDesc>> {
        let Some(info) = self.stream_info.clone() else {
            return decode_error("flac: audio frame before stream info");
        };

        loop {
            self.state = DecoderState::SearchForFrameSync;

            // Scan for a frame sync preamble. Reaching the end of the stream here is the normal
            // end of decoding.
            let sync = match frame::sync_frame(&mut self.reader) {
                Ok(sync) => sync,
                Err(err) if err.is_end_of_stream() => {
                    self.state = DecoderState::EndOfStream;
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };

            let header_start = self.reader.pos() - 2;

            self.state = DecoderState::ReadFrame;

            // The whole frame, sync field included, is protected by a CRC-16.
            let mut crc16 = Crc16Ansi::new(0);
            crc16.process_buf_bytes(&sync.to_be_bytes());

            let mut reader16 = MonitorStream::new(&mut self.reader, crc16);

            let header = match frame::read_frame_header(&mut reader16, sync) {
                Ok(header) => header,
                Err(_) => {
                    // Not actually a frame header (or the stream ended inside it). Resume the
                    // scan one byte into the false sync, silently; a definitive end of stream
                    // surfaces in the scan itself.
                    self.reader.seek_buffered(header_start + 1);
                    continue;
                }
            };

            let block_size = u32::from(header.block_num_samples);
            let bits_per_sample = header.bits_per_sample.unwrap_or(info.bits_per_sample);

            // A decorrelated difference channel is one bit wider than the frame's samples, and
            // must still fit the 32-bit sample type.
            let side_overflow = bits_per_sample >= 32
                && !matches!(header.channel_assignment, ChannelAssignment::Independent(_));

            // A parseable header that contradicts the stream information is reported before
            // resynchronising.
            if !check_header_against_info(&header, &info) || side_overflow {
                if deliver {
                    let reaction = observer.on_error(DecodeStatus::BadHeader);
                    self.observe(reaction)?;
                }

                self.reader.seek_buffered(header_start + 1);
                continue;
            }

            self.buf.clear();
            self.buf.render_reserved(block_size as usize);

            // A decode failure here covers malformed subframes and streams that end mid-frame;
            // both lose synchronisation and re-enter the scan one byte past the failed header.
            if decode_frame_samples(&mut reader16, &header, bits_per_sample, &mut self.buf)
                .is_err()
            {
                self.buf.clear();

                if deliver {
                    let reaction = observer.on_error(DecodeStatus::LostSync);
                    self.observe(reaction)?;
                }

                self.reader.seek_buffered(header_start + 1);
                continue;
            }

            // Validate the frame CRC-16.
            let crc16_computed = reader16.monitor().crc();

            let crc16_expected = match reader16.into_inner().read_be_u16() {
                Ok(crc) => crc,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // The stream ended where the frame footer should be.
                    self.buf.clear();

                    if deliver {
                        let reaction = observer.on_error(DecodeStatus::LostSync);
                        self.observe(reaction)?;
                    }

                    self.reader.seek_buffered(header_start + 1);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if crc16_computed != crc16_expected {
                self.buf.clear();

                if deliver {
                    let reaction = observer.on_error(DecodeStatus::FrameCrcMismatch);
                    self.observe(reaction)?;
                }

                self.reader.seek_buffered(header_start + 1);
                continue;
            }

            let end_pos = self.reader.pos();

            let first_sample = frame_first_sample(&header, &info);

            let frame_info = FrameInfo {
                first_sample,
                block_size,
                sample_rate: header.sample_rate.unwrap_or(info.sample_rate),
                bits_per_sample,
                channels: header.channel_assignment.num_channels(),
            };

            if deliver {
                if self.md5_checking {
                    let channels: SmallVec<[&[i32]; 8]> =
                        (0..frame_info.channels as usize).map(|ch| self.buf.chan(ch)).collect();

                    self.validator.update(&channels, bits_per_sample);
                }

                let reaction = observer.on_frame(&frame_info, &self.buf);
                self.observe(reaction)?;
            }

            self.state = DecoderState::SearchForFrameSync;

            return Ok(Some(FrameDesc {
                first_sample,
                block_size,
                start_pos: header_start,
                end_pos,
                info: frame_info,
            }));
        }
    }
}

/// Checks the frame header fields that overlap the stream information for consistency.
fn check_header_against_info(header: &FrameHeader, info: &StreamInfo) -> bool {
    if header.channel_assignment.num_channels() != info.channels {
        return false;
    }

    if let Some(bps) = header.bits_per_sample {
        if bps != info.bits_per_sample {
            return false;
        }
    }

    if let Some(rate) = header.sample_rate {
        if rate != info.sample_rate {
            return false;
        }
    }

    if u32::from(header.block_num_samples) > u32::from(info.max_block_size) {
        return false;
    }

    true
}

/// The stream sample number of the first sample of a frame.
fn frame_first_sample(header: &FrameHeader, info: &StreamInfo) -> u64 {
    match header.block_sequence {
        BlockSequence::BySample(sample) => sample,
        BlockSequence::ByFrame(frame) => {
            // Fixed block size streams space frames evenly, except the final frame which may
            // be short (and changes nothing about its own starting sample).
            let block_size = if info.min_block_size == info.max_block_size {
                u32::from(info.max_block_size)
            }
            else {
                u32::from(header.block_num_samples)
            };

            u64::from(frame) * u64::from(block_size)
        }
    }
}

/// Decodes all subframes of a frame and undoes the channel decorrelation, filling `buf`.
fn decode_frame_samples<B: ReadBytes>(
    reader: &mut B,
    header: &FrameHeader,
    bits_per_sample: u32,
    buf: &mut AudioBuffer,
) -> Result<()> {
    // Subframes have no byte-aligned content, so bit-level reads span the remainder of the
    // frame, with trailing padding dropped by the realignment below.
    let mut bs = BitStreamLtr::new(reader);

    match header.channel_assignment {
        ChannelAssignment::Independent(channels) => {
            for ch in 0..channels as usize {
                read_subframe(&mut bs, bits_per_sample, buf.chan_mut(ch))?;
            }
        }
        // For the decorrelated assignments, the difference channel is one bit wider.
        ChannelAssignment::LeftSide => {
            let (left, side) = buf.chan_pair_mut(0, 1);

            read_subframe(&mut bs, bits_per_sample, left)?;
            read_subframe(&mut bs, bits_per_sample + 1, side)?;

            decorrelate_left_side(left, side);
        }
        ChannelAssignment::MidSide => {
            let (mid, side) = buf.chan_pair_mut(0, 1);

            read_subframe(&mut bs, bits_per_sample, mid)?;
            read_subframe(&mut bs, bits_per_sample + 1, side)?;

            decorrelate_mid_side(mid, side);
        }
        ChannelAssignment::RightSide => {
            let (side, right) = buf.chan_pair_mut(0, 1);

            read_subframe(&mut bs, bits_per_sample + 1, side)?;
            read_subframe(&mut bs, bits_per_sample, right)?;

            decorrelate_right_side(right, side);
        }
    }

    // Drop the zero bits padding the frame to its trailing byte boundary.
    bs.realign();

    Ok(())
}

/// Restores the right channel from left and side: R = L - S.
fn decorrelate_left_side(left: &[i32], side: &mut [i32]) {
    for (s, l) in side.iter_mut().zip(left) {
        *s = *l - *s;
    }
}

/// Restores left and right from mid and side.
fn decorrelate_mid_side(mid: &mut [i32], side: &mut [i32]) {
    for (m, s) in mid.iter_mut().zip(side) {
        // The mid channel is the floored average, so it lost the low bit of L + R. That bit is
        // recoverable: L - R and L + R have the same parity, so it is the low bit of the side
        // channel. Doubling mid and restoring the parity bit gives L + R exactly, from which
        // both channels follow.
        let sum = (*m << 1) | (*s & 1);

        *m = (sum + *s) >> 1;
        *s = (sum - *s) >> 1;
    }
}

/// Restores the left channel from right and side: L = R + S.
fn decorrelate_right_side(right: &[i32], side: &mut [i32]) {
    for (s, r) in side.iter_mut().zip(right) {
        *s += *r;
    }
}

#[cfg(test)]
mod tests {
    use super::{decorrelate_left_side, decorrelate_mid_side, decorrelate_right_side};

    #[test]
    fn verify_decorrelation_inverses() {
        let left: Vec<i32> = vec![0, 1, -1, 32_767, -32_768, 1000, -999, 3];
        let right: Vec<i32> = vec![0, -1, 1, -32_768, 32_767, 999, -1000, -3];

        // Left/side.
        let mut side: Vec<i32> = left.iter().zip(&right).map(|(l, r)| l - r).collect();
        decorrelate_left_side(&left, &mut side);
        assert_eq!(side, right);

        // Right/side.
        let mut side: Vec<i32> = left.iter().zip(&right).map(|(l, r)| l - r).collect();
        decorrelate_right_side(&right, &mut side);
        assert_eq!(side, left);

        // Mid/side.
        let mut mid: Vec<i32> = left.iter().zip(&right).map(|(l, r)| (l + r) >> 1).collect();
        let mut side: Vec<i32> = left.iter().zip(&right).map(|(l, r)| l - r).collect();
        decorrelate_mid_side(&mut mid, &mut side);
        assert_eq!(mid, left);
        assert_eq!(side, right);
    }
}
