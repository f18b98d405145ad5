// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The FLAC metadata block model, and the three tiers of metadata editing: the read-only stream
//! information reader ([`read_stream_info`]), the single-file iterator ([`simple::SimpleEditor`])
//! and the in-memory chain editor ([`chain::Chain`]).

use std::io;
use std::io::{Read, Write};
use std::path::Path;

use cantata_core::errors::{decode_error, Error, Result};
use cantata_core::io::{FiniteStream, MediaSourceStream, ReadBytes, ScopedStream};

use thiserror::Error as ThisError;

use crate::format::{self, SEEK_POINT_PLACEHOLDER, STREAM_MARKER};

pub mod chain;
pub mod simple;

pub use chain::Chain;
pub use simple::SimpleEditor;

/// The error type of the metadata editors.
#[derive(Debug, ThisError)]
pub enum EditorError {
    /// The requested edit is not representable, e.g. replacing a STREAMINFO block with a block
    /// of a different type.
    #[error("illegal input")]
    IllegalInput,
    /// The file is not a FLAC file.
    #[error("not a flac file")]
    NotAFlacFile,
    /// The file is not writable.
    #[error("file is not writable")]
    NotWritable,
    /// The metadata is malformed.
    #[error("bad metadata: {0}")]
    BadMetadata(&'static str),
    #[error("read error")]
    Read(#[source] io::Error),
    #[error("seek error")]
    Seek(#[source] io::Error),
    #[error("write error")]
    Write(#[source] io::Error),
    #[error("rename error")]
    Rename(#[source] io::Error),
    #[error("unlink error")]
    Unlink(#[source] io::Error),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl From<Error> for EditorError {
    fn from(err: Error) -> EditorError {
        match err {
            Error::IoError(err) => EditorError::Read(err),
            Error::DecodeError(msg) => EditorError::BadMetadata(msg),
            _ => EditorError::Internal("unexpected error kind"),
        }
    }
}

/// The type of a metadata block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetadataType {
    StreamInfo,
    Padding,
    Application,
    SeekTable,
    VorbisComment,
    CueSheet,
    Unknown(u8),
}

impl MetadataType {
    pub fn from_code(code: u8) -> MetadataType {
        match code {
            0 => MetadataType::StreamInfo,
            1 => MetadataType::Padding,
            2 => MetadataType::Application,
            3 => MetadataType::SeekTable,
            4 => MetadataType::VorbisComment,
            5 => MetadataType::CueSheet,
            _ => MetadataType::Unknown(code),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            MetadataType::StreamInfo => 0,
            MetadataType::Padding => 1,
            MetadataType::Application => 2,
            MetadataType::SeekTable => 3,
            MetadataType::VorbisComment => 4,
            MetadataType::CueSheet => 5,
            MetadataType::Unknown(code) => *code,
        }
    }
}

/// A metadata block header: the last-block flag, the block type, and the body length in bytes.
#[derive(Copy, Clone, Debug)]
pub struct MetadataBlockHeader {
    pub is_last: bool,
    pub block_type: MetadataType,
    pub block_len: u32,
}

impl MetadataBlockHeader {
    /// The serialised size of a block header.
    pub const LEN: u32 = 4;

    /// Read a metadata block header.
    pub fn read<B: ReadBytes>(reader: &mut B) -> Result<MetadataBlockHeader> {
        let header_enc = reader.read_u8()?;

        // The first bit of the header indicates if this is the last metadata block.
        let is_last = (header_enc & 0x80) == 0x80;

        // The next 7 bits of the header indicate the block type.
        let block_type_id = header_enc & 0x7f;

        // Type 127 is forbidden to avoid confusion with a frame sync code.
        if block_type_id == 0x7f {
            return decode_error("flac: invalid metadata block type");
        }

        let block_len = reader.read_be_u24()?;

        Ok(MetadataBlockHeader {
            is_last,
            block_type: MetadataType::from_code(block_type_id),
            block_len,
        })
    }

    /// Serialise the block header.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let tag = if self.is_last { 0x80 } else { 0x00 } | self.block_type.code();

        writer.write_all(&[tag])?;
        writer.write_all(&self.block_len.to_be_bytes()[1..4])
    }
}

/// A STREAMINFO block. The 34-byte description of the stream that always heads the metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    /// The minimum and maximum number of decoded samples per block of audio.
    pub min_block_size: u16,
    pub max_block_size: u16,
    /// The minimum and maximum byte length of an encoded frame. Either may be 0 if unknown.
    pub min_frame_size: u32,
    pub max_frame_size: u32,
    /// The sample rate in Hz.
    pub sample_rate: u32,
    /// The number of channels.
    pub channels: u32,
    /// The number of bits per sample.
    pub bits_per_sample: u32,
    /// The total number of samples per channel, 0 if unknown.
    pub total_samples: u64,
    /// The MD5 signature of the decoded audio, all zeros if unknown.
    pub md5: [u8; 16],
}

impl StreamInfo {
    /// The serialised size of a stream information block body.
    pub const LEN: u32 = 34;

    /// Read a stream information block body.
    pub fn read<B: ReadBytes>(reader: &mut B) -> Result<StreamInfo> {
        let min_block_size = reader.read_be_u16()?;
        let max_block_size = reader.read_be_u16()?;

        // Block lengths must lie in the range [16, 65535] samples.
        if min_block_size < 16 || max_block_size < 16 {
            return decode_error("flac: minimum block length is 16 samples");
        }

        if max_block_size < min_block_size {
            return decode_error("flac: maximum block length is less than the minimum");
        }

        let min_frame_size = reader.read_be_u24()?;
        let max_frame_size = reader.read_be_u24()?;

        // A frame size of 0 means unknown; known values must be consistently ordered.
        if min_frame_size > 0 && max_frame_size > 0 && max_frame_size < min_frame_size {
            return decode_error("flac: maximum frame size is less than the minimum");
        }

        // Sample rate (20 bits), channels - 1 (3 bits), bits per sample - 1 (5 bits), and total
        // samples (36 bits) pack into exactly 8 bytes.
        let packed = reader.read_be_u64()?;

        let sample_rate = (packed >> 44) as u32;
        let channels = ((packed >> 41) & 0x7) as u32 + 1;
        let bits_per_sample = ((packed >> 36) & 0x1f) as u32 + 1;
        let total_samples = packed & 0x000f_ffff_ffff;

        if !format::is_valid_sample_rate(sample_rate) {
            return decode_error("flac: stream sample rate out of bounds");
        }

        if !format::is_valid_bits_per_sample(bits_per_sample) {
            return decode_error("flac: stream bits per sample out of bounds");
        }

        let mut md5 = [0u8; 16];
        reader.read_buf_exact(&mut md5)?;

        Ok(StreamInfo {
            min_block_size,
            max_block_size,
            min_frame_size,
            max_frame_size,
            sample_rate,
            channels,
            bits_per_sample,
            total_samples,
            md5,
        })
    }

    /// Serialise the block body.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.min_block_size.to_be_bytes())?;
        writer.write_all(&self.max_block_size.to_be_bytes())?;
        writer.write_all(&self.min_frame_size.to_be_bytes()[1..4])?;
        writer.write_all(&self.max_frame_size.to_be_bytes()[1..4])?;

        let packed = (u64::from(self.sample_rate) << 44)
            | (u64::from(self.channels - 1) << 41)
            | (u64::from(self.bits_per_sample - 1) << 36)
            | (self.total_samples & 0x000f_ffff_ffff);

        writer.write_all(&packed.to_be_bytes())?;
        writer.write_all(&self.md5)
    }

    /// Returns true if the stream's MD5 signature is present (non-zero).
    pub fn has_md5(&self) -> bool {
        self.md5 != [0u8; 16]
    }
}

/// A PADDING block of `length` zero bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Padding {
    pub length: u32,
}

impl Padding {
    pub fn read<B: ReadBytes>(reader: &mut B, block_len: u32) -> Result<Padding> {
        reader.ignore_bytes(u64::from(block_len))?;
        Ok(Padding { length: block_len })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        // Write in bounded chunks so a large padding does not allocate its full length.
        const ZEROS: [u8; 1024] = [0u8; 1024];

        let mut rem = self.length as usize;

        while rem > 0 {
            let len = rem.min(ZEROS.len());
            writer.write_all(&ZEROS[..len])?;
            rem -= len;
        }

        Ok(())
    }
}

/// An APPLICATION block: a registered four-byte identifier and opaque data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Application {
    pub id: [u8; 4],
    pub data: Box<[u8]>,
}

impl Application {
    pub fn read<B: ReadBytes>(reader: &mut B, block_len: u32) -> Result<Application> {
        if block_len < 4 {
            return decode_error("flac: application block is shorter than its identifier");
        }

        let id = reader.read_quad_bytes()?;
        let data = reader.read_boxed_slice_exact(block_len as usize - 4)?;

        Ok(Application { id, data })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.id)?;
        writer.write_all(&self.data)
    }
}

/// One seek table entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SeekPoint {
    /// The number of the first sample in the target frame, or the placeholder sentinel.
    pub sample_number: u64,
    /// The byte offset of the target frame from the first frame.
    pub stream_offset: u64,
    /// The number of samples in the target frame.
    pub frame_samples: u16,
}

impl SeekPoint {
    pub const LEN: u32 = 18;

    /// A placeholder point, to be filled in by a later pass.
    pub const PLACEHOLDER: SeekPoint =
        SeekPoint { sample_number: SEEK_POINT_PLACEHOLDER, stream_offset: 0, frame_samples: 0 };

    pub fn is_placeholder(&self) -> bool {
        self.sample_number == SEEK_POINT_PLACEHOLDER
    }
}

/// A SEEKTABLE block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeekTable {
    pub points: Vec<SeekPoint>,
}

impl SeekTable {
    pub fn read<B: ReadBytes>(reader: &mut B, block_len: u32) -> Result<SeekTable> {
        if block_len % SeekPoint::LEN != 0 {
            return decode_error("flac: seek table length is not a multiple of the point size");
        }

        let mut points = Vec::with_capacity((block_len / SeekPoint::LEN) as usize);

        for _ in 0..block_len / SeekPoint::LEN {
            points.push(SeekPoint {
                sample_number: reader.read_be_u64()?,
                stream_offset: reader.read_be_u64()?,
                frame_samples: reader.read_be_u16()?,
            });
        }

        Ok(SeekTable { points })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for point in &self.points {
            writer.write_all(&point.sample_number.to_be_bytes())?;
            writer.write_all(&point.stream_offset.to_be_bytes())?;
            writer.write_all(&point.frame_samples.to_be_bytes())?;
        }

        Ok(())
    }

    pub fn len(&self) -> u32 {
        self.points.len() as u32 * SeekPoint::LEN
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Returns true if the table satisfies the format's ordering invariants: non-placeholder
    /// points strictly ascending by sample number, placeholders all at the end.
    pub fn is_legal(&self) -> bool {
        let mut last: Option<u64> = None;
        let mut seen_placeholder = false;

        for point in &self.points {
            if point.is_placeholder() {
                seen_placeholder = true;
                continue;
            }

            if seen_placeholder {
                return false;
            }

            if let Some(last) = last {
                if point.sample_number <= last {
                    return false;
                }
            }

            last = Some(point.sample_number);
        }

        true
    }

    /// Appends `count` placeholder points.
    pub fn template_append_placeholders(&mut self, count: usize) {
        self.points.extend(std::iter::repeat(SeekPoint::PLACEHOLDER).take(count));
    }

    /// Appends placeholder-offset points evenly spaced across `total_samples`, ready to be
    /// filled in by the encoder.
    pub fn template_append_spaced_points(&mut self, num: usize, total_samples: u64) {
        if num == 0 || total_samples == 0 {
            return;
        }

        for i in 0..num as u64 {
            self.points.push(SeekPoint {
                sample_number: i * total_samples / num as u64,
                stream_offset: 0,
                frame_samples: 0,
            });
        }
    }

    /// Sorts the table into its legal form: ascending by sample number with placeholders last.
    /// With `compact`, duplicate sample numbers collapse into placeholders so that each target
    /// is unique.
    pub fn template_sort(&mut self, compact: bool) {
        // The placeholder sentinel is the maximum sample number, so a stable sort moves all
        // placeholders to the end on its own.
        self.points.sort_by_key(|point| point.sample_number);

        if compact {
            let mut last: Option<u64> = None;

            for point in self.points.iter_mut() {
                if point.is_placeholder() {
                    break;
                }

                if last == Some(point.sample_number) {
                    *point = SeekPoint::PLACEHOLDER;
                }
                else {
                    last = Some(point.sample_number);
                }
            }

            // Demoted duplicates must join the other placeholders at the end.
            self.points.sort_by_key(|point| point.sample_number);
        }
    }
}

/// A VORBIS_COMMENT block, carried at the byte level: the vendor string and each comment are
/// opaque byte strings with little-endian length framing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VorbisComment {
    pub vendor: Vec<u8>,
    pub comments: Vec<Vec<u8>>,
}

impl VorbisComment {
    pub fn read<B: ReadBytes + FiniteStream>(reader: &mut B) -> Result<VorbisComment> {
        // Unlike the rest of the container, this block is little-endian.
        let vendor_len = reader.read_u32()?;

        if u64::from(vendor_len) > reader.bytes_available() {
            return decode_error("flac: comment vendor length exceeds the block");
        }

        let vendor = reader.read_boxed_slice_exact(vendor_len as usize)?.into_vec();

        let n_comments = reader.read_u32()?;

        let mut comments = Vec::new();

        for _ in 0..n_comments {
            let comment_len = reader.read_u32()?;

            if u64::from(comment_len) > reader.bytes_available() {
                return decode_error("flac: comment length exceeds the block");
            }

            comments.push(reader.read_boxed_slice_exact(comment_len as usize)?.into_vec());
        }

        Ok(VorbisComment { vendor, comments })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&(self.vendor.len() as u32).to_le_bytes())?;
        writer.write_all(&self.vendor)?;
        writer.write_all(&(self.comments.len() as u32).to_le_bytes())?;

        for comment in &self.comments {
            writer.write_all(&(comment.len() as u32).to_le_bytes())?;
            writer.write_all(comment)?;
        }

        Ok(())
    }

    pub fn len(&self) -> u32 {
        let comments: usize = self.comments.iter().map(|c| 4 + c.len()).sum();
        (4 + self.vendor.len() + 4 + comments) as u32
    }
}

/// One index point within a cuesheet track.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CueSheetTrackIndex {
    /// The offset of the index point in samples, relative to the track offset.
    pub offset: u64,
    pub number: u8,
}

/// One track of a cuesheet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CueSheetTrack {
    /// The offset of the first index point of the track, in samples from the start of the
    /// stream.
    pub offset: u64,
    pub number: u8,
    /// International Standard Recording Code, 12 ASCII digits, or zeros if absent.
    pub isrc: [u8; 12],
    pub is_audio: bool,
    pub pre_emphasis: bool,
    pub indices: Vec<CueSheetTrackIndex>,
}

/// A CUESHEET block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CueSheet {
    /// Media catalog number, 128 printable ASCII characters, NUL padded.
    pub media_catalog_number: [u8; 128],
    /// The number of lead-in samples, meaningful for CD-DA cuesheets only.
    pub lead_in: u64,
    /// True if the cuesheet corresponds to a Compact Disc.
    pub is_cd: bool,
    pub tracks: Vec<CueSheetTrack>,
}

fn is_printable_ascii(bytes: &[u8]) -> bool {
    // A NUL terminates the meaningful prefix; anything after is padding.
    for byte in bytes {
        match byte {
            0x00 => break,
            0x20..=0x7e => (),
            _ => return false,
        }
    }

    true
}

impl CueSheet {
    pub fn read<B: ReadBytes>(reader: &mut B) -> Result<CueSheet> {
        let mut media_catalog_number = [0u8; 128];
        reader.read_buf_exact(&mut media_catalog_number)?;

        if !is_printable_ascii(&media_catalog_number) {
            return decode_error("flac: cuesheet catalog number contains invalid characters");
        }

        let lead_in = reader.read_be_u64()?;

        let flags = reader.read_u8()?;
        let is_cd = flags & 0x80 == 0x80;

        if flags & 0x7f != 0 {
            return decode_error("flac: cuesheet reserved bits should be zero");
        }

        // Lead-in is meaningful only for CD-DA cuesheets.
        if !is_cd && lead_in > 0 {
            return decode_error("flac: cuesheet lead-in samples should be zero if not CD-DA");
        }

        // The next 258 bytes are reserved.
        for _ in 0..129 {
            if reader.read_be_u16()? != 0 {
                return decode_error("flac: cuesheet reserved bits should be zero");
            }
        }

        let n_tracks = reader.read_u8()?;

        if n_tracks == 0 {
            return decode_error("flac: cuesheet must have at-least one track");
        }

        // CD-DA allows 99 audio tracks plus the lead-out track.
        if is_cd && n_tracks > 100 {
            return decode_error("flac: cuesheets for CD-DA must not have more than 100 tracks");
        }

        let mut tracks = Vec::with_capacity(usize::from(n_tracks));

        for _ in 0..n_tracks {
            tracks.push(CueSheet::read_track(reader, is_cd)?);
        }

        Ok(CueSheet { media_catalog_number, lead_in, is_cd, tracks })
    }

    fn read_track<B: ReadBytes>(reader: &mut B, is_cd: bool) -> Result<CueSheetTrack> {
        let offset = reader.read_be_u64()?;

        // CD-DA track offsets must align to a CD frame, 1/75th of a second.
        if is_cd && offset % 588 != 0 {
            return decode_error("flac: cuesheet track offset is not a multiple of 588 for CD-DA");
        }

        let number = reader.read_u8()?;

        if number == 0 {
            return decode_error("flac: cuesheet track number of 0 not allowed");
        }

        if is_cd && number > 99 && number != 170 {
            return decode_error(
                "flac: cuesheet track numbers greater than 99 are not allowed for CD-DA",
            );
        }

        let mut isrc = [0u8; 12];
        reader.read_buf_exact(&mut isrc)?;

        if !is_printable_ascii(&isrc) {
            return decode_error("flac: cuesheet track ISRC contains invalid characters");
        }

        // Two flag bits head 14 reserved bytes.
        let flags = reader.read_be_u16()?;

        let is_audio = flags & 0x8000 == 0x0000;
        let pre_emphasis = flags & 0x4000 == 0x4000;

        if flags & 0x3fff != 0 {
            return decode_error("flac: cuesheet track reserved bits should be zero");
        }

        for _ in 0..3 {
            if reader.read_be_u32()? != 0 {
                return decode_error("flac: cuesheet track reserved bits should be zero");
            }
        }

        let n_indices = reader.read_u8()?;

        if is_cd && n_indices > 100 {
            return decode_error("flac: cuesheet track indices cannot exceed 100 for CD-DA");
        }

        let mut indices = Vec::with_capacity(usize::from(n_indices));

        for _ in 0..n_indices {
            let offset = reader.read_be_u64()?;

            if is_cd && offset % 588 != 0 {
                return decode_error(
                    "flac: cuesheet index offset is not a multiple of 588 for CD-DA",
                );
            }

            let number = reader.read_u8()?;

            for _ in 0..3 {
                if reader.read_u8()? != 0 {
                    return decode_error("flac: cuesheet index reserved bits should be zero");
                }
            }

            indices.push(CueSheetTrackIndex { offset, number });
        }

        Ok(CueSheetTrack { offset, number, isrc, is_audio, pre_emphasis, indices })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.media_catalog_number)?;
        writer.write_all(&self.lead_in.to_be_bytes())?;
        writer.write_all(&[if self.is_cd { 0x80 } else { 0x00 }])?;
        writer.write_all(&[0u8; 258])?;
        writer.write_all(&[self.tracks.len() as u8])?;

        for track in &self.tracks {
            writer.write_all(&track.offset.to_be_bytes())?;
            writer.write_all(&[track.number])?;
            writer.write_all(&track.isrc)?;

            let mut flags = 0u16;
            if !track.is_audio {
                flags |= 0x8000;
            }
            if track.pre_emphasis {
                flags |= 0x4000;
            }

            writer.write_all(&flags.to_be_bytes())?;
            writer.write_all(&[0u8; 12])?;
            writer.write_all(&[track.indices.len() as u8])?;

            for index in &track.indices {
                writer.write_all(&index.offset.to_be_bytes())?;
                writer.write_all(&[index.number, 0, 0, 0])?;
            }
        }

        Ok(())
    }

    pub fn len(&self) -> u32 {
        let tracks: u32 = self.tracks.iter().map(|t| 36 + 12 * t.indices.len() as u32).sum();
        396 + tracks
    }
}

/// A metadata block of an unrecognised or unmodelled type, carried byte-exact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unknown {
    pub block_type: u8,
    pub data: Box<[u8]>,
}

/// The typed body of a metadata block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataBlockData {
    StreamInfo(StreamInfo),
    Padding(Padding),
    Application(Application),
    SeekTable(SeekTable),
    VorbisComment(VorbisComment),
    CueSheet(CueSheet),
    Unknown(Unknown),
}

impl MetadataBlockData {
    pub fn block_type(&self) -> MetadataType {
        match self {
            MetadataBlockData::StreamInfo(_) => MetadataType::StreamInfo,
            MetadataBlockData::Padding(_) => MetadataType::Padding,
            MetadataBlockData::Application(_) => MetadataType::Application,
            MetadataBlockData::SeekTable(_) => MetadataType::SeekTable,
            MetadataBlockData::VorbisComment(_) => MetadataType::VorbisComment,
            MetadataBlockData::CueSheet(_) => MetadataType::CueSheet,
            MetadataBlockData::Unknown(unknown) => MetadataType::Unknown(unknown.block_type),
        }
    }

    /// The serialised byte length of the block body. Always computed from the body; a stored
    /// length is never trusted.
    pub fn len(&self) -> u32 {
        match self {
            MetadataBlockData::StreamInfo(_) => StreamInfo::LEN,
            MetadataBlockData::Padding(padding) => padding.length,
            MetadataBlockData::Application(app) => 4 + app.data.len() as u32,
            MetadataBlockData::SeekTable(table) => table.len(),
            MetadataBlockData::VorbisComment(comment) => comment.len(),
            MetadataBlockData::CueSheet(cuesheet) => cuesheet.len(),
            MetadataBlockData::Unknown(unknown) => unknown.data.len() as u32,
        }
    }

    /// Read a block body of the given type and length.
    pub fn read<B: ReadBytes + FiniteStream>(
        reader: &mut B,
        block_type: MetadataType,
        block_len: u32,
    ) -> Result<MetadataBlockData> {
        let data = match block_type {
            MetadataType::StreamInfo => {
                if block_len != StreamInfo::LEN {
                    return decode_error("flac: invalid stream info block size");
                }
                MetadataBlockData::StreamInfo(StreamInfo::read(reader)?)
            }
            MetadataType::Padding => MetadataBlockData::Padding(Padding::read(reader, block_len)?),
            MetadataType::Application => {
                MetadataBlockData::Application(Application::read(reader, block_len)?)
            }
            MetadataType::SeekTable => {
                MetadataBlockData::SeekTable(SeekTable::read(reader, block_len)?)
            }
            MetadataType::VorbisComment => {
                MetadataBlockData::VorbisComment(VorbisComment::read(reader)?)
            }
            MetadataType::CueSheet => MetadataBlockData::CueSheet(CueSheet::read(reader)?),
            MetadataType::Unknown(code) => MetadataBlockData::Unknown(Unknown {
                block_type: code,
                data: reader.read_boxed_slice_exact(block_len as usize)?,
            }),
        };

        Ok(data)
    }

    /// Serialise the block body.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            MetadataBlockData::StreamInfo(info) => info.write_to(writer),
            MetadataBlockData::Padding(padding) => padding.write_to(writer),
            MetadataBlockData::Application(app) => app.write_to(writer),
            MetadataBlockData::SeekTable(table) => table.write_to(writer),
            MetadataBlockData::VorbisComment(comment) => comment.write_to(writer),
            MetadataBlockData::CueSheet(cuesheet) => cuesheet.write_to(writer),
            MetadataBlockData::Unknown(unknown) => writer.write_all(&unknown.data),
        }
    }
}

/// A complete metadata block: the last-block flag and the typed body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataBlock {
    pub is_last: bool,
    pub data: MetadataBlockData,
}

impl MetadataBlock {
    pub fn new(data: MetadataBlockData) -> MetadataBlock {
        MetadataBlock { is_last: false, data }
    }

    /// Read one complete metadata block, header and body. Bytes of the body beyond what its
    /// parser consumes are skipped.
    pub fn read<B: ReadBytes>(reader: &mut B) -> Result<MetadataBlock> {
        let header = MetadataBlockHeader::read(reader)?;

        let mut body = ScopedStream::new(reader, u64::from(header.block_len));

        let data = MetadataBlockData::read(&mut body, header.block_type, header.block_len)?;

        body.ignore()?;

        Ok(MetadataBlock { is_last: header.is_last, data })
    }

    /// Serialise the block, header and body. The header's length field is derived from the
    /// body.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let header = MetadataBlockHeader {
            is_last: self.is_last,
            block_type: self.data.block_type(),
            block_len: self.data.len(),
        };

        header.write_to(writer)?;
        self.data.write_to(writer)
    }

    /// The total serialised size of the block, header included.
    pub fn total_len(&self) -> u32 {
        MetadataBlockHeader::LEN + self.data.len()
    }
}

/// Builds the temporary file path used for whole-file rewrites: the original path with a
/// process-unique suffix, in the same directory so the final rename stays on one filesystem.
pub(crate) fn temp_file_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(".tmp,FL,a,{}", std::process::id()));
    std::path::PathBuf::from(os)
}

/// Copies exactly `len` bytes between two streams.
pub(crate) fn copy_len<R: io::Read, W: Write>(src: &mut R, dst: &mut W, len: u64) -> io::Result<()> {
    let copied = io::copy(&mut src.by_ref().take(len), dst)?;

    if copied != len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "source ended mid-copy"));
    }

    Ok(())
}

/// Consumes the stream marker at the start of a FLAC file, skipping over an ID3v2 tag if one
/// precedes it.
pub(crate) fn read_stream_marker<B: ReadBytes>(reader: &mut B) -> Result<()> {
    let mut marker = reader.read_quad_bytes()?;

    if marker[..3] == *b"ID3" {
        // Four bytes consumed so far: the tag identifier plus the major version. The remainder
        // of the ID3v2 header is the minor version, flags, and a 28-bit synch-safe length.
        let _minor = reader.read_u8()?;
        let _flags = reader.read_u8()?;

        let size = reader.read_quad_bytes()?;

        if size.iter().any(|b| b & 0x80 != 0) {
            return decode_error("flac: invalid id3v2 tag length");
        }

        let tag_len = (u64::from(size[0]) << 21)
            | (u64::from(size[1]) << 14)
            | (u64::from(size[2]) << 7)
            | u64::from(size[3]);

        reader.ignore_bytes(tag_len)?;

        marker = reader.read_quad_bytes()?;
    }

    if marker != STREAM_MARKER {
        return decode_error("flac: missing flac stream marker");
    }

    Ok(())
}

/// Reads the STREAMINFO block of a FLAC file, without touching any other metadata. This is the
/// cheapest way to interrogate a file's stream parameters.
pub fn read_stream_info<P: AsRef<Path>>(path: P) -> std::result::Result<StreamInfo, EditorError> {
    let file = std::fs::File::open(path).map_err(EditorError::Read)?;

    let mut reader = MediaSourceStream::new(Box::new(file));

    read_stream_marker(&mut reader).map_err(|_| EditorError::NotAFlacFile)?;

    let header = MetadataBlockHeader::read(&mut reader)?;

    // The stream information block is mandatory and always first.
    if header.block_type != MetadataType::StreamInfo || header.block_len != StreamInfo::LEN {
        return Err(EditorError::BadMetadata("first block is not a stream info block"));
    }

    Ok(StreamInfo::read(&mut reader)?)
}
