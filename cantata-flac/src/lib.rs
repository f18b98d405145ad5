// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A pure Rust FLAC stream encoder, stream decoder, and metadata editor.
//!
//! The codec engine is bit-exact: for every supported input, decoding an encoded stream
//! reproduces the original integer PCM sample-for-sample, and every emitted frame satisfies the
//! format's CRC and MD5 integrity checks.
//!
//! Three entry points cover the common tasks:
//!
//!  * [`encoder::StreamEncoder`] encodes planar PCM into a FLAC stream written to a
//!    [`cantata_core::io::MediaSink`].
//!  * [`decoder::StreamDecoder`] and [`file::FileDecoder`] decode a stream from a
//!    [`cantata_core::io::MediaSource`], the latter adding sample-accurate seeking.
//!  * [`metadata`] models metadata blocks and provides the three editing tiers, from the
//!    read-only [`metadata::read_stream_info`] up to the in-memory [`metadata::Chain`].

pub mod decoder;
pub mod encoder;
pub mod file;
pub mod format;
pub mod metadata;

mod fixed;
mod frame;
mod lpc;
mod subframe;
mod validate;

pub use subframe::PartitionSearch;

pub use decoder::{
    DecodeStatus, DecoderObserver, DecoderOptions, DecoderState, FrameInfo, MetadataFilter,
    Reaction, StreamDecoder,
};
pub use encoder::{EncoderError, EncoderOptions, EncoderResult, StreamEncoder};
pub use file::FileDecoder;
pub use metadata::{Chain, EditorError, MetadataBlock, MetadataBlockData, SimpleEditor};
