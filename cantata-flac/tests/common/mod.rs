#![allow(dead_code)]

use std::io::Cursor;

use cantata_core::audio::AudioBuffer;
use cantata_flac::metadata::StreamInfo;
use cantata_flac::{
    DecodeStatus, DecoderObserver, DecoderOptions, EncoderOptions, FrameInfo, MetadataBlock,
    Reaction, StreamDecoder, StreamEncoder,
};

/// An observer that captures everything the decoder produces.
pub struct CaptureObserver {
    pub channels: Vec<Vec<i32>>,
    pub metadata: Vec<MetadataBlock>,
    pub errors: Vec<DecodeStatus>,
}

impl CaptureObserver {
    pub fn new() -> CaptureObserver {
        CaptureObserver { channels: Vec::new(), metadata: Vec::new(), errors: Vec::new() }
    }
}

impl DecoderObserver for CaptureObserver {
    fn on_metadata(&mut self, block: &MetadataBlock) -> Reaction {
        self.metadata.push(block.clone());
        Reaction::Continue
    }

    fn on_frame(&mut self, info: &FrameInfo, buf: &AudioBuffer) -> Reaction {
        if self.channels.len() < info.channels as usize {
            self.channels.resize(info.channels as usize, Vec::new());
        }

        for ch in 0..info.channels as usize {
            self.channels[ch].extend_from_slice(buf.chan(ch));
        }

        Reaction::Continue
    }

    fn on_error(&mut self, status: DecodeStatus) -> Reaction {
        self.errors.push(status);
        Reaction::Continue
    }
}

/// Encodes planar channels into an in-memory FLAC stream.
pub fn encode_to_vec(
    opts: EncoderOptions,
    channels: &[Vec<i32>],
    extra_metadata: Vec<MetadataBlock>,
) -> (Vec<u8>, StreamInfo) {
    let refs: Vec<&[i32]> = channels.iter().map(|c| c.as_slice()).collect();

    let mut encoder = StreamEncoder::new(Cursor::new(Vec::new()), opts, extra_metadata).unwrap();

    encoder.process(&refs).unwrap();

    let (info, sink) = encoder.finish().unwrap();

    (sink.into_inner(), info)
}

/// Decodes an in-memory FLAC stream, returning everything captured along the way and the MD5
/// verification verdict.
pub fn decode_from_vec(bytes: &[u8]) -> (CaptureObserver, bool) {
    let mut decoder =
        StreamDecoder::new(Box::new(Cursor::new(bytes.to_vec())), DecoderOptions::default());

    let mut observer = CaptureObserver::new();

    decoder.process_until_end_of_stream(&mut observer).unwrap();

    let md5_ok = decoder.finish();

    (observer, md5_ok)
}

/// Asserts that the decode of `bytes` reproduces `channels` exactly with a valid signature.
pub fn assert_lossless(bytes: &[u8], channels: &[Vec<i32>]) {
    let (observer, md5_ok) = decode_from_vec(bytes);

    assert!(observer.errors.is_empty(), "unexpected decode errors: {:?}", observer.errors);
    assert!(md5_ok, "md5 verification failed");

    assert_eq!(observer.channels.len(), channels.len());

    for (decoded, original) in observer.channels.iter().zip(channels) {
        assert_eq!(decoded, original);
    }
}
