//! End-to-end encode/decode round trips, resynchronisation, and seeking.

mod common;

use std::io::Cursor;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use cantata_core::audio::AudioBuffer;
use cantata_core::checksum::Md5;
use cantata_core::io::{Monitor, ReadOnlySource};

use cantata_flac::metadata::{MetadataBlockData, SeekTable};
use cantata_flac::{
    DecodeStatus, DecoderObserver, DecoderOptions, EncoderOptions, FileDecoder, FrameInfo,
    MetadataBlock, Reaction, StreamDecoder,
};

use common::{assert_lossless, decode_from_vec, encode_to_vec, CaptureObserver};

fn stereo_opts() -> EncoderOptions {
    EncoderOptions { channels: 2, ..Default::default() }
}

fn mono_opts() -> EncoderOptions {
    EncoderOptions { channels: 1, do_mid_side: false, ..Default::default() }
}

#[test]
fn silence_roundtrip() {
    // One second of 2-channel 16-bit 44.1 kHz silence.
    let channels = vec![vec![0i32; 88_200], vec![0i32; 88_200]];

    let (bytes, info) = encode_to_vec(stereo_opts(), &channels, Vec::new());

    assert_eq!(info.total_samples, 88_200);

    // The stored signature must equal the MD5 of the equivalent packed PCM: 176400 zero bytes.
    let mut md5 = Md5::default();
    md5.process_buf_bytes(&vec![0u8; 2 * 2 * 88_200]);
    assert_eq!(info.md5, md5.md5());

    // All-constant subframes compress enormously.
    assert!(bytes.len() < 4_096 + 1_024, "silence encoded to {} bytes", bytes.len());

    assert_lossless(&bytes, &channels);
}

#[test]
fn constant_offset_stereo_roundtrip() {
    // A constant offset pair: +1 on channel 0, -1 on channel 1.
    let channels = vec![vec![1i32; 4096], vec![-1i32; 4096]];

    let (bytes, info) = encode_to_vec(stereo_opts(), &channels, Vec::new());

    assert_eq!(info.total_samples, 4096);
    assert_lossless(&bytes, &channels);
}

#[test]
fn ramp_fixed_predictor_roundtrip() {
    // A linear ramp: an order-1 fixed predictor leaves an all-zero residual past warm-up, so
    // the frame cost collapses to nearly the header alone.
    let channels = vec![(0..4096).collect::<Vec<i32>>()];

    let (bytes, info) = encode_to_vec(mono_opts(), &channels, Vec::new());

    // 4096 16-bit samples are 8192 bytes raw; a zero residual Rice-codes at one bit per sample,
    // so the whole frame lands near 512 bytes.
    assert!(info.max_frame_size < 600, "ramp frame took {} bytes", info.max_frame_size);

    assert_lossless(&bytes, &channels);
}

#[test]
fn sine_lpc_roundtrip() {
    let left: Vec<i32> =
        (0..20_000).map(|i| (9000.0 * (i as f64 * 0.013).sin()) as i32).collect();
    let right: Vec<i32> =
        (0..20_000).map(|i| (7000.0 * (i as f64 * 0.013 + 0.5).sin()) as i32).collect();

    let channels = vec![left, right];

    let (bytes, _) = encode_to_vec(stereo_opts(), &channels, Vec::new());
    assert_lossless(&bytes, &channels);

    // The same material under an exhaustive search must still round-trip (and not grow).
    let exhaustive = EncoderOptions {
        do_exhaustive_model_search: true,
        do_qlp_coeff_precision_search: true,
        max_lpc_order: 12,
        ..stereo_opts()
    };

    let (exhaustive_bytes, _) = encode_to_vec(exhaustive, &channels, Vec::new());
    assert_lossless(&exhaustive_bytes, &channels);
}

fn noise(rng: &mut SmallRng, len: usize, bps: u32) -> Vec<i32> {
    let max = (1i64 << (bps - 1)) - 1;
    let min = -(1i64 << (bps - 1));

    (0..len).map(|_| rng.gen_range(min..=max) as i32).collect()
}

#[test]
fn noise_roundtrip_bit_depths() {
    let mut rng = SmallRng::seed_from_u64(0x5eed);

    for bps in [8u32, 12, 16, 20, 24] {
        let channels = vec![noise(&mut rng, 10_000, bps), noise(&mut rng, 10_000, bps)];

        let opts = EncoderOptions { bits_per_sample: bps, ..stereo_opts() };

        let (bytes, info) = encode_to_vec(opts, &channels, Vec::new());

        assert_eq!(info.total_samples, 10_000);
        assert_lossless(&bytes, &channels);
    }
}

#[test]
fn noise_roundtrip_non_subset_widths() {
    let mut rng = SmallRng::seed_from_u64(0xfeed);

    // 17 and 32 bits per sample are legal but outside the streamable subset. At 32 bits the
    // difference channel would need 33 bits, so stereo decorrelation is disqualified.
    for bps in [17u32, 32] {
        let channels = vec![noise(&mut rng, 9_001, bps), noise(&mut rng, 9_001, bps)];

        let opts = EncoderOptions {
            bits_per_sample: bps,
            streamable_subset: false,
            ..stereo_opts()
        };

        let (bytes, _) = encode_to_vec(opts, &channels, Vec::new());
        assert_lossless(&bytes, &channels);
    }
}

#[test]
fn eight_channel_roundtrip() {
    let mut rng = SmallRng::seed_from_u64(7);

    let channels: Vec<Vec<i32>> = (0..8).map(|_| noise(&mut rng, 5_000, 16)).collect();

    let opts = EncoderOptions { channels: 8, do_mid_side: false, ..Default::default() };

    let (bytes, _) = encode_to_vec(opts, &channels, Vec::new());
    assert_lossless(&bytes, &channels);
}

#[test]
fn partial_final_frame_roundtrip() {
    // 2.5 blocks: the final frame is short and explicitly sized.
    let channels = vec![(0..10_240).map(|i| (i % 321) - 160).collect::<Vec<i32>>()];

    let (bytes, info) = encode_to_vec(mono_opts(), &channels, Vec::new());

    assert_eq!(info.total_samples, 10_240);
    assert_lossless(&bytes, &channels);
}

#[test]
fn small_block_size_roundtrip() {
    let mut rng = SmallRng::seed_from_u64(99);

    let channels = vec![noise(&mut rng, 1_000, 16)];

    let opts = EncoderOptions { block_size: 192, ..mono_opts() };

    let (bytes, _) = encode_to_vec(opts, &channels, Vec::new());
    assert_lossless(&bytes, &channels);
}

#[test]
fn decode_from_unseekable_source() {
    let channels = vec![vec![3i32; 9_999], vec![-7i32; 9_999]];

    let (bytes, _) = encode_to_vec(stereo_opts(), &channels, Vec::new());

    // A pure streaming source: no length, no seeking.
    let source = ReadOnlySource::new(Cursor::new(bytes));

    let mut decoder = StreamDecoder::new(Box::new(source), DecoderOptions::default());
    let mut observer = CaptureObserver::new();

    decoder.process_until_end_of_stream(&mut observer).unwrap();

    assert!(decoder.finish());
    assert_eq!(observer.channels[0], channels[0]);
    assert_eq!(observer.channels[1], channels[1]);
}

#[test]
fn resync_after_corruption() {
    let mut rng = SmallRng::seed_from_u64(0xbad);

    // Noise keeps every frame large, so a corruption early in the audio area is guaranteed to
    // land in the first frame's residual rather than in a header.
    let channels = vec![noise(&mut rng, 16_384, 16), noise(&mut rng, 16_384, 16)];

    let opts = EncoderOptions { padding: None, ..stereo_opts() };

    let (mut bytes, _) = encode_to_vec(opts, &channels, Vec::new());

    // The audio area starts after the marker and the 38-byte stream information block.
    let first_frame_offset = 4 + 4 + 34;

    // Flip one bit a short distance into the first frame's payload.
    bytes[first_frame_offset + 64] ^= 0x04;

    let (observer, md5_ok) = decode_from_vec(&bytes);

    // The corrupted frame is dropped and reported; every other frame is delivered intact.
    assert!(!observer.errors.is_empty());
    assert!(observer
        .errors
        .iter()
        .any(|e| matches!(e, DecodeStatus::FrameCrcMismatch | DecodeStatus::LostSync)));

    assert_eq!(observer.channels[0], channels[0][4096..]);
    assert_eq!(observer.channels[1], channels[1][4096..]);

    // With a frame missing, the signature cannot match.
    assert!(!md5_ok);
}

/// An observer that records the first samples delivered after a seek.
struct SeekObserver {
    first: Vec<Vec<i32>>,
    first_sample: Option<u64>,
}

impl DecoderObserver for SeekObserver {
    fn on_frame(&mut self, info: &FrameInfo, buf: &AudioBuffer) -> Reaction {
        if self.first_sample.is_none() {
            self.first_sample = Some(info.first_sample);

            for ch in 0..info.channels as usize {
                self.first.push(buf.chan(ch).to_vec());
            }
        }

        Reaction::Continue
    }
}

fn seek_and_check(decoder: &mut FileDecoder, input: &[i32], target: u64) {
    let mut observer = SeekObserver { first: Vec::new(), first_sample: None };

    decoder.seek_absolute(target, &mut observer).unwrap();

    assert_eq!(observer.first_sample, Some(target), "seek to {}", target);

    // The delivered tail must line up with the input from the target onward.
    let delivered = &observer.first[0];
    let expected = &input[target as usize..(target as usize + delivered.len()).min(input.len())];

    assert_eq!(&delivered[..expected.len()], expected, "seek to {}", target);
}

#[test]
fn seek_to_sample() {
    // A 10-second 44.1 kHz mono stream of full-scale-ish noise.
    let mut rng = SmallRng::seed_from_u64(0x5eec);

    let input = noise(&mut rng, 441_000, 16);
    let channels = vec![input.clone()];

    let (bytes, _) = encode_to_vec(mono_opts(), &channels, Vec::new());

    let mut decoder =
        FileDecoder::new(Box::new(Cursor::new(bytes)), DecoderOptions::default());

    // Seek to the 5-second point; the first delivered sample must be input[220500] and the
    // following 16 samples must match.
    seek_and_check(&mut decoder, &input, 220_500);

    // Jump around: backwards, to a frame boundary, near the start, and near the end.
    seek_and_check(&mut decoder, &input, 44_100);
    seek_and_check(&mut decoder, &input, 4_096);
    seek_and_check(&mut decoder, &input, 0);
    seek_and_check(&mut decoder, &input, 440_999);

    // Past-the-end seeks fail.
    let mut observer = SeekObserver { first: Vec::new(), first_sample: None };
    assert!(decoder.seek_absolute(441_000, &mut observer).is_err());
}

#[test]
fn seek_with_seek_table() {
    let mut rng = SmallRng::seed_from_u64(0x7ab1e);

    let input = noise(&mut rng, 200_000, 16);
    let channels = vec![input.clone()];

    // A seek table template with ten spaced points; the encoder fills the offsets in.
    let mut table = SeekTable::default();
    table.template_append_spaced_points(10, 200_000);

    let opts = EncoderOptions { total_samples_estimate: 200_000, ..mono_opts() };

    let (bytes, _) = encode_to_vec(
        opts,
        &channels,
        vec![MetadataBlock::new(MetadataBlockData::SeekTable(table))],
    );

    let mut decoder =
        FileDecoder::new(Box::new(Cursor::new(bytes.clone())), DecoderOptions::default());

    seek_and_check(&mut decoder, &input, 150_001);
    seek_and_check(&mut decoder, &input, 60_000);
    seek_and_check(&mut decoder, &input, 199_999);

    // The written table must be legal: filled points ascending, placeholders (none here) last.
    let mut verify =
        StreamDecoder::new(Box::new(Cursor::new(bytes)), DecoderOptions::default());

    let mut observer = CaptureObserver::new();
    verify.metadata_filter_mut().respond_all();
    verify.process_until_end_of_metadata(&mut observer).unwrap();

    let table = observer
        .metadata
        .iter()
        .find_map(|block| match &block.data {
            MetadataBlockData::SeekTable(table) => Some(table.clone()),
            _ => None,
        })
        .expect("seek table present");

    assert!(table.is_legal());
    assert!(table.points.iter().all(|p| p.frame_samples > 0));
}

#[test]
fn decode_continues_after_seek() {
    let input: Vec<i32> = (0..50_000).map(|i| ((i * 7) % 4001) - 2000).collect();
    let channels = vec![input.clone()];

    let (bytes, _) = encode_to_vec(mono_opts(), &channels, Vec::new());

    let mut decoder =
        FileDecoder::new(Box::new(Cursor::new(bytes)), DecoderOptions::default());

    let mut observer = CaptureObserver::new();

    decoder.seek_absolute(10_000, &mut observer).unwrap();
    decoder.process_until_end_of_stream(&mut observer).unwrap();

    // Everything from the target to the end arrives in order.
    assert_eq!(observer.channels[0], input[10_000..]);

    // A seek forfeits MD5 verification, so finish reports success.
    assert!(decoder.finish());
}
