//! Metadata editing against real encoded files: the read-only tier, the single-file iterator,
//! and the in-memory chain.

mod common;

use std::fs;
use std::path::PathBuf;

use cantata_flac::metadata::{
    read_stream_info, Application, Chain, EditorError, MetadataBlockData, MetadataType, Padding,
    SimpleEditor, VorbisComment,
};
use cantata_flac::{DecoderOptions, EncoderOptions, FileDecoder, MetadataBlock};

use common::{encode_to_vec, CaptureObserver};

/// Encodes a short stream into a file within the given directory.
fn encode_test_file(dir: &tempfile::TempDir, padding: Option<u32>) -> (PathBuf, Vec<Vec<i32>>) {
    let channels: Vec<Vec<i32>> = vec![
        (0..30_000).map(|i| ((i * 13) % 2000) - 1000).collect(),
        (0..30_000).map(|i| ((i * 7) % 1500) - 750).collect(),
    ];

    let opts = EncoderOptions { padding, ..Default::default() };

    let (bytes, _) = encode_to_vec(opts, &channels, Vec::new());

    let path = dir.path().join("test.flac");
    fs::write(&path, bytes).unwrap();

    (path, channels)
}

/// Fully decodes a file and asserts it reproduces the original channels with a good signature.
fn assert_file_decodes(path: &PathBuf, channels: &[Vec<i32>]) {
    let mut decoder = FileDecoder::open(path, DecoderOptions::default()).unwrap();
    let mut observer = CaptureObserver::new();

    decoder.process_until_end_of_stream(&mut observer).unwrap();

    assert!(decoder.finish());
    assert!(observer.errors.is_empty());

    for (decoded, original) in observer.channels.iter().zip(channels) {
        assert_eq!(decoded, original);
    }
}

#[test]
fn level0_read_stream_info() {
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = encode_test_file(&dir, Some(1024));

    let info = read_stream_info(&path).unwrap();

    assert_eq!(info.sample_rate, 44_100);
    assert_eq!(info.channels, 2);
    assert_eq!(info.bits_per_sample, 16);
    assert_eq!(info.total_samples, 30_000);
    assert!(info.has_md5());

    // A non-FLAC file is rejected as such.
    let bogus = dir.path().join("bogus.bin");
    fs::write(&bogus, b"RIFF----WAVE").unwrap();

    assert!(matches!(read_stream_info(&bogus), Err(EditorError::NotAFlacFile)));
}

#[test]
fn chain_rewrite_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = encode_test_file(&dir, Some(1024));

    let before = fs::read(&path).unwrap();

    let mut chain = Chain::read(&path).unwrap();
    chain.write(true, false).unwrap();

    // No edits, no consolidation: bit-exact.
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn chain_vorbis_comment_insert() {
    let dir = tempfile::tempdir().unwrap();
    let (path, channels) = encode_test_file(&dir, Some(1024));

    let size_before = fs::metadata(&path).unwrap().len();

    let mut chain = Chain::read(&path).unwrap();

    let comment = VorbisComment {
        vendor: b"cantata test".to_vec(),
        comments: vec![b"TITLE=Chained".to_vec(), b"ALBUM=Editing".to_vec()],
    };

    // Insert after STREAMINFO so the trailing padding can absorb the growth.
    chain
        .blocks_mut()
        .insert(1, MetadataBlock::new(MetadataBlockData::VorbisComment(comment.clone())));

    chain.write(true, false).unwrap();

    // Absorbed by padding: the file size and the audio offsets are unchanged.
    assert_eq!(fs::metadata(&path).unwrap().len(), size_before);

    let chain = Chain::read(&path).unwrap();

    match &chain.blocks()[1].data {
        MetadataBlockData::VorbisComment(read) => assert_eq!(read, &comment),
        other => panic!("expected vorbis comment, found {:?}", other.block_type()),
    }

    // The audio must still decode losslessly.
    assert_file_decodes(&path, &channels);
}

#[test]
fn chain_sort_padding_consolidates() {
    let dir = tempfile::tempdir().unwrap();
    let (path, channels) = encode_test_file(&dir, Some(512));

    // Fragment the metadata: insert padding between two application blocks.
    let mut chain = Chain::read(&path).unwrap();

    chain.blocks_mut().insert(
        1,
        MetadataBlock::new(MetadataBlockData::Padding(Padding { length: 64 })),
    );
    chain.blocks_mut().insert(
        2,
        MetadataBlock::new(MetadataBlockData::Application(Application {
            id: *b"Cnta",
            data: vec![1; 32].into_boxed_slice(),
        })),
    );

    chain.write(false, false).unwrap();

    // Now consolidate: all padding must collapse to a single trailing block, with nothing else
    // disturbed and the serialised size unchanged.
    let mut chain = Chain::read(&path).unwrap();

    let total_padding: u32 = chain
        .blocks()
        .iter()
        .filter_map(|b| match &b.data {
            MetadataBlockData::Padding(p) => Some(p.length + 4),
            _ => None,
        })
        .sum();

    chain.sort_padding();
    chain.write(true, false).unwrap();

    let chain = Chain::read(&path).unwrap();

    let paddings: Vec<_> = chain
        .blocks()
        .iter()
        .enumerate()
        .filter(|(_, b)| matches!(b.data, MetadataBlockData::Padding(_)))
        .collect();

    assert_eq!(paddings.len(), 1);
    assert_eq!(paddings[0].0, chain.blocks().len() - 1);

    match &chain.blocks().last().unwrap().data {
        MetadataBlockData::Padding(p) => assert_eq!(p.length + 4, total_padding),
        _ => unreachable!(),
    }

    assert_file_decodes(&path, &channels);
}

#[test]
fn simple_editor_padding_absorb_scenario() {
    let dir = tempfile::tempdir().unwrap();

    // A file with a 1000-byte padding block.
    let (path, channels) = encode_test_file(&dir, Some(1000));

    let size_before = fs::metadata(&path).unwrap().len();

    let mut editor = SimpleEditor::open(&path, false, false).unwrap();

    // Overwrite STREAMINFO with itself (same length).
    let info_block = editor.get_block().unwrap();
    editor.set_block(&info_block, true).unwrap();

    // Insert a 200-byte application block with padding absorption.
    let app = MetadataBlock::new(MetadataBlockData::Application(Application {
        id: *b"Cnta",
        data: vec![0xa5; 196].into_boxed_slice(),
    }));

    editor.insert_block_after(&app, true).unwrap();

    // In-place: the file size is unchanged and the padding shrank to 796 bytes
    // (1000 - 200 - 4).
    assert_eq!(fs::metadata(&path).unwrap().len(), size_before);

    assert!(editor.next().unwrap());
    assert_eq!(editor.block_type(), MetadataType::Padding);
    assert_eq!(editor.block_length(), 796);

    assert_file_decodes(&path, &channels);
}

#[test]
fn simple_editor_rewrite_preserves_audio() {
    let dir = tempfile::tempdir().unwrap();

    // No padding at all: any insert must rewrite the file.
    let (path, channels) = encode_test_file(&dir, None);

    let size_before = fs::metadata(&path).unwrap().len();

    let mut editor = SimpleEditor::open(&path, false, false).unwrap();

    let app = MetadataBlock::new(MetadataBlockData::Application(Application {
        id: *b"Cnta",
        data: vec![0x11; 60].into_boxed_slice(),
    }));

    editor.insert_block_after(&app, true).unwrap();

    assert_eq!(fs::metadata(&path).unwrap().len(), size_before + 64);
    assert_eq!(editor.block_type(), MetadataType::Application);

    // The rewritten file must decode bit-exact.
    assert_file_decodes(&path, &channels);
}

#[test]
fn simple_editor_read_only_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = encode_test_file(&dir, Some(256));

    let mut editor = SimpleEditor::open(&path, true, false).unwrap();
    let block = editor.get_block().unwrap();

    assert!(matches!(editor.set_block(&block, true), Err(EditorError::NotWritable)));
}

#[test]
fn zeroed_md5_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let (path, channels) = encode_test_file(&dir, Some(64));

    // Blank out the signature through the level-1 editor.
    let mut editor = SimpleEditor::open(&path, false, false).unwrap();
    let mut block = editor.get_block().unwrap();

    match &mut block.data {
        MetadataBlockData::StreamInfo(info) => info.md5 = [0; 16],
        _ => unreachable!(),
    }

    editor.set_block(&block, true).unwrap();
    drop(editor);

    // An absent signature decodes as valid.
    assert_file_decodes(&path, &channels);
}
