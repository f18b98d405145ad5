// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The level-1 metadata editor: a forward iterator over the blocks of a single file, editing in
//! place where the block sizes (and any neighbouring padding) allow, and falling back to a
//! whole-file rewrite otherwise.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cantata_core::io::BufReader;

use log::debug;

use super::{
    copy_len, temp_file_path, EditorError, MetadataBlock, MetadataBlockData, MetadataBlockHeader,
    MetadataType, Padding,
};
use crate::format::STREAM_MARKER;

type EditorResult<T> = std::result::Result<T, EditorError>;

/// A single-file metadata block iterator with in-place editing.
///
/// The iterator holds the file open and tracks the position of the current block. Edits that do
/// not change the metadata layout (or that can be absorbed by neighbouring PADDING with
/// `use_padding`) are performed in place; any other edit rewrites the file through a temporary
/// and renames it over the original.
pub struct SimpleEditor {
    file: fs::File,
    path: PathBuf,
    read_only: bool,
    preserve_stats: bool,
    /// The byte offset of the first block header.
    first_block_offset: u64,
    /// The byte offset of the current block header.
    offset: u64,
    /// The parsed header of the current block.
    header: MetadataBlockHeader,
}

impl SimpleEditor {
    /// Opens a FLAC file and positions the iterator at its first metadata block (always the
    /// STREAMINFO block).
    pub fn open<P: AsRef<Path>>(
        path: P,
        read_only: bool,
        preserve_stats: bool,
    ) -> EditorResult<SimpleEditor> {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::PermissionDenied && !read_only {
                    EditorError::NotWritable
                }
                else {
                    EditorError::Read(err)
                }
            })?;

        let first_block_offset = skip_to_first_block(&mut file)?;

        let header = read_header_at(&mut file, first_block_offset)?;

        if header.block_type != MetadataType::StreamInfo {
            return Err(EditorError::BadMetadata("first metadata block is not stream info"));
        }

        Ok(SimpleEditor {
            file,
            path: path.as_ref().to_path_buf(),
            read_only,
            preserve_stats,
            first_block_offset,
            offset: first_block_offset,
            header,
        })
    }

    /// The type of the current block.
    pub fn block_type(&self) -> MetadataType {
        self.header.block_type
    }

    /// The body length of the current block.
    pub fn block_length(&self) -> u32 {
        self.header.block_len
    }

    /// Returns true if the current block is the last metadata block.
    pub fn is_last(&self) -> bool {
        self.header.is_last
    }

    /// Advances to the next block. Returns false, without moving, when the current block is the
    /// last.
    pub fn next(&mut self) -> EditorResult<bool> {
        if self.header.is_last {
            return Ok(false);
        }

        let offset = self.block_end();

        self.header = read_header_at(&mut self.file, offset)?;
        self.offset = offset;

        Ok(true)
    }

    /// Moves to the previous block by walking forward from the first block. Returns false,
    /// without moving, when the current block is the first.
    pub fn prev(&mut self) -> EditorResult<bool> {
        if self.offset == self.first_block_offset {
            return Ok(false);
        }

        let mut offset = self.first_block_offset;

        loop {
            let header = read_header_at(&mut self.file, offset)?;
            let end = offset + u64::from(MetadataBlockHeader::LEN) + u64::from(header.block_len);

            if end == self.offset {
                self.header = header;
                self.offset = offset;
                return Ok(true);
            }

            if header.is_last || end > self.offset {
                return Err(EditorError::BadMetadata("block chain does not reach current block"));
            }

            offset = end;
        }
    }

    /// Parses and returns a copy of the current block. The returned block is owned by the
    /// caller.
    pub fn get_block(&mut self) -> EditorResult<MetadataBlock> {
        self.file.seek(SeekFrom::Start(self.offset)).map_err(EditorError::Seek)?;

        let len = u64::from(MetadataBlockHeader::LEN) + u64::from(self.header.block_len);

        let mut bytes = vec![0u8; len as usize];
        self.file.read_exact(&mut bytes).map_err(EditorError::Read)?;

        Ok(MetadataBlock::read(&mut BufReader::new(&bytes))?)
    }

    /// Replaces the current block.
    ///
    /// A same-size replacement (or STREAMINFO over STREAMINFO) is written in place. A smaller
    /// replacement pads out the slack with a new PADDING block when `use_padding` is set and at
    /// least one block header fits, and a larger replacement consumes an immediately following
    /// PADDING block when possible. Every other case rewrites the file.
    pub fn set_block(&mut self, block: &MetadataBlock, use_padding: bool) -> EditorResult<()> {
        self.check_writable()?;

        // STREAMINFO may only be replaced by STREAMINFO, and nothing else may become one.
        let new_is_info = matches!(block.data, MetadataBlockData::StreamInfo(_));
        let cur_is_info = self.header.block_type == MetadataType::StreamInfo;

        if new_is_info != cur_is_info {
            return Err(EditorError::IllegalInput);
        }

        let cur_len = self.header.block_len;
        let new_len = block.data.len();

        if new_len == cur_len {
            self.write_block_at(self.offset, self.header.is_last, &block.data)?;
            self.header = read_header_at(&mut self.file, self.offset)?;
            return self.sync();
        }

        if new_len < cur_len {
            let slack = cur_len - new_len;

            // Filling the slack requires room for at least a padding block header. Smaller
            // slack falls through to the rewrite.
            if use_padding && slack >= MetadataBlockHeader::LEN {
                let was_last = self.header.is_last;

                self.write_block_at(self.offset, false, &block.data)?;

                let padding =
                    MetadataBlockData::Padding(Padding { length: slack - MetadataBlockHeader::LEN });

                let padding_at =
                    self.offset + u64::from(MetadataBlockHeader::LEN) + u64::from(new_len);

                self.write_block_at(padding_at, was_last, &padding)?;

                self.header = read_header_at(&mut self.file, self.offset)?;
                return self.sync();
            }
        }
        else if use_padding && !self.header.is_last {
            // Try to grow into an immediately following padding block.
            let block_end = self.block_end();
            let next = read_header_at(&mut self.file, block_end)?;

            if next.block_type == MetadataType::Padding {
                let avail =
                    u64::from(MetadataBlockHeader::LEN) + u64::from(next.block_len);
                let need = u64::from(new_len - cur_len);

                if avail == need {
                    // The padding is consumed whole; the new block inherits its last flag.
                    self.write_block_at(self.offset, next.is_last, &block.data)?;
                    self.header = read_header_at(&mut self.file, self.offset)?;
                    return self.sync();
                }
                else if avail >= need + u64::from(MetadataBlockHeader::LEN) {
                    let remainder = (avail - need - u64::from(MetadataBlockHeader::LEN)) as u32;

                    self.write_block_at(self.offset, false, &block.data)?;

                    let padding = MetadataBlockData::Padding(Padding { length: remainder });

                    let padding_at =
                        self.offset + u64::from(MetadataBlockHeader::LEN) + u64::from(new_len);

                    self.write_block_at(padding_at, next.is_last, &padding)?;

                    self.header = read_header_at(&mut self.file, self.offset)?;
                    return self.sync();
                }
            }
        }

        // No in-place option: rewrite the file with the block replaced.
        debug!("set_block falls back to a file rewrite");

        self.rewrite_edit(|blocks, current| {
            blocks[current].data = block.data.clone();
            current
        })
    }

    /// Inserts a new block immediately after the current block, absorbing a following PADDING
    /// block when `use_padding` allows, and rewriting the file otherwise. On success the
    /// iterator is positioned at the inserted block. STREAMINFO blocks may not be inserted.
    pub fn insert_block_after(
        &mut self,
        block: &MetadataBlock,
        use_padding: bool,
    ) -> EditorResult<()> {
        self.check_writable()?;

        if matches!(block.data, MetadataBlockData::StreamInfo(_)) {
            return Err(EditorError::IllegalInput);
        }

        let new_len = block.data.len();

        if use_padding && !self.header.is_last {
            let insert_at = self.block_end();
            let next = read_header_at(&mut self.file, insert_at)?;

            if next.block_type == MetadataType::Padding {
                let avail = u64::from(MetadataBlockHeader::LEN) + u64::from(next.block_len);
                let need = u64::from(MetadataBlockHeader::LEN) + u64::from(new_len);

                if avail == need {
                    self.write_block_at(insert_at, next.is_last, &block.data)?;

                    self.offset = insert_at;
                    self.header = read_header_at(&mut self.file, insert_at)?;
                    return self.sync();
                }
                else if avail >= need + u64::from(MetadataBlockHeader::LEN) {
                    let remainder = (avail - need - u64::from(MetadataBlockHeader::LEN)) as u32;

                    self.write_block_at(insert_at, false, &block.data)?;

                    let padding_at = insert_at + need;
                    let padding = MetadataBlockData::Padding(Padding { length: remainder });
                    self.write_block_at(padding_at, next.is_last, &padding)?;

                    self.offset = insert_at;
                    self.header = read_header_at(&mut self.file, insert_at)?;
                    return self.sync();
                }
            }
        }

        debug!("insert_block_after falls back to a file rewrite");

        self.rewrite_edit(|blocks, current| {
            blocks.insert(current + 1, MetadataBlock::new(block.data.clone()));
            current + 1
        })
    }

    /// Deletes the current block, either by replacing it with an equal-size PADDING block
    /// (`use_padding`), or by rewriting the file. The STREAMINFO block may not be deleted. On
    /// success the iterator is positioned at the previous block, or at the replacement padding.
    pub fn delete_block(&mut self, use_padding: bool) -> EditorResult<()> {
        self.check_writable()?;

        if self.header.block_type == MetadataType::StreamInfo {
            return Err(EditorError::IllegalInput);
        }

        if use_padding {
            // Reuse the block's entire footprint as padding: same body length, same last flag.
            let padding = MetadataBlockData::Padding(Padding { length: self.header.block_len });

            self.write_block_at(self.offset, self.header.is_last, &padding)?;
            self.header = read_header_at(&mut self.file, self.offset)?;
            return self.sync();
        }

        debug!("delete_block falls back to a file rewrite");

        self.rewrite_edit(|blocks, current| {
            blocks.remove(current);
            current - 1
        })
    }

    fn check_writable(&self) -> EditorResult<()> {
        if self.read_only {
            return Err(EditorError::NotWritable);
        }
        Ok(())
    }

    /// The offset one past the end of the current block.
    fn block_end(&self) -> u64 {
        self.offset + u64::from(MetadataBlockHeader::LEN) + u64::from(self.header.block_len)
    }

    /// Serialises a block (header and body) at an absolute file offset.
    fn write_block_at(
        &mut self,
        offset: u64,
        is_last: bool,
        data: &MetadataBlockData,
    ) -> EditorResult<()> {
        let header = MetadataBlockHeader {
            is_last,
            block_type: data.block_type(),
            block_len: data.len(),
        };

        let mut bytes = Vec::with_capacity(header.block_len as usize + 4);
        header.write_to(&mut bytes).map_err(EditorError::Write)?;
        data.write_to(&mut bytes).map_err(EditorError::Write)?;

        self.file.seek(SeekFrom::Start(offset)).map_err(EditorError::Seek)?;
        self.file.write_all(&bytes).map_err(EditorError::Write)?;

        Ok(())
    }

    fn sync(&mut self) -> EditorResult<()> {
        self.file.sync_data().map_err(EditorError::Write)
    }

    /// Reads the entire chain, applies an edit to it, and rewrites the file through a temporary.
    /// The edit closure returns the index the iterator should land on afterwards.
    fn rewrite_edit<F>(&mut self, edit: F) -> EditorResult<()>
    where
        F: FnOnce(&mut Vec<MetadataBlock>, usize) -> usize,
    {
        // Read all blocks, remembering which index the iterator is at.
        let mut blocks = Vec::new();
        let mut current_index = 0;
        let mut offset = self.first_block_offset;

        loop {
            if offset == self.offset {
                current_index = blocks.len();
            }

            let header = read_header_at(&mut self.file, offset)?;

            let len = u64::from(MetadataBlockHeader::LEN) + u64::from(header.block_len);

            self.file.seek(SeekFrom::Start(offset)).map_err(EditorError::Seek)?;

            let mut bytes = vec![0u8; len as usize];
            self.file.read_exact(&mut bytes).map_err(EditorError::Read)?;

            blocks.push(MetadataBlock::read(&mut BufReader::new(&bytes))?);

            offset += len;

            if header.is_last {
                break;
            }
        }

        let audio_offset = offset;

        let new_index = edit(&mut blocks, current_index);

        if blocks.is_empty() {
            return Err(EditorError::Internal("chain emptied by edit"));
        }

        // Re-derive the last flags.
        let last = blocks.len() - 1;

        for (i, block) in blocks.iter_mut().enumerate() {
            block.is_last = i == last;
        }

        // Rewrite through a temporary file and rename over the original.
        let tmp_path = temp_file_path(&self.path);

        let result = rewrite_file(
            &self.path,
            &tmp_path,
            self.first_block_offset,
            audio_offset,
            &blocks,
        );

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if self.preserve_stats {
            if let Ok(metadata) = fs::metadata(&self.path) {
                let _ = fs::set_permissions(&tmp_path, metadata.permissions());
            }
        }

        fs::rename(&tmp_path, &self.path).map_err(|err| {
            match fs::remove_file(&tmp_path) {
                Ok(()) => EditorError::Rename(err),
                Err(unlink_err) => EditorError::Unlink(unlink_err),
            }
        })?;

        // Reopen the renamed file and walk to the edited index.
        self.file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(EditorError::Read)?;

        let mut offset = self.first_block_offset;

        for _ in 0..new_index {
            let header = read_header_at(&mut self.file, offset)?;
            offset += u64::from(MetadataBlockHeader::LEN) + u64::from(header.block_len);
        }

        self.header = read_header_at(&mut self.file, offset)?;
        self.offset = offset;

        self.sync()
    }
}

/// Consumes the stream marker (and any ID3v2 prefix) of an open file, returning the offset of
/// the first metadata block header.
fn skip_to_first_block(file: &mut fs::File) -> EditorResult<u64> {
    let mut marker = [0u8; 4];
    file.read_exact(&mut marker).map_err(EditorError::Read)?;

    if marker[..3] == *b"ID3" {
        // The rest of the ID3v2 header: minor version, flags, and a synch-safe length.
        let mut header = [0u8; 6];
        file.read_exact(&mut header).map_err(EditorError::Read)?;

        if header[2..].iter().any(|b| b & 0x80 != 0) {
            return Err(EditorError::NotAFlacFile);
        }

        let tag_len = (u64::from(header[2]) << 21)
            | (u64::from(header[3]) << 14)
            | (u64::from(header[4]) << 7)
            | u64::from(header[5]);

        file.seek(SeekFrom::Current(tag_len as i64)).map_err(EditorError::Seek)?;
        file.read_exact(&mut marker).map_err(EditorError::Read)?;
    }

    if marker != STREAM_MARKER {
        return Err(EditorError::NotAFlacFile);
    }

    file.stream_position().map_err(EditorError::Seek)
}

/// Reads and parses a block header at an absolute file offset.
fn read_header_at(file: &mut fs::File, offset: u64) -> EditorResult<MetadataBlockHeader> {
    file.seek(SeekFrom::Start(offset)).map_err(EditorError::Seek)?;

    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes).map_err(EditorError::Read)?;

    Ok(MetadataBlockHeader::read(&mut BufReader::new(&bytes))?)
}

/// Writes a complete copy of `path` to `tmp_path` with the metadata area replaced by `blocks`.
fn rewrite_file(
    path: &Path,
    tmp_path: &Path,
    first_block_offset: u64,
    audio_offset: u64,
    blocks: &[MetadataBlock],
) -> EditorResult<()> {
    let mut src = fs::File::open(path).map_err(EditorError::Read)?;
    let mut dst = fs::File::create(tmp_path).map_err(EditorError::Write)?;

    // The prefix (any ID3v2 tag plus the stream marker) is copied verbatim.
    copy_len(&mut src, &mut dst, first_block_offset).map_err(EditorError::Write)?;

    for block in blocks {
        block.write_to(&mut dst).map_err(EditorError::Write)?;
    }

    src.seek(SeekFrom::Start(audio_offset)).map_err(EditorError::Seek)?;

    std::io::copy(&mut src, &mut dst).map_err(EditorError::Write)?;

    dst.sync_all().map_err(EditorError::Write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Application, StreamInfo};

    fn test_file(dir: &tempfile::TempDir, padding: u32) -> PathBuf {
        let info = StreamInfo {
            min_block_size: 4096,
            max_block_size: 4096,
            min_frame_size: 0,
            max_frame_size: 0,
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 16,
            total_samples: 0,
            md5: [0; 16],
        };

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&STREAM_MARKER);

        MetadataBlock { is_last: false, data: MetadataBlockData::StreamInfo(info) }
            .write_to(&mut bytes)
            .unwrap();

        MetadataBlock {
            is_last: true,
            data: MetadataBlockData::Padding(Padding { length: padding }),
        }
        .write_to(&mut bytes)
        .unwrap();

        // A bogus audio area to verify it is carried across rewrites.
        bytes.extend_from_slice(&[0xff, 0xf8, 0xaa, 0x55]);

        let path = dir.path().join("test.flac");
        fs::write(&path, bytes).unwrap();
        path
    }

    fn app_block(len: usize) -> MetadataBlock {
        MetadataBlock::new(MetadataBlockData::Application(Application {
            id: *b"Cnta",
            data: vec![0x5a; len - 4].into_boxed_slice(),
        }))
    }

    #[test]
    fn verify_navigation() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(&dir, 64);

        let mut editor = SimpleEditor::open(&path, true, false).unwrap();

        assert_eq!(editor.block_type(), MetadataType::StreamInfo);
        assert!(!editor.is_last());

        assert!(editor.next().unwrap());
        assert_eq!(editor.block_type(), MetadataType::Padding);
        assert!(editor.is_last());
        assert!(!editor.next().unwrap());

        assert!(editor.prev().unwrap());
        assert_eq!(editor.block_type(), MetadataType::StreamInfo);
        assert!(!editor.prev().unwrap());
    }

    #[test]
    fn verify_set_block_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(&dir, 64);

        let size_before = fs::metadata(&path).unwrap().len();

        let mut editor = SimpleEditor::open(&path, false, false).unwrap();

        // Replace STREAMINFO with an edited copy, same length by definition.
        let mut block = editor.get_block().unwrap();

        if let MetadataBlockData::StreamInfo(info) = &mut block.data {
            info.total_samples = 123_456;
        }

        editor.set_block(&block, true).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), size_before);

        // Replacing STREAMINFO with anything else is illegal.
        assert!(matches!(
            editor.set_block(&app_block(38), true),
            Err(EditorError::IllegalInput)
        ));

        let editor = SimpleEditor::open(&path, true, false).unwrap();
        let mut editor = editor;
        let block = editor.get_block().unwrap();

        match block.data {
            MetadataBlockData::StreamInfo(info) => assert_eq!(info.total_samples, 123_456),
            _ => panic!("expected stream info"),
        }
    }

    #[test]
    fn verify_insert_absorbs_padding() {
        let dir = tempfile::tempdir().unwrap();
        // 1000-byte padding block, as in the reference scenario.
        let path = test_file(&dir, 1000);

        let size_before = fs::metadata(&path).unwrap().len();

        let mut editor = SimpleEditor::open(&path, false, false).unwrap();

        // Insert a 200-byte application block after STREAMINFO, absorbing padding.
        editor.insert_block_after(&app_block(200), true).unwrap();

        assert_eq!(editor.block_type(), MetadataType::Application);
        assert_eq!(editor.block_length(), 200);

        // The file size must be unchanged: the padding shrank by the block plus its header.
        assert_eq!(fs::metadata(&path).unwrap().len(), size_before);

        assert!(editor.next().unwrap());
        assert_eq!(editor.block_type(), MetadataType::Padding);
        // The padding donates the block body plus one header: 1000 - 200 - 4 = 796.
        assert_eq!(editor.block_length(), 796);
        assert!(editor.is_last());

        // The audio area must be untouched.
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[bytes.len() - 4..], &[0xff, 0xf8, 0xaa, 0x55]);
    }

    #[test]
    fn verify_insert_rewrites_when_padding_too_small() {
        let dir = tempfile::tempdir().unwrap();
        // Too little padding to absorb the insert: the file must grow via a rewrite.
        let path = test_file(&dir, 8);

        let size_before = fs::metadata(&path).unwrap().len();

        let mut editor = SimpleEditor::open(&path, false, false).unwrap();
        editor.insert_block_after(&app_block(200), true).unwrap();

        assert_eq!(editor.block_type(), MetadataType::Application);
        assert!(fs::metadata(&path).unwrap().len() > size_before);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[bytes.len() - 4..], &[0xff, 0xf8, 0xaa, 0x55]);
    }

    #[test]
    fn verify_delete_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(&dir, 100);

        let mut editor = SimpleEditor::open(&path, false, false).unwrap();

        // STREAMINFO may not be deleted.
        assert!(matches!(editor.delete_block(true), Err(EditorError::IllegalInput)));

        editor.insert_block_after(&app_block(40), true).unwrap();

        let size_before = fs::metadata(&path).unwrap().len();

        // Fast delete: the application block becomes padding of the same size.
        editor.delete_block(true).unwrap();

        assert_eq!(editor.block_type(), MetadataType::Padding);
        assert_eq!(editor.block_length(), 40);
        assert_eq!(fs::metadata(&path).unwrap().len(), size_before);
    }

    #[test]
    fn verify_set_block_shrink_pads_slack() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(&dir, 100);

        let mut editor = SimpleEditor::open(&path, false, false).unwrap();
        editor.insert_block_after(&app_block(60), true).unwrap();

        let size_before = fs::metadata(&path).unwrap().len();

        // Shrink the block; the 20 bytes of slack become a 16-byte padding block.
        editor.set_block(&app_block(40), true).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), size_before);
        assert_eq!(editor.block_length(), 40);

        assert!(editor.next().unwrap());
        assert_eq!(editor.block_type(), MetadataType::Padding);
        assert_eq!(editor.block_length(), 16);
    }
}
