// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The level-2 metadata editor: the whole metadata area is loaded into an in-memory chain,
//! edited freely, and written back in one consolidated pass.

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cantata_core::io::{MediaSourceStream, ReadBytes};

use log::debug;

use super::{
    copy_len, read_stream_marker, temp_file_path, EditorError, MetadataBlock, MetadataBlockData,
    MetadataBlockHeader, Padding,
};
use crate::format::STREAM_MARKER;

type EditorResult<T> = std::result::Result<T, EditorError>;

/// An ordered, in-memory, copy of a file's metadata blocks.
///
/// Invariants are re-derived on [`Chain::write`]: the `is_last` flag is set on exactly the final
/// block and every block length is recomputed from its body, regardless of any edits made to
/// those fields in the meantime.
pub struct Chain {
    path: PathBuf,
    /// The byte offset of the first block header (past the stream marker and any ID3v2 tag).
    first_block_offset: u64,
    /// The serialised length of the metadata area currently on disk.
    on_disk_len: u64,
    blocks: Vec<MetadataBlock>,
}

impl Chain {
    /// Reads the complete metadata chain of a FLAC file.
    pub fn read<P: AsRef<Path>>(path: P) -> EditorResult<Chain> {
        let file = fs::File::open(&path).map_err(EditorError::Read)?;

        let mut reader = MediaSourceStream::new(Box::new(file));

        read_stream_marker(&mut reader).map_err(|_| EditorError::NotAFlacFile)?;

        let first_block_offset = reader.pos();

        let mut blocks = Vec::new();

        loop {
            let block = MetadataBlock::read(&mut reader)?;
            let is_last = block.is_last;

            blocks.push(block);

            if is_last {
                break;
            }
        }

        if !matches!(blocks[0].data, MetadataBlockData::StreamInfo(_)) {
            return Err(EditorError::BadMetadata("first metadata block is not stream info"));
        }

        let on_disk_len = reader.pos() - first_block_offset;

        Ok(Chain { path: path.as_ref().to_path_buf(), first_block_offset, on_disk_len, blocks })
    }

    /// Gets the blocks of the chain.
    pub fn blocks(&self) -> &[MetadataBlock] {
        &self.blocks
    }

    /// Gets mutable access to the blocks of the chain. Ordering and flag invariants are
    /// re-derived on write.
    pub fn blocks_mut(&mut self) -> &mut Vec<MetadataBlock> {
        &mut self.blocks
    }

    /// The serialised length of the chain in its current state.
    fn chain_len(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.total_len())).sum()
    }

    /// Coalesces every run of adjacent PADDING blocks into a single block. The absorbed block
    /// headers become padding bytes, so the serialised length of the chain is unchanged.
    pub fn merge_padding(&mut self) {
        let mut i = 0;

        while i + 1 < self.blocks.len() {
            let absorb = matches!(
                (&self.blocks[i].data, &self.blocks[i + 1].data),
                (MetadataBlockData::Padding(_), MetadataBlockData::Padding(_))
            );

            if absorb {
                let grow = self.blocks[i + 1].total_len();
                let is_last = self.blocks[i + 1].is_last;

                if let MetadataBlockData::Padding(padding) = &mut self.blocks[i].data {
                    padding.length += grow;
                }

                self.blocks[i].is_last = is_last;
                self.blocks.remove(i + 1);
            }
            else {
                i += 1;
            }
        }
    }

    /// Moves every PADDING block to the end of the chain, in order, then merges them into one.
    /// The serialised length of the chain is unchanged.
    pub fn sort_padding(&mut self) {
        // A stable partition: non-padding blocks keep their order, paddings move to the back.
        self.blocks.sort_by_key(|b| matches!(b.data, MetadataBlockData::Padding(_)));
        self.merge_padding();
    }

    /// Writes the chain back to the file.
    ///
    /// When the chain serialises to exactly the on-disk metadata length, or can be made to by
    /// resizing trailing padding (`use_padding`), the metadata area is overwritten in place.
    /// Otherwise the whole file is rewritten through a temporary file and renamed over the
    /// original, optionally preserving file permissions (`preserve_stats`).
    pub fn write(&mut self, use_padding: bool, preserve_stats: bool) -> EditorResult<()> {
        // Validate the chain shape before any bytes are written.
        if self.blocks.is_empty()
            || !matches!(self.blocks[0].data, MetadataBlockData::StreamInfo(_))
        {
            return Err(EditorError::BadMetadata("first metadata block is not stream info"));
        }

        if self.blocks[1..]
            .iter()
            .any(|b| matches!(b.data, MetadataBlockData::StreamInfo(_)))
        {
            return Err(EditorError::BadMetadata("more than one stream info block"));
        }

        if use_padding {
            self.fit_to_disk_length();
        }

        // Re-derive the is_last flags from chain position.
        let last = self.blocks.len() - 1;

        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.is_last = i == last;
        }

        if self.chain_len() == self.on_disk_len {
            debug!("chain fits, overwriting metadata in place");
            self.write_in_place()?;
        }
        else {
            debug!("chain resized, rewriting file");
            self.rewrite(preserve_stats)?;
        }

        self.on_disk_len = self.chain_len();

        Ok(())
    }

    /// Grows or shrinks trailing padding so the chain serialises to the on-disk length, when
    /// possible.
    fn fit_to_disk_length(&mut self) {
        let new_len = self.chain_len();
        let old_len = self.on_disk_len;

        if new_len < old_len {
            let slack = old_len - new_len;

            if let Some(MetadataBlockData::Padding(padding)) =
                self.blocks.last_mut().map(|b| &mut b.data)
            {
                padding.length += slack as u32;
            }
            else if slack >= u64::from(MetadataBlockHeader::LEN) {
                self.blocks.push(MetadataBlock::new(MetadataBlockData::Padding(Padding {
                    length: (slack - u64::from(MetadataBlockHeader::LEN)) as u32,
                })));
            }
        }
        else if new_len > old_len {
            let excess = new_len - old_len;

            let shrink = match self.blocks.last().map(|b| &b.data) {
                Some(MetadataBlockData::Padding(padding)) => {
                    if u64::from(padding.length) >= excess {
                        Some(padding.length - excess as u32)
                    }
                    else if u64::from(padding.length) + u64::from(MetadataBlockHeader::LEN)
                        == excess
                    {
                        // The padding and its header are consumed whole.
                        None
                    }
                    else {
                        return;
                    }
                }
                _ => return,
            };

            match shrink {
                Some(length) => {
                    if let Some(MetadataBlockData::Padding(padding)) =
                        self.blocks.last_mut().map(|b| &mut b.data)
                    {
                        padding.length = length;
                    }
                }
                None => {
                    self.blocks.pop();
                }
            }
        }
    }

    fn open_writable(&self) -> EditorResult<fs::File> {
        fs::OpenOptions::new().write(true).open(&self.path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::PermissionDenied {
                EditorError::NotWritable
            }
            else {
                EditorError::Write(err)
            }
        })
    }

    fn write_in_place(&self) -> EditorResult<()> {
        let mut file = self.open_writable()?;

        file.seek(SeekFrom::Start(self.first_block_offset)).map_err(EditorError::Seek)?;

        for block in &self.blocks {
            block.write_to(&mut file).map_err(EditorError::Write)?;
        }

        file.sync_data().map_err(EditorError::Write)
    }

    fn rewrite(&self, preserve_stats: bool) -> EditorResult<()> {
        let tmp_path = temp_file_path(&self.path);

        let result = self.rewrite_inner(&tmp_path);

        if result.is_err() {
            // Clean up the partial temporary on any failure.
            let _ = fs::remove_file(&tmp_path);
            return result;
        }

        if preserve_stats {
            if let Ok(metadata) = fs::metadata(&self.path) {
                let _ = fs::set_permissions(&tmp_path, metadata.permissions());
            }
        }

        fs::rename(&tmp_path, &self.path).map_err(|err| {
            match fs::remove_file(&tmp_path) {
                Ok(()) => EditorError::Rename(err),
                Err(unlink_err) => EditorError::Unlink(unlink_err),
            }
        })
    }

    fn rewrite_inner(&self, tmp_path: &Path) -> EditorResult<()> {
        let mut src = fs::File::open(&self.path).map_err(EditorError::Read)?;
        let mut dst = fs::File::create(tmp_path).map_err(EditorError::Write)?;

        // Copy any ID3v2 prefix and the stream marker verbatim.
        copy_len(&mut src, &mut dst, self.first_block_offset).map_err(EditorError::Write)?;

        for block in &self.blocks {
            block.write_to(&mut dst).map_err(EditorError::Write)?;
        }

        // Skip the old metadata area and append the unchanged audio frames.
        src.seek(SeekFrom::Start(self.first_block_offset + self.on_disk_len))
            .map_err(EditorError::Seek)?;

        std::io::copy(&mut src, &mut dst).map_err(EditorError::Write)?;

        dst.sync_all().map_err(EditorError::Write)
    }
}

/// Serialises a complete metadata area (stream marker plus blocks) to a writer. The `is_last`
/// flags are derived from position. Used by the encoder to emit its stream header.
pub(crate) fn write_metadata_area<W: Write>(
    blocks: &mut [MetadataBlock],
    writer: &mut W,
) -> std::io::Result<()> {
    writer.write_all(&STREAM_MARKER)?;

    let last = blocks.len() - 1;

    for (i, block) in blocks.iter_mut().enumerate() {
        block.is_last = i == last;
        block.write_to(writer)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Application, MetadataBlockData, StreamInfo};

    fn test_chain_bytes() -> Vec<u8> {
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

        let mut blocks = vec![
            MetadataBlock::new(MetadataBlockData::StreamInfo(info)),
            MetadataBlock::new(MetadataBlockData::Padding(Padding { length: 10 })),
            MetadataBlock::new(MetadataBlockData::Application(Application {
                id: *b"Cnta",
                data: vec![7; 8].into_boxed_slice(),
            })),
            MetadataBlock::new(MetadataBlockData::Padding(Padding { length: 20 })),
        ];

        let mut bytes = Vec::new();
        write_metadata_area(&mut blocks, &mut bytes).unwrap();

        // A minimal bogus audio area.
        bytes.extend_from_slice(&[0xff, 0xf8, 0x00, 0x00]);

        bytes
    }

    #[test]
    fn verify_merge_and_sort_padding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.flac");
        std::fs::write(&path, test_chain_bytes()).unwrap();

        let mut chain = Chain::read(&path).unwrap();
        let len_before = chain.chain_len();

        chain.sort_padding();

        // One merged padding at the end, chain length unchanged.
        assert_eq!(chain.chain_len(), len_before);
        assert_eq!(chain.blocks().len(), 3);

        match &chain.blocks().last().unwrap().data {
            MetadataBlockData::Padding(padding) => {
                // 10 + 20 bytes of padding plus one absorbed 4-byte header.
                assert_eq!(padding.length, 34);
            }
            _ => panic!("expected padding"),
        }
    }

    #[test]
    fn verify_in_place_write_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.flac");
        std::fs::write(&path, test_chain_bytes()).unwrap();

        let before = std::fs::read(&path).unwrap();

        let mut chain = Chain::read(&path).unwrap();
        chain.write(true, false).unwrap();

        let after = std::fs::read(&path).unwrap();

        // No edits, no padding consolidation: the file must be untouched.
        assert_eq!(before, after);
    }

    #[test]
    fn verify_padding_absorbs_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.flac");
        std::fs::write(&path, test_chain_bytes()).unwrap();

        let size_before = std::fs::metadata(&path).unwrap().len();

        let mut chain = Chain::read(&path).unwrap();

        // Grow the application block by 8 bytes; the trailing padding must shrink to match.
        if let MetadataBlockData::Application(app) = &mut chain.blocks_mut()[2].data {
            app.data = vec![7; 16].into_boxed_slice();
        }

        chain.write(true, false).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), size_before);

        let chain = Chain::read(&path).unwrap();

        match &chain.blocks().last().unwrap().data {
            MetadataBlockData::Padding(padding) => assert_eq!(padding.length, 12),
            _ => panic!("expected padding"),
        }
    }

    #[test]
    fn verify_rewrite_preserves_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.flac");
        std::fs::write(&path, test_chain_bytes()).unwrap();

        let mut chain = Chain::read(&path).unwrap();

        // Grow far beyond what the padding can absorb, forcing the temp-file rewrite.
        if let MetadataBlockData::Application(app) = &mut chain.blocks_mut()[2].data {
            app.data = vec![9; 4096].into_boxed_slice();
        }

        chain.write(true, false).unwrap();

        let bytes = std::fs::read(&path).unwrap();

        // The audio area must trail the file unchanged.
        assert_eq!(&bytes[bytes.len() - 4..], &[0xff, 0xf8, 0x00, 0x00]);

        // And the chain must read back with the enlarged application block.
        let chain = Chain::read(&path).unwrap();

        match &chain.blocks()[2].data {
            MetadataBlockData::Application(app) => assert_eq!(app.data.len(), 4096),
            _ => panic!("expected application block"),
        }
    }
}
