// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp::min;
use std::io;
use std::io::{Read, Seek, SeekFrom};

use super::{MediaSource, ReadBytes};

const END_OF_STREAM_ERROR_STR: &str = "end of stream";

/// `MediaSourceStream` is the buffered reader type for Cantata. By using type erasure and dynamic
/// dispatch, it wraps and hides the inner [`MediaSource`] from the consumer, allowing any typical
/// reader to be used in a generic way, selectable at runtime.
///
/// To minimize system call and dynamic dispatch overhead on the inner reader, and to amortize
/// that overhead over many bytes, `MediaSourceStream` implements an exponentially growing
/// read-ahead buffer. The read-ahead length starts at 1kB, and doubles in length as more
/// sequential reads are performed until it reaches 32kB.
///
/// In addition, the stream retains a window of up-to 32kB of previously read bytes, allowing
/// short backwards seeks (e.g. frame resynchronisation) without touching the inner reader.
pub struct MediaSourceStream {
    /// The source reader.
    inner: Box<dyn MediaSource>,
    /// The read-ahead and seekback buffer.
    buf: Vec<u8>,
    /// Absolute stream position of `buf[0]`.
    base_pos: u64,
    /// Index of the next unread byte.
    read_pos: usize,
    /// Number of valid bytes in the buffer.
    end_pos: usize,
    /// The length of the next read-ahead, grows exponentially up-to `MAX_BLOCK_LEN`.
    read_block_len: usize,
}

impl MediaSourceStream {
    const MIN_BLOCK_LEN: usize = 1024;
    const MAX_BLOCK_LEN: usize = 32 * 1024;

    /// The number of previously read bytes retained for backwards seeking.
    const SEEKBACK_LEN: usize = 32 * 1024;

    pub fn new(source: Box<dyn MediaSource>) -> Self {
        MediaSourceStream {
            inner: source,
            buf: Vec::new(),
            base_pos: 0,
            read_pos: 0,
            end_pos: 0,
            read_block_len: Self::MIN_BLOCK_LEN,
        }
    }

    /// Returns if the underlying source is seekable.
    pub fn is_seekable(&self) -> bool {
        self.inner.is_seekable()
    }

    /// Returns the byte length of the underlying source, if known.
    pub fn byte_len(&self) -> Option<u64> {
        self.inner.byte_len()
    }

    /// Gets the number of bytes buffered and read.
    ///
    /// Note: this is the maximum number of bytes that can be seeked backwards within the buffer.
    pub fn read_buffer_len(&self) -> usize {
        self.read_pos
    }

    /// Seek within the buffered data to an absolute stream position. The seekable window is
    /// clamped to the buffered data; the position actually seeked to is returned.
    pub fn seek_buffered(&mut self, pos: u64) -> u64 {
        let lower = self.base_pos;
        let upper = self.base_pos + self.end_pos as u64;

        self.read_pos = (pos.clamp(lower, upper) - self.base_pos) as usize;
        self.pos()
    }

    /// Seek backwards within the buffered data by up-to `delta` bytes.
    pub fn seek_buffered_rev(&mut self, delta: u64) -> u64 {
        let pos = self.pos().saturating_sub(delta);
        self.seek_buffered(pos)
    }

    /// Seeks the stream. A seek landing within the buffered window is serviced from the buffer;
    /// any other seek is delegated to the inner source and invalidates the buffer.
    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(pos) => pos,
            SeekFrom::Current(delta) => {
                let pos = self.pos();
                if delta >= 0 {
                    pos.checked_add(delta as u64)
                }
                else {
                    pos.checked_sub(delta.unsigned_abs())
                }
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek out of range")
                })?
            }
            SeekFrom::End(_) => {
                // Delegate end-relative seeks directly, they cannot be serviced by the buffer.
                let pos = self.inner.seek(pos)?;
                self.invalidate(pos);
                return Ok(pos);
            }
        };

        if target >= self.base_pos && target <= self.base_pos + self.end_pos as u64 {
            return Ok(self.seek_buffered(target));
        }

        let pos = self.inner.seek(SeekFrom::Start(target))?;
        self.invalidate(pos);

        Ok(pos)
    }

    /// Resets the buffer, setting the absolute stream position to `pos`.
    fn invalidate(&mut self, pos: u64) {
        self.base_pos = pos;
        self.read_pos = 0;
        self.end_pos = 0;
        self.read_block_len = Self::MIN_BLOCK_LEN;
    }

    #[inline(always)]
    fn is_buffer_exhausted(&self) -> bool {
        self.read_pos == self.end_pos
    }

    /// If the buffer has been exhausted, fetch a new block of data to replenish it.
    fn fetch(&mut self) -> io::Result<()> {
        if !self.is_buffer_exhausted() {
            return Ok(());
        }

        // Discard all but the trailing seekback window before the buffer grows oversized.
        if self.end_pos + self.read_block_len > Self::SEEKBACK_LEN + Self::MAX_BLOCK_LEN {
            let drop_len = self.read_pos.saturating_sub(Self::SEEKBACK_LEN);

            self.buf.copy_within(drop_len..self.end_pos, 0);
            self.base_pos += drop_len as u64;
            self.read_pos -= drop_len;
            self.end_pos -= drop_len;
        }

        if self.buf.len() < self.end_pos + self.read_block_len {
            self.buf.resize(self.end_pos + self.read_block_len, 0);
        }

        let len = self.inner.read(&mut self.buf[self.end_pos..self.end_pos + self.read_block_len])?;

        self.end_pos += len;

        // Grow the read block length exponentially to reduce the overhead of buffering on
        // consecutive reads.
        self.read_block_len = min(self.read_block_len << 1, Self::MAX_BLOCK_LEN);

        Ok(())
    }

    /// As [`MediaSourceStream::fetch`], but returns an end-of-stream error if no more data could
    /// be fetched.
    fn fetch_or_eof(&mut self) -> io::Result<()> {
        self.fetch()?;

        if self.is_buffer_exhausted() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, END_OF_STREAM_ERROR_STR));
        }

        Ok(())
    }
}

impl ReadBytes for MediaSourceStream {
    #[inline(always)]
    fn read_byte(&mut self) -> io::Result<u8> {
        if self.is_buffer_exhausted() {
            self.fetch_or_eof()?;
        }

        let byte = self.buf[self.read_pos];
        self.read_pos += 1;

        Ok(byte)
    }

    fn read_double_bytes(&mut self) -> io::Result<[u8; 2]> {
        let mut bytes = [0u8; 2];
        self.read_buf_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn read_triple_bytes(&mut self) -> io::Result<[u8; 3]> {
        let mut bytes = [0u8; 3];
        self.read_buf_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn read_quad_bytes(&mut self) -> io::Result<[u8; 4]> {
        let mut bytes = [0u8; 4];
        self.read_buf_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn read_buf_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut written = 0;

        while written < buf.len() {
            if self.is_buffer_exhausted() {
                self.fetch_or_eof()?;
            }

            let len = min(buf.len() - written, self.end_pos - self.read_pos);

            buf[written..written + len]
                .copy_from_slice(&self.buf[self.read_pos..self.read_pos + len]);

            self.read_pos += len;
            written += len;
        }

        Ok(())
    }

    fn ignore_bytes(&mut self, mut count: u64) -> io::Result<()> {
        // If the source is seekable and the skip is far beyond the buffered data, seek instead
        // of reading bytes that would immediately be discarded.
        let buffered = (self.end_pos - self.read_pos) as u64;

        if self.is_seekable() && count > buffered + Self::MAX_BLOCK_LEN as u64 {
            self.seek(SeekFrom::Current(count as i64))?;
            return Ok(());
        }

        while count > 0 {
            if self.is_buffer_exhausted() {
                self.fetch_or_eof()?;
            }

            let len = min(count, (self.end_pos - self.read_pos) as u64);
            self.read_pos += len as usize;
            count -= len;
        }

        Ok(())
    }

    #[inline(always)]
    fn pos(&self) -> u64 {
        self.base_pos + self.read_pos as u64
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, SeekFrom};

    use super::MediaSourceStream;
    use crate::io::ReadBytes;

    /// Generate a vector of bytes of the specified length using a simple LCG.
    fn generate_random_bytes(len: usize) -> Vec<u8> {
        let mut lcg: u32 = 0xec57_c4bf;

        let mut bytes = vec![0; len];

        for quad in bytes.chunks_mut(4) {
            lcg = lcg.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            for (dst, src) in quad.iter_mut().zip(&lcg.to_ne_bytes()) {
                *dst = *src;
            }
        }

        bytes
    }

    #[test]
    fn verify_mss_read() {
        let data = generate_random_bytes(257 * 1024);

        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(data.clone())));

        // Exercise the read-ahead growth and the seekback compaction with a mix of read sizes.
        for byte in &data[..96 * 1024] {
            assert_eq!(*byte, mss.read_byte().unwrap());
        }

        let mut pos = 96 * 1024;

        mss.ignore_bytes(11).unwrap();
        pos += 11;

        for bytes in data[pos..pos + 96 * 1024].chunks_exact(4) {
            assert_eq!(bytes, &mss.read_quad_bytes().unwrap());
        }

        pos += 96 * 1024;

        let mut tail = vec![0u8; data.len() - pos];
        mss.read_buf_exact(&mut tail).unwrap();
        assert_eq!(&tail, &data[pos..]);

        assert!(mss.read_byte().is_err());
    }

    #[test]
    fn verify_mss_pos_and_seek() {
        let data = generate_random_bytes(256 * 1024);

        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(data.clone())));

        mss.ignore_bytes(5122).unwrap();
        assert_eq!(mss.pos(), 5122);

        let byte = mss.read_byte().unwrap();

        // Buffered backwards seek.
        assert_eq!(mss.seek_buffered_rev(1000), 4123);
        assert_eq!(mss.pos(), 4123);

        // Forward seek back to the same byte.
        mss.seek(SeekFrom::Start(5122)).unwrap();
        assert_eq!(mss.read_byte().unwrap(), byte);

        // Long seek out of the buffered window.
        mss.seek(SeekFrom::Start(200_000)).unwrap();
        assert_eq!(mss.pos(), 200_000);
        assert_eq!(mss.read_byte().unwrap(), data[200_000]);
    }
}
