// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;

use super::ReadBytes;

/// A `Monitor` observes a running byte sequence, e.g. to accumulate a checksum or hash over it.
pub trait Monitor {
    fn process_byte(&mut self, byte: u8);

    fn process_buf_bytes(&mut self, buf: &[u8]);
}

/// A `MonitorStream` is a passive stream: every byte read from the inner stream is also fed to
/// a [`Monitor`].
///
/// Note: bytes skipped with `ignore_bytes` are *not* observed.
pub struct MonitorStream<B: ReadBytes, M: Monitor> {
    inner: B,
    monitor: M,
}

impl<B: ReadBytes, M: Monitor> MonitorStream<B, M> {
    pub fn new(inner: B, monitor: M) -> MonitorStream<B, M> {
        MonitorStream { inner, monitor }
    }

    /// Gets the monitor, e.g. to take the accumulated checksum.
    pub fn monitor(&self) -> &M {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut M {
        &mut self.monitor
    }

    /// Detaches the monitor, returning the inner stream for unobserved reading.
    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: ReadBytes, M: Monitor> ReadBytes for MonitorStream<B, M> {
    #[inline(always)]
    fn read_byte(&mut self) -> io::Result<u8> {
        let byte = self.inner.read_byte()?;
        self.monitor.process_byte(byte);
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
        self.inner.read_buf_exact(buf)?;
        self.monitor.process_buf_bytes(buf);
        Ok(())
    }

    fn ignore_bytes(&mut self, count: u64) -> io::Result<()> {
        self.inner.ignore_bytes(count)
    }

    #[inline(always)]
    fn pos(&self) -> u64 {
        self.inner.pos()
    }
}

#[cfg(test)]
mod tests {
    use super::MonitorStream;
    use crate::checksum::Crc16Ansi;
    use crate::io::{BufReader, Monitor, ReadBytes};

    #[test]
    fn verify_monitor_stream_observes_reads() {
        let data = b"123456789";

        let mut reader = BufReader::new(data);
        let mut stream = MonitorStream::new(&mut reader, Crc16Ansi::new(0));

        // Read through a mix of access widths.
        stream.read_byte().unwrap();
        stream.read_double_bytes().unwrap();
        stream.read_quad_bytes().unwrap();

        let mut tail = [0u8; 2];
        stream.read_buf_exact(&mut tail).unwrap();

        // The monitor must have observed every byte, exactly once, in order.
        let mut reference = Crc16Ansi::new(0);
        reference.process_buf_bytes(data);

        assert_eq!(stream.monitor().crc(), reference.crc());
    }
}
