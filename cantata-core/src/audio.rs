// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `audio` module provides the planar audio buffer used throughout Cantata, and the types
//! describing its layout.

use bitflags::bitflags;

use std::fmt;

bitflags! {
    /// A bitmask of speaker positions. The channels of a planar buffer are ordered by ascending
    /// flag value.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Channels: u32 {
        const FRONT_LEFT    = 0x0000_0001;
        const FRONT_RIGHT   = 0x0000_0002;
        const FRONT_CENTRE  = 0x0000_0004;
        const LFE1          = 0x0000_0008;
        const REAR_LEFT     = 0x0000_0010;
        const REAR_RIGHT    = 0x0000_0020;
        const REAR_CENTRE   = 0x0000_0040;
        const SIDE_LEFT     = 0x0000_0080;
        const SIDE_RIGHT    = 0x0000_0100;
    }
}

impl Channels {
    /// Gets the number of channels in the mask.
    pub fn count(&self) -> usize {
        self.bits().count_ones() as usize
    }

    /// Gets the conventional channel mask for a positional channel count of 1 to 9.
    pub fn from_count(count: usize) -> Option<Channels> {
        if count < 1 || count > 9 {
            return None;
        }
        Channels::from_bits((1u32 << count) - 1)
    }
}

impl fmt::Display for Channels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#032b}", self.bits())
    }
}

/// `SignalSpec` describes the characteristics of a signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SignalSpec {
    /// The signal sampling rate in hertz (Hz).
    pub rate: u32,
    /// The channel assignments of the signal.
    pub channels: Channels,
}

impl SignalSpec {
    pub fn new(rate: u32, channels: Channels) -> Self {
        SignalSpec { rate, channels }
    }
}

/// `AudioBuffer` is a planar buffer of `i32` samples. Each channel occupies a contiguous run of
/// `capacity` samples, of which the first `n_frames` are valid.
///
/// The buffer grows monotonically: rendering a block larger than the current capacity reallocates,
/// rendering a smaller block does not shrink.
pub struct AudioBuffer {
    buf: Vec<i32>,
    spec: SignalSpec,
    n_frames: usize,
    capacity: usize,
}

impl AudioBuffer {
    /// Instantiate a buffer able to hold `duration` frames of every channel in `spec`.
    pub fn new(duration: u64, spec: SignalSpec) -> Self {
        let capacity = duration as usize;
        let n_channels = spec.channels.count();

        AudioBuffer { buf: vec![0i32; capacity * n_channels], spec, n_frames: 0, capacity }
    }

    /// Gets the signal specification of the buffer.
    pub fn spec(&self) -> &SignalSpec {
        &self.spec
    }

    /// Gets the number of valid frames per channel.
    pub fn frames(&self) -> usize {
        self.n_frames
    }

    /// Invalidates all rendered frames.
    pub fn clear(&mut self) {
        self.n_frames = 0;
    }

    /// Renders `n_frames` uninitialized (zeroed) frames, growing the buffer if required.
    pub fn render_reserved(&mut self, n_frames: usize) {
        let n_channels = self.spec.channels.count();

        if n_frames > self.capacity {
            // Grow each channel's run in-place by rebuilding the planar layout.
            let mut buf = vec![0i32; n_frames * n_channels];

            for ch in 0..n_channels {
                let src = &self.buf[ch * self.capacity..ch * self.capacity + self.n_frames];
                buf[ch * n_frames..ch * n_frames + self.n_frames].copy_from_slice(src);
            }

            self.buf = buf;
            self.capacity = n_frames;
        }

        self.n_frames = n_frames;
    }

    /// Gets an immutable slice of the valid frames of channel `ch`.
    pub fn chan(&self, ch: usize) -> &[i32] {
        &self.buf[ch * self.capacity..ch * self.capacity + self.n_frames]
    }

    /// Gets a mutable slice of the valid frames of channel `ch`.
    pub fn chan_mut(&mut self, ch: usize) -> &mut [i32] {
        &mut self.buf[ch * self.capacity..ch * self.capacity + self.n_frames]
    }

    /// Gets mutable slices of two distinct channels.
    pub fn chan_pair_mut(&mut self, first: usize, second: usize) -> (&mut [i32], &mut [i32]) {
        // Both channels in the pair must be unique.
        assert!(first != second);

        let (lo, hi) = if first < second { (first, second) } else { (second, first) };

        let (a, b) = self.buf.split_at_mut(hi * self.capacity);

        let lo_chan = &mut a[lo * self.capacity..lo * self.capacity + self.n_frames];
        let hi_chan = &mut b[..self.n_frames];

        if first < second {
            (lo_chan, hi_chan)
        }
        else {
            (hi_chan, lo_chan)
        }
    }

    /// Discards the first `n` frames of every channel, shifting the remainder to the front.
    pub fn trim_start(&mut self, n: usize) {
        let n = n.min(self.n_frames);
        let n_channels = self.spec.channels.count();

        for ch in 0..n_channels {
            let start = ch * self.capacity;
            self.buf.copy_within(start + n..start + self.n_frames, start);
        }

        self.n_frames -= n;
    }

    /// Applies a transformation function over every valid sample in every channel.
    pub fn transform<F>(&mut self, f: F)
    where
        F: Fn(i32) -> i32,
    {
        let n_channels = self.spec.channels.count();

        for ch in 0..n_channels {
            for sample in
                self.buf[ch * self.capacity..ch * self.capacity + self.n_frames].iter_mut()
            {
                *sample = f(*sample);
            }
        }
    }
}
