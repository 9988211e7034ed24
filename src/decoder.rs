// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stream-level decoders built on top of the codec parsers.

pub mod h264;

use log::LevelFilter;

/// Settings supplied by the host application when creating a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Expected coded width in luma samples, or 0 if unknown.
    pub width: u32,
    /// Expected coded height in luma samples, or 0 if unknown.
    pub height: u32,
    /// Most verbose level the decoder logs at. Per-macroblock syntax is only
    /// traced at [`LevelFilter::Trace`].
    pub verbosity: LevelFilter,
    /// Whether `slice_data()` is parsed after each slice header. Hosts that
    /// forward slices to a hardware decoder only need the headers.
    pub parse_slice_data: bool,
    /// Whether emulation prevention bytes are removed while reading NAL
    /// units. Leave unset when the framer upstream already removed them.
    pub strip_emulation_prevention: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            verbosity: LevelFilter::Info,
            parse_slice_data: true,
            strip_emulation_prevention: false,
        }
    }
}

impl DecoderConfig {
    /// Width and height rounded up to whole macroblocks.
    pub fn coded_size(&self) -> (u32, u32) {
        (
            self.width.div_ceil(16).saturating_mul(16),
            self.height.div_ceil(16).saturating_mul(16),
        )
    }

    /// Number of macroblocks of the configured size, 0 if either dimension
    /// is unknown.
    pub fn pic_size_in_mbs(&self) -> usize {
        (self.width.div_ceil(16) as usize).saturating_mul(self.height.div_ceil(16) as usize)
    }
}
