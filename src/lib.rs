// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parser for H.264 Annex-B byte streams.
//!
//! [`Decoder`] extracts the parameter sets and slice headers a hardware
//! decoder needs, and fully parses the macroblock syntax of Intra slices coded
//! with CABAC. The lower level parsers live under [`codec::h264`].

pub mod codec;
pub mod decoder;

pub use codec::h264::error::ErrorKind;
pub use codec::h264::error::ParseError;
pub use decoder::h264::Decoder;
pub use decoder::DecoderConfig;
