// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod cabac;
pub mod cabac_tables;
pub mod error;
pub mod macroblock;
pub mod nalu;
pub mod nalu_reader;
#[cfg(test)]
pub mod nalu_writer;
pub mod neighbors;
pub mod parser;
pub mod slice_data;
pub mod slice_ring;
#[cfg(test)]
pub mod synthesizer;
