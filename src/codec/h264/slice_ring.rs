// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;

use log::trace;

use crate::codec::h264::parser::SliceHeader;

/// Number of slice headers kept by a [`SliceRing`].
pub const MAX_SLICES: usize = 256;

/// Bounded history of the slice headers parsed so far, oldest first.
///
/// Once full, pushing a new header evicts the oldest one.
#[derive(Debug)]
pub struct SliceRing {
    headers: VecDeque<SliceHeader>,
}

impl Default for SliceRing {
    fn default() -> Self {
        Self {
            headers: VecDeque::with_capacity(MAX_SLICES),
        }
    }
}

impl SliceRing {
    pub fn push(&mut self, header: SliceHeader) {
        if self.headers.len() == MAX_SLICES {
            if let Some(evicted) = self.headers.pop_front() {
                trace!(
                    "Evicting slice header with first_mb_in_slice {}",
                    evicted.first_mb_in_slice
                );
            }
        }

        self.headers.push_back(header);
    }

    /// The most recently pushed header.
    pub fn head(&self) -> Option<&SliceHeader> {
        self.headers.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &SliceHeader> {
        self.headers.iter()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn clear(&mut self) {
        self.headers.clear();
    }
}
