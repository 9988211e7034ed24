// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::Debug;
use std::io::Cursor;
use std::ops::Range;

use bytes::Buf;
use enumn::N;

use crate::codec::h264::error::structural;
use crate::codec::h264::error::ParseResult;

/// NAL unit types, see table 7-1 in the specification.
#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl NaluType {
    /// Whether this type belongs to the MVC/SVC/3D extensions (Annexes G, H
    /// and J), which are not handled here.
    pub fn is_extension(&self) -> bool {
        matches!(
            self,
            NaluType::PrefixUnit | NaluType::SliceExt | NaluType::SliceDepth
        )
    }
}

/// The one byte `nal_unit_header()` of a NAL unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    /// `nal_unit_type` as found in the stream. Reserved and unspecified
    /// values map to [`NaluType::Unknown`] in `type_`.
    pub nal_unit_type: u8,
    pub idr_pic_flag: bool,
}

impl NaluHeader {
    /// Parses the header byte. The forbidden zero bit must be unset.
    pub fn parse(byte: u8) -> ParseResult<Self> {
        if byte & 0x80 != 0 {
            structural!("forbidden_zero_bit is set in NAL header {:#04x}", byte);
        }

        let nal_unit_type = byte & 0x1f;
        let type_ = NaluType::n(nal_unit_type).unwrap_or(NaluType::Unknown);

        Ok(NaluHeader {
            ref_idc: (byte & 0x60) >> 5,
            type_,
            nal_unit_type,
            idr_pic_flag: matches!(type_, NaluType::SliceIdr),
        })
    }

    /// Whether this header type indicates EOS.
    pub fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::SeqEnd | NaluType::StreamEnd)
    }

    /// The length of the header.
    pub fn len(&self) -> usize {
        1
    }
}

/// A NAL unit located inside a borrowed Annex-B buffer.
#[derive(Debug, Clone)]
pub struct Nalu<'a> {
    pub header: NaluHeader,
    /// The whole buffer the NAL unit was found in.
    data: &'a [u8],
    /// Size of the NAL unit, header included.
    size: usize,
    /// Offset of the NAL unit header in `data`.
    offset: usize,
    /// Offset of the start code in `data`.
    sc_offset: usize,
}

impl<'a> Nalu<'a> {
    fn find_start_code(data: &[u8], offset: usize) -> Option<usize> {
        // discard all zeroes until the start code pattern is found
        data.get(offset..)?
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01])
    }

    /// Finds the next Annex B encoded NAL unit, starting at the cursor's
    /// position. On success the cursor is left right past the header of the
    /// returned unit.
    ///
    /// Returns `None` once no further start code exists in the buffer.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> ParseResult<Option<Nalu<'a>>> {
        let bitstream: &'a [u8] = *cursor.get_ref();
        let pos = usize::try_from(cursor.position()).unwrap_or(bitstream.len());

        // Find the start code for this NALU
        let current_nalu_offset = match Nalu::find_start_code(bitstream, pos) {
            Some(offset) => offset,
            None => {
                cursor.set_position(bitstream.len() as u64);
                return Ok(None);
            }
        };

        let mut start_code_offset = pos + current_nalu_offset;

        // If the preceding byte is 00, then we actually have a four byte SC,
        // i.e. 00 00 00 01 Where the first 00 is the "zero_byte()"
        if start_code_offset > 0 && bitstream[start_code_offset - 1] == 0x00 {
            start_code_offset -= 1;
        }

        // The NALU offset is its offset + 3 bytes to skip the start code.
        let nalu_offset = pos + current_nalu_offset + 3;

        cursor.set_position(nalu_offset as u64);
        if !cursor.has_remaining() {
            // A start code at the very end of the buffer carries nothing.
            return Ok(None);
        }

        let header = NaluHeader::parse(cursor.chunk()[0])?;
        cursor.advance(header.len());

        // Find the start of the subsequent NALU.
        let payload_offset = nalu_offset + header.len();
        let mut next_nalu_offset = match Nalu::find_start_code(bitstream, payload_offset) {
            Some(offset) => offset + header.len(),
            // Whatever data is left must be part of the current NALU
            None => bitstream.len() - nalu_offset,
        };

        while next_nalu_offset > header.len()
            && bitstream[nalu_offset + next_nalu_offset - 1] == 0x00
        {
            // Discard trailing_zero_8bits
            next_nalu_offset -= 1;
        }

        let size = if header.is_end() {
            header.len()
        } else {
            next_nalu_offset
        };

        Ok(Some(Nalu {
            header,
            data: bitstream,
            size,
            offset: nalu_offset,
            sc_offset: start_code_offset,
        }))
    }

    /// Get a reference to the whole buffer this unit was found in.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Size of the unit, header included.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of the unit header inside [`Self::data`].
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Offset of the start code inside [`Self::data`].
    pub fn sc_offset(&self) -> usize {
        self.sc_offset
    }

    /// The `[start, end)` range of the RBSP payload in [`Self::data`], i.e.
    /// excluding the start code and the header byte.
    pub fn payload_range(&self) -> Range<usize> {
        self.offset + self.header.len()..self.offset + self.size
    }

    /// The payload following the header byte.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.payload_range()]
    }
}

impl<'a> AsRef<[u8]> for Nalu<'a> {
    /// The unit including its header byte, without the start code.
    fn as_ref(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }
}
