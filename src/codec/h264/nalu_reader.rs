// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;

use bytes::Buf;
use thiserror::Error;

/// A bit reader over the RBSP of a single NAL unit.
///
/// By default the bytes are consumed exactly as they appear in the buffer. Use
/// [`NaluReader::with_emulation_prevention`] to have `00 00 03` sequences
/// collapsed back to `00 00` while reading.
pub struct NaluReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_bytes.
    curr_byte: u32,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// Used in epb detection.
    prev_two_bytes: u32,
    /// Number of epbs (i.e. 0x000003) removed so far.
    num_epb: usize,
    /// Whether emulation-prevention bytes are dropped while reading.
    strip_epb: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GetByteError {
    #[error("reader ran out of bits")]
    OutOfBits,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadBitsError {
    #[error("more than 31 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("failed to advance the current byte")]
    GetByte(#[from] GetByteError),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
    #[error("invalid Exp-Golomb code")]
    InvalidExpGolomb,
    #[error("value {value} out of bounds, expected {min}..={max}")]
    OutOfBounds { value: i64, min: i64, max: i64 },
}

pub type ReadBitsResult<T> = std::result::Result<T, ReadBitsError>;

impl<'a> NaluReader<'a> {
    /// Creates a reader that does not touch emulation-prevention bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            prev_two_bytes: 0xffff,
            num_epb: Default::default(),
            strip_epb: false,
        }
    }

    /// Creates a reader that drops emulation-prevention bytes.
    pub fn with_emulation_prevention(data: &'a [u8]) -> Self {
        Self {
            strip_epb: true,
            ..Self::new(data)
        }
    }

    /// Read a single bit from the stream. Corresponds to `u(1)`.
    pub fn read_bit(&mut self) -> ReadBitsResult<bool> {
        let bit = self.read_bits::<u32>(1)?;
        Ok(bit == 1)
    }

    /// Read up to 31 bits from the stream, most significant bit first.
    /// Corresponds to `u(n)`.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> ReadBitsResult<U> {
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= self.curr_byte << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;

        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> ReadBitsResult<()> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 31);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Discards the unread bits of the current byte.
    pub fn byte_align(&mut self) {
        self.num_remaining_bits_in_curr_byte = 0;
    }

    /// Whether the next bit to be read is the first bit of a byte.
    pub fn is_aligned(&self) -> bool {
        self.num_remaining_bits_in_curr_byte == 0
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Returns the number of emulation-prevention bytes removed so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    /// Whether the stream still has RBSP data. Implements more_rbsp_data().
    ///
    /// Returns false when nothing but the `rbsp_stop_one_bit` and zero bits
    /// are left until the end of the data.
    pub fn has_more_rbsp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.update_curr_byte().is_err() {
            // no more data at all in the rbsp
            return false;
        }

        // If the next bit is the stop bit, then we should only see unset bits
        // until the end of the data.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        if self.data.chunk().iter().any(|byte| *byte != 0) {
            return true;
        }

        self.data.advance(self.data.remaining());
        false
    }

    /// Whether every bit left is zero. Used once the last syntax element
    /// (and its stop bit) has been consumed, where only alignment bits and
    /// `cabac_zero_word`s may follow.
    pub fn only_zeros_left(&self) -> bool {
        let mask = (1u32 << self.num_remaining_bits_in_curr_byte) - 1;
        if self.curr_byte & mask != 0 {
            return false;
        }

        let mut zeros = 0;
        for byte in self.data.chunk() {
            match *byte {
                0x00 => zeros += 1,
                0x03 if self.strip_epb && zeros >= 2 => zeros = 0,
                _ => return false,
            }
        }

        true
    }

    /// Reads an unsigned Exp-Golomb code. Corresponds to `ue(v)`.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> ReadBitsResult<U> {
        let mut num_bits = 0;
        let mut bit = self.read_bits::<u32>(1)?;

        while bit == 0 {
            num_bits += 1;
            bit = self.read_bits(1)?;
        }

        if num_bits > 31 {
            return Err(ReadBitsError::InvalidExpGolomb);
        }

        let mut value = (1 << num_bits) - 1;
        let rest;

        // Check for overflow
        if num_bits == 31 {
            rest = self.read_bits::<u32>(num_bits)?;
            if rest == 0 {
                return U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed);
            } else {
                return Err(ReadBitsError::InvalidExpGolomb);
            }
        }

        if num_bits > 0 {
            value += self.read_bits::<u32>(num_bits)?;
        }

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(&mut self, min: u32, max: u32) -> ReadBitsResult<U> {
        let ue = self.read_ue()?;
        if ue > max || ue < min {
            Err(ReadBitsError::OutOfBounds {
                value: i64::from(ue),
                min: i64::from(min),
                max: i64::from(max),
            })
        } else {
            U::try_from(ue).map_err(|_| ReadBitsError::ConversionFailed)
        }
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> ReadBitsResult<U> {
        self.read_ue_bounded(0, max)
    }

    /// Reads a signed Exp-Golomb code. Corresponds to `se(v)`.
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> ReadBitsResult<U> {
        let ue = i64::from(self.read_ue::<u32>()?);

        let se = if ue % 2 == 0 { -ue / 2 } else { ue / 2 + 1 };
        let se = i32::try_from(se).map_err(|_| ReadBitsError::ConversionFailed)?;

        U::try_from(se).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(&mut self, min: i32, max: i32) -> ReadBitsResult<U> {
        let se = self.read_se()?;
        if se < min || se > max {
            Err(ReadBitsError::OutOfBounds {
                value: i64::from(se),
                min: i64::from(min),
                max: i64::from(max),
            })
        } else {
            U::try_from(se).map_err(|_| ReadBitsError::ConversionFailed)
        }
    }

    fn get_byte(&mut self) -> Result<u8, GetByteError> {
        if self.data.remaining() == 0 {
            return Err(GetByteError::OutOfBits);
        }

        Ok(self.data.get_u8())
    }

    fn update_curr_byte(&mut self) -> Result<(), GetByteError> {
        let mut byte = self.get_byte()?;

        if self.strip_epb && (self.prev_two_bytes & 0xffff) == 0 && byte == 0x03 {
            // We found an epb
            self.num_epb += 1;
            // Read another byte
            byte = self.get_byte()?;
            // We need another 3 bytes before another epb can happen.
            self.prev_two_bytes = 0xffff;
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.prev_two_bytes = ((self.prev_two_bytes & 0xff) << 8) | u32::from(byte);

        self.curr_byte = u32::from(byte);
        Ok(())
    }
}
