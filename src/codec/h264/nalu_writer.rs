// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-level writer for Annex-B NAL units, used to build test streams.

/// Appends NAL units to a byte buffer, MSB first.
///
/// Pending bits are padded with zeros when the writer is dropped or a new
/// NAL unit header is written.
pub struct NaluWriter<'a> {
    out: &'a mut Vec<u8>,
    curr_byte: u8,
    num_bits: u8,
    emulation_prevention: bool,
    /// Zero bytes ending the payload written so far.
    num_zeros: usize,
}

impl<'a> NaluWriter<'a> {
    /// Creates a writer appending to `out`. With `emulation_prevention` set,
    /// `00 00 03` is inserted wherever the payload would otherwise contain
    /// `00 00 0x` with `x <= 3`.
    pub fn new(out: &'a mut Vec<u8>, emulation_prevention: bool) -> Self {
        Self {
            out,
            curr_byte: 0,
            num_bits: 0,
            emulation_prevention,
            num_zeros: 0,
        }
    }

    fn push_byte(&mut self, byte: u8) {
        if self.emulation_prevention && self.num_zeros >= 2 && byte <= 0x03 {
            self.out.push(0x03);
            self.num_zeros = 0;
        }

        self.out.push(byte);
        self.num_zeros = if byte == 0 { self.num_zeros + 1 } else { 0 };
    }

    fn flush(&mut self) {
        if self.num_bits != 0 {
            self.push_byte(self.curr_byte);
            self.curr_byte = 0;
            self.num_bits = 0;
        }
    }

    /// Terminates the current NAL unit, if any, and starts a new one with a
    /// four byte start code.
    pub fn write_header(&mut self, ref_idc: u8, nal_unit_type: u8) {
        self.flush();

        let header = (ref_idc & 0x3) << 5 | (nal_unit_type & 0x1f);
        self.out.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, header]);
        self.num_zeros = 0;
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.curr_byte |= u8::from(bit) << (7 - self.num_bits);
        self.num_bits += 1;

        if self.num_bits == 8 {
            let byte = self.curr_byte;
            self.curr_byte = 0;
            self.num_bits = 0;
            self.push_byte(byte);
        }
    }

    /// `u(n)` with `n` up to 32.
    pub fn write_u<T: Into<u32>>(&mut self, bits: usize, value: T) {
        assert!(bits <= 32, "cannot write {} bits at once", bits);
        let value = value.into();

        for bit in (0..bits).rev() {
            self.write_bit((value >> bit) & 1 == 1);
        }
    }

    /// `ue(v)`
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) {
        let code_num = u64::from(value.into()) + 1;
        let len = 64 - code_num.leading_zeros() as usize;

        for _ in 1..len {
            self.write_bit(false);
        }
        for bit in (0..len).rev() {
            self.write_bit((code_num >> bit) & 1 == 1);
        }
    }

    /// `se(v)`
    pub fn write_se<T: Into<i32>>(&mut self, value: T) {
        let value = value.into();
        let magnitude = value.unsigned_abs();

        if value > 0 {
            self.write_ue(2 * magnitude - 1);
        } else {
            self.write_ue(2 * magnitude);
        }
    }

    pub fn is_aligned(&self) -> bool {
        self.num_bits == 0
    }

    /// Pads with `bit` up to the next byte boundary.
    pub fn align_with(&mut self, bit: bool) {
        while !self.is_aligned() {
            self.write_bit(bit);
        }
    }

    /// `rbsp_trailing_bits()`
    pub fn write_trailing_bits(&mut self) {
        self.write_bit(true);
        self.align_with(false);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.write_u(8, *byte);
        }
    }
}

impl Drop for NaluWriter<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::nalu_reader::NaluReader;

    fn written(f: impl FnOnce(&mut NaluWriter)) -> Vec<u8> {
        let mut buf = Vec::new();
        f(&mut NaluWriter::new(&mut buf, false));
        buf
    }

    #[test]
    fn exp_golomb_codes() {
        assert_eq!(written(|w| w.write_ue(0u32)), [0b1000_0000]);
        assert_eq!(written(|w| w.write_ue(3u32)), [0b0010_0000]);
        assert_eq!(written(|w| w.write_ue(8u32)), [0b0001_0010]);
        assert_eq!(written(|w| w.write_se(-2)), [0b0010_1000]);
        assert_eq!(written(|w| w.write_se(2)), [0b0011_0000]);

        let buf = written(|w| {
            w.write_ue(65_535u32);
            w.write_se(-402);
            w.write_se(100_000);
        });
        let mut r = NaluReader::new(&buf);
        assert_eq!(r.read_ue::<u32>().unwrap(), 65_535);
        assert_eq!(r.read_se::<i32>().unwrap(), -402);
        assert_eq!(r.read_se::<i32>().unwrap(), 100_000);
    }

    #[test]
    fn headers_and_trailing_bits() {
        let buf = written(|w| {
            w.write_header(3, 7);
            w.write_u(8, 77u8);
            w.write_ue(1u32);
            w.write_trailing_bits();
            w.write_header(0, 9);
            w.write_u(3, 0b010u8);
            w.align_with(true);
        });

        assert_eq!(
            buf,
            [
                0x00, 0x00, 0x00, 0x01, 0x67, 77, 0b0101_0000, 0x00, 0x00, 0x00, 0x01, 0x09,
                0b0101_1111,
            ]
        );
    }

    #[test]
    fn emulation_prevention() {
        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::new(&mut buf, true);
            w.write_header(0, 12);
            w.write_bytes(&[0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x04]);
        }

        assert_eq!(
            buf[5..],
            [0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x00, 0x04]
        );

        let mut r = NaluReader::with_emulation_prevention(&buf[5..]);
        for byte in [0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x04] {
            assert_eq!(r.read_bits::<u8>(8).unwrap(), byte);
        }
    }
}
