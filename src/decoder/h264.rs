// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The H.264 syntax decoder: walks every NAL unit of an Annex-B buffer,
//! keeps the active parameter sets and the recent slice headers, and parses
//! the macroblocks of Intra CABAC slices.

use std::io::Cursor;
use std::rc::Rc;

use log::debug;
use log::trace;
use log::warn;
use log::Level;

use crate::codec::h264::cabac::CabacDecoder;
use crate::codec::h264::error::structural;
use crate::codec::h264::error::unsupported;
use crate::codec::h264::error::ErrorKind;
use crate::codec::h264::error::ParseResult;
use crate::codec::h264::macroblock::Macroblock;
use crate::codec::h264::macroblock::MacroblockArena;
use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::slice_data::parse_slice_data;
use crate::codec::h264::slice_ring::SliceRing;
use crate::decoder::DecoderConfig;

/// Whether `payload` holds the `00 00 03` emulation prevention pattern.
fn has_emulation_prevention(payload: &[u8]) -> bool {
    payload.windows(3).any(|w| w == [0x00, 0x00, 0x03])
}

/// Decoding state of one H.264 stream.
///
/// Calls to [`Decoder::decode`] must not overlap, which `&mut self` already
/// enforces within a thread.
pub struct Decoder {
    config: DecoderConfig,
    parser: Parser,
    cabac: CabacDecoder,
    macroblocks: MacroblockArena,
    slices: SliceRing,
}

impl Decoder {
    /// Creates a decoder, pre-sizing the macroblock storage when `config`
    /// carries a picture size.
    pub fn new(config: DecoderConfig) -> ParseResult<Self> {
        let mut macroblocks = MacroblockArena::default();
        macroblocks.resize(config.pic_size_in_mbs())?;

        debug!(
            "Created H.264 decoder for {}x{}, slice data {}",
            config.width,
            config.height,
            if config.parse_slice_data {
                "enabled"
            } else {
                "disabled"
            }
        );

        Ok(Self {
            parser: Parser::new(config.strip_emulation_prevention),
            cabac: CabacDecoder::new(),
            macroblocks,
            slices: SliceRing::default(),
            config,
        })
    }

    /// Forgets the active parameter sets, the slice headers and the content
    /// of every macroblock.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.slices.clear();
        self.macroblocks.clear();
    }

    fn log_enabled(&self, level: Level) -> bool {
        level <= self.config.verbosity
    }

    /// Processes every NAL unit in `buf`, calling `on_slice` for each coded
    /// slice once its header, and its data if enabled, have been parsed.
    ///
    /// A NAL unit that fails to parse is dropped and scanning resumes at the
    /// next start code. The first such error is returned once the whole
    /// buffer has been processed. Errors of the `on_slice` callback and
    /// resource errors stop the scan immediately instead.
    ///
    /// The decoder can keep being used afterwards unless the error is not
    /// [recoverable](crate::ParseError::is_recoverable).
    pub fn decode<F>(&mut self, buf: &[u8], mut on_slice: F) -> ParseResult<()>
    where
        F: FnMut(&Slice) -> anyhow::Result<()>,
    {
        let mut cursor = Cursor::new(buf);
        let mut first_error = None;

        loop {
            let (offset, err) = match Nalu::next(&mut cursor) {
                Ok(Some(nalu)) => {
                    let sc_offset = nalu.sc_offset();
                    match self.process_nalu(nalu, &mut on_slice) {
                        Ok(()) => continue,
                        Err(err) => (sc_offset, err),
                    }
                }
                Ok(None) => break,
                // The cursor already sits past the start code of the broken
                // header.
                Err(err) => (cursor.position() as usize, err),
            };

            if !err.is_recoverable() || err.kind() == ErrorKind::Callback {
                return Err(err);
            }

            warn!("Dropping NAL unit at byte {}: {}", offset, err);
            first_error.get_or_insert(err);
        }

        first_error.map_or(Ok(()), Err)
    }

    fn process_nalu<F>(&mut self, nalu: Nalu, on_slice: &mut F) -> ParseResult<()>
    where
        F: FnMut(&Slice) -> anyhow::Result<()>,
    {
        if self.log_enabled(Level::Debug) {
            debug!(
                "NAL unit {:?} (ref_idc {}) at offset {}, {} bytes",
                nalu.header.type_,
                nalu.header.ref_idc,
                nalu.sc_offset(),
                nalu.size()
            );
        }

        if !self.config.strip_emulation_prevention && has_emulation_prevention(nalu.payload()) {
            warn!(
                "NAL unit {:?} contains an emulation prevention pattern, which is read as is",
                nalu.header.type_
            );
        }

        match nalu.header.type_ {
            NaluType::Sps => {
                let sps = self.parser.parse_sps(&nalu)?;
                debug!(
                    "Activated SPS {}: profile_idc {}, {}x{}",
                    sps.seq_parameter_set_id,
                    sps.profile_idc,
                    sps.width(),
                    sps.height()
                );

                let configured = self.config.coded_size();
                if self.config.pic_size_in_mbs() != 0 && configured != (sps.width(), sps.height()) {
                    warn!(
                        "Stream size {}x{} differs from the configured {}x{}",
                        sps.width(),
                        sps.height(),
                        configured.0,
                        configured.1
                    );
                }
            }

            NaluType::Pps => {
                let pps = self.parser.parse_pps(&nalu)?;
                debug!(
                    "Activated PPS {}, entropy_coding_mode_flag {}",
                    pps.pic_parameter_set_id, pps.entropy_coding_mode_flag
                );
            }

            NaluType::Slice | NaluType::SliceIdr => self.process_slice(nalu, on_slice)?,

            NaluType::SliceDpa | NaluType::SliceDpb | NaluType::SliceDpc => {
                unsupported!("Data partitioning (NAL unit {:?})", nalu.header.type_)
            }

            other if other.is_extension() => {
                unsupported!("NAL unit type {} of the H.264 extensions", nalu.header.nal_unit_type)
            }

            other => debug!("Skipping NAL unit type {:?}", other),
        }

        Ok(())
    }

    fn process_slice<F>(&mut self, nalu: Nalu, on_slice: &mut F) -> ParseResult<()>
    where
        F: FnMut(&Slice) -> anyhow::Result<()>,
    {
        let (slice, mut r) = self.parser.parse_slice(nalu)?;
        let header = &slice.header;

        if self.config.parse_slice_data {
            let pps = match self.parser.pps() {
                Some(pps) => pps,
                None => structural!("Slice data without an active PPS"),
            };

            self.macroblocks.resize(header.pic_size_in_mbs as usize)?;
            let num_mbs = parse_slice_data(
                &mut r,
                header,
                pps,
                &mut self.cabac,
                self.macroblocks.as_mut_slice(),
            )?;

            debug!(
                "Parsed {} macroblocks from address {}",
                num_mbs, header.first_mb_in_slice
            );

            if self.log_enabled(Level::Trace) {
                let first = header.first_mb_in_slice as usize;
                let decoded = self.macroblocks.as_slice().iter().enumerate();
                for (addr, mb) in decoded.skip(first).take(num_mbs) {
                    trace!(
                        "MB {}: mb_type {} cbp {}/{} mb_qp_delta {} QPY {}",
                        addr,
                        mb.mb_type,
                        mb.coded_block_pattern_luma,
                        mb.coded_block_pattern_chroma,
                        mb.mb_qp_delta,
                        mb.qp_y
                    );
                }
            }
        }

        on_slice(&slice)?;
        self.slices.push(slice.header);

        Ok(())
    }

    pub fn sps(&self) -> Option<&Rc<Sps>> {
        self.parser.sps()
    }

    pub fn pps(&self) -> Option<&Rc<Pps>> {
        self.parser.pps()
    }

    /// The most recent slice headers, oldest first.
    pub fn slice_headers(&self) -> &SliceRing {
        &self.slices
    }

    /// Macroblocks of the current picture, indexed by address.
    pub fn macroblocks(&self) -> &[Macroblock] {
        self.macroblocks.as_slice()
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }
}
