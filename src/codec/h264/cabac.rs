// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The CABAC arithmetic decoding engine, clause 9.3.1.2 and 9.3.3.2 of ITU-T
//! H.264.

use log::trace;

use crate::codec::h264::cabac_tables::INIT_MN_I;
use crate::codec::h264::cabac_tables::NUM_CTX;
use crate::codec::h264::cabac_tables::RANGE_TAB_LPS;
use crate::codec::h264::cabac_tables::TRANS_IDX_LPS;
use crate::codec::h264::cabac_tables::TRANS_IDX_MPS;
use crate::codec::h264::error::structural;
use crate::codec::h264::error::unsupported;
use crate::codec::h264::error::ParseResult;
use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::parser::SliceType;

/// First `ctxIdx` of the syntax elements decoded in I slices, table 9-34.
pub mod ctx {
    pub const MB_TYPE_I: usize = 3;
    pub const MB_QP_DELTA: usize = 60;
    pub const INTRA_CHROMA_PRED_MODE: usize = 64;
    pub const PREV_INTRA_PRED_MODE_FLAG: usize = 68;
    pub const REM_INTRA_PRED_MODE: usize = 69;
    pub const CODED_BLOCK_PATTERN_LUMA: usize = 73;
    pub const CODED_BLOCK_PATTERN_CHROMA: usize = 77;
    pub const END_OF_SLICE: usize = 276;
    pub const TRANSFORM_SIZE_8X8_FLAG: usize = 399;
}

/// Probability state of a single context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextState {
    /// `pStateIdx`
    pub state: u8,
    /// `valMPS`
    pub mps: bool,
}

impl ContextState {
    /// Clause 9.3.1.1 for a given `(m, n)` pair and `SliceQPY`.
    pub fn new((m, n): (i8, i8), slice_qp_y: i32) -> Self {
        let qp = slice_qp_y.clamp(0, 51);
        let pre_ctx_state = (((i32::from(m) * qp) >> 4) + i32::from(n)).clamp(1, 126);

        if pre_ctx_state <= 63 {
            Self {
                state: (63 - pre_ctx_state) as u8,
                mps: false,
            }
        } else {
            Self {
                state: (pre_ctx_state - 64) as u8,
                mps: true,
            }
        }
    }
}

/// Initializes the contexts of an I slice.
fn init_table(slice_qp_y: i32) -> [ContextState; NUM_CTX] {
    let mut contexts = [ContextState::default(); NUM_CTX];
    for (ctx, mn) in contexts.iter_mut().zip(INIT_MN_I.iter()) {
        *ctx = ContextState::new(*mn, slice_qp_y);
    }

    contexts
}

/// CABAC decoding engine state: `codIRange`, `codIOffset` and the context
/// table. The engine does not own the bitstream, every decoding call takes
/// the reader positioned inside `slice_data()`.
pub struct CabacDecoder {
    contexts: [ContextState; NUM_CTX],
    range: u32,
    offset: u32,
}

impl Default for CabacDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CabacDecoder {
    pub fn new() -> Self {
        Self {
            contexts: [ContextState::default(); NUM_CTX],
            range: 510,
            offset: 0,
        }
    }

    /// Initializes every context for a slice of type `slice_type` using
    /// `SliceQPY`.
    ///
    /// Only the I slice tables are provided. Other slice types are reported
    /// as unsupported.
    pub fn init_contexts(&mut self, slice_type: SliceType, slice_qp_y: i32) -> ParseResult<()> {
        if !slice_type.is_i() {
            unsupported!("CABAC context initialization for {:?} slices", slice_type);
        }

        self.contexts = init_table(slice_qp_y);
        trace!("CABAC contexts initialized with SliceQPY {}", slice_qp_y);
        Ok(())
    }

    /// Initializes the arithmetic decoding engine, clause 9.3.1.2. Must be
    /// called at the start of the slice data and after PCM samples.
    pub fn init_decoder(&mut self, r: &mut NaluReader) -> ParseResult<()> {
        self.range = 510;
        self.offset = r.read_bits(9)?;

        if self.offset >= 510 {
            structural!("codIOffset {} at CABAC initialization", self.offset);
        }

        Ok(())
    }

    pub fn range(&self) -> u32 {
        self.range
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn context(&self, ctx_idx: usize) -> ContextState {
        self.contexts[ctx_idx]
    }

    /// DecodeDecision, clause 9.3.3.2.1.
    pub fn decode_decision(&mut self, r: &mut NaluReader, ctx_idx: usize) -> ParseResult<bool> {
        let ctx = &mut self.contexts[ctx_idx];
        let q_range_idx = ((self.range >> 6) & 3) as usize;
        let range_lps = u32::from(RANGE_TAB_LPS[usize::from(ctx.state)][q_range_idx]);

        self.range -= range_lps;

        let bin = if self.offset >= self.range {
            let bin = !ctx.mps;
            self.offset -= self.range;
            self.range = range_lps;

            if ctx.state == 0 {
                ctx.mps = !ctx.mps;
            }
            ctx.state = TRANS_IDX_LPS[usize::from(ctx.state)];
            bin
        } else {
            ctx.state = TRANS_IDX_MPS[usize::from(ctx.state)];
            ctx.mps
        };

        self.renormalize(r)?;
        Ok(bin)
    }

    /// DecodeBypass, clause 9.3.3.2.3.
    pub fn decode_bypass(&mut self, r: &mut NaluReader) -> ParseResult<bool> {
        self.offset = (self.offset << 1) | u32::from(r.read_bit()?);

        if self.offset >= self.range {
            self.offset -= self.range;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// DecodeTerminate, clause 9.3.3.2.2.
    ///
    /// When this returns `true` the reader is positioned right after the last
    /// bit used by the engine, i.e. after `rbsp_stop_one_bit` for the end of
    /// a slice, or right before `pcm_alignment_zero_bit` for I_PCM.
    pub fn decode_terminate(&mut self, r: &mut NaluReader) -> ParseResult<bool> {
        self.range -= 2;

        if self.offset >= self.range {
            Ok(true)
        } else {
            self.renormalize(r)?;
            Ok(false)
        }
    }

    /// RenormD, clause 9.3.3.2.2.
    fn renormalize(&mut self, r: &mut NaluReader) -> ParseResult<()> {
        while self.range < 256 {
            self.range <<= 1;
            self.offset = (self.offset << 1) | u32::from(r.read_bit()?);
        }

        Ok(())
    }
}
