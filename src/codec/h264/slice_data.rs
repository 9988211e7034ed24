// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CABAC parsing of `slice_data()` for I slices: the macroblock layer and
//! `residual_block_cabac()`, clauses 7.3.4, 7.3.5 and 9.3.3.1.

use crate::codec::h264::cabac::ctx;
use crate::codec::h264::cabac::CabacDecoder;
use crate::codec::h264::cabac_tables::LAST_SIG_COEFF_FLAG_8X8;
use crate::codec::h264::cabac_tables::SIG_COEFF_FLAG_8X8_FRAME;
use crate::codec::h264::error::structural;
use crate::codec::h264::error::unsupported;
use crate::codec::h264::error::ParseResult;
use crate::codec::h264::macroblock::Macroblock;
use crate::codec::h264::macroblock::MbPredMode;
use crate::codec::h264::macroblock::ResidualBlock;
use crate::codec::h264::macroblock::I_NXN;
use crate::codec::h264::macroblock::I_PCM;
use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::neighbors::MbLocator;
use crate::codec::h264::neighbors::Neighbor;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::SliceHeader;

/// `ctxBlockCat` of the luma-like blocks of each colour plane: DC, AC, 4x4
/// and 8x8. Table 9-42.
const PLANE_BLOCK_CATS: [[usize; 4]; 3] = [[0, 1, 2, 5], [6, 7, 8, 9], [10, 11, 12, 13]];
const CHROMA_DC_CAT: usize = 3;
const CHROMA_AC_CAT: usize = 4;

/// Longest Exp-Golomb prefix accepted in the suffix of
/// `coeff_abs_level_minus1`. Enough for any level allowed at 14 bits.
const MAX_ABS_LEVEL_SUFFIX_PREFIX: u32 = 22;

/// First `ctxIdx` of `coded_block_flag`, `significant_coeff_flag`,
/// `last_significant_coeff_flag` and `coeff_abs_level_minus1` for a block of
/// category `cat` in a frame macroblock. This is `ctxIdxOffset` plus
/// `ctxBlockCatOffset`, tables 9-34 and 9-40.
fn residual_ctx_base(cat: usize) -> [usize; 4] {
    const CBF_CAT_OFFSET: [usize; 14] = [0, 4, 8, 12, 16, 0, 0, 4, 8, 4, 0, 4, 8, 8];
    const SIG_CAT_OFFSET: [usize; 14] = [0, 15, 29, 44, 47, 0, 0, 15, 29, 0, 0, 15, 29, 0];
    const ABS_CAT_OFFSET: [usize; 14] = [0, 10, 20, 30, 39, 0, 0, 10, 20, 0, 0, 10, 20, 0];

    let (cbf, sig, last, abs) = match cat {
        0..=4 => (85, 105, 166, 227),
        5 => (1012, 402, 417, 426),
        6..=8 => (460, 484, 572, 952),
        9 => (1012, 660, 690, 708),
        10..=12 => (472, 528, 616, 982),
        _ => (1012, 718, 748, 766),
    };

    [
        cbf + CBF_CAT_OFFSET[cat],
        sig + SIG_CAT_OFFSET[cat],
        last + SIG_CAT_OFFSET[cat],
        abs + ABS_CAT_OFFSET[cat],
    ]
}

/// A transform block whose `coded_block_flag` context depends on its
/// neighbours, clause 9.3.3.1.1.9.
#[derive(Debug, Clone, Copy)]
enum BlockRef {
    /// `Intra16x16DCLevel` of a plane.
    Dc,
    /// 4x4 block of a plane, AC or not.
    Luma4x4(usize),
    Luma8x8(usize),
    /// `ChromaDCLevel` of Cb (0) or Cr (1).
    ChromaDc(usize),
    /// `ChromaACLevel` block of Cb (0) or Cr (1).
    ChromaAc(usize, usize),
}

/// The already decoded macroblocks of the slice as seen from `curr`.
///
/// `done` holds every address below `curr`. The macroblock being parsed is
/// passed separately to each query since it is mutably borrowed by the
/// parser.
struct Neighborhood<'m> {
    done: &'m [Macroblock],
    curr: usize,
    first_mb: usize,
    locator: MbLocator,
    mb_width_c: i32,
    mb_height_c: i32,
}

impl<'m> Neighborhood<'m> {
    fn get<'s>(&'s self, mb: &'s Macroblock, addr: usize) -> Option<&'s Macroblock> {
        if addr == self.curr {
            Some(mb)
        } else {
            self.done.get(addr)
        }
    }

    fn mb_addr(&self, n: Neighbor) -> Option<usize> {
        match n {
            Neighbor::A => self.locator.mb_a(self.curr),
            Neighbor::B => self.locator.mb_b(self.curr),
        }
    }

    fn neighbor<'s>(&'s self, mb: &'s Macroblock, n: Neighbor) -> Option<&'s Macroblock> {
        self.mb_addr(n).and_then(|addr| self.get(mb, addr))
    }

    /// The previous macroblock in decoding order, if part of this slice.
    fn prev(&self) -> Option<&Macroblock> {
        self.curr
            .checked_sub(1)
            .filter(|addr| *addr >= self.first_mb)
            .and_then(|addr| self.done.get(addr))
    }

    /// `condTermFlagA + condTermFlagB` where a flag is set if the neighbouring
    /// macroblock is available and satisfies `cond`.
    fn count(&self, mb: &Macroblock, cond: impl Fn(&Macroblock) -> bool) -> usize {
        [Neighbor::A, Neighbor::B]
            .into_iter()
            .filter(|n| self.neighbor(mb, *n).map_or(false, &cond))
            .count()
    }

    /// `ctxIdxInc` of bin `bin` of the chroma prefix of
    /// `coded_block_pattern`, clause 9.3.3.1.1.4.
    fn cbp_chroma_inc(&self, mb: &Macroblock, bin: usize) -> usize {
        let cond = |n| {
            self.neighbor(mb, n).map_or(0, |m: &Macroblock| {
                let coded = match bin {
                    0 => m.coded_block_pattern_chroma != 0,
                    _ => m.coded_block_pattern_chroma == 2,
                };
                usize::from(m.is_pcm() || coded)
            })
        };

        cond(Neighbor::A) + 2 * cond(Neighbor::B)
    }

    /// `ctxIdxInc` of the luma prefix bin of 8x8 block `b8` of
    /// `coded_block_pattern`, clause 9.3.3.1.1.4. `mb` carries the bits
    /// decoded so far.
    fn cbp_luma_inc(&self, mb: &Macroblock, b8: usize) -> usize {
        let cond = |n| match self.locator.luma8x8(self.curr, b8, n) {
            Some((addr, b8_n)) => match self.get(mb, addr) {
                Some(m) if !m.is_pcm() => usize::from((m.coded_block_pattern_luma >> b8_n) & 1 == 0),
                _ => 0,
            },
            None => 0,
        };

        cond(Neighbor::A) + 2 * cond(Neighbor::B)
    }

    /// `ctxIdxInc` of `coded_block_flag`, clause 9.3.3.1.1.9, for the
    /// colour plane `plane` of an intra macroblock.
    fn coded_block_flag_inc(&self, mb: &Macroblock, block: BlockRef, plane: usize) -> usize {
        self.coded_block_cond(mb, block, plane, Neighbor::A)
            + 2 * self.coded_block_cond(mb, block, plane, Neighbor::B)
    }

    fn coded_block_cond(&self, mb: &Macroblock, block: BlockRef, plane: usize, n: Neighbor) -> usize {
        let located = match block {
            BlockRef::Dc | BlockRef::ChromaDc(_) => self.mb_addr(n).map(|addr| (addr, 0)),
            BlockRef::Luma4x4(blk) => self.locator.luma4x4(self.curr, blk, n),
            BlockRef::Luma8x8(blk) => self.locator.luma8x8(self.curr, blk, n),
            BlockRef::ChromaAc(_, blk) => {
                self.locator
                    .chroma4x4(self.curr, blk, n, self.mb_width_c, self.mb_height_c)
            }
        };

        // An intra macroblock treats missing neighbours as coded.
        let (m, blk_n) = match located.and_then(|(addr, blk_n)| Some((self.get(mb, addr)?, blk_n))) {
            Some(found) => found,
            None => return 1,
        };

        if m.is_pcm() {
            return 1;
        }

        let p = match m.plane(plane) {
            Some(p) => p,
            None => return 0,
        };
        let cbp_luma_set = |b8: usize| (m.coded_block_pattern_luma >> b8) & 1 != 0;
        let coded = match block {
            BlockRef::Dc => m.is_intra16x16() && p.dc.coded_block_flag,
            BlockRef::Luma4x4(_) => {
                cbp_luma_set(blk_n / 4)
                    && if m.transform_size_8x8_flag {
                        p.blocks8x8[blk_n / 4].coded_block_flag
                    } else {
                        p.blocks4x4[blk_n].coded_block_flag
                    }
            }
            BlockRef::Luma8x8(_) => {
                cbp_luma_set(blk_n)
                    && m.transform_size_8x8_flag
                    && p.blocks8x8[blk_n].coded_block_flag
            }
            BlockRef::ChromaDc(c) => {
                m.coded_block_pattern_chroma != 0 && m.chroma_dc[c].coded_block_flag
            }
            BlockRef::ChromaAc(c, _) => {
                m.coded_block_pattern_chroma == 2 && m.chroma_ac[c][blk_n].coded_block_flag
            }
        };

        usize::from(coded)
    }
}

/// Parses the macroblocks of one slice. Holds what stays constant across
/// the slice.
struct MacroblockParser<'a, 'r> {
    r: &'a mut NaluReader<'r>,
    cabac: &'a mut CabacDecoder,
    pps: &'a Pps,
    chroma_array_type: u8,
    /// `NumC8x8`
    num_c8x8: usize,
    /// `QPY,PRED`: `QPY` of the previous macroblock.
    qp_y: i32,
}

impl<'a, 'r> MacroblockParser<'a, 'r> {
    fn decision(&mut self, ctx_idx: usize) -> ParseResult<bool> {
        self.cabac.decode_decision(self.r, ctx_idx)
    }

    /// `mb_type` in an I slice, binarization of table 9-36.
    fn mb_type(&mut self, nb: &Neighborhood, mb: &Macroblock) -> ParseResult<u8> {
        let inc = nb.count(mb, |m| m.mb_type != I_NXN);
        if !self.decision(ctx::MB_TYPE_I + inc)? {
            return Ok(I_NXN);
        }

        if self.cabac.decode_terminate(self.r)? {
            return Ok(I_PCM);
        }

        let luma = self.decision(ctx::MB_TYPE_I + 3)?;
        let chroma = if self.decision(ctx::MB_TYPE_I + 4)? {
            1 + u8::from(self.decision(ctx::MB_TYPE_I + 5)?)
        } else {
            0
        };
        let pred_mode = 2 * u8::from(self.decision(ctx::MB_TYPE_I + 6)?)
            + u8::from(self.decision(ctx::MB_TYPE_I + 7)?);

        Ok(1 + pred_mode + 4 * chroma + 12 * u8::from(luma))
    }

    fn pcm_samples(&mut self, mb: &mut Macroblock) -> ParseResult<()> {
        while !self.r.is_aligned() {
            if self.r.read_bit()? {
                structural!("pcm_alignment_zero_bit is not zero");
            }
        }

        let sps = &self.pps.sps;
        let (mb_width_c, mb_height_c) = sps.mb_width_height_c();
        let num_chroma = 2 * (mb_width_c * mb_height_c) as usize;
        let luma_bits = sps.bit_depth_luma() as usize;
        let chroma_bits = sps.bit_depth_chroma() as usize;

        mb.pcm_samples.reserve_exact(256 + num_chroma);
        for _ in 0..256 {
            mb.pcm_samples.push(self.r.read_bits(luma_bits)?);
        }
        for _ in 0..num_chroma {
            mb.pcm_samples.push(self.r.read_bits(chroma_bits)?);
        }

        self.cabac.init_decoder(self.r)
    }

    fn mb_pred(&mut self, nb: &Neighborhood, mb: &mut Macroblock) -> ParseResult<()> {
        if mb.is_i_nxn() {
            let num_blocks = if mb.transform_size_8x8_flag { 4 } else { 16 };
            for blk in 0..num_blocks {
                mb.prev_intra_pred_mode_flag[blk] = self.decision(ctx::PREV_INTRA_PRED_MODE_FLAG)?;
                if !mb.prev_intra_pred_mode_flag[blk] {
                    // Fixed length, least significant bit first.
                    let mut rem = 0;
                    for bit in 0..3 {
                        rem |= u8::from(self.decision(ctx::REM_INTRA_PRED_MODE)?) << bit;
                    }
                    mb.rem_intra_pred_mode[blk] = rem;
                }
            }
        }

        if matches!(self.chroma_array_type, 1 | 2) {
            let inc = nb.count(mb, |m| !m.is_pcm() && m.intra_chroma_pred_mode != 0);
            let mut mode = 0;
            if self.decision(ctx::INTRA_CHROMA_PRED_MODE + inc)? {
                mode = 1;
                while mode < 3 && self.decision(ctx::INTRA_CHROMA_PRED_MODE + 3)? {
                    mode += 1;
                }
            }
            mb.intra_chroma_pred_mode = mode;
        }

        Ok(())
    }

    fn coded_block_pattern(&mut self, nb: &Neighborhood, mb: &mut Macroblock) -> ParseResult<()> {
        for b8 in 0..4 {
            let inc = nb.cbp_luma_inc(mb, b8);
            if self.decision(ctx::CODED_BLOCK_PATTERN_LUMA + inc)? {
                mb.coded_block_pattern_luma |= 1 << b8;
            }
        }

        if matches!(self.chroma_array_type, 1 | 2) {
            let inc = nb.cbp_chroma_inc(mb, 0);
            if self.decision(ctx::CODED_BLOCK_PATTERN_CHROMA + inc)? {
                let inc = nb.cbp_chroma_inc(mb, 1);
                mb.coded_block_pattern_chroma =
                    1 + u8::from(self.decision(ctx::CODED_BLOCK_PATTERN_CHROMA + 4 + inc)?);
            }
        }

        Ok(())
    }

    /// Decodes `mb_qp_delta` and updates `QPY`, 7-37.
    fn mb_qp_delta(&mut self, nb: &Neighborhood) -> ParseResult<i32> {
        let inc = match nb.prev() {
            Some(prev)
                if !prev.is_pcm()
                    && (prev.is_intra16x16()
                        || prev.coded_block_pattern_luma != 0
                        || prev.coded_block_pattern_chroma != 0)
                    && prev.mb_qp_delta != 0 =>
            {
                1
            }
            _ => 0,
        };

        let qp_bd_offset_y = self.pps.sps.qp_bd_offset_y();
        let min = -(26 + qp_bd_offset_y / 2);
        let max = 25 + qp_bd_offset_y / 2;

        // Unary binarization, mapped back to a signed value per table 9-3.
        let mut k = 0;
        let mut ctx_idx = ctx::MB_QP_DELTA + inc;
        while self.decision(ctx_idx)? {
            k += 1;
            if k > 2 * -min {
                structural!("mb_qp_delta out of range [{}, {}]", min, max);
            }
            ctx_idx = ctx::MB_QP_DELTA + if k == 1 { 2 } else { 3 };
        }

        let delta = if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) };
        if !(min..=max).contains(&delta) {
            structural!("mb_qp_delta {} out of range [{}, {}]", delta, min, max);
        }

        self.qp_y = (self.qp_y + delta + 52 + 2 * qp_bd_offset_y) % (52 + qp_bd_offset_y)
            - qp_bd_offset_y;

        Ok(delta)
    }

    fn residual(&mut self, nb: &Neighborhood, mb: &mut Macroblock) -> ParseResult<()> {
        self.residual_luma(nb, mb, 0)?;

        match self.chroma_array_type {
            1 | 2 => self.residual_chroma(nb, mb),
            3 => {
                self.residual_luma(nb, mb, 1)?;
                self.residual_luma(nb, mb, 2)
            }
            _ => Ok(()),
        }
    }

    /// `residual_luma()` for `plane`, 0 being luma and 1 and 2 the Cb and Cr
    /// planes of 4:4:4 streams.
    fn residual_luma(&mut self, nb: &Neighborhood, mb: &mut Macroblock, plane: usize) -> ParseResult<()> {
        let [dc_cat, ac_cat, cat_4x4, cat_8x8] = PLANE_BLOCK_CATS[plane];

        if mb.is_intra16x16() {
            let inc = nb.coded_block_flag_inc(mb, BlockRef::Dc, plane);
            self.residual_block(&mut mb.plane_mut(plane).dc, dc_cat, Some(inc), 15)?;
        }

        for b8 in 0..4 {
            // Blocks of 8x8 quadrants without coefficients stay zeroed.
            if (mb.coded_block_pattern_luma >> b8) & 1 == 0 {
                continue;
            }

            if mb.transform_size_8x8_flag {
                // coded_block_flag is only coded for 4:4:4, it is 1 otherwise.
                let inc = (self.chroma_array_type == 3)
                    .then(|| nb.coded_block_flag_inc(mb, BlockRef::Luma8x8(b8), plane));
                self.residual_block(&mut mb.plane_mut(plane).blocks8x8[b8], cat_8x8, inc, 63)?;
                continue;
            }

            // Intra16x16ACLevel skips the DC coefficient.
            let (cat, end_idx) = if mb.is_intra16x16() {
                (ac_cat, 14)
            } else {
                (cat_4x4, 15)
            };
            for blk in 4 * b8..4 * b8 + 4 {
                let inc = nb.coded_block_flag_inc(mb, BlockRef::Luma4x4(blk), plane);
                self.residual_block(&mut mb.plane_mut(plane).blocks4x4[blk], cat, Some(inc), end_idx)?;
            }
        }

        Ok(())
    }

    fn residual_chroma(&mut self, nb: &Neighborhood, mb: &mut Macroblock) -> ParseResult<()> {
        let num_blocks = 4 * self.num_c8x8;

        if mb.coded_block_pattern_chroma & 3 != 0 {
            for c in 0..2 {
                let inc = nb.coded_block_flag_inc(mb, BlockRef::ChromaDc(c), 0);
                self.residual_block(&mut mb.chroma_dc[c], CHROMA_DC_CAT, Some(inc), num_blocks - 1)?;
            }
        }

        if mb.coded_block_pattern_chroma & 2 != 0 {
            for c in 0..2 {
                for blk in 0..num_blocks {
                    let inc = nb.coded_block_flag_inc(mb, BlockRef::ChromaAc(c, blk), 0);
                    self.residual_block(&mut mb.chroma_ac[c][blk], CHROMA_AC_CAT, Some(inc), 14)?;
                }
            }
        }

        Ok(())
    }

    /// `residual_block_cabac()` with `startIdx` 0. `cbf_inc` is `None` when
    /// `coded_block_flag` is not present and inferred to be 1.
    fn residual_block<const N: usize>(
        &mut self,
        block: &mut ResidualBlock<N>,
        cat: usize,
        cbf_inc: Option<usize>,
        end_idx: usize,
    ) -> ParseResult<()> {
        let [cbf_ctx, sig_ctx, last_ctx, abs_ctx] = residual_ctx_base(cat);

        block.coded_block_flag = match cbf_inc {
            Some(inc) => self.decision(cbf_ctx + inc)?,
            None => true,
        };
        if !block.coded_block_flag {
            return Ok(());
        }

        let is_8x8 = matches!(cat, 5 | 9 | 13);
        let mut significant = [false; 64];
        let mut num_coeff = end_idx + 1;
        let mut i = 0;
        while i + 1 < num_coeff {
            let (sig_inc, last_inc) = if is_8x8 {
                (
                    usize::from(SIG_COEFF_FLAG_8X8_FRAME[i]),
                    usize::from(LAST_SIG_COEFF_FLAG_8X8[i]),
                )
            } else if cat == CHROMA_DC_CAT {
                let inc = (i / self.num_c8x8).min(2);
                (inc, inc)
            } else {
                (i, i)
            };

            significant[i] = self.decision(sig_ctx + sig_inc)?;
            if significant[i] && self.decision(last_ctx + last_inc)? {
                num_coeff = i + 1;
            }
            i += 1;
        }
        significant[num_coeff - 1] = true;

        for i in (0..num_coeff).rev() {
            if !significant[i] {
                continue;
            }

            let abs_level_minus1 = self.coeff_abs_level_minus1(block, abs_ctx, cat)?;
            let negative = self.cabac.decode_bypass(self.r)?;
            block.push_level(i, abs_level_minus1, negative);
        }

        Ok(())
    }

    /// UEG0 binarization with a unary prefix cut off at 14, clause 9.3.2.3.
    fn coeff_abs_level_minus1<const N: usize>(
        &mut self,
        block: &ResidualBlock<N>,
        abs_ctx: usize,
        cat: usize,
    ) -> ParseResult<u32> {
        let gt1 = block.num_decod_abs_level_gt1 as usize;
        let eq1 = block.num_decod_abs_level_eq1 as usize;

        let inc = if gt1 != 0 { 0 } else { (1 + eq1).min(4) };
        if !self.decision(abs_ctx + inc)? {
            return Ok(0);
        }

        let max_gt1 = if cat == CHROMA_DC_CAT { 3 } else { 4 };
        let inc = 5 + gt1.min(max_gt1);
        let mut prefix = 1;
        while prefix < 14 && self.decision(abs_ctx + inc)? {
            prefix += 1;
        }
        if prefix < 14 {
            return Ok(prefix);
        }

        let mut k = 0;
        let mut suffix = 0u32;
        while self.cabac.decode_bypass(self.r)? {
            suffix += 1 << k;
            k += 1;
            if k > MAX_ABS_LEVEL_SUFFIX_PREFIX {
                structural!("coeff_abs_level_minus1 suffix is too long");
            }
        }
        while k > 0 {
            k -= 1;
            suffix += u32::from(self.cabac.decode_bypass(self.r)?) << k;
        }

        Ok(14 + suffix)
    }

    /// `macroblock_layer()` of an I slice.
    fn macroblock_layer(&mut self, nb: &Neighborhood, mb: &mut Macroblock) -> ParseResult<()> {
        let mb_type = self.mb_type(nb, mb)?;
        mb.set_i_mb_type(mb_type);

        if mb.is_pcm() {
            mb.qp_y = self.qp_y;
            return self.pcm_samples(mb);
        }

        if mb.is_i_nxn() && self.pps.transform_8x8_mode_flag {
            let inc = nb.count(mb, |m| m.transform_size_8x8_flag);
            mb.transform_size_8x8_flag = self.decision(ctx::TRANSFORM_SIZE_8X8_FLAG + inc)?;
            if mb.transform_size_8x8_flag {
                mb.pred_mode = MbPredMode::Intra8x8;
            }
        }

        self.mb_pred(nb, mb)?;

        if !mb.is_intra16x16() {
            self.coded_block_pattern(nb, mb)?;
        } else if matches!(self.chroma_array_type, 0 | 3) && mb.coded_block_pattern_chroma != 0 {
            structural!(
                "mb_type {} codes chroma with ChromaArrayType {}",
                mb_type,
                self.chroma_array_type
            );
        }

        let has_residual = mb.coded_block_pattern_luma != 0
            || mb.coded_block_pattern_chroma != 0
            || mb.is_intra16x16();

        if has_residual {
            mb.mb_qp_delta = self.mb_qp_delta(nb)?;
        }
        mb.qp_y = self.qp_y;

        if has_residual {
            self.residual(nb, mb)?;
        }

        Ok(())
    }
}

/// Parses the `slice_data()` of an I slice coded with CABAC, see clause
/// 7.3.4. `r` must be positioned right after the slice header, as returned by
/// [`Parser::parse_slice`](crate::codec::h264::parser::Parser::parse_slice).
///
/// Each decoded macroblock is written to `mbs` at its address, which must
/// hold `PicSizeInMbs` entries. Returns the number of macroblocks in the
/// slice.
pub fn parse_slice_data(
    r: &mut NaluReader,
    header: &SliceHeader,
    pps: &Pps,
    cabac: &mut CabacDecoder,
    mbs: &mut [Macroblock],
) -> ParseResult<usize> {
    if !pps.entropy_coding_mode_flag {
        unsupported!("CAVLC slice data");
    }

    if header.mbaff_frame_flag || header.field_pic_flag {
        unsupported!("Slice data of field pictures and MBAFF frames");
    }

    if !header.slice_type.is_i() {
        unsupported!("Slice data of {:?} slices", header.slice_type);
    }

    let first_mb = header.first_mb_in_slice as usize;
    if mbs.len() != header.pic_size_in_mbs as usize || first_mb >= mbs.len() {
        structural!(
            "Slice starting at macroblock {} does not fit {} macroblocks",
            first_mb,
            mbs.len()
        );
    }

    while !r.is_aligned() {
        if !r.read_bit()? {
            structural!("cabac_alignment_one_bit is not one");
        }
    }

    cabac.init_contexts(header.slice_type, header.slice_qp_y)?;
    cabac.init_decoder(r)?;

    let sps = &pps.sps;
    let (mb_width_c, mb_height_c) = sps.mb_width_height_c();
    let (sub_width_c, sub_height_c) = sps.sub_width_height_c();
    let locator = MbLocator::new(header.pic_width_in_mbs as usize, first_mb);

    let mut parser = MacroblockParser {
        r,
        cabac,
        pps,
        chroma_array_type: sps.chroma_array_type(),
        num_c8x8: (4 / (sub_width_c * sub_height_c)).max(1) as usize,
        qp_y: header.slice_qp_y,
    };

    let mut curr = first_mb;
    loop {
        let (done, rest) = mbs.split_at_mut(curr);
        let mb = match rest.first_mut() {
            Some(mb) => mb,
            None => structural!("Slice data continues past macroblock {}", curr),
        };

        let nb = Neighborhood {
            done,
            curr,
            first_mb,
            locator,
            mb_width_c: mb_width_c as i32,
            mb_height_c: mb_height_c as i32,
        };

        *mb = Macroblock::default();
        parser.macroblock_layer(&nb, mb)?;

        if parser.cabac.decode_terminate(parser.r)? {
            break;
        }

        curr += 1;
    }

    if !parser.r.only_zeros_left() {
        structural!("Unexpected data after the last macroblock of the slice");
    }

    Ok(curr + 1 - first_mb)
}
