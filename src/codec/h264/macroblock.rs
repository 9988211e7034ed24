// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Macroblock-level syntax produced by the slice data parser.

use log::debug;

use crate::codec::h264::error::ParseError;
use crate::codec::h264::error::ParseResult;

/// `mb_type` of an I_NxN macroblock in an I slice, table 7-11.
pub const I_NXN: u8 = 0;
/// `mb_type` of an I_PCM macroblock in an I slice, table 7-11.
pub const I_PCM: u8 = 25;

/// Macroblock prediction mode, derived from `mb_type` and
/// `transform_size_8x8_flag`. See table 7-11.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MbPredMode {
    #[default]
    Intra4x4,
    Intra8x8,
    Intra16x16,
    Pcm,
}

/// A block of residual coefficients, as produced by `residual_block_cabac()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidualBlock<const N: usize> {
    pub coded_block_flag: bool,
    /// `numDecodAbsLevelEq1`: levels with an absolute value of one decoded
    /// so far.
    pub num_decod_abs_level_eq1: u32,
    /// `numDecodAbsLevelGt1`: levels with an absolute value above one
    /// decoded so far.
    pub num_decod_abs_level_gt1: u32,
    pub coeff_level: [i32; N],
}

impl<const N: usize> Default for ResidualBlock<N> {
    fn default() -> Self {
        Self {
            coded_block_flag: false,
            num_decod_abs_level_eq1: 0,
            num_decod_abs_level_gt1: 0,
            coeff_level: [0; N],
        }
    }
}

impl<const N: usize> ResidualBlock<N> {
    /// Records a decoded level and updates the running counts. Levels are
    /// recorded in reverse scanning order.
    pub fn push_level(&mut self, idx: usize, abs_level_minus1: u32, negative: bool) {
        if abs_level_minus1 == 0 {
            self.num_decod_abs_level_eq1 += 1;
        } else {
            self.num_decod_abs_level_gt1 += 1;
        }

        let level = abs_level_minus1 as i32 + 1;
        self.coeff_level[idx] = if negative { -level } else { level };
    }

    /// Number of non-zero coefficients.
    pub fn total_coeff(&self) -> usize {
        self.coeff_level.iter().filter(|c| **c != 0).count()
    }
}

/// Residual of one colour component coded like luma: the luma plane, and
/// the Cb and Cr planes when `ChromaArrayType` is 3.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaneResidual {
    /// `Intra16x16DCLevel`
    pub dc: ResidualBlock<16>,
    /// `Intra16x16ACLevel` (first 15 entries) or `LumaLevel4x4`, indexed by
    /// 4x4 block.
    pub blocks4x4: [ResidualBlock<16>; 16],
    /// `LumaLevel8x8`, indexed by 8x8 block.
    pub blocks8x8: [ResidualBlock<64>; 4],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Macroblock {
    pub mb_type: u8,
    pub pred_mode: MbPredMode,
    pub transform_size_8x8_flag: bool,
    pub prev_intra_pred_mode_flag: [bool; 16],
    pub rem_intra_pred_mode: [u8; 16],
    pub intra_chroma_pred_mode: u8,
    pub coded_block_pattern_luma: u8,
    pub coded_block_pattern_chroma: u8,
    pub mb_qp_delta: i32,
    /// `QPY` after applying `mb_qp_delta`.
    pub qp_y: i32,
    pub luma: PlaneResidual,
    /// Cb and Cr coded like luma, only allocated once a 4:4:4 macroblock
    /// carries chroma residual.
    pub chroma_planes: Option<Box<[PlaneResidual; 2]>>,
    /// `ChromaDCLevel` for Cb and Cr. Up to 8 coefficients for 4:2:2.
    pub chroma_dc: [ResidualBlock<8>; 2],
    /// `ChromaACLevel` for Cb and Cr. Up to 8 blocks for 4:2:2.
    pub chroma_ac: [[ResidualBlock<15>; 8]; 2],
    /// `pcm_sample_luma` followed by `pcm_sample_chroma`.
    pub pcm_samples: Vec<u16>,
}

impl Macroblock {
    /// Sets `mb_type` for an I slice and derives the coded block pattern of
    /// Intra_16x16 types. Table 7-11.
    pub fn set_i_mb_type(&mut self, mb_type: u8) {
        self.mb_type = mb_type;
        self.pred_mode = match mb_type {
            I_NXN => MbPredMode::Intra4x4,
            I_PCM => MbPredMode::Pcm,
            _ => {
                let t = mb_type - 1;
                self.coded_block_pattern_chroma = (t / 4) % 3;
                self.coded_block_pattern_luma = if t >= 12 { 15 } else { 0 };
                MbPredMode::Intra16x16
            }
        };
    }

    pub fn is_pcm(&self) -> bool {
        self.pred_mode == MbPredMode::Pcm
    }

    pub fn is_i_nxn(&self) -> bool {
        self.mb_type == I_NXN
    }

    pub fn is_intra16x16(&self) -> bool {
        self.pred_mode == MbPredMode::Intra16x16
    }

    /// `Intra16x16PredMode`, for Intra_16x16 macroblocks.
    pub fn intra16x16_pred_mode(&self) -> Option<u8> {
        self.is_intra16x16().then(|| (self.mb_type - 1) % 4)
    }

    /// Residual of colour plane `plane`: 0 for luma, 1 and 2 for the Cb and
    /// Cr planes of 4:4:4 streams.
    pub fn plane(&self, plane: usize) -> Option<&PlaneResidual> {
        match plane {
            0 => Some(&self.luma),
            _ => self.chroma_planes.as_deref()?.get(plane - 1),
        }
    }

    /// Like [`Macroblock::plane`], allocating the chroma planes on first use.
    /// `plane` must be below 3.
    pub fn plane_mut(&mut self, plane: usize) -> &mut PlaneResidual {
        match plane {
            0 => &mut self.luma,
            _ => &mut self.chroma_planes.get_or_insert_with(Default::default)[plane - 1],
        }
    }
}

/// Storage for the macroblocks of the current picture, indexed by address.
///
/// Its length always matches the `PicSizeInMbs` of the last slice parsed,
/// entries are overwritten as slices are walked.
#[derive(Debug, Default)]
pub struct MacroblockArena {
    mbs: Vec<Macroblock>,
}

impl MacroblockArena {
    /// Makes room for `pic_size_in_mbs` macroblocks. Does nothing if the size
    /// did not change.
    ///
    /// On allocation failure the arena is left empty so that a later call
    /// retries the allocation.
    pub fn resize(&mut self, pic_size_in_mbs: usize) -> ParseResult<()> {
        if self.mbs.len() == pic_size_in_mbs {
            return Ok(());
        }

        debug!(
            "Resizing macroblock arena from {} to {} macroblocks",
            self.mbs.len(),
            pic_size_in_mbs
        );

        self.mbs = Vec::new();
        self.mbs.try_reserve_exact(pic_size_in_mbs).map_err(|e| {
            ParseError::Resource(format!(
                "cannot allocate {} macroblocks: {}",
                pic_size_in_mbs, e
            ))
        })?;
        self.mbs.resize_with(pic_size_in_mbs, Default::default);

        Ok(())
    }

    /// Resets every macroblock without changing the size.
    pub fn clear(&mut self) {
        self.mbs.fill_with(Default::default);
    }

    pub fn len(&self) -> usize {
        self.mbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mbs.is_empty()
    }

    pub fn as_slice(&self) -> &[Macroblock] {
        &self.mbs
    }

    pub fn as_mut_slice(&mut self) -> &mut [Macroblock] {
        &mut self.mbs
    }
}
