// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use enumn::N;
use log::debug;

use crate::codec::h264::error::structural;
use crate::codec::h264::error::unsupported;
use crate::codec::h264::error::ParseError;
use crate::codec::h264::error::ParseResult;
use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_reader::NaluReader;

/// Maximum number of entries of a reference picture list.
pub const MAX_REFS: usize = 32;

/// Maximum number of memory management control operations in a single
/// `dec_ref_pic_marking()`.
pub const MAX_MMCO_COUNT: usize = 32;

const MAX_SPS_ID: u32 = 31;
const MAX_PPS_ID: u32 = 255;

// Given the max DPB size of 16 frames.
const MAX_DPB_FRAMES: u32 = 16;

/// `MaxFS` of the largest level, see table A-1.
const MAX_FRAME_SIZE_IN_MBS: u64 = 139_264;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Point<T> {
    pub x: T,
    pub y: T,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect<T> {
    pub min: Point<T>,
    pub max: Point<T>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /* if modification_of_pic_nums_idc == 0 || 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* if modification_of_pic_nums_idc == 2 */
    pub long_term_pic_num: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,

    pub luma_weight_l0: [i16; MAX_REFS],
    pub luma_offset_l0: [i8; MAX_REFS],

    /* if seq->ChromaArrayType != 0 */
    pub chroma_weight_l0: [[i16; 2]; MAX_REFS],
    pub chroma_offset_l0: [[i8; 2]; MAX_REFS],

    /* if slice->slice_type % 5 == 1 */
    pub luma_weight_l1: [i16; MAX_REFS],
    pub luma_offset_l1: [i8; MAX_REFS],

    /* and if seq->ChromaArrayType != 0 */
    pub chroma_weight_l1: [[i16; 2]; MAX_REFS],
    pub chroma_offset_l1: [[i8; 2]; MAX_REFS],
}

/// Representation of `MaxLongTermFrameIdx`.
///
/// `MaxLongTermFrameIdx` is derived from `max_long_term_frame_idx_plus1`, an unsigned integer with
/// a special value indicating "no long-term frame indices". This type allows easy conversion
/// between the actual and "plus1" representation, while ensuring that the special value is always
/// handled by the code.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Create a value from `max_long_term_frame_idx_plus1`.
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    /// Convert this value to the representation used by `max_long_term_frame_idx_plus1`.
    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    /// Specifies a control operation to be applied to affect the reference
    /// picture marking, see table 7-9.
    pub memory_management_control_operation: u8,

    /// Used (with memory_management_control_operation equal to 3 or 1) to
    /// assign a long-term frame index to a short-term reference picture or to
    /// mark a short-term reference picture as "unused for reference".
    pub difference_of_pic_nums_minus1: u32,

    /// `picNumX` of operations 1 and 3, i.e. `CurrPicNum -
    /// (difference_of_pic_nums_minus1 + 1)`, reduced modulo `MaxPicNum`.
    pub pic_num_x: u32,

    /// Used (with memory_management_control_operation equal to 2) to mark a
    /// long-term reference picture as "unused for reference".
    pub long_term_pic_num: u32,

    /// Used (with memory_management_control_operation equal to 3 or 6) to
    /// assign a long-term frame index to a picture.
    pub long_term_frame_idx: u32,

    /// Specifies the maximum value of long-term frame index allowed for
    /// long-term reference pictures (until receipt of another value of
    /// `max_long_term_frame_idx_plus1`).
    pub max_long_term_frame_idx: MaxLongTermFrameIdx,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// Specifies how the previously-decoded pictures in the decoded picture
    /// buffer are treated after decoding of an IDR picture. See Annex C.
    pub no_output_of_prior_pics_flag: bool,

    /// If set, the IDR picture is marked as "used for long-term reference".
    pub long_term_reference_flag: bool,

    /// Selects the reference picture marking mode of the currently decoded
    /// picture as specified in Table 7-8.
    pub adaptive_ref_pic_marking_mode_flag: bool,

    /// The memory management control operations, without the terminating
    /// operation 0.
    pub inner: Vec<RefPicMarkingInner>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Specifies the address of the first macroblock in the slice.
    pub first_mb_in_slice: u32,

    /// Specifies the coding type of the slice according to Table 7-6.
    pub slice_type: SliceType,

    /// Whether `slice_type` was coded as 5..=9, i.e. all other slices of the
    /// picture share the same type.
    pub all_same_type: bool,

    // Specifies the picture parameter set in use
    pub pic_parameter_set_id: u8,

    /// Specifies the colour plane associated with the current slice RBSP when
    /// `separate_colour_plane_flag` is set.
    pub colour_plane_id: u8,

    /// Used as an identifier for pictures and shall be represented by
    /// `log2_max_frame_num_minus4 + 4` bits in the bitstream.
    pub frame_num: u16,

    /// If set, specifies that the slice is a slice of a coded field. If not
    /// set, specifies that the slice is a slice of a coded frame.
    pub field_pic_flag: bool,

    /// If set, specifies that the slice is part of a coded bottom field. If not
    /// set, specifies that the picture is a coded top field.
    pub bottom_field_flag: bool,

    /// Identifies an IDR picture.
    pub idr_pic_id: u16,

    /// Specifies the picture order count modulo `MaxPicOrderCntLsb` for the top
    /// field of a coded frame or for a coded field.
    pub pic_order_cnt_lsb: u16,

    ///  Specifies the picture order count difference between the bottom field
    ///  and the top field of a coded frame.
    pub delta_pic_order_cnt_bottom: i32,

    /// Picture order count differences from the expected picture order count
    /// for the top and bottom fields, used with `pic_order_cnt_type` 1. See
    /// clause 8.2.1.
    pub delta_pic_order_cnt: [i32; 2],

    /// Size in bits of the picture order count fields, as hardware decoders
    /// want it.
    pub pic_order_cnt_bit_size: usize,

    pub redundant_pic_cnt: u8,

    pub direct_spatial_mv_pred_flag: bool,

    pub num_ref_idx_active_override_flag: bool,

    /// Specifies the maximum reference index for reference picture list 0 that
    /// shall be used to decode the slice.
    pub num_ref_idx_l0_active_minus1: u8,

    /// Specifies the maximum reference index for reference picture list 1 that
    /// shall be used to decode the slice.
    pub num_ref_idx_l1_active_minus1: u8,

    pub ref_pic_list_modification_flag_l0: bool,

    /// Reference picture list 0 modification, including the terminating
    /// operation 3.
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,

    pub ref_pic_list_modification_flag_l1: bool,

    /// Reference picture list 1 modification, including the terminating
    /// operation 3.
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,

    /// Prediction weight table as parsed using 7.3.3.2
    pub pred_weight_table: PredWeightTable,

    /// Decoded reference picture marking parsed using 7.3.3.3
    pub dec_ref_pic_marking: RefPicMarking,

    /// Size in bits of `dec_ref_pic_marking()`.
    pub dec_ref_pic_marking_bit_size: usize,

    /// Specifies the index for determining the initialization table used in the
    /// initialization process for context variables.
    pub cabac_init_idc: u8,

    /// Specifies the initial value of QPY to be used for all the macroblocks
    /// in the slice until modified by the value of `mb_qp_delta`.
    pub slice_qp_delta: i8,

    /// `SliceQPY`, see 7-30.
    pub slice_qp_y: i32,

    pub sp_for_switch_flag: bool,

    /// Specifies the value of QSY for all the macroblocks in SP and SI slices.
    pub slice_qs_delta: i8,

    pub disable_deblocking_filter_idc: u8,

    pub slice_alpha_c0_offset_div2: i8,

    pub slice_beta_offset_div2: i8,

    /// Same as `MaxPicNum` in the specification.
    pub max_pic_num: u32,

    /// Same as `CurrPicNum` in the specification.
    pub curr_pic_num: u32,

    /// `PicWidthInMbs`, see 7-13.
    pub pic_width_in_mbs: u32,
    /// `PicHeightInMapUnits`, see 7-16.
    pub pic_height_in_map_units: u32,
    /// `FrameHeightInMbs`, see 7-18.
    pub frame_height_in_mbs: u32,
    /// `MbaffFrameFlag`, see 7-25.
    pub mbaff_frame_flag: bool,
    /// `PicHeightInMbs`, see 7-26.
    pub pic_height_in_mbs: u32,
    /// `PicSizeInMbs`, see 7-29.
    pub pic_size_in_mbs: u32,

    /// Size of the slice_header() in bits, NAL unit header included.
    pub header_bit_size: usize,

    /// Number of emulation prevention bytes (EPB) in this slice_header()
    pub n_emulation_prevention_bytes: usize,
}

pub struct SliceHeaderBuilder(SliceHeader);

impl SliceHeaderBuilder {
    pub fn new(pps: &Pps) -> Self {
        SliceHeaderBuilder(SliceHeader {
            pic_parameter_set_id: pps.pic_parameter_set_id,
            slice_qp_y: 26 + i32::from(pps.pic_init_qp_minus26),
            ..Default::default()
        })
    }

    pub fn slice_type(mut self, type_: SliceType) -> Self {
        self.0.slice_type = type_;
        self
    }

    pub fn first_mb_in_slice(mut self, value: u32) -> Self {
        self.0.first_mb_in_slice = value;
        self
    }

    pub fn frame_num(mut self, value: u16) -> Self {
        self.0.frame_num = value;
        self
    }

    pub fn pic_order_cnt_lsb(mut self, value: u16) -> Self {
        self.0.pic_order_cnt_lsb = value;
        self
    }

    pub fn idr_pic_id(mut self, value: u16) -> Self {
        self.0.idr_pic_id = value;
        self
    }

    pub fn slice_qp_delta(mut self, value: i8) -> Self {
        self.0.slice_qp_y += i32::from(value) - i32::from(self.0.slice_qp_delta);
        self.0.slice_qp_delta = value;
        self
    }

    pub fn num_ref_idx_l0_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_active_override_flag = true;
        self.0.num_ref_idx_l0_active_minus1 = value;
        self
    }

    pub fn build(self) -> SliceHeader {
        self.0
    }
}

/// A H264 slice. An integer number of macroblocks or macroblock pairs ordered
/// consecutively in the raster scan within a particular slice group
#[derive(Debug, Clone)]
pub struct Slice<'a> {
    /// The slice header.
    pub header: SliceHeader,
    /// The NAL unit backing this slice.
    pub nalu: Nalu<'a>,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
/// See table 7-6 in the specification.
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    /// Whether this is a P slice. See table 7-6 in the specification.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether this is a B slice. See table 7-6 in the specification.
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether this is an I slice. See table 7-6 in the specification.
    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    /// Whether this is a SP slice. See table 7-6 in the specification.
    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    /// Whether this is a SI slice. See table 7-6 in the specification.
    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
    High444P = 244,
}

impl Profile {
    /// Whether `profile_idc` signals the chroma format and bit depth fields of
    /// the SPS.
    pub const fn has_chroma_info(profile_idc: u8) -> bool {
        matches!(
            profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        )
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

/// A H264 Sequence Parameter Set. A syntax structure containing syntax elements
/// that apply to zero or more entire coded video sequences.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    /// Identifies the sequence parameter set that is referred to by the picture
    /// parameter set
    pub seq_parameter_set_id: u8,

    /// Profile to which the coded video sequence conforms
    pub profile_idc: u8,

    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set0_flag: bool,
    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set1_flag: bool,
    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set2_flag: bool,
    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set3_flag: bool,
    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set4_flag: bool,
    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set5_flag: bool,

    /// Level to which the coded video sequence conforms
    pub level_idc: Level,

    /// Specifies the chroma sampling relative to the luma sampling as specified
    /// in clause 6.2.
    pub chroma_format_idc: u8,

    /// Specifies whether the three colour components of the 4:4:4 chroma format
    /// are coded separately.
    pub separate_colour_plane_flag: bool,

    /// Specifies the bit depth of the samples of the luma array and the value
    /// of the luma quantization parameter range offset QpBdOffsetY. See 7-3 and
    /// 7-4.
    pub bit_depth_luma_minus8: u8,

    /// Specifies the bit depth of the samples of the chroma arrays and the
    /// value of the chroma quantization parameter range offset QpBdOffsetC. See
    /// 7-5 and 7-6.
    pub bit_depth_chroma_minus8: u8,

    pub qpprime_y_zero_transform_bypass_flag: bool,

    /// Always unset: streams carrying sequence scaling matrices are rejected.
    pub seq_scaling_matrix_present_flag: bool,

    /// Specifies the value of the variable MaxFrameNum that is used in
    /// frame_num related derivations as follows: MaxFrameNum = 2 ^
    /// (log2_max_frame_num_minus4 + 4 )
    pub log2_max_frame_num_minus4: u8,

    /// Specifies the method to decode picture order count (as specified in
    /// clause 8.2.1)
    pub pic_order_cnt_type: u8,

    /// MaxPicOrderCntLsb = 2 ^ (log2_max_pic_order_cnt_lsb_minus4 + 4).
    pub log2_max_pic_order_cnt_lsb_minus4: u8,

    /// If true, specifies that `delta_pic_order_cnt[0]` and
    /// `delta_pic_order_cnt[1]` are not present in the slice headers of the
    /// sequence and shall be inferred to be equal to 0.
    pub delta_pic_order_always_zero_flag: bool,

    /// Used to calculate the picture order count of a non-reference picture as
    /// specified in clause 8.2.1.
    pub offset_for_non_ref_pic: i32,

    /// Used to calculate the picture order count of a bottom field as specified
    /// in clause 8.2.1.
    pub offset_for_top_to_bottom_field: i32,

    pub num_ref_frames_in_pic_order_cnt_cycle: u8,

    /// `num_ref_frames_in_pic_order_cnt_cycle` offsets used in the decoding
    /// process for picture order count as specified in clause 8.2.1.
    pub offset_for_ref_frame: Vec<i32>,

    /// Specifies the maximum number of short-term and long-term reference
    /// frames, complementary reference field pairs, and non-paired reference
    /// fields that may be used by the decoding process for inter prediction.
    pub max_num_ref_frames: u8,

    pub gaps_in_frame_num_value_allowed_flag: bool,

    /// Plus 1 specifies the width of each decoded picture in units of
    /// macroblocks.
    pub pic_width_in_mbs_minus1: u16,
    /// Plus 1 specifies the height in slice group map units of a decoded frame
    /// or field.
    pub pic_height_in_map_units_minus1: u16,

    /// If true, every coded picture of the coded video sequence is a coded
    /// frame containing only frame macroblocks.
    pub frame_mbs_only_flag: bool,

    /// If true, specifies the possible use of switching between frame and field
    /// macroblocks within frames.
    pub mb_adaptive_frame_field_flag: bool,

    pub direct_8x8_inference_flag: bool,

    /// If true, specifies that the frame cropping offset parameters follow next
    /// in the sequence parameter.
    pub frame_cropping_flag: bool,

    /// Frame cropping rectangle, in units of `CropUnitX` and `CropUnitY`.
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    // Calculated
    /// Same as ExpectedDeltaPerPicOrderCntCycle, see 7-12 in the specification.
    pub expected_delta_per_pic_order_cnt_cycle: i32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    /// Returns the coded width of the stream.
    ///
    /// See 7-13 through 7-17 in the specification.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Returns the coded height of the stream.
    ///
    /// See 7-13 through 7-17 in the specification.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    /// Returns `ChromaArrayType`, as computed in the specification.
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// Returns `SubWidthC` and `SubHeightC`.
    ///
    /// See table 6-1 in the specification.
    pub fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, false) => (2, 2),
            (2, false) => (2, 1),
            (3, false) => (1, 1),
            // undefined.
            _ => (1, 1),
        }
    }

    /// Returns `MbWidthC` and `MbHeightC`, both zero for monochrome streams or
    /// separately coded colour planes. See 6-1 and 6-2.
    pub fn mb_width_height_c(&self) -> (u32, u32) {
        if self.chroma_array_type() == 0 {
            return (0, 0);
        }

        let (sub_width_c, sub_height_c) = self.sub_width_height_c();
        (16 / sub_width_c, 16 / sub_height_c)
    }

    /// Returns `CropUnitX` and `CropUnitY`.
    ///
    /// See 7-19 through 7-22 in the specification.
    fn crop_unit_x_y(&self) -> (u32, u32) {
        match self.chroma_array_type() {
            0 => (1, 2 - u32::from(self.frame_mbs_only_flag)),
            _ => {
                let (sub_width_c, sub_height_c) = self.sub_width_height_c();
                (
                    sub_width_c,
                    sub_height_c * (2 - u32::from(self.frame_mbs_only_flag)),
                )
            }
        }
    }

    pub fn bit_depth_luma(&self) -> u32 {
        8 + u32::from(self.bit_depth_luma_minus8)
    }

    pub fn bit_depth_chroma(&self) -> u32 {
        8 + u32::from(self.bit_depth_chroma_minus8)
    }

    /// `QpBdOffsetY`, see 7-4.
    pub fn qp_bd_offset_y(&self) -> i32 {
        6 * i32::from(self.bit_depth_luma_minus8)
    }

    /// Same as MaxFrameNum. See 7-10 in the specification.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// `PicWidthInMbs`, see 7-13.
    pub fn pic_width_in_mbs(&self) -> u32 {
        u32::from(self.pic_width_in_mbs_minus1) + 1
    }

    /// `FrameHeightInMbs`, see 7-18.
    pub fn frame_height_in_mbs(&self) -> u32 {
        (2 - u32::from(self.frame_mbs_only_flag))
            * (u32::from(self.pic_height_in_map_units_minus1) + 1)
    }

    /// `PicSizeInMbs` of a coded frame.
    pub fn pic_size_in_mbs(&self) -> u32 {
        self.pic_width_in_mbs() * self.frame_height_in_mbs()
    }

    pub fn visible_rectangle(&self) -> Rect<u32> {
        if !self.frame_cropping_flag {
            return Rect {
                min: Point { x: 0, y: 0 },
                max: Point {
                    x: self.width(),
                    y: self.height(),
                },
            };
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();

        let crop_left = crop_unit_x * self.frame_crop_left_offset;
        let crop_right = crop_unit_x * self.frame_crop_right_offset;
        let crop_top = crop_unit_y * self.frame_crop_top_offset;
        let crop_bottom = crop_unit_y * self.frame_crop_bottom_offset;

        Rect {
            min: Point {
                x: crop_left,
                y: crop_top,
            },
            max: Point {
                x: self.width() - crop_right,
                y: self.height() - crop_bottom,
            },
        }
    }
}

pub struct SpsBuilder(Sps);

impl Default for SpsBuilder {
    fn default() -> Self {
        SpsBuilder(Sps {
            profile_idc: Profile::Baseline as u8,
            chroma_format_idc: 1,
            frame_mbs_only_flag: true,
            ..Default::default()
        })
    }
}

impl SpsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    pub fn profile_idc(mut self, value: Profile) -> Self {
        self.0.profile_idc = value as u8;
        self
    }

    pub fn level_idc(mut self, value: Level) -> Self {
        self.0.level_idc = value;
        self
    }

    pub fn frame_crop_offsets(mut self, top: u32, bottom: u32, left: u32, right: u32) -> Self {
        self.0.frame_cropping_flag = true;
        self.0.frame_crop_top_offset = top;
        self.0.frame_crop_bottom_offset = bottom;
        self.0.frame_crop_left_offset = left;
        self.0.frame_crop_right_offset = right;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        const MB_SIZE: u32 = 16;

        let mb_width = (width + MB_SIZE - 1) / MB_SIZE;
        let mb_height = (height + MB_SIZE - 1) / MB_SIZE;

        self.0.pic_width_in_mbs_minus1 = (mb_width - 1) as u16;
        self.0.pic_height_in_map_units_minus1 = (mb_height - 1) as u16;

        let compressed_width = mb_width * MB_SIZE;
        let compressed_height = mb_height * MB_SIZE;

        if compressed_width != width || compressed_height != height {
            let (crop_unit_x, crop_unit_y) = self.0.crop_unit_x_y();
            self = self.frame_crop_offsets(
                0,
                (compressed_height - height) / crop_unit_y,
                0,
                (compressed_width - width) / crop_unit_x,
            );
        }

        self
    }

    pub fn chroma_format_idc(mut self, value: u8) -> Self {
        self.0.chroma_format_idc = value;
        self
    }

    pub fn max_num_ref_frames(mut self, value: u8) -> Self {
        self.0.max_num_ref_frames = value;
        self
    }

    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    pub fn mb_adaptive_frame_field_flag(mut self, value: bool) -> Self {
        self.0.mb_adaptive_frame_field_flag = value;
        self
    }

    pub fn seq_scaling_matrix_present_flag(mut self, value: bool) -> Self {
        self.0.seq_scaling_matrix_present_flag = value;
        self
    }

    pub fn timing_info(mut self, num_units_in_tick: u32, time_scale: u32) -> Self {
        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters.timing_info_present_flag = true;
        self.0.vui_parameters.num_units_in_tick = num_units_in_tick;
        self.0.vui_parameters.time_scale = time_scale;
        self
    }

    pub fn log2_max_frame_num_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_frame_num_minus4 = value;
        self
    }

    pub fn pic_order_cnt_type(mut self, value: u8) -> Self {
        self.0.pic_order_cnt_type = value;
        self
    }

    /// Uses `pic_order_cnt_type` 1 with the given cycle of reference frame
    /// offsets.
    pub fn offset_for_ref_frame(mut self, offsets: &[i32]) -> Self {
        self.0.pic_order_cnt_type = 1;
        self.0.num_ref_frames_in_pic_order_cnt_cycle = offsets.len() as u8;
        self.0.offset_for_ref_frame = offsets.to_vec();
        self.0.expected_delta_per_pic_order_cnt_cycle = offsets.iter().sum();
        self
    }

    pub fn bit_depth_luma_minus8(mut self, value: u8) -> Self {
        self.0.bit_depth_luma_minus8 = value;
        self
    }

    pub fn bit_depth_chroma_minus8(mut self, value: u8) -> Self {
        self.0.bit_depth_chroma_minus8 = value;
        self
    }

    pub fn build(self) -> Rc<Sps> {
        Rc::new(self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    /// Plus 1 specifies the number of alternative CPB specifications in the
    /// bitstream. The value of `cpb_cnt_minus1` shall be in the range of 0 to 31,
    /// inclusive
    pub cpb_cnt_minus1: u8,
    /// Together with `bit_rate_value_minus1[ SchedSelIdx ]` specifies the
    /// maximum input bit rate of the `SchedSelIdx`-th CPB.
    pub bit_rate_scale: u8,
    /// Together with `cpb_size_value_minus1[ SchedSelIdx ]` specifies the CPB
    /// size of the SchedSelIdx-th CPB.
    pub cpb_size_scale: u8,

    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],

    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

/// Video usability information, Annex E.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    /// Table E-1. `Extended_SAR` (255) means the ratio is given by
    /// `sar_width:sar_height`.
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    /// Table E-2, inferred to be 5 (unspecified) when absent.
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    /// Table E-3, inferred to be 2 (unspecified) when absent.
    pub colour_primaries: u8,
    /// Table E-4, inferred to be 2 (unspecified) when absent.
    pub transfer_characteristics: u8,
    /// Table E-5, inferred to be 2 (unspecified) when absent.
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,

    pub pic_struct_present_flag: bool,

    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: Default::default(),
            aspect_ratio_idc: Default::default(),
            sar_width: Default::default(),
            sar_height: Default::default(),
            overscan_info_present_flag: Default::default(),
            overscan_appropriate_flag: Default::default(),
            video_signal_type_present_flag: Default::default(),
            video_format: 5,
            video_full_range_flag: Default::default(),
            colour_description_present_flag: Default::default(),
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
            chroma_loc_info_present_flag: Default::default(),
            chroma_sample_loc_type_top_field: Default::default(),
            chroma_sample_loc_type_bottom_field: Default::default(),
            timing_info_present_flag: Default::default(),
            num_units_in_tick: Default::default(),
            time_scale: Default::default(),
            fixed_frame_rate_flag: Default::default(),
            nal_hrd_parameters_present_flag: Default::default(),
            nal_hrd_parameters: Default::default(),
            vcl_hrd_parameters_present_flag: Default::default(),
            vcl_hrd_parameters: Default::default(),
            low_delay_hrd_flag: Default::default(),
            pic_struct_present_flag: Default::default(),
            bitstream_restriction_flag: Default::default(),
            motion_vectors_over_pic_boundaries_flag: Default::default(),
            max_bytes_per_pic_denom: Default::default(),
            max_bits_per_mb_denom: Default::default(),
            log2_max_mv_length_horizontal: Default::default(),
            log2_max_mv_length_vertical: Default::default(),
            max_num_reorder_frames: Default::default(),
            max_dec_frame_buffering: Default::default(),
        }
    }
}

/// A H264 Picture Parameter Set. A syntax structure containing syntax elements
/// that apply to zero or more entire coded pictures as determined by the
/// `pic_parameter_set_id` syntax element found in each slice header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pps {
    /// Identifies the picture parameter set that is referred to in the slice header.
    pub pic_parameter_set_id: u8,

    /// Refers to the active sequence parameter set.
    pub seq_parameter_set_id: u8,

    /// Selects CAVLC (unset) or CABAC (set) for the syntax elements with two
    /// descriptors.
    pub entropy_coding_mode_flag: bool,

    pub bottom_field_pic_order_in_frame_present_flag: bool,

    /// Always zero: streams using slice groups are rejected.
    pub num_slice_groups_minus1: u32,

    /// Specifies how `num_ref_idx_l0_active_minus1` is inferred for P, SP, and
    /// B slices with `num_ref_idx_active_override_flag` not set.
    pub num_ref_idx_l0_default_active_minus1: u8,

    /// Specifies how `num_ref_idx_l1_active_minus1` is inferred for B slices
    /// with `num_ref_idx_active_override_flag` not set.
    pub num_ref_idx_l1_default_active_minus1: u8,

    pub weighted_pred_flag: bool,

    /// 0 for default, 1 for explicit and 2 for implicit weighted prediction in
    /// B slices.
    pub weighted_bipred_idc: u8,

    /// Specifies the initial value minus 26 of SliceQPY for each slice.
    pub pic_init_qp_minus26: i8,

    /// Specifies the initial value minus 26 of SliceQSY for all macroblocks in
    /// SP or SI slices.
    pub pic_init_qs_minus26: i8,

    pub chroma_qp_index_offset: i8,

    pub deblocking_filter_control_present_flag: bool,

    pub constrained_intra_pred_flag: bool,

    pub redundant_pic_cnt_present_flag: bool,

    /// If set, specifies that the 8x8 transform decoding process may be in use
    /// (see clause 8.5).
    pub transform_8x8_mode_flag: bool,

    /// Always unset: streams carrying picture scaling matrices are rejected.
    pub pic_scaling_matrix_present_flag: bool,

    /// Inferred to be equal to `chroma_qp_index_offset` when not present.
    pub second_chroma_qp_index_offset: i8,

    /// The SPS referenced by this PPS.
    pub sps: Rc<Sps>,
}

pub struct PpsBuilder(Pps);

impl PpsBuilder {
    pub fn new(sps: Rc<Sps>) -> Self {
        PpsBuilder(Pps {
            pic_parameter_set_id: 0,
            seq_parameter_set_id: sps.seq_parameter_set_id,
            entropy_coding_mode_flag: false,
            bottom_field_pic_order_in_frame_present_flag: false,
            num_slice_groups_minus1: 0,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            transform_8x8_mode_flag: false,
            pic_scaling_matrix_present_flag: false,
            second_chroma_qp_index_offset: 0,
            sps,
        })
    }

    pub fn pic_parameter_set_id(mut self, value: u8) -> Self {
        self.0.pic_parameter_set_id = value;
        self
    }

    pub fn entropy_coding_mode_flag(mut self, value: bool) -> Self {
        self.0.entropy_coding_mode_flag = value;
        self
    }

    pub fn pic_init_qp_minus26(mut self, value: i8) -> Self {
        self.0.pic_init_qp_minus26 = value;
        self
    }

    pub fn deblocking_filter_control_present_flag(mut self, value: bool) -> Self {
        self.0.deblocking_filter_control_present_flag = value;
        self
    }

    pub fn num_ref_idx_l0_default_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l0_default_active_minus1 = value;
        self
    }

    pub fn weighted_pred_flag(mut self, value: bool) -> Self {
        self.0.weighted_pred_flag = value;
        self
    }

    pub fn num_slice_groups_minus1(mut self, value: u32) -> Self {
        self.0.num_slice_groups_minus1 = value;
        self
    }

    pub fn transform_8x8_mode_flag(mut self, value: bool) -> Self {
        self.0.transform_8x8_mode_flag = value;
        self
    }

    pub fn build(self) -> Rc<Pps> {
        Rc::new(self.0)
    }
}

/// Parser for the parameter sets and slice headers of a single stream.
///
/// Exactly one SPS and one PPS are active at any time: parsing a parameter
/// set replaces the previous one regardless of its id.
#[derive(Debug, Default)]
pub struct Parser {
    sps: Option<Rc<Sps>>,
    pps: Option<Rc<Pps>>,
    strip_emulation_prevention: bool,
}

impl Parser {
    pub fn new(strip_emulation_prevention: bool) -> Self {
        Self {
            strip_emulation_prevention,
            ..Default::default()
        }
    }

    /// Returns a reader over the RBSP of `nalu`, skipping the header.
    fn reader<'a>(&self, nalu: &Nalu<'a>) -> NaluReader<'a> {
        if self.strip_emulation_prevention {
            NaluReader::with_emulation_prevention(nalu.payload())
        } else {
            NaluReader::new(nalu.payload())
        }
    }

    fn parse_hrd(r: &mut NaluReader, hrd: &mut HrdParams) -> ParseResult<()> {
        hrd.cpb_cnt_minus1 = r.read_ue_max(31)?;
        hrd.bit_rate_scale = r.read_bits(4)?;
        hrd.cpb_size_scale = r.read_bits(4)?;

        for sched_sel_idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
            hrd.bit_rate_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cpb_size_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cbr_flag[sched_sel_idx] = r.read_bit()?;
        }

        hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
        hrd.time_offset_length = r.read_bits(5)?;
        Ok(())
    }

    fn parse_vui(r: &mut NaluReader, sps: &mut Sps) -> ParseResult<()> {
        let vui = &mut sps.vui_parameters;

        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            if vui.aspect_ratio_idc == 255 {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit()?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coefficients = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits::<u32>(31)? << 1;
            vui.num_units_in_tick |= r.read_bit()? as u32;
            if vui.num_units_in_tick == 0 {
                structural!("num_units_in_tick == 0, which is not allowed by E.2.1");
            }

            vui.time_scale = r.read_bits::<u32>(31)? << 1;
            vui.time_scale |= r.read_bit()? as u32;
            if vui.time_scale == 0 {
                structural!("time_scale == 0, which is not allowed by E.2.1");
            }

            vui.fixed_frame_rate_flag = r.read_bit()?;
        }

        vui.nal_hrd_parameters_present_flag = r.read_bit()?;
        if vui.nal_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.nal_hrd_parameters)?;
        }

        vui.vcl_hrd_parameters_present_flag = r.read_bit()?;
        if vui.vcl_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.vcl_hrd_parameters)?;
        }

        if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
            vui.low_delay_hrd_flag = r.read_bit()?;
        }

        vui.pic_struct_present_flag = r.read_bit()?;
        vui.bitstream_restriction_flag = r.read_bit()?;

        if vui.bitstream_restriction_flag {
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.max_bytes_per_pic_denom = r.read_ue()?;
            vui.max_bits_per_mb_denom = r.read_ue_max(16)?;
            vui.log2_max_mv_length_horizontal = r.read_ue_max(16)?;
            vui.log2_max_mv_length_vertical = r.read_ue_max(16)?;
            vui.max_num_reorder_frames = r.read_ue()?;
            vui.max_dec_frame_buffering = r.read_ue()?;
        }

        Ok(())
    }

    /// Parse a SPS and make it the active one.
    ///
    /// The active PPS is kept, and rebound to the new SPS, only if it refers
    /// to the same `seq_parameter_set_id`.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> ParseResult<&Rc<Sps>> {
        if !matches!(nalu.header.type_, NaluType::Sps) {
            structural!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Sps,
                nalu.header.type_
            );
        }

        let mut r = self.reader(nalu);
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            constraint_set0_flag: r.read_bit()?,
            constraint_set1_flag: r.read_bit()?,
            constraint_set2_flag: r.read_bit()?,
            constraint_set3_flag: r.read_bit()?,
            constraint_set4_flag: r.read_bit()?,
            constraint_set5_flag: r.read_bit()?,
            ..Default::default()
        };

        // skip reserved_zero_2bits
        r.skip_bits(2)?;

        let level: u8 = r.read_bits(8)?;
        sps.level_idc = match Level::n(level) {
            Some(level) => level,
            None => structural!("Unknown level_idc {}", level),
        };
        sps.seq_parameter_set_id = r.read_ue_max(MAX_SPS_ID)?;

        if Profile::has_chroma_info(sps.profile_idc) {
            sps.chroma_format_idc = r.read_ue_max(3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max(6)?;
            sps.bit_depth_chroma_minus8 = r.read_ue_max(6)?;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            sps.seq_scaling_matrix_present_flag = r.read_bit()?;

            if sps.seq_scaling_matrix_present_flag {
                unsupported!("SPS {} carries scaling matrices", sps.seq_parameter_set_id);
            }
        } else {
            sps.chroma_format_idc = 1;
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)?;

        sps.pic_order_cnt_type = r.read_ue_max(2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
            sps.expected_delta_per_pic_order_cnt_cycle = 0;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            sps.offset_for_non_ref_pic = r.read_se()?;
            sps.offset_for_top_to_bottom_field = r.read_se()?;
            sps.num_ref_frames_in_pic_order_cnt_cycle = r.read_ue_max(254)?;

            let mut offset_acc: i32 = 0;
            for _ in 0..sps.num_ref_frames_in_pic_order_cnt_cycle {
                let offset = r.read_se()?;
                sps.offset_for_ref_frame.push(offset);

                // equation 7-12.
                offset_acc = offset_acc.checked_add(offset).ok_or_else(|| {
                    ParseError::Structural(String::from(
                        "ExpectedDeltaPerPicOrderCntCycle overflows",
                    ))
                })?;
            }

            sps.expected_delta_per_pic_order_cnt_cycle = offset_acc;
        }

        sps.max_num_ref_frames = r.read_ue_max(MAX_DPB_FRAMES)?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue()?;
        sps.pic_height_in_map_units_minus1 = r.read_ue()?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        let frame_size_in_mbs = (u64::from(sps.pic_width_in_mbs_minus1) + 1)
            * (u64::from(sps.pic_height_in_map_units_minus1) + 1)
            * (2 - u64::from(sps.frame_mbs_only_flag));
        if frame_size_in_mbs > MAX_FRAME_SIZE_IN_MBS {
            structural!(
                "Frame of {} macroblocks exceeds the largest level",
                frame_size_in_mbs
            );
        }

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;

            // Validate that cropping info is valid.
            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();

            if sps
                .frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|r| r.checked_mul(crop_unit_x))
                .and_then(|r| sps.width().checked_sub(r))
                .is_none()
            {
                structural!("Invalid frame crop width");
            }

            if sps
                .frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|r| r.checked_mul(crop_unit_y))
                .and_then(|r| sps.height().checked_sub(r))
                .is_none()
            {
                structural!("Invalid frame crop height");
            }
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(&mut r, &mut sps)?;
        }

        if r.has_more_rbsp_data() {
            structural!("Trailing data after seq_parameter_set_data()");
        }

        let sps = Rc::new(sps);

        self.pps = match self.pps.take() {
            Some(pps) if pps.seq_parameter_set_id == sps.seq_parameter_set_id => {
                let mut pps = Pps::clone(&pps);
                pps.sps = Rc::clone(&sps);
                Some(Rc::new(pps))
            }
            Some(pps) => {
                debug!(
                    "Dropping PPS {}, it refers to SPS {}",
                    pps.pic_parameter_set_id, pps.seq_parameter_set_id
                );
                None
            }
            None => None,
        };

        Ok(self.sps.insert(sps))
    }

    /// Parse a PPS and make it the active one. It must refer to the active
    /// SPS.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> ParseResult<&Rc<Pps>> {
        if !matches!(nalu.header.type_, NaluType::Pps) {
            structural!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Pps,
                nalu.header.type_
            );
        }

        let mut r = self.reader(nalu);
        let pic_parameter_set_id = r.read_ue_max(MAX_PPS_ID)?;
        let seq_parameter_set_id = r.read_ue_max(MAX_SPS_ID)?;
        let sps = match &self.sps {
            Some(sps) if sps.seq_parameter_set_id == seq_parameter_set_id => Rc::clone(sps),
            Some(sps) => structural!(
                "PPS {} refers to SPS {}, but the active SPS is {}",
                pic_parameter_set_id,
                seq_parameter_set_id,
                sps.seq_parameter_set_id
            ),
            None => structural!(
                "PPS {} refers to SPS {}, which has not been successfully parsed",
                pic_parameter_set_id,
                seq_parameter_set_id
            ),
        };

        let mut pps = PpsBuilder::new(sps).0;
        pps.pic_parameter_set_id = pic_parameter_set_id;

        pps.entropy_coding_mode_flag = r.read_bit()?;
        pps.bottom_field_pic_order_in_frame_present_flag = r.read_bit()?;
        pps.num_slice_groups_minus1 = r.read_ue_max(7)?;

        if pps.num_slice_groups_minus1 > 0 {
            unsupported!(
                "PPS {} uses {} slice groups",
                pps.pic_parameter_set_id,
                pps.num_slice_groups_minus1 + 1
            );
        }

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(MAX_REFS as u32 - 1)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(MAX_REFS as u32 - 1)?;

        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;
        if pps.weighted_bipred_idc > 2 {
            structural!("weighted_bipred_idc == 3, which is reserved");
        }

        let qp_bd_offset_y = pps.sps.qp_bd_offset_y();
        pps.pic_init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset_y), 25)?;
        pps.pic_init_qs_minus26 = r.read_se_bounded(-26, 25)?;

        pps.chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;

        // When second_chroma_qp_index_offset is not present, it shall be
        // inferred to be equal to chroma_qp_index_offset.
        pps.second_chroma_qp_index_offset = pps.chroma_qp_index_offset;

        pps.deblocking_filter_control_present_flag = r.read_bit()?;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.redundant_pic_cnt_present_flag = r.read_bit()?;

        if r.has_more_rbsp_data() {
            pps.transform_8x8_mode_flag = r.read_bit()?;
            pps.pic_scaling_matrix_present_flag = r.read_bit()?;

            if pps.pic_scaling_matrix_present_flag {
                unsupported!("PPS {} carries scaling matrices", pps.pic_parameter_set_id);
            }

            pps.second_chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        }

        if r.has_more_rbsp_data() {
            structural!("Trailing data after pic_parameter_set_rbsp()");
        }

        Ok(self.pps.insert(Rc::new(pps)))
    }

    fn parse_ref_pic_list_modification(
        r: &mut NaluReader,
        num_ref_idx_active_minus1: u8,
        max_pic_num: u32,
        ref_list_mods: &mut Vec<RefPicListModification>,
    ) -> ParseResult<()> {
        loop {
            let modification_of_pic_nums_idc: u32 = r.read_ue()?;
            let mut pic_num_mod = RefPicListModification {
                modification_of_pic_nums_idc: modification_of_pic_nums_idc.min(3) as u8,
                ..Default::default()
            };

            match modification_of_pic_nums_idc {
                0 | 1 => {
                    pic_num_mod.abs_diff_pic_num_minus1 = r.read_ue_max(max_pic_num - 1)?;
                }

                2 => {
                    pic_num_mod.long_term_pic_num = r.read_ue()?;
                }

                3 => {
                    ref_list_mods.push(pic_num_mod);
                    break;
                }

                _ => structural!(
                    "modification_of_pic_nums_idc {} > 3",
                    modification_of_pic_nums_idc
                ),
            }

            if ref_list_mods.len() > usize::from(num_ref_idx_active_minus1) {
                structural!(
                    "More than {} reference picture list modifications",
                    usize::from(num_ref_idx_active_minus1) + 1
                );
            }

            ref_list_mods.push(pic_num_mod);
        }

        Ok(())
    }

    fn parse_ref_pic_list_modifications(
        r: &mut NaluReader,
        header: &mut SliceHeader,
    ) -> ParseResult<()> {
        if !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.ref_pic_list_modification_flag_l0 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l0 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    header.num_ref_idx_l0_active_minus1,
                    header.max_pic_num,
                    &mut header.ref_pic_list_modification_l0,
                )?;
            }
        }

        if header.slice_type.is_b() {
            header.ref_pic_list_modification_flag_l1 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l1 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    header.num_ref_idx_l1_active_minus1,
                    header.max_pic_num,
                    &mut header.ref_pic_list_modification_l1,
                )?;
            }
        }

        Ok(())
    }

    fn parse_pred_weight_table(
        r: &mut NaluReader,
        sps: &Sps,
        header: &mut SliceHeader,
    ) -> ParseResult<()> {
        let pt = &mut header.pred_weight_table;
        pt.luma_log2_weight_denom = r.read_ue_max(7)?;

        let has_chroma = sps.chroma_array_type() != 0;
        if has_chroma {
            pt.chroma_log2_weight_denom = r.read_ue_max(7)?;
        }

        // Weights default to 2 ^ log2_weight_denom and offsets to 0 for the
        // entries whose flag is unset.
        let default_luma_weight = 1 << pt.luma_log2_weight_denom;
        let default_chroma_weight = 1 << pt.chroma_log2_weight_denom;

        let num_l0 = usize::from(header.num_ref_idx_l0_active_minus1) + 1;
        pt.luma_weight_l0[..num_l0].fill(default_luma_weight);
        pt.chroma_weight_l0[..num_l0].fill([default_chroma_weight; 2]);

        for i in 0..num_l0 {
            let luma_weight_l0_flag = r.read_bit()?;

            if luma_weight_l0_flag {
                pt.luma_weight_l0[i] = r.read_se_bounded(-128, 127)?;
                pt.luma_offset_l0[i] = r.read_se_bounded(-128, 127)?;
            }

            if has_chroma {
                let chroma_weight_l0_flag = r.read_bit()?;
                if chroma_weight_l0_flag {
                    for j in 0..2 {
                        pt.chroma_weight_l0[i][j] = r.read_se_bounded(-128, 127)?;
                        pt.chroma_offset_l0[i][j] = r.read_se_bounded(-128, 127)?;
                    }
                }
            }
        }

        if !header.slice_type.is_b() {
            return Ok(());
        }

        let num_l1 = usize::from(header.num_ref_idx_l1_active_minus1) + 1;
        pt.luma_weight_l1[..num_l1].fill(default_luma_weight);
        pt.chroma_weight_l1[..num_l1].fill([default_chroma_weight; 2]);

        for i in 0..num_l1 {
            let luma_weight_l1_flag = r.read_bit()?;

            if luma_weight_l1_flag {
                pt.luma_weight_l1[i] = r.read_se_bounded(-128, 127)?;
                pt.luma_offset_l1[i] = r.read_se_bounded(-128, 127)?;
            }

            if has_chroma {
                let chroma_weight_l1_flag = r.read_bit()?;
                if chroma_weight_l1_flag {
                    for j in 0..2 {
                        pt.chroma_weight_l1[i][j] = r.read_se_bounded(-128, 127)?;
                        pt.chroma_offset_l1[i][j] = r.read_se_bounded(-128, 127)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_dec_ref_pic_marking(
        r: &mut NaluReader,
        nalu: &Nalu,
        header: &mut SliceHeader,
    ) -> ParseResult<()> {
        let rpm = &mut header.dec_ref_pic_marking;

        let num_bits_left = r.num_bits_left();
        if nalu.header.idr_pic_flag {
            rpm.no_output_of_prior_pics_flag = r.read_bit()?;
            rpm.long_term_reference_flag = r.read_bit()?;
        } else {
            rpm.adaptive_ref_pic_marking_mode_flag = r.read_bit()?;

            if rpm.adaptive_ref_pic_marking_mode_flag {
                loop {
                    let mut marking = RefPicMarkingInner::default();

                    let mem_mgmt_ctrl_op = r.read_ue_max::<u8>(6)?;
                    marking.memory_management_control_operation = mem_mgmt_ctrl_op;

                    if mem_mgmt_ctrl_op == 0 {
                        break;
                    }

                    if rpm.inner.len() == MAX_MMCO_COUNT {
                        structural!("More than {} MMCO operations", MAX_MMCO_COUNT);
                    }

                    if mem_mgmt_ctrl_op == 1 || mem_mgmt_ctrl_op == 3 {
                        marking.difference_of_pic_nums_minus1 = r.read_ue()?;
                        marking.pic_num_x = header
                            .curr_pic_num
                            .wrapping_sub(marking.difference_of_pic_nums_minus1)
                            .wrapping_sub(1)
                            & (header.max_pic_num - 1);
                    }

                    if mem_mgmt_ctrl_op == 2 {
                        marking.long_term_pic_num = r.read_ue()?;
                    }

                    if mem_mgmt_ctrl_op == 3 || mem_mgmt_ctrl_op == 6 {
                        marking.long_term_frame_idx = r.read_ue()?;
                    }

                    if mem_mgmt_ctrl_op == 4 {
                        marking.max_long_term_frame_idx =
                            MaxLongTermFrameIdx::from_value_plus1(r.read_ue()?);
                    }

                    rpm.inner.push(marking);
                }
            }
        }
        header.dec_ref_pic_marking_bit_size = num_bits_left - r.num_bits_left();

        Ok(())
    }

    /// Parses the header of a coded slice NAL unit (types 1 and 5).
    pub fn parse_slice_header<'a>(&self, nalu: Nalu<'a>) -> ParseResult<Slice<'a>> {
        self.parse_slice(nalu).map(|(slice, _)| slice)
    }

    /// Parses the header of a coded slice NAL unit and returns it along with a
    /// reader positioned at the first bit of `slice_data()`.
    pub fn parse_slice<'a>(&self, nalu: Nalu<'a>) -> ParseResult<(Slice<'a>, NaluReader<'a>)> {
        match nalu.header.type_ {
            NaluType::Slice | NaluType::SliceIdr => (),
            NaluType::SliceDpa
            | NaluType::SliceDpb
            | NaluType::SliceDpc
            | NaluType::SliceAux
            | NaluType::SliceExt
            | NaluType::SliceDepth => {
                unsupported!("Slices in NAL units of type {:?}", nalu.header.type_)
            }
            _ => structural!(
                "Invalid NALU type: {:?} is not a slice NALU",
                nalu.header.type_
            ),
        }

        let mut r = self.reader(&nalu);
        let initial_bits = r.num_bits_left();

        let mut header = SliceHeader {
            first_mb_in_slice: r.read_ue()?,
            ..Default::default()
        };

        let slice_type = r.read_ue_max::<u8>(9)?;
        header.all_same_type = slice_type >= 5;
        header.slice_type = match SliceType::n(slice_type % 5) {
            Some(slice_type) => slice_type,
            None => structural!("Invalid slice type {}", slice_type),
        };

        header.pic_parameter_set_id = r.read_ue_max(MAX_PPS_ID)?;
        if header.pic_parameter_set_id != 0 {
            unsupported!(
                "Slice refers to PPS {}, only PPS 0 can be used",
                header.pic_parameter_set_id
            );
        }

        let pps = match &self.pps {
            Some(pps) if pps.pic_parameter_set_id == header.pic_parameter_set_id => pps,
            _ => structural!(
                "Slice refers to PPS {}, which has not been successfully parsed",
                header.pic_parameter_set_id
            ),
        };

        if nalu.header.idr_pic_flag && !(header.slice_type.is_i() || header.slice_type.is_si()) {
            structural!("IDR NAL unit carries a {:?} slice", header.slice_type);
        }

        let sps = &pps.sps;

        if sps.separate_colour_plane_flag {
            header.colour_plane_id = r.read_bits(2)?;
            if header.colour_plane_id > 2 {
                structural!("colour_plane_id {} > 2", header.colour_plane_id);
            }
        }

        header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag {
            header.field_pic_flag = r.read_bit()?;
            if header.field_pic_flag {
                header.bottom_field_flag = r.read_bit()?;
            }
        }

        header.pic_width_in_mbs = sps.pic_width_in_mbs();
        header.pic_height_in_map_units = u32::from(sps.pic_height_in_map_units_minus1) + 1;
        header.frame_height_in_mbs = sps.frame_height_in_mbs();
        header.mbaff_frame_flag = sps.mb_adaptive_frame_field_flag && !header.field_pic_flag;
        header.pic_height_in_mbs =
            header.frame_height_in_mbs / (1 + u32::from(header.field_pic_flag));
        header.pic_size_in_mbs = header.pic_width_in_mbs * header.pic_height_in_mbs;

        let first_mb_addr =
            u64::from(header.first_mb_in_slice) * (1 + u64::from(header.mbaff_frame_flag));
        if first_mb_addr >= u64::from(header.pic_size_in_mbs) {
            structural!(
                "first_mb_in_slice {} is outside of a picture of {} macroblocks",
                header.first_mb_in_slice,
                header.pic_size_in_mbs
            );
        }

        if header.field_pic_flag {
            header.max_pic_num = 2 * sps.max_frame_num();
            header.curr_pic_num = 2 * u32::from(header.frame_num) + 1;
        } else {
            header.max_pic_num = sps.max_frame_num();
            header.curr_pic_num = u32::from(header.frame_num);
        }

        if nalu.header.idr_pic_flag {
            header.idr_pic_id = r.read_ue_max(0xffff)?;
        }

        let num_bits_left = r.num_bits_left();
        if sps.pic_order_cnt_type == 0 {
            header.pic_order_cnt_lsb =
                r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt_bottom = r.read_se()?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            header.delta_pic_order_cnt[0] = r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt[1] = r.read_se()?;
            }
        }
        header.pic_order_cnt_bit_size = num_bits_left - r.num_bits_left();

        if pps.redundant_pic_cnt_present_flag {
            header.redundant_pic_cnt = r.read_ue_max(127)?;
        }

        if header.slice_type.is_b() {
            header.direct_spatial_mv_pred_flag = r.read_bit()?;
        }

        if header.slice_type.is_p() || header.slice_type.is_sp() || header.slice_type.is_b() {
            header.num_ref_idx_active_override_flag = r.read_bit()?;
            if header.num_ref_idx_active_override_flag {
                header.num_ref_idx_l0_active_minus1 = r.read_ue_max(MAX_REFS as u32 - 1)?;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = r.read_ue_max(MAX_REFS as u32 - 1)?;
                }
            } else {
                header.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
                }
            }
        }

        // Frames can use at most 16 references per list, fields 32.
        if !header.field_pic_flag
            && (header.num_ref_idx_l0_active_minus1 > 15
                || header.num_ref_idx_l1_active_minus1 > 15)
        {
            structural!(
                "Frame slice uses {}/{} references",
                header.num_ref_idx_l0_active_minus1 + 1,
                header.num_ref_idx_l1_active_minus1 + 1
            );
        }

        Parser::parse_ref_pic_list_modifications(&mut r, &mut header)?;

        if (pps.weighted_pred_flag && (header.slice_type.is_p() || header.slice_type.is_sp()))
            || (pps.weighted_bipred_idc == 1 && header.slice_type.is_b())
        {
            Parser::parse_pred_weight_table(&mut r, sps, &mut header)?;
        }

        if nalu.header.ref_idc != 0 {
            Parser::parse_dec_ref_pic_marking(&mut r, &nalu, &mut header)?;
        }

        if pps.entropy_coding_mode_flag && !header.slice_type.is_i() && !header.slice_type.is_si() {
            let cabac_init_idc: u32 = r.read_ue()?;
            if cabac_init_idc > 2 {
                structural!("cabac_init_idc {} > 2", cabac_init_idc);
            }
            header.cabac_init_idc = cabac_init_idc as u8;
        }

        let qp_bd_offset_y = sps.qp_bd_offset_y();
        header.slice_qp_delta = r.read_se_bounded(-87, 77)?;
        header.slice_qp_y = (26 + i32::from(pps.pic_init_qp_minus26)
            + i32::from(header.slice_qp_delta))
        .clamp(-qp_bd_offset_y, 51);

        if header.slice_type.is_sp() || header.slice_type.is_si() {
            if header.slice_type.is_sp() {
                header.sp_for_switch_flag = r.read_bit()?;
            }

            header.slice_qs_delta = r.read_se_bounded(-51, 51)?;
        }

        if pps.deblocking_filter_control_present_flag {
            header.disable_deblocking_filter_idc = r.read_ue_max(2)?;

            if header.disable_deblocking_filter_idc != 1 {
                header.slice_alpha_c0_offset_div2 = r.read_se_bounded(-6, 6)?;
                header.slice_beta_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        let epb = r.num_epb();
        header.header_bit_size = 8 + initial_bits - r.num_bits_left() - 8 * epb;
        header.n_emulation_prevention_bytes = epb;

        Ok((Slice { header, nalu }, r))
    }

    /// The active SPS, if any.
    pub fn sps(&self) -> Option<&Rc<Sps>> {
        self.sps.as_ref()
    }

    /// The active PPS, if any.
    pub fn pps(&self) -> Option<&Rc<Pps>> {
        self.pps.as_ref()
    }

    /// Forgets the active parameter sets.
    pub fn reset(&mut self) {
        self.sps = None;
        self.pps = None;
    }
}
