// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writes parameter sets and slice headers back into Annex-B NAL units.
//!
//! Used to build test streams: slice headers are written as given, without
//! checking them against the parameter sets.

use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_writer::NaluWriter;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::Profile;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::Sps;

/// Extended Sample Aspect Ratio - H.264 Table E-1
const EXTENDED_SAR: u8 = 255;

/// Writes `count` unset `*_scaling_list_present_flag`s. Scaling list
/// contents are never written.
fn absent_scaling_lists(w: &mut NaluWriter, count: usize) {
    for _ in 0..count {
        w.write_bit(false);
    }
}

/// Appends an SPS NAL unit to `out`.
pub fn sps(out: &mut Vec<u8>, ref_idc: u8, sps: &Sps) {
    let mut w = NaluWriter::new(out, false);

    w.write_header(ref_idc, NaluType::Sps as u8);
    seq_parameter_set_data(&mut w, sps);
    w.write_trailing_bits();
}

fn seq_parameter_set_data(w: &mut NaluWriter, sps: &Sps) {
    // H.264 7.3.2.1.1
    w.write_u(8, sps.profile_idc);
    w.write_bit(sps.constraint_set0_flag);
    w.write_bit(sps.constraint_set1_flag);
    w.write_bit(sps.constraint_set2_flag);
    w.write_bit(sps.constraint_set3_flag);
    w.write_bit(sps.constraint_set4_flag);
    w.write_bit(sps.constraint_set5_flag);
    w.write_u(2, /* reserved_zero_2bits */ 0u32);
    w.write_u(8, sps.level_idc as u32);
    w.write_ue(sps.seq_parameter_set_id);

    if Profile::has_chroma_info(sps.profile_idc) {
        w.write_ue(sps.chroma_format_idc);

        if sps.chroma_format_idc == 3 {
            w.write_bit(sps.separate_colour_plane_flag);
        }

        w.write_ue(sps.bit_depth_luma_minus8);
        w.write_ue(sps.bit_depth_chroma_minus8);
        w.write_bit(sps.qpprime_y_zero_transform_bypass_flag);
        w.write_bit(sps.seq_scaling_matrix_present_flag);

        if sps.seq_scaling_matrix_present_flag {
            let count = if sps.chroma_format_idc != 3 { 8 } else { 12 };
            absent_scaling_lists(w, count);
        }
    }

    w.write_ue(sps.log2_max_frame_num_minus4);
    w.write_ue(sps.pic_order_cnt_type);

    if sps.pic_order_cnt_type == 0 {
        w.write_ue(sps.log2_max_pic_order_cnt_lsb_minus4);
    } else if sps.pic_order_cnt_type == 1 {
        w.write_bit(sps.delta_pic_order_always_zero_flag);
        w.write_se(sps.offset_for_non_ref_pic);
        w.write_se(sps.offset_for_top_to_bottom_field);
        w.write_ue(sps.num_ref_frames_in_pic_order_cnt_cycle);

        for offset_for_ref_frame in &sps.offset_for_ref_frame {
            w.write_se(*offset_for_ref_frame);
        }
    }

    w.write_ue(sps.max_num_ref_frames);
    w.write_bit(sps.gaps_in_frame_num_value_allowed_flag);
    w.write_ue(sps.pic_width_in_mbs_minus1);
    w.write_ue(sps.pic_height_in_map_units_minus1);
    w.write_bit(sps.frame_mbs_only_flag);
    if !sps.frame_mbs_only_flag {
        w.write_bit(sps.mb_adaptive_frame_field_flag);
    }
    w.write_bit(sps.direct_8x8_inference_flag);

    w.write_bit(sps.frame_cropping_flag);
    if sps.frame_cropping_flag {
        w.write_ue(sps.frame_crop_left_offset);
        w.write_ue(sps.frame_crop_right_offset);
        w.write_ue(sps.frame_crop_top_offset);
        w.write_ue(sps.frame_crop_bottom_offset);
    }

    w.write_bit(sps.vui_parameters_present_flag);
    if sps.vui_parameters_present_flag {
        vui_parameters(w, sps);
    }
}

/// H.264 E.1.1, without HRD parameters.
fn vui_parameters(w: &mut NaluWriter, sps: &Sps) {
    let vui = &sps.vui_parameters;
    assert!(
        !vui.nal_hrd_parameters_present_flag && !vui.vcl_hrd_parameters_present_flag,
        "HRD parameters are not synthesized"
    );

    w.write_bit(vui.aspect_ratio_info_present_flag);
    if vui.aspect_ratio_info_present_flag {
        w.write_u(8, vui.aspect_ratio_idc);
        if vui.aspect_ratio_idc == EXTENDED_SAR {
            w.write_u(16, vui.sar_width);
            w.write_u(16, vui.sar_height);
        }
    }

    w.write_bit(vui.overscan_info_present_flag);
    if vui.overscan_info_present_flag {
        w.write_bit(vui.overscan_appropriate_flag);
    }

    w.write_bit(vui.video_signal_type_present_flag);
    if vui.video_signal_type_present_flag {
        w.write_u(3, vui.video_format);
        w.write_bit(vui.video_full_range_flag);

        w.write_bit(vui.colour_description_present_flag);
        if vui.colour_description_present_flag {
            w.write_u(8, vui.colour_primaries);
            w.write_u(8, vui.transfer_characteristics);
            w.write_u(8, vui.matrix_coefficients);
        }
    }

    w.write_bit(vui.chroma_loc_info_present_flag);
    if vui.chroma_loc_info_present_flag {
        w.write_ue(vui.chroma_sample_loc_type_top_field);
        w.write_ue(vui.chroma_sample_loc_type_bottom_field);
    }

    w.write_bit(vui.timing_info_present_flag);
    if vui.timing_info_present_flag {
        w.write_u(32, vui.num_units_in_tick);
        w.write_u(32, vui.time_scale);
        w.write_bit(vui.fixed_frame_rate_flag);
    }

    // nal_hrd_parameters_present_flag, vcl_hrd_parameters_present_flag
    w.write_u(2, 0u32);
    w.write_bit(vui.pic_struct_present_flag);

    w.write_bit(vui.bitstream_restriction_flag);
    if vui.bitstream_restriction_flag {
        w.write_bit(vui.motion_vectors_over_pic_boundaries_flag);
        w.write_ue(vui.max_bytes_per_pic_denom);
        w.write_ue(vui.max_bits_per_mb_denom);
        w.write_ue(vui.log2_max_mv_length_horizontal);
        w.write_ue(vui.log2_max_mv_length_vertical);
        w.write_ue(vui.max_num_reorder_frames);
        w.write_ue(vui.max_dec_frame_buffering);
    }
}

/// Appends a PPS NAL unit to `out`. Slice groups are not synthesized.
pub fn pps(out: &mut Vec<u8>, ref_idc: u8, pps: &Pps) {
    assert_eq!(pps.num_slice_groups_minus1, 0, "slice groups are not synthesized");
    let mut w = NaluWriter::new(out, false);

    w.write_header(ref_idc, NaluType::Pps as u8);
    w.write_ue(pps.pic_parameter_set_id);
    w.write_ue(pps.seq_parameter_set_id);
    w.write_bit(pps.entropy_coding_mode_flag);
    w.write_bit(pps.bottom_field_pic_order_in_frame_present_flag);
    w.write_ue(pps.num_slice_groups_minus1);
    w.write_ue(pps.num_ref_idx_l0_default_active_minus1);
    w.write_ue(pps.num_ref_idx_l1_default_active_minus1);
    w.write_bit(pps.weighted_pred_flag);
    w.write_u(2, pps.weighted_bipred_idc);
    w.write_se(pps.pic_init_qp_minus26);
    w.write_se(pps.pic_init_qs_minus26);
    w.write_se(pps.chroma_qp_index_offset);
    w.write_bit(pps.deblocking_filter_control_present_flag);
    w.write_bit(pps.constrained_intra_pred_flag);
    w.write_bit(pps.redundant_pic_cnt_present_flag);

    if pps.transform_8x8_mode_flag
        || pps.pic_scaling_matrix_present_flag
        || pps.second_chroma_qp_index_offset != pps.chroma_qp_index_offset
    {
        w.write_bit(pps.transform_8x8_mode_flag);
        w.write_bit(pps.pic_scaling_matrix_present_flag);

        if pps.pic_scaling_matrix_present_flag {
            let mut count = 6;
            if pps.transform_8x8_mode_flag {
                count += if pps.sps.chroma_format_idc != 3 { 2 } else { 6 };
            }
            absent_scaling_lists(&mut w, count);
        }

        w.write_se(pps.second_chroma_qp_index_offset);
    }

    w.write_trailing_bits();
}

/// Starts a slice NAL unit in `w` and writes its `slice_header()`. The
/// caller appends the slice data and the trailing bits.
pub fn slice_header(w: &mut NaluWriter, ref_idc: u8, idr: bool, hdr: &SliceHeader, pps: &Pps) {
    // H.264 7.3.3
    let sps = &pps.sps;
    let slice_type = hdr.slice_type;

    let nalu_type = if idr {
        NaluType::SliceIdr
    } else {
        NaluType::Slice
    };
    w.write_header(ref_idc, nalu_type as u8);

    w.write_ue(hdr.first_mb_in_slice);
    w.write_ue(slice_type as u8 + if hdr.all_same_type { 5 } else { 0 });
    w.write_ue(hdr.pic_parameter_set_id);

    if sps.separate_colour_plane_flag {
        w.write_u(2, hdr.colour_plane_id);
    }

    w.write_u(usize::from(sps.log2_max_frame_num_minus4) + 4, hdr.frame_num);

    if !sps.frame_mbs_only_flag {
        w.write_bit(hdr.field_pic_flag);
        if hdr.field_pic_flag {
            w.write_bit(hdr.bottom_field_flag);
        }
    }

    if idr {
        w.write_ue(hdr.idr_pic_id);
    }

    if sps.pic_order_cnt_type == 0 {
        w.write_u(
            usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
            hdr.pic_order_cnt_lsb,
        );

        if pps.bottom_field_pic_order_in_frame_present_flag && !hdr.field_pic_flag {
            w.write_se(hdr.delta_pic_order_cnt_bottom);
        }
    }

    if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
        w.write_se(hdr.delta_pic_order_cnt[0]);
        if pps.bottom_field_pic_order_in_frame_present_flag && !hdr.field_pic_flag {
            w.write_se(hdr.delta_pic_order_cnt[1]);
        }
    }

    if pps.redundant_pic_cnt_present_flag {
        w.write_ue(hdr.redundant_pic_cnt);
    }

    if slice_type.is_b() {
        w.write_bit(hdr.direct_spatial_mv_pred_flag);
    }

    if slice_type.is_p() || slice_type.is_sp() || slice_type.is_b() {
        w.write_bit(hdr.num_ref_idx_active_override_flag);
        if hdr.num_ref_idx_active_override_flag {
            w.write_ue(hdr.num_ref_idx_l0_active_minus1);
            if slice_type.is_b() {
                w.write_ue(hdr.num_ref_idx_l1_active_minus1);
            }
        }
    }

    if !slice_type.is_i() && !slice_type.is_si() {
        w.write_bit(hdr.ref_pic_list_modification_flag_l0);
        if hdr.ref_pic_list_modification_flag_l0 {
            ref_pic_list_modification(w, hdr, false);
        }
    }

    if slice_type.is_b() {
        w.write_bit(hdr.ref_pic_list_modification_flag_l1);
        if hdr.ref_pic_list_modification_flag_l1 {
            ref_pic_list_modification(w, hdr, true);
        }
    }

    if (pps.weighted_pred_flag && (slice_type.is_p() || slice_type.is_sp()))
        || (pps.weighted_bipred_idc == 1 && slice_type.is_b())
    {
        pred_weight_table(w, hdr, pps);
    }

    if ref_idc != 0 {
        dec_ref_pic_marking(w, hdr, idr);
    }

    if pps.entropy_coding_mode_flag && !slice_type.is_i() && !slice_type.is_si() {
        w.write_ue(hdr.cabac_init_idc);
    }

    w.write_se(hdr.slice_qp_delta);

    if slice_type.is_sp() || slice_type.is_si() {
        if slice_type.is_sp() {
            w.write_bit(hdr.sp_for_switch_flag);
        }

        w.write_se(hdr.slice_qs_delta);
    }

    if pps.deblocking_filter_control_present_flag {
        w.write_ue(hdr.disable_deblocking_filter_idc);
        if hdr.disable_deblocking_filter_idc != 1 {
            w.write_se(hdr.slice_alpha_c0_offset_div2);
            w.write_se(hdr.slice_beta_offset_div2);
        }
    }
}

/// Writes the operations of one list as given, terminating operation
/// included.
fn ref_pic_list_modification(w: &mut NaluWriter, hdr: &SliceHeader, l1: bool) {
    let mods = match l1 {
        false => &hdr.ref_pic_list_modification_l0,
        true => &hdr.ref_pic_list_modification_l1,
    };

    for m in mods {
        w.write_ue(m.modification_of_pic_nums_idc);
        match m.modification_of_pic_nums_idc {
            0 | 1 => w.write_ue(m.abs_diff_pic_num_minus1),
            2 => w.write_ue(m.long_term_pic_num),
            _ => (),
        }
    }
}

fn pred_weight_table(w: &mut NaluWriter, hdr: &SliceHeader, pps: &Pps) {
    // H.264 7.3.3.2
    let pt = &hdr.pred_weight_table;
    let has_chroma = pps.sps.chroma_array_type() != 0;
    let (num_l0, num_l1) = if hdr.num_ref_idx_active_override_flag {
        (hdr.num_ref_idx_l0_active_minus1, hdr.num_ref_idx_l1_active_minus1)
    } else {
        (
            pps.num_ref_idx_l0_default_active_minus1,
            pps.num_ref_idx_l1_default_active_minus1,
        )
    };

    w.write_ue(pt.luma_log2_weight_denom);
    if has_chroma {
        w.write_ue(pt.chroma_log2_weight_denom);
    }

    let default_luma_weight = 1i16 << pt.luma_log2_weight_denom;
    let default_chroma_weight = 1i16 << pt.chroma_log2_weight_denom;

    let mut lists = vec![(
        &pt.luma_weight_l0,
        &pt.luma_offset_l0,
        &pt.chroma_weight_l0,
        &pt.chroma_offset_l0,
        num_l0,
    )];
    if hdr.slice_type.is_b() {
        lists.push((
            &pt.luma_weight_l1,
            &pt.luma_offset_l1,
            &pt.chroma_weight_l1,
            &pt.chroma_offset_l1,
            num_l1,
        ));
    }

    for (luma_weight, luma_offset, chroma_weight, chroma_offset, num) in lists {
        for i in 0..=usize::from(num) {
            let luma_flag = luma_weight[i] != default_luma_weight || luma_offset[i] != 0;
            w.write_bit(luma_flag);
            if luma_flag {
                w.write_se(luma_weight[i]);
                w.write_se(luma_offset[i]);
            }

            if !has_chroma {
                continue;
            }

            let chroma_flag = (0..2).any(|j| {
                chroma_weight[i][j] != default_chroma_weight || chroma_offset[i][j] != 0
            });
            w.write_bit(chroma_flag);
            if chroma_flag {
                for j in 0..2 {
                    w.write_se(chroma_weight[i][j]);
                    w.write_se(chroma_offset[i][j]);
                }
            }
        }
    }
}

fn dec_ref_pic_marking(w: &mut NaluWriter, hdr: &SliceHeader, idr: bool) {
    // H.264 7.3.3.3
    let rpm = &hdr.dec_ref_pic_marking;

    if idr {
        w.write_bit(rpm.no_output_of_prior_pics_flag);
        w.write_bit(rpm.long_term_reference_flag);
        return;
    }

    w.write_bit(rpm.adaptive_ref_pic_marking_mode_flag);
    if !rpm.adaptive_ref_pic_marking_mode_flag {
        return;
    }

    for marking in &rpm.inner {
        let op = marking.memory_management_control_operation;
        w.write_ue(op);

        if op == 1 || op == 3 {
            w.write_ue(marking.difference_of_pic_nums_minus1);
        }

        if op == 2 {
            w.write_ue(marking.long_term_pic_num);
        }

        if op == 3 || op == 6 {
            w.write_ue(marking.long_term_frame_idx);
        }

        if op == 4 {
            w.write_ue(marking.max_long_term_frame_idx.to_value_plus1());
        }
    }

    // End of the operations.
    w.write_ue(0u32);
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::h264::nalu::Nalu;
    use crate::codec::h264::parser::Parser;
    use crate::codec::h264::parser::SliceType;

    #[test]
    fn synthesize_sps() {
        let raw_sps_buf = [0x00, 0x00, 0x00, 0x01, 0x07, 0x00, 0x00, 0x0a, 0xfb, 0x88];
        let mut raw_sps = Cursor::new(&raw_sps_buf[..]);

        let nalu = Nalu::next(&mut raw_sps).unwrap().unwrap();
        assert_eq!(nalu.header.type_, NaluType::Sps);

        let mut parser = Parser::default();
        let sps = parser.parse_sps(&nalu).unwrap();

        let mut buf = Vec::<u8>::new();
        super::sps(&mut buf, 0, sps);

        assert_eq!(buf, raw_sps_buf);

        let mut cursor = Cursor::new(&buf[..]);
        let nalu = Nalu::next(&mut cursor).unwrap().unwrap();

        let mut parser2 = Parser::default();
        let sps2 = parser2.parse_sps(&nalu).unwrap();

        assert_eq!(sps, sps2);
    }

    #[test]
    fn synthesize_pps() {
        let raw_sps_pps = [
            0x00, 0x00, 0x00, 0x01, 0x07, 0x4d, 0x40, 0x0d, 0xa9, 0x18, 0x28, 0x3e, 0x60, 0x0d,
            0x41, 0x80, 0x41, 0xad, 0xb0, 0xad, 0x7b, 0xdf, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08,
            0xde, 0x09, 0x88,
        ];

        let mut buf = Vec::<u8>::new();

        let mut cursor = Cursor::new(&raw_sps_pps[..]);
        let mut parser: Parser = Default::default();

        while let Some(nalu) = Nalu::next(&mut cursor).unwrap() {
            match nalu.header.type_ {
                NaluType::Sps => {
                    let sps = parser.parse_sps(&nalu).unwrap();
                    super::sps(&mut buf, 0, sps);
                }
                NaluType::Pps => {
                    let pps = parser.parse_pps(&nalu).unwrap();
                    super::pps(&mut buf, 0, pps);
                }
                _ => panic!(),
            }
        }

        assert_eq!(buf, raw_sps_pps);
    }

    #[test]
    fn synthesize_slice_header_prefix() {
        use crate::codec::h264::parser::PpsBuilder;
        use crate::codec::h264::parser::SliceHeaderBuilder;
        use crate::codec::h264::parser::SpsBuilder;

        let sps = SpsBuilder::new().resolution(64, 64).build();
        let pps = PpsBuilder::new(sps).build();
        let mut header = SliceHeaderBuilder::new(&pps)
            .slice_type(SliceType::I)
            .build();
        header.all_same_type = true;

        let mut buf = Vec::<u8>::new();
        {
            let mut w = NaluWriter::new(&mut buf, false);
            slice_header(&mut w, 3, true, &header, &pps);
            w.write_trailing_bits();
        }

        // first_mb_in_slice 0 (1), slice_type 7 (0001000), pps 0 (1),
        // frame_num (0000), idr_pic_id 0 (1), pic_order_cnt_lsb (0000),
        // no_output_of_prior_pics_flag, long_term_reference_flag (00),
        // slice_qp_delta 0 (1) then the stop bit.
        assert_eq!(buf, [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x0c]);
    }
}
