//! HEVC (H.265) parameter-set parsing.

use crate::bits::{ebsp_to_rbsp, BitReader};
use crate::error::Result;

const SAR_W_TABLE: [u32; 17] = [1, 1, 12, 10, 16, 40, 24, 20, 32, 80, 18, 15, 64, 160, 4, 3, 2];
const SAR_H_TABLE: [u32; 17] = [1, 1, 11, 11, 11, 33, 11, 11, 11, 33, 11, 11, 33, 99, 3, 2, 1];

/// Values extracted from an HEVC sequence parameter set; everything the
/// `hvc1`/`hvcC` sample entry needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub codec_width: u32,
    pub codec_height: u32,
    pub sar_width: u32,
    pub sar_height: u32,
    pub chroma_format_idc: u32,
    pub bit_depth_luma_minus8: u32,
    pub bit_depth_chroma_minus8: u32,
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: [u8; 4],
    pub general_constraint_indicator_flags: [u8; 6],
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u32,
    pub temporal_id_nesting_flag: bool,
}

/// Values extracted from a video parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpsInfo {
    pub num_temporal_layers: u32,
    pub temporal_id_nesting_flag: bool,
}

/// Parse a VPS NAL unit.
pub fn parse_vps(ebsp: &[u8]) -> Result<VpsInfo> {
    let rbsp = ebsp_to_rbsp(ebsp);
    let mut r = BitReader::new(&rbsp, "hevc vps");
    r.skip(16)?; // nal_unit_header
    r.skip(12)?; // vps id, base layer flags, max_layers_minus1
    let num_temporal_layers = r.read_bits(3)? + 1;
    let temporal_id_nesting_flag = r.read_bool()?;
    Ok(VpsInfo {
        num_temporal_layers,
        temporal_id_nesting_flag,
    })
}

/// Parse a PPS NAL unit for the `parallelism_type` the hvcC box wants.
pub fn parse_pps(ebsp: &[u8]) -> Result<u8> {
    let rbsp = ebsp_to_rbsp(ebsp);
    let mut r = BitReader::new(&rbsp, "hevc pps");
    r.skip(16)?; // nal_unit_header
    r.ue()?; // pps_pic_parameter_set_id
    r.ue()?; // pps_seq_parameter_set_id
    r.skip(7)?; // dependent_slice/output_flag/extra_bits/sign_hiding/cabac_init
    r.ue()?; // num_ref_idx_l0_default_active_minus1
    r.ue()?; // num_ref_idx_l1_default_active_minus1
    r.se()?; // init_qp_minus26
    r.skip(2)?; // constrained_intra_pred, transform_skip
    if r.read_bool()? {
        r.ue()?; // diff_cu_qp_delta_depth
    }
    r.se()?; // pps_cb_qp_offset
    r.se()?; // pps_cr_qp_offset
    r.skip(4)?; // slice-level qp offsets, weighted pred flags, transquant
    let tiles_enabled_flag = r.read_bool()?;
    let entropy_coding_sync_enabled_flag = r.read_bool()?;
    Ok(match (tiles_enabled_flag, entropy_coding_sync_enabled_flag) {
        (false, false) => 1,
        (false, true) => 3,
        (true, false) => 2,
        (true, true) => 0,
    })
}

/// Parse an SPS NAL unit (EBSP bytes including the 2-byte NAL header).
pub fn parse_sps(ebsp: &[u8]) -> Result<SpsInfo> {
    let rbsp = ebsp_to_rbsp(ebsp);
    let mut r = BitReader::new(&rbsp, "hevc sps");

    r.skip(16)?; // nal_unit_header
    r.skip(4)?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = r.read_bits(3)? as usize;
    let temporal_id_nesting_flag = r.read_bool()?;

    // profile_tier_level
    let general_profile_space = r.read_bits(2)? as u8;
    let general_tier_flag = r.read_bool()?;
    let general_profile_idc = r.read_bits(5)? as u8;
    let mut general_profile_compatibility_flags = [0u8; 4];
    for b in &mut general_profile_compatibility_flags {
        *b = r.read_bits(8)? as u8;
    }
    let mut general_constraint_indicator_flags = [0u8; 6];
    for b in &mut general_constraint_indicator_flags {
        *b = r.read_bits(8)? as u8;
    }
    let general_level_idc = r.read_bits(8)? as u8;

    let mut sub_layer_profile_present = [false; 8];
    let mut sub_layer_level_present = [false; 8];
    for i in 0..max_sub_layers_minus1 {
        sub_layer_profile_present[i] = r.read_bool()?;
        sub_layer_level_present[i] = r.read_bool()?;
    }
    if max_sub_layers_minus1 > 0 {
        r.skip(2 * (8 - max_sub_layers_minus1))?;
    }
    for i in 0..max_sub_layers_minus1 {
        if sub_layer_profile_present[i] {
            r.skip(88)?;
        }
        if sub_layer_level_present[i] {
            r.skip(8)?;
        }
    }

    r.ue()?; // sps_seq_parameter_set_id
    let chroma_format_idc = r.ue()?;
    if chroma_format_idc == 3 {
        r.skip(1)?; // separate_colour_plane_flag
    }
    let pic_width_in_luma_samples = r.ue()?;
    let pic_height_in_luma_samples = r.ue()?;
    let mut window = [0u32; 4];
    if r.read_bool()? {
        // conformance window
        for w in &mut window {
            *w = r.ue()?;
        }
    }
    let bit_depth_luma_minus8 = r.ue()?;
    let bit_depth_chroma_minus8 = r.ue()?;
    let log2_max_pic_order_cnt_lsb_minus4 = r.ue()? as usize;
    let sub_layer_ordering_info_present = r.read_bool()?;
    let ordering_count = if sub_layer_ordering_info_present {
        max_sub_layers_minus1
    } else {
        0
    };
    for _ in 0..=ordering_count {
        r.ue()?; // sps_max_dec_pic_buffering_minus1
        r.ue()?; // sps_max_num_reorder_pics
        r.ue()?; // sps_max_latency_increase_plus1
    }

    r.ue()?; // log2_min_luma_coding_block_size_minus3
    r.ue()?; // log2_diff_max_min_luma_coding_block_size
    r.ue()?; // log2_min_luma_transform_block_size_minus2
    r.ue()?; // log2_diff_max_min_luma_transform_block_size
    r.ue()?; // max_transform_hierarchy_depth_inter
    r.ue()?; // max_transform_hierarchy_depth_intra

    if r.read_bool()? {
        // scaling_list_enabled_flag
        if r.read_bool()? {
            // sps_scaling_list_data_present_flag
            for size_id in 0..4 {
                let matrix_count = if size_id == 3 { 2 } else { 6 };
                for _ in 0..matrix_count {
                    if r.read_bool()? {
                        let mut coef_num = 64.min(1 << (4 + (size_id << 1)));
                        if size_id > 1 {
                            r.se()?; // scaling_list_dc_coef
                        }
                        while coef_num > 0 {
                            r.se()?;
                            coef_num -= 1;
                        }
                    } else {
                        r.ue()?; // scaling_list_pred_matrix_id_delta
                    }
                }
            }
        }
    }

    r.skip(2)?; // amp_enabled, sample_adaptive_offset_enabled
    if r.read_bool()? {
        // pcm_enabled
        r.skip(8)?; // pcm sample bit depths
        r.ue()?; // log2_min_pcm_luma_coding_block_size_minus3
        r.ue()?; // log2_diff_max_min_pcm_luma_coding_block_size
        r.skip(1)?; // pcm_loop_filter_disabled_flag
    }

    let num_short_term_ref_pic_sets = r.ue()?;
    let mut num_delta_pocs = 0u32;
    for i in 0..num_short_term_ref_pic_sets {
        let inter_ref_pic_set_prediction = if i != 0 { r.read_bool()? } else { false };
        if inter_ref_pic_set_prediction {
            r.skip(1)?; // delta_rps_sign
            r.ue()?; // abs_delta_rps_minus1
            let mut next_num_delta_pocs = 0;
            for _ in 0..=num_delta_pocs {
                let used_by_curr_pic = r.read_bool()?;
                let use_delta = if !used_by_curr_pic {
                    r.read_bool()?
                } else {
                    false
                };
                if used_by_curr_pic || use_delta {
                    next_num_delta_pocs += 1;
                }
            }
            num_delta_pocs = next_num_delta_pocs;
        } else {
            let num_negative_pics = r.ue()?;
            let num_positive_pics = r.ue()?;
            num_delta_pocs = num_negative_pics.saturating_add(num_positive_pics);
            for _ in 0..num_delta_pocs {
                r.ue()?; // delta_poc_s*_minus1
                r.skip(1)?; // used_by_curr_pic_s*_flag
            }
        }
    }
    if r.read_bool()? {
        // long_term_ref_pics_present
        let num_long_term_ref_pics = r.ue()?;
        for _ in 0..num_long_term_ref_pics {
            r.skip(log2_max_pic_order_cnt_lsb_minus4 + 4)?;
            r.skip(1)?;
        }
    }

    let mut min_spatial_segmentation_idc = 0;
    let mut sar_width = 1;
    let mut sar_height = 1;

    r.skip(2)?; // sps_temporal_mvp_enabled, strong_intra_smoothing
    if r.read_bool()? {
        // VUI
        if r.read_bool()? {
            let aspect_ratio_idc = r.read_bits(8)? as usize;
            if aspect_ratio_idc < SAR_W_TABLE.len() {
                sar_width = SAR_W_TABLE[aspect_ratio_idc];
                sar_height = SAR_H_TABLE[aspect_ratio_idc];
            } else if aspect_ratio_idc == 255 {
                sar_width = r.read_bits(16)?;
                sar_height = r.read_bits(16)?.max(1);
            }
        }
        if r.read_bool()? {
            r.skip(1)?; // overscan_appropriate_flag
        }
        if r.read_bool()? {
            // video_signal_type_present
            r.skip(4)?; // video_format, video_full_range
            if r.read_bool()? {
                r.skip(24)?; // colour primaries, transfer, matrix
            }
        }
        if r.read_bool()? {
            // chroma_loc_info_present
            r.ue()?;
            r.ue()?;
        }
        r.skip(3)?; // neutral_chroma, field_seq, frame_field_info
        if r.read_bool()? {
            // default_display_window
            r.ue()?;
            r.ue()?;
            r.ue()?;
            r.ue()?;
        }
        if r.read_bool()? {
            // vui_timing_info
            r.skip(64)?; // num_units_in_tick, time_scale
            if r.read_bool()? {
                r.ue()?; // num_ticks_poc_diff_one_minus1
            }
            if r.read_bool()? {
                skip_hrd_parameters(&mut r, max_sub_layers_minus1)?;
            }
        }
        if r.read_bool()? {
            // bitstream_restriction
            r.skip(3)?;
            min_spatial_segmentation_idc = r.ue()?;
            r.ue()?; // max_bytes_per_pic_denom
            r.ue()?; // max_bits_per_min_cu_denom
            r.ue()?; // log2_max_mv_length_horizontal
            r.ue()?; // log2_max_mv_length_vertical
        }
    }

    let sub_width_c = if chroma_format_idc == 1 || chroma_format_idc == 2 { 2 } else { 1 };
    let sub_height_c = if chroma_format_idc == 1 { 2 } else { 1 };
    let codec_width = pic_width_in_luma_samples - (window[0] + window[1]) * sub_width_c;
    let codec_height = pic_height_in_luma_samples - (window[2] + window[3]) * sub_height_c;

    Ok(SpsInfo {
        codec_width,
        codec_height,
        sar_width,
        sar_height,
        chroma_format_idc,
        bit_depth_luma_minus8,
        bit_depth_chroma_minus8,
        general_profile_space,
        general_tier_flag,
        general_profile_idc,
        general_profile_compatibility_flags,
        general_constraint_indicator_flags,
        general_level_idc,
        min_spatial_segmentation_idc,
        temporal_id_nesting_flag,
    })
}

fn skip_hrd_parameters(r: &mut BitReader<'_>, max_sub_layers_minus1: usize) -> Result<()> {
    let mut sub_pic_hrd_params_present = false;
    let nal_hrd_parameters_present = r.read_bool()?;
    let vcl_hrd_parameters_present = r.read_bool()?;
    if nal_hrd_parameters_present || vcl_hrd_parameters_present {
        sub_pic_hrd_params_present = r.read_bool()?;
        if sub_pic_hrd_params_present {
            r.skip(19)?;
        }
        r.skip(8)?; // bit_rate_scale, cpb_size_scale
        if sub_pic_hrd_params_present {
            r.skip(4)?;
        }
        r.skip(15)?; // initial/au/dpb delay length fields
    }
    for _ in 0..=max_sub_layers_minus1 {
        let fixed_pic_rate_general = r.read_bool()?;
        let fixed_pic_rate_within_cvs = if !fixed_pic_rate_general {
            r.read_bool()?
        } else {
            false
        };
        let mut low_delay_hrd = false;
        if fixed_pic_rate_within_cvs {
            r.se()?; // elemental_duration_in_tc_minus1
        } else {
            low_delay_hrd = r.read_bool()?;
        }
        let cpb_cnt = if !low_delay_hrd { r.ue()? + 1 } else { 1 };
        let loops =
            u32::from(nal_hrd_parameters_present) + u32::from(vcl_hrd_parameters_present);
        for _ in 0..loops {
            for _ in 0..cpb_cnt {
                r.ue()?; // bit_rate_value_minus1
                r.ue()?; // cpb_size_value_minus1
                if sub_pic_hrd_params_present {
                    r.ue()?;
                    r.ue()?;
                }
                r.skip(1)?; // cbr_flag
            }
        }
    }
    Ok(())
}
