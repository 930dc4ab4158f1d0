//! AVC (H.264) parameter-set parsing.

use crate::bits::{ebsp_to_rbsp, BitReader};
use crate::error::Result;

/// Profiles whose SPS carries explicit chroma/bit-depth information.
const HAS_CHROMA_INFO: [u8; 12] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134];

const SAR_W_TABLE: [u32; 17] = [1, 1, 12, 10, 16, 40, 24, 20, 32, 80, 18, 15, 64, 160, 4, 3, 2];
const SAR_H_TABLE: [u32; 17] = [1, 1, 11, 11, 11, 33, 11, 11, 11, 33, 11, 11, 33, 99, 3, 2, 1];

/// Values extracted from a sequence parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub codec_width: u32,
    pub codec_height: u32,
    pub sar_width: u32,
    pub sar_height: u32,
    pub chroma_format_idc: u32,
    pub bit_depth_luma_minus8: u32,
    pub bit_depth_chroma_minus8: u32,
}

/// Parse an SPS NAL unit (EBSP bytes including the NAL header).
pub fn parse_sps(ebsp: &[u8]) -> Result<SpsInfo> {
    let rbsp = ebsp_to_rbsp(ebsp);
    let mut r = BitReader::new(&rbsp, "avc sps");

    r.skip(8)?; // nal_unit_header
    let profile_idc = r.read_bits(8)? as u8;
    r.skip(16)?; // constraint flags + level_idc
    r.ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    let mut bit_depth_luma_minus8 = 0;
    let mut bit_depth_chroma_minus8 = 0;
    if HAS_CHROMA_INFO.contains(&profile_idc) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            r.skip(1)?; // separate_colour_plane_flag
        }
        bit_depth_luma_minus8 = r.ue()?;
        bit_depth_chroma_minus8 = r.ue()?;
        r.skip(1)?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bool()? {
            // seq_scaling_matrix_present
            let scaling_list_count = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..scaling_list_count {
                if r.read_bool()? {
                    let mut count = if i < 6 { 16 } else { 64 };
                    let mut last_scale = 8i32;
                    while count > 0 && last_scale != 0 {
                        let delta_scale = r.se()?;
                        last_scale = (last_scale + delta_scale) & 0xff;
                        count -= 1;
                    }
                }
            }
        }
    }

    r.ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.ue()?;
    if pic_order_cnt_type == 0 {
        r.ue()?;
    } else if pic_order_cnt_type == 1 {
        r.skip(1)?;
        r.se()?;
        r.se()?;
        let num_ref_frames_in_pic_order_cnt_cycle = r.ue()?;
        for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
            r.se()?;
        }
    }

    r.ue()?; // max_num_ref_frames
    r.skip(1)?;
    let pic_width_in_mbs_minus1 = r.ue()?;
    let pic_height_in_map_units_minus1 = r.ue()?;
    let frame_mbs_only_flag = r.read_bool()?;
    if !frame_mbs_only_flag {
        r.skip(1)?; // mb_adaptive_frame_field_flag
    }
    r.skip(1)?; // direct_8x8_inference_flag

    let mut crop = [0u32; 4];
    if r.read_bool()? {
        for c in &mut crop {
            *c = r.ue()?;
        }
    }

    let mut sar_width = 1;
    let mut sar_height = 1;
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
    }

    let frame_height_factor = if frame_mbs_only_flag { 1 } else { 2 };
    let crop_unit_x = if chroma_format_idc == 0 || chroma_format_idc == 3 { 1 } else { 2 };
    let crop_unit_y = if chroma_format_idc == 1 { 2 } else { 1 } * frame_height_factor;
    let codec_width =
        (pic_width_in_mbs_minus1 + 1) * 16 - (crop[0] + crop[1]) * crop_unit_x;
    let codec_height = frame_height_factor * ((pic_height_in_map_units_minus1 + 1) * 16)
        - (crop[2] + crop[3]) * crop_unit_y;

    Ok(SpsInfo {
        profile_idc,
        codec_width,
        codec_height,
        sar_width,
        sar_height,
        chroma_format_idc,
        bit_depth_luma_minus8,
        bit_depth_chroma_minus8,
    })
}

/// Whether a non-IDR slice NAL codes an I or SI picture. Only consulted
/// when the first bytes carry no emulation prevention, which holds unless
/// `first_mb_in_slice` is enormous.
pub fn slice_is_intra(nal: &[u8]) -> bool {
    if nal.len() < 5 || (nal[1] == 0 && nal[2] == 0 && nal[3] == 3) {
        return false;
    }
    let mut intro = [0u8; 16];
    intro[..4].copy_from_slice(&nal[1..5]);
    let mut r = BitReader::new(&intro, "slice header");
    let slice_type = (|| -> Result<u32> {
        r.ue()?; // first_mb_in_slice
        r.ue()
    })();
    matches!(slice_type, Ok(2 | 4 | 7 | 9))
}
