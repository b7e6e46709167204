//! Annex-B H.264 elementary-stream scanning.
//!
//! The dongle emits access units as Annex-B byte streams (3- or 4-byte
//! start codes). The video pipeline needs three things from them:
//! keyframe detection (any IDR slice), SPS extraction for decoder
//! configuration, and the SPS fields themselves (profile/level and
//! coded dimensions). Emulation-prevention bytes are removed before
//! bitstream parsing, per the H.264 spec.

use crate::error::AutoboxError;

// ── NaluType ─────────────────────────────────────────────────────

/// NAL unit types the pipeline cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Coded slice of a non-IDR picture.
    NonIdr,
    /// Coded slice of an IDR picture (keyframe).
    Idr,
    /// Supplemental enhancement information.
    Sei,
    /// Sequence parameter set.
    Sps,
    /// Picture parameter set.
    Pps,
    /// Access unit delimiter.
    Aud,
    /// Anything else, by raw type value.
    Other(u8),
}

impl NaluType {
    /// Classify from the NAL header byte (`nal_unit_type` = low 5 bits).
    pub fn from_header(header: u8) -> Self {
        match header & 0x1F {
            1 => NaluType::NonIdr,
            5 => NaluType::Idr,
            6 => NaluType::Sei,
            7 => NaluType::Sps,
            8 => NaluType::Pps,
            9 => NaluType::Aud,
            other => NaluType::Other(other),
        }
    }
}

// ── NALU iteration ───────────────────────────────────────────────

/// One NAL unit: `raw` includes the header byte, excludes the start code.
#[derive(Debug, Clone, Copy)]
pub struct Nalu<'a> {
    pub nal_type: NaluType,
    pub raw: &'a [u8],
}

/// Locate the next 3- or 4-byte start code at or after `from`.
/// Returns `(offset, start_code_len)`.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Iterator over the NAL units of an Annex-B stream.
pub struct NaluIter<'a> {
    data: &'a [u8],
    /// Byte offset of the next unconsumed position.
    pos: usize,
}

impl<'a> Iterator for NaluIter<'a> {
    type Item = Nalu<'a>;

    fn next(&mut self) -> Option<Nalu<'a>> {
        let (start, sc_len) = find_start_code(self.data, self.pos)?;
        let body_start = start + sc_len;
        if body_start >= self.data.len() {
            self.pos = self.data.len();
            return None;
        }
        let body_end = find_start_code(self.data, body_start)
            .map(|(next, _)| next)
            .unwrap_or(self.data.len());
        self.pos = body_end;
        let raw = &self.data[body_start..body_end];
        Some(Nalu {
            nal_type: NaluType::from_header(raw[0]),
            raw,
        })
    }
}

/// Iterate the NAL units of `data`.
pub fn iter_nalus(data: &[u8]) -> NaluIter<'_> {
    NaluIter { data, pos: 0 }
}

/// First NAL unit of the given type, if any.
pub fn find_nalu(data: &[u8], wanted: NaluType) -> Option<&[u8]> {
    iter_nalus(data)
        .find(|n| n.nal_type == wanted)
        .map(|n| n.raw)
}

/// `true` when the stream contains an IDR slice.
pub fn is_keyframe(data: &[u8]) -> bool {
    iter_nalus(data).any(|n| n.nal_type == NaluType::Idr)
}

/// Remove emulation-prevention bytes (`00 00 03` → `00 00`).
pub fn rbsp_unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

// ── SPS parsing ──────────────────────────────────────────────────

/// The SPS fields needed to configure a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    /// Coded width in pixels, cropping applied.
    pub width: u32,
    /// Coded height in pixels, cropping applied.
    pub height: u32,
}

impl SpsInfo {
    /// RFC 6381 codec string, e.g. `avc1.64002A`.
    pub fn codec_string(&self) -> String {
        format!(
            "avc1.{:02X}{:02X}{:02X}",
            self.profile_idc, self.constraint_flags, self.level_idc
        )
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    fn read_bit(&mut self) -> Result<u32, AutoboxError> {
        let byte = self.bit / 8;
        if byte >= self.data.len() {
            return Err(AutoboxError::SpsParse("bitstream exhausted"));
        }
        let shift = 7 - (self.bit % 8);
        self.bit += 1;
        Ok(((self.data[byte] >> shift) & 1) as u32)
    }

    fn read_bits(&mut self, n: usize) -> Result<u32, AutoboxError> {
        let mut v = 0u32;
        for _ in 0..n {
            v = (v << 1) | self.read_bit()?;
        }
        Ok(v)
    }

    /// Unsigned exp-Golomb.
    fn ue(&mut self) -> Result<u32, AutoboxError> {
        let mut zeros = 0usize;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return Err(AutoboxError::SpsParse("exp-golomb run too long"));
            }
        }
        let suffix = self.read_bits(zeros)?;
        Ok((1u32 << zeros) - 1 + suffix)
    }

    /// Signed exp-Golomb.
    fn se(&mut self) -> Result<i32, AutoboxError> {
        let v = self.ue()?;
        let magnitude = ((v + 1) / 2) as i32;
        Ok(if v % 2 == 1 { magnitude } else { -magnitude })
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), AutoboxError> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Parse an SPS NAL unit (`raw` includes the header byte).
pub fn parse_sps(raw: &[u8]) -> Result<SpsInfo, AutoboxError> {
    if raw.is_empty() || NaluType::from_header(raw[0]) != NaluType::Sps {
        return Err(AutoboxError::SpsParse("not an SPS NAL unit"));
    }
    let rbsp = rbsp_unescape(&raw[1..]);
    if rbsp.len() < 3 {
        return Err(AutoboxError::SpsParse("sps too short"));
    }

    let profile_idc = rbsp[0];
    let constraint_flags = rbsp[1];
    let level_idc = rbsp[2];

    let mut r = BitReader::new(&rbsp[3..]);
    let _sps_id = r.ue()?;

    let mut chroma_format_idc = 1u32;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            let _separate_colour_plane = r.read_bit()?;
        }
        let _bit_depth_luma = r.ue()?;
        let _bit_depth_chroma = r.ue()?;
        let _qpprime_y_zero = r.read_bit()?;
        if r.read_bit()? == 1 {
            // seq_scaling_matrix_present
            let count = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..count {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num = r.ue()?;
    let pic_order_cnt_type = r.ue()?;
    if pic_order_cnt_type == 0 {
        let _log2_max_pic_order_cnt_lsb = r.ue()?;
    } else if pic_order_cnt_type == 1 {
        let _delta_pic_order_always_zero = r.read_bit()?;
        let _offset_for_non_ref_pic = r.se()?;
        let _offset_for_top_to_bottom = r.se()?;
        let num_ref_frames_in_cycle = r.ue()?;
        for _ in 0..num_ref_frames_in_cycle {
            let _offset_for_ref_frame = r.se()?;
        }
    }

    let _max_num_ref_frames = r.ue()?;
    let _gaps_in_frame_num_allowed = r.read_bit()?;

    let pic_width_in_mbs_minus1 = r.ue()?;
    let pic_height_in_map_units_minus1 = r.ue()?;
    let frame_mbs_only = r.read_bit()?;
    if frame_mbs_only == 0 {
        let _mb_adaptive_frame_field = r.read_bit()?;
    }
    let _direct_8x8_inference = r.read_bit()?;

    let mut crop = (0u32, 0u32, 0u32, 0u32);
    if r.read_bit()? == 1 {
        crop = (r.ue()?, r.ue()?, r.ue()?, r.ue()?);
    }

    // Crop units per the spec: for 4:2:0, 2 px horizontally and
    // 2 * (2 - frame_mbs_only) vertically.
    let (crop_unit_x, crop_unit_y) = match chroma_format_idc {
        0 => (1, 2 - frame_mbs_only),
        1 => (2, 2 * (2 - frame_mbs_only)),
        2 => (2, 2 - frame_mbs_only),
        _ => (1, 2 - frame_mbs_only),
    };

    let width = (pic_width_in_mbs_minus1 + 1) * 16 - (crop.0 + crop.1) * crop_unit_x;
    let height =
        (2 - frame_mbs_only) * (pic_height_in_map_units_minus1 + 1) * 16 - (crop.2 + crop.3) * crop_unit_y;

    Ok(SpsInfo {
        profile_idc,
        constraint_flags,
        level_idc,
        width,
        height,
    })
}

// ── Test support ─────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_support {
    /// Minimal bit writer used to synthesize SPS payloads in tests.
    pub struct BitWriter {
        bytes: Vec<u8>,
        bit: usize,
    }

    impl BitWriter {
        pub fn new() -> Self {
            Self {
                bytes: Vec::new(),
                bit: 0,
            }
        }

        pub fn put_bit(&mut self, b: u32) {
            if self.bit % 8 == 0 {
                self.bytes.push(0);
            }
            if b != 0 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 1 << (7 - (self.bit % 8));
            }
            self.bit += 1;
        }

        pub fn put_bits(&mut self, v: u32, n: usize) {
            for i in (0..n).rev() {
                self.put_bit((v >> i) & 1);
            }
        }

        pub fn put_ue(&mut self, v: u32) {
            let code = v + 1;
            let len = 32 - code.leading_zeros() as usize;
            for _ in 0..len - 1 {
                self.put_bit(0);
            }
            self.put_bits(code, len);
        }

        pub fn finish(mut self) -> Vec<u8> {
            // rbsp_stop_one_bit + alignment
            self.put_bit(1);
            while self.bit % 8 != 0 {
                self.put_bit(0);
            }
            self.bytes
        }
    }

    /// Build a baseline-profile SPS NAL for the given dimensions
    /// (multiples of 16, no cropping).
    pub fn synth_sps(width: u32, height: u32) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_ue(0); // sps_id
        w.put_ue(0); // log2_max_frame_num_minus4
        w.put_ue(0); // pic_order_cnt_type = 0
        w.put_ue(0); //   log2_max_pic_order_cnt_lsb_minus4
        w.put_ue(1); // max_num_ref_frames
        w.put_bit(0); // gaps_in_frame_num_value_allowed
        w.put_ue(width / 16 - 1); // pic_width_in_mbs_minus1
        w.put_ue(height / 16 - 1); // pic_height_in_map_units_minus1
        w.put_bit(1); // frame_mbs_only
        w.put_bit(0); // direct_8x8_inference
        w.put_bit(0); // frame_cropping
        w.put_bit(0); // vui_parameters_present
        let body = w.finish();

        let mut nal = vec![0x67, 66, 0x00, 30]; // header, profile, flags, level
        nal.extend_from_slice(&body);
        nal
    }
}

// ── Tests ────────────────────────────────────────────────────────
