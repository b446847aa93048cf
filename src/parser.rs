// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! OBU-level syntax parsing: sequence headers, frame headers, tile group
//! headers and metadata, plus the OBU framing itself.
//!
//! The parser owns the header-level view of the eight reference slots, since
//! frame headers predict segmentation, loop filter deltas, global motion and
//! film grain from previously decoded headers.

use std::rc::Rc;

use anyhow::anyhow;
use enumn::N;

use crate::helpers;
use crate::reader::Reader;

pub const NUM_REF_FRAMES: usize = 8;
pub const REFS_PER_FRAME: usize = 7;
pub const MAX_SEGMENTS: usize = 8;
pub const MAX_TILE_COLS: usize = 64;
pub const MAX_TILE_ROWS: usize = 64;
pub const MAX_CDEF_STRENGTHS: usize = 8;
pub const MAX_OPERATING_POINTS: usize = 32;
pub const MAX_FILM_GRAIN_Y_POINTS: usize = 14;
pub const MAX_FILM_GRAIN_UV_POINTS: usize = 10;
pub const PRIMARY_REF_NONE: u32 = 7;
pub const MAX_TILE_WIDTH: u32 = 4096;
pub const MAX_TILE_AREA: u32 = 4096 * 2304;

/// "Color primaries" value for BT.709 per ISO/IEC 23091-4/ITU-T H.273.
pub const COLOR_PRI_BT709: u8 = 1;
/// "Color primaries"/"Transfer characteristics"/"Matrix coefficients"
/// unspecified value per ISO/IEC 23091-4/ITU-T H.273.
pub const COLOR_UNKNOWN: u8 = 2;
/// "Transfer characteristics" value for sRGB per ISO/IEC 23091-4/ITU-T H.273.
pub const TRC_SRGB: u8 = 13;
/// "Matrix coefficients" value for the identity matrix per ISO/IEC
/// 23091-4/ITU-T H.273. Requires 4:4:4 sampling in strict mode.
pub const MC_IDENTITY: u8 = 0;

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObuType {
    #[default]
    Reserved = 0,
    SequenceHeader = 1,
    TemporalDelimiter = 2,
    FrameHeader = 3,
    TileGroup = 4,
    Metadata = 5,
    Frame = 6,
    RedundantFrameHeader = 7,
    TileList = 8,
    Reserved2 = 9,
    Reserved3 = 10,
    Reserved4 = 11,
    Reserved5 = 12,
    Reserved6 = 13,
    Reserved7 = 14,
    Padding = 15,
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
enum ObuMetaType {
    HdrContentLightLevel = 1,
    HdrMasteringDisplay = 2,
    Scalability = 3,
    ItutT35 = 4,
    Timecode = 5,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Profile {
    #[default]
    Profile0 = 0,
    Profile1 = 1,
    Profile2 = 2,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelLayout {
    #[default]
    I400 = 0,
    I420 = 1,
    I422 = 2,
    I444 = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChromaSamplePosition {
    #[default]
    Unknown = 0,
    Vertical = 1,
    Colocated = 2,
    Reserved = 3,
}

/// A tool toggle that the sequence header can fix for the whole sequence or
/// defer to each frame header.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AdaptiveBoolean {
    #[default]
    Off = 0,
    On = 1,
    Adaptive = 2,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameType {
    #[default]
    Key = 0,
    Inter = 1,
    Intra = 2,
    Switch = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterMode {
    #[default]
    EightTapRegular = 0,
    EightTapSmooth = 1,
    EightTapSharp = 2,
    Bilinear = 3,
    Switchable = 4,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TxfmMode {
    #[default]
    Only4x4 = 0,
    Largest = 1,
    Switchable = 2,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RestorationType {
    #[default]
    None = 0,
    Switchable = 1,
    Wiener = 2,
    Sgrproj = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum WarpModelType {
    #[default]
    Identity = 0,
    Translation = 1,
    RotZoom = 2,
    Affine = 3,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceOperatingPoint {
    /// Mask of the temporal (low byte) and spatial (high nibble) layers that
    /// belong to this operating point. Zero means all layers.
    pub idc: u32,
    pub major_level: u32,
    pub minor_level: u32,
    pub tier: u32,
    pub decoder_model_param_present: bool,
    pub display_model_param_present: bool,
    /// Number of decoded frames that should be present in the buffer pool
    /// before the first presentable frame is displayed. Defaults to 10 when
    /// not signaled.
    pub initial_display_delay: u32,
}

/// Smoothing-buffer parameters of one operating point. Allowed to change
/// between sequence headers of a single video sequence, so excluded from
/// structural sequence comparison.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperatingParameterInfo {
    pub decoder_buffer_delay: u32,
    pub encoder_buffer_delay: u32,
    pub low_delay_mode: bool,
}

/// A parsed Sequence Header OBU. Immutable once published; the decoder
/// context holds it behind an `Rc` and replaces the whole descriptor when a
/// new sequence header arrives.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceHeader {
    pub profile: Profile,
    /// Maximum frame width minus the override any frame header may apply.
    pub max_width: u32,
    pub max_height: u32,
    pub layout: PixelLayout,
    /// "Color primaries" per ISO/IEC 23091-4/ITU-T H.273.
    pub pri: u8,
    /// "Transfer characteristics" per ISO/IEC 23091-4/ITU-T H.273.
    pub trc: u8,
    /// "Matrix coefficients" per ISO/IEC 23091-4/ITU-T H.273.
    pub mtrx: u8,
    pub chr: ChromaSamplePosition,
    /// High bit depth ladder: 0 is 8 bits per sample, 1 is 10, 2 is 12.
    pub hbd: u32,
    pub color_range: bool,
    pub num_operating_points: usize,
    pub operating_points: [SequenceOperatingPoint; MAX_OPERATING_POINTS],
    pub still_picture: bool,
    pub reduced_still_picture_header: bool,
    pub timing_info_present: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub equal_picture_interval: bool,
    pub num_ticks_per_picture: u32,
    pub decoder_model_info_present: bool,
    pub encoder_decoder_buffer_delay_length: u32,
    pub num_units_in_decoding_tick: u32,
    pub buffer_removal_delay_length: u32,
    pub frame_presentation_delay_length: u32,
    pub display_model_info_present: bool,
    pub width_n_bits: u32,
    pub height_n_bits: u32,
    pub frame_id_numbers_present: bool,
    pub delta_frame_id_n_bits: u32,
    pub frame_id_n_bits: u32,
    /// Superblocks carry 128x128 luma samples instead of 64x64.
    pub sb128: bool,
    pub filter_intra: bool,
    pub intra_edge_filter: bool,
    pub inter_intra: bool,
    pub masked_compound: bool,
    pub warped_motion: bool,
    pub dual_filter: bool,
    pub order_hint: bool,
    pub jnt_comp: bool,
    pub ref_frame_mvs: bool,
    pub screen_content_tools: AdaptiveBoolean,
    pub force_integer_mv: AdaptiveBoolean,
    /// Number of bits used for order hints; valid range 1..=8 when
    /// `order_hint` is set, zero otherwise.
    pub order_hint_n_bits: u32,
    pub super_res: bool,
    pub cdef: bool,
    pub restoration: bool,
    pub ss_hor: bool,
    pub ss_ver: bool,
    pub monochrome: bool,
    pub color_description_present: bool,
    pub separate_uv_delta_q: bool,
    pub film_grain_present: bool,
    pub operating_parameter_info: [OperatingParameterInfo; MAX_OPERATING_POINTS],
}

impl SequenceHeader {
    /// Bits per sample.
    pub fn bit_depth(&self) -> u32 {
        8 + 2 * self.hbd
    }

    /// Whether two sequence headers describe the same video sequence.
    ///
    /// `operating_parameter_info` is allowed to change between sequence
    /// headers of a single sequence (see 7.5) and is excluded from the
    /// comparison.
    pub fn eq_structural(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.operating_parameter_info = Default::default();
        b.operating_parameter_info = Default::default();
        a == b
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SuperResParams {
    pub enabled: bool,
    /// Denominator of the width upscale ratio, 9..=16 when enabled and 8
    /// (no scaling) otherwise. The numerator is always 8.
    pub width_scale_denominator: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TilingParams {
    pub uniform: bool,
    /// Number of bytes used to code each tile size, 1..=4.
    pub n_bytes: u32,
    pub min_log2_cols: u32,
    pub max_log2_cols: u32,
    pub max_log2_rows: u32,
    pub min_log2_rows: u32,
    pub log2_cols: u32,
    pub log2_rows: u32,
    pub cols: u32,
    pub rows: u32,
    /// Start column of each tile in superblock units, terminated by a
    /// sentinel entry holding the frame width in superblocks.
    pub col_start_sb: [u32; MAX_TILE_COLS + 1],
    pub row_start_sb: [u32; MAX_TILE_ROWS + 1],
    /// Tile whose final CDF state seeds the next frame's contexts.
    pub update: u32,
}

impl Default for TilingParams {
    fn default() -> Self {
        Self {
            uniform: Default::default(),
            n_bytes: Default::default(),
            min_log2_cols: Default::default(),
            max_log2_cols: Default::default(),
            max_log2_rows: Default::default(),
            min_log2_rows: Default::default(),
            log2_cols: Default::default(),
            log2_rows: Default::default(),
            cols: Default::default(),
            rows: Default::default(),
            col_start_sb: [0; MAX_TILE_COLS + 1],
            row_start_sb: [0; MAX_TILE_ROWS + 1],
            update: Default::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuantParams {
    /// Base quantizer index for Y AC coefficients.
    pub yac: u8,
    pub ydc_delta: i8,
    pub udc_delta: i8,
    pub uac_delta: i8,
    pub vdc_delta: i8,
    pub vac_delta: i8,
    pub qm: bool,
    pub qm_y: u8,
    pub qm_u: u8,
    pub qm_v: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentationData {
    pub delta_q: i16,
    pub delta_lf_y_v: i8,
    pub delta_lf_y_h: i8,
    pub delta_lf_u: i8,
    pub delta_lf_v: i8,
    /// Fixed reference frame for the segment, -1 when unused.
    pub ref_frame: i8,
    pub skip: bool,
    pub globalmv: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentationDataSet {
    pub d: [SegmentationData; MAX_SEGMENTS],
    /// Whether any segment forces the segment id to be read before the skip
    /// flag.
    pub preskip: bool,
    pub last_active_segid: i8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentationParams {
    pub enabled: bool,
    pub update_map: bool,
    pub temporal: bool,
    pub update_data: bool,
    pub seg_data: SegmentationDataSet,
    /// Effective quantizer index per segment.
    pub qidx: [u8; MAX_SEGMENTS],
    pub lossless: [bool; MAX_SEGMENTS],
    pub all_lossless: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeltaQParams {
    pub present: bool,
    pub res_log2: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeltaLfParams {
    pub present: bool,
    pub res_log2: u32,
    pub multi: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeltaParams {
    pub q: DeltaQParams,
    pub lf: DeltaLfParams,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopfilterModeRefDeltas {
    pub mode_delta: [i8; 2],
    pub ref_delta: [i8; NUM_REF_FRAMES],
}

impl Default for LoopfilterModeRefDeltas {
    fn default() -> Self {
        Self {
            mode_delta: [0, 0],
            ref_delta: [1, 0, 0, 0, -1, 0, -1, -1],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopfilterParams {
    pub level_y: [u8; 2],
    pub level_u: u8,
    pub level_v: u8,
    pub sharpness: u8,
    pub mode_ref_delta_enabled: bool,
    pub mode_ref_delta_update: bool,
    /// Inherited from the primary reference frame when one exists.
    pub mode_ref_deltas: LoopfilterModeRefDeltas,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CdefParams {
    pub damping: u8,
    /// Number of bits needed to select a CDEF strength pair, 0..=3.
    pub n_bits: u8,
    pub y_strength: [u8; MAX_CDEF_STRENGTHS],
    pub uv_strength: [u8; MAX_CDEF_STRENGTHS],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestorationParams {
    pub types: [RestorationType; 3],
    /// Log2 of the restoration unit size per plane.
    pub unit_size: [u8; 3],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WarpedMotionParams {
    pub warp_model: WarpModelType,
    /// Fixed-point affine coefficients; indices 2 and 5 default to unity in
    /// Q16.
    pub matrix: [i32; 6],
}

impl Default for WarpedMotionParams {
    fn default() -> Self {
        Self {
            warp_model: WarpModelType::Identity,
            matrix: [0, 0, 1 << 16, 0, 0, 1 << 16],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilmGrainData {
    pub seed: u16,
    pub num_y_points: u32,
    pub y_points: [[u8; 2]; MAX_FILM_GRAIN_Y_POINTS],
    pub chroma_scaling_from_luma: bool,
    pub num_uv_points: [u32; 2],
    pub uv_points: [[[u8; 2]; MAX_FILM_GRAIN_UV_POINTS]; 2],
    pub scaling_shift: u32,
    pub ar_coeff_lag: u32,
    pub ar_coeffs_y: [i8; 24],
    pub ar_coeffs_uv: [[i8; 28]; 2],
    pub ar_coeff_shift: u32,
    pub grain_scale_shift: u32,
    pub uv_mult: [i32; 2],
    pub uv_luma_mult: [i32; 2],
    pub uv_offset: [i32; 2],
    pub overlap_flag: bool,
    pub clip_to_restricted_range: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilmGrainHeader {
    pub present: bool,
    /// When unset the grain data is copied from the reference frame named by
    /// the bitstream, with only the seed replaced.
    pub update: bool,
    pub data: FilmGrainData,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameOperatingPoint {
    /// Frame removal time in decoder clock ticks for this operating point.
    pub buffer_removal_time: u32,
}

/// A parsed frame header. Mutable while it is being parsed, immutable once
/// the decoder context publishes it behind an `Rc` and attaches it to
/// reference slots and output pictures.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    /// Post-superres (index 0) and pre-superres (index 1) frame width.
    pub width: [u32; 2],
    pub height: u32,
    /// Low order bits of this frame's presentation order.
    pub frame_offset: u32,
    pub temporal_id: u32,
    pub spatial_id: u32,
    pub show_existing_frame: bool,
    pub existing_frame_idx: usize,
    pub frame_id: u32,
    pub frame_presentation_delay: u32,
    pub show_frame: bool,
    pub showable_frame: bool,
    pub error_resilient_mode: bool,
    pub disable_cdf_update: bool,
    pub allow_screen_content_tools: bool,
    pub force_integer_mv: bool,
    pub frame_size_override: bool,
    /// Reference whose CDFs, segmentation, loop filter deltas and global
    /// motion seed this frame, or `PRIMARY_REF_NONE`.
    pub primary_ref_frame: u32,
    pub buffer_removal_time_present: bool,
    pub operating_points: [FrameOperatingPoint; MAX_OPERATING_POINTS],
    /// Mask of the reference slots this frame replaces once decoded.
    pub refresh_frame_flags: u32,
    pub render_width: u32,
    pub render_height: u32,
    pub super_res: SuperResParams,
    pub have_render_size: bool,
    pub allow_intrabc: bool,
    pub frame_ref_short_signaling: bool,
    /// The seven active references into the reference slot table.
    pub refidx: [i32; REFS_PER_FRAME],
    /// Motion vectors use eighth-pel precision instead of quarter-pel.
    pub hp: bool,
    pub subpel_filter_mode: FilterMode,
    pub switchable_motion_mode: bool,
    pub use_ref_frame_mvs: bool,
    pub refresh_context: bool,
    pub tiling: TilingParams,
    pub quant: QuantParams,
    pub segmentation: SegmentationParams,
    pub delta: DeltaParams,
    pub loopfilter: LoopfilterParams,
    pub cdef: CdefParams,
    pub restoration: RestorationParams,
    pub txfm_mode: TxfmMode,
    pub switchable_comp_refs: bool,
    pub skip_mode_allowed: bool,
    pub skip_mode_enabled: bool,
    pub skip_mode_refs: [i32; 2],
    pub warp_motion: bool,
    pub reduced_txtp_set: bool,
    pub gmv: [WarpedMotionParams; REFS_PER_FRAME],
    pub film_grain: FilmGrainHeader,
}

impl FrameHeader {
    pub fn is_intra(&self) -> bool {
        matches!(self.frame_type, FrameType::Key | FrameType::Intra)
    }

    pub fn is_inter_or_switch(&self) -> bool {
        matches!(self.frame_type, FrameType::Inter | FrameType::Switch)
    }
}

/// HDR content light level metadata, carried until attached to an output
/// picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContentLightLevel {
    pub max_content_light_level: u16,
    pub max_frame_average_light_level: u16,
}

/// HDR mastering display color volume metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MasteringDisplay {
    /// 0.16 fixed point RGB chromaticities.
    pub primaries: [[u16; 2]; 3],
    pub white_point: [u16; 2],
    /// 24.8 fixed point maximum luminance, candela per square meter.
    pub max_luminance: u32,
    /// 18.14 fixed point minimum luminance, candela per square meter.
    pub min_luminance: u32,
}

/// An ITU-T T.35 user data payload, copied verbatim from the bitstream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ItutT35 {
    pub country_code: u8,
    pub country_code_extension_byte: u8,
    pub payload: Vec<u8>,
}

/// Result of parsing one Metadata OBU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataObu {
    ContentLight(ContentLightLevel),
    MasteringDisplay(MasteringDisplay),
    ItutT35(ItutT35),
    /// Scalability, timecode, unregistered-private and malformed T.35
    /// metadata are consumed without effect.
    Skipped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObuHeader {
    pub obu_type: ObuType,
    pub extension_flag: bool,
    pub has_size_field: bool,
    pub temporal_id: u32,
    pub spatial_id: u32,
}

/// One OBU as delimited by the demultiplexer: the framing header plus the
/// location of the payload inside the input buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Obu<'a> {
    pub header: ObuHeader,
    /// The input buffer backing the OBU.
    pub data: &'a [u8],
    /// Where the payload starts, after the header and size field.
    pub start_offset: usize,
    /// Payload size in bytes.
    pub size: usize,
}

impl<'a> Obu<'a> {
    /// Total number of input bytes this OBU spans, i.e. how far the caller's
    /// cursor advances.
    pub fn consumed(&self) -> usize {
        self.start_offset + self.size
    }
}

impl<'a> AsRef<[u8]> for Obu<'a> {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.start_offset..self.start_offset + self.size]
    }
}

pub enum ParsedObu<'a> {
    /// We should process the OBU normally.
    Process(Obu<'a>),
    /// The OBU does not belong to the selected operating point layers and
    /// should be skipped by advancing this many bytes.
    Drop(usize),
}

/// How the parser state changed after installing a sequence header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceChange {
    /// First sequence header of the stream.
    First,
    /// Structurally identical to the previous one.
    Same,
    /// Only the operating parameter info changed.
    NewOperatingParameters,
    /// A different video sequence; all cross-frame state must be dropped.
    NewSequence,
}

/// The OBU syntax parser.
///
/// Holds the state that survives across OBUs and is needed to parse the next
/// one: the current sequence header, the selected operating point, and the
/// header-level view of the eight reference slots.
#[derive(Debug, Default)]
pub struct Parser {
    strict_std_compliance: bool,
    operating_point: usize,
    operating_point_idc: u32,
    max_spatial_id: u32,
    seq_hdr: Option<Rc<SequenceHeader>>,
    ref_hdrs: [Option<Rc<FrameHeader>>; NUM_REF_FRAMES],
}

impl Parser {
    pub fn new(strict_std_compliance: bool, operating_point: usize) -> Self {
        Self {
            strict_std_compliance,
            operating_point,
            ..Default::default()
        }
    }

    pub fn sequence(&self) -> anyhow::Result<&Rc<SequenceHeader>> {
        self.seq_hdr
            .as_ref()
            .ok_or_else(|| anyhow!("no sequence header parsed yet"))
    }

    pub fn have_sequence(&self) -> bool {
        self.seq_hdr.is_some()
    }

    pub fn max_spatial_id(&self) -> u32 {
        self.max_spatial_id
    }

    pub fn ref_hdr(&self, slot: usize) -> Option<&Rc<FrameHeader>> {
        self.ref_hdrs[slot].as_ref()
    }

    /// Installs `hdr` into the slots named by `refresh_frame_flags`.
    pub fn apply_refresh(&mut self, hdr: &Rc<FrameHeader>, refresh_frame_flags: u32) {
        for (i, slot) in self.ref_hdrs.iter_mut().enumerate() {
            if refresh_frame_flags & (1 << i) != 0 {
                *slot = Some(Rc::clone(hdr));
            }
        }
    }

    /// Replicates slot `idx`'s header into every other slot, as mandated when
    /// a key frame is output through show_existing_frame.
    pub fn fan_out_key_hdrs(&mut self, idx: usize) {
        let src = self.ref_hdrs[idx].clone();
        for (i, slot) in self.ref_hdrs.iter_mut().enumerate() {
            if i != idx {
                *slot = src.clone();
            }
        }
    }

    pub fn clear_ref_hdrs(&mut self) {
        self.ref_hdrs = Default::default();
    }

    /// Reads one OBU framing header from `data` and locates the payload.
    ///
    /// OBUs outside the selected operating point's temporal and spatial
    /// layers come back as [`ParsedObu::Drop`] with the number of bytes to
    /// skip.
    pub fn parse_obu<'a>(&self, data: &'a [u8]) -> anyhow::Result<ParsedObu<'a>> {
        if data.is_empty() {
            return Err(anyhow!("empty input"));
        }

        let mut r = Reader::new(data);

        let forbidden_bit = r.read_bit()?;
        if self.strict_std_compliance && forbidden_bit {
            return Err(anyhow!("forbidden bit set in OBU header"));
        }

        let mut header = ObuHeader {
            obu_type: ObuType::n(r.read_bits(4)?).ok_or_else(|| anyhow!("invalid OBU type"))?,
            extension_flag: false,
            has_size_field: false,
            temporal_id: 0,
            spatial_id: 0,
        };
        header.extension_flag = r.read_bit()?;
        header.has_size_field = r.read_bit()?;
        let _obu_reserved_bit = r.read_bit()?;

        if header.extension_flag {
            header.temporal_id = r.read_bits(3)?;
            header.spatial_id = r.read_bits(2)?;
            let _ = r.read_bits(3)?;
        }

        let (start_offset, size) = if header.has_size_field {
            let size = r.read_uleb128()? as usize;
            let start_offset = (r.position() / 8) as usize;
            if size > data.len() - start_offset {
                return Err(anyhow!(
                    "OBU length {} exceeds the {} remaining bytes",
                    size,
                    data.len() - start_offset
                ));
            }
            (start_offset, size)
        } else {
            let start_offset = (r.position() / 8) as usize;
            (start_offset, data.len() - start_offset)
        };

        let obu = Obu {
            header,
            data,
            start_offset,
            size,
        };

        // Skip OBUs not belonging to the selected temporal/spatial layer.
        if obu.header.obu_type != ObuType::SequenceHeader
            && obu.header.obu_type != ObuType::TemporalDelimiter
            && obu.header.extension_flag
            && self.operating_point_idc != 0
        {
            let in_temporal_layer = (self.operating_point_idc >> obu.header.temporal_id) & 1 != 0;
            let in_spatial_layer =
                (self.operating_point_idc >> (obu.header.spatial_id + 8)) & 1 != 0;
            if !in_temporal_layer || !in_spatial_layer {
                return Ok(ParsedObu::Drop(obu.consumed()));
            }
        }

        Ok(ParsedObu::Process(obu))
    }

    /// Parses a Sequence Header OBU payload. See 5.5.
    pub fn parse_sequence_header_payload(
        data: &[u8],
        strict_std_compliance: bool,
    ) -> anyhow::Result<SequenceHeader> {
        let mut r = Reader::new(data);
        let s = Self::parse_seq_hdr(&mut r, strict_std_compliance)?;
        r.check_trailing_bits(strict_std_compliance)?;
        Ok(s)
    }

    fn parse_seq_hdr(r: &mut Reader, strict: bool) -> anyhow::Result<SequenceHeader> {
        let mut s = SequenceHeader::default();

        s.profile =
            Profile::n(r.read_bits(3)?).ok_or_else(|| anyhow!("invalid sequence profile"))?;
        s.still_picture = r.read_bit()?;
        s.reduced_still_picture_header = r.read_bit()?;
        if s.reduced_still_picture_header && !s.still_picture {
            return Err(anyhow!("reduced still picture header without still picture"));
        }

        if s.reduced_still_picture_header {
            s.num_operating_points = 1;
            s.operating_points[0].major_level = r.read_bits(3)?;
            s.operating_points[0].minor_level = r.read_bits(2)?;
            s.operating_points[0].initial_display_delay = 10;
        } else {
            s.timing_info_present = r.read_bit()?;
            if s.timing_info_present {
                s.num_units_in_tick = r.read_bits(32)?;
                s.time_scale = r.read_bits(32)?;
                if strict && (s.num_units_in_tick == 0 || s.time_scale == 0) {
                    return Err(anyhow!("zero-valued timing info"));
                }
                s.equal_picture_interval = r.read_bit()?;
                if s.equal_picture_interval {
                    let num_ticks_per_picture = r.read_uvlc()?;
                    if num_ticks_per_picture == u32::MAX {
                        return Err(anyhow!("invalid num_ticks_per_picture"));
                    }
                    s.num_ticks_per_picture = num_ticks_per_picture + 1;
                }

                s.decoder_model_info_present = r.read_bit()?;
                if s.decoder_model_info_present {
                    s.encoder_decoder_buffer_delay_length = r.read_bits(5)? + 1;
                    s.num_units_in_decoding_tick = r.read_bits(32)?;
                    if strict && s.num_units_in_decoding_tick == 0 {
                        return Err(anyhow!("zero num_units_in_decoding_tick"));
                    }
                    s.buffer_removal_delay_length = r.read_bits(5)? + 1;
                    s.frame_presentation_delay_length = r.read_bits(5)? + 1;
                }
            }

            s.display_model_info_present = r.read_bit()?;
            s.num_operating_points = r.read_bits(5)? as usize + 1;
            let decoder_model_info_present = s.decoder_model_info_present;
            let display_model_info_present = s.display_model_info_present;
            let delay_length = s.encoder_decoder_buffer_delay_length;
            for i in 0..s.num_operating_points {
                let op = &mut s.operating_points[i];
                op.idc = r.read_bits(12)?;
                if op.idc != 0 && (op.idc & 0xff == 0 || op.idc & 0xf00 == 0) {
                    return Err(anyhow!("invalid operating point idc {:#x}", op.idc));
                }
                op.major_level = 2 + r.read_bits(3)?;
                op.minor_level = r.read_bits(2)?;
                if op.major_level > 3 {
                    op.tier = u32::from(r.read_bit()?);
                }
                if decoder_model_info_present {
                    op.decoder_model_param_present = r.read_bit()?;
                    if op.decoder_model_param_present {
                        let opi = &mut s.operating_parameter_info[i];
                        let n = u8::try_from(delay_length)?;
                        opi.decoder_buffer_delay = r.read_bits(n)?;
                        opi.encoder_buffer_delay = r.read_bits(n)?;
                        opi.low_delay_mode = r.read_bit()?;
                    }
                }
                let op = &mut s.operating_points[i];
                if display_model_info_present {
                    op.display_model_param_present = r.read_bit()?;
                }
                op.initial_display_delay = if op.display_model_param_present {
                    r.read_bits(4)? + 1
                } else {
                    10
                };
            }
        }

        s.width_n_bits = r.read_bits(4)? + 1;
        s.height_n_bits = r.read_bits(4)? + 1;
        s.max_width = r.read_bits(u8::try_from(s.width_n_bits)?)? + 1;
        s.max_height = r.read_bits(u8::try_from(s.height_n_bits)?)? + 1;
        if !s.reduced_still_picture_header {
            s.frame_id_numbers_present = r.read_bit()?;
            if s.frame_id_numbers_present {
                s.delta_frame_id_n_bits = r.read_bits(4)? + 2;
                s.frame_id_n_bits = r.read_bits(3)? + s.delta_frame_id_n_bits + 1;
            }
        }

        s.sb128 = r.read_bit()?;
        s.filter_intra = r.read_bit()?;
        s.intra_edge_filter = r.read_bit()?;
        if s.reduced_still_picture_header {
            s.screen_content_tools = AdaptiveBoolean::Adaptive;
            s.force_integer_mv = AdaptiveBoolean::Adaptive;
        } else {
            s.inter_intra = r.read_bit()?;
            s.masked_compound = r.read_bit()?;
            s.warped_motion = r.read_bit()?;
            s.dual_filter = r.read_bit()?;
            s.order_hint = r.read_bit()?;
            if s.order_hint {
                s.jnt_comp = r.read_bit()?;
                s.ref_frame_mvs = r.read_bit()?;
            }
            s.screen_content_tools = if r.read_bit()? {
                AdaptiveBoolean::Adaptive
            } else if r.read_bit()? {
                AdaptiveBoolean::On
            } else {
                AdaptiveBoolean::Off
            };
            s.force_integer_mv = if s.screen_content_tools != AdaptiveBoolean::Off {
                if r.read_bit()? {
                    AdaptiveBoolean::Adaptive
                } else if r.read_bit()? {
                    AdaptiveBoolean::On
                } else {
                    AdaptiveBoolean::Off
                }
            } else {
                // Reserved as "absent": integer MV selection never applies
                // when screen content tools are off.
                AdaptiveBoolean::Adaptive
            };
            if s.order_hint {
                s.order_hint_n_bits = r.read_bits(3)? + 1;
            }
        }
        s.super_res = r.read_bit()?;
        s.cdef = r.read_bit()?;
        s.restoration = r.read_bit()?;

        s.hbd = u32::from(r.read_bit()?);
        if s.profile == Profile::Profile2 && s.hbd != 0 {
            s.hbd += u32::from(r.read_bit()?);
        }
        if s.profile != Profile::Profile1 {
            s.monochrome = r.read_bit()?;
        }
        s.color_description_present = r.read_bit()?;
        if s.color_description_present {
            s.pri = r.read_bits(8)? as u8;
            s.trc = r.read_bits(8)? as u8;
            s.mtrx = r.read_bits(8)? as u8;
        } else {
            s.pri = COLOR_UNKNOWN;
            s.trc = COLOR_UNKNOWN;
            s.mtrx = COLOR_UNKNOWN;
        }
        if s.monochrome {
            s.color_range = r.read_bit()?;
            s.layout = PixelLayout::I400;
            s.ss_hor = true;
            s.ss_ver = true;
            s.chr = ChromaSamplePosition::Unknown;
        } else if s.pri == COLOR_PRI_BT709 && s.trc == TRC_SRGB && s.mtrx == MC_IDENTITY {
            s.layout = PixelLayout::I444;
            s.color_range = true;
            if s.profile != Profile::Profile1 && !(s.profile == Profile::Profile2 && s.hbd == 2) {
                return Err(anyhow!("sRGB colorspace requires 4:4:4 capable profile"));
            }
        } else {
            s.color_range = r.read_bit()?;
            match s.profile {
                Profile::Profile0 => {
                    s.layout = PixelLayout::I420;
                    s.ss_hor = true;
                    s.ss_ver = true;
                }
                Profile::Profile1 => {
                    s.layout = PixelLayout::I444;
                }
                Profile::Profile2 => {
                    if s.hbd == 2 {
                        s.ss_hor = r.read_bit()?;
                        if s.ss_hor {
                            s.ss_ver = r.read_bit()?;
                        }
                    } else {
                        s.ss_hor = true;
                    }
                    s.layout = if s.ss_hor {
                        if s.ss_ver {
                            PixelLayout::I420
                        } else {
                            PixelLayout::I422
                        }
                    } else {
                        PixelLayout::I444
                    };
                }
            }
            s.chr = if s.ss_hor && s.ss_ver {
                ChromaSamplePosition::n(r.read_bits(2)?)
                    .ok_or_else(|| anyhow!("invalid chroma sample position"))?
            } else {
                ChromaSamplePosition::Unknown
            };
        }
        if strict && s.mtrx == MC_IDENTITY && s.layout != PixelLayout::I444 {
            return Err(anyhow!("identity matrix coefficients require 4:4:4"));
        }
        if !s.monochrome {
            s.separate_uv_delta_q = r.read_bit()?;
        }

        s.film_grain_present = r.read_bit()?;

        Ok(s)
    }

    /// Installs a freshly parsed sequence header, re-derives the operating
    /// point selection, and reports how the sequence changed. On a sequence
    /// change, the header-level reference slots are dropped.
    pub fn install_sequence(&mut self, seq: Rc<SequenceHeader>) -> SequenceChange {
        let op_idx = if self.operating_point < seq.num_operating_points {
            self.operating_point
        } else {
            0
        };
        self.operating_point_idc = seq.operating_points[op_idx].idc;
        let spatial_mask = self.operating_point_idc >> 8;
        self.max_spatial_id = if spatial_mask != 0 {
            helpers::floor_log2(spatial_mask)
        } else {
            0
        };

        let change = match &self.seq_hdr {
            None => SequenceChange::First,
            Some(old) if !old.eq_structural(&seq) => SequenceChange::NewSequence,
            Some(old) if old.operating_parameter_info != seq.operating_parameter_info => {
                SequenceChange::NewOperatingParameters
            }
            Some(_) => SequenceChange::Same,
        };

        if change == SequenceChange::NewSequence {
            self.clear_ref_hdrs();
        }
        self.seq_hdr = Some(seq);

        change
    }

    // 5.9.5 and 5.9.7. With `use_ref`, the size may be inherited from any of
    // the seven references instead of being coded.
    fn read_frame_size(
        &self,
        fh: &mut FrameHeader,
        r: &mut Reader,
        seq: &SequenceHeader,
        use_ref: bool,
    ) -> anyhow::Result<()> {
        if use_ref {
            for i in 0..REFS_PER_FRAME {
                if r.read_bit()? {
                    let refhdr = self.ref_hdrs[fh.refidx[i] as usize]
                        .as_ref()
                        .ok_or_else(|| anyhow!("frame size inherited from an empty slot"))?;
                    fh.width[1] = refhdr.width[1];
                    fh.height = refhdr.height;
                    fh.render_width = refhdr.render_width;
                    fh.render_height = refhdr.render_height;
                    Self::read_superres(fh, r, seq)?;
                    return Ok(());
                }
            }
        }

        if fh.frame_size_override {
            fh.width[1] = r.read_bits(seq.width_n_bits as u8)? + 1;
            fh.height = r.read_bits(seq.height_n_bits as u8)? + 1;
        } else {
            fh.width[1] = seq.max_width;
            fh.height = seq.max_height;
        }
        Self::read_superres(fh, r, seq)?;
        fh.have_render_size = r.read_bit()?;
        if fh.have_render_size {
            fh.render_width = r.read_bits(16)? + 1;
            fh.render_height = r.read_bits(16)? + 1;
        } else {
            fh.render_width = fh.width[1];
            fh.render_height = fh.height;
        }
        Ok(())
    }

    // 5.9.8
    fn read_superres(fh: &mut FrameHeader, r: &mut Reader, seq: &SequenceHeader) -> anyhow::Result<()> {
        fh.super_res.enabled = seq.super_res && r.read_bit()?;
        if fh.super_res.enabled {
            let d = 9 + r.read_bits(3)?;
            fh.super_res.width_scale_denominator = d;
            fh.width[0] = std::cmp::max(
                (fh.width[1] * 8 + (d >> 1)) / d,
                std::cmp::min(16, fh.width[1]),
            );
        } else {
            fh.super_res.width_scale_denominator = 8;
            fh.width[0] = fh.width[1];
        }
        Ok(())
    }

    /// Derives refidx[1..7] from the order hints of the eight reference
    /// slots when `frame_ref_short_signaling` is set. Only refidx[0] and
    /// refidx[3] are coded; the rest follow from the wrapped order-hint
    /// distance of each slot to the current frame:
    ///
    ///   - the slot with the minimum distance is reserved as the fallback
    ///     and is never assigned directly,
    ///   - refidx[6] takes the latest remaining slot,
    ///   - refidx[4] and refidx[5] take the two earliest remaining slots,
    ///   - every other position takes the latest remaining slot, falling
    ///     back to the reserved earliest slot once the pool is exhausted.
    fn set_frame_refs_short(
        &self,
        fh: &mut FrameHeader,
        r: &mut Reader,
        seq: &SequenceHeader,
    ) -> anyhow::Result<()> {
        const USED: i32 = i32::MIN;

        fn take_latest(diff: &mut [i32; NUM_REF_FRAMES]) -> Option<usize> {
            let mut best: Option<usize> = None;
            for (i, &d) in diff.iter().enumerate() {
                if d != USED && best.map_or(true, |b| d >= diff[b]) {
                    best = Some(i);
                }
            }
            if let Some(b) = best {
                diff[b] = USED;
            }
            best
        }

        fn take_earliest(diff: &mut [i32; NUM_REF_FRAMES]) -> Option<usize> {
            let mut best: Option<usize> = None;
            for (i, &d) in diff.iter().enumerate() {
                if d != USED && best.map_or(true, |b| d < diff[b]) {
                    best = Some(i);
                }
            }
            if let Some(b) = best {
                diff[b] = USED;
            }
            best
        }

        fh.refidx[0] = r.read_bits(3)? as i32;
        fh.refidx[1] = -1;
        fh.refidx[2] = -1;
        fh.refidx[3] = r.read_bits(3)? as i32;

        let mut diff = [0i32; NUM_REF_FRAMES];
        let mut earliest_ref = 0;
        let mut earliest_diff = i32::MAX;
        for (i, slot) in self.ref_hdrs.iter().enumerate() {
            let refhdr = slot
                .as_ref()
                .ok_or_else(|| anyhow!("short signaling with empty reference slot {}", i))?;
            let d = helpers::get_poc_diff(
                seq.order_hint_n_bits,
                refhdr.frame_offset as i32,
                fh.frame_offset as i32,
            );
            diff[i] = d;
            if d < earliest_diff {
                earliest_diff = d;
                earliest_ref = i as i32;
            }
        }

        diff[fh.refidx[0] as usize] = USED;
        diff[fh.refidx[3] as usize] = USED;
        diff[earliest_ref as usize] = USED;

        fh.refidx[6] = take_latest(&mut diff).map_or(earliest_ref, |i| i as i32);
        for i in [4, 5] {
            fh.refidx[i] = take_earliest(&mut diff).map_or(earliest_ref, |j| j as i32);
        }
        for i in 1..REFS_PER_FRAME {
            if fh.refidx[i] < 0 {
                fh.refidx[i] = take_latest(&mut diff).map_or(earliest_ref, |j| j as i32);
            }
        }

        Ok(())
    }

    // 5.9.15
    fn parse_tiling(fh: &mut FrameHeader, r: &mut Reader, seq: &SequenceHeader) -> anyhow::Result<()> {
        let sbsz_min1 = (64 << u32::from(seq.sb128)) - 1;
        let sbsz_log2 = 6 + u32::from(seq.sb128);
        let sbw = (fh.width[0] + sbsz_min1) >> sbsz_log2;
        let sbh = (fh.height + sbsz_min1) >> sbsz_log2;
        let max_tile_width_sb = MAX_TILE_WIDTH >> sbsz_log2;
        let max_tile_area_sb = MAX_TILE_AREA >> (2 * sbsz_log2);

        let t = &mut fh.tiling;
        t.uniform = r.read_bit()?;

        t.min_log2_cols = helpers::tile_log2(max_tile_width_sb, sbw);
        t.max_log2_cols = helpers::tile_log2(1, std::cmp::min(sbw, MAX_TILE_COLS as u32));
        t.max_log2_rows = helpers::tile_log2(1, std::cmp::min(sbh, MAX_TILE_ROWS as u32));
        let min_log2_tiles = std::cmp::max(
            helpers::tile_log2(max_tile_area_sb, sbw * sbh),
            t.min_log2_cols,
        );

        if t.uniform {
            t.log2_cols = t.min_log2_cols;
            while t.log2_cols < t.max_log2_cols && r.read_bit()? {
                t.log2_cols += 1;
            }
            let tile_w = 1 + ((sbw - 1) >> t.log2_cols);
            t.cols = 0;
            let mut sbx = 0;
            while sbx < sbw {
                t.col_start_sb[t.cols as usize] = sbx;
                sbx += tile_w;
                t.cols += 1;
            }
            t.min_log2_rows = min_log2_tiles.saturating_sub(t.log2_cols);

            t.log2_rows = t.min_log2_rows;
            while t.log2_rows < t.max_log2_rows && r.read_bit()? {
                t.log2_rows += 1;
            }
            let tile_h = 1 + ((sbh - 1) >> t.log2_rows);
            t.rows = 0;
            let mut sby = 0;
            while sby < sbh {
                t.row_start_sb[t.rows as usize] = sby;
                sby += tile_h;
                t.rows += 1;
            }
        } else {
            t.cols = 0;
            let mut widest_tile = 0;
            // The recomputed cap below replaces the sequence-level area cap
            // for the tile height derivation only; min_log2_tiles above was
            // computed from the original cap.
            let mut max_tile_area_sb = sbw * sbh;
            let mut sbx = 0;
            while sbx < sbw && t.cols < MAX_TILE_COLS as u32 {
                let tile_width_sb = std::cmp::min(sbw - sbx, max_tile_width_sb);
                let tile_w = if tile_width_sb > 1 {
                    1 + r.read_uniform(tile_width_sb)?
                } else {
                    1
                };
                t.col_start_sb[t.cols as usize] = sbx;
                sbx += tile_w;
                widest_tile = std::cmp::max(widest_tile, tile_w);
                t.cols += 1;
            }
            if sbx < sbw {
                return Err(anyhow!("too many tile columns"));
            }
            t.log2_cols = helpers::tile_log2(1, t.cols);
            if min_log2_tiles != 0 {
                max_tile_area_sb >>= min_log2_tiles + 1;
            }
            let max_tile_height_sb = std::cmp::max(max_tile_area_sb / widest_tile, 1);

            t.rows = 0;
            let mut sby = 0;
            while sby < sbh && t.rows < MAX_TILE_ROWS as u32 {
                let tile_height_sb = std::cmp::min(sbh - sby, max_tile_height_sb);
                let tile_h = if tile_height_sb > 1 {
                    1 + r.read_uniform(tile_height_sb)?
                } else {
                    1
                };
                t.row_start_sb[t.rows as usize] = sby;
                sby += tile_h;
                t.rows += 1;
            }
            if sby < sbh {
                return Err(anyhow!("too many tile rows"));
            }
            t.log2_rows = helpers::tile_log2(1, t.rows);
        }
        t.col_start_sb[t.cols as usize] = sbw;
        t.row_start_sb[t.rows as usize] = sbh;
        if t.log2_cols != 0 || t.log2_rows != 0 {
            t.update = r.read_bits(u8::try_from(t.log2_cols + t.log2_rows)?)?;
            if t.update >= t.cols * t.rows {
                return Err(anyhow!("invalid context update tile id {}", t.update));
            }
            t.n_bytes = r.read_bits(2)? + 1;
        }

        Ok(())
    }

    // 5.9.12
    fn parse_quant(fh: &mut FrameHeader, r: &mut Reader, seq: &SequenceHeader) -> anyhow::Result<()> {
        let q = &mut fh.quant;
        q.yac = r.read_bits(8)? as u8;
        q.ydc_delta = r.read_delta_q()? as i8;
        if !seq.monochrome {
            // The sequence header lets the U and V planes carry distinct
            // deltas; the frame header decides whether they actually do.
            let diff_uv_delta = seq.separate_uv_delta_q && r.read_bit()?;
            q.udc_delta = r.read_delta_q()? as i8;
            q.uac_delta = r.read_delta_q()? as i8;
            if diff_uv_delta {
                q.vdc_delta = r.read_delta_q()? as i8;
                q.vac_delta = r.read_delta_q()? as i8;
            } else {
                q.vdc_delta = q.udc_delta;
                q.vac_delta = q.uac_delta;
            }
        }
        q.qm = r.read_bit()?;
        if q.qm {
            q.qm_y = r.read_bits(4)? as u8;
            q.qm_u = r.read_bits(4)? as u8;
            q.qm_v = if seq.separate_uv_delta_q {
                r.read_bits(4)? as u8
            } else {
                q.qm_u
            };
        }
        Ok(())
    }

    // 5.9.14
    fn parse_segmentation(&self, fh: &mut FrameHeader, r: &mut Reader) -> anyhow::Result<()> {
        let primary_ref_frame = fh.primary_ref_frame;
        let refidx = fh.refidx;
        let s = &mut fh.segmentation;
        s.enabled = r.read_bit()?;
        if s.enabled {
            if primary_ref_frame == PRIMARY_REF_NONE {
                s.update_map = true;
                s.update_data = true;
            } else {
                s.update_map = r.read_bit()?;
                if s.update_map {
                    s.temporal = r.read_bit()?;
                }
                s.update_data = r.read_bit()?;
            }

            if s.update_data {
                s.seg_data.last_active_segid = -1;
                for i in 0..MAX_SEGMENTS {
                    let seg = &mut s.seg_data.d[i];
                    if r.read_bit()? {
                        seg.delta_q = r.read_sbits(9)? as i16;
                        s.seg_data.last_active_segid = i as i8;
                    }
                    if r.read_bit()? {
                        seg.delta_lf_y_v = r.read_sbits(7)? as i8;
                        s.seg_data.last_active_segid = i as i8;
                    }
                    if r.read_bit()? {
                        seg.delta_lf_y_h = r.read_sbits(7)? as i8;
                        s.seg_data.last_active_segid = i as i8;
                    }
                    if r.read_bit()? {
                        seg.delta_lf_u = r.read_sbits(7)? as i8;
                        s.seg_data.last_active_segid = i as i8;
                    }
                    if r.read_bit()? {
                        seg.delta_lf_v = r.read_sbits(7)? as i8;
                        s.seg_data.last_active_segid = i as i8;
                    }
                    if r.read_bit()? {
                        seg.ref_frame = r.read_bits(3)? as i8;
                        s.seg_data.last_active_segid = i as i8;
                        s.seg_data.preskip = true;
                    } else {
                        seg.ref_frame = -1;
                    }
                    seg.skip = r.read_bit()?;
                    if seg.skip {
                        s.seg_data.last_active_segid = i as i8;
                        s.seg_data.preskip = true;
                    }
                    seg.globalmv = r.read_bit()?;
                    if seg.globalmv {
                        s.seg_data.last_active_segid = i as i8;
                        s.seg_data.preskip = true;
                    }
                }
            } else {
                // update_data was unset so the segmentation data is copied
                // wholesale from the primary reference frame.
                let pri_ref = refidx[primary_ref_frame as usize];
                let refhdr = self.ref_hdrs[pri_ref as usize]
                    .as_ref()
                    .ok_or_else(|| anyhow!("segmentation inherited from an empty slot"))?;
                s.seg_data = refhdr.segmentation.seg_data;
            }
        } else {
            for i in 0..MAX_SEGMENTS {
                s.seg_data.d[i].ref_frame = -1;
            }
        }
        Ok(())
    }

    // Derives the per-segment quantizer indices and the lossless flags. A
    // segment is lossless when its effective quantizer index is zero and no
    // dc/ac delta applies.
    fn derive_lossless(fh: &mut FrameHeader) {
        let q = &fh.quant;
        let delta_lossless = q.ydc_delta == 0
            && q.udc_delta == 0
            && q.uac_delta == 0
            && q.vdc_delta == 0
            && q.vac_delta == 0;
        let s = &mut fh.segmentation;
        s.all_lossless = true;
        for i in 0..MAX_SEGMENTS {
            s.qidx[i] = if s.enabled {
                helpers::clip_u8(i32::from(q.yac) + i32::from(s.seg_data.d[i].delta_q))
            } else {
                q.yac
            };
            s.lossless[i] = s.qidx[i] == 0 && delta_lossless;
            s.all_lossless &= s.lossless[i];
        }
    }

    // 5.9.11
    fn parse_loopfilter(
        &self,
        fh: &mut FrameHeader,
        r: &mut Reader,
        seq: &SequenceHeader,
    ) -> anyhow::Result<()> {
        if fh.segmentation.all_lossless || fh.allow_intrabc {
            fh.loopfilter.mode_ref_delta_enabled = true;
            fh.loopfilter.mode_ref_delta_update = true;
            fh.loopfilter.mode_ref_deltas = Default::default();
            return Ok(());
        }

        let inherited_deltas = if fh.primary_ref_frame == PRIMARY_REF_NONE {
            Default::default()
        } else {
            let pri_ref = fh.refidx[fh.primary_ref_frame as usize];
            self.ref_hdrs[pri_ref as usize]
                .as_ref()
                .ok_or_else(|| anyhow!("loop filter deltas inherited from an empty slot"))?
                .loopfilter
                .mode_ref_deltas
        };

        let lf = &mut fh.loopfilter;
        lf.level_y[0] = r.read_bits(6)? as u8;
        lf.level_y[1] = r.read_bits(6)? as u8;
        if !seq.monochrome && (lf.level_y[0] != 0 || lf.level_y[1] != 0) {
            lf.level_u = r.read_bits(6)? as u8;
            lf.level_v = r.read_bits(6)? as u8;
        }
        lf.sharpness = r.read_bits(3)? as u8;

        lf.mode_ref_deltas = inherited_deltas;
        lf.mode_ref_delta_enabled = r.read_bit()?;
        if lf.mode_ref_delta_enabled {
            lf.mode_ref_delta_update = r.read_bit()?;
            if lf.mode_ref_delta_update {
                for i in 0..NUM_REF_FRAMES {
                    if r.read_bit()? {
                        lf.mode_ref_deltas.ref_delta[i] = r.read_sbits(7)? as i8;
                    }
                }
                for i in 0..2 {
                    if r.read_bit()? {
                        lf.mode_ref_deltas.mode_delta[i] = r.read_sbits(7)? as i8;
                    }
                }
            }
        }
        Ok(())
    }

    // 5.9.19
    fn parse_cdef(fh: &mut FrameHeader, r: &mut Reader, seq: &SequenceHeader) -> anyhow::Result<()> {
        if fh.segmentation.all_lossless || !seq.cdef || fh.allow_intrabc {
            return Ok(());
        }
        let cdef = &mut fh.cdef;
        cdef.damping = r.read_bits(2)? as u8 + 3;
        cdef.n_bits = r.read_bits(2)? as u8;
        for i in 0..1usize << cdef.n_bits {
            cdef.y_strength[i] = r.read_bits(6)? as u8;
            if !seq.monochrome {
                cdef.uv_strength[i] = r.read_bits(6)? as u8;
            }
        }
        Ok(())
    }

    // 5.9.20
    fn parse_restoration(
        fh: &mut FrameHeader,
        r: &mut Reader,
        seq: &SequenceHeader,
    ) -> anyhow::Result<()> {
        if (fh.segmentation.all_lossless && !fh.super_res.enabled)
            || !seq.restoration
            || fh.allow_intrabc
        {
            return Ok(());
        }

        let lr = &mut fh.restoration;
        lr.types[0] = RestorationType::n(r.read_bits(2)?)
            .ok_or_else(|| anyhow!("invalid restoration type"))?;
        if !seq.monochrome {
            lr.types[1] = RestorationType::n(r.read_bits(2)?)
                .ok_or_else(|| anyhow!("invalid restoration type"))?;
            lr.types[2] = RestorationType::n(r.read_bits(2)?)
                .ok_or_else(|| anyhow!("invalid restoration type"))?;
        }

        if lr.types.iter().any(|&t| t != RestorationType::None) {
            // Log2 of the restoration unit size.
            lr.unit_size[0] = 6 + u8::from(seq.sb128);
            if r.read_bit()? {
                lr.unit_size[0] += 1;
                if !seq.sb128 {
                    lr.unit_size[0] += u8::from(r.read_bit()?);
                }
            }
            lr.unit_size[1] = lr.unit_size[0];
            if (lr.types[1] != RestorationType::None || lr.types[2] != RestorationType::None)
                && seq.ss_hor
                && seq.ss_ver
            {
                lr.unit_size[1] -= u8::from(r.read_bit()?);
            }
            lr.unit_size[2] = lr.unit_size[1];
        } else {
            lr.unit_size[0] = 8;
        }
        Ok(())
    }

    // Skip mode reference selection, 5.9.22: the closest future reference
    // and the closest past reference form the pair; with no future
    // reference, the two closest past references do.
    fn parse_skip_mode(
        &self,
        fh: &mut FrameHeader,
        r: &mut Reader,
        seq: &SequenceHeader,
    ) -> anyhow::Result<()> {
        if !fh.switchable_comp_refs || !fh.is_inter_or_switch() || !seq.order_hint {
            return Ok(());
        }

        let poc = fh.frame_offset as i32;
        let mut off_before: Option<(i32, usize)> = None;
        let mut off_after: Option<(i32, usize)> = None;
        for i in 0..REFS_PER_FRAME {
            let refhdr = self.ref_hdrs[fh.refidx[i] as usize]
                .as_ref()
                .ok_or_else(|| anyhow!("skip mode derivation with empty reference slot"))?;
            let refpoc = refhdr.frame_offset as i32;

            let diff = helpers::get_poc_diff(seq.order_hint_n_bits, refpoc, poc);
            if diff > 0 {
                if off_after.map_or(true, |(after, _)| {
                    helpers::get_poc_diff(seq.order_hint_n_bits, after, refpoc) > 0
                }) {
                    off_after = Some((refpoc, i));
                }
            } else if diff < 0
                && off_before.map_or(true, |(before, _)| {
                    helpers::get_poc_diff(seq.order_hint_n_bits, refpoc, before) > 0
                })
            {
                off_before = Some((refpoc, i));
            }
        }

        match (off_before, off_after) {
            (Some((_, before_idx)), Some((_, after_idx))) => {
                fh.skip_mode_refs[0] = std::cmp::min(before_idx, after_idx) as i32;
                fh.skip_mode_refs[1] = std::cmp::max(before_idx, after_idx) as i32;
                fh.skip_mode_allowed = true;
            }
            (Some((before, before_idx)), None) => {
                let mut off_before2: Option<(i32, usize)> = None;
                for i in 0..REFS_PER_FRAME {
                    let refhdr = self.ref_hdrs[fh.refidx[i] as usize]
                        .as_ref()
                        .ok_or_else(|| anyhow!("skip mode derivation with empty reference slot"))?;
                    let refpoc = refhdr.frame_offset as i32;
                    if helpers::get_poc_diff(seq.order_hint_n_bits, refpoc, before) < 0
                        && off_before2.map_or(true, |(before2, _)| {
                            helpers::get_poc_diff(seq.order_hint_n_bits, refpoc, before2) > 0
                        })
                    {
                        off_before2 = Some((refpoc, i));
                    }
                }

                if let Some((_, before2_idx)) = off_before2 {
                    fh.skip_mode_refs[0] = std::cmp::min(before_idx, before2_idx) as i32;
                    fh.skip_mode_refs[1] = std::cmp::max(before_idx, before2_idx) as i32;
                    fh.skip_mode_allowed = true;
                }
            }
            _ => (),
        }
        Ok(())
    }

    // 5.9.24 and 5.9.25. Each coefficient is prediction-coded against the
    // primary reference frame's matrix.
    fn parse_global_motion(&self, fh: &mut FrameHeader, r: &mut Reader) -> anyhow::Result<()> {
        if !fh.is_inter_or_switch() {
            return Ok(());
        }

        for i in 0..REFS_PER_FRAME {
            let warp_model = if !r.read_bit()? {
                WarpModelType::Identity
            } else if r.read_bit()? {
                WarpModelType::RotZoom
            } else if r.read_bit()? {
                WarpModelType::Translation
            } else {
                WarpModelType::Affine
            };
            fh.gmv[i].warp_model = warp_model;

            if warp_model == WarpModelType::Identity {
                continue;
            }

            let ref_mat = if fh.primary_ref_frame == PRIMARY_REF_NONE {
                WarpedMotionParams::default().matrix
            } else {
                let pri_ref = fh.refidx[fh.primary_ref_frame as usize];
                self.ref_hdrs[pri_ref as usize]
                    .as_ref()
                    .ok_or_else(|| anyhow!("global motion predicted from an empty slot"))?
                    .gmv[i]
                    .matrix
            };

            let (bits, shift) = if warp_model >= WarpModelType::RotZoom {
                let mat = &mut fh.gmv[i].matrix;
                mat[2] = (1 << 16) + 2 * r.read_bits_subexp((ref_mat[2] - (1 << 16)) >> 1, 12)?;
                mat[3] = 2 * r.read_bits_subexp(ref_mat[3] >> 1, 12)?;
                (12, 10)
            } else {
                (9 - u32::from(!fh.hp), 13 + u32::from(!fh.hp))
            };

            let mat = &mut fh.gmv[i].matrix;
            if warp_model == WarpModelType::Affine {
                mat[4] = 2 * r.read_bits_subexp(ref_mat[4] >> 1, 12)?;
                mat[5] = (1 << 16) + 2 * r.read_bits_subexp((ref_mat[5] - (1 << 16)) >> 1, 12)?;
            } else {
                mat[4] = -mat[3];
                mat[5] = mat[2];
            }

            mat[0] = r.read_bits_subexp(ref_mat[0] >> shift, bits)? * (1 << shift);
            mat[1] = r.read_bits_subexp(ref_mat[1] >> shift, bits)? * (1 << shift);
        }
        Ok(())
    }

    // 5.9.30
    fn parse_film_grain(
        &self,
        fh: &mut FrameHeader,
        r: &mut Reader,
        seq: &SequenceHeader,
    ) -> anyhow::Result<()> {
        if !seq.film_grain_present || (!fh.show_frame && !fh.showable_frame) {
            return Ok(());
        }
        fh.film_grain.present = r.read_bit()?;
        if !fh.film_grain.present {
            return Ok(());
        }

        let seed = r.read_bits(16)? as u16;
        fh.film_grain.update = fh.frame_type != FrameType::Inter || r.read_bit()?;
        if !fh.film_grain.update {
            let refidx = r.read_bits(3)? as i32;
            if !fh.refidx.contains(&refidx) {
                return Err(anyhow!("film grain reference {} not among the active references", refidx));
            }
            let refhdr = self.ref_hdrs[refidx as usize]
                .as_ref()
                .ok_or_else(|| anyhow!("film grain inherited from an empty slot"))?;
            fh.film_grain.data = refhdr.film_grain.data.clone();
            fh.film_grain.data.seed = seed;
            return Ok(());
        }

        let fgd = &mut fh.film_grain.data;
        fgd.seed = seed;

        fgd.num_y_points = r.read_bits(4)?;
        if fgd.num_y_points > MAX_FILM_GRAIN_Y_POINTS as u32 {
            return Err(anyhow!("invalid number of luma scaling points"));
        }
        for i in 0..fgd.num_y_points as usize {
            fgd.y_points[i][0] = r.read_bits(8)? as u8;
            if i != 0 && fgd.y_points[i - 1][0] >= fgd.y_points[i][0] {
                return Err(anyhow!("luma scaling points not strictly increasing"));
            }
            fgd.y_points[i][1] = r.read_bits(8)? as u8;
        }

        if !seq.monochrome {
            fgd.chroma_scaling_from_luma = r.read_bit()?;
        }
        if seq.monochrome
            || fgd.chroma_scaling_from_luma
            || (seq.ss_ver && seq.ss_hor && fgd.num_y_points == 0)
        {
            fgd.num_uv_points = [0, 0];
        } else {
            for pl in 0..2 {
                fgd.num_uv_points[pl] = r.read_bits(4)?;
                if fgd.num_uv_points[pl] > MAX_FILM_GRAIN_UV_POINTS as u32 {
                    return Err(anyhow!("invalid number of chroma scaling points"));
                }
                for i in 0..fgd.num_uv_points[pl] as usize {
                    fgd.uv_points[pl][i][0] = r.read_bits(8)? as u8;
                    if i != 0 && fgd.uv_points[pl][i - 1][0] >= fgd.uv_points[pl][i][0] {
                        return Err(anyhow!("chroma scaling points not strictly increasing"));
                    }
                    fgd.uv_points[pl][i][1] = r.read_bits(8)? as u8;
                }
            }
        }

        if seq.ss_hor && seq.ss_ver && (fgd.num_uv_points[0] != 0) != (fgd.num_uv_points[1] != 0) {
            return Err(anyhow!("4:2:0 chroma scaling points must be present for both planes"));
        }

        fgd.scaling_shift = r.read_bits(2)? + 8;
        fgd.ar_coeff_lag = r.read_bits(2)?;
        let num_y_pos = (2 * fgd.ar_coeff_lag * (fgd.ar_coeff_lag + 1)) as usize;
        if fgd.num_y_points != 0 {
            for i in 0..num_y_pos {
                fgd.ar_coeffs_y[i] = (r.read_bits(8)? as i32 - 128) as i8;
            }
        }
        for pl in 0..2 {
            if fgd.num_uv_points[pl] != 0 || fgd.chroma_scaling_from_luma {
                let num_uv_pos = num_y_pos + usize::from(fgd.num_y_points != 0);
                for i in 0..num_uv_pos {
                    fgd.ar_coeffs_uv[pl][i] = (r.read_bits(8)? as i32 - 128) as i8;
                }
                if fgd.num_y_points == 0 {
                    fgd.ar_coeffs_uv[pl][num_uv_pos] = 0;
                }
            }
        }
        fgd.ar_coeff_shift = r.read_bits(2)? + 6;
        fgd.grain_scale_shift = r.read_bits(2)?;
        for pl in 0..2 {
            if fgd.num_uv_points[pl] != 0 {
                fgd.uv_mult[pl] = r.read_bits(8)? as i32 - 128;
                fgd.uv_luma_mult[pl] = r.read_bits(8)? as i32 - 128;
                fgd.uv_offset[pl] = r.read_bits(9)? as i32 - 256;
            }
        }
        fgd.overlap_flag = r.read_bit()?;
        fgd.clip_to_restricted_range = r.read_bit()?;

        Ok(())
    }

    // 5.9.2, following the original decoder's order of decisions.
    fn parse_frame_hdr(
        &self,
        r: &mut Reader,
        temporal_id: u32,
        spatial_id: u32,
    ) -> anyhow::Result<FrameHeader> {
        let seq = Rc::clone(self.sequence()?);
        let mut fh = FrameHeader {
            temporal_id,
            spatial_id,
            ..Default::default()
        };

        if !seq.reduced_still_picture_header {
            fh.show_existing_frame = r.read_bit()?;
        }
        if fh.show_existing_frame {
            fh.existing_frame_idx = r.read_bits(3)? as usize;
            if seq.decoder_model_info_present && !seq.equal_picture_interval {
                fh.frame_presentation_delay =
                    r.read_bits(seq.frame_presentation_delay_length as u8)?;
            }
            if seq.frame_id_numbers_present {
                fh.frame_id = r.read_bits(seq.frame_id_n_bits as u8)?;
                let refhdr = self.ref_hdrs[fh.existing_frame_idx]
                    .as_ref()
                    .ok_or_else(|| anyhow!("show_existing_frame references an empty slot"))?;
                if refhdr.frame_id != fh.frame_id {
                    return Err(anyhow!("frame id mismatch on show_existing_frame"));
                }
            }
            return Ok(fh);
        }

        if seq.reduced_still_picture_header {
            fh.frame_type = FrameType::Key;
            fh.show_frame = true;
        } else {
            fh.frame_type = FrameType::n(r.read_bits(2)?)
                .ok_or_else(|| anyhow!("invalid frame type"))?;
            fh.show_frame = r.read_bit()?;
        }
        if fh.show_frame {
            if seq.decoder_model_info_present && !seq.equal_picture_interval {
                fh.frame_presentation_delay =
                    r.read_bits(seq.frame_presentation_delay_length as u8)?;
            }
            fh.showable_frame = fh.frame_type != FrameType::Key;
        } else {
            fh.showable_frame = r.read_bit()?;
        }
        fh.error_resilient_mode = (fh.frame_type == FrameType::Key && fh.show_frame)
            || fh.frame_type == FrameType::Switch
            || seq.reduced_still_picture_header
            || r.read_bit()?;

        fh.disable_cdf_update = r.read_bit()?;
        fh.allow_screen_content_tools = match seq.screen_content_tools {
            AdaptiveBoolean::Adaptive => r.read_bit()?,
            v => v == AdaptiveBoolean::On,
        };
        if fh.allow_screen_content_tools {
            fh.force_integer_mv = match seq.force_integer_mv {
                AdaptiveBoolean::Adaptive => r.read_bit()?,
                v => v == AdaptiveBoolean::On,
            };
        }
        if fh.is_intra() {
            fh.force_integer_mv = true;
        }

        if seq.frame_id_numbers_present {
            fh.frame_id = r.read_bits(seq.frame_id_n_bits as u8)?;
        }

        if !seq.reduced_still_picture_header {
            fh.frame_size_override = fh.frame_type == FrameType::Switch || r.read_bit()?;
        }
        if seq.order_hint {
            fh.frame_offset = r.read_bits(seq.order_hint_n_bits as u8)?;
        }
        fh.primary_ref_frame = if !fh.error_resilient_mode && fh.is_inter_or_switch() {
            r.read_bits(3)?
        } else {
            PRIMARY_REF_NONE
        };

        if seq.decoder_model_info_present {
            fh.buffer_removal_time_present = r.read_bit()?;
            if fh.buffer_removal_time_present {
                for i in 0..seq.num_operating_points {
                    let seqop = &seq.operating_points[i];
                    if seqop.decoder_model_param_present {
                        let in_temporal_layer = (seqop.idc >> fh.temporal_id) & 1 != 0;
                        let in_spatial_layer = (seqop.idc >> (fh.spatial_id + 8)) & 1 != 0;
                        if seqop.idc == 0 || (in_temporal_layer && in_spatial_layer) {
                            fh.operating_points[i].buffer_removal_time =
                                r.read_bits(seq.buffer_removal_delay_length as u8)?;
                        }
                    }
                }
            }
        }

        if fh.is_intra() {
            fh.refresh_frame_flags = if fh.frame_type == FrameType::Key && fh.show_frame {
                0xff
            } else {
                r.read_bits(8)?
            };
            if fh.refresh_frame_flags != 0xff && fh.error_resilient_mode && seq.order_hint {
                for _ in 0..NUM_REF_FRAMES {
                    r.read_bits(seq.order_hint_n_bits as u8)?;
                }
            }
            if self.strict_std_compliance
                && fh.frame_type == FrameType::Intra
                && fh.refresh_frame_flags == 0xff
            {
                return Err(anyhow!("intra-only frame cannot refresh all slots"));
            }
            self.read_frame_size(&mut fh, r, &seq, false)?;
            if fh.allow_screen_content_tools && !fh.super_res.enabled {
                fh.allow_intrabc = r.read_bit()?;
            }
        } else {
            fh.refresh_frame_flags = if fh.frame_type == FrameType::Switch {
                0xff
            } else {
                r.read_bits(8)?
            };
            if fh.error_resilient_mode && seq.order_hint {
                for _ in 0..NUM_REF_FRAMES {
                    r.read_bits(seq.order_hint_n_bits as u8)?;
                }
            }
            if seq.order_hint {
                fh.frame_ref_short_signaling = r.read_bit()?;
                if fh.frame_ref_short_signaling {
                    self.set_frame_refs_short(&mut fh, r, &seq)?;
                }
            }
            for i in 0..REFS_PER_FRAME {
                if !fh.frame_ref_short_signaling {
                    fh.refidx[i] = r.read_bits(3)? as i32;
                }
                if seq.frame_id_numbers_present {
                    let delta_ref_frame_id =
                        r.read_bits(seq.delta_frame_id_n_bits as u8)? + 1;
                    let ref_frame_id = (fh.frame_id + (1 << seq.frame_id_n_bits)
                        - delta_ref_frame_id)
                        & ((1 << seq.frame_id_n_bits) - 1);
                    let refhdr = self.ref_hdrs[fh.refidx[i] as usize]
                        .as_ref()
                        .ok_or_else(|| anyhow!("reference slot {} is empty", fh.refidx[i]))?;
                    if refhdr.frame_id != ref_frame_id {
                        return Err(anyhow!(
                            "reference frame id mismatch, expected {} got {}",
                            ref_frame_id,
                            refhdr.frame_id
                        ));
                    }
                }
            }
            let use_ref = !fh.error_resilient_mode && fh.frame_size_override;
            self.read_frame_size(&mut fh, r, &seq, use_ref)?;
            if !fh.force_integer_mv {
                fh.hp = r.read_bit()?;
            }
            fh.subpel_filter_mode = if r.read_bit()? {
                FilterMode::Switchable
            } else {
                FilterMode::n(r.read_bits(2)?)
                    .ok_or_else(|| anyhow!("invalid interpolation filter"))?
            };
            fh.switchable_motion_mode = r.read_bit()?;
            if !fh.error_resilient_mode
                && seq.ref_frame_mvs
                && seq.order_hint
                && fh.is_inter_or_switch()
            {
                fh.use_ref_frame_mvs = r.read_bit()?;
            }
        }

        if !seq.reduced_still_picture_header && !fh.disable_cdf_update {
            fh.refresh_context = !r.read_bit()?;
        }

        Self::parse_tiling(&mut fh, r, &seq)?;
        Self::parse_quant(&mut fh, r, &seq)?;
        self.parse_segmentation(&mut fh, r)?;

        if fh.quant.yac != 0 {
            fh.delta.q.present = r.read_bit()?;
            if fh.delta.q.present {
                fh.delta.q.res_log2 = r.read_bits(2)?;
                if !fh.allow_intrabc {
                    fh.delta.lf.present = r.read_bit()?;
                    if fh.delta.lf.present {
                        fh.delta.lf.res_log2 = r.read_bits(2)?;
                        fh.delta.lf.multi = r.read_bit()?;
                    }
                }
            }
        }

        Self::derive_lossless(&mut fh);
        self.parse_loopfilter(&mut fh, r, &seq)?;
        Self::parse_cdef(&mut fh, r, &seq)?;
        Self::parse_restoration(&mut fh, r, &seq)?;

        if !fh.segmentation.all_lossless {
            fh.txfm_mode = if r.read_bit()? {
                TxfmMode::Switchable
            } else {
                TxfmMode::Largest
            };
        }
        if fh.is_inter_or_switch() {
            fh.switchable_comp_refs = r.read_bit()?;
        }
        self.parse_skip_mode(&mut fh, r, &seq)?;
        if fh.skip_mode_allowed {
            fh.skip_mode_enabled = r.read_bit()?;
        }
        if !fh.error_resilient_mode && fh.is_inter_or_switch() && seq.warped_motion {
            fh.warp_motion = r.read_bit()?;
        }
        fh.reduced_txtp_set = r.read_bit()?;

        self.parse_global_motion(&mut fh, r)?;
        self.parse_film_grain(&mut fh, r, &seq)?;

        Ok(fh)
    }

    /// Parses a Frame Header OBU (or the header part of a Frame OBU) and
    /// returns it together with the number of payload bytes it spans.
    pub fn parse_frame_header_obu(&self, obu: &Obu) -> anyhow::Result<(FrameHeader, usize)> {
        let mut r = Reader::new(obu.as_ref());
        let fh = self.parse_frame_hdr(&mut r, obu.header.temporal_id, obu.header.spatial_id)?;

        if obu.header.obu_type == ObuType::Frame {
            // A frame OBU must carry actual tile data.
            if fh.show_existing_frame {
                return Err(anyhow!("show_existing_frame inside a frame OBU"));
            }
            // No trailing bit, but the tile group starts byte aligned.
            r.byte_alignment()?;
        } else {
            r.check_trailing_bits(self.strict_std_compliance)?;
        }

        Ok((fh, (r.position() / 8) as usize))
    }

    /// Parses a tile group header and returns the tile range plus the byte
    /// offset at which the raw tile payload starts. See 5.11.1.
    pub fn parse_tile_group_hdr(
        &self,
        fh: &FrameHeader,
        payload: &[u8],
    ) -> anyhow::Result<(u32, u32, usize)> {
        let n_tiles = fh.tiling.cols * fh.tiling.rows;
        let mut r = Reader::new(payload);

        let have_tile_pos = if n_tiles > 1 { r.read_bit()? } else { false };
        let (start, end) = if have_tile_pos {
            let n_bits = u8::try_from(fh.tiling.log2_cols + fh.tiling.log2_rows)?;
            (r.read_bits(n_bits)?, r.read_bits(n_bits)?)
        } else {
            (0, n_tiles - 1)
        };
        r.byte_alignment()?;

        Ok((start, end, (r.position() / 8) as usize))
    }

    /// Parses a Metadata OBU. Unknown and unhandled metadata types are
    /// consumed without effect. See 5.8.
    pub fn parse_metadata_obu(&self, obu: &Obu) -> anyhow::Result<MetadataObu> {
        let payload = obu.as_ref();
        let mut r = Reader::new(payload);
        let meta_type = r.read_uleb128()?;

        match ObuMetaType::n(meta_type) {
            Some(ObuMetaType::HdrContentLightLevel) => {
                let content_light = ContentLightLevel {
                    max_content_light_level: r.read_bits(16)? as u16,
                    max_frame_average_light_level: r.read_bits(16)? as u16,
                };
                r.check_trailing_bits(self.strict_std_compliance)?;
                Ok(MetadataObu::ContentLight(content_light))
            }
            Some(ObuMetaType::HdrMasteringDisplay) => {
                let mut mastering_display = MasteringDisplay::default();
                for i in 0..3 {
                    mastering_display.primaries[i][0] = r.read_bits(16)? as u16;
                    mastering_display.primaries[i][1] = r.read_bits(16)? as u16;
                }
                mastering_display.white_point[0] = r.read_bits(16)? as u16;
                mastering_display.white_point[1] = r.read_bits(16)? as u16;
                mastering_display.max_luminance = r.read_bits(32)?;
                mastering_display.min_luminance = r.read_bits(32)?;
                r.check_trailing_bits(self.strict_std_compliance)?;
                Ok(MetadataObu::MasteringDisplay(mastering_display))
            }
            Some(ObuMetaType::ItutT35) => {
                let body = &payload[(r.position() / 8) as usize..];

                let mut payload_size = body.len() as isize;
                // Trailing zero bytes are not part of the payload, and the
                // trailing one bit occupies one more byte.
                while payload_size > 0 && body[payload_size as usize - 1] == 0 {
                    payload_size -= 1;
                }
                payload_size -= 2;

                if payload_size < 1 {
                    log::warn!("malformed ITU-T T.35 metadata message format");
                    return Ok(MetadataObu::Skipped);
                }

                let country_code = body[0];
                let mut cursor = 1;
                let mut country_code_extension_byte = 0;
                if country_code == 0xff {
                    payload_size -= 1;
                    if payload_size < 1 {
                        log::warn!("malformed ITU-T T.35 metadata message format");
                        return Ok(MetadataObu::Skipped);
                    }
                    country_code_extension_byte = body[1];
                    cursor = 2;
                }

                if body[cursor + payload_size as usize] != 0x80 {
                    log::warn!("malformed ITU-T T.35 metadata message format");
                    return Ok(MetadataObu::Skipped);
                }

                Ok(MetadataObu::ItutT35(ItutT35 {
                    country_code,
                    country_code_extension_byte,
                    payload: body[cursor..cursor + payload_size as usize].to_vec(),
                }))
            }
            Some(ObuMetaType::Scalability) | Some(ObuMetaType::Timecode) => {
                Ok(MetadataObu::Skipped)
            }
            None => {
                // Types 6 to 31 are "unregistered user private".
                if meta_type > 31 {
                    log::warn!("unknown metadata OBU type {}", meta_type);
                }
                Ok(MetadataObu::Skipped)
            }
        }
    }
}

/// Scans `data` for the first Sequence Header OBU and parses it, without
/// touching any persistent context.
pub fn parse_sequence_header(data: &[u8]) -> anyhow::Result<Option<SequenceHeader>> {
    let mut cursor = 0;

    while cursor < data.len() {
        let rest = &data[cursor..];
        let mut r = Reader::new(rest);

        let _obu_forbidden_bit = r.read_bit()?;
        let obu_type = ObuType::n(r.read_bits(4)?).ok_or_else(|| anyhow!("invalid OBU type"))?;
        let has_extension = r.read_bit()?;
        let has_length_field = r.read_bit()?;
        r.skip(1 + 8 * u64::from(has_extension))?;

        let (payload_start, obu_end) = if has_length_field {
            let len = r.read_uleb128()? as usize;
            let start = (r.position() / 8) as usize;
            if len > rest.len() - start {
                return Err(anyhow!("OBU length exceeds remaining bytes"));
            }
            (start, start + len)
        } else {
            let start = (r.position() / 8) as usize;
            (start, rest.len())
        };

        if obu_type == ObuType::SequenceHeader {
            let payload = &rest[payload_start..obu_end];
            let mut pr = Reader::new(payload);
            let s = Parser::parse_seq_hdr(&mut pr, false)?;
            pr.check_trailing_bits(false)?;
            return Ok(Some(s));
        }

        cursor += obu_end;
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::basic_seq_payload;
    use crate::test_utils::key_frame_writer;
    use crate::test_utils::reduced_seq_payload;
    use crate::test_utils::BitWriter;

    fn frame_header_obu(payload: &[u8]) -> Obu {
        Obu {
            header: ObuHeader {
                obu_type: ObuType::FrameHeader,
                has_size_field: true,
                ..Default::default()
            },
            data: payload,
            start_offset: 0,
            size: payload.len(),
        }
    }

    fn metadata_obu(payload: &[u8]) -> Obu {
        Obu {
            header: ObuHeader {
                obu_type: ObuType::Metadata,
                has_size_field: true,
                ..Default::default()
            },
            data: payload,
            start_offset: 0,
            size: payload.len(),
        }
    }

    #[test]
    fn reduced_still_picture_sequence() {
        let payload = reduced_seq_payload(320, 180);
        let s = Parser::parse_sequence_header_payload(&payload, true).unwrap();

        assert_eq!(s.profile, Profile::Profile0);
        assert!(s.still_picture);
        assert!(s.reduced_still_picture_header);
        assert_eq!(s.num_operating_points, 1);
        assert_eq!(s.operating_points[0].initial_display_delay, 10);
        assert_eq!(s.max_width, 320);
        assert_eq!(s.max_height, 180);
        assert_eq!(s.layout, PixelLayout::I420);
        assert_eq!(s.bit_depth(), 8);
        assert_eq!(s.screen_content_tools, AdaptiveBoolean::Adaptive);
        assert_eq!(s.force_integer_mv, AdaptiveBoolean::Adaptive);
    }

    #[test]
    fn operating_point_idc_needs_both_layer_masks() {
        let mut payload = basic_seq_payload(320, 180);
        // Set the lowest idc bit: a temporal layer without a spatial layer.
        payload[2] |= 0x01;
        assert!(Parser::parse_sequence_header_payload(&payload, false).is_err());
    }

    #[test]
    fn identity_matrix_requires_i444_in_strict_mode() {
        // Profile 0 stream (4:2:0) declaring identity matrix coefficients.
        let mut w = BitWriter::new();
        w.f(0, 3); // profile
        w.f(0, 1); // still picture
        w.f(0, 1); // reduced still picture header
        w.f(0, 1); // timing info present
        w.f(0, 1); // display model info present
        w.f(0, 5); // operating points count minus 1
        w.f(0, 12); // idc
        w.f(0, 3); // major level minus 2
        w.f(0, 2); // minor level
        w.f(15, 4);
        w.f(15, 4);
        w.f(319, 16);
        w.f(179, 16);
        w.f(0, 1); // frame id numbers present
        w.f(0, 1); // sb128
        w.f(0, 1); // filter intra
        w.f(0, 1); // intra edge filter
        w.f(0, 1); // inter intra
        w.f(0, 1); // masked compound
        w.f(0, 1); // warped motion
        w.f(0, 1); // dual filter
        w.f(0, 1); // order hint
        w.f(0, 1); // screen content tools
        w.f(0, 1);
        w.f(0, 1); // super res
        w.f(0, 1); // cdef
        w.f(0, 1); // restoration
        w.f(0, 1); // high bitdepth
        w.f(0, 1); // monochrome
        w.f(1, 1); // color description present
        w.f(1, 8); // primaries: bt709
        w.f(1, 8); // transfer: bt709
        w.f(u32::from(MC_IDENTITY), 8);
        w.f(0, 1); // color range
        w.f(0, 2); // chroma sample position
        w.f(0, 1); // separate uv delta q
        w.f(0, 1); // film grain present
        w.trailing_bits();
        let payload = w.finish();

        assert!(Parser::parse_sequence_header_payload(&payload, true).is_err());
        let s = Parser::parse_sequence_header_payload(&payload, false).unwrap();
        assert_eq!(s.mtrx, MC_IDENTITY);
        assert_eq!(s.layout, PixelLayout::I420);
    }

    #[test]
    fn scans_for_the_first_sequence_header() {
        let mut data = crate::test_utils::wrap_obu(2, &[]);
        data.extend_from_slice(&crate::test_utils::wrap_obu(1, &reduced_seq_payload(320, 180)));

        let s = parse_sequence_header(&data).unwrap().unwrap();
        assert_eq!(s.max_width, 320);

        let only_td = crate::test_utils::wrap_obu(2, &[]);
        assert!(parse_sequence_header(&only_td).unwrap().is_none());
    }

    #[test]
    fn tile_grid_bounds_for_1080p() {
        let seq = Parser::parse_sequence_header_payload(&basic_seq_payload(1920, 1088), false)
            .unwrap();
        let mut parser = Parser::new(false, 0);
        parser.install_sequence(Rc::new(seq));

        let mut w = key_frame_writer(true, false, None, 1, 1);
        w.trailing_bits();
        let payload = w.finish();
        let (fh, _) = parser.parse_frame_header_obu(&frame_header_obu(&payload)).unwrap();

        // 30x17 superblocks of 64x64 for 1920x1088.
        assert_eq!(fh.tiling.min_log2_cols, 0);
        assert_eq!(fh.tiling.max_log2_cols, 5);
        assert_eq!(fh.tiling.max_log2_rows, 5);
        assert_eq!(fh.tiling.cols, 1);
        assert_eq!(fh.tiling.rows, 1);
        assert_eq!(fh.tiling.col_start_sb[fh.tiling.cols as usize], 30);
        assert_eq!(fh.tiling.row_start_sb[fh.tiling.rows as usize], 17);
        assert!(fh.segmentation.all_lossless);
        assert_eq!(fh.refresh_frame_flags, 0xff);
    }

    #[test]
    fn short_signaling_reference_ordering() {
        let mut parser = Parser::new(false, 0);
        let seq = SequenceHeader {
            order_hint: true,
            order_hint_n_bits: 5,
            ..Default::default()
        };
        parser.install_sequence(Rc::new(seq));

        for i in 0..NUM_REF_FRAMES {
            let hdr = Rc::new(FrameHeader {
                frame_offset: 4 + i as u32,
                ..Default::default()
            });
            parser.apply_refresh(&hdr, 1 << i);
        }

        let mut fh = FrameHeader {
            frame_offset: 12,
            ..Default::default()
        };
        let mut w = BitWriter::new();
        w.f(3, 3); // refidx[0]
        w.f(4, 3); // refidx[3]
        let bits = w.finish();
        let seq = Rc::clone(parser.sequence().unwrap());
        let mut r = Reader::new(&bits);
        parser.set_frame_refs_short(&mut fh, &mut r, &seq).unwrap();

        assert_eq!(fh.refidx, [3, 6, 5, 4, 1, 2, 7]);
    }

    #[test]
    fn short_signaling_requires_populated_slots() {
        let mut parser = Parser::new(false, 0);
        let seq = SequenceHeader {
            order_hint: true,
            order_hint_n_bits: 5,
            ..Default::default()
        };
        parser.install_sequence(Rc::new(seq));

        let mut fh = FrameHeader::default();
        let mut w = BitWriter::new();
        w.f(0, 3);
        w.f(1, 3);
        let bits = w.finish();
        let seq = Rc::clone(parser.sequence().unwrap());
        let mut r = Reader::new(&bits);
        assert!(parser.set_frame_refs_short(&mut fh, &mut r, &seq).is_err());
    }

    #[test]
    fn segmentation_inherited_from_primary_reference() {
        let mut parser = Parser::new(false, 0);

        let mut ref_fh = FrameHeader::default();
        ref_fh.segmentation.seg_data.d[2].delta_q = -40;
        ref_fh.segmentation.seg_data.d[2].skip = true;
        ref_fh.segmentation.seg_data.d[4].ref_frame = 3;
        ref_fh.segmentation.seg_data.preskip = true;
        ref_fh.segmentation.seg_data.last_active_segid = 4;
        let expected = ref_fh.segmentation.seg_data;
        parser.apply_refresh(&Rc::new(ref_fh), 1 << 5);

        let mut fh = FrameHeader {
            primary_ref_frame: 0,
            refidx: [5, 0, 0, 0, 0, 0, 0],
            ..Default::default()
        };
        // enabled, no map update, no data update.
        let mut r = Reader::new(&[0b1000_0000]);
        parser.parse_segmentation(&mut fh, &mut r).unwrap();

        assert_eq!(fh.segmentation.seg_data, expected);

        // The same stream with an unpopulated primary reference fails.
        let mut fh = FrameHeader {
            primary_ref_frame: 0,
            refidx: [4, 0, 0, 0, 0, 0, 0],
            ..Default::default()
        };
        let mut r = Reader::new(&[0b1000_0000]);
        assert!(parser.parse_segmentation(&mut fh, &mut r).is_err());
    }

    #[test]
    fn lossless_derivation() {
        let mut fh = FrameHeader::default();
        fh.quant.yac = 0;
        Parser::derive_lossless(&mut fh);
        assert!(fh.segmentation.all_lossless);
        assert!(fh.segmentation.lossless.iter().all(|&l| l));

        let mut fh = FrameHeader::default();
        fh.quant.yac = 0;
        fh.quant.uac_delta = 1;
        Parser::derive_lossless(&mut fh);
        assert!(!fh.segmentation.all_lossless);

        // A segment delta bumping the quantizer away from zero breaks
        // lossless for that segment only.
        let mut fh = FrameHeader::default();
        fh.quant.yac = 0;
        fh.segmentation.enabled = true;
        fh.segmentation.seg_data.d[1].delta_q = 5;
        Parser::derive_lossless(&mut fh);
        assert!(fh.segmentation.lossless[0]);
        assert!(!fh.segmentation.lossless[1]);
        assert_eq!(fh.segmentation.qidx[1], 5);
        assert!(!fh.segmentation.all_lossless);
    }

    #[test]
    fn film_grain_chroma_symmetry() {
        let parser = Parser::new(false, 0);
        let seq = SequenceHeader {
            film_grain_present: true,
            ss_hor: true,
            ss_ver: true,
            ..Default::default()
        };

        let mut w = BitWriter::new();
        w.f(1, 1); // apply grain
        w.f(0x1234, 16); // seed
        w.f(1, 4); // one luma point
        w.f(10, 8);
        w.f(20, 8);
        w.f(0, 1); // chroma scaling from luma
        w.f(1, 4); // one cb point
        w.f(10, 8);
        w.f(20, 8);
        w.f(0, 4); // no cr points
        let bits = w.finish();

        let mut fh = FrameHeader {
            show_frame: true,
            ..Default::default()
        };
        let mut r = Reader::new(&bits);
        assert!(parser.parse_film_grain(&mut fh, &mut r, &seq).is_err());
    }

    #[test]
    fn film_grain_scaling_points_must_increase() {
        let parser = Parser::new(false, 0);
        let seq = SequenceHeader {
            film_grain_present: true,
            ss_hor: true,
            ss_ver: true,
            ..Default::default()
        };

        let mut w = BitWriter::new();
        w.f(1, 1); // apply grain
        w.f(0, 16); // seed
        w.f(2, 4); // two luma points
        w.f(30, 8);
        w.f(0, 8);
        w.f(30, 8); // same x coordinate as the previous point
        w.f(0, 8);
        let bits = w.finish();

        let mut fh = FrameHeader {
            show_frame: true,
            ..Default::default()
        };
        let mut r = Reader::new(&bits);
        assert!(parser.parse_film_grain(&mut fh, &mut r, &seq).is_err());
    }

    #[test]
    fn global_motion_defaults_to_identity() {
        let parser = Parser::new(false, 0);

        // Seven zero bits: every reference keeps the identity model.
        let mut fh = FrameHeader {
            frame_type: FrameType::Inter,
            ..Default::default()
        };
        let mut r = Reader::new(&[0x00]);
        parser.parse_global_motion(&mut fh, &mut r).unwrap();
        for gmv in &fh.gmv {
            assert_eq!(*gmv, WarpedMotionParams::default());
        }
    }

    #[test]
    fn global_motion_rot_zoom_predicted_from_default() {
        let parser = Parser::new(false, 0);

        // With no primary reference the prediction baseline is the identity
        // matrix, so all-zero subexp residuals reconstruct it exactly.
        let mut w = BitWriter::new();
        w.f(1, 1); // is_global
        w.f(1, 1); // is_rot_zoom
        for _ in 0..4 {
            // Each coefficient: subexp more bit then three value bits.
            w.f(0, 4);
        }
        for _ in 1..REFS_PER_FRAME {
            w.f(0, 1); // identity
        }
        let bits = w.finish();

        let mut fh = FrameHeader {
            frame_type: FrameType::Inter,
            primary_ref_frame: PRIMARY_REF_NONE,
            ..Default::default()
        };
        let mut r = Reader::new(&bits);
        parser.parse_global_motion(&mut fh, &mut r).unwrap();

        assert_eq!(fh.gmv[0].warp_model, WarpModelType::RotZoom);
        assert_eq!(fh.gmv[0].matrix, [0, 0, 1 << 16, 0, 0, 1 << 16]);
        assert_eq!(fh.gmv[1].warp_model, WarpModelType::Identity);
    }

    #[test]
    fn itut_t35_with_extension_byte() {
        let parser = Parser::new(false, 0);
        let payload = [0x04, 0xff, 0x01, 0x12, 0x34, 0x56, 0x80];
        let parsed = parser.parse_metadata_obu(&metadata_obu(&payload)).unwrap();

        match parsed {
            MetadataObu::ItutT35(t35) => {
                assert_eq!(t35.country_code, 0xff);
                assert_eq!(t35.country_code_extension_byte, 0x01);
                assert_eq!(t35.payload, vec![0x12, 0x34, 0x56]);
            }
            other => panic!("expected a T.35 payload, got {:?}", other),
        }

        // A message missing its 0x80 terminator is dropped, not an error.
        let bad = [0x04, 0xb5, 0x12, 0x34, 0x56];
        let parsed = parser.parse_metadata_obu(&metadata_obu(&bad)).unwrap();
        assert_eq!(parsed, MetadataObu::Skipped);
    }

    #[test]
    fn hdr_metadata() {
        let parser = Parser::new(true, 0);

        let mut w = BitWriter::new();
        w.leb128(1); // content light level
        w.f(1000, 16);
        w.f(300, 16);
        w.trailing_bits();
        let payload = w.finish();
        match parser.parse_metadata_obu(&metadata_obu(&payload)).unwrap() {
            MetadataObu::ContentLight(cll) => {
                assert_eq!(cll.max_content_light_level, 1000);
                assert_eq!(cll.max_frame_average_light_level, 300);
            }
            other => panic!("expected content light metadata, got {:?}", other),
        }

        let mut w = BitWriter::new();
        w.leb128(2); // mastering display
        for i in 0..3 {
            w.f(100 + i, 16);
            w.f(200 + i, 16);
        }
        w.f(500, 16);
        w.f(600, 16);
        w.f(1 << 20, 32);
        w.f(50, 32);
        w.trailing_bits();
        let payload = w.finish();
        match parser.parse_metadata_obu(&metadata_obu(&payload)).unwrap() {
            MetadataObu::MasteringDisplay(md) => {
                assert_eq!(md.primaries[1], [101, 201]);
                assert_eq!(md.white_point, [500, 600]);
                assert_eq!(md.max_luminance, 1 << 20);
                assert_eq!(md.min_luminance, 50);
            }
            other => panic!("expected mastering display metadata, got {:?}", other),
        }

        // Scalability metadata is consumed without effect.
        let payload = [0x03, 0x00, 0x80];
        assert_eq!(
            parser.parse_metadata_obu(&metadata_obu(&payload)).unwrap(),
            MetadataObu::Skipped
        );
    }

    #[test]
    fn obu_length_bounded_by_remaining_bytes() {
        let parser = Parser::new(false, 0);
        // A temporal delimiter OBU declaring 0xFFFFFFFF payload bytes while
        // only 10 bytes exist.
        let mut data = vec![0b0_0010_010u8];
        data.extend_from_slice(&[0xff, 0xff, 0xff, 0xff, 0x0f]);
        data.resize(10, 0);

        assert!(parser.parse_obu(&data).is_err());
    }

    #[test]
    fn obu_layer_filtering() {
        let mut parser = Parser::new(false, 0);
        let mut seq = SequenceHeader {
            num_operating_points: 1,
            ..Default::default()
        };
        // Operating point covering temporal layer 0 and spatial layer 0.
        seq.operating_points[0].idc = 0x101;
        parser.install_sequence(Rc::new(seq));

        // A padding OBU with an extension header placing it in temporal
        // layer 1.
        let mut w = BitWriter::new();
        w.f(0, 1); // forbidden
        w.f(15, 4); // padding
        w.f(1, 1); // extension
        w.f(1, 1); // has size
        w.f(0, 1); // reserved
        w.f(1, 3); // temporal id
        w.f(0, 2); // spatial id
        w.f(0, 3); // reserved
        w.leb128(0);
        let data = w.finish();

        match parser.parse_obu(&data).unwrap() {
            ParsedObu::Drop(len) => assert_eq!(len, data.len()),
            ParsedObu::Process(_) => panic!("OBU outside the operating point must be dropped"),
        }
    }

    #[test]
    fn sequence_replacement_detection() {
        let mut parser = Parser::new(false, 0);
        let a = Rc::new(
            Parser::parse_sequence_header_payload(&basic_seq_payload(320, 180), false).unwrap(),
        );

        assert_eq!(parser.install_sequence(Rc::clone(&a)), SequenceChange::First);
        assert_eq!(parser.install_sequence(Rc::clone(&a)), SequenceChange::Same);

        let mut with_op_params = (*a).clone();
        with_op_params.operating_parameter_info[0].decoder_buffer_delay = 42;
        assert_eq!(
            parser.install_sequence(Rc::new(with_op_params)),
            SequenceChange::NewOperatingParameters
        );

        let b = Rc::new(
            Parser::parse_sequence_header_payload(&basic_seq_payload(640, 480), false).unwrap(),
        );
        // Populate a slot to observe the flush.
        parser.apply_refresh(&Rc::new(FrameHeader::default()), 1 << 0);
        assert!(parser.ref_hdr(0).is_some());
        assert_eq!(parser.install_sequence(b), SequenceChange::NewSequence);
        assert!(parser.ref_hdr(0).is_none());
    }
}
