// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoder context: consumes OBUs one at a time, maintains the
//! reference slots and pending metadata, and dispatches completed frames to
//! the pixel pipeline behind the [`DecoderBackend`] seam.

use std::rc::Rc;

use anyhow::anyhow;
use bytes::Bytes;
use thiserror::Error;

use crate::handoff::FrameHandoff;
use crate::handoff::FrameProps;
use crate::handoff::OutputFrame;
use crate::handoff::PendingFrame;
use crate::parser::ContentLightLevel;
use crate::parser::FrameHeader;
use crate::parser::FrameType;
use crate::parser::ItutT35;
use crate::parser::MasteringDisplay;
use crate::parser::MetadataObu;
use crate::parser::Obu;
use crate::parser::ObuType;
use crate::parser::ParsedObu;
use crate::parser::Parser;
use crate::parser::SequenceChange;
use crate::parser::SequenceHeader;
use crate::refs::RefSlots;

/// A decoded (or in-flight) picture handle produced by the backend. Handles
/// are cheap to clone and share ownership of the underlying picture memory.
pub trait DecodedHandle: Clone {
    /// Whether the decode workers have finished this picture.
    fn is_ready(&self) -> bool;

    /// Waits until the picture is fully decoded. An error means the worker
    /// failed; the picture must not be output.
    fn sync(&self) -> anyhow::Result<()>;
}

/// Raw tile data for a consecutive range of tiles, sliced out of the input
/// buffer without copying.
#[derive(Clone, Debug)]
pub struct TileGroup {
    pub start: u32,
    pub end: u32,
    pub data: Bytes,
}

/// Everything the pixel pipeline hands back for a submitted frame: the
/// picture handle plus the per-frame resources that feed the reference
/// slots.
pub struct SubmittedFrame<B: DecoderBackend> {
    pub handle: B::Handle,
    pub cdf: B::CdfContext,
    pub segmap: Option<B::SegmentationMap>,
    pub mvs: Option<B::MotionVectors>,
}

/// Error returned by backend methods.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// The pixel-decoding pipeline this core drives. Tile data flows in through
/// [`DecoderBackend::decode_tile_group`]; [`DecoderBackend::submit_picture`]
/// kicks off the (possibly asynchronous) decode and returns the resources
/// that will populate the reference slots.
pub trait DecoderBackend: Sized {
    type Handle: DecodedHandle;
    /// A frame being assembled between `new_picture` and `submit_picture`.
    type Picture;
    type CdfContext: Clone;
    type SegmentationMap: Clone;
    type MotionVectors: Clone;

    /// Called when a new video sequence starts.
    fn new_sequence(
        &mut self,
        sequence: &Rc<SequenceHeader>,
        max_spatial_id: u32,
    ) -> BackendResult<()>;

    /// Called when a frame header has been parsed and tile data is about to
    /// follow.
    fn new_picture(
        &mut self,
        sequence: &Rc<SequenceHeader>,
        frame_hdr: &Rc<FrameHeader>,
        references: &RefSlots<Self>,
    ) -> BackendResult<Self::Picture>;

    fn decode_tile_group(
        &mut self,
        picture: &mut Self::Picture,
        tile_group: &TileGroup,
    ) -> BackendResult<()>;

    /// Hands the assembled frame to the decode workers.
    fn submit_picture(&mut self, picture: Self::Picture) -> BackendResult<SubmittedFrame<Self>>;
}

/// Which frames to decode; later values drop progressively more of the
/// stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DecodeFrameType {
    #[default]
    All = 0,
    Reference = 1,
    Intra = 2,
    Key = 3,
}

/// Events accumulated while parsing, drained with
/// [`Decoder::take_event_flags`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventFlags(u32);

impl EventFlags {
    pub const NEW_SEQUENCE: EventFlags = EventFlags(1 << 0);
    pub const NEW_OP_PARAMS_INFO: EventFlags = EventFlags(1 << 1);
    pub const NEW_TEMPORAL_UNIT: EventFlags = EventFlags(1 << 2);

    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: EventFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Error returned by [`Decoder::parse_obus`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame size {width}x{height} exceeds the configured limit {limit}")]
    FrameSizeExceeded { width: u32, height: u32, limit: u32 },
    #[error("error decoding frame with timestamp {timestamp}: {error}")]
    Worker { error: anyhow::Error, timestamp: u64 },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Parser(#[from] anyhow::Error),
}

#[derive(Clone, Debug)]
pub struct DecoderConfig {
    /// Operating point to decode, 0..=31.
    pub operating_point: usize,
    pub strict_std_compliance: bool,
    /// Maximum number of pixels per frame, zero meaning unlimited.
    pub frame_size_limit: u32,
    pub decode_frame_type: DecodeFrameType,
    /// Publish frames that are not signaled for display.
    pub output_invisible_frames: bool,
    /// Number of frame decode workers behind the handoff ring.
    pub n_frame_workers: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            operating_point: 0,
            strict_std_compliance: false,
            frame_size_limit: 0,
            decode_frame_type: DecodeFrameType::All,
            output_invisible_frames: false,
            n_frame_workers: 1,
        }
    }
}

pub struct Decoder<B: DecoderBackend> {
    parser: Parser,
    backend: B,
    config: DecoderConfig,
    /// The frame header between its parse and its handoff (or skip).
    frame_hdr: Option<Rc<FrameHeader>>,
    refs: RefSlots<B>,
    tiles: Vec<TileGroup>,
    /// Tiles accumulated so far for the current frame.
    n_tiles: u32,
    content_light: Option<Rc<ContentLightLevel>>,
    mastering_display: Option<Rc<MasteringDisplay>>,
    /// T.35 payloads waiting for the next emitted frame.
    itut_t35: Vec<ItutT35>,
    event_flags: EventFlags,
    handoff: FrameHandoff<B::Handle>,
}

impl<B: DecoderBackend> Decoder<B> {
    pub fn new(backend: B, config: DecoderConfig) -> Self {
        let handoff = FrameHandoff::new(config.n_frame_workers, config.output_invisible_frames);
        Self {
            parser: Parser::new(config.strict_std_compliance, config.operating_point),
            backend,
            config,
            frame_hdr: None,
            refs: Default::default(),
            tiles: Vec::new(),
            n_tiles: 0,
            content_light: None,
            mastering_display: None,
            itut_t35: Vec::new(),
            event_flags: Default::default(),
            handoff,
        }
    }

    /// Consumes exactly one OBU from `data`, updating the context and
    /// possibly dispatching a frame. Returns the number of bytes consumed so
    /// the caller can advance its cursor.
    ///
    /// An error cached from a previously submitted frame is surfaced first
    /// and exactly once.
    pub fn parse_obus(&mut self, data: &Bytes, timestamp: u64) -> Result<usize, DecodeError> {
        if let Some(cached) = self.handoff.take_error() {
            return Err(DecodeError::Worker {
                error: cached.error,
                timestamp: cached.timestamp,
            });
        }

        let obu = match self.parser.parse_obu(&data[..])? {
            ParsedObu::Drop(len) => {
                log::debug!("dropping OBU outside the selected operating point layers");
                return Ok(len);
            }
            ParsedObu::Process(obu) => obu,
        };
        let consumed = obu.consumed();

        log::debug!(
            "identified OBU of type {:?}, payload size {}",
            obu.header.obu_type,
            obu.size
        );

        match obu.header.obu_type {
            ObuType::SequenceHeader => self.handle_sequence_header(&obu)?,
            ObuType::TemporalDelimiter => self.event_flags.insert(EventFlags::NEW_TEMPORAL_UNIT),
            ObuType::RedundantFrameHeader if self.frame_hdr.is_some() => (),
            ObuType::Frame | ObuType::FrameHeader | ObuType::RedundantFrameHeader => {
                self.handle_frame_header(&obu, data)?
            }
            ObuType::TileGroup => self.handle_tile_group(&obu, data)?,
            ObuType::Metadata => self.handle_metadata(&obu)?,
            ObuType::Padding => (),
            other => log::debug!("skipping OBU of type {:?}", other),
        }

        self.maybe_dispatch_frame(timestamp)?;

        Ok(consumed)
    }

    /// Returns the next decoded frame; frames come back in the order they
    /// were submitted.
    pub fn poll_frame(&mut self) -> Option<OutputFrame<B::Handle>> {
        self.handoff.poll()
    }

    /// Drains the handoff ring so that every submitted frame becomes
    /// available through [`Decoder::poll_frame`].
    pub fn flush(&mut self) {
        self.handoff.flush();
        self.frame_hdr = None;
        self.tiles.clear();
        self.n_tiles = 0;
    }

    pub fn take_event_flags(&mut self) -> EventFlags {
        std::mem::take(&mut self.event_flags)
    }

    pub fn frame_hdr(&self) -> Option<&Rc<FrameHeader>> {
        self.frame_hdr.as_ref()
    }

    pub fn content_light(&self) -> Option<&Rc<ContentLightLevel>> {
        self.content_light.as_ref()
    }

    pub fn mastering_display(&self) -> Option<&Rc<MasteringDisplay>> {
        self.mastering_display.as_ref()
    }

    pub fn references(&self) -> &RefSlots<B> {
        &self.refs
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn handle_sequence_header(&mut self, obu: &Obu) -> Result<(), DecodeError> {
        let seq = Parser::parse_sequence_header_payload(
            obu.as_ref(),
            self.config.strict_std_compliance,
        )
        .map_err(|e| {
            log::debug!("error parsing sequence header");
            e
        })?;
        let seq = Rc::new(seq);

        match self.parser.install_sequence(Rc::clone(&seq)) {
            SequenceChange::First => {
                self.frame_hdr = None;
                self.event_flags.insert(EventFlags::NEW_SEQUENCE);
                self.backend
                    .new_sequence(&seq, self.parser.max_spatial_id())?;
            }
            SequenceChange::NewSequence => {
                log::debug!(
                    "new sequence: {}x{}, profile {:?}, {} bpc",
                    seq.max_width,
                    seq.max_height,
                    seq.profile,
                    seq.bit_depth()
                );
                self.frame_hdr = None;
                self.content_light = None;
                self.mastering_display = None;
                self.refs.drop_all();
                self.event_flags.insert(EventFlags::NEW_SEQUENCE);
                self.backend
                    .new_sequence(&seq, self.parser.max_spatial_id())?;
            }
            SequenceChange::NewOperatingParameters => {
                self.event_flags.insert(EventFlags::NEW_OP_PARAMS_INFO);
            }
            SequenceChange::Same => (),
        }

        Ok(())
    }

    fn handle_frame_header(&mut self, obu: &Obu, data: &Bytes) -> Result<(), DecodeError> {
        if !self.parser.have_sequence() {
            return Err(DecodeError::Parser(anyhow!(
                "frame header received before any sequence header"
            )));
        }

        let (fh, header_bytes) = match self.parser.parse_frame_header_obu(obu) {
            Ok(parsed) => parsed,
            Err(e) => {
                // The in-progress frame is discarded; the sequence header
                // and the reference slots survive.
                self.frame_hdr = None;
                log::debug!("error parsing frame header");
                return Err(e.into());
            }
        };

        if self.config.frame_size_limit != 0
            && u64::from(fh.width[1]) * u64::from(fh.height)
                > u64::from(self.config.frame_size_limit)
        {
            log::debug!(
                "frame size {}x{} exceeds limit {}",
                fh.width[1],
                fh.height,
                self.config.frame_size_limit
            );
            self.frame_hdr = None;
            return Err(DecodeError::FrameSizeExceeded {
                width: fh.width[1],
                height: fh.height,
                limit: self.config.frame_size_limit,
            });
        }

        self.tiles.clear();
        self.n_tiles = 0;
        let fh = Rc::new(fh);
        self.frame_hdr = Some(Rc::clone(&fh));

        if obu.header.obu_type == ObuType::Frame {
            // The rest of the OBU is a single tile group.
            self.push_tile_group(
                data,
                obu.start_offset + header_bytes,
                obu.start_offset + obu.size,
            )?;
        }

        Ok(())
    }

    fn handle_tile_group(&mut self, obu: &Obu, data: &Bytes) -> Result<(), DecodeError> {
        self.push_tile_group(data, obu.start_offset, obu.start_offset + obu.size)
    }

    fn push_tile_group(
        &mut self,
        data: &Bytes,
        from: usize,
        to: usize,
    ) -> Result<(), DecodeError> {
        let fh = Rc::clone(
            self.frame_hdr
                .as_ref()
                .ok_or_else(|| anyhow!("tile group without a frame header"))?,
        );

        let (start, end, hdr_bytes) = self.parser.parse_tile_group_hdr(&fh, &data[from..to])?;

        // Tile groups must be consecutive and in order, see 6.10.1.
        let total_tiles = fh.tiling.cols * fh.tiling.rows;
        if start > end || start != self.n_tiles || end >= total_tiles {
            self.tiles.clear();
            self.n_tiles = 0;
            return Err(DecodeError::Parser(anyhow!(
                "tile group out of order: start {} end {} at tile {}",
                start,
                end,
                self.n_tiles
            )));
        }

        self.n_tiles += end - start + 1;
        self.tiles.push(TileGroup {
            start,
            end,
            data: data.slice(from + hdr_bytes..to),
        });

        Ok(())
    }

    fn handle_metadata(&mut self, obu: &Obu) -> Result<(), DecodeError> {
        match self.parser.parse_metadata_obu(obu)? {
            MetadataObu::ContentLight(content_light) => {
                self.content_light = Some(Rc::new(content_light));
            }
            MetadataObu::MasteringDisplay(mastering_display) => {
                self.mastering_display = Some(Rc::new(mastering_display));
            }
            MetadataObu::ItutT35(itut_t35) => self.itut_t35.push(itut_t35),
            MetadataObu::Skipped => (),
        }
        Ok(())
    }

    /// After any OBU: output the referenced picture of a show_existing
    /// frame, or submit the current frame once all its tiles have been
    /// collected.
    fn maybe_dispatch_frame(&mut self, timestamp: u64) -> Result<(), DecodeError> {
        if !self.parser.have_sequence() {
            return Ok(());
        }
        let Some(fh) = self.frame_hdr.clone() else {
            return Ok(());
        };

        if fh.show_existing_frame {
            let idx = fh.existing_frame_idx;
            let Some(ref_hdr) = self.refs.get(idx).frame_hdr.clone() else {
                return Err(DecodeError::Parser(anyhow!(
                    "show_existing_frame references an empty slot"
                )));
            };

            let skip = match ref_hdr.frame_type {
                FrameType::Inter | FrameType::Switch => {
                    self.config.decode_frame_type > DecodeFrameType::Reference
                }
                FrameType::Intra => self.config.decode_frame_type > DecodeFrameType::Intra,
                FrameType::Key => false,
            };
            if skip {
                self.skip_frame();
                return Ok(());
            }

            let Some(picture) = self.refs.get(idx).picture.clone() else {
                return Err(DecodeError::Parser(anyhow!(
                    "show_existing_frame references a slot without picture data"
                )));
            };
            if self.config.strict_std_compliance && !self.refs.get(idx).showable {
                return Err(DecodeError::Parser(anyhow!(
                    "show_existing_frame references a frame that is not showable"
                )));
            }

            let props = self.take_frame_props(timestamp);
            self.handoff.submit(PendingFrame {
                handle: picture,
                visible: true,
                props,
            });

            if ref_hdr.frame_type == FrameType::Key {
                self.refs.fan_out_from_key(idx);
                self.parser.fan_out_key_hdrs(idx);
            }
            self.frame_hdr = None;
        } else if self.n_tiles == fh.tiling.cols * fh.tiling.rows {
            let refresh_none = fh.refresh_frame_flags == 0;
            let skip = match fh.frame_type {
                FrameType::Inter | FrameType::Switch => {
                    self.config.decode_frame_type > DecodeFrameType::Reference
                        || (self.config.decode_frame_type == DecodeFrameType::Reference
                            && refresh_none)
                }
                FrameType::Intra => {
                    self.config.decode_frame_type > DecodeFrameType::Intra
                        || (self.config.decode_frame_type == DecodeFrameType::Reference
                            && refresh_none)
                }
                FrameType::Key => false,
            };
            if skip {
                self.skip_frame();
                return Ok(());
            }

            if self.tiles.is_empty() {
                return Err(DecodeError::Parser(anyhow!(
                    "complete frame without tile data"
                )));
            }
            self.submit_frame(timestamp)?;
        }

        Ok(())
    }

    fn submit_frame(&mut self, timestamp: u64) -> Result<(), DecodeError> {
        let fh = self
            .frame_hdr
            .take()
            .ok_or_else(|| anyhow!("no frame to submit"))?;
        let seq = Rc::clone(self.parser.sequence()?);

        let mut picture = self.backend.new_picture(&seq, &fh, &self.refs)?;
        for tile_group in &self.tiles {
            self.backend.decode_tile_group(&mut picture, tile_group)?;
        }
        self.tiles.clear();
        self.n_tiles = 0;

        let submitted = self.backend.submit_picture(picture)?;

        let props = self.take_frame_props(timestamp);
        self.handoff.submit(PendingFrame {
            handle: submitted.handle.clone(),
            visible: fh.show_frame,
            props,
        });

        self.refs.apply_refresh(&fh, &seq, &submitted);
        self.parser.apply_refresh(&fh, fh.refresh_frame_flags);

        Ok(())
    }

    /// The decode-frame-type filter rejected this frame: its headers still
    /// refresh the named slots so later frames can predict from them, but no
    /// pixels are decoded.
    fn skip_frame(&mut self) {
        let Some(fh) = self.frame_hdr.take() else {
            return;
        };
        let Ok(seq) = self.parser.sequence().map(Rc::clone) else {
            return;
        };

        log::debug!(
            "skipping {:?} frame with offset {}",
            fh.frame_type,
            fh.frame_offset
        );
        self.refs.apply_refresh_headers_only(&fh, &seq);
        self.parser.apply_refresh(&fh, fh.refresh_frame_flags);
        self.tiles.clear();
        self.n_tiles = 0;
    }

    fn take_frame_props(&mut self, timestamp: u64) -> FrameProps {
        FrameProps {
            timestamp,
            content_light: self.content_light.clone(),
            mastering_display: self.mastering_display.clone(),
            // T.35 payloads belong to exactly one output frame.
            itut_t35: std::mem::take(&mut self.itut_t35),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::basic_seq_payload;
    use crate::test_utils::key_frame_writer;
    use crate::test_utils::reduced_key_frame_writer;
    use crate::test_utils::reduced_seq_payload;
    use crate::test_utils::wrap_obu;
    use crate::test_utils::BitWriter;
    use crate::test_utils::DummyBackend;

    const OBU_SEQ_HDR: u32 = 1;
    const OBU_TD: u32 = 2;
    const OBU_FRAME_HDR: u32 = 3;
    const OBU_TILE_GRP: u32 = 4;
    const OBU_FRAME: u32 = 6;

    fn decoder() -> Decoder<DummyBackend> {
        Decoder::new(DummyBackend::default(), DecoderConfig::default())
    }

    /// Feeds `stream` one OBU at a time, checking that the consumed byte
    /// counts add up to the input size.
    fn run_stream(decoder: &mut Decoder<DummyBackend>, stream: &[u8]) -> Result<(), DecodeError> {
        let data = Bytes::copy_from_slice(stream);
        let mut consumed = 0;
        let mut timestamp = 0;
        while consumed < data.len() {
            consumed += decoder.parse_obus(&data.slice(consumed..), timestamp)?;
            timestamp += 1;
        }
        assert_eq!(consumed, data.len());
        Ok(())
    }

    /// A frame OBU holding a shown key frame plus one byte of tile data,
    /// matching [`basic_seq_payload`] with a frame no larger than one
    /// superblock per tile dimension step.
    fn shown_key_frame_obu(col_stop_bits: u32, row_stop_bits: u32) -> Vec<u8> {
        let mut w = key_frame_writer(true, false, None, col_stop_bits, row_stop_bits);
        w.byte_align();
        let mut payload = w.finish();
        payload.push(0xab);
        wrap_obu(OBU_FRAME, &payload)
    }

    #[test]
    fn reduced_still_picture_frame() {
        let mut dec = decoder();

        let mut stream = wrap_obu(OBU_SEQ_HDR, &reduced_seq_payload(320, 180));
        let mut w = reduced_key_frame_writer(1, 1);
        w.byte_align();
        let mut payload = w.finish();
        payload.push(0xab);
        stream.extend_from_slice(&wrap_obu(OBU_FRAME, &payload));

        run_stream(&mut dec, &stream).unwrap();

        assert!(dec.take_event_flags().contains(EventFlags::NEW_SEQUENCE));
        assert_eq!(dec.backend().sequences, 1);
        assert_eq!(dec.backend().submitted, 1);
        assert_eq!(dec.backend().tile_groups, 1);

        dec.flush();
        let out = dec.poll_frame().expect("the shown frame must be published");
        assert_eq!(out.handle.id, 0);
        assert!(dec.poll_frame().is_none());
    }

    #[test]
    fn temporal_delimiter_raises_event() {
        let mut dec = decoder();

        let mut stream = wrap_obu(OBU_TD, &[]);
        stream.extend_from_slice(&wrap_obu(OBU_SEQ_HDR, &basic_seq_payload(64, 64)));
        stream.extend_from_slice(&shown_key_frame_obu(0, 0));

        run_stream(&mut dec, &stream).unwrap();

        let events = dec.take_event_flags();
        assert!(events.contains(EventFlags::NEW_TEMPORAL_UNIT));
        assert!(events.contains(EventFlags::NEW_SEQUENCE));
        assert_eq!(dec.backend().submitted, 1);
    }

    #[test]
    fn show_existing_key_frame_fans_out() {
        let mut dec = decoder();

        let mut stream = wrap_obu(OBU_SEQ_HDR, &basic_seq_payload(64, 64));

        // An unshown but showable key frame refreshing only slot 3.
        let mut w = key_frame_writer(false, true, Some(1 << 3), 0, 0);
        w.byte_align();
        let mut payload = w.finish();
        payload.push(0xab);
        stream.extend_from_slice(&wrap_obu(OBU_FRAME, &payload));

        // Output slot 3 through show_existing_frame.
        let mut w = BitWriter::new();
        w.f(1, 1); // show existing frame
        w.f(3, 3); // existing frame idx
        w.trailing_bits();
        stream.extend_from_slice(&wrap_obu(OBU_FRAME_HDR, &w.finish()));

        run_stream(&mut dec, &stream).unwrap();

        // The key frame's slot was replicated into all eight slots.
        for i in 0..8 {
            let slot = dec.references().get(i);
            assert!(slot.is_populated());
            assert_eq!(slot.picture.as_ref().map(|p| p.id), Some(0));
            assert!(!slot.showable);
        }
        // Only the replicated source slot keeps its motion vectors.
        assert!(dec.references().get(3).mvs.is_some());
        assert!(dec.references().get(0).mvs.is_none());

        // The unshown frame is withheld; the show_existing emit is not.
        dec.flush();
        let out = dec.poll_frame().expect("the referenced frame must be published");
        assert_eq!(out.handle.id, 0);
        assert!(dec.poll_frame().is_none());
    }

    #[test]
    fn show_existing_from_empty_slot_fails() {
        let mut dec = decoder();

        let mut stream = wrap_obu(OBU_SEQ_HDR, &basic_seq_payload(64, 64));
        let mut w = BitWriter::new();
        w.f(1, 1);
        w.f(3, 3);
        w.trailing_bits();
        stream.extend_from_slice(&wrap_obu(OBU_FRAME_HDR, &w.finish()));

        assert!(run_stream(&mut dec, &stream).is_err());
    }

    /// A 256x64 key frame header with two uniform tile columns.
    fn two_tile_frame_hdr_obu() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.f(0, 1); // show existing frame
        w.f(0, 2); // frame type: key
        w.f(1, 1); // show frame
        w.f(0, 1); // disable cdf update
        w.f(0, 1); // frame size override
        w.f(0, 1); // render and frame size different
        w.f(1, 1); // disable frame end update cdf
        w.f(1, 1); // uniform tile spacing
        w.f(1, 1); // increment tile cols log2
        w.f(0, 1); // stop
        w.f(0, 1); // context update tile id
        w.f(0, 2); // tile size bytes minus 1
        w.f(0, 8); // base q idx
        w.f(0, 1); // y dc delta present
        w.f(0, 1); // u dc delta present
        w.f(0, 1); // u ac delta present
        w.f(0, 1); // using qmatrix
        w.f(0, 1); // segmentation enabled
        w.f(0, 1); // reduced tx set
        w.trailing_bits();
        wrap_obu(OBU_FRAME_HDR, &w.finish())
    }

    fn tile_group_obu(start: u32, end: u32, payload_byte: u8) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.f(1, 1); // tile start and end present
        w.f(start, 1);
        w.f(end, 1);
        w.byte_align();
        let mut payload = w.finish();
        payload.push(payload_byte);
        wrap_obu(OBU_TILE_GRP, &payload)
    }

    #[test]
    fn frame_submitted_once_all_tiles_arrive() {
        let mut dec = decoder();

        let mut stream = wrap_obu(OBU_SEQ_HDR, &basic_seq_payload(256, 64));
        stream.extend_from_slice(&two_tile_frame_hdr_obu());
        stream.extend_from_slice(&tile_group_obu(0, 0, 0x11));

        run_stream(&mut dec, &stream).unwrap();
        // Only one of the two tiles has arrived.
        assert_eq!(dec.backend().submitted, 0);
        assert!(dec.frame_hdr().is_some());

        let tg = Bytes::from(tile_group_obu(1, 1, 0x22));
        dec.parse_obus(&tg, 10).unwrap();
        assert_eq!(dec.backend().submitted, 1);
        assert_eq!(dec.backend().tile_groups, 2);
        assert!(dec.frame_hdr().is_none());
    }

    #[test]
    fn out_of_order_tile_group_discards_the_frame() {
        let mut dec = decoder();

        let mut stream = wrap_obu(OBU_SEQ_HDR, &basic_seq_payload(256, 64));
        stream.extend_from_slice(&two_tile_frame_hdr_obu());
        run_stream(&mut dec, &stream).unwrap();

        // The second tile arrives first.
        let tg = Bytes::from(tile_group_obu(1, 1, 0x22));
        assert!(dec.parse_obus(&tg, 0).is_err());
        assert_eq!(dec.backend().submitted, 0);
    }

    #[test]
    fn worker_error_is_surfaced_exactly_once() {
        let backend = DummyBackend {
            fail_sync: true,
            ..Default::default()
        };
        let mut dec = Decoder::new(backend, DecoderConfig::default());

        let seq = Bytes::from(wrap_obu(OBU_SEQ_HDR, &basic_seq_payload(64, 64)));
        dec.parse_obus(&seq, 0).unwrap();

        let frame = Bytes::from(shown_key_frame_obu(0, 0));
        dec.parse_obus(&frame, 1).unwrap();
        // Submitting the next frame drains the first worker and caches its
        // failure.
        dec.parse_obus(&frame, 2).unwrap();

        let td = Bytes::from(wrap_obu(OBU_TD, &[]));
        match dec.parse_obus(&td, 3) {
            Err(DecodeError::Worker { timestamp, .. }) => assert_eq!(timestamp, 1),
            other => panic!("expected the cached worker error, got {:?}", other.err()),
        }
        // Surfaced exactly once.
        dec.parse_obus(&td, 4).unwrap();
    }

    #[test]
    fn repeated_sequence_header_keeps_state() {
        let mut dec = decoder();

        let seq = wrap_obu(OBU_SEQ_HDR, &basic_seq_payload(64, 64));
        let mut stream = seq.clone();
        stream.extend_from_slice(&shown_key_frame_obu(0, 0));
        run_stream(&mut dec, &stream).unwrap();
        assert!(dec.take_event_flags().contains(EventFlags::NEW_SEQUENCE));
        assert!(dec.references().get(0).is_populated());

        // The same sequence header again: no new-sequence event, reference
        // slots survive.
        dec.parse_obus(&Bytes::from(seq), 10).unwrap();
        assert!(!dec.take_event_flags().contains(EventFlags::NEW_SEQUENCE));
        assert!(dec.references().get(0).is_populated());

        // A structurally different one flushes the slots.
        let other = Bytes::from(wrap_obu(OBU_SEQ_HDR, &basic_seq_payload(128, 128)));
        dec.parse_obus(&other, 11).unwrap();
        assert!(dec.take_event_flags().contains(EventFlags::NEW_SEQUENCE));
        assert!(!dec.references().get(0).is_populated());
    }

    #[test]
    fn frame_size_ceiling() {
        let config = DecoderConfig {
            frame_size_limit: 100,
            ..Default::default()
        };
        let mut dec = Decoder::new(DummyBackend::default(), config);

        let mut stream = wrap_obu(OBU_SEQ_HDR, &reduced_seq_payload(320, 180));
        let mut w = reduced_key_frame_writer(1, 1);
        w.byte_align();
        let mut payload = w.finish();
        payload.push(0xab);
        stream.extend_from_slice(&wrap_obu(OBU_FRAME, &payload));

        match run_stream(&mut dec, &stream) {
            Err(DecodeError::FrameSizeExceeded { width, height, limit }) => {
                assert_eq!((width, height, limit), (320, 180, 100));
            }
            other => panic!("expected the frame size limit to trip, got {:?}", other.err()),
        }
        assert!(dec.frame_hdr().is_none());
    }

    #[test]
    fn tile_group_without_frame_header_fails() {
        let mut dec = decoder();

        let mut stream = wrap_obu(OBU_SEQ_HDR, &basic_seq_payload(64, 64));
        stream.extend_from_slice(&tile_group_obu(0, 0, 0x11));

        assert!(run_stream(&mut dec, &stream).is_err());
    }
}
