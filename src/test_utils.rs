// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Test helpers: a bit writer to assemble conformant bitstreams and a dummy
//! backend that records what the decoder context dispatches to it.

use std::rc::Rc;

use anyhow::anyhow;

use crate::decoder::BackendResult;
use crate::decoder::DecodedHandle;
use crate::decoder::DecoderBackend;
use crate::decoder::SubmittedFrame;
use crate::decoder::TileGroup;
use crate::parser::FrameHeader;
use crate::parser::SequenceHeader;
use crate::refs::RefSlots;

/// Writes MSB-first bit fields, mirroring what the reader consumes.
#[derive(Default)]
pub struct BitWriter {
    data: Vec<u8>,
    nbits: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Writes `bits` bits of `value`, high bit first.
    pub fn f(&mut self, value: u32, bits: u32) {
        for i in (0..bits).rev() {
            let bit = (value >> i) & 1;
            if self.nbits % 8 == 0 {
                self.data.push(0);
            }
            let byte = self.data.last_mut().unwrap();
            *byte |= (bit as u8) << (7 - (self.nbits % 8));
            self.nbits += 1;
        }
    }

    pub fn byte_align(&mut self) {
        while self.nbits % 8 != 0 {
            self.f(0, 1);
        }
    }

    /// A one bit followed by zero bits up to the byte boundary.
    pub fn trailing_bits(&mut self) {
        self.f(1, 1);
        self.byte_align();
    }

    pub fn leb128(&mut self, mut value: u64) {
        assert!(self.nbits % 8 == 0);
        loop {
            let mut byte = (value & 0x7f) as u32;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.f(byte, 8);
            if value == 0 {
                break;
            }
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.byte_align();
        self.data
    }
}

/// Wraps `payload` into an OBU with a size field and no extension header.
pub fn wrap_obu(obu_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.f(0, 1); // forbidden bit
    w.f(obu_type, 4);
    w.f(0, 1); // extension flag
    w.f(1, 1); // has size field
    w.f(0, 1); // reserved
    w.leb128(payload.len() as u64);
    let mut data = w.finish();
    data.extend_from_slice(payload);
    data
}

/// A reduced still picture sequence header: one operating point, profile 0,
/// 8 bit 4:2:0, every optional tool off.
pub fn reduced_seq_payload(width: u32, height: u32) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.f(0, 3); // profile
    w.f(1, 1); // still picture
    w.f(1, 1); // reduced still picture header
    w.f(0, 3); // major level
    w.f(0, 2); // minor level
    w.f(15, 4); // width bits minus 1
    w.f(15, 4); // height bits minus 1
    w.f(width - 1, 16);
    w.f(height - 1, 16);
    w.f(0, 1); // sb128
    w.f(0, 1); // filter intra
    w.f(0, 1); // intra edge filter
    w.f(0, 1); // super res
    w.f(0, 1); // cdef
    w.f(0, 1); // restoration
    w.f(0, 1); // high bitdepth
    w.f(0, 1); // monochrome
    w.f(0, 1); // color description present
    w.f(0, 1); // color range
    w.f(0, 2); // chroma sample position
    w.f(0, 1); // separate uv delta q
    w.f(0, 1); // film grain present
    w.trailing_bits();
    w.finish()
}

/// A plain sequence header: one operating point, profile 0, 8 bit 4:2:0,
/// no order hints, no frame ids, every optional tool off.
pub fn basic_seq_payload(width: u32, height: u32) -> Vec<u8> {
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
    w.f(15, 4); // width bits minus 1
    w.f(15, 4); // height bits minus 1
    w.f(width - 1, 16);
    w.f(height - 1, 16);
    w.f(0, 1); // frame id numbers present
    w.f(0, 1); // sb128
    w.f(0, 1); // filter intra
    w.f(0, 1); // intra edge filter
    w.f(0, 1); // inter intra
    w.f(0, 1); // masked compound
    w.f(0, 1); // warped motion
    w.f(0, 1); // dual filter
    w.f(0, 1); // order hint
    w.f(0, 1); // screen content tools: not adaptive...
    w.f(0, 1); // ...and off
    w.f(0, 1); // super res
    w.f(0, 1); // cdef
    w.f(0, 1); // restoration
    w.f(0, 1); // high bitdepth
    w.f(0, 1); // monochrome
    w.f(0, 1); // color description present
    w.f(0, 1); // color range
    w.f(0, 2); // chroma sample position
    w.f(0, 1); // separate uv delta q
    w.f(0, 1); // film grain present
    w.trailing_bits();
    w.finish()
}

/// The body of a key frame header matching [`basic_seq_payload`], without
/// the trailing bits so the caller can close it as a frame header OBU or
/// continue with tile data inside a frame OBU.
///
/// `col_stop_bits`/`row_stop_bits` are the number of zero increment bits the
/// uniform tile spacing needs for the frame size in use (one each as long as
/// the frame is larger than one superblock and fits a single tile).
pub fn key_frame_writer(
    show: bool,
    showable: bool,
    refresh: Option<u32>,
    col_stop_bits: u32,
    row_stop_bits: u32,
) -> BitWriter {
    let mut w = BitWriter::new();
    w.f(0, 1); // show existing frame
    w.f(0, 2); // frame type: key
    w.f(u32::from(show), 1);
    if !show {
        w.f(u32::from(showable), 1);
        w.f(1, 1); // error resilient mode
    }
    w.f(0, 1); // disable cdf update
    w.f(0, 1); // frame size override
    if let Some(refresh) = refresh {
        w.f(refresh, 8);
    } else {
        assert!(show, "a shown key frame refreshes all slots implicitly");
    }
    w.f(0, 1); // render and frame size different
    w.f(1, 1); // disable frame end update cdf
    w.f(1, 1); // uniform tile spacing
    for _ in 0..col_stop_bits {
        w.f(0, 1);
    }
    for _ in 0..row_stop_bits {
        w.f(0, 1);
    }
    w.f(0, 8); // base q idx
    w.f(0, 1); // y dc delta present
    w.f(0, 1); // u dc delta present
    w.f(0, 1); // u ac delta present
    w.f(0, 1); // using qmatrix
    w.f(0, 1); // segmentation enabled
    w.f(0, 1); // reduced tx set
    w
}

/// The body of the key frame header implied by
/// [`reduced_seq_payload`]: the reduced still picture path skips most of the
/// syntax.
pub fn reduced_key_frame_writer(col_stop_bits: u32, row_stop_bits: u32) -> BitWriter {
    let mut w = BitWriter::new();
    w.f(0, 1); // disable cdf update
    w.f(0, 1); // allow screen content tools
    w.f(0, 1); // render and frame size different
    w.f(1, 1); // uniform tile spacing
    for _ in 0..col_stop_bits {
        w.f(0, 1);
    }
    for _ in 0..row_stop_bits {
        w.f(0, 1);
    }
    w.f(0, 8); // base q idx
    w.f(0, 1); // y dc delta present
    w.f(0, 1); // u dc delta present
    w.f(0, 1); // u ac delta present
    w.f(0, 1); // using qmatrix
    w.f(0, 1); // segmentation enabled
    w.f(0, 1); // reduced tx set
    w
}

/// A picture handle whose decode outcome is scripted by the test.
#[derive(Clone, Debug)]
pub struct DummyHandle {
    pub id: u32,
    pub fails: bool,
}

impl DecodedHandle for DummyHandle {
    fn is_ready(&self) -> bool {
        true
    }

    fn sync(&self) -> anyhow::Result<()> {
        if self.fails {
            Err(anyhow!("decode worker failed"))
        } else {
            Ok(())
        }
    }
}

/// Records what the decoder context dispatches without decoding anything.
#[derive(Default)]
pub struct DummyBackend {
    pub sequences: u32,
    pub pictures: u32,
    pub tile_groups: u32,
    pub submitted: u32,
    /// Makes every handle produced from now on report a worker failure.
    pub fail_sync: bool,
}

impl DecoderBackend for DummyBackend {
    type Handle = DummyHandle;
    type Picture = u32;
    type CdfContext = ();
    type SegmentationMap = ();
    type MotionVectors = ();

    fn new_sequence(&mut self, _: &Rc<SequenceHeader>, _: u32) -> BackendResult<()> {
        self.sequences += 1;
        Ok(())
    }

    fn new_picture(
        &mut self,
        _: &Rc<SequenceHeader>,
        _: &Rc<FrameHeader>,
        _: &RefSlots<Self>,
    ) -> BackendResult<Self::Picture> {
        let id = self.pictures;
        self.pictures += 1;
        Ok(id)
    }

    fn decode_tile_group(&mut self, _: &mut Self::Picture, _: &TileGroup) -> BackendResult<()> {
        self.tile_groups += 1;
        Ok(())
    }

    fn submit_picture(&mut self, picture: Self::Picture) -> BackendResult<SubmittedFrame<Self>> {
        self.submitted += 1;
        Ok(SubmittedFrame {
            handle: DummyHandle {
                id: picture,
                fails: self.fail_sync,
            },
            cdf: (),
            segmap: Some(()),
            mvs: Some(()),
        })
    }
}
