// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The eight reference picture slots shared across frames.
//!
//! Each slot owns a picture handle together with the headers that were
//! current when it was produced, plus the CDF context, segmentation map and
//! motion vector buffers the pixel pipeline associated with the picture. All
//! resources use shared ownership so that multiple slots, and frames still in
//! flight, can reference the same picture.

use std::rc::Rc;

use crate::decoder::DecoderBackend;
use crate::decoder::SubmittedFrame;
use crate::parser::FrameHeader;
use crate::parser::SequenceHeader;
use crate::parser::NUM_REF_FRAMES;

pub struct RefSlot<B: DecoderBackend> {
    pub picture: Option<B::Handle>,
    pub frame_hdr: Option<Rc<FrameHeader>>,
    pub seq_hdr: Option<Rc<SequenceHeader>>,
    pub cdf: Option<B::CdfContext>,
    pub segmap: Option<B::SegmentationMap>,
    pub mvs: Option<B::MotionVectors>,
    /// Whether the picture may still be output through
    /// show_existing_frame.
    pub showable: bool,
}

impl<B: DecoderBackend> RefSlot<B> {
    /// A slot takes part in inter prediction as soon as it carries a frame
    /// header, even if the pixel data was never decoded.
    pub fn is_populated(&self) -> bool {
        self.frame_hdr.is_some()
    }
}

impl<B: DecoderBackend> Default for RefSlot<B> {
    fn default() -> Self {
        Self {
            picture: None,
            frame_hdr: None,
            seq_hdr: None,
            cdf: None,
            segmap: None,
            mvs: None,
            showable: false,
        }
    }
}

impl<B: DecoderBackend> Clone for RefSlot<B> {
    fn clone(&self) -> Self {
        Self {
            picture: self.picture.clone(),
            frame_hdr: self.frame_hdr.clone(),
            seq_hdr: self.seq_hdr.clone(),
            cdf: self.cdf.clone(),
            segmap: self.segmap.clone(),
            mvs: self.mvs.clone(),
            showable: self.showable,
        }
    }
}

pub struct RefSlots<B: DecoderBackend>([RefSlot<B>; NUM_REF_FRAMES]);

impl<B: DecoderBackend> Default for RefSlots<B> {
    fn default() -> Self {
        Self(std::array::from_fn(|_| RefSlot::default()))
    }
}

impl<B: DecoderBackend> RefSlots<B> {
    pub fn get(&self, slot: usize) -> &RefSlot<B> {
        &self.0[slot]
    }

    /// Replaces a slot wholesale.
    pub fn replace(&mut self, slot: usize, contents: RefSlot<B>) {
        self.0[slot] = contents;
    }

    /// Installs a freshly submitted frame into every slot named by its
    /// `refresh_frame_flags`.
    pub fn apply_refresh(
        &mut self,
        fh: &Rc<FrameHeader>,
        seq: &Rc<SequenceHeader>,
        submitted: &SubmittedFrame<B>,
    ) {
        for (i, slot) in self.0.iter_mut().enumerate() {
            if fh.refresh_frame_flags & (1 << i) != 0 {
                *slot = RefSlot {
                    picture: Some(submitted.handle.clone()),
                    frame_hdr: Some(Rc::clone(fh)),
                    seq_hdr: Some(Rc::clone(seq)),
                    cdf: Some(submitted.cdf.clone()),
                    segmap: submitted.segmap.clone(),
                    mvs: submitted.mvs.clone(),
                    showable: fh.showable_frame,
                };
            }
        }
    }

    /// Installs only the headers of a frame that was parsed but not decoded.
    /// The slots lose their pixel data but stay populated so that later
    /// frame headers can still predict from them.
    pub fn apply_refresh_headers_only(&mut self, fh: &Rc<FrameHeader>, seq: &Rc<SequenceHeader>) {
        for (i, slot) in self.0.iter_mut().enumerate() {
            if fh.refresh_frame_flags & (1 << i) != 0 {
                slot.picture = None;
                slot.frame_hdr = Some(Rc::clone(fh));
                slot.seq_hdr = Some(Rc::clone(seq));
                slot.showable = false;
            }
        }
    }

    /// Replicates slot `idx` into all other slots after a key frame was
    /// output through show_existing_frame. The source slot stops being
    /// showable and keeps its motion vectors; the other slots lose theirs.
    pub fn fan_out_from_key(&mut self, idx: usize) {
        self.0[idx].showable = false;
        let src = self.0[idx].clone();
        for (i, slot) in self.0.iter_mut().enumerate() {
            if i == idx {
                continue;
            }
            *slot = RefSlot {
                picture: src.picture.clone(),
                frame_hdr: src.frame_hdr.clone(),
                seq_hdr: src.seq_hdr.clone(),
                cdf: src.cdf.clone(),
                segmap: src.segmap.clone(),
                mvs: None,
                showable: false,
            };
        }
    }

    pub fn drop_all(&mut self) {
        *self = Default::default();
    }
}
