// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hands completed frames over to the decode workers and harvests their
//! delayed outputs in submission order.
//!
//! The ring has one slot per frame worker. Submitting a frame claims the
//! next slot; if that slot still holds an earlier frame, its worker is
//! synced first, which is the only back-pressure channel between the parser
//! and the pixel pipeline. A worker failure is cached together with the
//! failed frame's timestamp and surfaced exactly once; it never displaces
//! the outputs of frames submitted before it.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::decoder::DecodedHandle;
use crate::parser::ContentLightLevel;
use crate::parser::ItutT35;
use crate::parser::MasteringDisplay;

/// Metadata attached to a frame when it is submitted and returned with it
/// when it is published.
#[derive(Clone, Debug, Default)]
pub struct FrameProps {
    pub timestamp: u64,
    pub content_light: Option<Rc<ContentLightLevel>>,
    pub mastering_display: Option<Rc<MasteringDisplay>>,
    pub itut_t35: Vec<ItutT35>,
}

/// A frame parked in the ring until its worker drains.
pub struct PendingFrame<H> {
    pub handle: H,
    /// Whether the frame should reach the user-facing output queue.
    pub visible: bool,
    pub props: FrameProps,
}

/// A fully decoded frame ready to be returned to the user.
pub struct OutputFrame<H> {
    pub handle: H,
    pub props: FrameProps,
}

/// An error reported by a decode worker, stamped with the input timestamp of
/// the frame that failed.
#[derive(Debug)]
pub struct WorkerError {
    pub error: anyhow::Error,
    pub timestamp: u64,
}

pub struct FrameHandoff<H: DecodedHandle> {
    slots: Vec<Option<PendingFrame<H>>>,
    next: usize,
    output_invisible_frames: bool,
    ready: VecDeque<OutputFrame<H>>,
    cached_error: Option<WorkerError>,
}

impl<H: DecodedHandle> FrameHandoff<H> {
    pub fn new(n_frame_workers: usize, output_invisible_frames: bool) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(std::cmp::max(n_frame_workers, 1), || None);
        Self {
            slots,
            next: 0,
            output_invisible_frames,
            ready: VecDeque::new(),
            cached_error: None,
        }
    }

    /// Parks `frame` in the next ring slot, first harvesting whatever the
    /// slot's worker produced for the previous frame. Publish order equals
    /// submission order because slots are claimed and harvested cyclically.
    pub fn submit(&mut self, frame: PendingFrame<H>) {
        let slot = self.next;
        self.next = (self.next + 1) % self.slots.len();

        if let Some(previous) = self.slots[slot].take() {
            self.harvest(previous);
        }
        self.slots[slot] = Some(frame);
    }

    fn harvest(&mut self, frame: PendingFrame<H>) {
        match frame.handle.sync() {
            Err(error) => {
                self.cached_error = Some(WorkerError {
                    error,
                    timestamp: frame.props.timestamp,
                });
            }
            Ok(()) => {
                if frame.visible || self.output_invisible_frames {
                    self.ready.push_back(OutputFrame {
                        handle: frame.handle,
                        props: frame.props,
                    });
                }
            }
        }
    }

    /// Drains every parked frame, in submission order.
    pub fn flush(&mut self) {
        for i in 0..self.slots.len() {
            let slot = (self.next + i) % self.slots.len();
            if let Some(frame) = self.slots[slot].take() {
                self.harvest(frame);
            }
        }
        self.next = 0;
    }

    /// Returns the next published frame, if any.
    pub fn poll(&mut self) -> Option<OutputFrame<H>> {
        self.ready.pop_front()
    }

    /// Returns the cached worker error, clearing it.
    pub fn take_error(&mut self) -> Option<WorkerError> {
        self.cached_error.take()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use anyhow::anyhow;

    use super::*;

    /// A handle whose decode outcome and sync order are scripted by the
    /// test.
    #[derive(Clone)]
    struct FakeHandle {
        id: u32,
        fails: bool,
        sync_log: Rc<RefCell<Vec<u32>>>,
    }

    impl DecodedHandle for FakeHandle {
        fn is_ready(&self) -> bool {
            true
        }

        fn sync(&self) -> anyhow::Result<()> {
            self.sync_log.borrow_mut().push(self.id);
            if self.fails {
                Err(anyhow!("worker failed"))
            } else {
                Ok(())
            }
        }
    }

    fn frame(id: u32, visible: bool, fails: bool, log: &Rc<RefCell<Vec<u32>>>) -> PendingFrame<FakeHandle> {
        PendingFrame {
            handle: FakeHandle {
                id,
                fails,
                sync_log: Rc::clone(log),
            },
            visible,
            props: FrameProps {
                timestamp: u64::from(id),
                ..Default::default()
            },
        }
    }

    #[test]
    fn publish_order_matches_submission_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut handoff = FrameHandoff::new(3, false);

        for id in 0..6 {
            handoff.submit(frame(id, true, false, &log));
        }
        handoff.flush();

        let mut published = Vec::new();
        while let Some(out) = handoff.poll() {
            published.push(out.handle.id);
        }
        assert_eq!(published, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn invisible_frames_are_withheld() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut handoff = FrameHandoff::new(2, false);

        handoff.submit(frame(0, false, false, &log));
        handoff.submit(frame(1, true, false, &log));
        handoff.flush();

        assert_eq!(handoff.poll().map(|f| f.handle.id), Some(1));
        assert!(handoff.poll().is_none());

        let mut handoff = FrameHandoff::new(2, true);
        handoff.submit(frame(0, false, false, &log));
        handoff.flush();
        assert_eq!(handoff.poll().map(|f| f.handle.id), Some(0));
    }

    #[test]
    fn worker_error_is_cached_and_surfaced_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut handoff = FrameHandoff::new(1, false);

        handoff.submit(frame(7, true, true, &log));
        // Submitting the next frame harvests the failed one.
        handoff.submit(frame(8, true, false, &log));

        let err = handoff.take_error().expect("error should be cached");
        assert_eq!(err.timestamp, 7);
        assert!(handoff.take_error().is_none());

        // The failed frame never reached the output queue.
        assert!(handoff.poll().is_none());
        handoff.flush();
        assert_eq!(handoff.poll().map(|f| f.handle.id), Some(8));
    }

    #[test]
    fn error_does_not_displace_earlier_outputs() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut handoff = FrameHandoff::new(2, false);

        handoff.submit(frame(0, true, false, &log));
        handoff.submit(frame(1, true, true, &log));
        handoff.flush();

        assert_eq!(handoff.poll().map(|f| f.handle.id), Some(0));
        assert!(handoff.poll().is_none());
        assert_eq!(handoff.take_error().map(|e| e.timestamp), Some(1));
    }
}
