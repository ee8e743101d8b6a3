//! Receive fifo memory
//!
//! A `FifoRegion` is the block of window memory one node receives into. The
//! peer writes frames and `wr_count` into it through its aperture; the owner
//! only reads frames. The `rd_count` word is written by the peer too: it is
//! how many of *our* messages the peer has consumed, mirrored here so the
//! sender can check capacity with a local read.
//!
//! Frame words are stored relaxed; `wr_count` and `rd_count` are published
//! with release and observed with acquire, as in the IPC rings.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::message::{Frame, FRAME_WORDS};
use crate::error::{C2cError, Result};

/// Shared fifo memory: header plus a ring of frames
pub struct FifoRegion {
    /// Frames the peer has written into this region
    wr_count: AtomicU32,
    /// Frames of ours the peer has read, published by the peer
    rd_count: AtomicU32,
    nframes: u32,
    /// Words per frame slot; slots may be larger than one message
    slot_words: usize,
    words: Box<[AtomicU64]>,
}

impl FifoRegion {
    /// Allocate a zeroed region of `nframes` slots of `frame_size` bytes
    pub fn new(nframes: u32, frame_size: u32) -> Result<Self> {
        let slot_words = frame_size as usize / 8;
        if nframes == 0 || slot_words < FRAME_WORDS || frame_size % 8 != 0 {
            return Err(C2cError::InvalidArgument(format!(
                "fifo of {nframes} frames x {frame_size} bytes"
            )));
        }
        let words = (0..nframes as usize * slot_words).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            wr_count: AtomicU32::new(0),
            rd_count: AtomicU32::new(0),
            nframes,
            slot_words,
            words,
        })
    }

    /// Capacity in frames
    pub fn nframes(&self) -> u32 {
        self.nframes
    }

    pub fn wr_count(&self) -> u32 {
        self.wr_count.load(Ordering::Acquire)
    }

    pub fn rd_count(&self) -> u32 {
        self.rd_count.load(Ordering::Acquire)
    }

    pub(crate) fn publish_wr_count(&self, count: u32) {
        self.wr_count.store(count, Ordering::Release);
    }

    pub(crate) fn publish_rd_count(&self, count: u32) {
        self.rd_count.store(count, Ordering::Release);
    }

    pub(crate) fn write_frame(&self, pos: u32, frame: &Frame) {
        let base = pos as usize * self.slot_words;
        for (slot, word) in self.words[base..base + FRAME_WORDS].iter().zip(frame) {
            slot.store(*word, Ordering::Relaxed);
        }
    }

    pub(crate) fn read_frame(&self, pos: u32) -> Frame {
        let base = pos as usize * self.slot_words;
        let mut frame = [0u64; FRAME_WORDS];
        for (word, slot) in frame.iter_mut().zip(&self.words[base..base + FRAME_WORDS]) {
            *word = slot.load(Ordering::Relaxed);
        }
        frame
    }
}

impl std::fmt::Debug for FifoRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoRegion")
            .field("nframes", &self.nframes)
            .field("wr_count", &self.wr_count())
            .field("rd_count", &self.rd_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_slots_keep_frames_apart() {
        let fifo = FifoRegion::new(4, 128).unwrap();
        fifo.write_frame(0, &[1; FRAME_WORDS]);
        fifo.write_frame(1, &[2; FRAME_WORDS]);
        assert_eq!(fifo.read_frame(0), [1; FRAME_WORDS]);
        assert_eq!(fifo.read_frame(1), [2; FRAME_WORDS]);
        assert_eq!(fifo.read_frame(3), [0; FRAME_WORDS]);
    }

    #[test]
    fn test_rejects_small_slots() {
        assert!(FifoRegion::new(4, 32).is_err());
        assert!(FifoRegion::new(0, 64).is_err());
    }
}
