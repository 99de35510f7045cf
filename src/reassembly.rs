//! Turns notification chunks into fixed-length protocol frames.
//!
//! The device splits every 300-byte frame over several notifications
//! without a length prefix. A chunk opening with [`FRAME_MARKER`] always
//! starts a new frame; following chunks are appended until the frame is
//! full.

use crate::protocol::{FRAME_LENGTH, FRAME_MARKER, FRAME_TYPE_OFFSET};
use std::fmt;

/// Fixed-capacity frame buffer with a fill length.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    buffer: [u8; FRAME_LENGTH],
    len: usize,
}

impl Frame {
    fn new() -> Self {
        Self {
            buffer: [0; FRAME_LENGTH],
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    // Copies as much of `chunk` as fits and returns the number of bytes taken.
    fn extend(&mut self, chunk: &[u8]) -> usize {
        let taken = chunk.len().min(FRAME_LENGTH - self.len);
        self.buffer[self.len..self.len + taken].copy_from_slice(&chunk[..taken]);
        self.len += taken;
        taken
    }

    /// The filled part of the buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_complete(&self) -> bool {
        self.len == FRAME_LENGTH
    }

    /// Raw type byte, if the frame is long enough to carry one.
    pub fn frame_type(&self) -> Option<u8> {
        self.as_bytes().get(FRAME_TYPE_OFFSET).copied()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({}) {:02X?}", self.len, self.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    Idle,
    /// Bytes collected so far.
    Accumulating(usize),
    Complete,
}

/// Result of feeding one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// Shorter than the marker; dropped.
    TooShort,
    /// No frame in progress and the chunk is not a frame start.
    OutOfSync,
    /// A marker chunk started a new frame, discarding this many buffered bytes.
    Started { discarded: usize },
    Appended,
    Complete(Frame),
}

impl Feed {
    pub fn completed(self) -> Option<Frame> {
        match self {
            Feed::Complete(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Per-session reassembly state machine.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    frame: Frame,
    state: ReassemblyState,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            frame: Frame::new(),
            state: ReassemblyState::Idle,
        }
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    /// Drops any partial frame.
    pub fn reset(&mut self) {
        self.frame.clear();
        self.state = ReassemblyState::Idle;
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Feed {
        if chunk.len() < FRAME_MARKER.len() {
            log::trace!("Dropping {} byte chunk", chunk.len());
            return Feed::TooShort;
        }

        if chunk.starts_with(&FRAME_MARKER) {
            let discarded = match self.state {
                ReassemblyState::Accumulating(len) => len,
                _ => 0,
            };
            if discarded > 0 {
                log::debug!("Frame start while accumulating, discarding {discarded} bytes");
            }
            self.frame.clear();
            self.frame.extend(chunk);
            if self.frame.is_complete() {
                return self.complete();
            }
            self.state = ReassemblyState::Accumulating(self.frame.len());
            return Feed::Started { discarded };
        }

        match self.state {
            ReassemblyState::Accumulating(_) => {
                let taken = self.frame.extend(chunk);
                if taken < chunk.len() {
                    log::trace!("Dropping {} bytes past frame end", chunk.len() - taken);
                }
                if self.frame.is_complete() {
                    self.complete()
                } else {
                    self.state = ReassemblyState::Accumulating(self.frame.len());
                    Feed::Appended
                }
            }
            ReassemblyState::Idle | ReassemblyState::Complete => {
                log::trace!("Chunk without frame start: {chunk:02X?}");
                Feed::OutOfSync
            }
        }
    }

    fn complete(&mut self) -> Feed {
        self.state = ReassemblyState::Complete;
        let frame = self.frame.clone();
        self.frame.clear();
        log::trace!("Frame complete: {frame:?}");
        Feed::Complete(frame)
    }
}
