//! Frame synchronization on the raw streaming byte stream.
//!
//! Every frame starts with the data-packet byte (0x00). Alignment is found by
//! waiting until the register holds one full frame with a 0x00 at the front
//! and another 0x00 arrives exactly `frame_size` bytes later. After that the
//! synchronizer either free-runs, checking only the first byte of each frame,
//! or (continuous mode) keeps sliding the register one byte at a time and
//! releases a frame only when the next frame's leading byte confirms it.
//!
//! An ACK for a command sent while streaming is interleaved between frames.
//! It is recognised only at a frame boundary, and only while one is expected.
//! The ACK interleave and its position match one firmware revision.

use std::collections::VecDeque;

use log::{debug, trace, warn};

use crate::protocol::{ACK, DATA_PACKET};

/// What a pushed byte produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A complete frame, without its leading packet-type byte.
    Frame(Vec<u8>),
    /// An interleaved ACK.
    Ack,
    /// Alignment was lost after having been found. Carries the offending byte.
    Desync(u8),
}

#[derive(Debug)]
pub struct StreamSynchronizer {
    frame_size: usize,
    continuous: bool,
    register: VecDeque<u8>,
    /// Aligned and free-running.
    free_run: bool,
    ack_expected: bool,
    /// At least one frame emitted since the last reset.
    aligned_once: bool,
    /// In the middle of a misalignment episode (continuous mode).
    sliding: bool,
    resyncs: u64,
}

impl StreamSynchronizer {
    pub fn new(frame_size: usize, continuous: bool) -> Self {
        Self {
            frame_size,
            continuous,
            register: VecDeque::with_capacity(frame_size + 1),
            free_run: false,
            ack_expected: false,
            aligned_once: false,
            sliding: false,
            resyncs: 0,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn set_frame_size(&mut self, frame_size: usize) {
        self.frame_size = frame_size;
        self.reset();
    }

    pub fn set_continuous(&mut self, continuous: bool) {
        self.continuous = continuous;
    }

    pub fn set_ack_expected(&mut self, expected: bool) {
        self.ack_expected = expected;
    }

    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    pub fn is_aligned(&self) -> bool {
        self.free_run || (self.aligned_once && !self.sliding)
    }

    /// Bytes of a partial frame currently held.
    pub fn buffered(&self) -> usize {
        self.register.len()
    }

    /// Drop any partial frame and go back to searching.
    pub fn reset(&mut self) {
        if !self.register.is_empty() {
            debug!("Discarding {} buffered stream bytes", self.register.len());
        }
        self.register.clear();
        self.free_run = false;
        self.aligned_once = false;
        self.sliding = false;
    }

    fn capacity(&self) -> usize {
        self.frame_size + 1
    }

    fn take_frame(&mut self) -> Vec<u8> {
        self.register.iter().skip(1).copied().collect()
    }

    pub fn push(&mut self, byte: u8) -> Option<SyncEvent> {
        if self.free_run {
            return self.push_free_run(byte);
        }
        self.push_searching(byte)
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SyncEvent> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }

    fn push_free_run(&mut self, byte: u8) -> Option<SyncEvent> {
        if self.register.is_empty() {
            if byte == DATA_PACKET {
                self.register.push_back(byte);
                return None;
            }
            if byte == ACK && self.ack_expected {
                trace!("Interleaved ACK at frame boundary");
                return Some(SyncEvent::Ack);
            }
            warn!(
                "Expected frame start, got 0x{:02X}; searching for alignment",
                byte
            );
            self.resyncs += 1;
            self.free_run = false;
            self.sliding = true;
            self.register.push_back(byte);
            return Some(SyncEvent::Desync(byte));
        }
        self.register.push_back(byte);
        if self.register.len() == self.capacity() {
            let frame = self.take_frame();
            self.register.clear();
            return Some(SyncEvent::Frame(frame));
        }
        None
    }

    fn push_searching(&mut self, byte: u8) -> Option<SyncEvent> {
        let at_boundary = self.register.is_empty()
            || (self.register.len() == self.capacity() && self.register.front() == Some(&DATA_PACKET));
        if at_boundary && byte == ACK && self.ack_expected {
            trace!("Interleaved ACK at frame boundary");
            return Some(SyncEvent::Ack);
        }

        if self.register.len() < self.capacity() {
            self.register.push_back(byte);
            return None;
        }

        if self.register.front() == Some(&DATA_PACKET) && byte == DATA_PACKET {
            let frame = self.take_frame();
            self.register.clear();
            self.register.push_back(byte);
            if self.sliding {
                debug!("Frame alignment recovered");
                self.sliding = false;
            }
            self.aligned_once = true;
            if !self.continuous {
                self.free_run = true;
            }
            return Some(SyncEvent::Frame(frame));
        }

        self.register.pop_front();
        self.register.push_back(byte);
        if self.aligned_once && !self.sliding {
            warn!("Frame alignment lost at byte 0x{:02X}", byte);
            self.sliding = true;
            self.resyncs += 1;
            return Some(SyncEvent::Desync(byte));
        }
        None
    }
}
