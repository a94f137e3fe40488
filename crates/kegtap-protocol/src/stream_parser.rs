//! Stream parser for KBSP frames.
//!
//! Serial and socket reads deliver arbitrary chunks: part of a frame, several
//! frames, or line noise from a board that is still booting. The parser
//! accumulates bytes, locates the `KBSP v1:` header, and extracts frames whose
//! length, CRC and trailer all check out.
//!
//! # Usage
//!
//! ```
//! use kegtap_protocol::{Frame, StreamParser};
//!
//! let wire = Frame::new(0x81, Vec::new()).unwrap().to_bytes();
//! let mut parser = StreamParser::new();
//!
//! parser.feed(&wire[..5]);
//! assert!(parser.next_frame().is_none());
//!
//! parser.feed(&wire[5..]);
//! assert_eq!(parser.next_frame().unwrap().message_id(), 0x81);
//! ```

use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use tracing::debug;

use kegtap_core::constants::{
    FRAME_HEADER, FRAME_OVERHEAD, FRAME_PREAMBLE_FIELDS, FRAME_TRAILER, MAX_PAYLOAD_SIZE,
};

use crate::frame::{Frame, verify_crc};

/// Upper bound on buffered bytes before the parser gives up and resets.
const MAX_BUFFER_SIZE: usize = 4 * 1024;

const INITIAL_BUFFER_CAPACITY: usize = 512;

const INITIAL_FRAME_QUEUE_CAPACITY: usize = 4;

/// Header plus id and length: what must be buffered before the frame size is known.
const PREAMBLE_SIZE: usize = FRAME_HEADER.len() + FRAME_PREAMBLE_FIELDS;

/// State machine states for parsing KBSP frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Scanning for the `KBSP v1:` header. Bytes before it are discarded.
    SearchingHeader,

    /// Header found at the start of the buffer; waiting for the rest of the frame.
    ReadingFrame,
}

/// Stateful stream parser for KBSP frames.
///
/// ```text
/// ┌────────────────┐  header found  ┌──────────────┐  frame complete  ┌─────────────┐
/// │SearchingHeader │───────────────>│ ReadingFrame │─────────────────>│Frame queued │
/// └────────────────┘                └──────────────┘                  └─────────────┘
///        ^                                 │ bad length / CRC / trailer       │
///        │                                 │ (skip one byte, rescan)          │
///        └─────────────────────────────────┴──────────────────────────────────┘
/// ```
///
/// A rejected frame only advances the buffer by one byte, so a genuine frame
/// that starts inside the corrupt one is still found.
#[derive(Debug)]
pub struct StreamParser {
    buffer: BytesMut,
    state: ParserState,
    frames: VecDeque<Frame>,
    rejected: u64,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            state: ParserState::SearchingHeader,
            frames: VecDeque::with_capacity(INITIAL_FRAME_QUEUE_CAPACITY),
            rejected: 0,
        }
    }

    /// Feed bytes into the parser, extracting every frame they complete.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);

        while self.try_extract_frame() {}

        if self.buffer.len() > MAX_BUFFER_SIZE {
            debug!(buffered = self.buffer.len(), "Parser buffer overflow, resetting");
            self.buffer.clear();
            self.state = ParserState::SearchingHeader;
        }
    }

    /// Next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn frames_available(&self) -> usize {
        self.frames.len()
    }

    /// Frames discarded for a bad length, CRC or trailer since creation.
    pub fn rejected_frames(&self) -> u64 {
        self.rejected
    }

    /// Discard buffered bytes and queued frames.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.frames.clear();
        self.state = ParserState::SearchingHeader;
    }

    /// Iterator over the currently queued frames.
    pub fn drain_frames(&mut self) -> DrainFrames<'_> {
        DrainFrames { parser: self }
    }

    fn try_extract_frame(&mut self) -> bool {
        loop {
            match self.state {
                ParserState::SearchingHeader => {
                    if !self.seek_header() {
                        return false;
                    }
                }
                ParserState::ReadingFrame => return self.read_frame(),
            }
        }
    }

    /// Drop bytes up to the next header. Returns `true` when one was found.
    fn seek_header(&mut self) -> bool {
        if let Some(pos) = self
            .buffer
            .windows(FRAME_HEADER.len())
            .position(|window| window == FRAME_HEADER)
        {
            self.buffer.advance(pos);
            self.state = ParserState::ReadingFrame;
            true
        } else {
            // Keep a tail that could be the start of a header split across reads.
            let keep = self.buffer.len().min(FRAME_HEADER.len() - 1);
            let drop = self.buffer.len() - keep;
            self.buffer.advance(drop);
            false
        }
    }

    /// Returns `true` when a frame was queued or rejected and parsing should continue.
    fn read_frame(&mut self) -> bool {
        if self.buffer.len() < PREAMBLE_SIZE {
            return false;
        }

        let id_at = FRAME_HEADER.len();
        let message_id = u16::from_le_bytes([self.buffer[id_at], self.buffer[id_at + 1]]);
        let payload_len =
            usize::from(u16::from_le_bytes([self.buffer[id_at + 2], self.buffer[id_at + 3]]));

        if payload_len > MAX_PAYLOAD_SIZE {
            self.reject(message_id, "payload length over limit");
            return true;
        }

        let total = FRAME_OVERHEAD + payload_len;
        if self.buffer.len() < total {
            return false;
        }

        let wire = &self.buffer[..total];
        if &wire[total - FRAME_TRAILER.len()..] != FRAME_TRAILER {
            self.reject(message_id, "missing trailer");
            return true;
        }
        if let Err(e) = verify_crc(wire) {
            self.reject(message_id, &e.to_string());
            return true;
        }

        let payload = wire[PREAMBLE_SIZE..PREAMBLE_SIZE + payload_len].to_vec();
        match Frame::new(message_id, payload) {
            Ok(frame) => self.frames.push_back(frame),
            Err(e) => debug!(error = %e, "Dropping frame"),
        }
        self.buffer.advance(total);
        self.state = ParserState::SearchingHeader;
        true
    }

    fn reject(&mut self, message_id: u16, reason: &str) {
        self.rejected += 1;
        debug!(message_id, reason, "Rejected frame");
        self.buffer.advance(1);
        self.state = ParserState::SearchingHeader;
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator that drains frames from a [`StreamParser`].
pub struct DrainFrames<'a> {
    parser: &'a mut StreamParser,
}

impl Iterator for DrainFrames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Self::Item> {
        self.parser.next_frame()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.parser.frames_available();
        (len, Some(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn meter(ticks: u32) -> Vec<u8> {
        Message::MeterStatus {
            meter_name: "flow0".into(),
            ticks,
        }
        .to_frame()
        .unwrap()
        .to_bytes()
        .to_vec()
    }

    #[test]
    fn test_single_frame() {
        let mut parser = StreamParser::new();
        parser.feed(&meter(5));
        assert_eq!(parser.frames_available(), 1);
        assert_eq!(parser.state(), ParserState::SearchingHeader);
    }

    #[test]
    fn test_byte_by_byte() {
        let mut parser = StreamParser::new();
        for byte in meter(5) {
            parser.feed(&[byte]);
        }
        assert_eq!(parser.frames_available(), 1);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut wire = meter(1);
        wire.extend(meter(2));
        wire.extend(meter(3));

        let mut parser = StreamParser::new();
        parser.feed(&wire);
        assert_eq!(parser.drain_frames().count(), 3);
    }

    #[test]
    fn test_garbage_before_header_discarded() {
        let mut wire = b"boot v18\r\nKBS".to_vec();
        wire.extend(meter(7));

        let mut parser = StreamParser::new();
        parser.feed(&wire);
        assert_eq!(parser.frames_available(), 1);
        assert_eq!(parser.rejected_frames(), 0);
    }

    #[test]
    fn test_header_split_across_reads() {
        let wire = meter(9);
        let mut parser = StreamParser::new();
        parser.feed(b"noise");
        parser.feed(&wire[..4]);
        parser.feed(&wire[4..]);
        assert_eq!(parser.frames_available(), 1);
    }

    #[test]
    fn test_bad_crc_rejected_then_resync() {
        let mut corrupt = meter(1);
        let crc_at = corrupt.len() - 4;
        corrupt[crc_at] ^= 0x55;
        corrupt.extend(meter(2));

        let mut parser = StreamParser::new();
        parser.feed(&corrupt);

        assert_eq!(parser.rejected_frames(), 1);
        let frames: Vec<_> = parser.drain_frames().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            Message::try_from(&frames[0]).unwrap(),
            Message::MeterStatus {
                meter_name: "flow0".into(),
                ticks: 2
            }
        );
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut wire = FRAME_HEADER.to_vec();
        wire.extend_from_slice(&0x10u16.to_le_bytes());
        wire.extend_from_slice(&500u16.to_le_bytes());
        wire.extend(meter(4));

        let mut parser = StreamParser::new();
        parser.feed(&wire);
        assert_eq!(parser.rejected_frames(), 1);
        assert_eq!(parser.frames_available(), 1);
    }

    #[test]
    fn test_clear_resets() {
        let wire = meter(1);
        let mut parser = StreamParser::new();
        parser.feed(&wire[..12]);
        assert_eq!(parser.state(), ParserState::ReadingFrame);
        parser.clear();
        assert_eq!(parser.state(), ParserState::SearchingHeader);
        parser.feed(&wire[12..]);
        assert_eq!(parser.frames_available(), 0);
    }
}
