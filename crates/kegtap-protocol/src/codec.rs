//! Tokio codecs for controller transports.
//!
//! [`KegboardCodec`] frames binary KBSP over serial/USB, [`TextCodec`] frames
//! newline-delimited text over network sockets. [`WireCodec`] dispatches to
//! either so a controller can hold one codec regardless of transport.
//!
//! ```text
//! transport bytes -> Decoder -> Message
//! Message -> Encoder -> transport bytes
//! ```
//!
//! # Error Handling
//!
//! Corrupt binary frames (bad CRC, missing trailer, oversized length) are
//! dropped inside the [`StreamParser`] and never surface. A frame that passes
//! framing but cannot be interpreted (unknown id, missing field) is returned
//! as an error; the codec stays usable and the next call continues with the
//! following frame.
//!
//! ```
//! use bytes::BytesMut;
//! use tokio_util::codec::{Decoder, Encoder};
//! use kegtap_protocol::{KegboardCodec, Message};
//!
//! let mut codec = KegboardCodec::new();
//! let mut wire = BytesMut::new();
//! codec.encode(Message::SetOutput { output_id: 0, enabled: true }, &mut wire).unwrap();
//!
//! let decoded = codec.decode(&mut wire).unwrap();
//! assert_eq!(decoded, Some(Message::SetOutput { output_id: 0, enabled: true }));
//! ```

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use kegtap_core::constants::MAX_TEXT_LINE;
use kegtap_core::{Error, Result};

use crate::message::Message;
use crate::stream_parser::StreamParser;
use crate::text::{format_message, parse_line};

/// Binary KBSP codec.
#[derive(Debug, Default)]
pub struct KegboardCodec {
    parser: StreamParser,
}

impl KegboardCodec {
    pub fn new() -> Self {
        Self {
            parser: StreamParser::new(),
        }
    }

    /// Frames dropped for bad framing since creation.
    pub fn rejected_frames(&self) -> u64 {
        self.parser.rejected_frames()
    }
}

impl Decoder for KegboardCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if !src.is_empty() {
            // All bytes now belong to the parser's buffer.
            self.parser.feed(src);
            src.clear();
        }

        match self.parser.next_frame() {
            Some(frame) => Message::try_from(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for KegboardCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        item.to_frame()?.encode_into(dst);
        Ok(())
    }
}

/// Line-based text codec.
#[derive(Debug, Default)]
pub struct TextCodec {
    /// Set while skipping the remainder of an overlong line.
    discarding: bool,
}

impl TextCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for TextCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let Some(newline) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_TEXT_LINE {
                    src.clear();
                    self.discarding = true;
                }
                return Ok(None);
            };

            let line = src.split_to(newline + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }

            let text = std::str::from_utf8(&line[..newline])
                .map_err(|_| Error::InvalidMessageFormat("line is not UTF-8".into()))?;
            if let Some(message) = parse_line(text.trim_end_matches('\r'))? {
                return Ok(Some(message));
            }
        }
    }
}

impl Encoder<Message> for TextCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let line = format_message(&item);
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Framing used on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Binary,
    Text,
}

/// Codec chosen per transport.
#[derive(Debug)]
pub enum WireCodec {
    Binary(KegboardCodec),
    Text(TextCodec),
}

impl WireCodec {
    pub fn new(format: WireFormat) -> Self {
        match format {
            WireFormat::Binary => WireCodec::Binary(KegboardCodec::new()),
            WireFormat::Text => WireCodec::Text(TextCodec::new()),
        }
    }

    pub fn format(&self) -> WireFormat {
        match self {
            WireCodec::Binary(_) => WireFormat::Binary,
            WireCodec::Text(_) => WireFormat::Text,
        }
    }

    /// Encode one message into a fresh buffer.
    pub fn encode_message(&mut self, message: Message) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        self.encode(message, &mut buf)?;
        Ok(buf)
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self {
            WireCodec::Binary(codec) => codec.decode(src),
            WireCodec::Text(codec) => codec.decode(src),
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        match self {
            WireCodec::Binary(codec) => codec.encode(item, dst),
            WireCodec::Text(codec) => codec.encode(item, dst),
        }
    }
}

/// Drain every message currently decodable from `src`.
///
/// Interpretation errors are collected alongside messages so a single bad
/// frame does not hide the frames after it.
pub fn decode_all<D>(codec: &mut D, src: &mut BytesMut) -> (Vec<Message>, Vec<Error>)
where
    D: Decoder<Item = Message, Error = Error>,
{
    let mut messages = Vec::new();
    let mut errors = Vec::new();
    loop {
        match codec.decode(src) {
            Ok(Some(message)) => messages.push(message),
            Ok(None) => break,
            Err(e) => errors.push(e),
        }
    }
    (messages, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = KegboardCodec::new();
        let wire = Message::Ping.to_frame().unwrap().to_bytes();

        let mut buf = BytesMut::from(&wire[..6]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        let mut buf = BytesMut::from(&wire[6..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Ping));
    }

    #[test]
    fn test_unknown_message_does_not_poison_codec() {
        let mut codec = KegboardCodec::new();
        let mut buf = BytesMut::new();
        Frame::new(0x55, Vec::new()).unwrap().encode_into(&mut buf);
        codec.encode(Message::Ping, &mut buf).unwrap();

        let (messages, errors) = decode_all(&mut codec, &mut buf);
        assert_eq!(messages, vec![Message::Ping]);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::UnknownMessage(0x55)));
    }

    #[test]
    fn test_text_decode_multiple_lines() {
        let mut codec = TextCodec::new();
        let mut buf = BytesMut::from(
            &b"kb-status: meter=flow0 ticks=1\r\nnoise: x=1\nkb-status: meter=flow0 ticks=2\nkb-sta"[..],
        );

        let (messages, errors) = decode_all(&mut codec, &mut buf);
        assert!(errors.is_empty());
        assert_eq!(messages.len(), 2);
        assert_eq!(&buf[..], b"kb-sta");
    }

    #[test]
    fn test_text_overlong_line_discarded() {
        let mut codec = TextCodec::new();
        let mut buf = BytesMut::from(vec![b'x'; MAX_TEXT_LINE + 10].as_slice());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        buf.extend_from_slice(b"tail of junk\nping\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Ping));
    }

    #[test]
    fn test_wire_codec_dispatch() {
        let mut text = WireCodec::new(WireFormat::Text);
        let buf = text
            .encode_message(Message::SetOutput {
                output_id: 1,
                enabled: false,
            })
            .unwrap();
        assert_eq!(&buf[..], b"set-output: id=1 enabled=0\n");

        let mut binary = WireCodec::new(WireFormat::Binary);
        assert_eq!(binary.format(), WireFormat::Binary);
        let buf = binary.encode_message(Message::Ping).unwrap();
        assert!(buf.starts_with(b"KBSP v1:"));
    }
}
