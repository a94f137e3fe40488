//! Property-based tests for KBSP framing and the text line format.
//!
//! These tests use proptest to check that framing survives arbitrary chunking
//! and noise, and that every message the host or firmware can emit decodes
//! back to itself.

use bytes::BytesMut;
use proptest::prelude::*;
use tokio_util::codec::Encoder;

use kegtap_protocol::text::{format_message, parse_line};
use kegtap_protocol::{KegboardCodec, Message, StreamParser, decode_all};

/// Port names as firmware reports them.
fn port_name() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("port name regex")
}

fn serial_number() -> impl Strategy<Value = String> {
    prop::string::string_regex("(KB-[0-9A-F]{4}-[0-9A-F]{4}-[0-9A-F]{8})?").expect("serial regex")
}

fn any_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        (any::<u16>(), any::<u16>(), serial_number()).prop_map(|(fw, proto, serial)| {
            Message::Hello {
                firmware_version: fw,
                protocol_version: proto,
                serial_number: serial,
            }
        }),
        (port_name(), any::<u32>()).prop_map(|(meter_name, ticks)| Message::MeterStatus {
            meter_name,
            ticks
        }),
        (port_name(), -60_000_000i32..150_000_000).prop_map(|(sensor_name, micro_celsius)| {
            Message::TemperatureReading {
                sensor_name,
                micro_celsius,
            }
        }),
        (port_name(), prop::collection::vec(any::<u8>(), 1..16), any::<bool>()).prop_map(
            |(device, token, present)| Message::AuthToken {
                device,
                token: token.iter().map(|b| format!("{b:02x}")).collect(),
                present,
            }
        ),
        Just(Message::Ping),
        (0u8..5, any::<bool>())
            .prop_map(|(output_id, enabled)| Message::SetOutput { output_id, enabled }),
    ]
}

fn encode_all(messages: &[Message]) -> Vec<u8> {
    let mut codec = KegboardCodec::new();
    let mut wire = BytesMut::new();
    for message in messages {
        codec.encode(message.clone(), &mut wire).unwrap();
    }
    wire.to_vec()
}

proptest! {
    /// Property: splitting a stream at arbitrary points never changes what is decoded.
    #[test]
    fn prop_chunking_is_transparent(
        messages in prop::collection::vec(any_message(), 1..8),
        chunk in 1usize..40,
    ) {
        let wire = encode_all(&messages);
        let mut codec = KegboardCodec::new();
        let mut decoded = Vec::new();

        for piece in wire.chunks(chunk) {
            let mut buf = BytesMut::from(piece);
            let (batch, errors) = decode_all(&mut codec, &mut buf);
            prop_assert!(errors.is_empty());
            decoded.extend(batch);
        }

        prop_assert_eq!(decoded, messages);
    }

    /// Property: noise without a frame header in front of a frame is skipped.
    #[test]
    fn prop_leading_noise_is_skipped(
        noise in prop::collection::vec(any::<u8>().prop_filter("no K", |b| *b != b'K'), 0..64),
        message in any_message(),
    ) {
        let mut wire = noise;
        wire.extend(encode_all(std::slice::from_ref(&message)));

        let mut codec = KegboardCodec::new();
        let mut buf = BytesMut::from(wire.as_slice());
        let (decoded, _) = decode_all(&mut codec, &mut buf);
        prop_assert_eq!(decoded, vec![message]);
    }

    /// Property: a single flipped payload bit is caught and the next frame still decodes.
    #[test]
    fn prop_bit_flip_is_detected(
        ticks in any::<u32>(),
        bit in 0usize..8,
    ) {
        let first = Message::MeterStatus { meter_name: "flow0".into(), ticks };
        let second = Message::Ping;
        let mut wire = encode_all(&[first, second.clone()]);
        // Flip a bit inside the first frame's tick value.
        wire[12 + 9] ^= 1 << bit;

        let mut parser = StreamParser::new();
        parser.feed(&wire);
        prop_assert_eq!(parser.rejected_frames(), 1);
        let frames: Vec<_> = parser.drain_frames().collect();
        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(Message::try_from(&frames[0]).unwrap(), second);
    }

    /// Property: every text-representable message parses back from its line.
    #[test]
    fn prop_text_lines_parse_back(message in any_message()) {
        let line = format_message(&message);
        let parsed = parse_line(&line).unwrap();
        prop_assert_eq!(parsed, Some(message));
    }
}
