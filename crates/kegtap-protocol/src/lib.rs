//! Wire protocol spoken by Kegboard controllers.
//!
//! Serial/USB boards speak binary KBSP v1 ([`KegboardCodec`]); network
//! bridges speak newline-delimited text ([`TextCodec`]). Both decode to the
//! same [`Message`] enum.

pub mod codec;
pub mod crc;
pub mod field;
pub mod frame;
pub mod message;
pub mod stream_parser;
pub mod text;

pub use codec::{KegboardCodec, TextCodec, WireCodec, WireFormat, decode_all};
pub use field::{FieldSet, FieldWriter};
pub use frame::Frame;
pub use message::{Direction, Message};
pub use stream_parser::{DrainFrames, ParserState, StreamParser};
