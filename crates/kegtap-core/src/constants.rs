//! Core constants for the Kegboard serial protocol and the runtime defaults.
//!
//! This module collects every protocol-level constant used by the kegtap
//! workspace together with the timing defaults of the controller, flow and
//! sync loops. Keeping them in one place ensures the codec, the fake devices
//! used in tests and the managers agree on framing and cadence.
//!
//! # Protocol Structure
//!
//! A binary Kegboard Serial Protocol (KBSP) v1 frame looks like:
//!
//! ```text
//! KBSP v1:<ID:u16 LE><LEN:u16 LE><PAYLOAD:LEN bytes><CRC:u16 LE>\r\n
//! ```
//!
//! Where:
//! - `KBSP v1:` - Fixed 8 byte header prefix
//! - `ID` - Message identifier (see the `MESSAGE_*` constants)
//! - `LEN` - Payload length, at most [`MAX_PAYLOAD_SIZE`]
//! - `PAYLOAD` - Sequence of TLV fields (`tag:u8 len:u8 value`)
//! - `CRC` - CRC-16/CCITT over header, id, length and payload
//! - `\r\n` - Fixed trailer
//!
//! # Usage
//!
//! ```
//! use kegtap_core::constants::*;
//!
//! assert_eq!(FRAME_HEADER, b"KBSP v1:");
//! assert_eq!(FRAME_OVERHEAD, 16);
//!
//! use std::time::Duration;
//! let rescan = Duration::from_millis(DEFAULT_RESCAN_INTERVAL_MS);
//! assert_eq!(rescan.as_secs(), 5);
//! ```

// ============================================================================
// Message Framing
// ============================================================================

/// Frame header prefix.
///
/// Every binary frame starts with these 8 ASCII bytes. The stream parser
/// uses this prefix to resynchronize after garbage or a corrupt frame.
pub const FRAME_HEADER: &[u8; 8] = b"KBSP v1:";

/// Frame trailer, always `\r\n`.
pub const FRAME_TRAILER: &[u8; 2] = b"\r\n";

/// Bytes taken by the message id and payload length fields.
pub const FRAME_PREAMBLE_FIELDS: usize = 4;

/// Bytes taken by the trailing CRC.
pub const FRAME_CRC_SIZE: usize = 2;

/// Frame overhead in bytes.
///
/// Header + id + length + CRC + trailer. Adding the payload length gives the
/// full on-wire size of a frame.
///
/// # Examples
///
/// ```
/// use kegtap_core::constants::{FRAME_OVERHEAD, MAX_PAYLOAD_SIZE};
///
/// const MAX_FRAME: usize = FRAME_OVERHEAD + MAX_PAYLOAD_SIZE;
/// assert_eq!(MAX_FRAME, 128);
/// ```
pub const FRAME_OVERHEAD: usize = 8 + FRAME_PREAMBLE_FIELDS + FRAME_CRC_SIZE + 2;

/// Largest payload accepted by firmware.
///
/// Frames announcing a longer payload are rejected by the parser before any
/// payload bytes are buffered.
pub const MAX_PAYLOAD_SIZE: usize = 112;

/// Largest complete binary frame.
pub const MAX_FRAME_SIZE: usize = FRAME_OVERHEAD + MAX_PAYLOAD_SIZE;

/// Largest newline-delimited text frame accepted on network transports.
pub const MAX_TEXT_LINE: usize = 512;

// ============================================================================
// Message Identifiers
// ============================================================================

/// Firmware greeting: version, protocol version and serial number.
pub const MESSAGE_HELLO: u16 = 0x01;

/// Cumulative tick count of one flow meter.
pub const MESSAGE_METER_STATUS: u16 = 0x10;

/// Temperature sensor reading in micro-degrees Celsius.
pub const MESSAGE_TEMPERATURE_READING: u16 = 0x11;

/// Current state of one relay output.
pub const MESSAGE_OUTPUT_STATUS: u16 = 0x12;

/// Token reader event (present or removed).
pub const MESSAGE_AUTH_TOKEN: u16 = 0x14;

/// Host ping; firmware answers with [`MESSAGE_HELLO`].
pub const MESSAGE_PING: u16 = 0x81;

/// Host command to drive one relay output.
pub const MESSAGE_SET_OUTPUT: u16 = 0x84;

/// Host command to write a serial number to a blank board.
pub const MESSAGE_SET_SERIAL_NUMBER: u16 = 0x85;

// ============================================================================
// Controller Defaults
// ============================================================================

/// Oldest firmware version accepted during verification.
pub const DEFAULT_MIN_FIRMWARE_VERSION: u16 = 18;

/// Number of outputs a Kegboard exposes (`relay0` through `relay4`).
pub const MAX_OUTPUTS: u8 = 5;

/// Ping attempts before a controller is declared unresponsive.
pub const VERIFY_PING_ATTEMPTS: u32 = 4;

/// Wait after each ping for a Hello (milliseconds).
pub const DEFAULT_PING_WAIT_MS: u64 = 500;

/// Bounded read timeout of the per-controller reader (milliseconds).
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 250;

/// Serial port timeout used by the blocking serial reader (milliseconds).
pub const SERIAL_PORT_TIMEOUT_MS: u64 = 100;

/// Output lease duration (milliseconds).
///
/// An enabled output is re-asserted until its lease expires. Callers that want
/// an output to stay on must renew the lease before this elapses.
pub const DEFAULT_OUTPUT_LEASE_MS: u64 = 5_000;

/// Minimum spacing between two output refreshes of one controller (milliseconds).
pub const OUTPUT_REFRESH_INTERVAL_MS: u64 = 1_000;

/// Device rescan cadence (milliseconds).
pub const DEFAULT_RESCAN_INTERVAL_MS: u64 = 5_000;

/// Idle sleep of the service loop when nothing happened (milliseconds).
pub const DEFAULT_IDLE_SLEEP_MS: u64 = 100;

/// Default serial baud rate of Kegboard firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Connect timeout for network controllers (milliseconds).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Name used when no name can be derived from the serial number.
pub const DEFAULT_CONTROLLER_NAME: &str = "kegboard";

/// Prefix of generated serial numbers; followed by 8 upper-case hex digits.
pub const SERIAL_NUMBER_PREFIX: &str = "KB-0000-0000-";

// ============================================================================
// Flow Defaults
// ============================================================================

/// Cadence of the idle sweep (milliseconds).
pub const IDLE_SWEEP_INTERVAL_MS: u64 = 1_000;

/// Default idle time after which a flow is ended (milliseconds).
///
/// A value of zero disables idle detection for a flow.
pub const DEFAULT_MAX_IDLE_MS: u64 = 10_000;

// ============================================================================
// Sync Defaults
// ============================================================================

/// Tick of the sync loop (milliseconds).
pub const SYNC_TICK_MS: u64 = 1_000;

/// Next-cycle delay after a successful sync (milliseconds).
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 60_000;

/// Next-cycle delay after a failed sync (milliseconds).
pub const DEFAULT_SYNC_RETRY_MS: u64 = 10_000;

/// Pours below this volume are discarded rather than recorded.
pub const DEFAULT_MIN_POUR_VOLUME_ML: f64 = 10.0;

/// Minimum spacing of temperature records for one sensor (milliseconds).
pub const DEFAULT_THERMO_RECORD_INTERVAL_MS: u64 = 60_000;

/// Stable alert id raised while the backend cannot be reached.
pub const ALERT_BACKEND_UNREACHABLE: &str = "backend-unreachable";

/// Capacity of the broadcast event bus.
pub const EVENT_BUS_CAPACITY: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_overhead_matches_layout() {
        assert_eq!(
            FRAME_OVERHEAD,
            FRAME_HEADER.len() + FRAME_PREAMBLE_FIELDS + FRAME_CRC_SIZE + FRAME_TRAILER.len()
        );
    }

    #[test]
    fn test_outbound_ids_have_high_bit() {
        for id in [MESSAGE_PING, MESSAGE_SET_OUTPUT, MESSAGE_SET_SERIAL_NUMBER] {
            assert!(id & 0x80 != 0);
        }
        for id in [
            MESSAGE_HELLO,
            MESSAGE_METER_STATUS,
            MESSAGE_TEMPERATURE_READING,
            MESSAGE_OUTPUT_STATUS,
            MESSAGE_AUTH_TOKEN,
        ] {
            assert!(id & 0x80 == 0);
        }
    }

    #[test]
    fn test_retry_faster_than_relaxed_interval() {
        assert!(DEFAULT_SYNC_RETRY_MS < DEFAULT_SYNC_INTERVAL_MS);
        assert!(SYNC_TICK_MS <= DEFAULT_SYNC_RETRY_MS);
    }
}
