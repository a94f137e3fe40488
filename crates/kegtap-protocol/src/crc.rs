//! CRC-16/CCITT as computed by Kegboard firmware.
//!
//! Reflected polynomial `0x8408`, initial value `0`, no final XOR (the
//! variant also known as CRC-16/KERMIT). The firmware appends the result
//! little-endian after the payload.

const POLY_REFLECTED: u16 = 0x8408;

/// Continue a running CRC over `data`.
#[must_use]
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// CRC of a complete buffer.
///
/// # Examples
///
/// ```
/// use kegtap_protocol::crc::crc16_ccitt;
///
/// assert_eq!(crc16_ccitt(b"123456789"), 0x2189);
/// ```
#[must_use]
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    crc16_update(0, data)
}
