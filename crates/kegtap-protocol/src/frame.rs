//! Binary frame representation.

use bytes::{BufMut, Bytes, BytesMut};
use kegtap_core::constants::{FRAME_HEADER, FRAME_OVERHEAD, FRAME_TRAILER, MAX_PAYLOAD_SIZE};
use kegtap_core::{Error, Result};

use crate::crc::{crc16_ccitt, crc16_update};

/// One KBSP frame: message id plus raw TLV payload.
///
/// # Examples
///
/// ```
/// use kegtap_protocol::Frame;
///
/// let frame = Frame::new(0x81, Vec::new()).unwrap();
/// let wire = frame.to_bytes();
/// assert!(wire.starts_with(b"KBSP v1:"));
/// assert!(wire.ends_with(b"\r\n"));
/// assert_eq!(wire.len(), frame.size());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    message_id: u16,
    payload: Bytes,
}

impl Frame {
    /// Create a frame.
    ///
    /// # Errors
    ///
    /// Returns `Error::PayloadTooLarge` if the payload exceeds the firmware limit.
    pub fn new(message_id: u16, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            message_id,
            payload,
        })
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// On-wire size including header, CRC and trailer.
    pub fn size(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// CRC over header, id, length and payload.
    pub fn crc(&self) -> u16 {
        let mut crc = crc16_update(0, FRAME_HEADER);
        crc = crc16_update(crc, &self.message_id.to_le_bytes());
        crc = crc16_update(crc, &(self.payload.len() as u16).to_le_bytes());
        crc16_update(crc, &self.payload)
    }

    /// Append the wire encoding to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.size());
        dst.put_slice(FRAME_HEADER);
        dst.put_u16_le(self.message_id);
        dst.put_u16_le(self.payload.len() as u16);
        dst.put_slice(&self.payload);
        dst.put_u16_le(self.crc());
        dst.put_slice(FRAME_TRAILER);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Verify the CRC of a complete frame held in `wire`.
///
/// `wire` must span header through trailer.
pub(crate) fn verify_crc(wire: &[u8]) -> Result<()> {
    let body_end = wire.len() - FRAME_TRAILER.len() - 2;
    let expected = crc16_ccitt(&wire[..body_end]);
    let actual = u16::from_le_bytes([wire[body_end], wire[body_end + 1]]);
    if expected == actual {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_wire_layout() {
        let wire = Frame::new(0x81, Vec::new()).unwrap().to_bytes();
        assert_eq!(&wire[..8], b"KBSP v1:");
        assert_eq!(&wire[8..10], &[0x81, 0x00]);
        assert_eq!(&wire[10..12], &[0x00, 0x00]);
        assert_eq!(&wire[14..], b"\r\n");
        assert!(verify_crc(&wire).is_ok());
    }

    #[test]
    fn test_crc_matches_one_shot() {
        let frame = Frame::new(0x10, vec![0x01, 0x01, b'a']).unwrap();
        let wire = frame.to_bytes();
        let body_end = wire.len() - 4;
        assert_eq!(frame.crc(), crc16_ccitt(&wire[..body_end]));
    }

    #[test]
    fn test_corrupted_payload_fails_crc() {
        let frame = Frame::new(0x10, vec![0x01, 0x01, b'a']).unwrap();
        let mut wire = frame.to_bytes().to_vec();
        wire[13] ^= 0xff;
        assert!(matches!(
            verify_crc(&wire),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_payload_limit() {
        assert!(Frame::new(0x10, vec![0u8; MAX_PAYLOAD_SIZE]).is_ok());
        assert!(matches!(
            Frame::new(0x10, vec![0u8; MAX_PAYLOAD_SIZE + 1]),
            Err(Error::PayloadTooLarge { .. })
        ));
    }
}
