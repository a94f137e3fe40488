//! TLV payload fields.
//!
//! A KBSP payload is a flat sequence of `tag:u8 len:u8 value[len]` entries.
//! Integers are little-endian. Unknown tags are preserved by [`FieldSet`] so
//! newer firmware can add fields without breaking older hosts.

use kegtap_core::constants::MAX_PAYLOAD_SIZE;
use kegtap_core::{Error, Result};

/// Parsed payload fields in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    fields: Vec<(u8, Vec<u8>)>,
}

impl FieldSet {
    /// Parse a payload into fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidField` when an entry's declared length runs past
    /// the end of the payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut fields = Vec::new();
        let mut rest = payload;

        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(Error::InvalidField {
                    tag: rest[0],
                    reason: "truncated field header".to_string(),
                });
            }
            let tag = rest[0];
            let len = usize::from(rest[1]);
            if rest.len() < 2 + len {
                return Err(Error::InvalidField {
                    tag,
                    reason: format!("declared {len} bytes, {} available", rest.len() - 2),
                });
            }
            fields.push((tag, rest[2..2 + len].to_vec()));
            rest = &rest[2 + len..];
        }

        Ok(Self { fields })
    }

    /// Raw value of the first field with `tag`.
    pub fn get(&self, tag: u8) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, value)| value.as_slice())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn fixed<const N: usize>(&self, tag: u8) -> Result<Option<[u8; N]>> {
        match self.get(tag) {
            None => Ok(None),
            Some(value) => value.try_into().map(Some).map_err(|_| Error::InvalidField {
                tag,
                reason: format!("expected {N} bytes, got {}", value.len()),
            }),
        }
    }

    pub fn u8(&self, tag: u8) -> Result<Option<u8>> {
        Ok(self.fixed::<1>(tag)?.map(|b| b[0]))
    }

    pub fn u16(&self, tag: u8) -> Result<Option<u16>> {
        Ok(self.fixed::<2>(tag)?.map(u16::from_le_bytes))
    }

    pub fn u32(&self, tag: u8) -> Result<Option<u32>> {
        Ok(self.fixed::<4>(tag)?.map(u32::from_le_bytes))
    }

    pub fn i32(&self, tag: u8) -> Result<Option<i32>> {
        Ok(self.fixed::<4>(tag)?.map(i32::from_le_bytes))
    }

    /// String field. Firmware pads some names with NULs; they are stripped.
    pub fn string(&self, tag: u8) -> Result<Option<String>> {
        match self.get(tag) {
            None => Ok(None),
            Some(value) => {
                let trimmed = match value.iter().position(|&b| b == 0) {
                    Some(nul) => &value[..nul],
                    None => value,
                };
                std::str::from_utf8(trimmed)
                    .map(|s| Some(s.to_string()))
                    .map_err(|_| Error::InvalidField {
                        tag,
                        reason: "not valid UTF-8".to_string(),
                    })
            }
        }
    }

    /// Like [`FieldSet::string`] but missing is an error.
    pub fn require_string(&self, tag: u8, name: &str) -> Result<String> {
        self.string(tag)?
            .ok_or_else(|| Error::MissingField(name.to_string()))
    }
}

/// Builder for outgoing payloads.
///
/// # Examples
///
/// ```
/// use kegtap_protocol::field::{FieldSet, FieldWriter};
///
/// let payload = FieldWriter::new().u8(0x01, 3).u8(0x02, 1).finish().unwrap();
/// assert_eq!(payload, vec![0x01, 0x01, 0x03, 0x02, 0x01, 0x01]);
///
/// let fields = FieldSet::parse(&payload).unwrap();
/// assert_eq!(fields.u8(0x01).unwrap(), Some(3));
/// ```
#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: Vec<u8>,
    error: Option<Error>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(mut self, tag: u8, value: &[u8]) -> Self {
        if self.error.is_some() {
            return self;
        }
        match u8::try_from(value.len()) {
            Ok(len) => {
                self.buf.push(tag);
                self.buf.push(len);
                self.buf.extend_from_slice(value);
            }
            Err(_) => {
                self.error = Some(Error::InvalidField {
                    tag,
                    reason: format!("value of {} bytes does not fit a field", value.len()),
                });
            }
        }
        self
    }

    pub fn u8(self, tag: u8, value: u8) -> Self {
        self.bytes(tag, &[value])
    }

    pub fn u16(self, tag: u8, value: u16) -> Self {
        self.bytes(tag, &value.to_le_bytes())
    }

    pub fn u32(self, tag: u8, value: u32) -> Self {
        self.bytes(tag, &value.to_le_bytes())
    }

    pub fn i32(self, tag: u8, value: i32) -> Self {
        self.bytes(tag, &value.to_le_bytes())
    }

    pub fn string(self, tag: u8, value: &str) -> Self {
        self.bytes(tag, value.as_bytes())
    }

    /// Finish the payload.
    ///
    /// # Errors
    ///
    /// Returns the first field error, or `Error::PayloadTooLarge` when the
    /// payload exceeds the firmware limit.
    pub fn finish(self) -> Result<Vec<u8>> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.buf.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: self.buf.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(self.buf)
    }
}
