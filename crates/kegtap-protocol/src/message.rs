use kegtap_core::constants::{
    MESSAGE_AUTH_TOKEN, MESSAGE_HELLO, MESSAGE_METER_STATUS, MESSAGE_OUTPUT_STATUS, MESSAGE_PING,
    MESSAGE_SET_OUTPUT, MESSAGE_SET_SERIAL_NUMBER, MESSAGE_TEMPERATURE_READING,
};
use kegtap_core::{Error, Result};

use crate::field::{FieldSet, FieldWriter};
use crate::frame::Frame;

/// Every message exchanged with a controller, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello {
        firmware_version: u16,
        protocol_version: u16,
        /// Empty on boards that were never assigned one.
        serial_number: String,
    },
    MeterStatus {
        meter_name: String,
        ticks: u32,
    },
    TemperatureReading {
        sensor_name: String,
        /// Reading in millionths of a degree Celsius.
        micro_celsius: i32,
    },
    OutputStatus {
        output_name: String,
        enabled: bool,
    },
    AuthToken {
        device: String,
        /// Lower-case hex of the raw token bytes.
        token: String,
        present: bool,
    },
    Ping,
    SetOutput {
        output_id: u8,
        enabled: bool,
    },
    SetSerialNumber {
        serial_number: String,
    },
}

/// Wire direction of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FromDevice,
    ToDevice,
}

impl Message {
    pub fn message_id(&self) -> u16 {
        match self {
            Message::Hello { .. } => MESSAGE_HELLO,
            Message::MeterStatus { .. } => MESSAGE_METER_STATUS,
            Message::TemperatureReading { .. } => MESSAGE_TEMPERATURE_READING,
            Message::OutputStatus { .. } => MESSAGE_OUTPUT_STATUS,
            Message::AuthToken { .. } => MESSAGE_AUTH_TOKEN,
            Message::Ping => MESSAGE_PING,
            Message::SetOutput { .. } => MESSAGE_SET_OUTPUT,
            Message::SetSerialNumber { .. } => MESSAGE_SET_SERIAL_NUMBER,
        }
    }

    pub fn direction(&self) -> Direction {
        if self.message_id() & 0x80 != 0 {
            Direction::ToDevice
        } else {
            Direction::FromDevice
        }
    }

    /// Temperature helper for [`Message::TemperatureReading`].
    pub fn celsius(&self) -> Option<f64> {
        match self {
            Message::TemperatureReading { micro_celsius, .. } => {
                Some(f64::from(*micro_celsius) / 1_000_000.0)
            }
            _ => None,
        }
    }

    /// Build the binary frame for this message.
    ///
    /// # Errors
    ///
    /// Fails when a string or token does not fit the payload limit.
    pub fn to_frame(&self) -> Result<Frame> {
        let payload = match self {
            Message::Hello {
                firmware_version,
                protocol_version,
                serial_number,
            } => FieldWriter::new()
                .u16(0x01, *firmware_version)
                .u16(0x02, *protocol_version)
                .string(0x03, serial_number),
            Message::MeterStatus { meter_name, ticks } => FieldWriter::new()
                .string(0x01, meter_name)
                .u32(0x02, *ticks),
            Message::TemperatureReading {
                sensor_name,
                micro_celsius,
            } => FieldWriter::new()
                .string(0x01, sensor_name)
                .i32(0x02, *micro_celsius),
            Message::OutputStatus {
                output_name,
                enabled,
            } => FieldWriter::new()
                .string(0x01, output_name)
                .u8(0x02, u8::from(*enabled)),
            Message::AuthToken {
                device,
                token,
                present,
            } => FieldWriter::new()
                .string(0x01, device)
                .bytes(0x02, &decode_hex(token)?)
                .u8(0x03, u8::from(*present)),
            Message::Ping => FieldWriter::new(),
            Message::SetOutput { output_id, enabled } => FieldWriter::new()
                .u8(0x01, *output_id)
                .u8(0x02, u8::from(*enabled)),
            Message::SetSerialNumber { serial_number } => {
                FieldWriter::new().string(0x01, serial_number)
            }
        };
        Frame::new(self.message_id(), payload.finish()?)
    }
}

impl TryFrom<&Frame> for Message {
    type Error = Error;

    fn try_from(frame: &Frame) -> Result<Self> {
        let fields = FieldSet::parse(frame.payload())?;
        let message = match frame.message_id() {
            MESSAGE_HELLO => Message::Hello {
                firmware_version: fields
                    .u16(0x01)?
                    .ok_or_else(|| Error::MissingField("firmware_version".into()))?,
                protocol_version: fields.u16(0x02)?.unwrap_or(0),
                serial_number: fields.string(0x03)?.unwrap_or_default(),
            },
            MESSAGE_METER_STATUS => Message::MeterStatus {
                meter_name: fields.require_string(0x01, "meter_name")?,
                ticks: fields
                    .u32(0x02)?
                    .ok_or_else(|| Error::MissingField("meter_reading".into()))?,
            },
            MESSAGE_TEMPERATURE_READING => Message::TemperatureReading {
                sensor_name: fields.require_string(0x01, "sensor_name")?,
                micro_celsius: fields
                    .i32(0x02)?
                    .ok_or_else(|| Error::MissingField("sensor_reading".into()))?,
            },
            MESSAGE_OUTPUT_STATUS => Message::OutputStatus {
                output_name: fields.require_string(0x01, "output_name")?,
                enabled: fields.u8(0x02)?.unwrap_or(0) != 0,
            },
            MESSAGE_AUTH_TOKEN => Message::AuthToken {
                device: fields.require_string(0x01, "device")?,
                token: encode_hex(
                    fields
                        .get(0x02)
                        .ok_or_else(|| Error::MissingField("token".into()))?,
                ),
                present: fields.u8(0x03)?.unwrap_or(0) != 0,
            },
            MESSAGE_PING => Message::Ping,
            MESSAGE_SET_OUTPUT => Message::SetOutput {
                output_id: fields
                    .u8(0x01)?
                    .ok_or_else(|| Error::MissingField("output_id".into()))?,
                enabled: fields.u8(0x02)?.unwrap_or(0) != 0,
            },
            MESSAGE_SET_SERIAL_NUMBER => Message::SetSerialNumber {
                serial_number: fields.require_string(0x01, "serial_number")?,
            },
            other => return Err(Error::UnknownMessage(other)),
        };
        Ok(message)
    }
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(Error::InvalidMessageFormat(format!("bad hex token: {hex}")));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| Error::InvalidMessageFormat(format!("bad hex token: {hex}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn through_frame(message: Message) -> Message {
        let frame = message.to_frame().unwrap();
        Message::try_from(&frame).unwrap()
    }

    #[test]
    fn test_hello_without_serial_decodes_empty() {
        let payload = FieldWriter::new().u16(0x01, 18).finish().unwrap();
        let frame = Frame::new(MESSAGE_HELLO, payload).unwrap();

        assert_eq!(
            Message::try_from(&frame).unwrap(),
            Message::Hello {
                firmware_version: 18,
                protocol_version: 0,
                serial_number: String::new(),
            }
        );
    }

    #[test]
    fn test_meter_status_requires_reading() {
        let payload = FieldWriter::new().string(0x01, "flow0").finish().unwrap();
        let frame = Frame::new(MESSAGE_METER_STATUS, payload).unwrap();
        assert!(matches!(
            Message::try_from(&frame),
            Err(Error::MissingField(field)) if field == "meter_reading"
        ));
    }

    #[test]
    fn test_unknown_id_rejected() {
        let frame = Frame::new(0x42, Vec::new()).unwrap();
        assert!(matches!(
            Message::try_from(&frame),
            Err(Error::UnknownMessage(0x42))
        ));
    }

    #[test]
    fn test_auth_token_hex() {
        let msg = through_frame(Message::AuthToken {
            device: "core.rfid".into(),
            token: "04abcdef".into(),
            present: true,
        });
        assert!(matches!(msg, Message::AuthToken { ref token, present: true, .. } if token == "04abcdef"));
    }

    #[test]
    fn test_bad_hex_token_rejected() {
        let msg = Message::AuthToken {
            device: "core.rfid".into(),
            token: "xyz".into(),
            present: true,
        };
        assert!(msg.to_frame().is_err());
    }

    #[test]
    fn test_negative_temperature() {
        let msg = through_frame(Message::TemperatureReading {
            sensor_name: "thermo-28a1".into(),
            micro_celsius: -2_500_000,
        });
        assert_eq!(msg.celsius(), Some(-2.5));
    }

    #[test]
    fn test_direction() {
        assert_eq!(Message::Ping.direction(), Direction::ToDevice);
        assert_eq!(
            Message::MeterStatus {
                meter_name: "flow0".into(),
                ticks: 1
            }
            .direction(),
            Direction::FromDevice
        );
    }
}
