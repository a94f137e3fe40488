//! Newline-delimited text frames used by network-attached controllers.
//!
//! Each line is `tag: key=value key=value ...`. Commands without arguments
//! are a bare tag (`ping`). Lines with tags this host does not understand are
//! ignored rather than treated as errors, so firmware can emit diagnostics on
//! the same stream.
//!
//! ```text
//! info: firmware_version=18 serial_number=KB-0000-0000-1A2B3C4D
//! kb-status: meter=flow0 ticks=1520
//! kb-thermo: sensor=thermo-28a1 value=4.25
//! kb-auth: device=core.rfid token=04abcdef status=present
//! ```

use std::collections::HashMap;

use kegtap_core::{Error, Result};

use crate::message::Message;

/// Parse one line (without its terminator).
///
/// Returns `Ok(None)` for blank lines and unknown tags.
///
/// # Examples
///
/// ```
/// use kegtap_protocol::{Message, text::parse_line};
///
/// let msg = parse_line("kb-status: meter=flow0 ticks=42").unwrap();
/// assert_eq!(msg, Some(Message::MeterStatus { meter_name: "flow0".into(), ticks: 42 }));
///
/// assert_eq!(parse_line("debug: uptime=12").unwrap(), None);
/// ```
pub fn parse_line(line: &str) -> Result<Option<Message>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (tag, rest) = match line.split_once(':') {
        Some((tag, rest)) => (tag.trim(), rest),
        None => (line, ""),
    };
    let args = parse_args(rest)?;

    let message = match tag {
        "info" => Message::Hello {
            firmware_version: required(&args, "firmware_version")?
                .parse()
                .map_err(|_| invalid(tag, "firmware_version"))?,
            protocol_version: optional(&args, "protocol_version")
                .map(str::parse)
                .transpose()
                .map_err(|_| invalid(tag, "protocol_version"))?
                .unwrap_or(1),
            serial_number: optional(&args, "serial_number")
                .unwrap_or_default()
                .to_string(),
        },
        "kb-status" => Message::MeterStatus {
            meter_name: required(&args, "meter")?.to_string(),
            ticks: required(&args, "ticks")?
                .parse()
                .map_err(|_| invalid(tag, "ticks"))?,
        },
        "kb-thermo" => {
            let celsius: f64 = required(&args, "value")?
                .parse()
                .map_err(|_| invalid(tag, "value"))?;
            Message::TemperatureReading {
                sensor_name: required(&args, "sensor")?.to_string(),
                micro_celsius: (celsius * 1_000_000.0).round() as i32,
            }
        }
        "kb-output" => Message::OutputStatus {
            output_name: required(&args, "output")?.to_string(),
            enabled: parse_flag(required(&args, "enabled")?).ok_or_else(|| invalid(tag, "enabled"))?,
        },
        "kb-auth" => Message::AuthToken {
            device: required(&args, "device")?.to_string(),
            token: required(&args, "token")?.to_ascii_lowercase(),
            present: match optional(&args, "status").unwrap_or("present") {
                "present" => true,
                "removed" => false,
                _ => return Err(invalid(tag, "status")),
            },
        },
        "ping" => Message::Ping,
        "set-output" => Message::SetOutput {
            output_id: required(&args, "id")?
                .parse()
                .map_err(|_| invalid(tag, "id"))?,
            enabled: parse_flag(required(&args, "enabled")?).ok_or_else(|| invalid(tag, "enabled"))?,
        },
        "set-serial" => Message::SetSerialNumber {
            serial_number: required(&args, "serial_number")?.to_string(),
        },
        _ => return Ok(None),
    };

    Ok(Some(message))
}

/// Render a message as one line, without terminator.
pub fn format_message(message: &Message) -> String {
    match message {
        Message::Hello {
            firmware_version,
            protocol_version,
            serial_number,
        } => {
            let mut line =
                format!("info: firmware_version={firmware_version} protocol_version={protocol_version}");
            if !serial_number.is_empty() {
                line.push_str(&format!(" serial_number={serial_number}"));
            }
            line
        }
        Message::MeterStatus { meter_name, ticks } => {
            format!("kb-status: meter={meter_name} ticks={ticks}")
        }
        Message::TemperatureReading {
            sensor_name,
            micro_celsius,
        } => format!(
            "kb-thermo: sensor={sensor_name} value={}",
            f64::from(*micro_celsius) / 1_000_000.0
        ),
        Message::OutputStatus {
            output_name,
            enabled,
        } => format!("kb-output: output={output_name} enabled={}", u8::from(*enabled)),
        Message::AuthToken {
            device,
            token,
            present,
        } => format!(
            "kb-auth: device={device} token={token} status={}",
            if *present { "present" } else { "removed" }
        ),
        Message::Ping => "ping".to_string(),
        Message::SetOutput { output_id, enabled } => {
            format!("set-output: id={output_id} enabled={}", u8::from(*enabled))
        }
        Message::SetSerialNumber { serial_number } => {
            format!("set-serial: serial_number={serial_number}")
        }
    }
}

fn parse_args(rest: &str) -> Result<HashMap<&str, &str>> {
    rest.split_whitespace()
        .map(|pair| {
            pair.split_once('=').ok_or_else(|| {
                Error::InvalidMessageFormat(format!("expected key=value, got {pair:?}"))
            })
        })
        .collect()
}

fn required<'a>(args: &HashMap<&str, &'a str>, key: &str) -> Result<&'a str> {
    args.get(key)
        .copied()
        .ok_or_else(|| Error::MissingField(key.to_string()))
}

fn optional<'a>(args: &HashMap<&str, &'a str>, key: &str) -> Option<&'a str> {
    args.get(key).copied()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

fn invalid(tag: &str, key: &str) -> Error {
    Error::InvalidMessageFormat(format!("{tag}: invalid {key}"))
}
