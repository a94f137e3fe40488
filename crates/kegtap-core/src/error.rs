use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Wire protocol
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("Unknown message id: {0:#06x}")]
    UnknownMessage(u16),

    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field {tag:#04x}: {reason}")]
    InvalidField { tag: u8, reason: String },

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Transport failure surfacing through a codec.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
