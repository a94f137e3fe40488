//! Failures while finding, opening and talking to controller boards.

pub type Result<T> = std::result::Result<T, HardwareError>;

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    /// The transport is gone (unplugged, closed, or never opened).
    #[error("Device disconnected: {device}")]
    Disconnected { device: String },

    /// The OS refused access to the device node.
    #[error("Permission denied: {device}")]
    PermissionDenied { device: String },

    #[error("Timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Communication error: {message}")]
    CommunicationError { message: String },

    /// Output id outside the range the board exposes.
    #[error("Invalid output {output_id} (controller has {max} outputs)")]
    InvalidOutput { output_id: u8, max: u8 },

    /// Toggle name that does not follow `<controller>.relay<N>`.
    #[error("Invalid toggle name: {name}")]
    InvalidToggle { name: String },

    /// No active controller with this name.
    #[error("Unknown controller: {name}")]
    UnknownController { name: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] kegtap_core::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HardwareError {
    pub fn disconnected(device: impl Into<String>) -> Self {
        Self::Disconnected {
            device: device.into(),
        }
    }

    pub fn permission_denied(device: impl Into<String>) -> Self {
        Self::PermissionDenied {
            device: device.into(),
        }
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self::CommunicationError {
            message: message.into(),
        }
    }

    pub fn invalid_toggle(name: impl Into<String>) -> Self {
        Self::InvalidToggle { name: name.into() }
    }

    pub fn unknown_controller(name: impl Into<String>) -> Self {
        Self::UnknownController { name: name.into() }
    }

    /// The OS refused access; the device is retried on the next scan.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::PermissionDenied { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            Self::Serial(e) => {
                matches!(e.kind(), serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied))
            }
            _ => false,
        }
    }
}
