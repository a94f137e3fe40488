//! Error types for pour tracking.

/// Result type alias for flow operations.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors raised by the flow state machine.
///
/// All of these indicate a caller bug rather than a runtime condition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// A finished flow was mutated.
    #[error("Flow {flow_id} is already finished")]
    FlowFinished { flow_id: u64 },

    /// A flow was started on a tap that already has one.
    #[error("Tap {tap_id} already has an active flow")]
    TapOccupied { tap_id: u64 },

    /// No tap with this id is known.
    #[error("Unknown tap: {tap_id}")]
    UnknownTap { tap_id: u64 },
}

impl FlowError {
    pub fn finished(flow_id: u64) -> Self {
        Self::FlowFinished { flow_id }
    }

    pub fn unknown_tap(tap_id: u64) -> Self {
        Self::UnknownTap { tap_id }
    }
}
