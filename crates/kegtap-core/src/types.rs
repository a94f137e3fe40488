use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle status of an attached controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControllerStatus {
    /// Attached but not yet verified.
    #[default]
    Unknown,
    /// Verified and delivering events.
    Ok,
    /// Firmware older than the configured minimum.
    NeedUpdate,
    /// Firmware reported an empty serial number; one is being assigned.
    NeedSerialNumber,
    /// No Hello received after all verification pings.
    Unresponsive,
    /// The transport failed while reading.
    OpenError,
    /// Another active controller already owns the derived name.
    NameConflict,
}

impl ControllerStatus {
    /// Whether messages from a controller in this status reach the rest of the system.
    #[must_use]
    pub fn forwards_events(self) -> bool {
        matches!(self, ControllerStatus::Ok)
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ControllerStatus::Unknown => "unknown",
            ControllerStatus::Ok => "ok",
            ControllerStatus::NeedUpdate => "need-update",
            ControllerStatus::NeedSerialNumber => "need-serial-number",
            ControllerStatus::Unresponsive => "unresponsive",
            ControllerStatus::OpenError => "open-error",
            ControllerStatus::NameConflict => "name-conflict",
        };
        write!(f, "{s}")
    }
}

/// Transport a controller is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Serial,
    Network,
    Fake,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Network => write!(f, "network"),
            TransportKind::Fake => write!(f, "fake"),
        }
    }
}

/// Public view of a controller, carried by attach/remove events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub name: String,
    pub serial_number: String,
    pub status: ControllerStatus,
    pub firmware_version: Option<u16>,
    pub transport: TransportKind,
    /// Transport-specific id (port path, `host:port`, fake device id).
    pub device_id: String,
}

/// A physical dispensing point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tap {
    pub id: u64,
    pub name: String,
    /// Full meter name, e.g. `kegboard-1a2b3c4d.flow0`.
    pub meter_name: String,
    /// Full toggle name, e.g. `kegboard-1a2b3c4d.relay0`.
    pub toggle_name: Option<String>,
    pub ml_per_tick: f64,
    pub visible: bool,
}

impl Tap {
    pub fn new(id: u64, name: impl Into<String>, meter_name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            meter_name: meter_name.into(),
            toggle_name: None,
            ml_per_tick: 1.0 / 5.4,
            visible: true,
        }
    }

    pub fn with_toggle(mut self, toggle_name: impl Into<String>) -> Self {
        self.toggle_name = Some(toggle_name.into());
        self
    }

    pub fn with_ml_per_tick(mut self, ml_per_tick: f64) -> Self {
        self.ml_per_tick = ml_per_tick;
        self
    }

    pub fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }
}

/// Splits a full port name (`<controller>.<port>`) into its two halves.
///
/// Returns `None` when there is no dot or either half is empty.
///
/// # Examples
///
/// ```
/// use kegtap_core::types::split_port_name;
///
/// assert_eq!(split_port_name("kegboard-ab12.relay0"), Some(("kegboard-ab12", "relay0")));
/// assert_eq!(split_port_name("relay0"), None);
/// ```
#[must_use]
pub fn split_port_name(full: &str) -> Option<(&str, &str)> {
    let (controller, port) = full.rsplit_once('.')?;
    if controller.is_empty() || port.is_empty() {
        return None;
    }
    Some((controller, port))
}

/// One sample of a pour's tick series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSample {
    /// Milliseconds since the flow started.
    pub offset_ms: i64,
    pub delta: u64,
}

/// Immutable copy of a flow at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub flow_id: u64,
    pub meter_name: String,
    pub tap: Option<Tap>,
    /// Empty for anonymous pours.
    pub username: String,
    pub ticks: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub max_idle_ms: u64,
    pub shout: String,
    pub images: Vec<PathBuf>,
    pub tick_series: Vec<TickSample>,
    pub finished: bool,
}

impl FlowSnapshot {
    #[must_use]
    pub fn volume_ml(&self) -> f64 {
        self.tap
            .as_ref()
            .map_or(0.0, |tap| self.ticks as f64 * tap.ml_per_tick)
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }

    /// Milliseconds between start and the end (or the last activity while running).
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        let end = self.ended_at.unwrap_or(self.last_activity_at);
        (end - self.started_at).num_milliseconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;

    fn snapshot(ticks: u64, tap: Option<Tap>) -> FlowSnapshot {
        let start = Utc::now();
        FlowSnapshot {
            flow_id: 1,
            meter_name: "kegboard.flow0".to_string(),
            tap,
            username: String::new(),
            ticks,
            started_at: start,
            last_activity_at: start + Duration::milliseconds(1500),
            ended_at: None,
            max_idle_ms: 10_000,
            shout: String::new(),
            images: Vec::new(),
            tick_series: Vec::new(),
            finished: false,
        }
    }

    #[test]
    fn test_volume_uses_tap_calibration() {
        let tap = Tap::new(1, "Tap 1", "kegboard.flow0").with_ml_per_tick(2.5);
        assert_eq!(snapshot(40, Some(tap)).volume_ml(), 100.0);
    }

    #[test]
    fn test_volume_without_tap_is_zero() {
        assert_eq!(snapshot(40, None).volume_ml(), 0.0);
    }

    #[test]
    fn test_duration_falls_back_to_last_activity() {
        let snap = snapshot(1, None);
        assert_eq!(snap.duration_ms(), 1500);
    }

    #[rstest]
    #[case("kegboard.flow0", Some(("kegboard", "flow0")))]
    #[case("kegboard-ab12.relay3", Some(("kegboard-ab12", "relay3")))]
    #[case("flow0", None)]
    #[case(".flow0", None)]
    #[case("kegboard.", None)]
    fn test_split_port_name(#[case] input: &str, #[case] expected: Option<(&str, &str)>) {
        assert_eq!(split_port_name(input), expected);
    }

    #[rstest]
    #[case(ControllerStatus::Ok, true)]
    #[case(ControllerStatus::Unknown, false)]
    #[case(ControllerStatus::NeedUpdate, false)]
    #[case(ControllerStatus::NameConflict, false)]
    #[case(ControllerStatus::Unresponsive, false)]
    fn test_forwards_events(#[case] status: ControllerStatus, #[case] expected: bool) {
        assert_eq!(status.forwards_events(), expected);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ControllerStatus::NeedSerialNumber.to_string(), "need-serial-number");
        assert_eq!(TransportKind::Network.to_string(), "network");
    }
}
