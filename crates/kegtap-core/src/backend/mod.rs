//! Remote system of record.
//!
//! The [`Backend`] trait is the only seam between the engine and the remote
//! API. Marshaling, authentication and the HTTP client live behind it; the
//! engine only cares whether a call succeeded, failed transiently or was
//! permanently rejected (see [`BackendError::is_permanent`]).

pub mod mock;

use crate::types::{Tap, TickSample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;

/// Result type alias for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors returned by a [`Backend`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Network or server unavailable; worth retrying.
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The referenced object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was understood and refused.
    #[error("Request rejected: {0}")]
    BadRequest(String),

    /// The response could not be interpreted.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Retrying the same request can never succeed.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, BackendError::NotFound(_) | BackendError::BadRequest(_))
    }
}

/// Entry of the backend's system event list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: u64,
    pub kind: String,
    pub time: DateTime<Utc>,
    pub username: Option<String>,
    pub tap_id: Option<u64>,
    pub drink_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_volume_ml: f64,
    pub total_pours: u64,
    pub volume_by_drinker: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundEvent {
    pub id: u64,
    pub event_name: String,
    pub event_predicate: Option<String>,
    pub sound_url: String,
}

/// Controller known to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRecord {
    pub id: u64,
    pub name: String,
    pub serial_number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMeterRecord {
    pub id: u64,
    pub controller_name: String,
    pub port_name: String,
    pub ticks_per_ml: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowToggleRecord {
    pub id: u64,
    pub controller_name: String,
    pub port_name: String,
}

/// Authentication token resolved by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: u64,
    pub auth_device: String,
    pub token_value: String,
    pub username: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub display_name: String,
    pub image_url: Option<String>,
}

/// Completed pour, as posted to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDrinkRequest {
    /// Full meter name of the tap the pour came from.
    pub tap: String,
    pub volume_ml: f64,
    pub ticks: u64,
    pub shout: String,
    pub username: String,
    pub record_date: DateTime<Utc>,
    pub duration_ms: i64,
    pub tick_time_series: Vec<TickSample>,
    pub picture: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordTemperatureRequest {
    pub sensor_name: String,
    pub temperature_c: f64,
    pub record_date: DateTime<Utc>,
}

/// Remote API used by the sync and hardware layers.
///
/// Methods return `Send` futures so implementations can be driven from
/// spawned tasks.
pub trait Backend: Send + Sync + 'static {
    fn get_taps(&self) -> impl Future<Output = BackendResult<Vec<Tap>>> + Send;

    fn get_events(&self) -> impl Future<Output = BackendResult<Vec<SystemEvent>>> + Send;

    fn get_events_since(
        &self,
        since_id: u64,
    ) -> impl Future<Output = BackendResult<Vec<SystemEvent>>> + Send;

    fn get_current_session(&self) -> impl Future<Output = BackendResult<Option<Session>>> + Send;

    fn get_session_stats(
        &self,
        session_id: u64,
    ) -> impl Future<Output = BackendResult<SessionStats>> + Send;

    fn get_sound_events(&self) -> impl Future<Output = BackendResult<Vec<SoundEvent>>> + Send;

    fn get_controllers(&self)
    -> impl Future<Output = BackendResult<Vec<ControllerRecord>>> + Send;

    fn get_flow_meters(&self) -> impl Future<Output = BackendResult<Vec<FlowMeterRecord>>> + Send;

    fn get_flow_toggles(
        &self,
    ) -> impl Future<Output = BackendResult<Vec<FlowToggleRecord>>> + Send;

    fn record_drink(
        &self,
        request: &RecordDrinkRequest,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    fn record_temperature(
        &self,
        request: &RecordTemperatureRequest,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    fn get_auth_token(
        &self,
        auth_device: &str,
        token_value: &str,
    ) -> impl Future<Output = BackendResult<AuthToken>> + Send;

    fn get_user(&self, username: &str) -> impl Future<Output = BackendResult<User>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BackendError::unreachable("timeout"), false)]
    #[case(BackendError::Protocol("bad json".into()), false)]
    #[case(BackendError::not_found("tap"), true)]
    #[case(BackendError::bad_request("volume"), true)]
    fn test_is_permanent(#[case] error: BackendError, #[case] permanent: bool) {
        assert_eq!(error.is_permanent(), permanent);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            BackendError::not_found("kegboard.flow9").to_string(),
            "Not found: kegboard.flow9"
        );
    }
}
