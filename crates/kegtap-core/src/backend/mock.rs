//! In-memory backend for tests and offline runs.
//!
//! [`MockBackend`] stores everything the engine can pull and records every
//! pour and temperature it is asked to post. Reachability can be switched off
//! to simulate a network outage.

use super::{
    AuthToken, Backend, BackendError, BackendResult, ControllerRecord, FlowMeterRecord,
    FlowToggleRecord, RecordDrinkRequest, RecordTemperatureRequest, Session, SessionStats,
    SoundEvent, SystemEvent, User,
};
use crate::types::Tap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MockState {
    reachable: bool,
    taps: Vec<Tap>,
    events: Vec<SystemEvent>,
    session: Option<Session>,
    stats: SessionStats,
    sound_events: Vec<SoundEvent>,
    controllers: Vec<ControllerRecord>,
    flow_meters: Vec<FlowMeterRecord>,
    flow_toggles: Vec<FlowToggleRecord>,
    tokens: HashMap<(String, String), AuthToken>,
    users: HashMap<String, User>,
    drinks: Vec<RecordDrinkRequest>,
    temperatures: Vec<RecordTemperatureRequest>,
    record_drink_calls: usize,
}

/// Shared, cloneable in-memory backend.
///
/// # Examples
///
/// ```
/// use kegtap_core::backend::Backend;
/// use kegtap_core::backend::mock::MockBackend;
/// use kegtap_core::types::Tap;
///
/// #[tokio::main]
/// async fn main() {
///     let backend = MockBackend::new();
///     backend.set_taps(vec![Tap::new(1, "Main", "kegboard.flow0")]);
///
///     assert_eq!(backend.get_taps().await.unwrap().len(), 1);
///
///     backend.set_reachable(false);
///     assert!(backend.get_taps().await.is_err());
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        let state = MockState {
            reachable: true,
            ..MockState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not wedge the other assertions.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reachable(state: &MockState) -> BackendResult<()> {
        if state.reachable {
            Ok(())
        } else {
            Err(BackendError::unreachable("mock backend offline"))
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_taps(&self, taps: Vec<Tap>) {
        self.lock().taps = taps;
    }

    pub fn push_event(&self, event: SystemEvent) {
        self.lock().events.push(event);
    }

    pub fn set_session(&self, session: Option<Session>, stats: SessionStats) {
        let mut state = self.lock();
        state.session = session;
        state.stats = stats;
    }

    pub fn set_sound_events(&self, sound_events: Vec<SoundEvent>) {
        self.lock().sound_events = sound_events;
    }

    pub fn set_controllers(&self, controllers: Vec<ControllerRecord>) {
        self.lock().controllers = controllers;
    }

    pub fn set_flow_meters(&self, meters: Vec<FlowMeterRecord>) {
        self.lock().flow_meters = meters;
    }

    pub fn set_flow_toggles(&self, toggles: Vec<FlowToggleRecord>) {
        self.lock().flow_toggles = toggles;
    }

    pub fn add_token(&self, token: AuthToken) {
        let key = (token.auth_device.clone(), token.token_value.clone());
        self.lock().tokens.insert(key, token);
    }

    pub fn add_user(&self, user: User) {
        self.lock().users.insert(user.username.clone(), user);
    }

    /// Pours accepted so far, in posting order.
    pub fn recorded_drinks(&self) -> Vec<RecordDrinkRequest> {
        self.lock().drinks.clone()
    }

    pub fn recorded_temperatures(&self) -> Vec<RecordTemperatureRequest> {
        self.lock().temperatures.clone()
    }

    /// Number of `record_drink` calls, including failed ones.
    pub fn record_drink_calls(&self) -> usize {
        self.lock().record_drink_calls
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MockBackend {
    async fn get_taps(&self) -> BackendResult<Vec<Tap>> {
        let state = self.lock();
        Self::check_reachable(&state)?;
        Ok(state.taps.clone())
    }

    async fn get_events(&self) -> BackendResult<Vec<SystemEvent>> {
        let state = self.lock();
        Self::check_reachable(&state)?;
        Ok(state.events.clone())
    }

    async fn get_events_since(&self, since_id: u64) -> BackendResult<Vec<SystemEvent>> {
        let state = self.lock();
        Self::check_reachable(&state)?;
        Ok(state
            .events
            .iter()
            .filter(|event| event.id > since_id)
            .cloned()
            .collect())
    }

    async fn get_current_session(&self) -> BackendResult<Option<Session>> {
        let state = self.lock();
        Self::check_reachable(&state)?;
        Ok(state.session.clone())
    }

    async fn get_session_stats(&self, session_id: u64) -> BackendResult<SessionStats> {
        let state = self.lock();
        Self::check_reachable(&state)?;
        match &state.session {
            Some(session) if session.id == session_id => Ok(state.stats.clone()),
            _ => Err(BackendError::not_found(format!("session {session_id}"))),
        }
    }

    async fn get_sound_events(&self) -> BackendResult<Vec<SoundEvent>> {
        let state = self.lock();
        Self::check_reachable(&state)?;
        Ok(state.sound_events.clone())
    }

    async fn get_controllers(&self) -> BackendResult<Vec<ControllerRecord>> {
        let state = self.lock();
        Self::check_reachable(&state)?;
        Ok(state.controllers.clone())
    }

    async fn get_flow_meters(&self) -> BackendResult<Vec<FlowMeterRecord>> {
        let state = self.lock();
        Self::check_reachable(&state)?;
        Ok(state.flow_meters.clone())
    }

    async fn get_flow_toggles(&self) -> BackendResult<Vec<FlowToggleRecord>> {
        let state = self.lock();
        Self::check_reachable(&state)?;
        Ok(state.flow_toggles.clone())
    }

    async fn record_drink(&self, request: &RecordDrinkRequest) -> BackendResult<()> {
        let mut state = self.lock();
        state.record_drink_calls += 1;
        Self::check_reachable(&state)?;
        if !state.taps.iter().any(|tap| tap.meter_name == request.tap) {
            return Err(BackendError::not_found(format!("tap {}", request.tap)));
        }
        if request.volume_ml <= 0.0 {
            return Err(BackendError::bad_request("volume must be positive"));
        }
        state.drinks.push(request.clone());
        Ok(())
    }

    async fn record_temperature(&self, request: &RecordTemperatureRequest) -> BackendResult<()> {
        let mut state = self.lock();
        Self::check_reachable(&state)?;
        state.temperatures.push(request.clone());
        Ok(())
    }

    async fn get_auth_token(&self, auth_device: &str, token_value: &str) -> BackendResult<AuthToken> {
        let state = self.lock();
        Self::check_reachable(&state)?;
        state
            .tokens
            .get(&(auth_device.to_string(), token_value.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::not_found(format!("token {auth_device}/{token_value}")))
    }

    async fn get_user(&self, username: &str) -> BackendResult<User> {
        let state = self.lock();
        Self::check_reachable(&state)?;
        state
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| BackendError::not_found(format!("user {username}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn drink(tap: &str) -> RecordDrinkRequest {
        RecordDrinkRequest {
            tap: tap.to_string(),
            volume_ml: 330.0,
            ticks: 1782,
            shout: String::new(),
            username: String::new(),
            record_date: Utc::now(),
            duration_ms: 4200,
            tick_time_series: Vec::new(),
            picture: None,
        }
    }

    #[tokio::test]
    async fn test_record_drink_requires_known_tap() {
        let backend = MockBackend::new();
        backend.set_taps(vec![Tap::new(1, "Main", "kegboard.flow0")]);

        assert!(backend.record_drink(&drink("kegboard.flow0")).await.is_ok());
        let err = backend.record_drink(&drink("kegboard.flow7")).await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(backend.recorded_drinks().len(), 1);
        assert_eq!(backend.record_drink_calls(), 2);
    }

    #[tokio::test]
    async fn test_offline_backend_fails_transiently() {
        let backend = MockBackend::new();
        backend.set_taps(vec![Tap::new(1, "Main", "kegboard.flow0")]);
        backend.set_reachable(false);

        let err = backend.record_drink(&drink("kegboard.flow0")).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(backend.recorded_drinks().is_empty());
    }

    #[tokio::test]
    async fn test_events_since_filters_by_id() {
        let backend = MockBackend::new();
        for id in 1..=3 {
            backend.push_event(SystemEvent {
                id,
                kind: "drink_poured".to_string(),
                time: Utc::now(),
                username: None,
                tap_id: Some(1),
                drink_id: Some(id),
            });
        }

        let events = backend.get_events_since(1).await.unwrap();
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let backend = MockBackend::new();
        let err = backend.get_auth_token("core.rfid", "deadbeef").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }
}
