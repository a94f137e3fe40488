//! Incremental pull of backend state.
//!
//! Keeps the last value seen for every polled collection and turns a fresh
//! pull into the events for whatever actually changed.

use kegtap_core::backend::{
    ControllerRecord, FlowMeterRecord, FlowToggleRecord, Session, SessionStats, SoundEvent,
    SystemEvent,
};
use kegtap_core::{Backend, BackendResult, Event, Tap};
use tracing::debug;

/// Store `value` if it differs from what `slot` holds. Returns it when it did.
fn changed<T: Clone + PartialEq>(slot: &mut Option<T>, value: T) -> Option<T> {
    if slot.as_ref() == Some(&value) {
        return None;
    }
    *slot = Some(value.clone());
    Some(value)
}

#[derive(Debug, Default)]
pub(crate) struct RemoteSnapshot {
    taps: Option<Vec<Tap>>,
    last_event_id: Option<u64>,
    session: Option<Option<Session>>,
    stats: Option<SessionStats>,
    sound_events: Option<Vec<SoundEvent>>,
    controllers: Option<Vec<ControllerRecord>>,
    flow_meters: Option<Vec<FlowMeterRecord>>,
    flow_toggles: Option<Vec<FlowToggleRecord>>,
}

impl RemoteSnapshot {
    /// Pull everything and return the events to publish.
    ///
    /// Every call is made before the snapshot is touched, so a pull that
    /// fails part way leaves the snapshot as it was and the next pull
    /// reports the same changes again.
    pub(crate) async fn pull<B: Backend>(&mut self, backend: &B) -> BackendResult<Vec<Event>> {
        let taps = backend.get_taps().await?;
        let system_events = match self.last_event_id {
            Some(id) => backend.get_events_since(id).await?,
            None => backend.get_events().await?,
        };
        let session = backend.get_current_session().await?;
        let stats = match &session {
            Some(session) => Some(backend.get_session_stats(session.id).await?),
            None => None,
        };
        let sound_events = backend.get_sound_events().await?;
        let controllers = backend.get_controllers().await?;
        let flow_meters = backend.get_flow_meters().await?;
        let flow_toggles = backend.get_flow_toggles().await?;

        let mut events = Vec::new();
        if let Some(taps) = changed(&mut self.taps, taps) {
            events.push(Event::TapsChanged(taps));
        }
        if let Some(events_seen) = self.record_system_events(&system_events) {
            debug!(count = events_seen, "New system events");
            events.push(Event::SystemEventListUpdate(system_events));
        }
        if let Some(session) = changed(&mut self.session, session) {
            events.push(Event::CurrentSessionChanged(session));
        }
        match stats {
            Some(stats) => {
                if let Some(stats) = changed(&mut self.stats, stats) {
                    events.push(Event::SessionStatsChanged(stats));
                }
            }
            None => self.stats = None,
        }
        if let Some(sounds) = changed(&mut self.sound_events, sound_events) {
            events.push(Event::SoundEventsChanged(sounds));
        }
        if let Some(controllers) = changed(&mut self.controllers, controllers) {
            events.push(Event::ControllersChanged(controllers));
        }
        if let Some(meters) = changed(&mut self.flow_meters, flow_meters) {
            events.push(Event::FlowMetersChanged(meters));
        }
        if let Some(toggles) = changed(&mut self.flow_toggles, flow_toggles) {
            events.push(Event::FlowTogglesChanged(toggles));
        }

        Ok(events)
    }

    /// Advance the event cursor. Returns the number of new events, if any.
    fn record_system_events(&mut self, events: &[SystemEvent]) -> Option<usize> {
        let newest = events.iter().map(|event| event.id).max();
        let is_new = |id: u64| self.last_event_id.is_none_or(|last| id > last);
        let fresh = events.iter().filter(|event| is_new(event.id)).count();
        if let Some(newest) = newest {
            self.last_event_id = Some(self.last_event_id.map_or(newest, |last| last.max(newest)));
        }
        (fresh > 0).then_some(fresh)
    }
}
