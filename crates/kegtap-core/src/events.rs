//! Typed events published to the rest of the system.
//!
//! Every component publishes on one [`EventBus`], a thin wrapper over a
//! `tokio::sync::broadcast` channel. Subscribers each get their own receiver
//! and see events in publish order; a subscriber that falls behind by more
//! than the bus capacity receives `RecvError::Lagged` and continues from the
//! oldest retained event.

use crate::alerts::Alert;
use crate::backend::{
    ControllerRecord, FlowMeterRecord, FlowToggleRecord, Session, SessionStats, SoundEvent,
    SystemEvent,
};
use crate::constants::EVENT_BUS_CAPACITY;
use crate::types::{ControllerInfo, FlowSnapshot, Tap};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ControllerAttached(ControllerInfo),
    ControllerRemoved(ControllerInfo),
    /// Seen on a verified controller whose serial number the backend does not know.
    UnknownController(ControllerInfo),
    MeterUpdate {
        meter: String,
        ticks: u64,
    },
    ThermoSensorUpdate {
        sensor: String,
        temperature_c: Option<f64>,
    },
    TokenAttached {
        controller: String,
        device: String,
        token: String,
    },
    TokenDetached {
        controller: String,
        device: String,
        token: String,
    },
    FlowStart(FlowSnapshot),
    FlowUpdate(FlowSnapshot),
    FlowEnd(FlowSnapshot),
    TapsChanged(Vec<Tap>),
    SystemEventListUpdate(Vec<SystemEvent>),
    CurrentSessionChanged(Option<Session>),
    SessionStatsChanged(SessionStats),
    SoundEventsChanged(Vec<SoundEvent>),
    ControllersChanged(Vec<ControllerRecord>),
    FlowMetersChanged(Vec<FlowMeterRecord>),
    FlowTogglesChanged(Vec<FlowToggleRecord>),
    AlertRaised(Alert),
    AlertCleared {
        id: String,
    },
}

impl Event {
    /// Short name used in log lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ControllerAttached(_) => "controller_attached",
            Event::ControllerRemoved(_) => "controller_removed",
            Event::UnknownController(_) => "unknown_controller",
            Event::MeterUpdate { .. } => "meter_update",
            Event::ThermoSensorUpdate { .. } => "thermo_sensor_update",
            Event::TokenAttached { .. } => "token_attached",
            Event::TokenDetached { .. } => "token_detached",
            Event::FlowStart(_) => "flow_start",
            Event::FlowUpdate(_) => "flow_update",
            Event::FlowEnd(_) => "flow_end",
            Event::TapsChanged(_) => "taps_changed",
            Event::SystemEventListUpdate(_) => "system_event_list_update",
            Event::CurrentSessionChanged(_) => "current_session_changed",
            Event::SessionStatsChanged(_) => "session_stats_changed",
            Event::SoundEventsChanged(_) => "sound_events_changed",
            Event::ControllersChanged(_) => "controllers_changed",
            Event::FlowMetersChanged(_) => "flow_meters_changed",
            Event::FlowTogglesChanged(_) => "flow_toggles_changed",
            Event::AlertRaised(_) => "alert_raised",
            Event::AlertCleared { .. } => "alert_cleared",
        }
    }
}

/// Cloneable publish side of the event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            trace!(kind, "Event published without subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::MeterUpdate {
            meter: "kegboard.flow0".into(),
            ticks: 10,
        });
        bus.publish(Event::MeterUpdate {
            meter: "kegboard.flow0".into(),
            ticks: 20,
        });

        for expected in [10, 20] {
            match rx.recv().await.unwrap() {
                Event::MeterUpdate { ticks, .. } => assert_eq!(ticks, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(Event::AlertCleared { id: "x".into() });
    }

    #[tokio::test]
    async fn test_lagging_subscriber() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for ticks in 0..5 {
            bus.publish(Event::MeterUpdate {
                meter: "m".into(),
                ticks,
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }
}
