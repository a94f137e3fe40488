//! De-duplicated user-facing alerts.
//!
//! Alerts are keyed by a stable id (a controller name, or a fixed id such as
//! [`ALERT_BACKEND_UNREACHABLE`](crate::constants::ALERT_BACKEND_UNREACHABLE)).
//! Raising an alert that is already active with identical content publishes
//! nothing, so a flapping condition does not spam subscribers.

use crate::events::{Event, EventBus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub description: String,
}

impl Alert {
    pub fn new(
        id: impl Into<String>,
        severity: AlertSeverity,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            severity,
            title: title.into(),
            description: description.into(),
        }
    }
}

/// Registry of active alerts.
#[derive(Debug, Clone)]
pub struct AlertCenter {
    active: Arc<Mutex<HashMap<String, Alert>>>,
    bus: EventBus,
}

impl AlertCenter {
    pub fn new(bus: EventBus) -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            bus,
        }
    }

    /// Raises or updates an alert. Returns `true` if subscribers were notified.
    pub fn raise(&self, alert: Alert) -> bool {
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.get(&alert.id) == Some(&alert) {
                return false;
            }
            active.insert(alert.id.clone(), alert.clone());
        }
        warn!(alert_id = %alert.id, title = %alert.title, "Alert raised");
        self.bus.publish(Event::AlertRaised(alert));
        true
    }

    /// Clears an alert. Returns `true` if it was active.
    pub fn clear(&self, id: &str) -> bool {
        let removed = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some();
        if removed {
            info!(alert_id = %id, "Alert cleared");
            self.bus.publish(Event::AlertCleared { id: id.to_string() });
        }
        removed
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn active(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        alerts.sort_by(|a, b| a.id.cmp(&b.id));
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> Alert {
        Alert::new(
            "backend-unreachable",
            AlertSeverity::Warning,
            "Backend unreachable",
            "Pours are queued locally",
        )
    }

    #[test]
    fn test_repeated_raise_is_deduplicated() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let alerts = AlertCenter::new(bus);

        assert!(alerts.raise(offline()));
        assert!(!alerts.raise(offline()));
        assert!(alerts.is_active("backend-unreachable"));

        assert!(matches!(rx.try_recv(), Ok(Event::AlertRaised(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_changed_content_republishes() {
        let alerts = AlertCenter::new(EventBus::new());
        assert!(alerts.raise(offline()));

        let mut changed = offline();
        changed.description = "3 pours queued".into();
        assert!(alerts.raise(changed));
        assert_eq!(alerts.active().len(), 1);
    }

    #[test]
    fn test_clear_only_once() {
        let alerts = AlertCenter::new(EventBus::new());
        alerts.raise(offline());
        assert!(alerts.clear("backend-unreachable"));
        assert!(!alerts.clear("backend-unreachable"));
        assert!(alerts.active().is_empty());
    }
}
