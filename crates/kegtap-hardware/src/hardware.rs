//! Hardware layer facade.
//!
//! [`HardwareManager`] runs one [`ControllerManager`] per configured transport,
//! funnels their [`ControllerEvent`]s through a single channel and republishes
//! them on the [`EventBus`] as typed [`Event`]s. It also owns controller-status
//! alerts, the backend lookup for unknown controllers and output toggling for
//! taps.

use std::collections::HashMap;
use std::sync::Arc;

use kegtap_core::{
    Alert, AlertCenter, AlertSeverity, Backend, ControllerInfo, ControllerStatus, Event, EventBus,
    Tap,
};
use kegtap_protocol::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::plausible_temperature;
use crate::discovery::AnyDiscovery;
use crate::error::{HardwareError, Result};
use crate::manager::{ControllerEvent, ControllerManager, ControllerManagerHandle, ManagerConfig};
use crate::registry::ControllerRegistry;

const FAN_IN_CAPACITY: usize = 256;

/// Alert id used for a controller's status problems.
pub fn controller_alert_id(name: &str) -> String {
    format!("controller:{name}")
}

/// Split a toggle name `<controller>.relay<N>` into controller name and output id.
///
/// # Examples
///
/// ```
/// use kegtap_hardware::hardware::parse_toggle_name;
///
/// assert_eq!(parse_toggle_name("kegboard-1a2b.relay0"), Some(("kegboard-1a2b", 0)));
/// assert_eq!(parse_toggle_name("kegboard-1a2b.flow0"), None);
/// ```
pub fn parse_toggle_name(toggle: &str) -> Option<(&str, u8)> {
    let (controller, port) = kegtap_core::split_port_name(toggle)?;
    let output_id = port.strip_prefix("relay")?.parse().ok()?;
    Some((controller, output_id))
}

/// Coordinates every controller manager.
pub struct HardwareManager<B: Backend> {
    backend: Arc<B>,
    bus: EventBus,
    alerts: AlertCenter,
    registry: ControllerRegistry,
    pending: Vec<(AnyDiscovery, ManagerConfig)>,
    managers: Vec<ControllerManagerHandle>,
    fan_in: Option<JoinHandle<()>>,
}

impl<B: Backend> HardwareManager<B> {
    pub fn new(backend: Arc<B>, bus: EventBus, alerts: AlertCenter) -> Self {
        Self {
            backend,
            bus,
            alerts,
            registry: ControllerRegistry::new(),
            pending: Vec::new(),
            managers: Vec::new(),
            fan_in: None,
        }
    }

    /// Register a transport; it starts with the next [`start`](Self::start).
    pub fn add_discovery(&mut self, discovery: AnyDiscovery, config: ManagerConfig) {
        self.pending.push((discovery, config));
    }

    pub fn registry(&self) -> &ControllerRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.fan_in.is_some()
    }

    /// Start every registered transport.
    pub fn start(&mut self) {
        if self.fan_in.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(FAN_IN_CAPACITY);

        for (discovery, config) in self.pending.drain(..) {
            let manager = ControllerManager::new(discovery, config, self.registry.clone(), tx.clone());
            self.managers.push(manager.start());
        }
        info!(transports = self.managers.len(), "Hardware manager started");

        let fan_in = FanIn {
            backend: Arc::clone(&self.backend),
            bus: self.bus.clone(),
            alerts: self.alerts.clone(),
        };
        self.fan_in = Some(tokio::spawn(fan_in.run(rx)));
    }

    /// Stop every transport and wait for the removals to be published.
    pub async fn stop(&mut self) {
        for manager in self.managers.drain(..) {
            manager.shutdown().await;
        }
        if let Some(fan_in) = self.fan_in.take() {
            let _ = fan_in.await;
        }
        info!("Hardware manager stopped");
    }

    /// Ask every transport to rescan now.
    pub fn refresh_soon(&self) {
        for manager in &self.managers {
            manager.refresh_soon();
        }
    }

    /// Public view of every verified controller.
    pub fn controllers(&self) -> Vec<ControllerInfo> {
        self.registry.controllers().iter().map(|c| c.info()).collect()
    }

    /// Latest tick count per full meter name.
    pub fn meters(&self) -> HashMap<String, u64> {
        let mut meters = HashMap::new();
        for controller in self.registry.controllers() {
            let name = controller.name();
            for (port, ticks) in controller.meters() {
                meters.insert(format!("{name}.{port}"), ticks);
            }
        }
        meters
    }

    /// Latest temperature per full sensor name.
    pub fn thermo_sensors(&self) -> HashMap<String, Option<f64>> {
        let mut sensors = HashMap::new();
        for controller in self.registry.controllers() {
            let name = controller.name();
            for (port, value) in controller.thermo_sensors() {
                sensors.insert(format!("{name}.{port}"), value);
            }
        }
        sensors
    }

    /// Switch the output bound to `tap`. Taps without a toggle are ignored.
    pub async fn toggle_output(&self, tap: &Tap, enable: bool) -> Result<()> {
        let Some(toggle) = tap.toggle_name.as_deref() else {
            return Ok(());
        };
        let (name, output_id) =
            parse_toggle_name(toggle).ok_or_else(|| HardwareError::invalid_toggle(toggle))?;
        let controller = self
            .registry
            .get(name)
            .ok_or_else(|| HardwareError::unknown_controller(name))?;

        debug!(tap = tap.id, toggle, enable, "Toggling output");
        controller.schedule_toggle_output(output_id, enable).await
    }
}

/// Fan-in task state.
struct FanIn<B: Backend> {
    backend: Arc<B>,
    bus: EventBus,
    alerts: AlertCenter,
}

impl<B: Backend> FanIn<B> {
    async fn run(self, mut rx: mpsc::Receiver<ControllerEvent>) {
        while let Some(event) = rx.recv().await {
            self.dispatch(event);
        }
        debug!("Controller event fan-in finished");
    }

    fn dispatch(&self, event: ControllerEvent) {
        match event {
            ControllerEvent::Attached(info) => self.attached(info),
            ControllerEvent::Removed(info) => {
                self.alerts.clear(&controller_alert_id(&info.name));
                self.bus.publish(Event::ControllerRemoved(info));
            }
            ControllerEvent::Message {
                controller,
                message,
            } => self.message(&controller, message),
        }
    }

    fn attached(&self, info: ControllerInfo) {
        let alert_id = controller_alert_id(&info.name);
        self.bus.publish(Event::ControllerAttached(info.clone()));
        if info.status == ControllerStatus::Ok {
            self.alerts.clear(&alert_id);
            self.check_registration(info);
        } else {
            self.alerts.raise(Alert::new(
                alert_id,
                AlertSeverity::Warning,
                format!("Controller {} needs attention", info.name),
                status_description(&info),
            ));
        }
    }

    /// Ask the backend whether it knows this board, off the fan-in task.
    fn check_registration(&self, info: ControllerInfo) {
        let backend = Arc::clone(&self.backend);
        let bus = self.bus.clone();
        tokio::spawn(async move {
            match backend.get_controllers().await {
                Ok(known) => {
                    if !known.iter().any(|r| r.serial_number == info.serial_number) {
                        info!(controller = %info.name, serial_number = %info.serial_number, "Controller not registered with backend");
                        bus.publish(Event::UnknownController(info));
                    }
                }
                Err(e) => debug!(controller = %info.name, error = %e, "Controller lookup failed"),
            }
        });
    }

    fn message(&self, controller: &str, message: Message) {
        match message {
            Message::MeterStatus { meter_name, ticks } => self.bus.publish(Event::MeterUpdate {
                meter: format!("{controller}.{meter_name}"),
                ticks: u64::from(ticks),
            }),
            Message::TemperatureReading { ref sensor_name, .. } => {
                let temperature_c = message.celsius().filter(|c| plausible_temperature(*c));
                self.bus.publish(Event::ThermoSensorUpdate {
                    sensor: format!("{controller}.{sensor_name}"),
                    temperature_c,
                });
            }
            Message::AuthToken {
                device,
                token,
                present,
            } => {
                let controller = controller.to_string();
                self.bus.publish(if present {
                    Event::TokenAttached {
                        controller,
                        device,
                        token,
                    }
                } else {
                    Event::TokenDetached {
                        controller,
                        device,
                        token,
                    }
                });
            }
            Message::OutputStatus {
                output_name,
                enabled,
            } => debug!(controller, output = %output_name, enabled, "Output status"),
            other => warn!(controller, message = ?other, "Unexpected message from controller"),
        }
    }
}

fn status_description(info: &ControllerInfo) -> String {
    match info.status {
        ControllerStatus::NeedUpdate => format!(
            "Firmware version {} is too old; update the board.",
            info.firmware_version.unwrap_or_default()
        ),
        ControllerStatus::NeedSerialNumber => "The board has no serial number.".to_string(),
        ControllerStatus::Unresponsive => "The board did not answer pings.".to_string(),
        ControllerStatus::OpenError => "The board's port could not be read.".to_string(),
        ControllerStatus::NameConflict => {
            "Another board is already attached under this name.".to_string()
        }
        ControllerStatus::Ok | ControllerStatus::Unknown => format!("Status: {}", info.status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kegtap_core::TransportKind;
    use kegtap_core::backend::mock::MockBackend;
    use rstest::rstest;

    #[rstest]
    #[case("kegboard.relay0", Some(("kegboard", 0)))]
    #[case("kegboard-ab12.relay4", Some(("kegboard-ab12", 4)))]
    #[case("kegboard.relay", None)]
    #[case("kegboard.flow0", None)]
    #[case("relay0", None)]
    fn test_parse_toggle_name(#[case] toggle: &str, #[case] expected: Option<(&str, u8)>) {
        assert_eq!(parse_toggle_name(toggle), expected);
    }

    fn info(status: ControllerStatus) -> ControllerInfo {
        ControllerInfo {
            name: "kegboard-ab12".into(),
            serial_number: "KB-0000-0000-AB12".into(),
            status,
            firmware_version: Some(12),
            transport: TransportKind::Fake,
            device_id: "fake-9".into(),
        }
    }

    fn fan_in(bus: &EventBus) -> FanIn<MockBackend> {
        FanIn {
            backend: Arc::new(MockBackend::new()),
            bus: bus.clone(),
            alerts: AlertCenter::new(bus.clone()),
        }
    }

    #[tokio::test]
    async fn test_meter_and_thermo_names_are_qualified() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let fan_in = fan_in(&bus);

        fan_in.dispatch(ControllerEvent::Message {
            controller: "kegboard-ab12".into(),
            message: Message::MeterStatus {
                meter_name: "flow1".into(),
                ticks: 42,
            },
        });
        fan_in.dispatch(ControllerEvent::Message {
            controller: "kegboard-ab12".into(),
            message: Message::TemperatureReading {
                sensor_name: "thermo-0".into(),
                micro_celsius: 999_000_000,
            },
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            Event::MeterUpdate {
                meter: "kegboard-ab12.flow1".into(),
                ticks: 42
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Event::ThermoSensorUpdate {
                sensor: "kegboard-ab12.thermo-0".into(),
                temperature_c: None
            }
        );
    }

    #[tokio::test]
    async fn test_status_alert_raised_and_cleared() {
        let bus = EventBus::new();
        let fan_in = fan_in(&bus);

        fan_in.dispatch(ControllerEvent::Attached(info(ControllerStatus::NeedUpdate)));
        assert!(fan_in.alerts.is_active("controller:kegboard-ab12"));

        fan_in.dispatch(ControllerEvent::Removed(info(ControllerStatus::NeedUpdate)));
        assert!(!fan_in.alerts.is_active("controller:kegboard-ab12"));
    }

    #[tokio::test]
    async fn test_token_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let fan_in = fan_in(&bus);

        fan_in.dispatch(ControllerEvent::Message {
            controller: "kegboard".into(),
            message: Message::AuthToken {
                device: "core.rfid".into(),
                token: "0a1b".into(),
                present: false,
            },
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            Event::TokenDetached {
                controller: "kegboard".into(),
                device: "core.rfid".into(),
                token: "0a1b".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_toggle_without_binding_is_noop() {
        let bus = EventBus::new();
        let manager = HardwareManager::new(Arc::new(MockBackend::new()), bus.clone(), AlertCenter::new(bus));
        let tap = Tap::new(1, "Tap 1", "kegboard.flow0");
        assert!(manager.toggle_output(&tap, true).await.is_ok());

        let tap = tap.with_toggle("kegboard.relay0");
        assert!(matches!(
            manager.toggle_output(&tap, true).await,
            Err(HardwareError::UnknownController { .. })
        ));

        let tap = Tap::new(2, "Tap 2", "kegboard.flow1").with_toggle("kegboard.valve");
        assert!(matches!(
            manager.toggle_output(&tap, true).await,
            Err(HardwareError::InvalidToggle { .. })
        ));
    }
}
