//! Composition root.
//!
//! [`Core`] owns one instance of every engine component and wires them
//! together:
//!
//! - hardware events feed the flow manager (meter readings) and the sync
//!   manager (temperatures);
//! - taps pulled by the sync manager replace the tap registry;
//! - flow transitions drive output toggles and record finished pours;
//! - a token presented at a controller with exactly one tap logs the
//!   token's user in at that tap.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use kegtap_core::backend::RecordTemperatureRequest;
use kegtap_core::{AlertCenter, Backend, Event, EventBus, FlowSnapshot, Tap, split_port_name};
use kegtap_flow::{Flow, FlowListener, FlowManager, TapManager};
use kegtap_hardware::discovery::{NetworkDiscovery, SerialDiscovery};
use kegtap_hardware::{AnyDiscovery, HardwareManager};
use kegtap_storage::{Database, SqlitePendingRecordRepository};
use kegtap_sync::{SyncManager, drink_from_flow};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};

/// Output change requested by a flow transition.
#[derive(Debug)]
struct ToggleRequest {
    tap: Tap,
    enable: bool,
}

/// Flow observer that records finished pours and drives outputs.
///
/// Runs synchronously on the thread that caused the transition, so pours
/// ended by [`FlowManager::stop`] are still recorded.
struct PourRecorder<B: Backend> {
    sync: Arc<SyncManager<B>>,
    toggles: mpsc::UnboundedSender<ToggleRequest>,
}

impl<B: Backend> PourRecorder<B> {
    fn toggle(&self, flow: &FlowSnapshot, enable: bool) {
        if let Some(tap) = &flow.tap
            && tap.toggle_name.is_some()
        {
            // The receiver only goes away while the core is shutting down.
            let _ = self.toggles.send(ToggleRequest {
                tap: tap.clone(),
                enable,
            });
        }
    }
}

impl<B: Backend> FlowListener for PourRecorder<B> {
    fn flow_started(&self, flow: &FlowSnapshot) {
        if !flow.is_anonymous() {
            self.toggle(flow, true);
        }
    }

    fn flow_ended(&self, flow: &FlowSnapshot) {
        self.toggle(flow, false);
        if let Err(e) = self.sync.record_drink_async(drink_from_flow(flow)) {
            warn!(flow = flow.flow_id, error = %e, "Could not record pour");
        }
    }
}

struct Inner<B: Backend> {
    config: CoreConfig,
    backend: Arc<B>,
    bus: EventBus,
    alerts: AlertCenter,
    taps: TapManager,
    flows: FlowManager,
    hardware: tokio::sync::Mutex<HardwareManager<B>>,
    sync: Arc<SyncManager<B>>,
    database: Database,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<mpsc::UnboundedReceiver<ToggleRequest>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The running engine.
pub struct Core<B: Backend> {
    inner: Arc<Inner<B>>,
    toggles: Mutex<Option<mpsc::UnboundedReceiver<ToggleRequest>>>,
    running: Mutex<Option<Running>>,
}

impl<B: Backend> Core<B> {
    /// Open the queue database and build every component.
    pub async fn new(config: CoreConfig, backend: Arc<B>) -> Result<Self> {
        let database = Database::new(config.database.clone()).await?;
        Ok(Self::with_database(config, backend, database))
    }

    /// Build every component on an already opened database.
    pub fn with_database(config: CoreConfig, backend: Arc<B>, database: Database) -> Self {
        let bus = EventBus::new();
        let alerts = AlertCenter::new(bus.clone());
        let taps = TapManager::new();
        let flows = FlowManager::new(taps.clone(), bus.clone(), config.flow.clone());

        let mut hardware = HardwareManager::new(Arc::clone(&backend), bus.clone(), alerts.clone());
        if let Some(serial) = &config.serial {
            hardware.add_discovery(
                AnyDiscovery::from(SerialDiscovery::new(serial.clone())),
                config.manager.clone(),
            );
        }
        if let Some(network) = &config.network {
            hardware.add_discovery(
                AnyDiscovery::from(NetworkDiscovery::new(network.clone())),
                config.manager.clone(),
            );
        }

        let sync = Arc::new(SyncManager::new(
            Arc::clone(&backend),
            SqlitePendingRecordRepository::new(database.pool().clone()),
            bus.clone(),
            alerts.clone(),
            config.sync.clone(),
        ));

        let (toggle_tx, toggle_rx) = mpsc::unbounded_channel();
        flows.add_listener(Arc::new(PourRecorder {
            sync: Arc::clone(&sync),
            toggles: toggle_tx,
        }));

        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                bus,
                alerts,
                taps,
                flows,
                hardware: tokio::sync::Mutex::new(hardware),
                sync,
                database,
            }),
            toggles: Mutex::new(Some(toggle_rx)),
            running: Mutex::new(None),
        }
    }

    /// Register an extra controller transport. Takes effect on [`start`](Self::start).
    pub async fn add_discovery(&self, discovery: AnyDiscovery) {
        self.inner
            .hardware
            .lock()
            .await
            .add_discovery(discovery, self.inner.config.manager.clone());
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.bus.subscribe()
    }

    pub fn alerts(&self) -> &AlertCenter {
        &self.inner.alerts
    }

    pub fn taps(&self) -> &TapManager {
        &self.inner.taps
    }

    pub fn flows(&self) -> &FlowManager {
        &self.inner.flows
    }

    pub fn sync(&self) -> &SyncManager<B> {
        &self.inner.sync
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Start hardware, flow tracking and sync.
    pub async fn start(&self) {
        let Some(toggles) = lock(&self.toggles).take() else {
            warn!("Core already started");
            return;
        };

        // Subscribe before anything can publish.
        let events = self.inner.bus.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            Arc::clone(&self.inner),
            events,
            toggles,
            cancel.clone(),
        ));
        *lock(&self.running) = Some(Running { cancel, task });

        self.inner.sync.start();
        self.inner.hardware.lock().await.start();
        self.inner.sync.request_sync();
        info!("Core started");
    }

    /// Stop everything. Active pours are ended and recorded first.
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        let toggles = match running {
            Some(running) => {
                running.cancel.cancel();
                running.task.await.ok()
            }
            None => None,
        };

        self.inner.flows.stop();

        if let Some(mut toggles) = toggles {
            while let Ok(request) = toggles.try_recv() {
                self.inner.apply_toggle(request).await;
            }
        }

        self.inner.hardware.lock().await.stop().await;
        self.inner.sync.stop().await;
        self.inner.database.close().await;
        info!("Core stopped");
    }

    /// Log `username` in at a tap and open its output.
    pub async fn activate_user_at_tap(&self, tap_id: u64, username: &str) -> Result<Arc<Flow>> {
        self.inner.activate_user_at_tap(tap_id, username).await
    }

    /// Resolve a token through the backend and log its user in at `tap_id`.
    pub async fn authenticate_token(&self, device: &str, token: &str, tap_id: u64) -> Result<Arc<Flow>> {
        self.inner.authenticate_token(device, token, tap_id).await
    }

    /// Switch the output of a tap directly.
    pub async fn toggle_output(&self, tap_id: u64, enable: bool) -> Result<()> {
        let tap = self
            .inner
            .taps
            .tap(tap_id)
            .ok_or(CoreError::UnknownTap(tap_id))?;
        self.inner.hardware.lock().await.toggle_output(&tap, enable).await?;
        Ok(())
    }

    /// Rows waiting in the durable queue.
    pub async fn pending_count(&self) -> Result<i64> {
        Ok(self.inner.sync.pending_count().await?)
    }
}

impl<B: Backend> Inner<B> {
    async fn activate_user_at_tap(&self, tap_id: u64, username: &str) -> Result<Arc<Flow>> {
        let flow = self.flows.activate_user_at_tap(tap_id, username)?;
        // A takeover starts no flow, so the listener never opened the output.
        if let Some(tap) = flow.tap() {
            self.apply_toggle(ToggleRequest {
                tap: tap.clone(),
                enable: true,
            })
            .await;
        }
        Ok(flow)
    }

    async fn authenticate_token(&self, device: &str, token: &str, tap_id: u64) -> Result<Arc<Flow>> {
        let auth = self.backend.get_auth_token(device, token).await?;
        let username = match auth.username {
            Some(username) if auth.enabled && !username.is_empty() => username,
            _ => {
                return Err(CoreError::TokenRejected {
                    device: device.to_string(),
                    token: token.to_string(),
                });
            }
        };
        info!(device, username = %username, tap = tap_id, "Token authenticated");
        self.activate_user_at_tap(tap_id, &username).await
    }

    async fn apply_toggle(&self, request: ToggleRequest) {
        let hardware = self.hardware.lock().await;
        if let Err(e) = hardware.toggle_output(&request.tap, request.enable).await {
            debug!(tap = request.tap.id, enable = request.enable, error = %e, "Output not switched");
        }
    }

    /// Re-assert outputs of authenticated pours so their leases never lapse.
    async fn keep_outputs_alive(&self) {
        for flow in self.flows.active_flows() {
            if flow.is_anonymous() {
                continue;
            }
            if let Some(tap) = flow.tap()
                && tap.toggle_name.is_some()
            {
                self.apply_toggle(ToggleRequest {
                    tap: tap.clone(),
                    enable: true,
                })
                .await;
            }
        }
    }

    /// The only tap wired to `controller`, if there is exactly one.
    fn single_tap_for_controller(&self, controller: &str) -> Option<Tap> {
        let mut taps = self.taps.taps().into_iter().filter(|tap| {
            split_port_name(&tap.meter_name).is_some_and(|(name, _)| name == controller)
        });
        match (taps.next(), taps.next()) {
            (Some(tap), None) => Some(tap),
            _ => None,
        }
    }

    fn handle_event(self: &Arc<Self>, event: Event) {
        match event {
            Event::MeterUpdate { meter, ticks } => {
                if let Err(e) = self.flows.handle_meter_activity(&meter, ticks) {
                    warn!(meter = %meter, ticks, error = %e, "Meter reading not applied");
                }
            }
            Event::ThermoSensorUpdate {
                sensor,
                temperature_c: Some(temperature_c),
            } => {
                let request = RecordTemperatureRequest {
                    sensor_name: sensor,
                    temperature_c,
                    record_date: Utc::now(),
                };
                if let Err(e) = self.sync.record_temperature_async(request) {
                    debug!(error = %e, "Temperature not recorded");
                }
            }
            Event::TapsChanged(taps) => {
                if self.taps.update_taps(taps) {
                    info!(taps = self.taps.len(), "Tap list updated");
                }
            }
            Event::TokenAttached {
                controller,
                device,
                token,
            } => {
                let Some(tap) = self.single_tap_for_controller(&controller) else {
                    debug!(controller = %controller, "Token seen; no single tap to log in at");
                    return;
                };
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = inner.authenticate_token(&device, &token, tap.id).await {
                        warn!(device = %device, error = %e, "Token login failed");
                    }
                });
            }
            _ => {}
        }
    }
}

async fn run<B: Backend>(
    inner: Arc<Inner<B>>,
    mut events: broadcast::Receiver<Event>,
    mut toggles: mpsc::UnboundedReceiver<ToggleRequest>,
    cancel: CancellationToken,
) -> mpsc::UnboundedReceiver<ToggleRequest> {
    let mut keepalive = tokio::time::interval(inner.config.keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(request) = toggles.recv() => inner.apply_toggle(request).await,
            event = events.recv() => match event {
                Ok(event) => inner.handle_event(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Core fell behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = keepalive.tick() => inner.keep_outputs_alive().await,
        }
    }
    toggles
}

impl<B: Backend> std::fmt::Debug for Core<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("running", &self.is_running())
            .field("taps", &self.inner.taps.len())
            .field("sync", &self.inner.sync)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kegtap_core::backend::mock::MockBackend;
    use rstest::rstest;

    async fn core() -> Core<MockBackend> {
        let database = Database::in_memory().await.unwrap();
        let core = Core::with_database(
            CoreConfig::default().with_serial(None),
            Arc::new(MockBackend::new()),
            database,
        );
        core.taps().update_taps(vec![
            Tap::new(1, "Tap 1", "kegboard-ab12.flow0"),
            Tap::new(2, "Tap 2", "kegboard-cd34.flow0"),
            Tap::new(3, "Tap 3", "kegboard-cd34.flow1"),
        ]);
        core
    }

    #[rstest]
    #[case("kegboard-ab12", Some(1))]
    #[case("kegboard-cd34", None)]
    #[case("kegboard-ffff", None)]
    #[tokio::test]
    async fn test_single_tap_for_controller(#[case] controller: &str, #[case] expected: Option<u64>) {
        let core = core().await;
        let tap = core.inner.single_tap_for_controller(controller);
        assert_eq!(tap.map(|t| t.id), expected);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_harmless() {
        let core = core().await;
        assert!(!core.is_running());
        core.stop().await;
        assert!(!core.is_running());
    }
}
