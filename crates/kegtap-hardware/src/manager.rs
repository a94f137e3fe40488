//! Controller manager: one per transport.
//!
//! The manager owns a discovery source and runs a single service loop that
//! attaches new devices, verifies them, services each attached controller and
//! removes the ones whose transport went away. Every attached controller gets
//! a reader task; every verification runs on a short-lived task of its own.
//!
//! ```text
//!  discovery ──open──► Controller ◄──ingest── ControllerReader task
//!                          │
//!              verify task ┤ (ping / hello / serial / name claim)
//!                          │
//!  service loop ───────────┴──► mpsc<ControllerEvent> ──► HardwareManager
//! ```
//!
//! # Examples
//!
//! ```no_run
//! use kegtap_hardware::discovery::AnyDiscovery;
//! use kegtap_hardware::manager::{ControllerManager, ManagerConfig};
//! use kegtap_hardware::mock::FakeDiscovery;
//! use kegtap_hardware::registry::ControllerRegistry;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (events_tx, mut events_rx) = mpsc::channel(64);
//!     let manager = ControllerManager::new(
//!         AnyDiscovery::Fake(FakeDiscovery::new()),
//!         ManagerConfig::default(),
//!         ControllerRegistry::new(),
//!         events_tx,
//!     );
//!
//!     let handle = manager.start();
//!     while let Some(event) = events_rx.recv().await {
//!         println!("{event:?}");
//!     }
//!     handle.shutdown().await;
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kegtap_core::constants::{
    DEFAULT_IDLE_SLEEP_MS, DEFAULT_MIN_FIRMWARE_VERSION, DEFAULT_OUTPUT_LEASE_MS,
    DEFAULT_PING_WAIT_MS, DEFAULT_READ_TIMEOUT_MS, DEFAULT_RESCAN_INTERVAL_MS,
    VERIFY_PING_ATTEMPTS,
};
use kegtap_core::{ControllerInfo, ControllerStatus, TransportKind};
use kegtap_protocol::Message;
use tokio::sync::{Notify, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::{Controller, ReaderExit, generate_serial_number};
use crate::discovery::{AnyDiscovery, DeviceDiscovery};
use crate::error::Result;
use crate::registry::ControllerRegistry;

/// Event emitted by a controller manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// Verification finished; carries the resulting status.
    ///
    /// A controller that lost a name conflict is announced under
    /// [`conflict_name`] so it never shadows the board holding the name.
    Attached(ControllerInfo),
    /// A previously announced controller went away.
    Removed(ControllerInfo),
    /// Decoded message from an `Ok` controller.
    Message { controller: String, message: Message },
}

/// Timing and policy for a controller manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub rescan_interval: Duration,
    pub idle_sleep: Duration,
    pub ping_wait: Duration,
    pub ping_attempts: u32,
    pub min_firmware_version: u16,
    pub read_timeout: Duration,
    pub output_lease: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            rescan_interval: Duration::from_millis(DEFAULT_RESCAN_INTERVAL_MS),
            idle_sleep: Duration::from_millis(DEFAULT_IDLE_SLEEP_MS),
            ping_wait: Duration::from_millis(DEFAULT_PING_WAIT_MS),
            ping_attempts: VERIFY_PING_ATTEMPTS,
            min_firmware_version: DEFAULT_MIN_FIRMWARE_VERSION,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            output_lease: Duration::from_millis(DEFAULT_OUTPUT_LEASE_MS),
        }
    }
}

impl ManagerConfig {
    pub fn with_rescan_interval(mut self, interval: Duration) -> Self {
        self.rescan_interval = interval;
        self
    }

    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    pub fn with_ping_wait(mut self, wait: Duration) -> Self {
        self.ping_wait = wait;
        self
    }

    pub fn with_ping_attempts(mut self, attempts: u32) -> Self {
        self.ping_attempts = attempts;
        self
    }

    pub fn with_min_firmware_version(mut self, version: u16) -> Self {
        self.min_firmware_version = version;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_output_lease(mut self, lease: Duration) -> Self {
        self.output_lease = lease;
        self
    }
}

/// Wake-up signals shared between the handle and the service loop.
#[derive(Debug, Default)]
struct Signals {
    wake: Arc<Notify>,
    rescan: AtomicBool,
}

/// Handle to a running controller manager.
#[derive(Debug)]
pub struct ControllerManagerHandle {
    kind: TransportKind,
    signals: Arc<Signals>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ControllerManagerHandle {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Rescan for devices on the next loop iteration instead of waiting for
    /// the rescan interval.
    pub fn refresh_soon(&self) {
        self.signals.rescan.store(true, Ordering::SeqCst);
        self.signals.wake.notify_one();
    }

    /// Stop the service loop, every reader and every verification.
    ///
    /// Attached controllers are closed and reported as removed before this
    /// returns.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            error!(transport = %self.kind, "Controller manager panicked");
        }
    }
}

/// What a manager task reports back to the service loop.
enum TaskOutcome {
    Reader {
        device_id: String,
        exit: ReaderExit,
    },
    Verification {
        device_id: String,
        controller: Arc<Controller>,
        result: Result<ControllerStatus>,
    },
}

/// Task termination classification for shutdown handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskTermination {
    /// Task completed successfully.
    Success,
    /// Task returned an error.
    Error,
    /// Task was cancelled (expected during shutdown).
    Cancelled,
    /// Task panicked.
    Panic,
}

struct Attached {
    controller: Arc<Controller>,
    cancel: CancellationToken,
    /// Name the `Attached` event carried, if one was sent.
    announced_as: Option<String>,
}

/// Name under which a controller that lost a name conflict is reported.
///
/// # Examples
///
/// ```
/// use kegtap_hardware::manager::conflict_name;
///
/// assert_eq!(conflict_name("kegboard-cafe", "fake-2"), "kegboard-cafe@fake-2");
/// ```
pub fn conflict_name(name: &str, device_id: &str) -> String {
    format!("{name}@{device_id}")
}

/// Discovers, verifies and services the controllers of one transport.
pub struct ControllerManager {
    discovery: AnyDiscovery,
    config: ManagerConfig,
    registry: ControllerRegistry,
    events: mpsc::Sender<ControllerEvent>,
    signals: Arc<Signals>,
    attached: HashMap<String, Attached>,
    needs_permission: HashSet<String>,
    tasks: JoinSet<TaskOutcome>,
    last_scan: Option<Instant>,
}

impl ControllerManager {
    pub fn new(
        discovery: AnyDiscovery,
        config: ManagerConfig,
        registry: ControllerRegistry,
        events: mpsc::Sender<ControllerEvent>,
    ) -> Self {
        Self {
            discovery,
            config,
            registry,
            events,
            signals: Arc::new(Signals::default()),
            attached: HashMap::new(),
            needs_permission: HashSet::new(),
            tasks: JoinSet::new(),
            last_scan: None,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.discovery.kind()
    }

    /// Spawn the service loop.
    pub fn start(self) -> ControllerManagerHandle {
        let kind = self.kind();
        let signals = Arc::clone(&self.signals);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));

        ControllerManagerHandle {
            kind,
            signals,
            cancel,
            task,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let kind = self.kind();
        info!(transport = %kind, "Controller manager started");

        while !cancel.is_cancelled() {
            self.drain_tasks().await;

            let requested = self.signals.rescan.swap(false, Ordering::SeqCst);
            let due = self
                .last_scan
                .is_none_or(|last| last.elapsed() >= self.config.rescan_interval);
            if requested || due {
                self.rescan(&cancel).await;
            }

            if !self.service().await {
                let wake = Arc::clone(&self.signals.wake);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(self.config.idle_sleep) => {}
                }
            }
        }

        self.stop().await;
        info!(transport = %kind, "Controller manager stopped");
    }

    /// Apply finished reader and verification tasks.
    async fn drain_tasks(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            match joined {
                Ok(TaskOutcome::Reader { device_id, exit }) => {
                    debug!(device = %device_id, ?exit, "Reader finished");
                    self.remove(&device_id).await;
                }
                Ok(TaskOutcome::Verification {
                    device_id,
                    controller,
                    result,
                }) => self.finish_verification(&device_id, controller, result).await,
                Err(e) if e.is_panic() => error!(error = %e, "Controller task panicked"),
                Err(_) => {}
            }
        }
    }

    async fn finish_verification(
        &mut self,
        device_id: &str,
        controller: Arc<Controller>,
        result: Result<ControllerStatus>,
    ) {
        let current = self
            .attached
            .get_mut(device_id)
            .filter(|entry| Arc::ptr_eq(&entry.controller, &controller));

        let Some(entry) = current else {
            // Removed while verifying.
            self.registry.release(&controller.name(), &controller);
            return;
        };

        match result {
            Ok(status) => {
                let mut info = controller.info();
                if status == ControllerStatus::NameConflict {
                    info.name = conflict_name(&info.name, device_id);
                }
                if status == ControllerStatus::Ok {
                    info!(
                        controller = %info.name,
                        device = %device_id,
                        firmware = ?info.firmware_version,
                        "Controller verified"
                    );
                } else {
                    warn!(controller = %info.name, device = %device_id, %status, "Controller not usable");
                }
                entry.announced_as = Some(info.name.clone());
                let _ = self.events.send(ControllerEvent::Attached(info)).await;
            }
            Err(e) => {
                // The reader reports the closed transport and triggers removal.
                warn!(device = %device_id, error = %e, "Verification failed");
            }
        }
    }

    async fn rescan(&mut self, cancel: &CancellationToken) {
        self.last_scan = Some(Instant::now());
        let present = self.discovery.scan().await;

        for device_id in &present {
            if self.attached.contains_key(device_id) {
                continue;
            }
            match self.discovery.open(device_id).await {
                Ok(transport) => {
                    self.needs_permission.remove(device_id);
                    self.attach(transport, cancel);
                }
                Err(e) if e.is_permission_denied() => {
                    if self.needs_permission.insert(device_id.clone()) {
                        warn!(device = %device_id, "Device needs permission; will retry");
                    }
                }
                Err(e) => debug!(device = %device_id, error = %e, "Could not open device"),
            }
        }

        self.needs_permission.retain(|id| present.contains(id));
    }

    fn attach(&mut self, transport: crate::transport::Transport, cancel: &CancellationToken) {
        let device_id = transport.device_id.clone();
        info!(device = %device_id, transport = %transport.kind, "Device attached");

        let (controller, reader) = Controller::new(
            transport,
            Arc::clone(&self.signals.wake),
            self.config.output_lease,
            self.config.read_timeout,
        );
        let reader_cancel = cancel.child_token();

        let id = device_id.clone();
        let token = reader_cancel.clone();
        self.tasks.spawn(async move {
            let exit = reader.run(token).await;
            TaskOutcome::Reader { device_id: id, exit }
        });

        let id = device_id.clone();
        let verifying = Arc::clone(&controller);
        let registry = self.registry.clone();
        let config = self.config.clone();
        self.tasks.spawn(async move {
            let result = verify(&verifying, &registry, &config).await;
            TaskOutcome::Verification {
                device_id: id,
                controller: verifying,
                result,
            }
        });

        self.attached.insert(
            device_id,
            Attached {
                controller,
                cancel: reader_cancel,
                announced_as: None,
            },
        );
    }

    async fn remove(&mut self, device_id: &str) {
        let Some(entry) = self.attached.remove(device_id) else {
            return;
        };
        entry.cancel.cancel();
        entry.controller.close().await;
        self.registry
            .release(&entry.controller.name(), &entry.controller);

        let mut info = entry.controller.info();
        info!(controller = %info.name, device = %device_id, status = %info.status, "Controller removed");
        if let Some(name) = entry.announced_as {
            info.name = name;
            let _ = self.events.send(ControllerEvent::Removed(info)).await;
        }
    }

    /// Service every attached controller once. Returns whether any messages
    /// were handled.
    async fn service(&self) -> bool {
        let mut busy = false;

        for entry in self.attached.values() {
            let controller = &entry.controller;
            let forwarding = controller.status().forwards_events();

            if forwarding && let Err(e) = controller.refresh_outputs().await {
                warn!(controller = %controller.name(), error = %e, "Output refresh failed");
            }

            for message in controller.read_messages() {
                busy = true;
                if !forwarding {
                    debug!(
                        device = %controller.device_id(),
                        status = %controller.status(),
                        message = ?message,
                        "Dropping message from unverified controller"
                    );
                    continue;
                }
                controller.record_reading(&message);
                let event = ControllerEvent::Message {
                    controller: controller.name(),
                    message,
                };
                if self.events.send(event).await.is_err() {
                    debug!("Controller event receiver closed");
                }
            }
        }

        busy
    }

    async fn stop(&mut self) {
        for entry in self.attached.values() {
            entry.cancel.cancel();
        }
        self.tasks.abort_all();

        let mut error_count = 0;
        let mut panic_count = 0;
        while let Some(joined) = self.tasks.join_next().await {
            match Self::classify_task_result(joined) {
                TaskTermination::Success | TaskTermination::Cancelled => {}
                TaskTermination::Error => error_count += 1,
                TaskTermination::Panic => panic_count += 1,
            }
        }
        if error_count + panic_count > 0 {
            warn!(error_count, panic_count, "Controller tasks ended abnormally");
        }

        let device_ids: Vec<String> = self.attached.keys().cloned().collect();
        for device_id in device_ids {
            self.remove(&device_id).await;
        }
    }

    /// Classify the termination status of a task.
    fn classify_task_result(
        result: std::result::Result<TaskOutcome, tokio::task::JoinError>,
    ) -> TaskTermination {
        match result {
            Ok(TaskOutcome::Verification { result: Err(_), .. }) => TaskTermination::Error,
            Ok(_) => TaskTermination::Success,
            Err(e) if e.is_cancelled() => TaskTermination::Cancelled,
            Err(_) => TaskTermination::Panic,
        }
    }
}

/// Run the verification protocol against a freshly attached controller.
///
/// Pings until a Hello arrives, checks firmware, assigns a serial number to a
/// blank board and finally claims the derived name.
async fn verify(
    controller: &Arc<Controller>,
    registry: &ControllerRegistry,
    config: &ManagerConfig,
) -> Result<ControllerStatus> {
    let mut status = probe(controller, config).await?;

    if status == ControllerStatus::NeedSerialNumber {
        controller.set_status(ControllerStatus::NeedSerialNumber);
        let serial_number = generate_serial_number();
        info!(device = %controller.device_id(), %serial_number, "Assigning serial number");
        controller.set_serial_number(&serial_number).await?;
        status = probe(controller, config).await?;
    }

    if status == ControllerStatus::Ok && !registry.claim(controller) {
        warn!(
            controller = %controller.name(),
            device = %controller.device_id(),
            "Another controller already uses this name"
        );
        status = ControllerStatus::NameConflict;
    }

    controller.set_status(status);
    Ok(status)
}

/// One ping/Hello exchange, retried up to the configured attempts.
async fn probe(controller: &Controller, config: &ManagerConfig) -> Result<ControllerStatus> {
    for attempt in 1..=config.ping_attempts {
        let seen = controller.hello_count();
        controller.ping().await?;

        let answered = tokio::time::timeout(config.ping_wait, controller.wait_for_hello(seen))
            .await
            .is_ok();
        if !answered {
            debug!(device = %controller.device_id(), attempt, "No Hello yet");
            continue;
        }

        let firmware = controller.firmware_version().unwrap_or_default();
        if firmware < config.min_firmware_version {
            return Ok(ControllerStatus::NeedUpdate);
        }
        if controller.serial_number().is_empty() {
            return Ok(ControllerStatus::NeedSerialNumber);
        }
        return Ok(ControllerStatus::Ok);
    }

    Ok(ControllerStatus::Unresponsive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeDeviceConfig, FakeDiscovery};

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.rescan_interval, Duration::from_secs(5));
        assert_eq!(config.ping_attempts, 4);
        assert_eq!(config.ping_wait, Duration::from_millis(500));
        assert_eq!(config.min_firmware_version, 18);

        let config = config.with_min_firmware_version(20).with_ping_attempts(2);
        assert_eq!(config.min_firmware_version, 20);
        assert_eq!(config.ping_attempts, 2);
    }

    #[test]
    fn test_classify_task_result() {
        let ok = TaskOutcome::Reader {
            device_id: "a".into(),
            exit: ReaderExit::Closed,
        };
        assert_eq!(
            ControllerManager::classify_task_result(Ok(ok)),
            TaskTermination::Success
        );
    }

    #[tokio::test]
    async fn test_attach_and_shutdown_reports_removal() {
        let discovery = FakeDiscovery::new();
        let _board = discovery.plug(FakeDeviceConfig::default().with_serial_number("KB-0000-0000-0000BEEF"));

        let (tx, mut rx) = mpsc::channel(16);
        let registry = ControllerRegistry::new();
        let handle = ControllerManager::new(
            AnyDiscovery::Fake(discovery),
            ManagerConfig::default(),
            registry.clone(),
            tx,
        )
        .start();

        match rx.recv().await.unwrap() {
            ControllerEvent::Attached(info) => {
                assert_eq!(info.name, "kegboard-0000beef");
                assert_eq!(info.status, ControllerStatus::Ok);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(registry.get("kegboard-0000beef").is_some());

        handle.shutdown().await;
        assert!(matches!(rx.recv().await, Some(ControllerEvent::Removed(_))));
        assert!(registry.is_empty());
    }
}
