//! In-process fake kegboards.
//!
//! [`FakeDiscovery::plug`] creates a device task that answers pings with a
//! Hello, stores assigned serial numbers and records output commands. The
//! returned [`FakeDeviceHandle`] injects readings and unplugs the device.
//!
//! # Examples
//!
//! ```
//! use kegtap_hardware::discovery::DeviceDiscovery;
//! use kegtap_hardware::mock::{FakeDeviceConfig, FakeDiscovery};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut discovery = FakeDiscovery::new();
//!     let _board = discovery.plug(FakeDeviceConfig::default().with_serial_number("KB-0000-0000-00C0FFEE"));
//!
//!     assert_eq!(discovery.scan().await.len(), 1);
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{SinkExt, StreamExt};
use kegtap_core::TransportKind;
use kegtap_protocol::{KegboardCodec, Message, WireFormat};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::discovery::DeviceDiscovery;
use crate::error::{HardwareError, Result};
use crate::transport::Transport;

const PIPE_CAPACITY: usize = 4096;

static NEXT_DEVICE: AtomicU64 = AtomicU64::new(0);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Behaviour of a fake board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeDeviceConfig {
    pub firmware_version: u16,
    /// Empty means the board asks for a serial number.
    pub serial_number: String,
    /// Whether pings are answered.
    pub responsive: bool,
    /// Whether `SetSerialNumber` is honoured.
    pub accepts_serial: bool,
    /// Opening fails with a permission error until granted.
    pub permission_denied: bool,
}

impl Default for FakeDeviceConfig {
    fn default() -> Self {
        Self {
            firmware_version: 18,
            serial_number: String::new(),
            responsive: true,
            accepts_serial: true,
            permission_denied: false,
        }
    }
}

impl FakeDeviceConfig {
    pub fn with_firmware_version(mut self, version: u16) -> Self {
        self.firmware_version = version;
        self
    }

    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = serial_number.into();
        self
    }

    pub fn with_responsive(mut self, responsive: bool) -> Self {
        self.responsive = responsive;
        self
    }

    pub fn with_accepts_serial(mut self, accepts: bool) -> Self {
        self.accepts_serial = accepts;
        self
    }

    pub fn with_permission_denied(mut self, denied: bool) -> Self {
        self.permission_denied = denied;
        self
    }
}

#[derive(Debug)]
struct DeviceState {
    firmware_version: u16,
    serial_number: String,
    responsive: bool,
    accepts_serial: bool,
    outputs: BTreeMap<u8, bool>,
    output_commands: Vec<(u8, bool)>,
    pings: usize,
}

#[derive(Debug)]
struct Slot {
    host: Option<DuplexStream>,
    permission_denied: bool,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

/// Discovery source for fake boards.
#[derive(Debug, Clone, Default)]
pub struct FakeDiscovery {
    slots: Slots,
}

impl FakeDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a new fake board and start its device task.
    ///
    /// The board stays plugged while the returned handle is alive.
    pub fn plug(&self, config: FakeDeviceConfig) -> FakeDeviceHandle {
        let device_id = format!("fake-{}", NEXT_DEVICE.fetch_add(1, Ordering::Relaxed));
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        let state = Arc::new(Mutex::new(DeviceState {
            firmware_version: config.firmware_version,
            serial_number: config.serial_number,
            responsive: config.responsive,
            accepts_serial: config.accepts_serial,
            outputs: BTreeMap::new(),
            output_commands: Vec::new(),
            pings: 0,
        }));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        lock(&self.slots).insert(
            device_id.clone(),
            Slot {
                host: Some(host),
                permission_denied: config.permission_denied,
            },
        );

        tokio::spawn(run_device(
            device_id.clone(),
            Framed::new(device, KegboardCodec::new()),
            Arc::clone(&state),
            commands_rx,
        ));
        debug!(device = %device_id, "Fake board plugged");

        FakeDeviceHandle {
            device_id,
            state,
            commands: Some(commands_tx),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Number of plugged boards.
    pub fn plugged(&self) -> usize {
        lock(&self.slots).len()
    }
}

impl DeviceDiscovery for FakeDiscovery {
    fn kind(&self) -> TransportKind {
        TransportKind::Fake
    }

    async fn scan(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.slots).keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn open(&mut self, device_id: &str) -> Result<Transport> {
        let mut slots = lock(&self.slots);
        let slot = slots
            .get_mut(device_id)
            .ok_or_else(|| HardwareError::disconnected(device_id))?;
        if slot.permission_denied {
            return Err(HardwareError::permission_denied(device_id));
        }
        let host = slot
            .host
            .take()
            .ok_or_else(|| HardwareError::communication(format!("{device_id} is already open")))?;
        Ok(Transport::from_stream(
            TransportKind::Fake,
            device_id,
            WireFormat::Binary,
            host,
        ))
    }
}

async fn run_device(
    device_id: String,
    mut framed: Framed<DuplexStream, KegboardCodec>,
    state: Arc<Mutex<DeviceState>>,
    mut commands: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(message) => {
                    if framed.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = framed.next() => match frame {
                Some(Ok(message)) => {
                    if let Some(reply) = respond(&state, message)
                        && framed.send(reply).await.is_err()
                    {
                        break;
                    }
                }
                Some(Err(e)) => debug!(device = %device_id, error = %e, "Fake board ignored a frame"),
                None => break,
            },
        }
    }
    debug!(device = %device_id, "Fake board stopped");
}

fn respond(state: &Mutex<DeviceState>, message: Message) -> Option<Message> {
    let mut state = lock(state);
    match message {
        Message::Ping => {
            state.pings += 1;
            state.responsive.then(|| Message::Hello {
                firmware_version: state.firmware_version,
                protocol_version: 1,
                serial_number: state.serial_number.clone(),
            })
        }
        Message::SetSerialNumber { serial_number } => {
            if state.accepts_serial && state.serial_number.is_empty() {
                state.serial_number = serial_number;
            }
            None
        }
        Message::SetOutput { output_id, enabled } => {
            state.outputs.insert(output_id, enabled);
            state.output_commands.push((output_id, enabled));
            None
        }
        _ => None,
    }
}

/// Control handle for one fake board.
#[derive(Debug)]
pub struct FakeDeviceHandle {
    device_id: String,
    state: Arc<Mutex<DeviceState>>,
    commands: Option<mpsc::UnboundedSender<Message>>,
    slots: Slots,
}

impl FakeDeviceHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn emit(&self, message: Message) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(message);
        }
    }

    /// Report a cumulative tick count for a meter port.
    pub fn send_meter(&self, meter_name: &str, ticks: u32) {
        self.emit(Message::MeterStatus {
            meter_name: meter_name.to_string(),
            ticks,
        });
    }

    pub fn send_thermo(&self, sensor_name: &str, celsius: f64) {
        self.emit(Message::TemperatureReading {
            sensor_name: sensor_name.to_string(),
            micro_celsius: (celsius * 1_000_000.0).round() as i32,
        });
    }

    /// Report an auth token arriving at or leaving a reader.
    pub fn send_token(&self, device: &str, token: &str, present: bool) {
        self.emit(Message::AuthToken {
            device: device.to_string(),
            token: token.to_string(),
            present,
        });
    }

    /// Send an unsolicited Hello, as firmware does after a reset.
    pub fn send_hello(&self) {
        let hello = {
            let state = lock(&self.state);
            Message::Hello {
                firmware_version: state.firmware_version,
                protocol_version: 1,
                serial_number: state.serial_number.clone(),
            }
        };
        self.emit(hello);
    }

    pub fn serial_number(&self) -> String {
        lock(&self.state).serial_number.clone()
    }

    /// Last commanded state of each output.
    pub fn outputs(&self) -> BTreeMap<u8, bool> {
        lock(&self.state).outputs.clone()
    }

    /// Every `SetOutput` received, in order.
    pub fn output_commands(&self) -> Vec<(u8, bool)> {
        lock(&self.state).output_commands.clone()
    }

    pub fn pings(&self) -> usize {
        lock(&self.state).pings
    }

    pub fn set_responsive(&self, responsive: bool) {
        lock(&self.state).responsive = responsive;
    }

    /// Allow a board plugged with `permission_denied` to be opened.
    pub fn grant_permission(&self) {
        if let Some(slot) = lock(&self.slots).get_mut(&self.device_id) {
            slot.permission_denied = false;
        }
    }

    /// Unplug the board; the host side observes end-of-file.
    pub fn unplug(mut self) {
        self.disconnect();
    }

    fn disconnect(&mut self) {
        lock(&self.slots).remove(&self.device_id);
        self.commands = None;
    }
}

impl Drop for FakeDeviceHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}
