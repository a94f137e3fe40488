//! Device discovery, one implementation per transport.
//!
//! A discovery source answers two questions for its controller manager:
//! which device ids are present right now, and how to open one of them.
//! Sources are wrapped in [`AnyDiscovery`] so the manager stays a concrete
//! type that can be moved onto a task.

#![allow(async_fn_in_trait)]

use std::path::Path;
use std::time::Duration;

use kegtap_core::TransportKind;
use kegtap_core::constants::{
    DEFAULT_BAUD_RATE, DEFAULT_CONNECT_TIMEOUT_MS, SERIAL_PORT_TIMEOUT_MS,
};
use kegtap_protocol::WireFormat;
use serialport::{DataBits, FlowControl, Parity, SerialPortType, StopBits};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{HardwareError, Result};
use crate::mock::FakeDiscovery;
use crate::transport::Transport;

/// USB vendor ids of boards known to run kegboard firmware.
pub const DEFAULT_VENDOR_IDS: [u16; 3] = [0x0403, 0x2341, 0x16c0];

/// A source of controller devices.
pub trait DeviceDiscovery {
    /// Transport this source produces.
    fn kind(&self) -> TransportKind;

    /// Ids of the devices currently present.
    async fn scan(&mut self) -> Vec<String>;

    /// Open one device returned by [`scan`](Self::scan).
    async fn open(&mut self, device_id: &str) -> Result<Transport>;
}

/// Serial discovery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Ports opened whether or not enumeration reports them.
    pub ports: Vec<String>,
    /// USB vendor ids picked up from enumeration.
    pub vendor_ids: Vec<u16>,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            vendor_ids: DEFAULT_VENDOR_IDS.to_vec(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl SerialConfig {
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.ports.push(port.into());
        self
    }

    pub fn with_vendor_ids(mut self, vendor_ids: Vec<u16>) -> Self {
        self.vendor_ids = vendor_ids;
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

/// USB-serial boards.
#[derive(Debug, Clone, Default)]
pub struct SerialDiscovery {
    config: SerialConfig,
}

impl SerialDiscovery {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }

    fn matches(&self, port_type: &SerialPortType) -> bool {
        match port_type {
            SerialPortType::UsbPort(info) => self.config.vendor_ids.contains(&info.vid),
            _ => false,
        }
    }
}

impl DeviceDiscovery for SerialDiscovery {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn scan(&mut self) -> Vec<String> {
        let mut found: Vec<String> = self
            .config
            .ports
            .iter()
            .filter(|p| Path::new(p.as_str()).exists())
            .cloned()
            .collect();

        match serialport::available_ports() {
            Ok(ports) => {
                for port in ports {
                    if self.matches(&port.port_type) && !found.contains(&port.port_name) {
                        found.push(port.port_name);
                    }
                }
            }
            Err(e) => debug!(error = %e, "Serial enumeration failed"),
        }

        found
    }

    async fn open(&mut self, device_id: &str) -> Result<Transport> {
        let path = device_id.to_string();
        let baud_rate = self.config.baud_rate;

        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(&path, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_millis(SERIAL_PORT_TIMEOUT_MS))
                .open()
        })
        .await
        .map_err(|e| HardwareError::communication(format!("serial open panicked: {e}")))?;

        match opened {
            Ok(port) => Transport::from_serial(device_id, port),
            Err(e) => {
                let error = HardwareError::from(e);
                if error.is_permission_denied() {
                    Err(HardwareError::permission_denied(device_id))
                } else {
                    Err(error)
                }
            }
        }
    }
}

/// Network discovery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// `host:port` addresses of network controllers.
    pub addresses: Vec<String>,
    pub connect_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

impl NetworkConfig {
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Controllers reachable over TCP, speaking the text line format.
///
/// Every configured address is reported by `scan`; whether the device is
/// actually present is decided by the connection attempt in `open`.
#[derive(Debug, Clone, Default)]
pub struct NetworkDiscovery {
    config: NetworkConfig,
}

impl NetworkDiscovery {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }
}

impl DeviceDiscovery for NetworkDiscovery {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    async fn scan(&mut self) -> Vec<String> {
        self.config.addresses.clone()
    }

    async fn open(&mut self, device_id: &str) -> Result<Transport> {
        let timeout = self.config.connect_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(device_id))
            .await
            .map_err(|_| HardwareError::timeout(timeout.as_millis() as u64))??;
        stream.set_nodelay(true)?;
        Ok(Transport::from_stream(
            TransportKind::Network,
            device_id,
            WireFormat::Text,
            stream,
        ))
    }
}

/// Any supported discovery source.
#[derive(Debug, Clone)]
pub enum AnyDiscovery {
    Serial(SerialDiscovery),
    Network(NetworkDiscovery),
    Fake(FakeDiscovery),
}

impl DeviceDiscovery for AnyDiscovery {
    fn kind(&self) -> TransportKind {
        match self {
            AnyDiscovery::Serial(d) => d.kind(),
            AnyDiscovery::Network(d) => d.kind(),
            AnyDiscovery::Fake(d) => d.kind(),
        }
    }

    async fn scan(&mut self) -> Vec<String> {
        match self {
            AnyDiscovery::Serial(d) => d.scan().await,
            AnyDiscovery::Network(d) => d.scan().await,
            AnyDiscovery::Fake(d) => d.scan().await,
        }
    }

    async fn open(&mut self, device_id: &str) -> Result<Transport> {
        match self {
            AnyDiscovery::Serial(d) => d.open(device_id).await,
            AnyDiscovery::Network(d) => d.open(device_id).await,
            AnyDiscovery::Fake(d) => d.open(device_id).await,
        }
    }
}

impl From<SerialDiscovery> for AnyDiscovery {
    fn from(d: SerialDiscovery) -> Self {
        AnyDiscovery::Serial(d)
    }
}

impl From<NetworkDiscovery> for AnyDiscovery {
    fn from(d: NetworkDiscovery) -> Self {
        AnyDiscovery::Network(d)
    }
}

impl From<FakeDiscovery> for AnyDiscovery {
    fn from(d: FakeDiscovery) -> Self {
        AnyDiscovery::Fake(d)
    }
}
