//! Controller lifecycle for Kegboard hardware.
//!
//! This crate finds controller boards on serial, network and in-process fake
//! transports, verifies them, keeps their outputs asserted and republishes
//! what they report as typed events.
//!
//! # Layers
//!
//! - [`transport`]: byte pipes (blocking serial ports, async streams).
//! - [`controller`]: one board; decoded inbox, output leases, identity.
//! - [`discovery`]: per-transport device enumeration and opening.
//! - [`manager`]: the per-transport service loop and verification protocol.
//! - [`hardware`]: the facade that runs all managers and feeds the event bus.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use kegtap_core::backend::mock::MockBackend;
//! use kegtap_core::{AlertCenter, EventBus};
//! use kegtap_hardware::discovery::{AnyDiscovery, SerialConfig, SerialDiscovery};
//! use kegtap_hardware::{HardwareManager, ManagerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::new();
//!     let mut hardware = HardwareManager::new(
//!         Arc::new(MockBackend::new()),
//!         bus.clone(),
//!         AlertCenter::new(bus.clone()),
//!     );
//!     hardware.add_discovery(
//!         AnyDiscovery::Serial(SerialDiscovery::new(SerialConfig::default())),
//!         ManagerConfig::default(),
//!     );
//!
//!     hardware.start();
//!     let mut events = bus.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", event.kind());
//!     }
//!     hardware.stop().await;
//! }
//! ```

pub mod controller;
pub mod discovery;
pub mod error;
pub mod hardware;
pub mod manager;
pub mod mock;
pub mod registry;
pub mod transport;

pub use controller::{Controller, ControllerReader, name_from_serial};
pub use discovery::{AnyDiscovery, DeviceDiscovery, NetworkConfig, SerialConfig};
pub use error::{HardwareError, Result};
pub use hardware::HardwareManager;
pub use manager::{ControllerEvent, ControllerManager, ControllerManagerHandle, ManagerConfig};
pub use registry::ControllerRegistry;
