//! Simulated controllers for testing and development.
//!
//! Fake boards run the device side of the binary protocol on an in-process
//! pipe, so the whole attach, verify and service path can be exercised
//! without physical hardware.

pub mod fake;

pub use fake::{FakeDeviceConfig, FakeDeviceHandle, FakeDiscovery};
