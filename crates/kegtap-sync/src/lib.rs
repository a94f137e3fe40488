//! Reliable delivery of pours and temperature readings to the backend,
//! plus the periodic pull of backend state.
//!
//! Records are tried live first and fall back to the durable queue in
//! `kegtap-storage`; the sync loop drains that queue oldest first and
//! republishes backend changes on the event bus.

pub mod config;
pub mod error;
pub mod manager;
mod poll;
pub mod records;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use manager::{FlushOutcome, SyncManager, SyncReport};
pub use records::drink_from_flow;
