//! Wiring for the `kegtap` binary.
//!
//! [`Core`] builds the event bus, alert center, hardware manager, flow
//! manager and sync manager from one [`CoreConfig`] and connects them.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kegtap_cli::{Core, CoreConfig};
//! use kegtap_core::backend::mock::MockBackend;
//!
//! # async fn run() -> kegtap_cli::Result<()> {
//! let core = Core::new(CoreConfig::default(), Arc::new(MockBackend::new())).await?;
//! core.start().await;
//! // ...
//! core.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;

pub use crate::config::CoreConfig;
pub use crate::engine::Core;
pub use crate::error::{CoreError, Result};
