pub mod alerts;
pub mod backend;
pub mod constants;
pub mod error;
pub mod events;
pub mod types;

pub use alerts::{Alert, AlertCenter, AlertSeverity};
pub use backend::{Backend, BackendError, BackendResult};
pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
