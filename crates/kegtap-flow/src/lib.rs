//! Pour tracking for kegtap.
//!
//! [`TapManager`] knows which meter and toggle belong to each tap;
//! [`FlowManager`] turns cumulative meter readings into [`Flow`]s, hands
//! taps over between users and ends pours that have gone idle.
//!
//! # Examples
//!
//! ```
//! use kegtap_core::{EventBus, Tap};
//! use kegtap_flow::{FlowConfig, FlowManager, TapManager};
//!
//! let taps = TapManager::new();
//! taps.update_taps(vec![Tap::new(1, "Tap 1", "kegboard-ab12.flow0").with_ml_per_tick(0.5)]);
//!
//! let flows = FlowManager::new(taps, EventBus::new(), FlowConfig::default());
//! flows.handle_meter_activity("kegboard-ab12.flow0", 1000).unwrap();
//! let flow = flows.handle_meter_activity("kegboard-ab12.flow0", 1100).unwrap().unwrap();
//! assert_eq!(flow.volume_ml(), 50.0);
//! ```

pub mod error;
pub mod flow;
pub mod manager;
pub mod taps;

pub use error::{FlowError, Result};
pub use flow::Flow;
pub use manager::{FlowConfig, FlowListener, FlowManager};
pub use taps::TapManager;
