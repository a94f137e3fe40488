use std::time::Duration;

use kegtap_core::constants::OUTPUT_REFRESH_INTERVAL_MS;
use kegtap_flow::FlowConfig;
use kegtap_hardware::{ManagerConfig, NetworkConfig, SerialConfig};
use kegtap_storage::DatabaseConfig;
use kegtap_sync::SyncConfig;

/// Settings for every component the [`Core`](crate::Core) builds.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database: DatabaseConfig,
    /// USB-serial controllers; `None` disables the transport.
    pub serial: Option<SerialConfig>,
    /// Network controllers; `None` disables the transport.
    pub network: Option<NetworkConfig>,
    pub manager: ManagerConfig,
    pub flow: FlowConfig,
    pub sync: SyncConfig,
    /// How often outputs of authenticated pours are re-asserted.
    pub keepalive_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            serial: Some(SerialConfig::default()),
            network: None,
            manager: ManagerConfig::default(),
            flow: FlowConfig::default(),
            sync: SyncConfig::default(),
            keepalive_interval: Duration::from_millis(OUTPUT_REFRESH_INTERVAL_MS),
        }
    }
}

impl CoreConfig {
    pub fn with_database(mut self, database: DatabaseConfig) -> Self {
        self.database = database;
        self
    }

    pub fn with_serial(mut self, serial: Option<SerialConfig>) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_network(mut self, network: Option<NetworkConfig>) -> Self {
        self.network = network;
        self
    }

    pub fn with_manager(mut self, manager: ManagerConfig) -> Self {
        self.manager = manager;
        self
    }

    pub fn with_flow(mut self, flow: FlowConfig) -> Self {
        self.flow = flow;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}
