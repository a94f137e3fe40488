use std::time::Duration;

use kegtap_core::constants::{
    DEFAULT_MIN_POUR_VOLUME_ML, DEFAULT_SYNC_INTERVAL_MS, DEFAULT_SYNC_RETRY_MS,
    DEFAULT_THERMO_RECORD_INTERVAL_MS, SYNC_TICK_MS,
};

/// Timing and filtering of the sync loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Delay before the next cycle after a successful one.
    pub sync_interval: Duration,
    /// Delay before the next cycle after a failed one.
    pub retry_interval: Duration,
    /// Granularity at which the loop checks whether a cycle is due.
    pub tick: Duration,
    /// Pours below this volume are discarded.
    pub min_pour_volume_ml: f64,
    /// Minimum spacing of temperature records per sensor. Zero records every reading.
    pub thermo_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
            retry_interval: Duration::from_millis(DEFAULT_SYNC_RETRY_MS),
            tick: Duration::from_millis(SYNC_TICK_MS),
            min_pour_volume_ml: DEFAULT_MIN_POUR_VOLUME_ML,
            thermo_interval: Duration::from_millis(DEFAULT_THERMO_RECORD_INTERVAL_MS),
        }
    }
}

impl SyncConfig {
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_min_pour_volume_ml(mut self, volume_ml: f64) -> Self {
        self.min_pour_volume_ml = volume_ml;
        self
    }

    pub fn with_thermo_interval(mut self, interval: Duration) -> Self {
        self.thermo_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.retry_interval, Duration::from_secs(10));
        assert_eq!(config.tick, Duration::from_secs(1));
        assert_eq!(config.min_pour_volume_ml, 10.0);
    }

    #[test]
    fn test_builder() {
        let config = SyncConfig::default()
            .with_sync_interval(Duration::from_secs(5))
            .with_retry_interval(Duration::from_secs(1))
            .with_min_pour_volume_ml(0.0)
            .with_thermo_interval(Duration::ZERO);
        assert_eq!(config.sync_interval, Duration::from_secs(5));
        assert_eq!(config.retry_interval, Duration::from_secs(1));
        assert_eq!(config.min_pour_volume_ml, 0.0);
        assert!(config.thermo_interval.is_zero());
    }
}
