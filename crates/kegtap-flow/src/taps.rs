//! Tap registry.
//!
//! Maps taps to their flow meter and optional output toggle. The tap list
//! comes from the backend; visibility is local state and survives refreshes.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kegtap_core::Tap;
use tracing::debug;

/// Shared, cloneable tap registry.
#[derive(Debug, Clone, Default)]
pub struct TapManager {
    taps: Arc<RwLock<BTreeMap<u64, Tap>>>,
}

impl TapManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<u64, Tap>> {
        self.taps.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, Tap>> {
        self.taps.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the tap list. Returns whether anything changed.
    ///
    /// Taps that were already known keep their local visibility.
    pub fn update_taps(&self, taps: Vec<Tap>) -> bool {
        let mut current = self.write();
        let mut next = BTreeMap::new();
        for mut tap in taps {
            if let Some(existing) = current.get(&tap.id) {
                tap.visible = existing.visible;
            }
            next.insert(tap.id, tap);
        }

        if next == *current {
            return false;
        }
        debug!(count = next.len(), "Tap list changed");
        *current = next;
        true
    }

    pub fn tap(&self, tap_id: u64) -> Option<Tap> {
        self.read().get(&tap_id).cloned()
    }

    /// Tap bound to a full meter name.
    pub fn tap_for_meter(&self, meter_name: &str) -> Option<Tap> {
        self.read()
            .values()
            .find(|tap| tap.meter_name == meter_name)
            .cloned()
    }

    /// Tap bound to a full toggle name.
    pub fn tap_for_toggle(&self, toggle_name: &str) -> Option<Tap> {
        self.read()
            .values()
            .find(|tap| tap.toggle_name.as_deref() == Some(toggle_name))
            .cloned()
    }

    /// All taps, ordered by id.
    pub fn taps(&self) -> Vec<Tap> {
        self.read().values().cloned().collect()
    }

    pub fn visible_taps(&self) -> Vec<Tap> {
        self.read().values().filter(|tap| tap.visible).cloned().collect()
    }

    /// Show or hide a tap. Returns `false` for an unknown tap.
    pub fn set_visible(&self, tap_id: u64, visible: bool) -> bool {
        match self.write().get_mut(&tap_id) {
            Some(tap) => {
                tap.visible = visible;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taps() -> Vec<Tap> {
        vec![
            Tap::new(2, "Tap 2", "kegboard.flow1").with_toggle("kegboard.relay1"),
            Tap::new(1, "Tap 1", "kegboard.flow0").with_toggle("kegboard.relay0"),
        ]
    }

    #[test]
    fn test_update_reports_changes() {
        let manager = TapManager::new();
        assert!(manager.update_taps(taps()));
        assert!(!manager.update_taps(taps()));

        let mut renamed = taps();
        renamed[0].name = "IPA".into();
        assert!(manager.update_taps(renamed));
        assert_eq!(manager.tap(2).unwrap().name, "IPA");
    }

    #[test]
    fn test_lookups() {
        let manager = TapManager::new();
        manager.update_taps(taps());

        assert_eq!(manager.tap_for_meter("kegboard.flow1").unwrap().id, 2);
        assert_eq!(manager.tap_for_toggle("kegboard.relay0").unwrap().id, 1);
        assert!(manager.tap_for_meter("kegboard.flow7").is_none());
        let ids: Vec<u64> = manager.taps().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_visibility_survives_refresh() {
        let manager = TapManager::new();
        manager.update_taps(taps());

        assert!(manager.set_visible(1, false));
        assert!(!manager.set_visible(9, false));
        assert_eq!(manager.visible_taps().len(), 1);

        assert!(!manager.update_taps(taps()));
        assert!(!manager.tap(1).unwrap().visible);
    }

    #[test]
    fn test_removed_taps_disappear() {
        let manager = TapManager::new();
        manager.update_taps(taps());
        assert!(manager.update_taps(vec![Tap::new(1, "Tap 1", "kegboard.flow0")]));
        assert_eq!(manager.len(), 1);
        assert!(manager.tap(2).is_none());
    }
}
