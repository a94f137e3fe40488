//! Name registry shared by every controller manager.
//!
//! Controller names must be unique across all transports. A controller
//! claims its derived name once verified; a second board deriving the same
//! name is refused and ends up in `NameConflict`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::controller::Controller;

/// Active controllers, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ControllerRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<Controller>>>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Controller>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `controller`'s current name.
    ///
    /// Succeeds when the name is free or already held by the same controller.
    pub fn claim(&self, controller: &Arc<Controller>) -> bool {
        let name = controller.name();
        let mut map = self.lock();
        match map.get(&name) {
            Some(holder) if Arc::ptr_eq(holder, controller) => true,
            Some(_) => false,
            None => {
                map.insert(name, Arc::clone(controller));
                true
            }
        }
    }

    /// Release `name` if `controller` holds it.
    pub fn release(&self, name: &str, controller: &Arc<Controller>) -> bool {
        let mut map = self.lock();
        match map.get(name) {
            Some(holder) if Arc::ptr_eq(holder, controller) => {
                map.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Controller>> {
        self.lock().get(name).cloned()
    }

    /// Snapshot of every registered controller, sorted by name.
    pub fn controllers(&self) -> Vec<Arc<Controller>> {
        let map = self.lock();
        let mut names: Vec<&String> = map.keys().collect();
        names.sort();
        names.into_iter().filter_map(|n| map.get(n).cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
