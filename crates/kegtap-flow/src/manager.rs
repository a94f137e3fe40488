//! Pour state machine.
//!
//! Each tap is either without a flow or has exactly one active [`Flow`].
//! Meter readings start and feed flows; an idle sweep ends flows that have
//! stopped moving; user activation takes over or replaces a tap's flow.
//!
//! ```text
//!   no flow ──ticks / activate──► active ──idle / end_flow──► completed
//!                                   │
//!                   activate(other user): end + start fresh
//! ```
//!
//! Observers see `start`, then any number of `update`s, then `update` and
//! `end`, always in that order for a given flow.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use kegtap_core::constants::{DEFAULT_MAX_IDLE_MS, IDLE_SWEEP_INTERVAL_MS};
use kegtap_core::{Event, EventBus, FlowSnapshot, Tap};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{FlowError, Result};
use crate::flow::Flow;
use crate::taps::TapManager;

/// Flow tracking settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    /// Idle time after which a flow ends; zero disables the timeout.
    pub max_idle: Duration,
    pub sweep_interval: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_millis(DEFAULT_MAX_IDLE_MS),
            sweep_interval: Duration::from_millis(IDLE_SWEEP_INTERVAL_MS),
        }
    }
}

impl FlowConfig {
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Observer of flow transitions.
///
/// Callbacks run on the thread that caused the transition, after the flow
/// manager has released its locks.
pub trait FlowListener: Send + Sync {
    fn flow_started(&self, _flow: &FlowSnapshot) {}
    fn flow_updated(&self, _flow: &FlowSnapshot) {}
    fn flow_ended(&self, _flow: &FlowSnapshot) {}
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    Start,
    Update,
    End,
}

#[derive(Debug, Default)]
struct FlowTable {
    active: HashMap<u64, Arc<Flow>>,
    /// Last cumulative reading per tap.
    last_ticks: HashMap<u64, u64>,
}

struct Inner {
    taps: TapManager,
    config: FlowConfig,
    bus: EventBus,
    table: Mutex<FlowTable>,
    listeners: Mutex<Vec<Arc<dyn FlowListener>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tracks pours on every tap.
#[derive(Clone)]
pub struct FlowManager {
    inner: Arc<Inner>,
}

impl FlowManager {
    pub fn new(taps: TapManager, bus: EventBus, config: FlowConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                taps,
                config,
                bus,
                table: Mutex::new(FlowTable::default()),
                listeners: Mutex::new(Vec::new()),
                sweeper: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn taps(&self) -> &TapManager {
        &self.inner.taps
    }

    pub fn config(&self) -> &FlowConfig {
        &self.inner.config
    }

    pub fn add_listener(&self, listener: Arc<dyn FlowListener>) {
        lock(&self.inner.listeners).push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn FlowListener>) {
        lock(&self.inner.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Every flow that has not ended, ordered by id.
    pub fn active_flows(&self) -> Vec<Arc<Flow>> {
        let mut flows: Vec<Arc<Flow>> = lock(&self.inner.table).active.values().cloned().collect();
        flows.sort_by_key(|f| f.id());
        flows
    }

    pub fn flow_for_tap(&self, tap_id: u64) -> Option<Arc<Flow>> {
        lock(&self.inner.table).active.get(&tap_id).cloned()
    }

    fn new_flow(&self, tap: &Tap, username: &str) -> Arc<Flow> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Flow::new(
            id,
            Some(tap.clone()),
            tap.meter_name.clone(),
            username.to_string(),
            self.inner.config.max_idle,
        ))
    }

    fn insert_flow(table: &mut FlowTable, tap_id: u64, flow: &Arc<Flow>) -> Result<()> {
        if table.active.contains_key(&tap_id) {
            return Err(FlowError::TapOccupied { tap_id });
        }
        table.active.insert(tap_id, Arc::clone(flow));
        Ok(())
    }

    /// Start a flow on an idle tap.
    pub fn start_flow(&self, tap_id: u64, username: &str) -> Result<Arc<Flow>> {
        let tap = self
            .inner
            .taps
            .tap(tap_id)
            .ok_or_else(|| FlowError::unknown_tap(tap_id))?;
        let flow = self.new_flow(&tap, username);
        Self::insert_flow(&mut lock(&self.inner.table), tap_id, &flow)?;
        self.flow_started(&flow);
        Ok(flow)
    }

    /// Apply a cumulative meter reading.
    ///
    /// Returns the flow the ticks went to, or `None` when the reading moved
    /// nothing (unbound meter, first reading, or no increase).
    pub fn handle_meter_activity(&self, meter_name: &str, ticks: u64) -> Result<Option<Arc<Flow>>> {
        let Some(tap) = self.inner.taps.tap_for_meter(meter_name) else {
            debug!(meter = meter_name, ticks, "Reading from meter without a tap");
            return Ok(None);
        };

        let (flow, started) = {
            let mut table = lock(&self.inner.table);
            let delta = match table.last_ticks.insert(tap.id, ticks) {
                Some(previous) => ticks.saturating_sub(previous),
                None => 0,
            };
            if delta == 0 {
                return Ok(None);
            }

            let (flow, started) = match table.active.get(&tap.id) {
                Some(flow) => (Arc::clone(flow), false),
                None => {
                    let flow = self.new_flow(&tap, "");
                    Self::insert_flow(&mut table, tap.id, &flow)?;
                    (flow, true)
                }
            };
            flow.add_ticks(delta)?;
            (flow, started)
        };

        if started {
            self.flow_started(&flow);
        }
        self.dispatch(Transition::Update, &flow.snapshot());
        Ok(Some(flow))
    }

    /// Bind `username` to the tap's pour.
    ///
    /// An anonymous flow is taken over; another user's flow is ended and a
    /// fresh one started; with no flow a pre-authenticated one is started.
    /// Repeating the call for the same user returns the same flow.
    pub fn activate_user_at_tap(&self, tap_id: u64, username: &str) -> Result<Arc<Flow>> {
        let tap = self
            .inner
            .taps
            .tap(tap_id)
            .ok_or_else(|| FlowError::unknown_tap(tap_id))?;

        let mut replaced = None;
        let (flow, started) = {
            let mut table = lock(&self.inner.table);
            match table.active.get(&tap_id).cloned() {
                Some(flow) if flow.username() == username => return Ok(flow),
                Some(flow) if flow.is_anonymous() => {
                    flow.set_username(username)?;
                    (flow, false)
                }
                Some(flow) => {
                    table.active.remove(&tap_id);
                    replaced = Some(flow);
                    let fresh = self.new_flow(&tap, username);
                    Self::insert_flow(&mut table, tap_id, &fresh)?;
                    (fresh, true)
                }
                None => {
                    let fresh = self.new_flow(&tap, username);
                    Self::insert_flow(&mut table, tap_id, &fresh)?;
                    (fresh, true)
                }
            }
        };

        if let Some(previous) = replaced {
            info!(tap = tap_id, flow = previous.id(), "Ending flow for a new user");
            self.finish(&previous)?;
        }
        if started {
            self.flow_started(&flow);
        } else {
            info!(tap = tap_id, flow = flow.id(), username, "User took over flow");
            self.dispatch(Transition::Update, &flow.snapshot());
        }
        Ok(flow)
    }

    /// End a flow and unbind it from its tap.
    pub fn end_flow(&self, flow: &Arc<Flow>) -> Result<()> {
        if let Some(tap_id) = flow.tap_id() {
            let mut table = lock(&self.inner.table);
            if table
                .active
                .get(&tap_id)
                .is_some_and(|current| Arc::ptr_eq(current, flow))
            {
                table.active.remove(&tap_id);
            }
        }
        self.finish(flow)
    }

    pub fn set_shout(&self, flow: &Arc<Flow>, shout: &str) -> Result<()> {
        flow.set_shout(shout)?;
        self.dispatch(Transition::Update, &flow.snapshot());
        Ok(())
    }

    pub fn add_image(&self, flow: &Arc<Flow>, path: PathBuf) -> Result<()> {
        flow.add_image(path)?;
        self.dispatch(Transition::Update, &flow.snapshot());
        Ok(())
    }

    /// End every flow whose idle limit has passed. Returns how many ended.
    pub fn sweep_idle(&self) -> usize {
        let idle: Vec<Arc<Flow>> = {
            let mut table = lock(&self.inner.table);
            let ids: Vec<u64> = table
                .active
                .iter()
                .filter(|(_, flow)| flow.is_idle())
                .map(|(tap_id, _)| *tap_id)
                .collect();
            ids.iter().filter_map(|id| table.active.remove(id)).collect()
        };

        for flow in &idle {
            info!(flow = flow.id(), idle_ms = flow.idle_time().as_millis() as u64, "Flow idle, ending");
            if let Err(e) = self.finish(flow) {
                debug!(error = %e, "Idle flow was already finished");
            }
        }
        idle.len()
    }

    /// End every active flow and stop the idle sweep.
    pub fn stop(&self) {
        if let Some(sweeper) = lock(&self.inner.sweeper).take() {
            sweeper.abort();
        }
        let flows: Vec<Arc<Flow>> = lock(&self.inner.table).active.drain().map(|(_, f)| f).collect();
        for flow in flows {
            if let Err(e) = self.finish(&flow) {
                debug!(error = %e, "Flow was already finished");
            }
        }
    }

    fn finish(&self, flow: &Arc<Flow>) -> Result<()> {
        flow.finish()?;
        let snapshot = flow.snapshot();
        info!(
            flow = snapshot.flow_id,
            meter = %snapshot.meter_name,
            ticks = snapshot.ticks,
            volume_ml = snapshot.volume_ml(),
            username = %snapshot.username,
            "Flow ended"
        );
        self.dispatch(Transition::Update, &snapshot);
        self.dispatch(Transition::End, &snapshot);
        Ok(())
    }

    fn flow_started(&self, flow: &Arc<Flow>) {
        info!(flow = flow.id(), meter = flow.meter_name(), "Flow started");
        self.dispatch(Transition::Start, &flow.snapshot());
        self.ensure_sweeper();
    }

    fn dispatch(&self, transition: Transition, snapshot: &FlowSnapshot) {
        let listeners: Vec<Arc<dyn FlowListener>> = lock(&self.inner.listeners).clone();
        for listener in &listeners {
            match transition {
                Transition::Start => listener.flow_started(snapshot),
                Transition::Update => listener.flow_updated(snapshot),
                Transition::End => listener.flow_ended(snapshot),
            }
        }

        let event = match transition {
            Transition::Start => Event::FlowStart(snapshot.clone()),
            Transition::Update => Event::FlowUpdate(snapshot.clone()),
            Transition::End => Event::FlowEnd(snapshot.clone()),
        };
        self.inner.bus.publish(event);
    }

    /// Start the idle sweep if it is not running.
    ///
    /// The sweep exits on its own once no flow is active.
    fn ensure_sweeper(&self) {
        let mut slot = lock(&self.inner.sweeper);
        if slot.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime; idle sweep disabled");
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        *slot = Some(runtime.spawn(sweep_loop(weak, period)));
    }
}

async fn sweep_loop(inner: Weak<Inner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let manager = FlowManager { inner };
        manager.sweep_idle();

        let mut slot = lock(&manager.inner.sweeper);
        if lock(&manager.inner.table).active.is_empty() {
            debug!("No active flows; idle sweep stopping");
            *slot = None;
            return;
        }
    }
}

impl std::fmt::Debug for FlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowManager")
            .field("config", &self.inner.config)
            .field("active", &lock(&self.inner.table).active.len())
            .finish_non_exhaustive()
    }
}
