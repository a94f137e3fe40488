//! A single pour.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kegtap_core::{FlowSnapshot, Tap, TickSample};
use tokio::time::Instant;

use crate::error::{FlowError, Result};

#[derive(Debug)]
struct FlowState {
    username: String,
    ticks: u64,
    started: Instant,
    last_activity: Instant,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    shout: String,
    images: Vec<PathBuf>,
    tick_series: Vec<TickSample>,
    finished: bool,
}

/// One pour on one tap.
///
/// Shared as `Arc<Flow>`; every mutation fails with
/// [`FlowError::FlowFinished`] once the flow has been ended.
#[derive(Debug)]
pub struct Flow {
    id: u64,
    meter_name: String,
    tap: Option<Tap>,
    max_idle: Duration,
    state: Mutex<FlowState>,
}

impl Flow {
    pub(crate) fn new(id: u64, tap: Option<Tap>, meter_name: String, username: String, max_idle: Duration) -> Self {
        let now = Instant::now();
        let wall = Utc::now();
        Self {
            id,
            meter_name,
            tap,
            max_idle,
            state: Mutex::new(FlowState {
                username,
                ticks: 0,
                started: now,
                last_activity: now,
                started_at: wall,
                last_activity_at: wall,
                ended_at: None,
                shout: String::new(),
                images: Vec::new(),
                tick_series: Vec::new(),
                finished: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_live(&self) -> Result<MutexGuard<'_, FlowState>> {
        let state = self.lock();
        if state.finished {
            return Err(FlowError::finished(self.id));
        }
        Ok(state)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn meter_name(&self) -> &str {
        &self.meter_name
    }

    pub fn tap(&self) -> Option<&Tap> {
        self.tap.as_ref()
    }

    pub fn tap_id(&self) -> Option<u64> {
        self.tap.as_ref().map(|tap| tap.id)
    }

    pub fn max_idle(&self) -> Duration {
        self.max_idle
    }

    pub fn username(&self) -> String {
        self.lock().username.clone()
    }

    pub fn is_anonymous(&self) -> bool {
        self.lock().username.is_empty()
    }

    pub fn ticks(&self) -> u64 {
        self.lock().ticks
    }

    pub fn volume_ml(&self) -> f64 {
        self.tap
            .as_ref()
            .map_or(0.0, |tap| self.ticks() as f64 * tap.ml_per_tick)
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Apply a tick delta and mark activity.
    pub fn add_ticks(&self, delta: u64) -> Result<()> {
        let mut state = self.lock_live()?;
        let now = Instant::now();
        let offset_ms = now.duration_since(state.started).as_millis() as i64;
        state.ticks += delta;
        state.last_activity = now;
        state.last_activity_at = Utc::now();
        state.tick_series.push(TickSample { offset_ms, delta });
        Ok(())
    }

    pub fn set_username(&self, username: &str) -> Result<()> {
        self.lock_live()?.username = username.to_string();
        Ok(())
    }

    pub fn set_shout(&self, shout: &str) -> Result<()> {
        self.lock_live()?.shout = shout.to_string();
        Ok(())
    }

    pub fn add_image(&self, path: PathBuf) -> Result<()> {
        self.lock_live()?.images.push(path);
        Ok(())
    }

    /// Time since the last tick (or the start, before any tick).
    pub fn idle_time(&self) -> Duration {
        Instant::now().duration_since(self.lock().last_activity)
    }

    /// Whether the idle limit has been reached. A zero limit never expires.
    pub fn is_idle(&self) -> bool {
        !self.max_idle.is_zero() && self.idle_time() >= self.max_idle
    }

    /// Mark the flow finished. Fails if it already was.
    pub(crate) fn finish(&self) -> Result<()> {
        let mut state = self.lock_live()?;
        state.finished = true;
        state.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        let state = self.lock();
        FlowSnapshot {
            flow_id: self.id,
            meter_name: self.meter_name.clone(),
            tap: self.tap.clone(),
            username: state.username.clone(),
            ticks: state.ticks,
            started_at: state.started_at,
            last_activity_at: state.last_activity_at,
            ended_at: state.ended_at,
            max_idle_ms: self.max_idle.as_millis() as u64,
            shout: state.shout.clone(),
            images: state.images.clone(),
            tick_series: state.tick_series.clone(),
            finished: state.finished,
        }
    }
}
