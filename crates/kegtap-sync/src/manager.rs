//! Outbound record delivery and backend polling.
//!
//! Producers hand records to [`SyncManager`] without waiting; the sync task
//! tries to deliver each one live and writes it to the durable queue only
//! when the backend cannot take it right now.
//!
//! ```text
//!   record_*_async ──► command channel ──► live post ──ok──► done
//!                                              │
//!                                       transient failure
//!                                              ▼
//!                                       pending_records ──► sync_now (oldest first)
//! ```
//!
//! A cycle runs when one was requested or when the interval chosen by the
//! previous cycle has elapsed: the relaxed interval after success, the
//! retry interval after any failure.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use kegtap_core::backend::{RecordDrinkRequest, RecordTemperatureRequest};
use kegtap_core::constants::ALERT_BACKEND_UNREACHABLE;
use kegtap_core::{Alert, AlertCenter, AlertSeverity, Backend, BackendResult, EventBus};
use kegtap_storage::{PendingRecord, PendingRecordRepository, SqlitePendingRecordRepository};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::poll::RemoteSnapshot;

/// What happened to the oldest queued row during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The queue was empty.
    Empty,
    /// The backend accepted the row and it was deleted.
    Delivered,
    /// The row could never succeed and was deleted.
    Dropped,
}

/// Result of one successful [`SyncManager::sync_now`] cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub flush: FlushOutcome,
    /// Rows still queued after the flush.
    pub remaining: i64,
    /// Events published from the backend pull.
    pub published: usize,
}

#[derive(Debug)]
struct CycleState {
    snapshot: RemoteSnapshot,
    /// `None` until the first cycle, which is due immediately.
    next_sync: Option<Instant>,
}

struct Shared<B> {
    backend: Arc<B>,
    queue: SqlitePendingRecordRepository,
    bus: EventBus,
    alerts: AlertCenter,
    config: SyncConfig,
    cycle: tokio::sync::Mutex<CycleState>,
    requested: AtomicBool,
    wake: Notify,
    last_thermo: Mutex<HashMap<String, Instant>>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Durable, retrying delivery of pours and temperature readings.
pub struct SyncManager<B: Backend> {
    shared: Arc<Shared<B>>,
    commands: mpsc::UnboundedSender<PendingRecord>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<PendingRecord>>>,
    running: Mutex<Option<Running>>,
    stopped: AtomicBool,
}

impl<B: Backend> SyncManager<B> {
    pub fn new(
        backend: Arc<B>,
        queue: SqlitePendingRecordRepository,
        bus: EventBus,
        alerts: AlertCenter,
        config: SyncConfig,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                backend,
                queue,
                bus,
                alerts,
                config,
                cycle: tokio::sync::Mutex::new(CycleState {
                    snapshot: RemoteSnapshot::default(),
                    next_sync: None,
                }),
                requested: AtomicBool::new(false),
                wake: Notify::new(),
                last_thermo: Mutex::new(HashMap::new()),
            }),
            commands,
            receiver: Mutex::new(Some(receiver)),
            running: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Spawn the sync task. Records handed over before this are kept.
    pub fn start(&self) {
        let Some(receiver) = lock(&self.receiver).take() else {
            warn!("Sync manager already started");
            return;
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(self.shared.clone(), receiver, cancel.clone()));
        *lock(&self.running) = Some(Running { cancel, task });
        info!(
            sync_interval = ?self.shared.config.sync_interval,
            retry_interval = ?self.shared.config.retry_interval,
            "Sync manager started"
        );
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Stop the sync task. Records still waiting for a live attempt are
    /// written to the durable queue.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let running = lock(&self.running).take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.task.await
                && e.is_panic()
            {
                error!(error = %e, "Sync task panicked");
            }
            info!("Sync manager stopped");
        }
    }

    /// Queue a finished pour for delivery.
    pub fn record_drink_async(&self, request: RecordDrinkRequest) -> Result<()> {
        self.submit(PendingRecord::Pour(request))
    }

    /// Queue a temperature reading, at most one per sensor per `thermo_interval`.
    ///
    /// Returns `Ok(false)` when the reading was skipped.
    pub fn record_temperature_async(&self, request: RecordTemperatureRequest) -> Result<bool> {
        let interval = self.shared.config.thermo_interval;
        if !interval.is_zero() {
            let now = Instant::now();
            let mut last = lock(&self.shared.last_thermo);
            if let Some(previous) = last.get(&request.sensor_name)
                && now.duration_since(*previous) < interval
            {
                return Ok(false);
            }
            last.insert(request.sensor_name.clone(), now);
        }
        self.submit(PendingRecord::Thermo(request))?;
        Ok(true)
    }

    fn submit(&self, record: PendingRecord) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        self.commands.send(record).map_err(|_| SyncError::Stopped)
    }

    /// Ask for a cycle on the next tick regardless of the interval.
    pub fn request_sync(&self) {
        self.shared.request();
    }

    /// Run one cycle on the calling task.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.shared.sync_now().await
    }

    /// Rows waiting in the durable queue.
    pub async fn pending_count(&self) -> Result<i64> {
        Ok(self.shared.queue.count().await?)
    }
}

impl<B: Backend> std::fmt::Debug for SyncManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn run<B: Backend>(
    shared: Arc<Shared<B>>,
    mut commands: mpsc::UnboundedReceiver<PendingRecord>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(shared.config.tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(record) = commands.recv() => shared.deliver(record).await,
            _ = tick.tick() => shared.sync_if_due().await,
            _ = shared.wake.notified() => shared.sync_if_due().await,
        }
    }

    commands.close();
    let mut saved = 0usize;
    while let Ok(record) = commands.try_recv() {
        shared.persist(&record).await;
        saved += 1;
    }
    if saved > 0 {
        info!(count = saved, "Queued undelivered records on shutdown");
    }
}

impl<B: Backend> Shared<B> {
    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    async fn sync_if_due(&self) {
        let requested = self.requested.swap(false, Ordering::SeqCst);
        let due = requested || {
            let state = self.cycle.lock().await;
            state.next_sync.is_none_or(|at| Instant::now() >= at)
        };
        if due {
            // Failures are logged and scheduled inside the cycle.
            let _ = self.sync_now().await;
        }
    }

    async fn sync_now(&self) -> Result<SyncReport> {
        let mut state = self.cycle.lock().await;
        let result = self.run_cycle(&mut state).await;
        let now = Instant::now();

        match &result {
            Ok(report) => {
                state.next_sync = Some(now + self.config.sync_interval);
                self.alerts.clear(ALERT_BACKEND_UNREACHABLE);
                if report.remaining > 0 {
                    debug!(remaining = report.remaining, "Queue backlog; syncing again");
                    self.requested.store(true, Ordering::SeqCst);
                }
            }
            Err(e) => {
                state.next_sync = Some(now + self.config.retry_interval);
                warn!(error = %e, retry_in = ?self.config.retry_interval, "Sync cycle failed");
                if e.is_connectivity() {
                    self.alerts.raise(Alert::new(
                        ALERT_BACKEND_UNREACHABLE,
                        AlertSeverity::Warning,
                        "Backend unreachable",
                        "Pours are being queued locally until the backend is back.",
                    ));
                }
            }
        }
        result
    }

    async fn run_cycle(&self, state: &mut CycleState) -> Result<SyncReport> {
        let flush = self.flush_oldest().await?;
        let remaining = self.queue.count().await?;

        let events = state.snapshot.pull(self.backend.as_ref()).await?;
        let published = events.len();
        for event in events {
            self.bus.publish(event);
        }

        debug!(?flush, remaining, published, "Sync cycle complete");
        Ok(SyncReport {
            flush,
            remaining,
            published,
        })
    }

    /// Process the single oldest queued row.
    async fn flush_oldest(&self) -> Result<FlushOutcome> {
        let Some(row) = self.queue.oldest().await? else {
            return Ok(FlushOutcome::Empty);
        };

        let record = match row.decode() {
            Ok(record) => record,
            Err(e) => {
                warn!(id = row.id, record_type = %row.record_type, error = %e, "Dropping malformed queued record");
                self.queue.delete(row.id).await?;
                return Ok(FlushOutcome::Dropped);
            }
        };

        match self.post(&record).await {
            Ok(()) => {
                self.queue.delete(row.id).await?;
                info!(id = row.id, record_type = record.record_type(), "Delivered queued record");
                Ok(FlushOutcome::Delivered)
            }
            Err(e) if e.is_permanent() => {
                warn!(id = row.id, error = %e, "Backend rejected queued record; dropping");
                self.queue.delete(row.id).await?;
                Ok(FlushOutcome::Dropped)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Live delivery of a freshly produced record.
    async fn deliver(&self, record: PendingRecord) {
        if let PendingRecord::Pour(drink) = &record
            && let Some(reason) = self.discard_reason(drink)
        {
            info!(tap = %drink.tap, volume_ml = drink.volume_ml, reason, "Discarding pour");
            remove_picture(drink.picture.as_deref()).await;
            return;
        }

        match self.post(&record).await {
            Ok(()) => debug!(record_type = record.record_type(), "Delivered record"),
            Err(e) if e.is_permanent() => {
                warn!(record_type = record.record_type(), error = %e, "Backend rejected record; dropping");
            }
            Err(e) => {
                warn!(record_type = record.record_type(), error = %e, "Live delivery failed; queueing");
                self.persist(&record).await;
            }
        }
    }

    fn discard_reason(&self, drink: &RecordDrinkRequest) -> Option<&'static str> {
        if drink.tap.is_empty() {
            Some("no tap")
        } else if drink.volume_ml < self.config.min_pour_volume_ml {
            Some("below minimum volume")
        } else {
            None
        }
    }

    /// Write a record to the durable queue. Pictures are not retried.
    async fn persist(&self, record: &PendingRecord) {
        let record = match record {
            PendingRecord::Pour(drink) if drink.picture.is_some() => {
                PendingRecord::Pour(RecordDrinkRequest {
                    picture: None,
                    ..drink.clone()
                })
            }
            other => other.clone(),
        };
        if let Err(e) = self.queue.enqueue(&record).await {
            error!(record_type = record.record_type(), error = %e, "Failed to queue record; it is lost");
        }
    }

    async fn post(&self, record: &PendingRecord) -> BackendResult<()> {
        match record {
            PendingRecord::Pour(drink) => {
                let result = self.backend.record_drink(drink).await;
                remove_picture(drink.picture.as_deref()).await;
                result
            }
            PendingRecord::Thermo(reading) => self.backend.record_temperature(reading).await,
        }
    }
}

async fn remove_picture(picture: Option<&Path>) {
    let Some(path) = picture else {
        return;
    };
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed pour picture"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove pour picture"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kegtap_core::backend::mock::MockBackend;
    use kegtap_core::{Event, Tap};
    use kegtap_storage::Database;
    use std::time::Duration;

    const METER: &str = "kegboard.flow0";

    fn drink(tap: &str, volume_ml: f64) -> RecordDrinkRequest {
        RecordDrinkRequest {
            tap: tap.to_string(),
            volume_ml,
            ticks: (volume_ml * 5.4) as u64,
            shout: String::new(),
            username: "alice".to_string(),
            record_date: Utc::now(),
            duration_ms: 3000,
            tick_time_series: Vec::new(),
            picture: None,
        }
    }

    async fn fixture(config: SyncConfig) -> (SyncManager<MockBackend>, MockBackend, EventBus) {
        let backend = MockBackend::new();
        backend.set_taps(vec![Tap::new(1, "Tap 1", METER)]);
        let db = Database::in_memory().await.unwrap();
        let bus = EventBus::new();
        let manager = SyncManager::new(
            Arc::new(backend.clone()),
            SqlitePendingRecordRepository::new(db.pool().clone()),
            bus.clone(),
            AlertCenter::new(bus.clone()),
            config,
        );
        (manager, backend, bus)
    }

    fn quiet() -> SyncConfig {
        SyncConfig::default()
            .with_sync_interval(Duration::from_secs(3600))
            .with_retry_interval(Duration::from_secs(3600))
            .with_tick(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_flush_delivers_oldest_row() {
        let (manager, backend, _) = fixture(quiet()).await;
        manager
            .shared
            .queue
            .enqueue(&PendingRecord::Pour(drink(METER, 330.0)))
            .await
            .unwrap();

        let report = manager.sync_now().await.unwrap();
        assert_eq!(report.flush, FlushOutcome::Delivered);
        assert_eq!(report.remaining, 0);
        assert_eq!(backend.recorded_drinks().len(), 1);
        assert_eq!(manager.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_tap_row_is_dropped() {
        let (manager, backend, _) = fixture(quiet()).await;
        manager
            .shared
            .queue
            .enqueue(&PendingRecord::Pour(drink("kegboard.flow9", 330.0)))
            .await
            .unwrap();

        let report = manager.sync_now().await.unwrap();
        assert_eq!(report.flush, FlushOutcome::Dropped);
        assert!(backend.recorded_drinks().is_empty());
        assert_eq!(manager.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_row_and_raises_alert() {
        let (manager, backend, bus) = fixture(quiet()).await;
        let mut events = bus.subscribe();
        backend.set_reachable(false);
        manager
            .shared
            .queue
            .enqueue(&PendingRecord::Pour(drink(METER, 330.0)))
            .await
            .unwrap();

        assert!(manager.sync_now().await.is_err());
        assert_eq!(manager.pending_count().await.unwrap(), 1);
        assert!(manager.shared.alerts.is_active(ALERT_BACKEND_UNREACHABLE));
        assert!(matches!(events.try_recv(), Ok(Event::AlertRaised(_))));

        backend.set_reachable(true);
        assert_eq!(
            manager.sync_now().await.unwrap().flush,
            FlushOutcome::Delivered
        );
        assert!(!manager.shared.alerts.is_active(ALERT_BACKEND_UNREACHABLE));
    }

    #[tokio::test]
    async fn test_backlog_requests_another_cycle() {
        let (manager, _, _) = fixture(quiet()).await;
        for _ in 0..2 {
            manager
                .shared
                .queue
                .enqueue(&PendingRecord::Pour(drink(METER, 330.0)))
                .await
                .unwrap();
        }

        let report = manager.sync_now().await.unwrap();
        assert_eq!(report.remaining, 1);
        assert!(manager.shared.requested.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_interval() {
        let config = quiet().with_retry_interval(Duration::from_secs(10));
        let (manager, backend, _) = fixture(config).await;
        backend.set_reachable(false);

        let before = Instant::now();
        assert!(manager.sync_now().await.is_err());
        let next = manager.shared.cycle.lock().await.next_sync.unwrap();
        assert!(next >= before + Duration::from_secs(10));
        assert!(next < before + Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_thermo_records_are_throttled_per_sensor() {
        let config = quiet().with_thermo_interval(Duration::from_secs(60));
        let (manager, _, _) = fixture(config).await;
        let reading = |sensor: &str| RecordTemperatureRequest {
            sensor_name: sensor.to_string(),
            temperature_c: 3.0,
            record_date: Utc::now(),
        };

        assert!(manager.record_temperature_async(reading("a")).unwrap());
        assert!(!manager.record_temperature_async(reading("a")).unwrap());
        assert!(manager.record_temperature_async(reading("b")).unwrap());
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails() {
        let (manager, _, _) = fixture(quiet()).await;
        manager.start();
        assert!(manager.is_running());
        manager.stop().await;
        assert!(!manager.is_running());
        assert!(matches!(
            manager.record_drink_async(drink(METER, 330.0)),
            Err(SyncError::Stopped)
        ));
    }
}
