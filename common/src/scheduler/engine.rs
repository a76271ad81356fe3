// Scheduler engine: periodic tick that dispatches due appointments

use crate::clock::Clock;
use crate::dispatch::{DispatchAction, DispatchOutcome};
use crate::errors::StoreError;
use crate::fanout::FanOut;
use crate::models::Appointment;
use crate::schedule::{default_timezone, is_due};
use crate::store::{AppointmentRepository, EntityStore};
use crate::telemetry;
use async_trait::async_trait;
use chrono_tz::Tz;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// How often to poll for due appointments (in seconds)
    pub poll_interval_seconds: u64,
    /// Maximum number of scheduled appointments fetched per tick
    pub max_candidates_per_poll: usize,
    /// Zone in which appointment dates and times are written
    pub timezone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            max_candidates_per_poll: 200,
            timezone: default_timezone(),
        }
    }
}

/// Counters for one completed tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub due: usize,
    pub dispatched: usize,
    pub noop: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was already in progress
    Skipped,
    Completed(TickReport),
}

/// Scheduler trait for appointment dispatch
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run the polling loop until stopped
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Stop the polling loop, letting an in-flight tick finish
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Run one tick now; also the manual trigger
    async fn process_due_appointments(&self) -> Result<TickOutcome, StoreError>;
}

/// Resets the single-flight flag when the tick ends, including on unwind
struct TickGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Main scheduler engine implementation
pub struct SchedulerEngine {
    config: SchedulerConfig,
    appointments: AppointmentRepository,
    action: DispatchAction,
    clock: Arc<dyn Clock>,
    ticking: AtomicBool,
    running: watch::Sender<bool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn EntityStore>,
        fanout: FanOut,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
        let (running, _running_rx) = watch::channel(false);

        Self {
            config,
            appointments: AppointmentRepository::new(store.clone()),
            action: DispatchAction::new(store, fanout, clock.clone()),
            clock,
            ticking: AtomicBool::new(false),
            running,
            shutdown_tx,
        }
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Ask every running loop to stop after its current tick
    pub fn signal_shutdown(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("No running loop to signal");
        }
    }

    pub fn is_ticking(&self) -> bool {
        self.ticking.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Polling loop driven by an already-subscribed shutdown receiver
    ///
    /// The first tick fires immediately. A tick in progress when the signal
    /// arrives runs to completion before the loop exits, and no further tick
    /// starts once the signal is pending.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            max_candidates_per_poll = self.config.max_candidates_per_poll,
            timezone = %self.config.timezone,
            "Starting scheduler engine"
        );
        self.running.send_replace(true);

        let mut poll_interval = interval(Duration::from_secs(self.config.poll_interval_seconds.max(1)));
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
                _ = poll_interval.tick() => {
                    debug!("Polling for due appointments");

                    match self.process_due_appointments().await {
                        Ok(TickOutcome::Completed(report)) => {
                            if report.due > 0 {
                                info!(
                                    fetched = report.fetched,
                                    due = report.due,
                                    dispatched = report.dispatched,
                                    noop = report.noop,
                                    failed = report.failed,
                                    "Processed due appointments"
                                );
                            } else {
                                debug!(fetched = report.fetched, "No appointments due");
                            }
                        }
                        Ok(TickOutcome::Skipped) => {
                            debug!("Previous tick still running, skipped");
                        }
                        Err(e) => {
                            error!(error = %e, "Error fetching scheduled appointments");
                        }
                    }
                }
            }
        }

        self.running.send_replace(false);
        info!("Scheduler engine stopped");
    }

    #[instrument(skip(self, candidates), fields(candidates = candidates.len()))]
    async fn dispatch_due(&self, candidates: &[Appointment]) -> TickReport {
        let now = self.clock.now();
        let tz = self.config.timezone;
        let mut report = TickReport {
            fetched: candidates.len(),
            ..TickReport::default()
        };

        let due: Vec<_> = candidates
            .iter()
            .filter(|apt| is_due(apt, now, &tz))
            .collect();
        report.due = due.len();
        telemetry::update_due_candidates(due.len());

        // One at a time, in fetch order
        for appointment in due {
            match self.action.dispatch(appointment).await {
                Ok(DispatchOutcome::Dispatched(_)) => report.dispatched += 1,
                Ok(DispatchOutcome::NoOp { .. }) => report.noop += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        appointment_id = %appointment.id,
                        step = e.step(),
                        error = %e,
                        "Failed to dispatch appointment"
                    );
                }
            }
        }

        report
    }
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.run(self.shutdown_receiver()).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Stopping scheduler engine");
        let mut running = self.running.subscribe();
        self.signal_shutdown();

        // Resolves at once when no loop is running
        running.wait_for(|running| !*running).await?;

        info!("Scheduler engine stopped gracefully");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn process_due_appointments(&self) -> Result<TickOutcome, StoreError> {
        let Some(_guard) = TickGuard::acquire(&self.ticking) else {
            telemetry::record_tick_skipped();
            warn!("Tick requested while another is in progress");
            return Ok(TickOutcome::Skipped);
        };

        let started = Instant::now();
        let candidates = self
            .appointments
            .find_scheduled(self.config.max_candidates_per_poll)
            .await?;
        let report = self.dispatch_due(&candidates).await;
        telemetry::record_tick_duration(started.elapsed().as_secs_f64());

        Ok(TickOutcome::Completed(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::fanout::EventBus;
    use crate::models::EntityKind;
    use crate::record;
    use crate::store::fault::{FaultRule, FaultyStore, StoreOp};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use tokio::time::sleep;

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap(),
        ))
    }

    async fn seed(store: &MemoryStore, id: &str, time: &str) {
        store
            .create(
                EntityKind::Appointment,
                record! {
                    "id" => id,
                    "vehicle_plate" => format!("PLT-{id}"),
                    "kind" => "load",
                    "date" => "2024-01-10",
                    "time" => time,
                    "status" => "scheduled",
                },
            )
            .await
            .unwrap();
    }

    fn engine(store: Arc<dyn EntityStore>, poll_interval_seconds: u64) -> Arc<SchedulerEngine> {
        Arc::new(SchedulerEngine::new(
            SchedulerConfig {
                poll_interval_seconds,
                ..SchedulerConfig::default()
            },
            store,
            FanOut::from_bus(Arc::new(EventBus::new(64))),
            clock(),
        ))
    }

    async fn status_of(store: &MemoryStore, id: &str) -> Value {
        store.get(EntityKind::Appointment, id).await.unwrap().unwrap()["status"].clone()
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval_seconds, 30);
        assert_eq!(config.max_candidates_per_poll, 200);
        assert_eq!(config.timezone, Tz::UTC);
    }

    #[tokio::test]
    async fn test_tick_dispatches_only_due_appointments() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "due", "08:00").await;
        seed(&store, "later", "08:01").await;
        seed(&store, "garbled", "8h").await;
        let engine = engine(store.clone(), 30);

        let outcome = engine.process_due_appointments().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Completed(TickReport {
                fetched: 3,
                due: 1,
                dispatched: 1,
                noop: 0,
                failed: 0,
            })
        );
        assert_eq!(status_of(&store, "due").await, "in_service");
        assert_eq!(status_of(&store, "later").await, "scheduled");
        assert_eq!(status_of(&store, "garbled").await, "scheduled");
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let inner = Arc::new(MemoryStore::new());
        seed(&inner, "apt-1", "07:00").await;
        let store = Arc::new(FaultyStore::new(inner.clone()).with_latency(Duration::from_millis(50)));
        let engine = engine(store.clone(), 30);

        let (first, second) = tokio::join!(
            engine.process_due_appointments(),
            engine.process_due_appointments()
        );
        assert!(matches!(first.unwrap(), TickOutcome::Completed(r) if r.dispatched == 1));
        assert_eq!(second.unwrap(), TickOutcome::Skipped);
        assert_eq!(store.calls_for(StoreOp::Filter, EntityKind::Appointment).len(), 1);
        assert_eq!(inner.count(EntityKind::WorkItem).await, 1);

        // Flag is released once the tick ends
        assert!(!engine.is_ticking());
        assert!(matches!(
            engine.process_due_appointments().await.unwrap(),
            TickOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_fetch_failure_releases_guard() {
        let inner = Arc::new(MemoryStore::new());
        let store = Arc::new(FaultyStore::new(inner));
        store.fail(FaultRule::new(StoreOp::Filter, EntityKind::Appointment).times(1));
        let engine = engine(store, 30);

        assert!(engine.process_due_appointments().await.is_err());
        assert!(!engine.is_ticking());
        assert!(engine.process_due_appointments().await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_candidate_does_not_stop_the_tick() {
        let inner = Arc::new(MemoryStore::new());
        seed(&inner, "apt-a", "07:00").await;
        seed(&inner, "apt-b", "07:00").await;
        seed(&inner, "apt-c", "07:00").await;
        let store = Arc::new(FaultyStore::new(inner.clone()));
        // apt-b is second in fetch order (newest first)
        store.fail(
            FaultRule::new(StoreOp::Create, EntityKind::WorkItem)
                .when_field("source_appointment_id", "apt-b"),
        );
        let engine = engine(store.clone(), 30);

        let outcome = engine.process_due_appointments().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Completed(TickReport { due: 3, dispatched: 2, failed: 1, .. })
        ));
        assert_eq!(status_of(&inner, "apt-a").await, "in_service");
        assert_eq!(status_of(&inner, "apt-b").await, "scheduled");
        assert_eq!(status_of(&inner, "apt-c").await, "in_service");

        let order: Vec<Value> = store
            .calls_for(StoreOp::Create, EntityKind::WorkItem)
            .into_iter()
            .filter_map(|c| c.fields.and_then(|f| f.get("source_appointment_id").cloned()))
            .collect();
        assert_eq!(order, vec!["apt-c", "apt-b", "apt-a"]);

        // Retried and dispatched once the store recovers
        store.clear_faults();
        engine.process_due_appointments().await.unwrap();
        assert_eq!(status_of(&inner, "apt-b").await, "in_service");
        assert_eq!(inner.count(EntityKind::WorkItem).await, 3);
    }

    #[tokio::test]
    async fn test_candidates_are_dispatched_sequentially_in_fetch_order() {
        let inner = Arc::new(MemoryStore::new());
        for id in ["apt-1", "apt-2", "apt-3"] {
            seed(&inner, id, "06:30").await;
        }
        let store = Arc::new(FaultyStore::new(inner.clone()));
        let engine = engine(store.clone(), 30);
        engine.process_due_appointments().await.unwrap();

        // Each appointment's update lands before the next one's gate read
        let trace: Vec<(StoreOp, String)> = store
            .calls()
            .into_iter()
            .filter(|c| c.entity == EntityKind::Appointment && c.op != StoreOp::Filter)
            .map(|c| (c.op, c.id.unwrap_or_default()))
            .collect();
        assert_eq!(
            trace,
            vec![
                (StoreOp::Get, "apt-3".to_string()),
                (StoreOp::Update, "apt-3".to_string()),
                (StoreOp::Get, "apt-2".to_string()),
                (StoreOp::Update, "apt-2".to_string()),
                (StoreOp::Get, "apt-1".to_string()),
                (StoreOp::Update, "apt-1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_respects_candidate_limit() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            seed(&store, &format!("apt-{i}"), "07:00").await;
        }
        let engine = Arc::new(SchedulerEngine::new(
            SchedulerConfig {
                max_candidates_per_poll: 2,
                ..SchedulerConfig::default()
            },
            store.clone(),
            FanOut::from_bus(Arc::new(EventBus::default())),
            clock(),
        ));

        let outcome = engine.process_due_appointments().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Completed(r) if r.fetched == 2 && r.dispatched == 2));
        assert_eq!(status_of(&store, "apt-4").await, "in_service");
        assert_eq!(status_of(&store, "apt-0").await, "scheduled");
    }

    #[tokio::test]
    async fn test_start_ticks_immediately_and_stop_waits_for_loop_exit() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "apt-1", "07:00").await;
        let engine = engine(store.clone(), 3600);

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.start().await.is_ok() });

        let mut dispatched = false;
        for _ in 0..100 {
            if status_of(&store, "apt-1").await == "in_service" {
                dispatched = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(dispatched, "first tick should fire without waiting an interval");
        assert!(engine.is_running());

        engine.stop().await.unwrap();
        assert!(!engine.is_running());
        let started_ok = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should exit after stop")
            .unwrap();
        assert!(started_ok);
    }

    #[tokio::test]
    async fn test_stop_without_a_running_loop_returns_immediately() {
        let engine = engine(Arc::new(MemoryStore::new()), 30);
        tokio::time::timeout(Duration::from_millis(500), engine.stop())
            .await
            .expect("stop should not wait when nothing runs")
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_tick_starts_after_shutdown_during_a_slow_tick() {
        // Each tick outlasts the interval, so the next tick is already due
        // when the in-flight one finishes
        for _ in 0..4 {
            let store = Arc::new(
                FaultyStore::new(Arc::new(MemoryStore::new()))
                    .with_latency(Duration::from_millis(1300)),
            );
            let engine = engine(store.clone(), 1);

            let rx = engine.shutdown_receiver();
            let runner = engine.clone();
            let handle = tokio::spawn(async move { runner.run(rx).await });

            sleep(Duration::from_millis(100)).await;
            assert!(engine.is_ticking());
            engine.stop().await.unwrap();

            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("loop should exit after the in-flight tick")
                .unwrap();
            assert_eq!(store.calls_for(StoreOp::Filter, EntityKind::Appointment).len(), 1);
            assert!(!engine.is_ticking());
        }
    }
}
