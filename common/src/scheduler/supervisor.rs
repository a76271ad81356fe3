// Starts and stops the scheduler loop as the auth context changes

use super::engine::SchedulerEngine;
use crate::auth::{AuthContext, AuthPolicy};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct SchedulerSupervisor {
    engine: Arc<SchedulerEngine>,
    policy: AuthPolicy,
}

impl SchedulerSupervisor {
    pub fn new(engine: Arc<SchedulerEngine>, policy: AuthPolicy) -> Self {
        Self { engine, policy }
    }

    pub fn engine(&self) -> &Arc<SchedulerEngine> {
        &self.engine
    }

    /// Watch the auth context until host shutdown or the context sender goes away
    ///
    /// The loop runs while the context is permitted. When it stops being
    /// permitted the loop is signalled and awaited, so an in-flight tick
    /// completes before the supervisor moves on.
    pub async fn run(
        &self,
        mut auth_rx: watch::Receiver<AuthContext>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut active: Option<JoinHandle<()>> = None;

        loop {
            let decision = {
                let ctx = auth_rx.borrow_and_update();
                self.policy.authorize(&ctx)
            };

            match (decision, active.is_some()) {
                (Ok(()), false) => {
                    info!("Auth context permits scheduling, starting scheduler");
                    active = Some(self.activate());
                }
                (Err(reason), true) => {
                    info!(reason = %reason, "Auth context no longer permits scheduling");
                    if let Some(handle) = active.take() {
                        self.deactivate(handle).await;
                    }
                }
                (Err(reason), false) => {
                    debug!(reason = %reason, "Scheduler stays idle");
                }
                (Ok(()), true) => {}
            }

            tokio::select! {
                changed = auth_rx.changed() => {
                    if changed.is_err() {
                        warn!("Auth context channel closed, shutting down supervisor");
                        break;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Host shutdown, stopping supervisor");
                    break;
                }
            }
        }

        if let Some(handle) = active.take() {
            self.deactivate(handle).await;
        }
    }

    fn activate(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        // Subscribe before spawning so an immediate stop is not missed
        let shutdown_rx = engine.shutdown_receiver();
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    }

    async fn deactivate(&self, handle: JoinHandle<()>) {
        self.engine.signal_shutdown();
        if let Err(e) = handle.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::fanout::{EventBus, FanOut};
    use crate::models::EntityKind;
    use crate::record;
    use crate::scheduler::SchedulerConfig;
    use crate::store::{EntityStore, MemoryStore};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tokio::time::sleep;

    async fn seed(store: &MemoryStore, id: &str) {
        store
            .create(
                EntityKind::Appointment,
                record! {
                    "id" => id,
                    "vehicle_plate" => "ABC1D23",
                    "kind" => "unload",
                    "date" => "2024-01-10",
                    "time" => "07:30",
                    "status" => "scheduled",
                },
            )
            .await
            .unwrap();
    }

    fn supervisor(store: Arc<MemoryStore>) -> Arc<SchedulerSupervisor> {
        let engine = Arc::new(SchedulerEngine::new(
            SchedulerConfig {
                poll_interval_seconds: 3600,
                ..SchedulerConfig::default()
            },
            store,
            FanOut::from_bus(Arc::new(EventBus::default())),
            Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap(),
            )),
        ));
        Arc::new(SchedulerSupervisor::new(engine, AuthPolicy::default()))
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn status_of(store: &MemoryStore, id: &str) -> String {
        store.get(EntityKind::Appointment, id).await.unwrap().unwrap()["status"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }

    #[tokio::test]
    async fn test_starts_only_when_permitted_and_stops_on_downgrade() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "apt-1").await;
        let sup = supervisor(store.clone());
        let (auth_tx, auth_rx) = watch::channel(AuthContext::authenticated("driver"));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let runner = sup.clone();
        let handle = tokio::spawn(async move { runner.run(auth_rx, shutdown_rx).await });

        sleep(Duration::from_millis(50)).await;
        assert!(!sup.engine().is_running());
        assert_eq!(status_of(&store, "apt-1").await, "scheduled");

        auth_tx.send(AuthContext::authenticated("Admin")).unwrap();
        let engine = sup.engine().clone();
        assert!(wait_for(|| engine.is_running()).await);
        let mut dispatched = false;
        for _ in 0..200 {
            if status_of(&store, "apt-1").await == "in_service" {
                dispatched = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(dispatched);

        auth_tx.send(AuthContext::anonymous()).unwrap();
        assert!(wait_for(|| !engine.is_running()).await);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_active_loop() {
        let store = Arc::new(MemoryStore::new());
        let sup = supervisor(store);
        let (_auth_tx, auth_rx) = watch::channel(AuthContext::authenticated("lead"));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let runner = sup.clone();
        let handle = tokio::spawn(async move { runner.run(auth_rx, shutdown_rx).await });
        let engine = sup.engine().clone();
        assert!(wait_for(|| engine.is_running()).await);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_closed_auth_channel_ends_supervisor() {
        let sup = supervisor(Arc::new(MemoryStore::new()));
        let (auth_tx, auth_rx) = watch::channel(AuthContext::authenticated("admin"));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let runner = sup.clone();
        let handle = tokio::spawn(async move { runner.run(auth_rx, shutdown_rx).await });
        drop(auth_tx);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!sup.engine().is_running());
    }
}
