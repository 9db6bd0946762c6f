//! Fixed-period save with freshly pulled state.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{run_save, SaveDriver, SavePayload, SaveTrigger};

/// Shortest period a heartbeat runs at
const MIN_PERIOD: Duration = Duration::from_millis(100);

/// Getter for the state a heartbeat tick should save; `None` skips the tick
pub type PayloadSource = Arc<dyn Fn() -> Option<SavePayload> + Send + Sync>;

pub struct HeartbeatScheduler {
    period: Duration,
    driver: Weak<dyn SaveDriver>,
    source: Arc<Mutex<Option<PayloadSource>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl HeartbeatScheduler {
    pub fn new(period: Duration, driver: Weak<dyn SaveDriver>) -> Self {
        if period < MIN_PERIOD {
            warn!("Heartbeat period {:?} too short, using {:?}", period, MIN_PERIOD);
        }
        let period = period.max(MIN_PERIOD);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            period,
            driver,
            source: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Start ticking with `source`. Restarting a running heartbeat only swaps
    /// the source.
    pub fn start(&self, source: PayloadSource) {
        *self.source.lock() = Some(source);

        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        let period = self.period;
        let source = self.source.clone();
        let driver = self.driver.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        info!("Heartbeat autosave started ({:?})", period);
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let current = source.lock().clone();
                        let Some(payload) = current.and_then(|get| get()) else {
                            continue;
                        };
                        let Some(driver) = driver.upgrade() else {
                            break;
                        };
                        // Detached so stopping the heartbeat never cuts a persist short
                        tokio::spawn(async move {
                            run_save(driver.as_ref(), payload, SaveTrigger::Heartbeat).await;
                        });
                    }
                    _ = shutdown.recv() => {
                        debug!("Heartbeat autosave shutting down");
                        break;
                    }
                }
            }
        }));
    }

    /// Point a running heartbeat at new getters without restarting its period
    pub fn rebind(&self, source: PayloadSource) {
        *self.source.lock() = Some(source);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            let _ = self.shutdown_tx.send(());
            task.abort();
            info!("Heartbeat autosave stopped");
        }
        *self.source.lock() = None;
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
