//! Debounced save after a quiet period.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{run_save, SaveDriver, SaveOutcome, SavePayload, SaveTrigger, SkipReason};

struct IdleState {
    pending: Option<SavePayload>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every schedule/cancel so a timer that lost a race does nothing
    generation: u64,
}

pub struct IdleScheduler {
    wait: Duration,
    driver: Weak<dyn SaveDriver>,
    inner: Arc<Mutex<IdleState>>,
}

impl IdleScheduler {
    pub fn new(wait: Duration, driver: Weak<dyn SaveDriver>) -> Self {
        Self {
            wait,
            driver,
            inner: Arc::new(Mutex::new(IdleState {
                pending: None,
                timer: None,
                generation: 0,
            })),
        }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Record `payload` as pending and restart the quiet-period timer
    pub fn schedule(&self, payload: SavePayload) {
        let mut state = self.inner.lock();
        state.pending = Some(payload);
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let generation = state.generation;
        let inner = self.inner.clone();
        let driver = self.driver.clone();
        let wait = self.wait;

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;

            // Detach from the timer slot before saving; from here on a new
            // schedule starts a fresh timer instead of aborting this persist.
            let payload = {
                let mut state = inner.lock();
                if state.generation != generation {
                    return;
                }
                state.timer = None;
                state.pending.take()
            };

            let (Some(payload), Some(driver)) = (payload, driver.upgrade()) else {
                return;
            };
            run_save(driver.as_ref(), payload, SaveTrigger::Idle).await;
        }));
    }

    /// Drop the pending payload without saving it
    pub fn cancel(&self) {
        let mut state = self.inner.lock();
        state.generation += 1;
        if state.pending.take().is_some() {
            debug!("Cancelled pending idle save");
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    /// Persist `payload` now, skipping the quiet period.
    ///
    /// Replaces whatever was pending. The save runs on its own task, so
    /// dropping the returned future does not abandon a started persist.
    pub async fn flush_immediate(&self, payload: SavePayload) -> SaveOutcome {
        self.cancel();

        let Some(driver) = self.driver.upgrade() else {
            return SaveOutcome::Skipped(SkipReason::StaleBinding);
        };

        let handle = tokio::spawn(async move {
            run_save(driver.as_ref(), payload, SaveTrigger::Flush).await
        });

        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Flush task failed: {}", e);
                SaveOutcome::Failed(e.to_string())
            }
        }
    }
}

impl Drop for IdleScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.lock().timer.take() {
            timer.abort();
        }
    }
}
