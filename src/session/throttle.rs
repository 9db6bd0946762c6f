//! Leading-edge throttle with a trailing flush of the latest value.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type Sink<T> = Arc<dyn Fn(T) + Send + Sync>;

struct ThrottleState<T> {
    last_run: Option<Instant>,
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
}

/// Runs the sink at most once per `interval`.
///
/// A call arriving after the interval has elapsed runs immediately. Calls
/// arriving sooner are buffered; only the latest survives and it runs once
/// the interval is up.
pub struct Throttle<T> {
    interval: Duration,
    sink: Sink<T>,
    state: Arc<Mutex<ThrottleState<T>>>,
}

impl<T: Send + 'static> Throttle<T> {
    pub fn new(interval: Duration, sink: Sink<T>) -> Self {
        Self {
            interval,
            sink,
            state: Arc::new(Mutex::new(ThrottleState {
                last_run: None,
                pending: None,
                timer: None,
            })),
        }
    }

    pub fn call(&self, value: T) {
        let now = Instant::now();
        let run_now = {
            let mut state = self.state.lock();
            let ready = state.timer.is_none()
                && state
                    .last_run
                    .map(|last| now.duration_since(last) >= self.interval)
                    .unwrap_or(true);

            if ready {
                state.last_run = Some(now);
                Some(value)
            } else {
                state.pending = Some(value);
                if state.timer.is_none() {
                    let due = state.last_run.map(|last| last + self.interval).unwrap_or(now);
                    state.timer = Some(self.spawn_flush(due));
                }
                None
            }
        };

        if let Some(value) = run_now {
            (self.sink)(value);
        }
    }

    fn spawn_flush(&self, due: Instant) -> JoinHandle<()> {
        let state = self.state.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(due).await;
            let value = {
                let mut state = state.lock();
                state.timer = None;
                let value = state.pending.take();
                if value.is_some() {
                    state.last_run = Some(Instant::now());
                }
                value
            };
            if let Some(value) = value {
                sink(value);
            }
        })
    }

    /// Run the buffered call now, if any
    pub fn flush(&self) {
        let value = {
            let mut state = self.state.lock();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let value = state.pending.take();
            if value.is_some() {
                state.last_run = Some(Instant::now());
            }
            value
        };
        if let Some(value) = value {
            (self.sink)(value);
        }
    }

    /// Discard the buffered call
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.pending = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    pub fn has_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }
}

impl<T> Drop for Throttle<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.lock().timer.take() {
            timer.abort();
        }
    }
}
