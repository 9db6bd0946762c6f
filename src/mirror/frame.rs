//! One-update-per-frame coalescing queue.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::session::Sink;

struct FrameState<T> {
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
}

/// Holds at most one pending value and hands it to the sink when the current
/// frame ends. A value pushed while one is pending replaces it.
pub struct FrameQueue<T> {
    frame: Duration,
    sink: Sink<T>,
    state: Arc<Mutex<FrameState<T>>>,
}

impl<T: Send + 'static> FrameQueue<T> {
    pub fn new(frame: Duration, sink: Sink<T>) -> Self {
        Self {
            frame,
            sink,
            state: Arc::new(Mutex::new(FrameState {
                pending: None,
                timer: None,
            })),
        }
    }

    pub fn push(&self, value: T) {
        let mut state = self.state.lock();
        state.pending = Some(value);
        if state.timer.is_some() {
            return;
        }

        let shared = self.state.clone();
        let sink = self.sink.clone();
        let frame = self.frame;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(frame).await;
            let value = {
                let mut state = shared.lock();
                state.timer = None;
                state.pending.take()
            };
            if let Some(value) = value {
                sink(value);
            }
        }));
    }

    /// Remove the pending value without delivering it
    pub fn take(&self) -> Option<T> {
        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.pending.take()
    }

    pub fn cancel(&self) {
        self.take();
    }

    pub fn has_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }
}

impl<T> Drop for FrameQueue<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.lock().timer.take() {
            timer.abort();
        }
    }
}
