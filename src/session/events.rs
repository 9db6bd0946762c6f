//! Typed events published by one session controller.

use tokio::sync::broadcast;

use super::SaveStatus;
use crate::autosave::{SaveOutcome, SaveTrigger};
use crate::scene::SubjectId;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SubjectBound {
        subject_id: Option<SubjectId>,
        binding: u64,
    },
    StatusChanged(SaveStatus),
    LoadingChanged(bool),
    ExternalUpdateApplied {
        subject_id: SubjectId,
        /// First document applied for this binding
        initial: bool,
    },
    LoadFailed {
        subject_id: SubjectId,
        message: String,
    },
    PersistRequested {
        subject_id: SubjectId,
        trigger: SaveTrigger,
    },
    PersistFinished {
        subject_id: SubjectId,
        outcome: SaveOutcome,
    },
    UnlockChanged {
        subject_id: Option<SubjectId>,
        unlocked: bool,
    },
}

/// Broadcast bus scoped to one controller
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish; events with no subscriber are dropped
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
