//! Autosave scheduling.
//!
//! Two schedulers share one [`SaveDriver`]: the [`IdleScheduler`] fires after
//! a quiet period following the latest edit, the [`HeartbeatScheduler`] fires
//! on a fixed period with freshly pulled state. Neither decides whether a save
//! is allowed or needed; they hand a [`SavePayload`] to [`run_save`], which
//! asks the driver for a ticket, persists, and reports back.
//!
//! The driver owns the single in-flight guard per subject. A persist started by
//! [`run_save`] is always run to completion on its own task so that resetting a
//! timer or stopping the heartbeat never strands the guard.

mod heartbeat;
mod idle;

pub use heartbeat::{HeartbeatScheduler, PayloadSource};
pub use idle::IdleScheduler;

use async_trait::async_trait;
use std::fmt;
use tracing::{debug, warn};

use crate::scene::{Camera, CameraSignature, Scene, Signature, SubjectId};
use crate::source::PersistError;

/// Everything a save writes, captured at intake time
#[derive(Debug, Clone, PartialEq)]
pub struct SavePayload {
    pub subject_id: SubjectId,
    /// Binding generation the payload was captured under
    pub binding: u64,
    pub scene: Scene,
    pub viewer_camera: Camera,
    pub editor_camera: Camera,
}

/// What started a save attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTrigger {
    Idle,
    Heartbeat,
    Flush,
}

impl fmt::Display for SaveTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveTrigger::Idle => f.write_str("idle"),
            SaveTrigger::Heartbeat => f.write_str("heartbeat"),
            SaveTrigger::Flush => f.write_str("flush"),
        }
    }
}

/// Why a save attempt did not reach the persister
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Payload belongs to an earlier subject binding
    StaleBinding,
    Locked,
    /// The bound subject's document has not been applied yet
    SceneNotApplied,
    /// Another persist for this subject is outstanding
    InFlight,
    /// Content and both cameras match the last save
    Unchanged,
}

/// Permission to run one persist, handed out by [`SaveDriver::begin`]
#[derive(Debug, Clone, PartialEq)]
pub struct SaveTicket {
    pub id: u64,
    pub binding: u64,
    pub subject_id: SubjectId,
    pub trigger: SaveTrigger,
    /// False for camera-only saves, which never show up in the save status
    pub visible: bool,
    pub content: Signature,
    pub viewer_camera: CameraSignature,
    pub editor_camera: CameraSignature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Skipped(SkipReason),
    Saved,
    Failed(String),
}

/// The session side of a save: gating, the persist call and its callbacks.
#[async_trait]
pub trait SaveDriver: Send + Sync + 'static {
    /// Decide whether the payload may be persisted now. An `Ok` ticket marks
    /// the subject as having a persist in flight until `on_saved` or
    /// `on_error` is called with it.
    fn begin(&self, payload: &SavePayload, trigger: SaveTrigger) -> Result<SaveTicket, SkipReason>;

    fn on_saving(&self, ticket: &SaveTicket);

    async fn persist(&self, payload: &SavePayload) -> Result<(), PersistError>;

    fn on_saved(&self, ticket: SaveTicket);

    fn on_error(&self, ticket: SaveTicket, error: &PersistError);
}

/// Run one save attempt through the driver.
///
/// Must not be cancelled between `begin` and the final callback; the
/// schedulers only call it from tasks nothing aborts.
pub async fn run_save(driver: &dyn SaveDriver, payload: SavePayload, trigger: SaveTrigger) -> SaveOutcome {
    let ticket = match driver.begin(&payload, trigger) {
        Ok(ticket) => ticket,
        Err(reason) => {
            debug!(
                "Skipping {} save of {}: {:?}",
                trigger, payload.subject_id, reason
            );
            return SaveOutcome::Skipped(reason);
        }
    };

    debug!(
        "Persisting {} ({} save, {} elements)",
        payload.subject_id,
        trigger,
        payload.scene.elements.len()
    );
    driver.on_saving(&ticket);

    match driver.persist(&payload).await {
        Ok(()) => {
            driver.on_saved(ticket);
            SaveOutcome::Saved
        }
        Err(e) => {
            warn!("Saving {} failed: {}", payload.subject_id, e);
            let message = e.to_string();
            driver.on_error(ticket, &e);
            SaveOutcome::Failed(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{payload, RecordingDriver};

    #[tokio::test]
    async fn test_run_save_success_calls_back_in_order() {
        let driver = RecordingDriver::new();
        let outcome = run_save(&driver, payload("201", 1, 3), SaveTrigger::Idle).await;

        assert_eq!(outcome, SaveOutcome::Saved);
        assert_eq!(driver.log(), vec!["begin:idle", "saving", "persist:3", "saved"]);
    }

    #[tokio::test]
    async fn test_run_save_skip_never_persists() {
        let driver = RecordingDriver::new().refusing(SkipReason::InFlight);
        let outcome = run_save(&driver, payload("201", 1, 3), SaveTrigger::Heartbeat).await;

        assert_eq!(outcome, SaveOutcome::Skipped(SkipReason::InFlight));
        assert_eq!(driver.log(), vec!["begin:heartbeat"]);
    }

    #[tokio::test]
    async fn test_run_save_failure_reports_error() {
        let driver = RecordingDriver::new().failing();
        let outcome = run_save(&driver, payload("201", 1, 2), SaveTrigger::Flush).await;

        assert!(matches!(outcome, SaveOutcome::Failed(_)));
        assert_eq!(driver.log(), vec!["begin:flush", "saving", "persist:2", "error"]);
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(SaveTrigger::Idle.to_string(), "idle");
        assert_eq!(SaveTrigger::Heartbeat.to_string(), "heartbeat");
    }
}
