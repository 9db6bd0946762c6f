//! Document pane: one editor/viewer pair wired to a session.
//!
//! The host UI talks to the pane only. It forwards surface callbacks to the
//! mirror and the session controller, drops echoes of its own saves, and
//! replays the latest editor snapshot when the unlock gate opens so that an
//! edit made while locked still gets saved.

use futures_util::Stream;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::autosave::SaveOutcome;
use crate::config::SessionConfig;
use crate::mirror::CanvasMirror;
use crate::scene::{Camera, SubjectId};
use crate::session::{CanvasChange, SaveStatus, SessionController};
use crate::source::{DocumentUpdate, Loader, Persister};
use crate::surface::{RenderSurface, SurfaceRole};
use crate::unlock::{CompanionField, CompanionRecord};

#[derive(Clone)]
pub struct DocumentPane {
    controller: SessionController,
    mirror: CanvasMirror,
    /// Latest editor snapshot of the current binding
    latest: Arc<Mutex<Option<CanvasChange>>>,
}

impl DocumentPane {
    pub fn new(
        config: SessionConfig,
        loader: Arc<dyn Loader>,
        persister: Arc<dyn Persister>,
        editor: Arc<dyn RenderSurface>,
        viewer: Arc<dyn RenderSurface>,
    ) -> Self {
        let mirror = CanvasMirror::new(editor, viewer, config.frame_interval);
        let controller = SessionController::new(config, loader, persister);
        controller.add_observer(Arc::new(mirror.clone()));

        Self {
            controller,
            mirror,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn mirror(&self) -> &CanvasMirror {
        &self.mirror
    }

    /// Bind to `subject` and keep the heartbeat pointed at it
    pub fn select_subject(&self, subject: Option<SubjectId>) {
        let before = self.controller.binding();
        self.controller.select_subject(subject);
        if self.controller.binding() != before {
            *self.latest.lock() = None;
        }
        self.controller.start_heartbeat();
    }

    /// Change callback of the editor surface
    pub fn editor_changed(&self, change: CanvasChange) {
        self.mirror
            .editor_changed(change.elements.clone(), change.files.clone());

        let change = match change.viewer_camera {
            Some(_) => change,
            None => change.with_viewer_camera(self.mirror.viewer_camera()),
        };
        *self.latest.lock() = Some(change.clone());
        self.controller.on_canvas_change(change);
    }

    /// Scroll/zoom callback of the viewer surface
    pub fn viewer_changed(&self, camera: Camera) {
        if let Some(camera) = self.mirror.viewer_changed(camera) {
            self.controller.on_viewer_camera(camera);
        }
    }

    pub fn pointer_down(&self) {
        self.mirror.pointer_down();
    }

    pub fn pointer_up(&self) {
        self.mirror.pointer_up();
    }

    /// A surface announced itself; its layout echo is not an edit
    pub fn surface_mounted(&self, role: SurfaceRole) {
        if role == SurfaceRole::Editor {
            self.controller
                .suppress_changes_for(self.controller.config().echo_suppression);
        }
        self.mirror.surface_mounted(role);
    }

    pub fn suppress_changes_for(&self, window: Duration) {
        self.controller.suppress_changes_for(window);
    }

    /// A stored document changed. Returns whether it was applied.
    pub fn external_update(&self, update: DocumentUpdate) -> bool {
        if update.origin == Some(self.controller.origin()) {
            debug!("Dropping echo of own save of {}", update.document.subject_id);
            return false;
        }
        let subject = update.document.subject_id.clone();
        self.controller.on_external_update(&subject, update.document)
    }

    pub fn companion_loaded(&self, subject: &SubjectId, record: CompanionRecord) -> bool {
        let flipped = self.controller.companion_loaded(subject, record);
        self.after_gate_change(flipped);
        flipped
    }

    pub fn cell_loaded(
        &self,
        subject: &SubjectId,
        row: usize,
        field: CompanionField,
        value: Option<String>,
    ) -> bool {
        let flipped = self.controller.cell_loaded(subject, row, field, value);
        self.after_gate_change(flipped);
        flipped
    }

    pub fn recompute_unlock(&self) -> bool {
        let was_unlocked = self.controller.is_unlocked();
        let unlocked = self.controller.recompute_unlock();
        self.after_gate_change(unlocked != was_unlocked);
        unlocked
    }

    fn after_gate_change(&self, flipped: bool) {
        if !flipped || !self.controller.is_unlocked() {
            return;
        }
        let latest = self.latest.lock().clone();
        if let Some(change) = latest {
            info!("Unlocked, replaying latest canvas state");
            self.controller.process_change(change);
        }
    }

    /// Tab hidden or page unloading: save what we have without waiting
    pub fn visibility_hidden(&self) -> JoinHandle<SaveOutcome> {
        self.controller.flush_in_background()
    }

    pub async fn flush_now(&self) -> SaveOutcome {
        self.controller.flush_now().await
    }

    pub fn save_status(&self) -> SaveStatus {
        self.controller.save_status()
    }

    pub fn loading(&self) -> bool {
        self.controller.loading()
    }

    /// Apply every update from `updates` until the stream ends
    pub fn follow<S>(&self, updates: S) -> JoinHandle<()>
    where
        S: Stream<Item = DocumentUpdate> + Send + 'static,
    {
        let pane = self.clone();
        tokio::spawn(async move {
            tokio::pin!(updates);
            while let Some(update) = updates.next().await {
                pane.external_update(update);
            }
            debug!("Document update stream ended");
        })
    }

    /// Follow an in-process store's update broadcast. Lagged updates are
    /// skipped; the next one carries the full document anyway.
    pub fn follow_store(&self, updates: broadcast::Receiver<DocumentUpdate>) -> JoinHandle<()> {
        self.follow(BroadcastStream::new(updates).filter_map(|update| update.ok()))
    }
}
