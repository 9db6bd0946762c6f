//! Per-binding session state and its transitions.
//!
//! Everything here is synchronous and side-effect free apart from mutating
//! the state itself; the controller calls in under its lock and performs the
//! scheduling and publishing the returned values ask for.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::autosave::{SavePayload, SaveTicket, SaveTrigger, SkipReason};
use crate::scene::{
    AppState, Camera, CameraSignature, Document, Elements, Files, Scene, Signature, SubjectId,
};
use crate::unlock::{UnlockGate, UnlockRules};

/// User-visible save state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Dirty,
    Saving,
    Saved(DateTime<Utc>),
    Error(String),
}

impl SaveStatus {
    pub fn is_dirty(&self) -> bool {
        matches!(self, SaveStatus::Dirty)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SaveStatus::Idle => "idle",
            SaveStatus::Dirty => "dirty",
            SaveStatus::Saving => "saving",
            SaveStatus::Saved(_) => "saved",
            SaveStatus::Error(_) => "error",
        }
    }
}

impl fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveStatus::Saved(at) => write!(f, "saved ({})", at.format("%H:%M:%S")),
            SaveStatus::Error(message) => write!(f, "error: {}", message),
            other => f.write_str(other.label()),
        }
    }
}

/// One change notification from the editor surface
#[derive(Debug, Clone)]
pub struct CanvasChange {
    pub elements: Elements,
    pub app_state: AppState,
    pub files: Files,
    /// Viewer camera, when the caller tracks it alongside the change
    pub viewer_camera: Option<Camera>,
    /// Editor camera; defaults to the camera inside `app_state`
    pub editor_camera: Option<Camera>,
}

impl CanvasChange {
    pub fn new(elements: Elements, app_state: AppState, files: Files) -> Self {
        Self {
            elements,
            app_state,
            files,
            viewer_camera: None,
            editor_camera: None,
        }
    }

    pub fn with_viewer_camera(mut self, camera: Camera) -> Self {
        self.viewer_camera = Some(camera);
        self
    }

    pub fn with_editor_camera(mut self, camera: Camera) -> Self {
        self.editor_camera = Some(camera);
        self
    }
}

/// Why a change notification was dropped without a look at its content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NoSubject,
    Locked,
    SceneNotApplied,
    Suppressed,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Intake {
    Ignored(IgnoreReason),
    /// Nothing differs from the last save
    Unchanged,
    /// Something is save-worthy; schedule this payload
    Accepted(SavePayload),
}

#[derive(Debug, Default)]
struct Baselines {
    content: Option<Signature>,
    viewer: Option<CameraSignature>,
    editor: Option<CameraSignature>,
    saved_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct InFlight {
    ticket: u64,
    subject: SubjectId,
    /// Cleared when an external update lands while this persist runs
    authoritative: bool,
}

pub(crate) struct SessionState {
    pub(crate) subject: Option<SubjectId>,
    pub(crate) binding: u64,
    pub(crate) status: SaveStatus,
    pub(crate) loading: bool,
    pub(crate) initial_scene_applied: bool,
    pub(crate) gate: UnlockGate,
    baselines: Baselines,
    edits_during_save: bool,
    /// An idle or flush save found a persist in flight and was dropped
    retry_after_save: bool,
    in_flight: Option<InFlight>,
    next_ticket: u64,
    suppressed_until: Option<Instant>,
    global_suppressed_until: Option<Instant>,
    observed_elements: Option<Elements>,
    scene: Scene,
    viewer_camera: Camera,
    editor_camera: Camera,
}

impl SessionState {
    pub(crate) fn new(rules: UnlockRules) -> Self {
        Self {
            subject: None,
            binding: 0,
            status: SaveStatus::Idle,
            loading: false,
            initial_scene_applied: false,
            gate: UnlockGate::new(rules),
            baselines: Baselines::default(),
            edits_during_save: false,
            retry_after_save: false,
            in_flight: None,
            next_ticket: 1,
            suppressed_until: None,
            global_suppressed_until: None,
            observed_elements: None,
            scene: Scene::default(),
            viewer_camera: Camera::default(),
            editor_camera: Camera::default(),
        }
    }

    /// Start a fresh binding. Every tracker of the previous subject is
    /// dropped; an outstanding persist keeps its guard until it resolves.
    pub(crate) fn bind(&mut self, subject: Option<SubjectId>, now: Instant, suppression: Duration) -> u64 {
        self.binding += 1;
        self.subject = subject.filter(SubjectId::is_real);
        self.gate.bind(self.subject.clone());

        self.status = SaveStatus::Idle;
        self.loading = false;
        self.initial_scene_applied = false;
        self.baselines = Baselines::default();
        self.edits_during_save = false;
        self.retry_after_save = false;
        self.suppressed_until = Some(now + suppression);
        self.observed_elements = None;
        self.scene = Scene::default();
        self.viewer_camera = Camera::default();
        self.editor_camera = Camera::default();

        self.binding
    }

    pub(crate) fn is_suppressed(&self, now: Instant) -> bool {
        let active = |until: Option<Instant>| until.map(|t| now < t).unwrap_or(false);
        active(self.suppressed_until) || active(self.global_suppressed_until)
    }

    /// Ignore every change until `until`, whatever the binding
    pub(crate) fn suppress_all_until(&mut self, until: Instant) {
        self.global_suppressed_until = Some(
            self.global_suppressed_until
                .map(|t| t.max(until))
                .unwrap_or(until),
        );
    }

    fn check_gates(&self, now: Instant) -> Result<(), IgnoreReason> {
        if self.subject.is_none() {
            return Err(IgnoreReason::NoSubject);
        }
        if !self.gate.is_unlocked() {
            return Err(IgnoreReason::Locked);
        }
        if !self.initial_scene_applied {
            return Err(IgnoreReason::SceneNotApplied);
        }
        if self.is_suppressed(now) {
            return Err(IgnoreReason::Suppressed);
        }
        Ok(())
    }

    /// Whether a persist for the bound subject is outstanding
    pub(crate) fn is_saving(&self) -> bool {
        match (&self.in_flight, &self.subject) {
            (Some(flight), Some(subject)) => flight.subject == *subject,
            _ => false,
        }
    }

    pub(crate) fn edits_during_save(&self) -> bool {
        self.edits_during_save
    }

    /// Classify and record one editor change
    pub(crate) fn intake(&mut self, change: CanvasChange, now: Instant) -> Intake {
        if let Err(reason) = self.check_gates(now) {
            return Intake::Ignored(reason);
        }

        let content_changed = match &self.observed_elements {
            Some(observed) => {
                !Arc::ptr_eq(observed, &change.elements) || observed.len() != change.elements.len()
            }
            None => true,
        };

        let viewer = change.viewer_camera.unwrap_or(self.viewer_camera);
        let editor = change.editor_camera.unwrap_or(change.app_state.camera);
        let viewer_changed = self.baselines.viewer != Some(viewer.signature());
        let editor_changed = self.baselines.editor != Some(editor.signature());

        self.observed_elements = Some(change.elements.clone());
        self.scene = Scene {
            elements: change.elements,
            app_state: change.app_state,
            files: change.files,
        };
        self.viewer_camera = viewer;
        self.editor_camera = editor;

        if !(content_changed || viewer_changed || editor_changed) {
            return Intake::Unchanged;
        }

        let dirty_worthy = content_changed || editor_changed;
        if self.is_saving() {
            if dirty_worthy {
                self.edits_during_save = true;
                // A visible save keeps showing `saving` until it resolves
                if self.status != SaveStatus::Saving {
                    self.status = SaveStatus::Dirty;
                }
            }
        } else if dirty_worthy && !self.status.is_dirty() {
            self.status = SaveStatus::Dirty;
        }

        match self.current_payload() {
            Some(payload) => Intake::Accepted(payload),
            None => Intake::Unchanged,
        }
    }

    /// Record a viewer pan/zoom; it is folded into the next save silently
    pub(crate) fn viewer_camera_moved(&mut self, camera: Camera, now: Instant) -> Intake {
        if self.subject.is_none() {
            return Intake::Ignored(IgnoreReason::NoSubject);
        }
        self.viewer_camera = camera;

        if let Err(reason) = self.check_gates(now) {
            return Intake::Ignored(reason);
        }
        if self.baselines.viewer == Some(camera.signature()) {
            return Intake::Unchanged;
        }
        match self.current_payload() {
            Some(payload) => Intake::Accepted(payload),
            None => Intake::Unchanged,
        }
    }

    /// Latest observed state of the bound subject, once its scene is applied
    pub(crate) fn current_payload(&self) -> Option<SavePayload> {
        let subject = self.subject.as_ref()?;
        if !self.initial_scene_applied {
            return None;
        }
        Some(SavePayload {
            subject_id: subject.clone(),
            binding: self.binding,
            scene: self.scene.clone(),
            viewer_camera: self.viewer_camera,
            editor_camera: self.editor_camera,
        })
    }

    pub(crate) fn begin_save(
        &mut self,
        payload: &SavePayload,
        trigger: SaveTrigger,
        now: DateTime<Utc>,
    ) -> Result<SaveTicket, SkipReason> {
        if payload.binding != self.binding || self.subject.as_ref() != Some(&payload.subject_id) {
            return Err(SkipReason::StaleBinding);
        }
        if !self.gate.is_unlocked() {
            return Err(SkipReason::Locked);
        }
        if !self.initial_scene_applied {
            return Err(SkipReason::SceneNotApplied);
        }
        if self.is_saving() {
            if trigger != SaveTrigger::Heartbeat {
                self.retry_after_save = true;
            }
            return Err(SkipReason::InFlight);
        }

        let content = payload.scene.signature();
        let viewer_camera = payload.viewer_camera.signature();
        let editor_camera = payload.editor_camera.signature();

        let content_changed = self.baselines.content.as_ref() != Some(&content);
        let editor_changed = self.baselines.editor != Some(editor_camera);
        let viewer_changed = self.baselines.viewer != Some(viewer_camera);

        if !(content_changed || editor_changed || viewer_changed) {
            // Edited and then undone back to the saved state
            if self.status.is_dirty() {
                self.status = SaveStatus::Saved(self.baselines.saved_at.unwrap_or(now));
            }
            return Err(SkipReason::Unchanged);
        }

        let id = self.next_ticket;
        self.next_ticket += 1;
        self.in_flight = Some(InFlight {
            ticket: id,
            subject: payload.subject_id.clone(),
            authoritative: true,
        });
        self.edits_during_save = false;
        self.retry_after_save = false;

        Ok(SaveTicket {
            id,
            binding: payload.binding,
            subject_id: payload.subject_id.clone(),
            trigger,
            visible: content_changed || editor_changed,
            content,
            viewer_camera,
            editor_camera,
        })
    }

    pub(crate) fn mark_saving(&mut self, ticket: &SaveTicket) {
        if ticket.visible && ticket.binding == self.binding {
            self.status = SaveStatus::Saving;
        }
    }

    /// Release the in-flight guard held by `ticket`; returns whether the
    /// persist was still authoritative
    fn release(&mut self, ticket: &SaveTicket) -> bool {
        match self.in_flight.take() {
            Some(flight) if flight.ticket == ticket.id => flight.authoritative,
            other => {
                debug!("Save ticket {} resolved without holding the guard", ticket.id);
                self.in_flight = other;
                false
            }
        }
    }

    /// A persist succeeded. Returns the payload to schedule next, if edits
    /// raced with it.
    pub(crate) fn finish_save(&mut self, ticket: &SaveTicket, now: DateTime<Utc>) -> Option<SavePayload> {
        let authoritative = self.release(ticket);
        if self.subject.as_ref() != Some(&ticket.subject_id) {
            return None;
        }

        let current = ticket.binding == self.binding && authoritative;
        if current {
            self.baselines.content = Some(ticket.content.clone());
            self.baselines.viewer = Some(ticket.viewer_camera);
            self.baselines.editor = Some(ticket.editor_camera);
            if ticket.visible {
                self.baselines.saved_at = Some(now);
            }
        }

        let edits = std::mem::take(&mut self.edits_during_save);
        let retry = std::mem::take(&mut self.retry_after_save);

        if edits {
            self.status = SaveStatus::Dirty;
            return self.current_payload();
        }
        if retry {
            return self.current_payload();
        }

        if current {
            if ticket.visible {
                self.status = SaveStatus::Saved(now);
            } else if self.status.is_dirty() || self.status == SaveStatus::Saving {
                self.status = SaveStatus::Saved(self.baselines.saved_at.unwrap_or(now));
            }
        }
        None
    }

    /// A persist failed. Returns the payload to retry with, if edits or a
    /// skipped save raced with it.
    pub(crate) fn fail_save(&mut self, ticket: &SaveTicket, message: String) -> Option<SavePayload> {
        let authoritative = self.release(ticket);
        if self.subject.as_ref() != Some(&ticket.subject_id) {
            return None;
        }

        let edits = std::mem::take(&mut self.edits_during_save);
        let retry = std::mem::take(&mut self.retry_after_save);

        if ticket.binding == self.binding && authoritative && (ticket.visible || edits) {
            self.status = SaveStatus::Error(message);
        }

        if edits || retry {
            return self.current_payload();
        }
        None
    }

    /// Take a loaded or pushed document as the new saved state.
    ///
    /// Returns `None` when the document is for another subject, otherwise
    /// whether this is the first document applied for the binding.
    pub(crate) fn reconcile(
        &mut self,
        subject: &SubjectId,
        document: &Document,
        now: Instant,
        wall: DateTime<Utc>,
        echo_suppression: Duration,
    ) -> Option<bool> {
        if self.subject.as_ref() != Some(subject) {
            return None;
        }

        let initial = !self.initial_scene_applied;
        let viewer = document.viewer_camera_or_default();
        let editor = document.editor_camera_or_scene();

        self.baselines = Baselines {
            content: Some(document.scene.signature()),
            viewer: Some(viewer.signature()),
            editor: Some(editor.signature()),
            saved_at: Some(wall),
        };

        if let Some(flight) = self.in_flight.as_mut() {
            if flight.subject == *subject {
                flight.authoritative = false;
            }
        }
        self.edits_during_save = false;
        self.retry_after_save = false;

        self.status = SaveStatus::Saved(wall);
        self.loading = false;
        let echo_until = now + echo_suppression;
        self.suppressed_until = Some(self.suppressed_until.map(|t| t.max(echo_until)).unwrap_or(echo_until));
        self.initial_scene_applied = true;

        self.observed_elements = Some(document.scene.elements.clone());
        self.scene = document.scene.clone();
        self.viewer_camera = viewer;
        self.editor_camera = editor;

        Some(initial)
    }

    pub(crate) fn load_failed(&mut self, binding: u64, message: String) -> bool {
        if binding != self.binding {
            return false;
        }
        self.loading = false;
        self.status = SaveStatus::Error(message);
        true
    }
}
