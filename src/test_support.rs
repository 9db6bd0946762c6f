//! Fixtures and in-memory sources shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::autosave::{SaveDriver, SavePayload, SaveTicket, SaveTrigger, SkipReason};
use crate::scene::{AppState, Camera, Document, Element, Scene, SubjectId};
use crate::source::{LoadError, Loader, PersistError, Persister, SaveRequest};
use crate::surface::{RenderSurface, SceneUpdate, SurfaceError};
use crate::unlock::CompanionRecord;

pub fn element(i: usize) -> Element {
    Element::new(json!({
        "id": format!("el-{}", i),
        "type": "rectangle",
        "x": i as f64 * 10.0,
        "y": 0.0,
        "width": 40.0,
        "height": 20.0,
        "version": 1
    }))
}

pub fn elements(n: usize) -> Vec<Element> {
    (0..n).map(element).collect()
}

pub fn document(subject: &str, n: usize) -> Document {
    Document::new(
        SubjectId::new(subject),
        Scene::new(elements(n), AppState::default(), Default::default()),
    )
}

pub fn payload(subject: &str, binding: u64, n: usize) -> SavePayload {
    SavePayload {
        subject_id: SubjectId::new(subject),
        binding,
        scene: Scene::new(elements(n), AppState::default(), Default::default()),
        viewer_camera: Camera::default(),
        editor_camera: Camera::default(),
    }
}

pub fn valid_companion() -> CompanionRecord {
    CompanionRecord::new("Ada Lovelace", "+254712345678")
}

/// In-memory loader that records every call
#[derive(Default)]
pub struct MockLoader {
    documents: Mutex<HashMap<SubjectId, Document>>,
    calls: Mutex<Vec<SubjectId>>,
    delay: Mutex<Option<Duration>>,
    always_fail: bool,
    fail_next: AtomicBool,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn insert(&self, document: Document) {
        self.documents
            .lock()
            .insert(document.subject_id.clone(), document);
    }

    pub fn calls(&self) -> Vec<SubjectId> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Loader for MockLoader {
    async fn load(&self, subject: &SubjectId) -> Result<Option<Document>, LoadError> {
        self.calls.lock().push(subject.clone());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.always_fail || self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LoadError::Transport("connection refused".into()));
        }
        Ok(self.documents.lock().get(subject).cloned())
    }
}

/// In-memory persister tracking completed saves and concurrency
#[derive(Default)]
pub struct MockPersister {
    saves: Mutex<Vec<(SubjectId, SaveRequest)>>,
    delay: Mutex<Option<Duration>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    fail_next: AtomicBool,
}

impl MockPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Successful saves in completion order
    pub fn saves(&self) -> Vec<(SubjectId, SaveRequest)> {
        self.saves.lock().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Persister for MockPersister {
    async fn save(&self, subject: &SubjectId, request: SaveRequest) -> Result<(), PersistError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PersistError::Rejected {
                status: 500,
                message: "internal error".into(),
            });
        }
        self.saves.lock().push((subject.clone(), request));
        Ok(())
    }
}

/// Save driver that grants every ticket and logs each step
#[derive(Default)]
pub struct RecordingDriver {
    log: Mutex<Vec<String>>,
    persisted: Mutex<Vec<usize>>,
    refuse: Option<SkipReason>,
    fail: bool,
    delay: Option<Duration>,
    next_ticket: AtomicUsize,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing(mut self, reason: SkipReason) -> Self {
        self.refuse = Some(reason);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Element counts of the persisted payloads, in start order
    pub fn persisted(&self) -> Vec<usize> {
        self.persisted.lock().clone()
    }
}

#[async_trait]
impl SaveDriver for RecordingDriver {
    fn begin(&self, payload: &SavePayload, trigger: SaveTrigger) -> Result<SaveTicket, SkipReason> {
        self.log.lock().push(format!("begin:{}", trigger));
        if let Some(reason) = self.refuse {
            return Err(reason);
        }
        Ok(SaveTicket {
            id: self.next_ticket.fetch_add(1, Ordering::SeqCst) as u64 + 1,
            binding: payload.binding,
            subject_id: payload.subject_id.clone(),
            trigger,
            visible: true,
            content: payload.scene.signature(),
            viewer_camera: payload.viewer_camera.signature(),
            editor_camera: payload.editor_camera.signature(),
        })
    }

    fn on_saving(&self, _ticket: &SaveTicket) {
        self.log.lock().push("saving".into());
    }

    async fn persist(&self, payload: &SavePayload) -> Result<(), PersistError> {
        let n = payload.scene.elements.len();
        self.log.lock().push(format!("persist:{}", n));
        self.persisted.lock().push(n);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(PersistError::Transport("connection reset".into()));
        }
        Ok(())
    }

    fn on_saved(&self, _ticket: SaveTicket) {
        self.log.lock().push("saved".into());
    }

    fn on_error(&self, _ticket: SaveTicket, _error: &PersistError) {
        self.log.lock().push("error".into());
    }
}

/// Render surface that records what it was asked to draw
#[derive(Default)]
pub struct RecordingSurface {
    applied: Mutex<Vec<SceneUpdate>>,
    refreshes: AtomicUsize,
    unmounted: AtomicBool,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unmounted() -> Self {
        let surface = Self::default();
        surface.unmounted.store(true, Ordering::SeqCst);
        surface
    }

    pub fn mount(&self) {
        self.unmounted.store(false, Ordering::SeqCst);
    }

    pub fn applied(&self) -> Vec<SceneUpdate> {
        self.applied.lock().clone()
    }

    pub fn last(&self) -> Option<SceneUpdate> {
        self.applied.lock().last().cloned()
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl RenderSurface for RecordingSurface {
    fn apply_scene(&self, update: SceneUpdate) -> Result<(), SurfaceError> {
        if self.unmounted.load(Ordering::SeqCst) {
            return Err(SurfaceError::NotReady);
        }
        self.applied.lock().push(update);
        Ok(())
    }

    fn refresh_layout(&self) -> Result<(), SurfaceError> {
        if self.unmounted.load(Ordering::SeqCst) {
            return Err(SurfaceError::NotReady);
        }
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
