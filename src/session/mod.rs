//! Document session controller.
//!
//! One [`SessionController`] owns "the document currently shown in this
//! editor/viewer pair". It binds subjects and loads their documents, takes
//! change notifications from the editor, drives the idle and heartbeat
//! autosaves, reconciles documents arriving from outside and publishes the
//! save status.
//!
//! All state lives in one [`SessionState`] behind a `parking_lot` mutex that is
//! never held across an `.await`. Persist calls are the only suspension
//! points; everything they race with is settled by ticket and binding checks
//! when they resolve.

mod events;
mod state;
mod throttle;

pub use events::{EventBus, SessionEvent};
pub use state::{CanvasChange, IgnoreReason, SaveStatus};
pub use throttle::{Sink, Throttle};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::autosave::{
    HeartbeatScheduler, IdleScheduler, PayloadSource, SaveDriver, SaveOutcome, SavePayload,
    SaveTicket, SaveTrigger, SkipReason,
};
use crate::config::SessionConfig;
use crate::scene::{Camera, Document, SubjectId};
use crate::source::{load_or_seed, LoadError, Loader, PersistError, Persister, SaveRequest};
use crate::unlock::{CompanionField, CompanionRecord};
use state::{Intake, SessionState};

/// Receives binding and document notifications, outside the session lock
pub trait SessionObserver: Send + Sync {
    fn subject_bound(&self, _binding: u64, _subject: Option<&SubjectId>) {}

    fn document_applied(&self, _binding: u64, _document: &Document, _initial: bool) {}
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    loader: Arc<dyn Loader>,
    persister: Arc<dyn Persister>,
    /// Stamped on every save so this session can recognise its own echoes
    origin: Uuid,
    state: Mutex<SessionState>,
    idle: IdleScheduler,
    heartbeat: HeartbeatScheduler,
    throttle: Throttle<CanvasChange>,
    events: EventBus,
    status_tx: watch::Sender<SaveStatus>,
    loading_tx: watch::Sender<bool>,
    load_task: Mutex<Option<JoinHandle<()>>>,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

impl SessionController {
    pub fn new(config: SessionConfig, loader: Arc<dyn Loader>, persister: Arc<dyn Persister>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let driver: Weak<dyn SaveDriver> = weak.clone();

            let intake = weak.clone();
            let throttle = Throttle::new(
                config.change_throttle,
                Arc::new(move |change: CanvasChange| {
                    if let Some(inner) = intake.upgrade() {
                        inner.process_change(change);
                    }
                }),
            );

            let (status_tx, _) = watch::channel(SaveStatus::Idle);
            let (loading_tx, _) = watch::channel(false);

            SessionInner {
                idle: IdleScheduler::new(config.idle_save_wait, driver.clone()),
                heartbeat: HeartbeatScheduler::new(config.heartbeat_interval, driver),
                throttle,
                state: Mutex::new(SessionState::new(config.unlock.clone())),
                config,
                loader,
                persister,
                origin: Uuid::new_v4(),
                events: EventBus::default(),
                status_tx,
                loading_tx,
                load_task: Mutex::new(None),
                observers: RwLock::new(Vec::new()),
            }
        });

        Self { inner }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Id stamped on this session's saves
    pub fn origin(&self) -> Uuid {
        self.inner.origin
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Bind to `subject` (or to nothing) and start loading its document.
    ///
    /// Re-selecting the bound subject is a no-op unless its load failed.
    pub fn select_subject(&self, subject: Option<SubjectId>) {
        self.inner.select_subject(subject);
    }

    /// Request the bound subject's document again, unless a load for it is
    /// already outstanding. Returns whether a load was started.
    pub fn reload(&self) -> bool {
        self.inner.reload()
    }

    /// Raw change notification from the editor surface; throttled
    pub fn on_canvas_change(&self, change: CanvasChange) {
        self.inner.throttle.call(change);
    }

    /// Run change intake immediately, bypassing the throttle
    pub fn process_change(&self, change: CanvasChange) {
        self.inner.throttle.cancel();
        self.inner.process_change(change);
    }

    /// The viewer surface moved its camera
    pub fn on_viewer_camera(&self, camera: Camera) {
        self.inner.on_viewer_camera(camera);
    }

    /// A document for `subject` arrived from outside this session.
    /// Returns whether it was applied.
    pub fn on_external_update(&self, subject: &SubjectId, document: Document) -> bool {
        self.inner.apply_document(None, subject, document)
    }

    /// Ignore change notifications for `window` (fullscreen transitions etc.)
    pub fn suppress_changes_for(&self, window: Duration) {
        let until = Instant::now() + window;
        self.inner.state.lock().suppress_all_until(until);
        debug!("Suppressing canvas changes for {:?}", window);
    }

    /// Save the latest observed state now
    pub async fn flush_now(&self) -> SaveOutcome {
        self.inner.flush_now().await
    }

    /// Best-effort flush for tab-hide and unload
    pub fn flush_in_background(&self) -> JoinHandle<SaveOutcome> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.flush_now().await })
    }

    pub fn start_heartbeat(&self) {
        let binding = self.inner.state.lock().binding;
        self.inner
            .heartbeat
            .start(SessionInner::payload_source(&self.inner, binding));
    }

    pub fn stop_heartbeat(&self) {
        self.inner.heartbeat.stop();
    }

    pub fn heartbeat_running(&self) -> bool {
        self.inner.heartbeat.is_running()
    }

    pub fn save_status(&self) -> SaveStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SaveStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn loading(&self) -> bool {
        *self.inner.loading_tx.borrow()
    }

    pub fn subscribe_loading(&self) -> watch::Receiver<bool> {
        self.inner.loading_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn subject(&self) -> Option<SubjectId> {
        self.inner.state.lock().subject.clone()
    }

    pub fn binding(&self) -> u64 {
        self.inner.state.lock().binding
    }

    pub fn is_saving(&self) -> bool {
        self.inner.state.lock().is_saving()
    }

    pub fn idle_save_pending(&self) -> bool {
        self.inner.idle.is_pending()
    }

    pub fn is_unlocked(&self) -> bool {
        self.inner.state.lock().gate.is_unlocked()
    }

    /// Companion record for `subject` loaded. Returns whether the gate flipped.
    pub fn companion_loaded(&self, subject: &SubjectId, record: CompanionRecord) -> bool {
        self.inner
            .update_gate(|state| state.gate.companion_loaded(subject, record))
    }

    /// One companion cell loaded. Returns whether the gate flipped.
    pub fn cell_loaded(
        &self,
        subject: &SubjectId,
        row: usize,
        field: CompanionField,
        value: Option<String>,
    ) -> bool {
        self.inner
            .update_gate(|state| state.gate.cell_loaded(subject, row, field, value))
    }

    /// Re-evaluate the unlock rules; returns the resulting lock state
    pub fn recompute_unlock(&self) -> bool {
        self.inner.update_gate(|state| state.gate.recompute());
        self.is_unlocked()
    }
}

impl SessionInner {
    /// Push status and loading to their watchers. Called with the state lock
    /// held so observers see transitions in order.
    fn publish_locked(&self, state: &SessionState) {
        let status = state.status.clone();
        let changed = self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status.clone();
                true
            } else {
                false
            }
        });
        if changed {
            trace!("Save status -> {}", status);
            self.events.publish(SessionEvent::StatusChanged(status));
        }

        let loading = state.loading;
        if self.loading_tx.send_if_modified(|current| {
            if *current != loading {
                *current = loading;
                true
            } else {
                false
            }
        }) {
            self.events.publish(SessionEvent::LoadingChanged(loading));
        }
    }

    fn observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.observers.read().clone()
    }

    fn select_subject(self: &Arc<Self>, subject: Option<SubjectId>) {
        let subject = subject.filter(SubjectId::is_real);

        {
            let state = self.state.lock();
            if state.subject == subject
                && subject.is_some()
                && (state.loading || state.initial_scene_applied)
            {
                debug!("Subject {:?} already bound", subject);
                return;
            }
        }

        self.idle.cancel();
        self.throttle.cancel();
        if let Some(task) = self.load_task.lock().take() {
            task.abort();
        }

        let (binding, was_unlocked) = {
            let mut state = self.state.lock();
            let was_unlocked = state.gate.is_unlocked();
            let binding = state.bind(subject.clone(), Instant::now(), self.config.switch_suppression);
            state.loading = subject.is_some();
            self.publish_locked(&state);
            (binding, was_unlocked)
        };

        match &subject {
            Some(subject) => info!("Bound session to {} (binding {})", subject, binding),
            None => info!("Session unbound (binding {})", binding),
        }

        self.events.publish(SessionEvent::SubjectBound {
            subject_id: subject.clone(),
            binding,
        });
        if was_unlocked {
            self.events.publish(SessionEvent::UnlockChanged {
                subject_id: subject.clone(),
                unlocked: false,
            });
        }
        for observer in self.observers() {
            observer.subject_bound(binding, subject.as_ref());
        }

        self.heartbeat.rebind(Self::payload_source(self, binding));

        if let Some(subject) = subject {
            self.spawn_load(binding, subject);
        }
    }

    fn spawn_load(self: &Arc<Self>, binding: u64, subject: SubjectId) {
        let loader = self.loader.clone();
        let weak = Arc::downgrade(self);

        debug!("Loading {}", subject);
        let handle = tokio::spawn(async move {
            // No timeout: autosave stays blocked until the document arrives
            let result = load_or_seed(loader.as_ref(), &subject).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(document) => {
                    inner.apply_document(Some(binding), &subject, document);
                }
                Err(e) => inner.load_failed(binding, &subject, e),
            }
        });

        *self.load_task.lock() = Some(handle);
    }

    fn reload(self: &Arc<Self>) -> bool {
        let (subject, binding) = {
            let state = self.state.lock();
            (state.subject.clone(), state.binding)
        };
        let Some(subject) = subject else {
            return false;
        };

        let task_running = self
            .load_task
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false);
        if task_running || self.loader.is_loading(&subject) {
            debug!("Load of {} already in flight, not requesting again", subject);
            return false;
        }

        {
            let mut state = self.state.lock();
            state.loading = true;
            self.publish_locked(&state);
        }
        self.spawn_load(binding, subject);
        true
    }

    fn load_failed(&self, binding: u64, subject: &SubjectId, error: LoadError) {
        let applied = {
            let mut state = self.state.lock();
            let applied = state.load_failed(binding, format!("Load failed: {}", error));
            self.publish_locked(&state);
            applied
        };
        if applied {
            warn!("Loading {} failed: {}", subject, error);
            self.events.publish(SessionEvent::LoadFailed {
                subject_id: subject.clone(),
                message: error.to_string(),
            });
        }
    }

    /// Reconcile a loaded (`binding` set) or pushed (`None`) document
    fn apply_document(&self, binding: Option<u64>, subject: &SubjectId, document: Document) -> bool {
        let (initial, bound) = {
            let mut state = self.state.lock();
            if binding.map(|b| b != state.binding).unwrap_or(false) {
                debug!("Dropping load of {} for an earlier binding", subject);
                return false;
            }
            let reconciled = state.reconcile(
                subject,
                &document,
                Instant::now(),
                Utc::now(),
                self.config.echo_suppression,
            );
            let Some(initial) = reconciled else {
                debug!("Ignoring document for unbound subject {}", subject);
                return false;
            };
            self.publish_locked(&state);
            (initial, state.binding)
        };

        if initial {
            info!(
                "Applied document {} ({} elements)",
                subject,
                document.scene.elements.len()
            );
        } else {
            debug!("Reconciled external update for {}", subject);
        }

        self.events.publish(SessionEvent::ExternalUpdateApplied {
            subject_id: subject.clone(),
            initial,
        });
        for observer in self.observers() {
            observer.document_applied(bound, &document, initial);
        }
        true
    }

    fn process_change(&self, change: CanvasChange) {
        let intake = {
            let mut state = self.state.lock();
            let intake = state.intake(change, Instant::now());
            self.publish_locked(&state);
            intake
        };

        match intake {
            Intake::Accepted(payload) => self.idle.schedule(payload),
            Intake::Ignored(reason) => trace!("Canvas change ignored: {:?}", reason),
            Intake::Unchanged => {}
        }
    }

    fn on_viewer_camera(&self, camera: Camera) {
        let intake = self.state.lock().viewer_camera_moved(camera, Instant::now());
        if let Intake::Accepted(payload) = intake {
            self.idle.schedule(payload);
        }
    }

    async fn flush_now(&self) -> SaveOutcome {
        // Run a buffered change first so the flush carries it
        self.throttle.flush();

        let payload = self.state.lock().current_payload();
        match payload {
            Some(payload) => self.idle.flush_immediate(payload).await,
            None => SaveOutcome::Skipped(SkipReason::SceneNotApplied),
        }
    }

    fn update_gate(&self, apply: impl FnOnce(&mut SessionState) -> bool) -> bool {
        let (changed, unlocked, subject) = {
            let mut state = self.state.lock();
            let changed = apply(&mut state);
            (changed, state.gate.is_unlocked(), state.subject.clone())
        };

        if changed {
            if !unlocked {
                self.idle.cancel();
            }
            self.events.publish(SessionEvent::UnlockChanged {
                subject_id: subject,
                unlocked,
            });
        }
        changed
    }

    /// Heartbeat getter pulling the current state of `binding`
    fn payload_source(this: &Arc<Self>, binding: u64) -> PayloadSource {
        let weak = Arc::downgrade(this);
        Arc::new(move || {
            let inner = weak.upgrade()?;
            let state = inner.state.lock();
            if state.binding != binding {
                return None;
            }
            state.current_payload()
        })
    }
}

#[async_trait]
impl SaveDriver for SessionInner {
    fn begin(&self, payload: &SavePayload, trigger: SaveTrigger) -> Result<SaveTicket, SkipReason> {
        let result = {
            let mut state = self.state.lock();
            let result = state.begin_save(payload, trigger, Utc::now());
            self.publish_locked(&state);
            result
        };

        if result.is_ok() {
            self.events.publish(SessionEvent::PersistRequested {
                subject_id: payload.subject_id.clone(),
                trigger,
            });
        }
        result
    }

    fn on_saving(&self, ticket: &SaveTicket) {
        let mut state = self.state.lock();
        state.mark_saving(ticket);
        self.publish_locked(&state);
    }

    async fn persist(&self, payload: &SavePayload) -> Result<(), PersistError> {
        let request = SaveRequest {
            scene: payload.scene.clone(),
            viewer_camera: payload.viewer_camera,
            editor_camera: payload.editor_camera,
            origin: Some(self.origin),
        };
        self.persister.save(&payload.subject_id, request).await
    }

    fn on_saved(&self, ticket: SaveTicket) {
        let reschedule = {
            let mut state = self.state.lock();
            let reschedule = state.finish_save(&ticket, Utc::now());
            self.publish_locked(&state);
            reschedule
        };

        info!("Saved {} ({} save)", ticket.subject_id, ticket.trigger);
        self.events.publish(SessionEvent::PersistFinished {
            subject_id: ticket.subject_id.clone(),
            outcome: SaveOutcome::Saved,
        });

        if let Some(payload) = reschedule {
            debug!("Edits raced the save of {}, rescheduling", payload.subject_id);
            self.idle.schedule(payload);
        }
    }

    fn on_error(&self, ticket: SaveTicket, error: &PersistError) {
        let retry = {
            let mut state = self.state.lock();
            let retry = state.fail_save(&ticket, error.to_string());
            self.publish_locked(&state);
            retry
        };
        self.events.publish(SessionEvent::PersistFinished {
            subject_id: ticket.subject_id.clone(),
            outcome: SaveOutcome::Failed(error.to_string()),
        });

        if let Some(payload) = retry {
            debug!("Edits raced the failed save of {}, retrying", payload.subject_id);
            self.idle.schedule(payload);
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(task) = self.load_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{AppState, Files};
    use crate::test_support::{document, elements, valid_companion, MockLoader, MockPersister};

    struct Harness {
        controller: SessionController,
        loader: Arc<MockLoader>,
        persister: Arc<MockPersister>,
    }

    fn harness(config: SessionConfig) -> Harness {
        let loader = Arc::new(MockLoader::new());
        let persister = Arc::new(MockPersister::new());
        let controller = SessionController::new(config, loader.clone(), persister.clone());
        Harness {
            controller,
            loader,
            persister,
        }
    }

    fn change(n: usize) -> CanvasChange {
        CanvasChange::new(Arc::new(elements(n)), AppState::default(), Files::default())
    }

    /// Collect every status published so far
    fn drain_statuses(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<&'static str> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::StatusChanged(status) = event {
                seen.push(status.label());
            }
        }
        seen
    }

    async fn open(h: &Harness, subject: &str) {
        h.controller.select_subject(Some(SubjectId::new(subject)));
        h.controller
            .companion_loaded(&SubjectId::new(subject), valid_companion());
        // Let the load task run
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_edit_save_sequence() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        let mut events = h.controller.subscribe_events();

        open(&h, "201").await;
        assert!(!h.controller.loading());
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));

        tokio::time::sleep(Duration::from_millis(400)).await;
        h.controller.on_canvas_change(change(4));
        assert_eq!(h.controller.save_status(), SaveStatus::Dirty);

        tokio::time::sleep(Duration::from_millis(2990)).await;
        assert!(h.persister.saves().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let saves = h.persister.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].0.as_str(), "201");
        assert_eq!(saves[0].1.scene.elements.len(), 4);
        assert_eq!(saves[0].1.origin, Some(h.controller.origin()));
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));

        let statuses = drain_statuses(&mut events);
        assert_eq!(statuses, vec!["saved", "dirty", "saving", "saved"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_during_save_triggers_second_save() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        h.persister.set_delay(Duration::from_millis(1000));

        open(&h, "201").await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        h.controller.on_canvas_change(change(4));

        // Idle save starts at ~3400ms and runs for 1000ms
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(h.controller.is_saving());
        assert_eq!(h.controller.save_status(), SaveStatus::Saving);

        h.controller.on_canvas_change(change(5));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(h.controller.save_status(), SaveStatus::Dirty);
        assert_eq!(h.persister.saves().len(), 1);

        tokio::time::sleep(Duration::from_millis(3000 + 1100)).await;
        let saves = h.persister.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[1].1.scene.elements.len(), 5);
        assert_eq!(h.persister.max_concurrent(), 1);
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_cancels_pending_save() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        h.loader.insert(document("305", 1));

        open(&h, "201").await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        h.controller.on_canvas_change(change(4));
        assert!(h.controller.idle_save_pending());

        h.loader.set_delay(Duration::from_millis(2000));
        h.controller.select_subject(Some(SubjectId::new("305")));
        assert!(!h.controller.idle_save_pending());
        assert!(h.controller.loading());
        assert_eq!(h.controller.save_status(), SaveStatus::Idle);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(h.controller.loading());

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert!(!h.controller.loading());
        assert!(h.persister.saves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_edits_do_not_save() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        let subject = SubjectId::new("201");

        h.controller.select_subject(Some(subject.clone()));
        h.controller.companion_loaded(
            &subject,
            CompanionRecord {
                name: Some("Ada".into()),
                phone: Some(String::new()),
            },
        );
        tokio::time::sleep(Duration::from_millis(400)).await;

        h.controller.process_change(change(4));
        assert!(!h.controller.is_unlocked());
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.persister.saves().is_empty());

        assert!(h
            .controller
            .cell_loaded(&subject, 0, CompanionField::Phone, Some("+2547123456".into())));
        assert!(h.controller.recompute_unlock());

        h.controller.process_change(change(4));
        assert_eq!(h.controller.save_status(), SaveStatus::Dirty);
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(h.persister.saves().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_suppression_swallows_mount_echo() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));

        open(&h, "201").await;
        h.controller.process_change(change(9));
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));
        assert!(!h.controller.idle_save_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_skips_unchanged() {
        let config = SessionConfig::default().with_heartbeat_interval(Duration::from_secs(10));
        let h = harness(config);
        h.loader.insert(document("201", 3));

        open(&h, "201").await;
        h.controller.start_heartbeat();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(h.persister.saves().is_empty());

        h.controller.process_change(change(4));
        // Idle save lands at ~28s; the 30s tick finds nothing new
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.persister.saves().len(), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.persister.saves().len(), 1);
        assert!(h.controller.heartbeat_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_camera_saves_silently() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        open(&h, "201").await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        let mut status = h.controller.subscribe_status();
        status.borrow_and_update();
        h.controller.on_viewer_camera(Camera::new(1.5, 120.0, 0.0));
        tokio::time::sleep(Duration::from_millis(3100)).await;

        let saves = h.persister.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].1.viewer_camera, Camera::new(1.5, 120.0, 0.0));
        assert!(!status.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_failure_then_retry() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        open(&h, "201").await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        h.persister.fail_next();
        h.controller.process_change(change(4));
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(matches!(h.controller.save_status(), SaveStatus::Error(_)));
        assert!(!h.controller.is_saving());

        h.controller.process_change(change(5));
        assert_eq!(h.controller.save_status(), SaveStatus::Dirty);
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));
        assert_eq!(h.persister.saves().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_during_camera_only_save_is_not_lost() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        h.persister.set_delay(Duration::from_millis(1000));
        open(&h, "201").await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        // Silent save of the viewer camera runs from ~3400ms to ~4400ms
        h.controller.on_viewer_camera(Camera::new(2.0, 40.0, 0.0));
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(h.controller.is_saving());
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));

        h.controller.process_change(change(4));
        assert_eq!(h.controller.save_status(), SaveStatus::Dirty);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(h.persister.saves().len(), 1);
        assert_eq!(h.controller.save_status(), SaveStatus::Dirty);

        tokio::time::sleep(Duration::from_millis(4100)).await;
        let saves = h.persister.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[1].1.scene.elements.len(), 4);
        assert_eq!(h.persister.max_concurrent(), 1);
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_after_external_update_overtakes_save() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        h.persister.set_delay(Duration::from_millis(1000));
        open(&h, "201").await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        h.controller.process_change(change(4));
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(h.controller.save_status(), SaveStatus::Saving);

        assert!(h
            .controller
            .on_external_update(&SubjectId::new("201"), document("201", 7)));
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));

        // Past the echo window
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.controller.process_change(change(8));
        assert_eq!(h.controller.save_status(), SaveStatus::Dirty);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!h.controller.is_saving());
        assert_eq!(h.controller.save_status(), SaveStatus::Dirty);

        tokio::time::sleep(Duration::from_millis(4100)).await;
        let saves = h.persister.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[1].1.scene.elements.len(), 8);
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_retries_edits_made_during_it() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        h.persister.set_delay(Duration::from_millis(5000));
        open(&h, "201").await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        // Persist runs from ~3400ms to ~8400ms and fails
        h.persister.fail_next();
        h.controller.process_change(change(4));
        tokio::time::sleep(Duration::from_millis(3100)).await;
        // Its idle save fires at ~6500ms and finds the persist in flight
        h.controller.process_change(change(5));

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert!(matches!(h.controller.save_status(), SaveStatus::Error(_)));
        assert!(h.controller.idle_save_pending());

        tokio::time::sleep(Duration::from_millis(8000)).await;
        let saves = h.persister.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].1.scene.elements.len(), 5);
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_bypasses_idle_wait() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        open(&h, "201").await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        h.controller.on_canvas_change(change(4));
        assert_eq!(h.controller.flush_now().await, SaveOutcome::Saved);
        assert_eq!(h.persister.saves().len(), 1);
        assert!(!h.controller.idle_save_pending());

        assert_eq!(
            h.controller.flush_now().await,
            SaveOutcome::Skipped(SkipReason::Unchanged)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_subject_seeded_from_template() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document(crate::scene::TEMPLATE_SUBJECT_ID, 2));

        open(&h, "777").await;
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));
        assert_eq!(
            h.loader.calls(),
            vec![SubjectId::new("777"), SubjectId::template()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_surfaces_error_and_reselect_retries() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        h.loader.fail_next();

        open(&h, "201").await;
        assert!(matches!(h.controller.save_status(), SaveStatus::Error(_)));
        assert!(!h.controller.loading());

        h.controller.select_subject(Some(SubjectId::new("201")));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(matches!(h.controller.save_status(), SaveStatus::Saved(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_skips_while_loading() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        h.loader.set_delay(Duration::from_millis(500));

        h.controller.select_subject(Some(SubjectId::new("201")));
        assert!(!h.controller.reload());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(h.controller.reload());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.loader.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_update_for_other_subject_ignored() {
        let h = harness(SessionConfig::default());
        h.loader.insert(document("201", 3));
        open(&h, "201").await;

        assert!(!h
            .controller
            .on_external_update(&SubjectId::new("305"), document("305", 1)));
        assert!(h
            .controller
            .on_external_update(&SubjectId::new("201"), document("201", 6)));
    }
}
