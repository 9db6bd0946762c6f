//! Dual-canvas mirror.
//!
//! Keeps the read-only viewer surface showing what the editor surface shows,
//! while the viewer keeps its own camera. During a pointer interaction every
//! change is pushed to the viewer synchronously (elements only); otherwise
//! changes are coalesced to one full frame per display frame.
//!
//! The mirror also performs the one programmatic scene push into the editor
//! for each subject binding. Surface failures never propagate: the mirror is
//! best-effort and a dropped frame is superseded by the next one.

mod frame;

pub use frame::FrameQueue;

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

use crate::scene::{Camera, CameraSignature, Document, Elements, Files, SubjectId};
use crate::session::SessionObserver;
use crate::surface::{RenderSurface, SceneUpdate, SurfaceError, SurfaceRole};

#[derive(Debug, Default)]
struct MirrorState {
    binding: u64,
    pointer_active: bool,
    /// Latest full frame seen during a pointer interaction
    stashed_frame: Option<SceneUpdate>,
    viewer_camera: Camera,
    viewer_signature: Option<CameraSignature>,
    /// The editor received this binding's scene
    initial_applied: bool,
    /// Initial scene waiting for the editor to mount
    stashed_initial: Option<SceneUpdate>,
    /// Viewer frame waiting for the viewer to mount
    stashed_viewer: Option<SceneUpdate>,
}

struct MirrorInner {
    editor: Arc<dyn RenderSurface>,
    viewer: Arc<dyn RenderSurface>,
    state: Mutex<MirrorState>,
}

impl MirrorInner {
    fn push_viewer(&self, update: SceneUpdate) {
        match self.viewer.apply_scene(update.clone()) {
            Ok(()) => {}
            Err(SurfaceError::NotReady) => {
                debug!("Viewer not mounted, holding frame");
                let mut state = self.state.lock();
                let merged = merge(state.stashed_viewer.take(), update);
                state.stashed_viewer = Some(merged);
            }
            Err(e) => warn!("Mirror frame dropped: {}", e),
        }
    }

    /// Deliver a full frame with the viewer camera as it is now, so a pan
    /// made while the frame was queued is not undone
    fn push_frame(&self, mut update: SceneUpdate) {
        update.camera = Some(self.state.lock().viewer_camera);
        self.push_viewer(update);
    }
}

/// Mirrors the editor surface onto the viewer surface
#[derive(Clone)]
pub struct CanvasMirror {
    inner: Arc<MirrorInner>,
    frames: Arc<FrameQueue<SceneUpdate>>,
}

impl CanvasMirror {
    pub fn new(editor: Arc<dyn RenderSurface>, viewer: Arc<dyn RenderSurface>, frame: Duration) -> Self {
        let inner = Arc::new(MirrorInner {
            editor,
            viewer,
            state: Mutex::new(MirrorState::default()),
        });

        let weak: Weak<MirrorInner> = Arc::downgrade(&inner);
        let frames = FrameQueue::new(
            frame,
            Arc::new(move |update: SceneUpdate| {
                if let Some(inner) = weak.upgrade() {
                    inner.push_frame(update);
                }
            }),
        );

        Self {
            inner,
            frames: Arc::new(frames),
        }
    }

    /// The editor surface reported new content
    pub fn editor_changed(&self, elements: Elements, files: Files) {
        // Camera is filled in on delivery
        let update = SceneUpdate {
            elements: Some(elements.clone()),
            files: Some(files),
            ..SceneUpdate::default()
        };

        let mut state = self.inner.state.lock();
        if state.pointer_active {
            state.stashed_frame = Some(update);
            drop(state);
            self.inner.push_viewer(SceneUpdate::elements(elements));
        } else {
            drop(state);
            self.frames.push(update);
        }
    }

    pub fn pointer_down(&self) {
        let queued = self.frames.take();
        let mut state = self.inner.state.lock();
        state.pointer_active = true;
        if queued.is_some() {
            state.stashed_frame = queued;
        }
    }

    /// End of a pointer interaction; the viewer catches up immediately
    pub fn pointer_up(&self) {
        let stashed = {
            let mut state = self.inner.state.lock();
            state.pointer_active = false;
            state.stashed_frame.take()
        };
        if let Some(update) = stashed {
            self.inner.push_frame(update);
        }
    }

    pub fn pointer_active(&self) -> bool {
        self.inner.state.lock().pointer_active
    }

    /// The viewer reported a camera. Returns it when it moved past rounding.
    pub fn viewer_changed(&self, camera: Camera) -> Option<Camera> {
        let signature = camera.signature();
        let mut state = self.inner.state.lock();
        if state.viewer_signature == Some(signature) {
            return None;
        }
        state.viewer_signature = Some(signature);
        state.viewer_camera = camera;
        Some(camera)
    }

    pub fn viewer_camera(&self) -> Camera {
        self.inner.state.lock().viewer_camera
    }

    /// Push `document` into both surfaces, once per binding.
    /// Returns whether the editor took it.
    pub fn apply_initial_scene(&self, binding: u64, document: &Document) -> bool {
        let viewer_camera = document.viewer_camera_or_default();
        let editor_update = SceneUpdate {
            elements: Some(document.scene.elements.clone()),
            app_state: Some(document.scene.app_state.clone()),
            camera: Some(document.editor_camera_or_scene()),
            files: Some(document.scene.files.clone()),
        };
        let viewer_update = SceneUpdate {
            elements: Some(document.scene.elements.clone()),
            app_state: None,
            camera: Some(viewer_camera),
            files: Some(document.scene.files.clone()),
        };

        {
            let mut state = self.inner.state.lock();
            if state.binding != binding || state.initial_applied {
                return false;
            }
            state.viewer_camera = viewer_camera;
            state.viewer_signature = Some(viewer_camera.signature());
        }

        self.frames.cancel();
        self.inner.push_viewer(viewer_update);
        self.push_initial(editor_update)
    }

    fn push_initial(&self, update: SceneUpdate) -> bool {
        match self.inner.editor.apply_scene(update.clone()) {
            Ok(()) => {
                let mut state = self.inner.state.lock();
                state.initial_applied = true;
                state.stashed_initial = None;
                true
            }
            Err(SurfaceError::NotReady) => {
                debug!("Editor not mounted, holding initial scene");
                self.inner.state.lock().stashed_initial = Some(update);
                false
            }
            Err(e) => {
                warn!("Editor rejected initial scene: {}", e);
                false
            }
        }
    }

    /// Later document for the same binding (remote save): content only, the
    /// cameras stay where the user left them
    pub fn apply_external_content(&self, binding: u64, document: &Document) {
        {
            let state = self.inner.state.lock();
            if state.binding != binding || !state.initial_applied {
                return;
            }
        }

        let content = SceneUpdate {
            elements: Some(document.scene.elements.clone()),
            files: Some(document.scene.files.clone()),
            ..SceneUpdate::default()
        };
        if let Err(e) = self.inner.editor.apply_scene(content.clone()) {
            warn!("Editor rejected external update: {}", e);
        }
        self.frames.cancel();
        self.inner.push_viewer(content);
    }

    /// A surface (re)announced itself after mount, resize or fullscreen
    pub fn surface_mounted(&self, role: SurfaceRole) {
        match role {
            SurfaceRole::Editor => {
                let stashed = self.inner.state.lock().stashed_initial.take();
                match stashed {
                    Some(update) => {
                        self.push_initial(update);
                    }
                    None => self.refresh(&self.inner.editor, role),
                }
            }
            SurfaceRole::Viewer => {
                let stashed = self.inner.state.lock().stashed_viewer.take();
                if let Some(update) = stashed {
                    self.inner.push_viewer(update);
                }
                self.refresh(&self.inner.viewer, role);
            }
        }
    }

    fn refresh(&self, surface: &Arc<dyn RenderSurface>, role: SurfaceRole) {
        if let Err(e) = surface.refresh_layout() {
            debug!("Layout refresh of {:?} skipped: {}", role, e);
        }
    }

    pub fn initial_applied(&self) -> bool {
        self.inner.state.lock().initial_applied
    }

    /// Forget everything about the previous binding
    pub fn reset(&self, binding: u64) {
        self.frames.cancel();
        *self.inner.state.lock() = MirrorState {
            binding,
            ..MirrorState::default()
        };
    }
}

impl SessionObserver for CanvasMirror {
    fn subject_bound(&self, binding: u64, _subject: Option<&SubjectId>) {
        self.reset(binding);
    }

    fn document_applied(&self, binding: u64, document: &Document, initial: bool) {
        if initial {
            self.apply_initial_scene(binding, document);
        } else {
            self.apply_external_content(binding, document);
        }
    }
}

/// Later fields win; fields the later update leaves out keep the earlier value
fn merge(earlier: Option<SceneUpdate>, later: SceneUpdate) -> SceneUpdate {
    match earlier {
        None => later,
        Some(earlier) => SceneUpdate {
            elements: later.elements.or(earlier.elements),
            app_state: later.app_state.or(earlier.app_state),
            camera: later.camera.or(earlier.camera),
            files: later.files.or(earlier.files),
        },
    }
}
