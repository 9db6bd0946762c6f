//! Scene and document model shared by the session controller, the mirror and
//! the document sources.
//!
//! Element geometry belongs to the rendering surface's own format, so elements
//! are kept as opaque JSON records in stacking order. Only the camera and the
//! persisted slice of the editor view state are typed here.

pub mod signature;

pub use signature::{compute_signature, CameraSignature, Signature};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identifier of a file blob referenced by elements
pub type FileId = String;

/// Subject id reserved for the document every new subject is seeded from
pub const TEMPLATE_SUBJECT_ID: &str = "__template__";

/// Customer key a document is stored under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The reserved template subject
    pub fn template() -> Self {
        Self(TEMPLATE_SUBJECT_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_template(&self) -> bool {
        self.0 == TEMPLATE_SUBJECT_ID
    }

    /// Whether this id names a real customer (not blank, not the template)
    pub fn is_real(&self) -> bool {
        !self.0.trim().is_empty() && !self.is_template()
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SubjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One shape record as produced by the rendering surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Element(serde_json::Value);

impl Element {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(serde_json::Value::as_str)
    }

    /// Soft-deleted elements stay in the list so undo can restore them
    pub fn is_deleted(&self) -> bool {
        self.0
            .get("isDeleted")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Element list shared by reference between the surfaces and the session.
///
/// A surface that did not touch its elements hands back the same `Arc`, which
/// is what the session uses as its cheap "content changed" test.
pub type Elements = Arc<Vec<Element>>;

/// File blobs keyed by id, ordered so iteration is deterministic
pub type Files = Arc<BTreeMap<FileId, BinaryFile>>;

/// Zoom and scroll of one surface
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Camera {
    pub zoom: f64,
    pub scroll_x: f64,
    pub scroll_y: f64,
}

impl Camera {
    pub fn new(zoom: f64, scroll_x: f64, scroll_y: f64) -> Self {
        Self {
            zoom,
            scroll_x,
            scroll_y,
        }
    }

    pub fn signature(&self) -> CameraSignature {
        CameraSignature::of(self)
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(1.0, 0.0, 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
}

/// Editor view state.
///
/// The camera, the mode flags and anything in `extra` are transient. Only the
/// fields returned by [`AppState::persisted`] take part in the content
/// signature.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppState {
    #[serde(flatten)]
    pub camera: Camera,
    pub view_background_color: Option<String>,
    pub grid_size: Option<u32>,
    pub theme: Option<Theme>,
    pub view_mode_enabled: bool,
    pub zen_mode_enabled: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The slice of [`AppState`] that is stored with the document
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAppState<'a> {
    pub view_background_color: Option<&'a str>,
    pub grid_size: Option<u32>,
    pub theme: Option<Theme>,
}

impl AppState {
    pub fn with_camera(mut self, camera: Camera) -> Self {
        self.camera = camera;
        self
    }

    pub fn persisted(&self) -> PersistedAppState<'_> {
        PersistedAppState {
            view_background_color: self.view_background_color.as_deref(),
            grid_size: self.grid_size,
            theme: self.theme,
        }
    }
}

/// Metadata and payload of an embedded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryFile {
    pub id: FileId,
    pub mime_type: String,
    pub created: i64,
    #[serde(default)]
    pub last_retrieved: Option<i64>,
    pub data_url: String,
}

/// The drawable content of a document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Scene {
    pub elements: Elements,
    pub app_state: AppState,
    pub files: Files,
}

impl Scene {
    pub fn new(elements: Vec<Element>, app_state: AppState, files: BTreeMap<FileId, BinaryFile>) -> Self {
        Self {
            elements: Arc::new(elements),
            app_state,
            files: Arc::new(files),
        }
    }

    pub fn signature(&self) -> Signature {
        compute_signature(&self.elements, &self.app_state, &self.files)
    }

    /// Number of elements that are not soft-deleted
    pub fn live_element_count(&self) -> usize {
        self.elements.iter().filter(|e| !e.is_deleted()).count()
    }
}

/// Persisted unit: one scene plus the two independently tracked cameras
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub subject_id: SubjectId,
    pub scene: Scene,
    #[serde(default)]
    pub viewer_camera: Option<Camera>,
    #[serde(default)]
    pub editor_camera: Option<Camera>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(subject_id: SubjectId, scene: Scene) -> Self {
        Self {
            subject_id,
            scene,
            viewer_camera: None,
            editor_camera: None,
            updated_at: None,
        }
    }

    /// Re-key a template document for a subject that has none yet
    pub fn seeded_from(template: Document, subject_id: SubjectId) -> Self {
        Self {
            subject_id,
            updated_at: None,
            ..template
        }
    }

    pub fn with_cameras(mut self, viewer: Camera, editor: Camera) -> Self {
        self.viewer_camera = Some(viewer);
        self.editor_camera = Some(editor);
        self
    }

    pub fn viewer_camera_or_default(&self) -> Camera {
        self.viewer_camera.unwrap_or_default()
    }

    /// Editor camera, falling back to the camera stored in the scene's view state
    pub fn editor_camera_or_scene(&self) -> Camera {
        self.editor_camera.unwrap_or(self.scene.app_state.camera)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subject_id_kinds() {
        assert!(SubjectId::new("201").is_real());
        assert!(!SubjectId::new("  ").is_real());
        assert!(!SubjectId::template().is_real());
        assert!(SubjectId::template().is_template());
        assert_eq!(SubjectId::from("305").to_string(), "305");
    }

    #[test]
    fn test_element_accessors() {
        let live = Element::new(json!({"id": "a", "type": "rectangle"}));
        let deleted = Element::new(json!({"id": "b", "isDeleted": true}));

        assert_eq!(live.id(), Some("a"));
        assert!(!live.is_deleted());
        assert!(deleted.is_deleted());

        let scene = Scene::new(vec![live, deleted], AppState::default(), BTreeMap::new());
        assert_eq!(scene.live_element_count(), 1);
    }

    #[test]
    fn test_app_state_keeps_unknown_fields() {
        let raw = json!({
            "zoom": 1.5,
            "scrollX": 10.0,
            "scrollY": -4.0,
            "viewBackgroundColor": "#fff",
            "gridSize": 20,
            "theme": "dark",
            "selectedElementIds": {"a": true}
        });

        let state: AppState = serde_json::from_value(raw).unwrap();
        assert_eq!(state.camera, Camera::new(1.5, 10.0, -4.0));
        assert_eq!(state.theme, Some(Theme::Dark));
        assert_eq!(state.grid_size, Some(20));
        assert!(state.extra.contains_key("selectedElementIds"));
        assert!(!state.extra.contains_key("zoom"));
    }

    #[test]
    fn test_document_seeding_and_camera_fallbacks() {
        let scene = Scene {
            app_state: AppState::default().with_camera(Camera::new(2.0, 5.0, 5.0)),
            ..Scene::default()
        };
        let mut template = Document::new(SubjectId::template(), scene);
        template.updated_at = Some(Utc::now());

        let seeded = Document::seeded_from(template, SubjectId::new("201"));
        assert_eq!(seeded.subject_id.as_str(), "201");
        assert!(seeded.updated_at.is_none());
        assert_eq!(seeded.editor_camera_or_scene(), Camera::new(2.0, 5.0, 5.0));
        assert_eq!(seeded.viewer_camera_or_default(), Camera::default());
    }

    #[test]
    fn test_document_json_shape() {
        let doc = Document::new(SubjectId::new("7"), Scene::default())
            .with_cameras(Camera::default(), Camera::new(0.5, 1.0, 2.0));
        let value = serde_json::to_value(&doc).unwrap();

        assert_eq!(value["subjectId"], "7");
        assert_eq!(value["editorCamera"]["zoom"], 0.5);
        assert!(value["scene"]["elements"].as_array().unwrap().is_empty());

        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }
}
