//! Rendering surface contract.
//!
//! The drawing component is external; the session and the mirror only push
//! scene updates into it and ask it to re-layout.

use thiserror::Error;

use crate::scene::{AppState, Camera, Elements, Files};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceRole {
    Editor,
    Viewer,
}

/// Partial scene update; `None` fields are left as they are on the surface
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneUpdate {
    pub elements: Option<Elements>,
    pub app_state: Option<AppState>,
    pub camera: Option<Camera>,
    pub files: Option<Files>,
}

impl SceneUpdate {
    pub fn elements(elements: Elements) -> Self {
        Self {
            elements: Some(elements),
            ..Self::default()
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("Surface is not mounted")]
    NotReady,

    #[error("Surface rejected update: {0}")]
    Rejected(String),
}

pub trait RenderSurface: Send + Sync {
    fn apply_scene(&self, update: SceneUpdate) -> Result<(), SurfaceError>;

    fn refresh_layout(&self) -> Result<(), SurfaceError>;
}
