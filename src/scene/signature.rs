//! Content fingerprints used for dirty-checking and for skipping saves that
//! would write what the store already holds.
//!
//! The content signature covers elements in stacking order, the persisted
//! slice of the view state and file metadata. Cameras are fingerprinted
//! separately and at low precision so panning never reads as a content edit.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use super::{AppState, BinaryFile, Camera, Element, FileId};

/// Deterministic fingerprint of a scene's persisted content
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the content signature of a scene.
///
/// Element records are hashed through `serde_json`, whose maps are key-sorted,
/// so two structurally identical elements hash the same regardless of how
/// they were built. File payloads are represented by their length only.
pub fn compute_signature(
    elements: &[Element],
    app_state: &AppState,
    files: &BTreeMap<FileId, BinaryFile>,
) -> Signature {
    let mut hasher = Sha256::new();

    hasher.update(b"elements");
    hasher.update((elements.len() as u64).to_le_bytes());
    for element in elements {
        match serde_json::to_vec(element.as_value()) {
            Ok(bytes) => {
                hasher.update((bytes.len() as u64).to_le_bytes());
                hasher.update(&bytes);
            }
            Err(e) => {
                debug!("Element left out of signature: {}", e);
                hasher.update(0u64.to_le_bytes());
            }
        }
    }

    hasher.update(b"app_state");
    match serde_json::to_vec(&app_state.persisted()) {
        Ok(bytes) => hasher.update(&bytes),
        Err(e) => debug!("View state left out of signature: {}", e),
    }

    hasher.update(b"files");
    hasher.update((files.len() as u64).to_le_bytes());
    for (id, file) in files {
        hasher.update(id.as_bytes());
        hasher.update([0]);
        hasher.update(file.mime_type.as_bytes());
        hasher.update([0]);
        hasher.update(file.created.to_le_bytes());
        hasher.update((file.data_url.len() as u64).to_le_bytes());
    }

    Signature(hex::encode(hasher.finalize()))
}

/// Rounded camera fingerprint: zoom to 3 decimals, scroll to the pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CameraSignature {
    zoom_millis: i64,
    scroll_x: i64,
    scroll_y: i64,
}

impl CameraSignature {
    pub fn of(camera: &Camera) -> Self {
        Self {
            zoom_millis: (camera.zoom * 1000.0).round() as i64,
            scroll_x: camera.scroll_x.round() as i64,
            scroll_y: camera.scroll_y.round() as i64,
        }
    }
}

impl fmt::Display for CameraSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.zoom_millis, self.scroll_x, self.scroll_y)
    }
}
