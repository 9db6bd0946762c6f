//! Document sources: where documents are loaded from and saved to.
//!
//! The session only sees the [`Loader`] and [`Persister`] traits. Concrete
//! sources are the sled store (in-process), the HTTP client and the push
//! channel. [`RacingLoader`] combines two loaders and takes whichever answers
//! first.

pub mod http;
pub mod push;

pub use http::HttpDocumentClient;
pub use push::{PushChannel, PushLoader};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::scene::{Camera, Document, Scene, SubjectId};

/// Errors that can occur while loading a document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Source closed before answering")]
    Closed,
}

/// Errors that can occur while saving a document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Save rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Encode error: {0}")]
    Encode(String),
}

/// Body of a save call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub scene: Scene,
    pub viewer_camera: Camera,
    pub editor_camera: Camera,
    /// Session that issued the save, echoed back on the resulting update
    #[serde(default)]
    pub origin: Option<Uuid>,
}

/// A stored document announced by a source after it changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdate {
    pub document: Document,
    #[serde(default)]
    pub origin: Option<Uuid>,
}

/// Loads documents by subject. `Ok(None)` means the subject has no document.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, subject: &SubjectId) -> Result<Option<Document>, LoadError>;

    /// Whether a load for this subject is currently outstanding
    fn is_loading(&self, _subject: &SubjectId) -> bool {
        false
    }
}

/// Saves documents. Callers guarantee at most one call per subject at a time.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn save(&self, subject: &SubjectId, request: SaveRequest) -> Result<(), PersistError>;
}

#[async_trait]
impl<T: Loader + ?Sized> Loader for Arc<T> {
    async fn load(&self, subject: &SubjectId) -> Result<Option<Document>, LoadError> {
        (**self).load(subject).await
    }

    fn is_loading(&self, subject: &SubjectId) -> bool {
        (**self).is_loading(subject)
    }
}

#[async_trait]
impl<T: Persister + ?Sized> Persister for Arc<T> {
    async fn save(&self, subject: &SubjectId, request: SaveRequest) -> Result<(), PersistError> {
        (**self).save(subject, request).await
    }
}

/// Load a subject's document, seeding it from the template when it has none.
///
/// A subject without a document gets a copy of the template re-keyed to it,
/// or an empty scene when no template exists either. Nothing is written; the
/// seeded document is stored by the first save.
pub async fn load_or_seed(loader: &dyn Loader, subject: &SubjectId) -> Result<Document, LoadError> {
    if let Some(document) = loader.load(subject).await? {
        return Ok(document);
    }

    let template = if subject.is_template() {
        None
    } else {
        loader.load(&SubjectId::template()).await?
    };

    Ok(match template {
        Some(template) => {
            debug!("Seeding {} from template", subject);
            Document::seeded_from(template, subject.clone())
        }
        None => {
            debug!("Seeding {} with an empty scene", subject);
            Document::new(subject.clone(), Scene::default())
        }
    })
}

/// Races two loaders; the first answer wins and the other load is dropped.
///
/// A source that fails does not decide the race: the other source's answer
/// is awaited instead.
pub struct RacingLoader<A, B> {
    primary: A,
    secondary: B,
}

impl<A, B> RacingLoader<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl<A: Loader, B: Loader> Loader for RacingLoader<A, B> {
    async fn load(&self, subject: &SubjectId) -> Result<Option<Document>, LoadError> {
        let primary = self.primary.load(subject);
        let secondary = self.secondary.load(subject);
        tokio::pin!(primary);
        tokio::pin!(secondary);

        tokio::select! {
            result = &mut primary => match result {
                Ok(document) => Ok(document),
                Err(e) => {
                    warn!("Primary load of {} failed, waiting on secondary: {}", subject, e);
                    secondary.await
                }
            },
            result = &mut secondary => match result {
                Ok(document) => Ok(document),
                Err(e) => {
                    warn!("Secondary load of {} failed, waiting on primary: {}", subject, e);
                    primary.await
                }
            },
        }
    }

    fn is_loading(&self, subject: &SubjectId) -> bool {
        self.primary.is_loading(subject) || self.secondary.is_loading(subject)
    }
}

/// Outstanding-load counter shared by the network sources
#[derive(Debug, Default)]
pub(crate) struct InFlightLoads {
    loads: DashMap<SubjectId, usize>,
}

impl InFlightLoads {
    pub(crate) fn begin(&self, subject: &SubjectId) -> InFlightGuard<'_> {
        *self.loads.entry(subject.clone()).or_insert(0) += 1;
        InFlightGuard {
            loads: &self.loads,
            subject: subject.clone(),
        }
    }

    pub(crate) fn contains(&self, subject: &SubjectId) -> bool {
        self.loads.get(subject).map(|count| *count > 0).unwrap_or(false)
    }
}

pub(crate) struct InFlightGuard<'a> {
    loads: &'a DashMap<SubjectId, usize>,
    subject: SubjectId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let drained = match self.loads.get_mut(&self.subject) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if drained {
            self.loads.remove_if(&self.subject, |_, count| *count == 0);
        }
    }
}
