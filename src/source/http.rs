//! HTTP client for the `canvas-store` document service.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tracing::{debug, warn};

use super::{InFlightLoads, LoadError, Loader, PersistError, Persister, SaveRequest};
use crate::scene::{Document, SubjectId};

/// Request/response loader and persister backed by `GET`/`PUT
/// /api/documents/:subject_id`.
pub struct HttpDocumentClient {
    client: reqwest::Client,
    base_url: Url,
    in_flight: InFlightLoads,
}

impl HttpDocumentClient {
    pub fn new(base_url: &str) -> Result<Self, LoadError> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, LoadError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| LoadError::Transport(format!("Invalid base URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(LoadError::Transport(format!(
                "Base URL cannot carry a path: {}",
                base_url
            )));
        }
        Ok(Self {
            client,
            base_url,
            in_flight: InFlightLoads::default(),
        })
    }

    /// URL of one subject's document; the subject is percent-encoded
    pub fn document_url(&self, subject: &SubjectId) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["api", "documents", subject.as_str()]);
        }
        url
    }
}

#[async_trait]
impl Loader for HttpDocumentClient {
    async fn load(&self, subject: &SubjectId) -> Result<Option<Document>, LoadError> {
        let _guard = self.in_flight.begin(subject);
        let url = self.document_url(subject);
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let document = response
                    .json::<Document>()
                    .await
                    .map_err(|e| LoadError::Decode(e.to_string()))?;
                Ok(Some(document))
            }
            status => {
                warn!("Loading {} failed with HTTP {}", subject, status);
                Err(LoadError::Transport(format!("HTTP {}", status)))
            }
        }
    }

    fn is_loading(&self, subject: &SubjectId) -> bool {
        self.in_flight.contains(subject)
    }
}

#[async_trait]
impl Persister for HttpDocumentClient {
    async fn save(&self, subject: &SubjectId, request: SaveRequest) -> Result<(), PersistError> {
        let url = self.document_url(subject);
        debug!("PUT {}", url);

        let response = self
            .client
            .put(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PersistError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(PersistError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}
