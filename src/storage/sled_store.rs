//! Sled-based storage implementation for canvas documents.
//!
//! This module provides persistent storage for per-subject documents using the
//! Sled embedded database. It supports:
//! - Framed document records with corruption detection
//! - Metadata management
//! - Template seeding for subjects without a document
//! - An update broadcast after every save

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{DocumentMetadata, StorageConfig};
use crate::scene::{Document, Scene, SubjectId};
use crate::source::{DocumentUpdate, LoadError, Loader, PersistError, Persister, SaveRequest};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Document encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not a document subject: {0}")]
    InvalidSubject(String),

    #[error("Corruption detected in document: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Tree names for different data types
const TREE_DOCUMENTS: &str = "documents";
const TREE_METADATA: &str = "metadata";

/// Leading byte of every stored document record
const RECORD_FORMAT: u8 = 0x01;
const RECORD_HEADER_LEN: usize = 5;

/// Sled-based document store
#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<Db>,
    documents: Tree,
    metadata: Tree,
    updates: broadcast::Sender<DocumentUpdate>,
}

impl DocumentStore {
    /// Open or create a new document store at the given path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;
        let metadata = db.open_tree(TREE_METADATA)?;
        let (updates, _) = broadcast::channel(config.update_capacity.max(1));

        info!("Opened document store at {}", config.path);

        Ok(Self {
            db: Arc::new(db),
            documents,
            metadata,
            updates,
        })
    }

    /// Open with default configuration
    pub fn open_default() -> StorageResult<Self> {
        Self::open(StorageConfig::default())
    }

    /// Store a document under its subject id. Returns the record size.
    pub fn save_document(&self, document: &Document) -> StorageResult<usize> {
        let record = encode_record(document)?;
        let size = record.len();
        self.documents
            .insert(document.subject_id.as_str().as_bytes(), record)?;
        Ok(size)
    }

    /// Load a subject's document
    pub fn load_document(&self, subject: &SubjectId) -> StorageResult<Option<Document>> {
        match self.documents.get(subject.as_str().as_bytes())? {
            Some(data) => Ok(Some(decode_record(&data)?)),
            None => Ok(None),
        }
    }

    /// Check if a document exists
    pub fn document_exists(&self, subject: &SubjectId) -> StorageResult<bool> {
        Ok(self.documents.contains_key(subject.as_str().as_bytes())?)
    }

    /// Delete a document and its metadata. Returns whether it existed.
    pub fn delete_document(&self, subject: &SubjectId) -> StorageResult<bool> {
        let key = subject.as_str().as_bytes();
        let existed = self.documents.remove(key)?.is_some();
        self.metadata.remove(key)?;
        Ok(existed)
    }

    /// Save document metadata
    pub fn save_metadata(&self, meta: &DocumentMetadata) -> StorageResult<()> {
        let bytes = bincode::serialize(meta)?;
        self.metadata
            .insert(meta.subject_id.as_str().as_bytes(), bytes)?;
        Ok(())
    }

    /// Load document metadata
    pub fn get_metadata(&self, subject: &SubjectId) -> StorageResult<Option<DocumentMetadata>> {
        match self.metadata.get(subject.as_str().as_bytes())? {
            Some(bytes) => {
                let meta: DocumentMetadata = bincode::deserialize(&bytes)?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// List all documents with metadata, in subject order
    pub fn list_documents(&self) -> StorageResult<Vec<DocumentMetadata>> {
        let mut docs = Vec::new();
        for item in self.metadata.iter() {
            let (_, value) = item?;
            let meta: DocumentMetadata = bincode::deserialize(&value)?;
            docs.push(meta);
        }
        Ok(docs)
    }

    /// Store the scene every new subject is seeded from
    pub fn seed_template(&self, scene: Scene) -> StorageResult<()> {
        let template = Document::new(SubjectId::template(), scene);
        self.save_document(&template)?;
        info!(
            "Stored template document ({} elements)",
            template.scene.elements.len()
        );
        Ok(())
    }

    /// Write one save from a session, update its metadata and announce it
    pub fn apply_save(&self, subject: &SubjectId, request: SaveRequest) -> StorageResult<Document> {
        if !subject.is_real() {
            return Err(StorageError::InvalidSubject(subject.to_string()));
        }

        let document = Document {
            subject_id: subject.clone(),
            scene: request.scene,
            viewer_camera: Some(request.viewer_camera),
            editor_camera: Some(request.editor_camera),
            updated_at: Some(chrono::Utc::now()),
        };
        let size = self.save_document(&document)?;

        let mut meta = self
            .get_metadata(subject)?
            .unwrap_or_else(|| DocumentMetadata::new(subject.clone()));
        meta.record_save(document.scene.live_element_count(), size, request.origin);
        self.save_metadata(&meta)?;

        debug!(
            "Stored {} (save #{}, {} bytes)",
            subject, meta.save_count, size
        );

        // Nobody listening is fine
        let _ = self.updates.send(DocumentUpdate {
            document: document.clone(),
            origin: request.origin,
        });

        Ok(document)
    }

    /// Receive every document written through [`DocumentStore::apply_save`]
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentUpdate> {
        self.updates.subscribe()
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            document_count: self.documents.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
            metadata_count: self.metadata.len(),
            subscriber_count: self.updates.receiver_count(),
        }
    }
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub document_count: usize,
    pub total_size_bytes: u64,
    pub metadata_count: usize,
    pub subscriber_count: usize,
}

/// `format:u8 | length:u32 LE | JSON`
fn encode_record(document: &Document) -> StorageResult<Vec<u8>> {
    let json = serde_json::to_vec(document)?;
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + json.len());
    record.push(RECORD_FORMAT);
    record.extend(&(json.len() as u32).to_le_bytes());
    record.extend(json);
    Ok(record)
}

fn decode_record(data: &[u8]) -> StorageResult<Document> {
    if data.len() < RECORD_HEADER_LEN {
        return Err(StorageError::Corruption("Record too short".into()));
    }
    if data[0] != RECORD_FORMAT {
        return Err(StorageError::Corruption(format!(
            "Unknown record format 0x{:02X}",
            data[0]
        )));
    }

    let len = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
    let payload = &data[RECORD_HEADER_LEN..];
    if payload.len() != len {
        return Err(StorageError::Corruption("Record size mismatch".into()));
    }
    Ok(serde_json::from_slice(payload)?)
}

#[async_trait]
impl Loader for DocumentStore {
    async fn load(&self, subject: &SubjectId) -> Result<Option<Document>, LoadError> {
        self.load_document(subject).map_err(|e| match e {
            StorageError::Json(e) => LoadError::Decode(e.to_string()),
            other => LoadError::Storage(other.to_string()),
        })
    }
}

#[async_trait]
impl Persister for DocumentStore {
    async fn save(&self, subject: &SubjectId, request: SaveRequest) -> Result<(), PersistError> {
        self.apply_save(subject, request)
            .map(|_| ())
            .map_err(|e| match e {
                StorageError::Json(e) => PersistError::Encode(e.to_string()),
                other => PersistError::Storage(other.to_string()),
            })
    }
}

impl Drop for DocumentStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
