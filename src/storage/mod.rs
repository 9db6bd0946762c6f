//! Storage module for persistent canvas documents using Sled.
//!
//! Documents are stored one per subject as a small framed record around their
//! JSON form, since scene elements are open-ended JSON. Metadata lives in a
//! separate tree as bincode records so listings never touch scene payloads.
//! Every save is announced on a broadcast channel, which is how connected
//! viewers learn about documents written by other sessions.

mod sled_store;

pub use sled_store::{DocumentStore, StorageError, StorageResult, StorageStats};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scene::SubjectId;

/// Metadata stored alongside each document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub subject_id: SubjectId,
    /// Unix timestamp of the first save
    pub created_at: i64,
    /// Unix timestamp of the last save
    pub updated_at: i64,
    pub save_count: u64,
    /// Elements that are not soft-deleted
    pub element_count: u64,
    /// Size of the stored record in bytes
    pub size_bytes: u64,
    /// Session that wrote the last save, when it identified itself
    pub last_origin: Option<Uuid>,
}

impl DocumentMetadata {
    pub fn new(subject_id: SubjectId) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            subject_id,
            created_at: now,
            updated_at: now,
            save_count: 0,
            element_count: 0,
            size_bytes: 0,
            last_origin: None,
        }
    }

    /// Account for one more save
    pub fn record_save(&mut self, element_count: usize, size_bytes: usize, origin: Option<Uuid>) {
        self.updated_at = chrono::Utc::now().timestamp();
        self.save_count += 1;
        self.element_count = element_count as u64;
        self.size_bytes = size_bytes as u64;
        self.last_origin = origin;
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
    /// Capacity of the update broadcast
    pub update_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/canvas.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
            update_capacity: 1024,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval_ms(mut self, interval: u64) -> Self {
        self.flush_interval_ms = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_records_saves() {
        let mut meta = DocumentMetadata::new(SubjectId::new("201"));
        assert_eq!(meta.save_count, 0);
        assert!(meta.created_at > 0);

        let origin = Uuid::new_v4();
        meta.record_save(4, 512, Some(origin));
        meta.record_save(5, 640, None);

        assert_eq!(meta.save_count, 2);
        assert_eq!(meta.element_count, 5);
        assert_eq!(meta.size_bytes, 640);
        assert_eq!(meta.last_origin, None);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.cache_size, 256 * 1024 * 1024);
        assert_eq!(config.flush_interval_ms, 500);

        let config = StorageConfig::new("/tmp/x.sled").with_flush_interval_ms(0);
        assert_eq!(config.path, "/tmp/x.sled");
        assert_eq!(config.flush_interval_ms, 0);
    }
}
