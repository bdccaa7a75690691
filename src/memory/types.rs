// Core types for the failure memory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of the persisted index layout
pub const INDEX_VERSION: u32 = 1;

/// Content of the record seeded into an empty index
pub const PLACEHOLDER_CONTENT: &str = "No past failures recorded.";

/// What a record represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Seed entry keeping the index non-empty
    Placeholder,
    /// Narrative of a failed execution
    Failure,
}

/// Where a failure record came from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub test_case_id: u64,
    pub environment: String,
    /// Screenshot references of the failed attempt, in capture order
    #[serde(default)]
    pub screenshots: Vec<String>,
}

/// One entry of the memory corpus. Append-only: never edited once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub kind: RecordKind,
    /// Human-readable failure narrative
    pub content: String,
    /// Filled in by the store on ingest
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub metadata: RecordMetadata,
    pub created: DateTime<Utc>,
}

impl MemoryRecord {
    /// A failure record awaiting ingest
    pub fn failure(content: impl Into<String>, metadata: RecordMetadata) -> Self {
        Self {
            kind: RecordKind::Failure,
            content: content.into(),
            embedding: Vec::new(),
            metadata,
            created: Utc::now(),
        }
    }

    pub fn placeholder() -> Self {
        Self {
            kind: RecordKind::Placeholder,
            content: PLACEHOLDER_CONTENT.to_string(),
            embedding: Vec::new(),
            metadata: RecordMetadata::default(),
            created: Utc::now(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind == RecordKind::Placeholder
    }

    /// Identity used to drop replays of the same failure
    pub(crate) fn same_entry(&self, other: &MemoryRecord) -> bool {
        self.kind == other.kind
            && self.metadata.test_case_id == other.metadata.test_case_id
            && self.metadata.environment == other.metadata.environment
            && self.content == other.content
    }
}

/// A retrieved record with its similarity to the query
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub score: f32,
    pub record: MemoryRecord,
}

/// On-disk layout of the index
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IndexFile {
    pub version: u32,
    pub embedder: String,
    pub dimension: usize,
    pub records: Vec<MemoryRecord>,
}

/// Result type for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors raised by the memory store
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The persisted index was written by another layout or embedder
    #[error("incompatible memory index: {0}")]
    Incompatible(String),

    #[error("failed to persist memory index: {0}")]
    Persist(#[from] tempfile::PersistError),
}
