pub mod embedding;
pub mod store;
pub mod types;

pub use embedding::{DEFAULT_DIMENSION, Embedder, HashingEmbedder, cosine_similarity};
pub use store::MemoryStore;
pub use types::{
    INDEX_VERSION, MemoryError, MemoryRecord, MemoryResult, PLACEHOLDER_CONTENT, RecordKind, RecordMetadata,
    ScoredRecord,
};
