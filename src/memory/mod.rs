// src/memory/mod.rs
// Memory subsystem: chunked hybrid index (C2), compactor (C3), watcher (C4)

pub mod chunking;
pub mod embeddings;
pub mod flush;
pub mod indexer;
pub mod rotation;
pub mod schema;
pub mod search;
pub mod watcher;

#[cfg(test)]
mod index_tests;

pub use chunking::{chunk_content, Chunk};
pub use embeddings::{EmbeddingProvider, OpenAiEmbeddings};
pub use flush::{parse_retain, MemoryExtractor, MemoryFlush, RetainKind, RetainRecord};
pub use indexer::{IndexOutcome, IndexStatus, MemoryIndexer};
pub use rotation::IndexRotation;
pub use search::{SearchOptions, SearchResponse, SearchResult};
pub use watcher::{spawn_watcher, MemoryWatcher};
