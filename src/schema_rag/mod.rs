//! Schema RAG - retrieval of the catalog entries relevant to a question
//!
//! - `embedder`: OpenAI-compatible embedding client
//! - `vector_store`: embeddings and cosine relevance
//! - `lexical`: degraded-mode token matching
//! - `index`: `RetrievalIndex` build and query
//! - `cache`: vectors persisted by catalog hash

pub mod cache;
pub mod embedder;
pub mod index;
pub mod lexical;
pub mod vector_store;

pub use cache::VectorCache;
pub use embedder::{Embedder, SchemaEmbedder};
pub use index::{IndexHandle, IndexMode, RetrievalIndex, RetrievalResult, ScoredEntry};
pub use vector_store::{cosine_similarity, Embedding, InMemoryVectorStore};
