pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod providers;
pub mod relational;
pub mod vector;

pub use error::{StoreError, StoreResult};
pub use graph::{GraphNeighborhood, GraphStore};
pub use lifecycle::LifecycleManager;
pub use providers::{
    EmbeddingProvider, EntityExtractor, HashEmbedding, HeuristicEntityExtractor,
    HttpEmbeddingProvider, HttpEntityExtractor, ProviderError,
};
pub use relational::{EntryState, RelationalStore, StoredEntry};
pub use vector::{cosine_similarity, VectorFilter, VectorStore};
