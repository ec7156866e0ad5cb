//! Knowledge base question answering.
//!
//! Question/answer pairs from the knowledge store are normalized, embedded
//! and held in an in-memory vector index that is swapped atomically on
//! rebuild. Queries go through the same normalizer and embedder, are matched
//! by cosine similarity, and are answered by the generator from the best
//! matches or rejected when nothing is close enough.

pub mod conversation;
pub mod embeddings;
pub mod evaluation;
pub mod index;
pub mod normalize;
pub mod rag;
pub mod services;
pub mod store;
pub mod sync;
pub mod types;
pub mod validation;
pub mod vector_index;

// Re-export commonly used types
pub use conversation::{Conversation, ConversationLog, Feedback, NewConversation, SqliteConversationLog};
pub use embeddings::{Embedder, EmbeddingProvider};
pub use evaluation::{EvaluationReport, EvaluationSettings, Evaluator};
pub use index::SnapshotStore;
pub use normalize::TextNormalizer;
pub use rag::{Answer, RetrievalOrchestrator, SourceRef};
pub use services::Services;
pub use store::{KnowledgeStore, SqliteKnowledgeStore};
pub use sync::{embedding_space, IndexSynchronizer, RebuildReport, StaleReason, SyncHandle, SyncState, SyncStatus};
pub use types::{KnowledgeEntry, LatencyBreakdown, NewEntry, StoreStats};
pub use validation::FeedbackCategory;
pub use vector_index::{IndexSnapshot, SearchHit, VectorIndex};

#[cfg(test)]
mod tests;
