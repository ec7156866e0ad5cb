//! Retrieval-augmented answering.
//!
//! [`RetrievalOrchestrator`] turns a user question into an [`Answer`]
//! grounded in the knowledge base.

pub mod orchestrator;
pub mod types;

pub use orchestrator::RetrievalOrchestrator;
pub use types::{confidence_from_score, Answer, SourceRef};
