//! Shared handler state.

use kbqa_knowledge::{
    ConversationLog, IndexSynchronizer, KnowledgeStore, RetrievalOrchestrator, Services,
    SyncHandle,
};
use kbqa_llm::Generator;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RetrievalOrchestrator>,
    pub conversations: Arc<dyn ConversationLog>,
    pub store: Arc<dyn KnowledgeStore>,
    pub synchronizer: Arc<IndexSynchronizer>,
    /// Running synchronizer loop, used for out-of-band rebuilds
    pub sync: Arc<SyncHandle>,
    pub generator: Option<Arc<dyn Generator>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(services: &Services, sync: Arc<SyncHandle>) -> Self {
        Self {
            orchestrator: services.orchestrator.clone(),
            conversations: services.conversations.clone(),
            store: services.store.clone(),
            synchronizer: services.synchronizer.clone(),
            sync,
            generator: services.generator.clone(),
            started_at: Instant::now(),
        }
    }
}
