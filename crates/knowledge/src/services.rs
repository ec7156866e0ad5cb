//! Wiring of the long-lived components from an [`AppConfig`].
//!
//! The embedder, index, synchronizer and generator are built once here and
//! shared by reference with whoever serves queries (HTTP or CLI).

use crate::conversation::{ConversationLog, SqliteConversationLog};
use crate::embeddings::Embedder;
use crate::index::SnapshotStore;
use crate::normalize::TextNormalizer;
use crate::rag::RetrievalOrchestrator;
use crate::store::SqliteKnowledgeStore;
use crate::sync::IndexSynchronizer;
use crate::vector_index::VectorIndex;
use kbqa_core::{AppConfig, AppResult};
use kbqa_llm::{build_generator, Generator};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Services {
    pub store: Arc<SqliteKnowledgeStore>,
    pub conversations: Arc<dyn ConversationLog>,
    pub embedder: Embedder,
    pub index: Arc<VectorIndex>,
    pub synchronizer: Arc<IndexSynchronizer>,
    pub orchestrator: Arc<RetrievalOrchestrator>,
    pub generator: Option<Arc<dyn Generator>>,
    /// Period of the background staleness check; `None` when disabled
    pub sync_interval: Option<Duration>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("store", &self.store)
            .field("embedder", &self.embedder)
            .field("synchronizer", &self.synchronizer)
            .field("sync_interval", &self.sync_interval)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Open the store, load the embedding model and build the pipeline.
    ///
    /// Fails with `ModelUnavailable` when the embedding backend cannot be
    /// loaded after the configured retries.
    pub async fn connect(config: &AppConfig) -> AppResult<Self> {
        config.validate()?;
        config.ensure_state_dir()?;

        let store_path = config.store_path();
        let store = Arc::new(SqliteKnowledgeStore::open(&store_path)?);
        let conversations: Arc<dyn ConversationLog> =
            Arc::new(SqliteConversationLog::open(&store_path)?);

        let normalizer = Arc::new(TextNormalizer::new(&config.normalizer));
        let embedder = Embedder::connect(&config.embedding, config.model_dir()).await?;
        let index = Arc::new(VectorIndex::new(embedder.dimensions()));

        let mut synchronizer = IndexSynchronizer::new(
            store.clone(),
            embedder.clone(),
            normalizer.clone(),
            index.clone(),
        )
        .with_min_rebuild_interval(Duration::from_secs(config.sync.min_rebuild_interval_secs));
        if config.index.persist {
            synchronizer = synchronizer.with_snapshot_store(SnapshotStore::new(config.snapshot_path()));
        }

        let generator = build_generator(&config.generator)?;
        let mut orchestrator = RetrievalOrchestrator::new(
            normalizer,
            embedder.clone(),
            index.clone(),
            conversations.clone(),
            config.retrieval.clone(),
        );
        if let Some(generator) = &generator {
            orchestrator = orchestrator.with_generator(
                generator.clone(),
                config.generator.max_tokens,
                Duration::from_secs(config.generator.timeout_secs),
            );
        }

        let sync_interval = config
            .sync
            .enabled
            .then(|| Duration::from_secs(config.sync.interval_secs));

        tracing::info!(
            store = ?store_path,
            embedding_provider = embedder.provider_name(),
            embedding_model = embedder.model_name(),
            dimensions = embedder.dimensions(),
            generator = generator.as_ref().map(|g| g.name().to_string()),
            "Services ready"
        );

        Ok(Self {
            store,
            conversations,
            embedder,
            index,
            synchronizer: Arc::new(synchronizer),
            orchestrator: Arc::new(orchestrator),
            generator,
            sync_interval,
        })
    }

    /// Make the index usable for a one-shot command: install the persisted
    /// snapshot, then rebuild if the store moved on since.
    pub async fn prepare_index(&self) -> AppResult<()> {
        match self.synchronizer.load_persisted().await {
            Ok(true) => tracing::debug!("Loaded persisted index snapshot"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Ignoring unreadable index snapshot"),
        }
        self.synchronizer.sync_once().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewEntry;
    use tempfile::TempDir;

    fn offline_config(workspace: &std::path::Path) -> AppConfig {
        let yaml = r#"
embedding:
  provider: trigram
  dimensions: 256
generator:
  provider: none
sync:
  enabled: false
"#;
        let mut config = AppConfig::from_yaml_str(yaml).unwrap();
        config.workspace = workspace.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_connect_and_answer_offline() {
        let temp = TempDir::new().unwrap();
        let config = offline_config(temp.path());
        let services = Services::connect(&config).await.unwrap();
        assert!(services.generator.is_none());
        assert!(services.sync_interval.is_none());

        services
            .store
            .add_entry(&NewEntry::new(
                "installation",
                "Comment installer AI_licia ?",
                "Téléchargez l'installateur.",
            ))
            .unwrap();
        services.prepare_index().await.unwrap();
        assert_eq!(services.index.len(), 1);

        let answer = services
            .orchestrator
            .answer("Comment installer AI_licia ?", "cli")
            .await
            .unwrap();
        assert!(answer.matched);
        assert!(answer.degraded);
        assert!(answer.conversation_id.is_some());
    }

    #[tokio::test]
    async fn test_persisted_snapshot_survives_restart() {
        let temp = TempDir::new().unwrap();
        let config = offline_config(temp.path());

        let first = Services::connect(&config).await.unwrap();
        first
            .store
            .add_entry(&NewEntry::new("audio", "Comment régler le son ?", "Dans l'onglet audio."))
            .unwrap();
        first.prepare_index().await.unwrap();
        assert!(config.snapshot_path().exists());

        let second = Services::connect(&config).await.unwrap();
        assert!(second.synchronizer.load_persisted().await.unwrap());
        assert_eq!(second.index.len(), 1);
    }
}
