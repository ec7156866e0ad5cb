//! Ranking through the whole pipeline: SQLite store, synchronizer, index
//! and orchestrator, with hand-picked vectors.

use crate::conversation::testing::MemoryConversationLog;
use crate::embeddings::testing::FixedProvider;
use crate::embeddings::Embedder;
use crate::normalize::TextNormalizer;
use crate::rag::RetrievalOrchestrator;
use crate::store::SqliteKnowledgeStore;
use crate::sync::IndexSynchronizer;
use crate::types::NewEntry;
use crate::vector_index::VectorIndex;
use kbqa_core::config::RetrievalSettings;
use std::sync::Arc;
use tempfile::TempDir;

fn unit(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / norm).collect()
}

struct Pipeline {
    _temp: TempDir,
    store: Arc<SqliteKnowledgeStore>,
    provider: Arc<FixedProvider>,
    normalizer: Arc<TextNormalizer>,
    sync: IndexSynchronizer,
    orchestrator: RetrievalOrchestrator,
}

impl Pipeline {
    fn new(top_k: usize) -> Self {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteKnowledgeStore::open(temp.path().join("kb.db")).unwrap());
        let provider = Arc::new(FixedProvider::new(3));
        let normalizer = Arc::new(TextNormalizer::default());
        let embedder = Embedder::new(provider.clone(), 8);
        let index = Arc::new(VectorIndex::new(3));

        let sync = IndexSynchronizer::new(
            store.clone(),
            embedder.clone(),
            normalizer.clone(),
            index.clone(),
        );
        let orchestrator = RetrievalOrchestrator::new(
            normalizer.clone(),
            embedder,
            index,
            Arc::new(MemoryConversationLog::default()),
            RetrievalSettings {
                top_k,
                ..RetrievalSettings::default()
            },
        );

        Self {
            _temp: temp,
            store,
            provider,
            normalizer,
            sync,
            orchestrator,
        }
    }

    /// Add an entry whose embedding is `vector`.
    fn add(&self, question: &str, answer: &str, vector: &[f32]) -> i64 {
        let entry = self
            .store
            .add_entry(&NewEntry::new("support", question, answer))
            .unwrap();
        let text = self.normalizer.normalize(&entry.embedding_text());
        self.provider.set(&text, unit(vector));
        entry.id
    }

    fn query_vector(&self, question: &str, vector: &[f32]) {
        self.provider
            .set(&self.normalizer.normalize(question), unit(vector));
    }
}

#[tokio::test]
async fn test_relevant_entry_ranks_first() {
    let p = Pipeline::new(5);
    let install = p.add("Comment installer le logiciel ?", "Lancez l'installateur.", &[1.0, 0.5, 0.2]);
    let audio = p.add("Comment régler le volume ?", "Onglet audio.", &[-0.3, -0.8, 0.4]);
    p.sync.sync_once().await.unwrap();

    p.query_vector("Installation du logiciel impossible", &[0.9, 0.4, 0.3]);
    let answer = p
        .orchestrator
        .answer("Installation du logiciel impossible", "s")
        .await
        .unwrap();

    assert!(answer.matched);
    assert_eq!(answer.source_ids(), vec![install, audio]);
    assert!(answer.confidence > 0.9, "confidence {}", answer.confidence);
    assert!(answer.sources[0].confidence > answer.sources[1].confidence);
}

#[tokio::test]
async fn test_scores_are_non_increasing_and_complete() {
    let p = Pipeline::new(10);
    let ids = [
        p.add("Question alpha ?", "Réponse alpha.", &[1.0, 0.0, 0.0]),
        p.add("Question beta ?", "Réponse beta.", &[0.7, 0.7, 0.0]),
        p.add("Question gamma ?", "Réponse gamma.", &[0.0, 1.0, 0.0]),
        p.add("Question delta ?", "Réponse delta.", &[-1.0, 0.0, 0.0]),
    ];
    p.sync.sync_once().await.unwrap();

    p.query_vector("Question exacte ?", &[1.0, 0.0, 0.0]);
    let answer = p
        .orchestrator
        .answer("Question exacte ?", "s")
        .await
        .unwrap();

    assert_eq!(answer.sources.len(), ids.len());
    assert_eq!(answer.sources[0].id, ids[0]);
    assert_eq!(answer.sources[3].id, ids[3]);
    for pair in answer.sources.windows(2) {
        assert!(pair[0].confidence >= pair[1].confidence);
    }
    assert!(answer.sources[3].confidence < 0.01);
}

#[tokio::test]
async fn test_orthogonal_query_is_no_match() {
    let p = Pipeline::new(5);
    p.add("Question alpha ?", "Réponse alpha.", &[1.0, 0.0, 0.0]);
    p.sync.sync_once().await.unwrap();

    p.query_vector("Recette des pâtes ?", &[0.0, 1.0, 0.0]);
    let answer = p
        .orchestrator
        .answer("Recette des pâtes ?", "s")
        .await
        .unwrap();

    assert!(!answer.matched);
    assert!((answer.confidence - 0.5).abs() < 1e-5);
    assert!(answer.sources.is_empty());
}

#[tokio::test]
async fn test_deactivated_entry_disappears_after_sync() {
    let p = Pipeline::new(5);
    let first = p.add("Question alpha ?", "Réponse alpha.", &[1.0, 0.0, 0.0]);
    let second = p.add("Question beta ?", "Réponse beta.", &[0.9, 0.1, 0.0]);
    p.sync.sync_once().await.unwrap();

    p.store.deactivate_entry(first).unwrap();
    p.sync.sync_once().await.unwrap().unwrap();

    p.query_vector("Question exacte ?", &[1.0, 0.0, 0.0]);
    let answer = p
        .orchestrator
        .answer("Question exacte ?", "s")
        .await
        .unwrap();
    assert_eq!(answer.source_ids(), vec![second]);
}

#[tokio::test]
async fn test_top_k_limits_sources() {
    let p = Pipeline::new(2);
    for i in 0..5 {
        p.add(
            &format!("Question numéro {} ?", 10 + i),
            "Réponse.",
            &[1.0, i as f32 * 0.1, 0.0],
        );
    }
    p.sync.sync_once().await.unwrap();

    p.query_vector("Question exacte ?", &[1.0, 0.0, 0.0]);
    let answer = p
        .orchestrator
        .answer("Question exacte ?", "s")
        .await
        .unwrap();
    assert_eq!(answer.sources.len(), 2);
}
