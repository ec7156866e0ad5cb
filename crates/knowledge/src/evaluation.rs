//! Retrieval quality evaluation.
//!
//! Ranking metrics over entry ids, and an evaluator that replays the
//! knowledge base's own questions against the live index. An entry's
//! relevant set is every active entry of its category; the entry itself
//! counts double for NDCG.

use crate::rag::RetrievalOrchestrator;
use crate::store::KnowledgeStore;
use crate::types::KnowledgeEntry;
use kbqa_core::{AppError, AppResult};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

/// Confidence from which a hit counts as high.
pub const HIGH_CONFIDENCE: f32 = 0.8;

/// Misses listed in a report.
const MAX_LISTED_FAILURES: usize = 10;

/// Set-based precision, recall and F1 of a ranked list cut at `k`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RetrievalScores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Precision@k, recall@k and F1@k.
///
/// Precision divides by the number of predictions actually kept, so a
/// list shorter than `k` is not penalized for missing slots. Empty
/// predictions or an empty relevant set score zero.
pub fn precision_recall_f1(ranked: &[i64], relevant: &[i64], k: usize) -> RetrievalScores {
    let predictions = &ranked[..ranked.len().min(k)];
    if predictions.is_empty() || relevant.is_empty() {
        return RetrievalScores::default();
    }

    let predicted: HashSet<i64> = predictions.iter().copied().collect();
    let truth: HashSet<i64> = relevant.iter().copied().collect();
    let hits = predicted.intersection(&truth).count() as f64;

    let precision = hits / predictions.len() as f64;
    let recall = hits / truth.len() as f64;
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    RetrievalScores {
        precision,
        recall,
        f1,
    }
}

/// 1 / rank of the first relevant id, 0 when none is retrieved.
pub fn reciprocal_rank(ranked: &[i64], relevant: &[i64]) -> f64 {
    ranked
        .iter()
        .position(|id| relevant.contains(id))
        .map(|i| 1.0 / (i + 1) as f64)
        .unwrap_or(0.0)
}

/// Mean of [`reciprocal_rank`] over `(ranked, relevant)` runs.
pub fn mean_reciprocal_rank<R, T>(runs: &[(R, T)]) -> f64
where
    R: AsRef<[i64]>,
    T: AsRef<[i64]>,
{
    if runs.is_empty() {
        return 0.0;
    }
    let total: f64 = runs
        .iter()
        .map(|(ranked, relevant)| reciprocal_rank(ranked.as_ref(), relevant.as_ref()))
        .sum();
    total / runs.len() as f64
}

/// Normalized discounted cumulative gain at `k` with graded relevances.
/// Ids missing from `relevances` have gain 0.
pub fn ndcg_at_k(ranked: &[i64], relevances: &HashMap<i64, f64>, k: usize) -> f64 {
    let dcg = discounted_gain(
        ranked
            .iter()
            .take(k)
            .map(|id| relevances.get(id).copied().unwrap_or(0.0)),
    );

    let mut ideal: Vec<f64> = relevances.values().copied().collect();
    ideal.sort_by(|a, b| b.total_cmp(a));
    let idcg = discounted_gain(ideal.into_iter().take(k));

    if idcg <= 0.0 {
        0.0
    } else {
        dcg / idcg
    }
}

fn discounted_gain(gains: impl Iterator<Item = f64>) -> f64 {
    gains
        .enumerate()
        .map(|(i, gain)| gain / ((i + 2) as f64).log2())
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationSettings {
    /// Cut-off for every metric
    pub k: usize,
    /// Questions replayed, spread evenly over the entries; 0 replays all
    pub sample: usize,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self { k: 5, sample: 20 }
    }
}

/// Outcome for one replayed question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryEvaluation {
    pub entry_id: i64,
    pub question: String,
    pub retrieved: Vec<i64>,
    /// Whether any relevant entry made the top k
    pub hit: bool,
    #[serde(flatten)]
    pub scores: RetrievalScores,
    pub reciprocal_rank: f64,
    pub ndcg: f64,
    /// Confidence of the best hit
    pub confidence: f32,
    pub latency_ms: u64,
}

/// Share of replayed questions per confidence band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ConfidenceBands {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub k: usize,
    pub questions: usize,
    pub hit_rate: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub mrr: f64,
    pub ndcg: f64,
    pub mean_confidence: f64,
    pub confidence_bands: ConfidenceBands,
    pub latency_mean_ms: f64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    /// First misses, in replay order
    pub failures: Vec<QueryEvaluation>,
    pub details: Vec<QueryEvaluation>,
}

/// Replays knowledge base questions against the index.
pub struct Evaluator<'a> {
    store: &'a dyn KnowledgeStore,
    orchestrator: &'a RetrievalOrchestrator,
    settings: EvaluationSettings,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        store: &'a dyn KnowledgeStore,
        orchestrator: &'a RetrievalOrchestrator,
        settings: EvaluationSettings,
    ) -> Self {
        Self {
            store,
            orchestrator,
            settings,
        }
    }

    pub async fn run(&self) -> AppResult<EvaluationReport> {
        let k = self.settings.k;
        if k == 0 {
            return Err(AppError::InvalidInput("k must be at least 1".to_string()));
        }

        let entries = self.store.list_active_entries().await?;
        if entries.is_empty() {
            return Err(AppError::InvalidInput(
                "No active entries to evaluate".to_string(),
            ));
        }

        let mut by_category: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
        for entry in &entries {
            by_category.entry(entry.category.as_str()).or_default().push(entry.id);
        }

        let sample = sample_evenly(&entries, self.settings.sample);
        tracing::info!(k, questions = sample.len(), entries = entries.len(), "Starting retrieval evaluation");

        let mut details = Vec::with_capacity(sample.len());
        for entry in sample {
            let relevant = by_category
                .get(entry.category.as_str())
                .cloned()
                .unwrap_or_default();

            let started = Instant::now();
            let sources = self.orchestrator.retrieve(&entry.question, k).await?;
            let latency_ms = started.elapsed().as_millis() as u64;

            let retrieved: Vec<i64> = sources.iter().map(|s| s.id).collect();
            let relevances: HashMap<i64, f64> = relevant
                .iter()
                .map(|&id| (id, if id == entry.id { 2.0 } else { 1.0 }))
                .collect();

            details.push(QueryEvaluation {
                entry_id: entry.id,
                question: entry.question.clone(),
                hit: retrieved.iter().any(|id| relevant.contains(id)),
                scores: precision_recall_f1(&retrieved, &relevant, k),
                reciprocal_rank: reciprocal_rank(&retrieved, &relevant),
                ndcg: ndcg_at_k(&retrieved, &relevances, k),
                confidence: sources.first().map(|s| s.confidence).unwrap_or(0.0),
                latency_ms,
                retrieved,
            });
        }

        let report = summarize(k, details, self.orchestrator.settings().confidence_threshold);
        tracing::info!(
            hit_rate = report.hit_rate,
            mrr = report.mrr,
            ndcg = report.ndcg,
            "Retrieval evaluation finished"
        );
        Ok(report)
    }
}

/// Every `len / sample`-th entry, at most `sample` of them.
fn sample_evenly(entries: &[KnowledgeEntry], sample: usize) -> Vec<&KnowledgeEntry> {
    if sample == 0 || sample >= entries.len() {
        return entries.iter().collect();
    }
    let step = (entries.len() / sample).max(1);
    entries.iter().step_by(step).take(sample).collect()
}

fn summarize(k: usize, details: Vec<QueryEvaluation>, threshold: f32) -> EvaluationReport {
    let n = details.len().max(1) as f64;
    let mean = |f: &dyn Fn(&QueryEvaluation) -> f64| details.iter().map(f).sum::<f64>() / n;
    let share = |f: &dyn Fn(f32) -> bool| {
        details.iter().filter(|d| f(d.confidence)).count() as f64 / n
    };

    let mut latencies: Vec<u64> = details.iter().map(|d| d.latency_ms).collect();
    latencies.sort_unstable();
    let percentile = |p: f64| {
        let i = ((latencies.len() as f64 * p) as usize).min(latencies.len().saturating_sub(1));
        latencies.get(i).copied().unwrap_or(0)
    };

    EvaluationReport {
        k,
        questions: details.len(),
        hit_rate: mean(&|d| if d.hit { 1.0 } else { 0.0 }),
        precision: mean(&|d| d.scores.precision),
        recall: mean(&|d| d.scores.recall),
        f1: mean(&|d| d.scores.f1),
        mrr: mean(&|d| d.reciprocal_rank),
        ndcg: mean(&|d| d.ndcg),
        mean_confidence: mean(&|d| d.confidence as f64),
        confidence_bands: ConfidenceBands {
            high: share(&|c| c >= HIGH_CONFIDENCE),
            medium: share(&|c| c >= threshold && c < HIGH_CONFIDENCE),
            low: share(&|c| c < threshold),
        },
        latency_mean_ms: mean(&|d| d.latency_ms as f64),
        latency_p50_ms: percentile(0.5),
        latency_p95_ms: percentile(0.95),
        failures: details
            .iter()
            .filter(|d| !d.hit)
            .take(MAX_LISTED_FAILURES)
            .cloned()
            .collect(),
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::testing::MemoryConversationLog;
    use crate::embeddings::{Embedder, TrigramProvider};
    use crate::normalize::TextNormalizer;
    use crate::store::testing::{entry, MemoryStore};
    use crate::sync::IndexSynchronizer;
    use crate::vector_index::VectorIndex;
    use kbqa_core::config::RetrievalSettings;
    use std::sync::Arc;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_precision_recall_f1() {
        let scores = precision_recall_f1(&[1, 5, 3, 7], &[1, 2, 3], 3);
        assert!(close(scores.precision, 2.0 / 3.0));
        assert!(close(scores.recall, 2.0 / 3.0));
        assert!(close(scores.f1, 2.0 / 3.0));

        let none = precision_recall_f1(&[4, 5], &[1], 5);
        assert_eq!(none, RetrievalScores::default());
        assert_eq!(precision_recall_f1(&[], &[1], 5), RetrievalScores::default());
        assert_eq!(precision_recall_f1(&[1], &[], 5), RetrievalScores::default());

        // Short list: precision counts only what was returned.
        let short = precision_recall_f1(&[2], &[2, 9], 5);
        assert!(close(short.precision, 1.0));
        assert!(close(short.recall, 0.5));
    }

    #[test]
    fn test_reciprocal_ranks() {
        assert!(close(reciprocal_rank(&[3, 1, 2], &[1]), 0.5));
        assert!(close(reciprocal_rank(&[1, 2, 3], &[1]), 1.0));
        assert_eq!(reciprocal_rank(&[4, 5], &[1]), 0.0);

        let runs: [(Vec<i64>, Vec<i64>); 2] = [(vec![3, 1, 2], vec![1]), (vec![1, 2, 3], vec![1])];
        assert!(close(mean_reciprocal_rank(&runs), 0.75));
        assert_eq!(mean_reciprocal_rank::<Vec<i64>, Vec<i64>>(&[]), 0.0);
    }

    #[test]
    fn test_ndcg() {
        let relevances = HashMap::from([(1, 2.0), (2, 1.0)]);
        assert!(close(ndcg_at_k(&[1, 2, 3], &relevances, 3), 1.0));

        // Swapped order loses gain: (1 + 2/log2(3)) / (2 + 1/log2(3)).
        let swapped = ndcg_at_k(&[2, 1], &relevances, 3);
        let expected = (1.0 + 2.0 / 3f64.log2()) / (2.0 + 1.0 / 3f64.log2());
        assert!(close(swapped, expected), "{swapped} vs {expected}");

        assert_eq!(ndcg_at_k(&[7, 8], &relevances, 2), 0.0);
        assert_eq!(ndcg_at_k(&[1], &HashMap::new(), 2), 0.0);
    }

    #[test]
    fn test_sample_evenly() {
        let entries: Vec<_> = (1..=10).map(|i| entry(i, "Question ?", "Réponse.")).collect();
        let ids = |picked: Vec<&KnowledgeEntry>| picked.iter().map(|e| e.id).collect::<Vec<_>>();

        assert_eq!(ids(sample_evenly(&entries, 3)), vec![1, 4, 7]);
        assert_eq!(ids(sample_evenly(&entries, 0)).len(), 10);
        assert_eq!(ids(sample_evenly(&entries, 50)).len(), 10);
    }

    #[tokio::test]
    async fn test_evaluator_replays_questions() {
        let mut entries = vec![
            entry(1, "Comment installer AI_licia ?", "Téléchargez l'installateur."),
            entry(2, "Où trouver les journaux d'erreurs ?", "Dans le dossier logs."),
            entry(3, "Comment configurer la synthèse vocale ?", "Ouvrez l'onglet audio."),
        ];
        entries[0].category = "installation".to_string();
        entries[1].category = "installation".to_string();
        entries[2].category = "audio".to_string();

        let store = Arc::new(MemoryStore::with_entries(entries));
        let normalizer = Arc::new(TextNormalizer::default());
        let embedder = Embedder::new(Arc::new(TrigramProvider::new(512)), 8);
        let index = Arc::new(VectorIndex::new(512));
        IndexSynchronizer::new(store.clone(), embedder.clone(), normalizer.clone(), index.clone())
            .sync_once()
            .await
            .unwrap();

        let log = Arc::new(MemoryConversationLog::default());
        let orchestrator = RetrievalOrchestrator::new(
            normalizer,
            embedder,
            index,
            log.clone(),
            RetrievalSettings::default(),
        );

        let report = Evaluator::new(store.as_ref(), &orchestrator, EvaluationSettings { k: 2, sample: 0 })
            .run()
            .await
            .unwrap();

        assert_eq!(report.questions, 3);
        assert_eq!(report.k, 2);
        // Every question finds itself first.
        assert!(close(report.hit_rate, 1.0));
        assert!(close(report.mrr, 1.0));
        assert!(report.failures.is_empty());
        assert!(report.details.iter().all(|d| d.retrieved[0] == d.entry_id));
        assert!(report.ndcg > 0.7 && report.ndcg <= 1.0 + 1e-9);
        assert!(close(report.confidence_bands.high, 1.0));
        // Replays are not conversations.
        assert!(log.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_evaluator_rejects_empty_store() {
        let store = MemoryStore::with_entries(Vec::new());
        let orchestrator = RetrievalOrchestrator::new(
            Arc::new(TextNormalizer::default()),
            Embedder::new(Arc::new(TrigramProvider::new(64)), 8),
            Arc::new(VectorIndex::new(64)),
            Arc::new(MemoryConversationLog::default()),
            RetrievalSettings::default(),
        );

        let err = Evaluator::new(&store, &orchestrator, EvaluationSettings::default())
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }
}
