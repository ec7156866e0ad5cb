//! Query answering over the vector index.
//!
//! Pipeline for one question:
//! 1. Validate the question and prepare it like indexed entries
//! 2. Embed it and search the current index snapshot
//! 3. Turn the best raw score into a confidence; below the threshold the
//!    configured no-match answer is returned without generation
//! 4. Generate from the top hits, under a timeout; any generation problem
//!    degrades to the retrieved pairs rendered verbatim
//! 5. Record the conversation (failures only logged)

use crate::conversation::{ConversationLog, NewConversation};
use crate::embeddings::Embedder;
use crate::normalize::TextNormalizer;
use crate::rag::types::{confidence_from_score, truncate_snippet, Answer, SourceRef};
use crate::types::LatencyBreakdown;
use crate::validation::validate_question;
use crate::vector_index::VectorIndex;
use kbqa_core::config::RetrievalSettings;
use kbqa_core::{AppError, AppResult};
use kbqa_llm::generator::render_contexts;
use kbqa_llm::{ContextPair, Generator};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_MAX_TOKENS: u32 = 400;
const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RetrievalOrchestrator {
    normalizer: Arc<TextNormalizer>,
    embedder: Embedder,
    index: Arc<VectorIndex>,
    conversations: Arc<dyn ConversationLog>,
    settings: RetrievalSettings,
    generator: Option<Arc<dyn Generator>>,
    max_tokens: u32,
    generation_timeout: Duration,
}

impl std::fmt::Debug for RetrievalOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalOrchestrator")
            .field("embedder", &self.embedder)
            .field("settings", &self.settings)
            .field("generator", &self.generator.as_ref().map(|g| g.name().to_string()))
            .field("generation_timeout", &self.generation_timeout)
            .finish_non_exhaustive()
    }
}

/// Result of the generation step.
struct Generated {
    text: String,
    degraded: bool,
    elapsed_ms: u64,
}

impl RetrievalOrchestrator {
    /// Orchestrator without a generator: every matched answer is the
    /// retrieved context.
    pub fn new(
        normalizer: Arc<TextNormalizer>,
        embedder: Embedder,
        index: Arc<VectorIndex>,
        conversations: Arc<dyn ConversationLog>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            normalizer,
            embedder,
            index,
            conversations,
            settings,
            generator: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            generation_timeout: DEFAULT_GENERATION_TIMEOUT,
        }
    }

    pub fn with_generator(
        mut self,
        generator: Arc<dyn Generator>,
        max_tokens: u32,
        timeout: Duration,
    ) -> Self {
        self.generator = Some(generator);
        self.max_tokens = max_tokens;
        self.generation_timeout = timeout;
        self
    }

    pub fn generator(&self) -> Option<&Arc<dyn Generator>> {
        self.generator.as_ref()
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// Answer `question` for `session_id`.
    ///
    /// Fails on invalid input and on embedding or search errors; a low
    /// confidence or a generation failure is a regular [`Answer`].
    pub async fn answer(&self, question: &str, session_id: &str) -> AppResult<Answer> {
        let started = Instant::now();
        let question = validate_question(question)?;

        let step = Instant::now();
        let query = self.embed_query(&question).await?;
        let embedding_ms = elapsed_ms(step);

        let step = Instant::now();
        let snapshot = self
            .index
            .snapshot()
            .ok_or_else(|| AppError::Sync("No index loaded yet".to_string()))?;
        let hits = match &query {
            Some(query) => snapshot.search(query, self.settings.top_k)?,
            None => Vec::new(),
        };
        let search_ms = elapsed_ms(step);

        let confidence = hits
            .first()
            .map(|hit| confidence_from_score(hit.score))
            .unwrap_or(0.0);

        tracing::debug!(
            hits = hits.len(),
            best_score = hits.first().map(|h| h.score),
            confidence,
            threshold = self.settings.confidence_threshold,
            "Retrieved candidates"
        );

        let matched = !hits.is_empty() && confidence >= self.settings.confidence_threshold;

        let (sources, generated) = if matched {
            let mut sources = Vec::with_capacity(hits.len());
            let mut contexts = Vec::with_capacity(hits.len());
            for hit in &hits {
                let Some(entry) = snapshot.entry(hit.slot) else {
                    continue;
                };
                sources.push(SourceRef {
                    id: entry.entry_id,
                    question: entry.question.clone(),
                    excerpt: truncate_snippet(&entry.answer, self.settings.snippet_chars),
                    confidence: confidence_from_score(hit.score),
                });
                contexts.push(ContextPair::new(&entry.question, &entry.answer));
            }

            let generated = self.generate(&question, &contexts).await;
            (sources, generated)
        } else {
            tracing::info!(
                confidence,
                threshold = self.settings.confidence_threshold,
                "No relevant match"
            );
            let generated = Generated {
                text: self.settings.no_match_answer.clone(),
                degraded: false,
                elapsed_ms: 0,
            };
            (Vec::new(), generated)
        };

        let latency = LatencyBreakdown {
            embedding_ms,
            search_ms,
            generation_ms: generated.elapsed_ms,
            total_ms: elapsed_ms(started),
        };

        let mut answer = Answer {
            conversation_id: None,
            answer: generated.text,
            confidence,
            matched,
            degraded: generated.degraded,
            sources,
            latency,
        };

        answer.conversation_id = self.record(session_id, &question, &answer).await;

        tracing::info!(
            conversation_id = answer.conversation_id,
            confidence = answer.confidence,
            matched = answer.matched,
            degraded = answer.degraded,
            sources = answer.sources.len(),
            total_ms = latency.total_ms,
            "Answered question"
        );

        Ok(answer)
    }

    /// Ranked sources for `question`, best first, with no threshold,
    /// generation or logging applied.
    pub async fn retrieve(&self, question: &str, top_k: usize) -> AppResult<Vec<SourceRef>> {
        let query = self.embed_query(question).await?;
        let snapshot = self
            .index
            .snapshot()
            .ok_or_else(|| AppError::Sync("No index loaded yet".to_string()))?;
        let Some(query) = query else {
            return Ok(Vec::new());
        };

        Ok(snapshot
            .search(&query, top_k)?
            .into_iter()
            .filter_map(|hit| {
                let entry = snapshot.entry(hit.slot)?;
                Some(SourceRef {
                    id: entry.entry_id,
                    question: entry.question.clone(),
                    excerpt: truncate_snippet(&entry.answer, self.settings.snippet_chars),
                    confidence: confidence_from_score(hit.score),
                })
            })
            .collect())
    }

    /// Embed `question` the way entries are embedded, stopword-only
    /// fallback included. `None` when there is no text left to embed.
    async fn embed_query(&self, question: &str) -> AppResult<Option<Vec<f32>>> {
        let text = self.normalizer.embedding_text(question);
        if text.is_empty() {
            return Ok(None);
        }
        self.embedder.embed(&text).await.map(Some)
    }

    async fn generate(&self, question: &str, contexts: &[ContextPair]) -> Generated {
        let step = Instant::now();
        let fallback = |step: Instant| Generated {
            text: render_contexts(contexts),
            degraded: true,
            elapsed_ms: elapsed_ms(step),
        };

        let Some(generator) = &self.generator else {
            return fallback(step);
        };

        let outcome = tokio::time::timeout(
            self.generation_timeout,
            generator.generate(question, contexts, self.max_tokens),
        )
        .await;

        match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => Generated {
                text: text.trim().to_string(),
                degraded: false,
                elapsed_ms: elapsed_ms(step),
            },
            Ok(Ok(_)) => {
                tracing::warn!(generator = generator.name(), "Generator returned an empty answer");
                fallback(step)
            }
            Ok(Err(e)) => {
                tracing::warn!(generator = generator.name(), error = %e, "Generation failed; returning retrieved context");
                fallback(step)
            }
            Err(_) => {
                let e = AppError::GenerationTimeout {
                    timeout_ms: self.generation_timeout.as_millis() as u64,
                };
                tracing::warn!(generator = generator.name(), error = %e, "Generation timed out; returning retrieved context");
                fallback(step)
            }
        }
    }

    async fn record(&self, session_id: &str, question: &str, answer: &Answer) -> Option<i64> {
        let record = NewConversation {
            session_id: session_id.to_string(),
            question: question.to_string(),
            answer: answer.answer.clone(),
            confidence: answer.confidence,
            source_ids: answer.source_ids(),
            matched: answer.matched,
            degraded: answer.degraded,
            latency: answer.latency,
        };

        match self.conversations.record(record).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(error = %e, "Failed to record conversation");
                None
            }
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
