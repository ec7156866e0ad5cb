//! Embedding generation.
//!
//! [`Embedder`] wraps an [`EmbeddingProvider`] and guarantees that every
//! vector it hands out has the configured dimension, finite components and
//! unit length, so inner products between them are cosine similarities.

pub mod provider;
pub mod providers;

pub use provider::{create_provider, EmbeddingProvider};
pub use providers::onnx::OnnxProvider;
pub use providers::trigram::TrigramProvider;

use kbqa_core::config::EmbeddingSettings;
use kbqa_core::{AppError, AppResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const INITIAL_BACKOFF_MS: u64 = 100;

/// Validating front end for an embedding provider.
#[derive(Debug, Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
        }
    }

    /// Create the configured provider and load it, retrying with
    /// exponential backoff up to `load_retries` attempts.
    pub async fn connect(settings: &EmbeddingSettings, model_dir: PathBuf) -> AppResult<Self> {
        let provider = create_provider(settings, model_dir)?;
        let attempts = settings.load_retries.max(1);
        let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);

        for attempt in 1..=attempts {
            match provider.warm_up().await {
                Ok(()) => {
                    tracing::info!(
                        "Embedding provider '{}' ready (model: {}, dimensions: {})",
                        provider.provider_name(),
                        provider.model_name(),
                        provider.dimensions()
                    );
                    return Ok(Self::new(provider, settings.batch_size));
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        "Embedding provider load failed (attempt {}/{}): {}",
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    return Err(match e {
                        AppError::ModelUnavailable(_) => e,
                        other => AppError::ModelUnavailable(other.to_string()),
                    });
                }
            }
        }

        Err(AppError::ModelUnavailable(
            "Embedding provider could not be loaded".to_string(),
        ))
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Embed a single text.
    pub async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::Encoding("No embedding returned".to_string()))
    }

    /// Embed texts in provider batches of `batch_size`, preserving order.
    ///
    /// Fails on the first blank text, wrong-sized vector or degenerate
    /// vector; partial results are discarded.
    pub async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if let Some(pos) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(AppError::Encoding(format!(
                "Cannot embed blank text (item {})",
                pos
            )));
        }

        let expected = self.dimensions();
        let mut out = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.batch_size) {
            let vectors = self.provider.embed_batch(chunk).await?;
            if vectors.len() != chunk.len() {
                return Err(AppError::Encoding(format!(
                    "Provider returned {} vectors for {} texts",
                    vectors.len(),
                    chunk.len()
                )));
            }

            for vector in vectors {
                out.push(finalize(vector, expected)?);
            }
        }

        tracing::debug!("Embedded {} texts ({} dimensions)", out.len(), expected);
        Ok(out)
    }
}

/// Check the dimension and scale `vector` to unit length.
fn finalize(mut vector: Vec<f32>, expected: usize) -> AppResult<Vec<f32>> {
    if vector.len() != expected {
        return Err(AppError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }

    if vector.iter().any(|v| !v.is_finite()) {
        return Err(AppError::Encoding(
            "Embedding contains non-finite values".to_string(),
        ));
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(AppError::Encoding("Embedding has zero norm".to_string()));
    }

    for v in &mut vector {
        *v /= norm;
    }
    Ok(vector)
}
