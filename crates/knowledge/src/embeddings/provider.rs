//! Embedding provider trait and factory.

use super::providers::{onnx::OnnxProvider, trigram::TrigramProvider};
use kbqa_core::config::EmbeddingSettings;
use kbqa_core::{AppError, AppResult};
use std::path::PathBuf;
use std::sync::Arc;

/// Trait for embedding backends.
///
/// Providers return raw pooled vectors; [`super::Embedder`] validates and
/// normalizes them.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync + std::fmt::Debug {
    /// Provider name (e.g. "onnx", "trigram")
    fn provider_name(&self) -> &str;

    /// Model identifier
    fn model_name(&self) -> &str;

    /// Output vector dimension
    fn dimensions(&self) -> usize;

    /// Load whatever the provider needs before the first request.
    async fn warm_up(&self) -> AppResult<()> {
        Ok(())
    }

    /// Generate embeddings for multiple texts in a batch.
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;

    /// Generate embedding for a single text.
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        let mut results = self.embed_batch(&[text.to_string()]).await?;
        results
            .pop()
            .ok_or_else(|| AppError::Encoding("No embedding returned".to_string()))
    }
}

/// Create an embedding provider from settings.
///
/// `model_dir` is only read by the `onnx` provider.
pub fn create_provider(
    settings: &EmbeddingSettings,
    model_dir: PathBuf,
) -> AppResult<Arc<dyn EmbeddingProvider>> {
    match settings.provider.as_str() {
        "trigram" => Ok(Arc::new(TrigramProvider::new(settings.dimensions))),
        "onnx" => Ok(Arc::new(OnnxProvider::new(settings, model_dir))),
        other => Err(AppError::Config(format!(
            "Unknown embedding provider: '{}'. Supported providers: onnx, trigram",
            other
        ))),
    }
}
