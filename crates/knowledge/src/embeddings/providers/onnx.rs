//! Transformer encoder embeddings via tract.
//!
//! The model directory holds `model.onnx` (a BERT-family encoder whose first
//! output is the `[batch, seq, hidden]` token states) and `tokenizer.json`.
//! Sentence vectors are the attention-masked mean of the token states.
//!
//! Each text runs through its own forward pass. Padding a batch changes the
//! reduction order inside the encoder and with it the low bits of the
//! result, and identical texts must produce identical vectors.

use crate::embeddings::provider::EmbeddingProvider;
use kbqa_core::config::EmbeddingSettings;
use kbqa_core::{AppError, AppResult};
use ndarray::{Array3, Axis};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::{Tokenizer, TruncationParams};
use tokio::sync::OnceCell;
use tract_onnx::prelude::*;

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

pub const MODEL_FILE: &str = "model.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// ONNX encoder provider. The model loads on first use.
pub struct OnnxProvider {
    model_dir: PathBuf,
    model_name: String,
    dimensions: usize,
    max_seq_length: usize,
    loaded: OnceCell<Arc<LoadedModel>>,
}

impl std::fmt::Debug for OnnxProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxProvider")
            .field("model_dir", &self.model_dir)
            .field("model_name", &self.model_name)
            .field("dimensions", &self.dimensions)
            .field("loaded", &self.loaded.initialized())
            .finish()
    }
}

impl OnnxProvider {
    pub fn new(settings: &EmbeddingSettings, model_dir: PathBuf) -> Self {
        Self {
            model_dir,
            model_name: settings.model_name.clone(),
            dimensions: settings.dimensions,
            max_seq_length: settings.max_seq_length,
            loaded: OnceCell::new(),
        }
    }

    async fn model(&self) -> AppResult<Arc<LoadedModel>> {
        let model = self
            .loaded
            .get_or_try_init(|| async {
                let dir = self.model_dir.clone();
                let max_seq_length = self.max_seq_length;

                tracing::info!("Loading embedding model from {}", dir.display());
                let loaded =
                    tokio::task::spawn_blocking(move || LoadedModel::load(&dir, max_seq_length))
                        .await
                        .map_err(|e| {
                            AppError::ModelUnavailable(format!("Model loader panicked: {}", e))
                        })??;

                tracing::info!(
                    "Embedding model '{}' ready ({} inputs)",
                    self.model_name,
                    loaded.input_count
                );
                Ok::<_, AppError>(Arc::new(loaded))
            })
            .await?;

        Ok(Arc::clone(model))
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for OnnxProvider {
    fn provider_name(&self) -> &str {
        "onnx"
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn warm_up(&self) -> AppResult<()> {
        self.model().await.map(|_| ())
    }

    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model().await?;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            texts
                .iter()
                .map(|text| model.embed(text))
                .collect::<AppResult<Vec<_>>>()
        })
        .await
        .map_err(|e| AppError::Encoding(format!("Encoder task panicked: {}", e)))?
    }
}

struct LoadedModel {
    plan: TractModel,
    tokenizer: Tokenizer,
    input_count: usize,
}

impl LoadedModel {
    fn load(dir: &Path, max_seq_length: usize) -> AppResult<Self> {
        let model_path = dir.join(MODEL_FILE);
        let tokenizer_path = dir.join(TOKENIZER_FILE);

        for path in [&model_path, &tokenizer_path] {
            if !path.exists() {
                return Err(AppError::ModelUnavailable(format!(
                    "Missing model file: {}",
                    path.display()
                )));
            }
        }

        let plan = tract_onnx::onnx()
            .model_for_path(&model_path)
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| load_failed(&model_path, e))?;

        let input_count = plan.model().inputs.len();
        if !(2..=3).contains(&input_count) {
            return Err(AppError::ModelUnavailable(format!(
                "Unsupported encoder signature: expected 2 or 3 inputs, got {}",
                input_count
            )));
        }

        let mut tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| load_failed(&tokenizer_path, e))?;

        tokenizer.with_padding(None);
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_seq_length,
                ..Default::default()
            }))
            .map_err(|e| AppError::ModelUnavailable(format!("Invalid truncation: {}", e)))?;

        Ok(Self {
            plan,
            tokenizer,
            input_count,
        })
    }

    fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| AppError::Encoding(format!("Tokenization failed: {}", e)))?;

        let ids: Vec<i64> = encoding.get_ids().iter().map(|&v| v as i64).collect();
        let mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&v| v as i64)
            .collect();
        let type_ids: Vec<i64> = encoding.get_type_ids().iter().map(|&v| v as i64).collect();

        let seq_len = ids.len();
        if seq_len == 0 {
            return Err(AppError::Encoding("Text produced no tokens".to_string()));
        }

        let tensor = |data: &[i64]| {
            Tensor::from_shape(&[1, seq_len], data)
                .map_err(|e| AppError::Encoding(format!("Invalid input tensor: {}", e)))
        };

        let mut inputs: TVec<TValue> = tvec![tensor(&ids)?.into(), tensor(&mask)?.into()];
        if self.input_count == 3 {
            inputs.push(tensor(&type_ids)?.into());
        }

        let outputs = self
            .plan
            .run(inputs)
            .map_err(|e| AppError::Encoding(format!("Inference failed: {}", e)))?;

        let hidden = outputs
            .first()
            .ok_or_else(|| AppError::Encoding("Encoder returned no output".to_string()))?
            .to_array_view::<f32>()
            .map_err(|e| AppError::Encoding(format!("Unexpected output type: {}", e)))?
            .to_owned()
            .into_dimensionality::<ndarray::Ix3>()
            .map_err(|e| AppError::Encoding(format!("Unexpected output shape: {}", e)))?;

        Ok(mean_pool(&hidden, &mask))
    }
}

fn load_failed(path: &Path, e: impl std::fmt::Display) -> AppError {
    AppError::ModelUnavailable(format!("Failed to load {}: {}", path.display(), e))
}

/// Attention-masked mean over the token axis of a `[1, seq, hidden]` tensor.
fn mean_pool(hidden: &Array3<f32>, mask: &[i64]) -> Vec<f32> {
    let tokens = hidden.index_axis(Axis(0), 0);
    let mut pooled = vec![0.0f32; tokens.shape()[1]];
    let mut count = 0.0f32;

    for (row, &m) in tokens.axis_iter(Axis(0)).zip(mask) {
        if m == 0 {
            continue;
        }
        for (acc, v) in pooled.iter_mut().zip(row.iter()) {
            *acc += v;
        }
        count += 1.0;
    }

    if count > 0.0 {
        for v in &mut pooled {
            *v /= count;
        }
    }

    pooled
}
