//! Hashed character-trigram embeddings for offline operation.

use crate::embeddings::provider::EmbeddingProvider;
use kbqa_core::AppResult;
use std::collections::BTreeMap;

const MODEL_NAME: &str = "trigram-v2";

/// Trigram-based embedding provider.
///
/// Each word contributes its boundary-padded character trigrams and the
/// whole word to hashed buckets. Vectors are deterministic and
/// content-dependent but carry no semantics beyond shared spelling; useful
/// for development, tests and machines without the encoder model.
#[derive(Debug)]
pub struct TrigramProvider {
    dimensions: usize,
}

impl TrigramProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn bucket(&self, feature: &str, seed: u64) -> usize {
        let hash = feature
            .bytes()
            .fold(seed, |acc, b| (acc ^ b as u64).wrapping_mul(0x0100_0000_01b3));
        (hash % self.dimensions as u64) as usize
    }

    fn generate_trigram_embedding(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0; self.dimensions];
        if self.dimensions == 0 {
            return embedding;
        }

        let lower = text.to_lowercase();

        let mut word_freq: BTreeMap<&str, u32> = BTreeMap::new();
        for word in lower.split_whitespace() {
            *word_freq.entry(word).or_insert(0) += 1;
        }

        for (word, freq) in &word_freq {
            let padded: Vec<char> = std::iter::once('#')
                .chain(word.chars())
                .chain(std::iter::once('#'))
                .collect();

            for window in padded.windows(3) {
                let trigram: String = window.iter().collect();
                let idx = self.bucket(&trigram, 0xcbf2_9ce4_8422_2325);
                embedding[idx] += (*freq as f32).sqrt();
            }

            let idx = self.bucket(word, 0x8422_2325_cbf2_9ce4);
            embedding[idx] += *freq as f32;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut embedding {
                *v /= norm;
            }
        }

        embedding
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for TrigramProvider {
    fn provider_name(&self) -> &str {
        "trigram"
    }

    fn model_name(&self) -> &str {
        MODEL_NAME
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| self.generate_trigram_embedding(text))
            .collect())
    }
}
