//! llama.cpp server provider.
//!
//! Talks to `llama-server` hosting a quantized GGUF model through its native
//! `/completion` endpoint.

use super::{build_http_client, check_endpoint, post_json_with_retries};
use crate::client::{LlmClient, LlmRequest, LlmResponse, LlmUsage};
use kbqa_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::instrument;

#[derive(Debug, Serialize)]
struct CompletionRequest {
    prompt: String,
    n_predict: i64,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    repeat_penalty: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    cache_prompt: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    content: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tokens_evaluated: u32,
    #[serde(default)]
    tokens_predicted: u32,
}

/// Client for a llama.cpp HTTP server.
pub struct LlamaCppClient {
    base_url: String,
    client: reqwest::Client,
}

impl LlamaCppClient {
    /// Create a client for `base_url` with the given request timeout.
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_http_client(timeout)?,
        })
    }

    fn to_completion_request(&self, request: &LlmRequest) -> CompletionRequest {
        // llama.cpp has no separate system field; prepend it to the prompt.
        let prompt = match request.system {
            Some(ref system) => format!("{}\n\n{}", system, request.prompt),
            None => request.prompt.clone(),
        };

        let sampling = &request.sampling;
        CompletionRequest {
            prompt,
            n_predict: request.max_tokens.map(i64::from).unwrap_or(-1),
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            repeat_penalty: sampling.repeat_penalty,
            stop: sampling.stop.clone(),
            cache_prompt: true,
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for LlamaCppClient {
    fn provider_name(&self) -> &str {
        "llamacpp"
    }

    #[instrument(skip(self, request), fields(prompt_len = request.prompt.len()))]
    async fn complete(&self, request: &LlmRequest) -> AppResult<LlmResponse> {
        let body = self.to_completion_request(request);
        let url = format!("{}/completion", self.base_url);

        let response = post_json_with_retries(&self.client, &url, &body, "llamacpp").await?;

        let parsed: CompletionResponse = response.json().await.map_err(|e| {
            AppError::Generation(format!("Failed to parse llama.cpp response: {}", e))
        })?;

        tracing::debug!(
            tokens_predicted = parsed.tokens_predicted,
            "Received completion from llama.cpp"
        );

        Ok(LlmResponse {
            content: parsed.content,
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
            usage: LlmUsage::new(parsed.tokens_evaluated, parsed.tokens_predicted),
        })
    }

    async fn health(&self) -> AppResult<()> {
        check_endpoint(&self.client, &format!("{}/health", self.base_url), "llamacpp").await
    }
}
