//! LLM provider factory.
//!
//! Resolves the configured provider name into a client implementation.

use crate::client::LlmClient;
use crate::providers::{LlamaCppClient, OllamaClient};
use crate::types::ProviderType;
use kbqa_core::{AppError, AppResult};
use std::sync::Arc;
use std::time::Duration;

/// Create an LLM client based on the provider name.
///
/// Returns `Ok(None)` for the disabled provider ("none"), in which case
/// answers degrade to the retrieved context.
///
/// # Errors
/// Returns a configuration error if the provider is unknown or the HTTP
/// client cannot be built.
pub fn create_client(
    provider: &str,
    endpoint: Option<&str>,
    timeout: Duration,
) -> AppResult<Option<Arc<dyn LlmClient>>> {
    let provider_type = ProviderType::parse(provider).ok_or_else(|| {
        AppError::Config(format!(
            "Unknown generator provider: {}. Supported: ollama, llamacpp, none",
            provider
        ))
    })?;

    let base_url = endpoint
        .or(provider_type.default_endpoint())
        .unwrap_or_default();

    let client: Arc<dyn LlmClient> = match provider_type {
        ProviderType::Ollama => Arc::new(OllamaClient::with_base_url(base_url, timeout)?),
        ProviderType::LlamaCpp => Arc::new(LlamaCppClient::with_base_url(base_url, timeout)?),
        ProviderType::Disabled => return Ok(None),
    };

    tracing::debug!("Created {} client for {}", provider_type.as_str(), base_url);
    Ok(Some(client))
}
