//! Completion backends.
//!
//! Both providers speak JSON over HTTP and share the retry policy below:
//! connection failures are retried with exponential backoff, everything else
//! (timeouts included) fails immediately so the caller's time budget holds.

pub mod llamacpp;
pub mod ollama;

pub use llamacpp::LlamaCppClient;
pub use ollama::OllamaClient;

use kbqa_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Maximum attempts for a request that fails to connect
pub(crate) const MAX_RETRIES: u32 = 3;

/// Initial backoff duration in milliseconds
pub(crate) const INITIAL_BACKOFF_MS: u64 = 100;

/// Default request timeout in seconds
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Error body returned by both Ollama and llama.cpp.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Message(String),
    Object { message: String },
}

impl ErrorDetail {
    fn message(&self) -> &str {
        match self {
            ErrorDetail::Message(m) => m,
            ErrorDetail::Object { message } => message,
        }
    }
}

pub(crate) fn build_http_client(timeout: Duration) -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// POST a JSON body, retrying connection failures with exponential backoff.
pub(crate) async fn post_json_with_retries<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    body: &T,
    provider: &str,
) -> AppResult<reqwest::Response> {
    let mut attempt = 0;

    loop {
        match client.post(url).json(body).send().await {
            Ok(response) => return check_status(response, provider).await,
            Err(e) if e.is_connect() => {
                attempt += 1;
                if attempt >= MAX_RETRIES {
                    return Err(AppError::ModelUnavailable(format!(
                        "{} not reachable at {}: {}",
                        provider, url, e
                    )));
                }

                let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt);
                warn!(
                    "{} connection failed (attempt {}/{}), retrying in {}ms",
                    provider, attempt, MAX_RETRIES, backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
            Err(e) if e.is_timeout() => {
                return Err(AppError::Generation(format!(
                    "{} request timed out: {}",
                    provider, e
                )));
            }
            Err(e) => {
                return Err(AppError::Generation(format!(
                    "Failed to send request to {}: {}",
                    provider, e
                )));
            }
        }
    }
}

/// GET a health endpoint and require a success status.
pub(crate) async fn check_endpoint(
    client: &reqwest::Client,
    url: &str,
    provider: &str,
) -> AppResult<()> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AppError::ModelUnavailable(format!("{} not reachable: {}", provider, e)))?;

    if !response.status().is_success() {
        return Err(AppError::ModelUnavailable(format!(
            "{} health check returned {}",
            provider,
            response.status()
        )));
    }

    Ok(())
}

async fn check_status(response: reqwest::Response, provider: &str) -> AppResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    let message = match serde_json::from_str::<ErrorResponse>(&error_text) {
        Ok(parsed) => parsed.error.message().to_string(),
        Err(_) => error_text,
    };

    if status == reqwest::StatusCode::SERVICE_UNAVAILABLE || status == reqwest::StatusCode::NOT_FOUND {
        return Err(AppError::ModelUnavailable(format!(
            "{} API error ({}): {}",
            provider, status, message
        )));
    }

    Err(AppError::Generation(format!(
        "{} API error ({}): {}",
        provider, status, message
    )))
}
