//! Provider and sampling types.

use kbqa_core::config::GeneratorSettings;
use serde::{Deserialize, Serialize};

/// Supported completion backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    /// Ollama HTTP API (`/api/generate`)
    Ollama,
    /// llama.cpp server serving a GGUF model (`/completion`)
    LlamaCpp,
    /// No generator; answers degrade to retrieved context
    Disabled,
}

impl ProviderType {
    /// Parse provider type from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "llamacpp" | "llama.cpp" | "gguf" => Some(Self::LlamaCpp),
            "none" | "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }

    /// Get the canonical provider name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::LlamaCpp => "llamacpp",
            Self::Disabled => "none",
        }
    }

    /// Default base URL for the provider.
    pub fn default_endpoint(&self) -> Option<&'static str> {
        match self {
            Self::Ollama => Some("http://localhost:11434"),
            Self::LlamaCpp => Some("http://localhost:8081"),
            Self::Disabled => None,
        }
    }
}

/// Sampling parameters shared by all providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,

    /// Context window the provider should allocate
    pub num_ctx: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self::from(&GeneratorSettings::default())
    }
}

impl From<&GeneratorSettings> for SamplingOptions {
    fn from(settings: &GeneratorSettings) -> Self {
        Self {
            temperature: settings.temperature,
            top_p: settings.top_p,
            top_k: settings.top_k,
            repeat_penalty: settings.repeat_penalty,
            num_ctx: settings.context_window,
            stop: settings.stop.clone(),
        }
    }
}
