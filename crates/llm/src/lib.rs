//! Generator adapter for kbqa.
//!
//! Turns a question plus retrieved (question, answer) pairs into a generated
//! answer. The crate is split in two layers:
//! - [`LlmClient`]: provider-agnostic completion calls (Ollama, llama.cpp server)
//! - [`Generator`]: the narrow contract the retrieval pipeline consumes, which
//!   renders the prompt, enforces the token budget and filters invented links
//!
//! # Example
//! ```no_run
//! use kbqa_llm::{build_generator, ContextPair};
//! use kbqa_core::config::GeneratorSettings;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let Some(generator) = build_generator(&GeneratorSettings::default())? else {
//!     return Ok(());
//! };
//! let contexts = vec![ContextPair::new("Comment installer ?", "Téléchargez l'installateur.")];
//! let answer = generator.generate("Comment installer ?", &contexts, 400).await?;
//! println!("{}", answer);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod factory;
pub mod generator;
pub mod prompt;
pub mod providers;
pub mod types;

// Re-export main types
pub use client::{LlmClient, LlmRequest, LlmResponse, LlmUsage};
pub use factory::create_client;
pub use generator::{build_generator, render_contexts, ContextPair, Generator, LlmGenerator};
pub use providers::{LlamaCppClient, OllamaClient};
pub use types::{ProviderType, SamplingOptions};
