//! Grounded answer generation.
//!
//! [`Generator`] is the contract the retrieval pipeline depends on:
//! `(query, contexts, max_tokens) -> text`. [`LlmGenerator`] implements it on
//! top of any [`LlmClient`]:
//! 1. Renders the prompt with as many contexts as fit the context window
//! 2. Calls the client with the configured sampling settings
//! 3. Removes every link that does not appear verbatim in the contexts

use crate::client::{LlmClient, LlmRequest};
use crate::factory::create_client;
use crate::prompt::{PromptTemplate, PromptVars};
use crate::types::SamplingOptions;
use kbqa_core::config::GeneratorSettings;
use kbqa_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Rough characters-per-token ratio used for budget estimates.
const CHARS_PER_TOKEN: usize = 4;

/// A retrieved (question, answer) pair handed to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPair {
    pub question: String,
    pub answer: String,
}

impl ContextPair {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }

    /// Render as a `Q:`/`R:` block.
    pub fn render(&self) -> String {
        format!("Q: {}\nR: {}", self.question, self.answer)
    }
}

/// Render contexts as blocks separated by a blank line.
pub fn render_contexts(contexts: &[ContextPair]) -> String {
    contexts
        .iter()
        .map(ContextPair::render)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Produces an answer grounded in retrieved contexts.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    /// Backend name for logs and health output.
    fn name(&self) -> &str;

    /// Generate an answer to `query` from `contexts`, producing at most
    /// `max_tokens` tokens.
    async fn generate(
        &self,
        query: &str,
        contexts: &[ContextPair],
        max_tokens: u32,
    ) -> AppResult<String>;

    /// Check that the backend can serve requests.
    async fn health(&self) -> AppResult<()>;
}

/// Build the configured generator, or `None` when generation is disabled.
pub fn build_generator(settings: &GeneratorSettings) -> AppResult<Option<Arc<dyn Generator>>> {
    let client = create_client(
        &settings.provider,
        settings.endpoint.as_deref(),
        Duration::from_secs(settings.timeout_secs),
    )?;

    match client {
        Some(client) => Ok(Some(Arc::new(LlmGenerator::new(client, settings)?))),
        None => Ok(None),
    }
}

/// Generator backed by an [`LlmClient`].
pub struct LlmGenerator {
    client: Arc<dyn LlmClient>,
    model: String,
    sampling: SamplingOptions,
    template: PromptTemplate,
    assistant_name: String,
    language: String,
    context_window: u32,
}

impl LlmGenerator {
    pub fn new(client: Arc<dyn LlmClient>, settings: &GeneratorSettings) -> AppResult<Self> {
        Ok(Self {
            client,
            model: settings.model.clone(),
            sampling: SamplingOptions::from(settings),
            template: PromptTemplate::new(settings.prompt_template.as_deref())?,
            assistant_name: settings.assistant_name.clone(),
            language: settings.language.clone(),
            context_window: settings.context_window,
        })
    }

    fn render(&self, query: &str, contexts: &[ContextPair]) -> AppResult<String> {
        let context = render_contexts(contexts);
        self.template.render(&PromptVars {
            assistant_name: &self.assistant_name,
            language: &self.language,
            context: &context,
            question: query,
        })
    }

    /// Render the prompt with as many leading contexts as fit
    /// `context_window - max_tokens`. Returns the prompt and the number of
    /// contexts kept.
    ///
    /// The prompt never goes out without context: when even the first
    /// context cannot fit, this fails with [`AppError::Generation`].
    fn fit_prompt(
        &self,
        query: &str,
        contexts: &[ContextPair],
        max_tokens: u32,
    ) -> AppResult<(String, usize)> {
        let budget = self.context_window.saturating_sub(max_tokens) as usize;
        let mut kept: Vec<ContextPair> = contexts.to_vec();

        loop {
            let prompt = self.render(query, &kept)?;
            let estimate = estimate_tokens(&prompt);
            if estimate <= budget {
                return Ok((prompt, kept.len()));
            }

            if kept.len() > 1 {
                kept.pop();
                continue;
            }

            // A single context that is still too long gets its answer cut.
            let Some(only) = kept.first_mut() else {
                return Err(AppError::Generation(format!(
                    "Question alone exceeds the context window ({} > {} tokens)",
                    estimate, budget
                )));
            };

            let overflow_chars = (estimate - budget) * CHARS_PER_TOKEN;
            let answer_chars = only.answer.chars().count();
            if overflow_chars >= answer_chars {
                return Err(AppError::Generation(format!(
                    "Best context does not fit the context window ({} > {} tokens)",
                    estimate, budget
                )));
            }
            only.answer = only.answer.chars().take(answer_chars - overflow_chars).collect();
        }
    }
}

#[async_trait::async_trait]
impl Generator for LlmGenerator {
    fn name(&self) -> &str {
        self.client.provider_name()
    }

    async fn generate(
        &self,
        query: &str,
        contexts: &[ContextPair],
        max_tokens: u32,
    ) -> AppResult<String> {
        let (prompt, used) = self.fit_prompt(query, contexts, max_tokens)?;
        if used < contexts.len() {
            tracing::debug!(
                kept = used,
                dropped = contexts.len() - used,
                "Trimmed contexts to fit the context window"
            );
        }

        let request = LlmRequest::new(prompt, &self.model)
            .with_max_tokens(max_tokens)
            .with_sampling(self.sampling.clone());

        let response = self.client.complete(&request).await?;

        let allowed = collect_urls(&render_contexts(contexts));
        let cleaned = tidy_output(&strip_unknown_urls(&response.content, &allowed));

        if cleaned.is_empty() {
            return Err(AppError::Generation(
                "Model returned an empty answer".to_string(),
            ));
        }

        tracing::debug!(
            completion_tokens = response.usage.completion_tokens,
            answer_len = cleaned.len(),
            "Generated answer"
        );

        Ok(cleaned)
    }

    async fn health(&self) -> AppResult<()> {
        self.client.health().await
    }
}

/// Estimated token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn find_url_start(text: &str) -> Option<usize> {
    [text.find("https://"), text.find("http://")]
        .into_iter()
        .flatten()
        .min()
}

/// Byte length of the URL at the start of `text`.
fn url_len(text: &str) -> usize {
    let end = text
        .find(|c: char| c.is_whitespace() || matches!(c, ')' | ']' | '>' | '<' | '"' | '\''))
        .unwrap_or(text.len());
    text[..end]
        .trim_end_matches(['.', ',', ';', ':', '!', '?'])
        .len()
}

/// Every URL mentioned in `text`.
pub fn collect_urls(text: &str) -> HashSet<String> {
    let mut urls = HashSet::new();
    let mut rest = text;
    while let Some(start) = find_url_start(rest) {
        let tail = &rest[start..];
        let len = url_len(tail).max(1);
        urls.insert(tail[..len].to_string());
        rest = &tail[len..];
    }
    urls
}

/// Remove URLs that are not in `allowed`.
///
/// Markdown links to unknown URLs keep their label; bare unknown URLs are
/// dropped.
pub fn strip_unknown_urls(text: &str, allowed: &HashSet<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = find_url_start(rest) {
        let (before, tail) = rest.split_at(start);
        let len = url_len(tail).max(1);
        let url = &tail[..len];
        let after = &tail[len..];

        if allowed.contains(url) {
            out.push_str(before);
            out.push_str(url);
        } else if before.ends_with("](") && after.starts_with(')') {
            let link_open = &before[..before.len() - 2];
            match link_open.rfind('[') {
                Some(i) => {
                    out.push_str(&link_open[..i]);
                    out.push_str(&link_open[i + 1..]);
                }
                None => out.push_str(link_open),
            }
            rest = &after[1..];
            tracing::warn!(url = %url, "Removed link absent from context");
            continue;
        } else {
            if before.ends_with(' ') && after.starts_with(' ') {
                out.push_str(&before[..before.len() - 1]);
            } else {
                out.push_str(before);
            }
            tracing::warn!(url = %url, "Removed link absent from context");
        }

        rest = after;
    }

    out.push_str(rest);
    out
}

/// Trim and collapse runs of blank lines.
fn tidy_output(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;

    for line in text.trim().lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{LlmResponse, LlmUsage};
    use std::sync::Mutex;

    /// Client that returns a canned completion and records prompts.
    struct ScriptedClient {
        reply: String,
        prompts: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedClient {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for ScriptedClient {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &LlmRequest) -> AppResult<LlmResponse> {
            self.prompts.lock().unwrap().push(request.clone());
            Ok(LlmResponse {
                content: self.reply.clone(),
                model: request.model.clone(),
                usage: LlmUsage::new(10, 5),
            })
        }

        async fn health(&self) -> AppResult<()> {
            Ok(())
        }
    }

    fn contexts() -> Vec<ContextPair> {
        vec![
            ContextPair::new(
                "Comment créer un compte ?",
                "Inscrivez-vous sur https://dashboard.example.com/signup.",
            ),
            ContextPair::new("Comment installer ?", "Téléchargez l'installateur."),
        ]
    }

    #[test]
    fn test_render_contexts() {
        let rendered = render_contexts(&contexts());
        assert!(rendered.starts_with("Q: Comment créer un compte ?\nR: Inscrivez-vous"));
        assert!(rendered.contains("\n\nQ: Comment installer ?"));
    }

    #[test]
    fn test_collect_urls_trims_punctuation() {
        let urls = collect_urls("Voir https://a.example.com/x. Et (http://b.example.org).");
        assert!(urls.contains("https://a.example.com/x"));
        assert!(urls.contains("http://b.example.org"));
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn test_strip_unknown_urls() {
        let allowed = collect_urls("https://dashboard.example.com/signup");

        let text = "Inscrivez-vous [ici](https://dashboard.example.com/signup) ou [là](https://invented.io/) puis visitez https://fake.example.net pour plus.";
        let cleaned = strip_unknown_urls(text, &allowed);

        assert_eq!(
            cleaned,
            "Inscrivez-vous [ici](https://dashboard.example.com/signup) ou là puis visitez pour plus."
        );
    }

    #[test]
    fn test_shortened_url_is_not_allowed() {
        let allowed = collect_urls("https://dashboard.example.com/signup");
        let cleaned = strip_unknown_urls("Allez sur https://dashboard.example.com", &allowed);
        assert_eq!(cleaned, "Allez sur ");
    }

    #[test]
    fn test_tidy_output_collapses_blank_lines() {
        assert_eq!(tidy_output("  a\n\n\n\nb  \n"), "a\n\nb");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn test_generate_filters_links() {
        let client = ScriptedClient::new("Voir https://invented.io/help\n\n\n\nMerci.");
        let generator = LlmGenerator::new(client.clone(), &GeneratorSettings::default()).unwrap();

        let answer = generator
            .generate("Comment créer un compte ?", &contexts(), 200)
            .await
            .unwrap();

        assert_eq!(answer, "Voir\n\nMerci.");
        let requests = client.prompts.lock().unwrap();
        assert_eq!(requests[0].max_tokens, Some(200));
        assert!(requests[0].prompt.contains("R: Téléchargez l'installateur."));
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_completion() {
        let client = ScriptedClient::new("   \n ");
        let generator = LlmGenerator::new(client, &GeneratorSettings::default()).unwrap();

        let err = generator
            .generate("Question ?", &contexts(), 100)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "generation_failure");
    }

    #[test]
    fn test_fit_prompt_drops_trailing_contexts() {
        let settings = GeneratorSettings {
            context_window: 600,
            max_tokens: 100,
            ..GeneratorSettings::default()
        };
        let generator = LlmGenerator::new(ScriptedClient::new("ok"), &settings).unwrap();

        let long_answer = "mot ".repeat(600);
        let contexts = vec![
            ContextPair::new("Première ?", "Courte réponse."),
            ContextPair::new("Deuxième ?", long_answer.clone()),
            ContextPair::new("Troisième ?", long_answer),
        ];

        let (prompt, used) = generator.fit_prompt("Question ?", &contexts, 100).unwrap();
        assert_eq!(used, 1);
        assert!(prompt.contains("Première ?"));
        assert!(estimate_tokens(&prompt) <= 500);
    }

    #[test]
    fn test_fit_prompt_truncates_single_oversized_context() {
        let settings = GeneratorSettings {
            context_window: 500,
            max_tokens: 100,
            ..GeneratorSettings::default()
        };
        let generator = LlmGenerator::new(ScriptedClient::new("ok"), &settings).unwrap();

        let contexts = vec![ContextPair::new("Seule ?", "x".repeat(5000))];
        let (prompt, used) = generator.fit_prompt("Question ?", &contexts, 100).unwrap();

        assert_eq!(used, 1);
        assert!(estimate_tokens(&prompt) <= 400);
    }

    #[tokio::test]
    async fn test_context_that_cannot_fit_fails_generation() {
        let settings = GeneratorSettings {
            context_window: 500,
            max_tokens: 100,
            ..GeneratorSettings::default()
        };
        let client = ScriptedClient::new("ok");
        let generator = LlmGenerator::new(client.clone(), &settings).unwrap();

        let contexts = vec![ContextPair::new("Longue ? ".repeat(400), "Oui.")];
        let err = generator.fit_prompt("Question ?", &contexts, 100).unwrap_err();
        assert_eq!(err.kind(), "generation_failure");

        let err = generator
            .generate("Question ?", &contexts, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Generation(_)));
        assert!(client.prompts.lock().unwrap().is_empty());
    }
}
