//! Prompt rendering for grounded answers.
//!
//! The prompt is a Handlebars template so deployments can reword the
//! instructions without touching code. The variables are `assistant_name`,
//! `language`, `context` and `question`.

use handlebars::Handlebars;
use kbqa_core::{AppError, AppResult};
use serde::Serialize;

const TEMPLATE_NAME: &str = "answer";

/// Default instruction template.
pub const DEFAULT_TEMPLATE: &str = r#"<s>[INST] You are {{assistant_name}}, a support assistant.

LANGUAGE
- Answer exclusively in {{language}}, even when the context is written in another language.

LINKS
- Only use a URL if it appears verbatim in the context below, copied character for character.
- Never invent, guess, shorten or complete a URL. If the context contains no URL, include no link.

INSTRUCTIONS
- Answer from the context only, completely and clearly.
- If the context does not answer the question, say so plainly.
- Never use more than one blank line in a row.

CONTEXT
{{context}}

QUESTION
{{question}}
[/INST]"#;

/// Variables available to the template.
#[derive(Debug, Serialize)]
pub struct PromptVars<'a> {
    pub assistant_name: &'a str,
    pub language: &'a str,
    pub context: &'a str,
    pub question: &'a str,
}

/// A compiled prompt template.
pub struct PromptTemplate {
    registry: Handlebars<'static>,
}

impl std::fmt::Debug for PromptTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptTemplate").finish_non_exhaustive()
    }
}

impl PromptTemplate {
    /// Compile `template`, or the default template when `None`.
    pub fn new(template: Option<&str>) -> AppResult<Self> {
        let mut registry = Handlebars::new();

        // Prompts are plain text.
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(true);

        registry
            .register_template_string(TEMPLATE_NAME, template.unwrap_or(DEFAULT_TEMPLATE))
            .map_err(|e| AppError::Config(format!("Failed to register prompt template: {}", e)))?;

        Ok(Self { registry })
    }

    /// Render the prompt.
    pub fn render(&self, vars: &PromptVars<'_>) -> AppResult<String> {
        self.registry
            .render(TEMPLATE_NAME, vars)
            .map_err(|e| AppError::Generation(format!("Failed to render prompt: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars<'a>(context: &'a str, question: &'a str) -> PromptVars<'a> {
        PromptVars {
            assistant_name: "Mila",
            language: "français",
            context,
            question,
        }
    }

    #[test]
    fn test_default_template_renders_all_variables() {
        let template = PromptTemplate::new(None).unwrap();
        let prompt = template
            .render(&vars("Q: Comment installer ?\nR: Via l'installateur.", "Comment installer ?"))
            .unwrap();

        assert!(prompt.contains("You are Mila"));
        assert!(prompt.contains("exclusively in français"));
        assert!(prompt.contains("R: Via l'installateur."));
        assert!(prompt.trim_end().ends_with("[/INST]"));
    }

    #[test]
    fn test_custom_template() {
        let template = PromptTemplate::new(Some("{{question}} | {{context}}")).unwrap();
        let prompt = template.render(&vars("ctx <b>", "q?")).unwrap();
        assert_eq!(prompt, "q? | ctx <b>");
    }

    #[test]
    fn test_unknown_variable_is_rejected() {
        let template = PromptTemplate::new(Some("{{missing}}")).unwrap();
        assert!(template.render(&vars("c", "q")).is_err());
    }

    #[test]
    fn test_invalid_template_is_config_error() {
        let err = PromptTemplate::new(Some("{{#if}}")).unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
