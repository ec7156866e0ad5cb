//! Knowledge base type definitions.

use chrono::{DateTime, Utc};
use kbqa_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Minimum length of a question, in characters.
pub const MIN_QUESTION_CHARS: usize = 3;

/// A question/answer pair in the knowledge store.
///
/// Entries are never physically removed; deactivation keeps conversation
/// history referencing them valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// Stable identifier assigned by the store
    pub id: i64,

    /// Category label (e.g. "installation", "billing")
    pub category: String,

    pub question: String,
    pub answer: String,

    /// Optional free-form context tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Inactive entries are excluded from the index
    pub active: bool,

    /// Slot of this entry in the last index built from the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_slot: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    /// Check the entry invariants.
    pub fn validate(&self) -> AppResult<()> {
        validate_fields(&self.category, &self.question)
            .map_err(|e| AppError::InvalidInput(format!("Entry {}: {}", self.id, e)))
    }

    /// Text embedded for this entry: question and answer together.
    pub fn embedding_text(&self) -> String {
        format!("{} {}", self.question, self.answer)
    }
}

/// Fields of an entry to create or replace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub category: String,
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub context: Option<String>,
}

impl NewEntry {
    pub fn new(
        category: impl Into<String>,
        question: impl Into<String>,
        answer: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            question: question.into(),
            answer: answer.into(),
            context: None,
        }
    }

    /// Check the entry invariants.
    pub fn validate(&self) -> AppResult<()> {
        validate_fields(&self.category, &self.question).map_err(AppError::InvalidInput)
    }
}

fn validate_fields(category: &str, question: &str) -> Result<(), String> {
    if category.trim().is_empty() {
        return Err("category must not be empty".to_string());
    }

    let question_chars = question.trim().chars().count();
    if question_chars < MIN_QUESTION_CHARS {
        return Err(format!(
            "question must be at least {} characters, got {}",
            MIN_QUESTION_CHARS, question_chars
        ));
    }

    Ok(())
}

/// Aggregate counts over the knowledge store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_entries: u64,
    pub active_entries: u64,

    /// Active entries with an embedding slot
    pub indexed_entries: u64,

    pub conversations: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Time spent in each stage of one query, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyBreakdown {
    pub embedding_ms: u64,
    pub search_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(category: &str, question: &str) -> KnowledgeEntry {
        let now = Utc::now();
        KnowledgeEntry {
            id: 7,
            category: category.to_string(),
            question: question.to_string(),
            answer: "Réponse".to_string(),
            context: None,
            active: true,
            embedding_slot: None,
            created_at: now,
            modified_at: now,
        }
    }

    #[test]
    fn test_valid_entry() {
        assert!(entry("installation", "Comment installer AI_licia ?").validate().is_ok());
    }

    #[test]
    fn test_short_question_rejected() {
        let err = entry("installation", " ok ").validate().unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(err.to_string().contains("Entry 7"));
    }

    #[test]
    fn test_empty_category_rejected() {
        assert!(NewEntry::new("  ", "Question valide ?", "R").validate().is_err());
    }

    #[test]
    fn test_embedding_text_joins_question_and_answer() {
        assert_eq!(entry("c", "Quoi ?").embedding_text(), "Quoi ? Réponse");
    }
}
