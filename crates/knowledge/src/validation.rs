//! Validation of user-supplied questions and feedback.

use crate::types::MIN_QUESTION_CHARS;
use kbqa_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Raw input longer than this is rejected before any cleanup.
pub const MAX_RAW_CHARS: usize = 5000;
pub const MAX_QUESTION_CHARS: usize = 500;
pub const MAX_COMMENT_CHARS: usize = 2000;
pub const MAX_SUGGESTION_CHARS: usize = 2000;

const MAX_URLS: usize = 3;
/// A run of identical characters this long counts as spam.
const MAX_REPEAT_RUN: usize = 11;
const SHOUTING_MIN_CHARS: usize = 20;

/// Problem categories a user can attach to feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackCategory {
    IncorrectAnswer,
    IncompleteAnswer,
    InappropriateTone,
    OutdatedAnswer,
    OffTopic,
    Other,
}

impl FeedbackCategory {
    pub const ALL: [FeedbackCategory; 6] = [
        Self::IncorrectAnswer,
        Self::IncompleteAnswer,
        Self::InappropriateTone,
        Self::OutdatedAnswer,
        Self::OffTopic,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncorrectAnswer => "incorrect_answer",
            Self::IncompleteAnswer => "incomplete_answer",
            Self::InappropriateTone => "inappropriate_tone",
            Self::OutdatedAnswer => "outdated_answer",
            Self::OffTopic => "off_topic",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                let allowed: Vec<&str> = Self::ALL.iter().map(|c| c.as_str()).collect();
                AppError::InvalidInput(format!(
                    "Invalid feedback category '{}'. Allowed: {}",
                    s,
                    allowed.join(", ")
                ))
            })
    }
}

/// Trim, bound and strip HTML tags from free text.
pub fn sanitize(text: &str) -> AppResult<String> {
    let trimmed = text.trim();
    let chars = trimmed.chars().count();
    if chars > MAX_RAW_CHARS {
        return Err(AppError::InvalidInput(format!(
            "Text exceeds the maximum length of {} characters",
            MAX_RAW_CHARS
        )));
    }
    Ok(strip_tags(trimmed))
}

/// Remove every `<...>` span containing at least one character.
fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('>') {
            Some(close) if close > 0 => rest = &after[close + 1..],
            _ => {
                out.push('<');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Basic spam heuristics: many links, long runs of one character, shouting.
pub fn is_spam(text: &str) -> bool {
    let urls = text.matches("http://").count() + text.matches("https://").count();
    if urls > MAX_URLS {
        return true;
    }

    let mut run = 0;
    let mut previous = None;
    for c in text.chars() {
        if Some(c) == previous {
            run += 1;
        } else {
            run = 1;
            previous = Some(c);
        }
        if run >= MAX_REPEAT_RUN {
            return true;
        }
    }

    let has_cased = text.chars().any(|c| c.is_lowercase() || c.is_uppercase());
    let shouting = has_cased && !text.chars().any(char::is_lowercase);
    shouting && text.chars().count() > SHOUTING_MIN_CHARS
}

/// Validate and clean a user question.
pub fn validate_question(question: &str) -> AppResult<String> {
    let question = sanitize(question)?;
    let chars = question.chars().count();

    if chars < MIN_QUESTION_CHARS {
        return Err(AppError::InvalidInput(format!(
            "Question must be at least {} characters",
            MIN_QUESTION_CHARS
        )));
    }
    if chars > MAX_QUESTION_CHARS {
        return Err(AppError::InvalidInput(format!(
            "Question must not exceed {} characters",
            MAX_QUESTION_CHARS
        )));
    }
    if is_spam(&question) {
        return Err(AppError::InvalidInput(
            "Question looks like spam".to_string(),
        ));
    }

    Ok(question)
}

/// Validate a feedback rating.
pub fn validate_rating(rating: i64) -> AppResult<u8> {
    if (1..=5).contains(&rating) {
        Ok(rating as u8)
    } else {
        Err(AppError::InvalidInput(format!(
            "Rating must be between 1 and 5, got {}",
            rating
        )))
    }
}

/// Clean an optional free-text field and bound its length. Blank becomes
/// `None`.
pub fn validate_optional_text(
    field: &str,
    text: Option<&str>,
    max_chars: usize,
) -> AppResult<Option<String>> {
    let Some(text) = text else {
        return Ok(None);
    };

    let cleaned = sanitize(text)?;
    let chars = cleaned.chars().count();
    if chars > max_chars {
        return Err(AppError::InvalidInput(format!(
            "{} exceeds the maximum length of {} characters (got {})",
            field, max_chars, chars
        )));
    }

    Ok(if cleaned.is_empty() { None } else { Some(cleaned) })
}
