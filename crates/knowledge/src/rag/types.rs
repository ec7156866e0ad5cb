//! Retrieval response types.

use crate::types::LatencyBreakdown;
use serde::{Deserialize, Serialize};

/// A knowledge entry that contributed to an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: i64,
    pub question: String,
    /// Start of the entry's answer
    pub excerpt: String,
    /// Confidence of this hit in [0, 1]
    pub confidence: f32,
}

/// Outcome of one query.
///
/// `matched == false` is the no-match outcome: the answer is the configured
/// fallback text, `sources` is empty and no generation was attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Id of the persisted conversation; `None` when recording failed
    pub conversation_id: Option<i64>,
    pub answer: String,
    /// Confidence of the best hit in [0, 1]
    pub confidence: f32,
    pub matched: bool,
    /// Generation was skipped or failed and the answer is the retrieved
    /// context verbatim
    pub degraded: bool,
    pub sources: Vec<SourceRef>,
    pub latency: LatencyBreakdown,
}

impl Answer {
    pub fn source_ids(&self) -> Vec<i64> {
        self.sources.iter().map(|s| s.id).collect()
    }
}

/// Map a raw inner product in [-1, 1] to a confidence in [0, 1].
pub fn confidence_from_score(score: f32) -> f32 {
    ((score + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Cut `text` to at most `max_chars` characters, at a word boundary when
/// there is one, and mark the cut with `...`.
pub fn truncate_snippet(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return text.to_string();
    };

    let truncated = &text[..cut];
    match truncated.rfind(char::is_whitespace) {
        Some(space) if space > 0 => format!("{}...", truncated[..space].trim_end()),
        _ => format!("{}...", truncated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_is_bounded_and_monotonic() {
        assert_eq!(confidence_from_score(-1.0), 0.0);
        assert_eq!(confidence_from_score(1.0), 1.0);
        assert_eq!(confidence_from_score(0.0), 0.5);
        assert_eq!(confidence_from_score(1.5), 1.0);
        assert_eq!(confidence_from_score(-3.0), 0.0);

        let mut previous = 0.0;
        for step in 0..=200 {
            let score = -1.0 + step as f32 * 0.01;
            let confidence = confidence_from_score(score);
            assert!((0.0..=1.0).contains(&confidence));
            assert!(confidence >= previous);
            previous = confidence;
        }
    }

    #[test]
    fn test_truncate_snippet() {
        assert_eq!(truncate_snippet("Réponse courte", 100), "Réponse courte");
        assert_eq!(
            truncate_snippet("Ouvrez les paramètres audio puis choisissez", 20),
            "Ouvrez les..."
        );
        assert_eq!(truncate_snippet("Téléchargement", 5), "Téléc...");
        assert_eq!(truncate_snippet("éééééé", 6), "éééééé");
    }

    #[test]
    fn test_source_ids_keep_rank_order() {
        let answer = Answer {
            conversation_id: None,
            answer: String::new(),
            confidence: 0.9,
            matched: true,
            degraded: false,
            sources: vec![
                SourceRef {
                    id: 7,
                    question: "q".to_string(),
                    excerpt: "a".to_string(),
                    confidence: 0.9,
                },
                SourceRef {
                    id: 2,
                    question: "q".to_string(),
                    excerpt: "a".to_string(),
                    confidence: 0.8,
                },
            ],
            latency: LatencyBreakdown::default(),
        };
        assert_eq!(answer.source_ids(), vec![7, 2]);
    }
}
