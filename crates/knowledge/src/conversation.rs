//! Conversation log: one record per answered query, plus user feedback.

use crate::index::{format_time, parse_time};
use crate::store::{open_database, store_err};
use crate::types::LatencyBreakdown;
use crate::validation::FeedbackCategory;
use chrono::{DateTime, Duration, Utc};
use kbqa_core::{AppError, AppResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// A query outcome to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConversation {
    pub session_id: String,
    pub question: String,
    pub answer: String,
    pub confidence: f32,
    pub source_ids: Vec<i64>,
    pub matched: bool,
    pub degraded: bool,
    pub latency: LatencyBreakdown,
}

/// User feedback on one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub conversation_id: i64,
    /// 1 to 5
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
    /// Better answer proposed by the user
    #[serde(default)]
    pub suggested_answer: Option<String>,
    #[serde(default)]
    pub category: Option<FeedbackCategory>,
}

/// A persisted conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub id: i64,
    #[serde(flatten)]
    pub record: NewConversation,
    pub created_at: DateTime<Utc>,
    pub feedback: Option<Feedback>,
    pub feedback_at: Option<DateTime<Utc>>,
}

/// Window of the usage metrics, ending now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricsPeriod {
    #[serde(rename = "1h")]
    Hour,
    #[default]
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl MetricsPeriod {
    pub const ALL: [MetricsPeriod; 4] = [Self::Hour, Self::Day, Self::Week, Self::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "1h",
            Self::Day => "24h",
            Self::Week => "7d",
            Self::Month => "30d",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                AppError::InvalidInput(format!(
                    "Invalid period '{}'. Allowed: 1h, 24h, 7d, 30d",
                    s
                ))
            })
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::hours(24),
            Self::Week => Duration::days(7),
            Self::Month => Duration::days(30),
        }
    }
}

/// Service usage over a [`MetricsPeriod`]. Conversations count by creation
/// time, feedback by the time it was given.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageMetrics {
    pub period: MetricsPeriod,
    pub since: DateTime<Utc>,
    pub conversations: u64,
    pub matched_rate: f64,
    pub degraded_rate: f64,
    pub avg_latency_ms: f64,
    pub avg_generation_ms: f64,
    pub feedback_count: u64,
    /// Mean rating; `None` without feedback in the period
    pub avg_satisfaction: Option<f64>,
    /// Ratings 1 to 5, every rating present
    pub rating_distribution: BTreeMap<u8, u64>,
}

impl UsageMetrics {
    fn new(period: MetricsPeriod, since: DateTime<Utc>) -> Self {
        Self {
            period,
            since,
            conversations: 0,
            matched_rate: 0.0,
            degraded_rate: 0.0,
            avg_latency_ms: 0.0,
            avg_generation_ms: 0.0,
            feedback_count: 0,
            avg_satisfaction: None,
            rating_distribution: (1..=5).map(|r| (r, 0)).collect(),
        }
    }

    /// Fold `(total_ms, generation_ms, matched, degraded)` rows.
    fn add_conversations(&mut self, rows: impl IntoIterator<Item = (u64, u64, bool, bool)>) {
        let (mut total, mut generation, mut matched, mut degraded) = (0u64, 0u64, 0u64, 0u64);
        for (total_ms, generation_ms, is_matched, is_degraded) in rows {
            self.conversations += 1;
            total += total_ms;
            generation += generation_ms;
            matched += is_matched as u64;
            degraded += is_degraded as u64;
        }
        if self.conversations > 0 {
            let n = self.conversations as f64;
            self.avg_latency_ms = total as f64 / n;
            self.avg_generation_ms = generation as f64 / n;
            self.matched_rate = matched as f64 / n;
            self.degraded_rate = degraded as f64 / n;
        }
    }

    fn add_ratings(&mut self, ratings: impl IntoIterator<Item = u8>) {
        let mut sum = 0u64;
        for rating in ratings {
            self.feedback_count += 1;
            sum += rating as u64;
            *self.rating_distribution.entry(rating).or_insert(0) += 1;
        }
        if self.feedback_count > 0 {
            self.avg_satisfaction = Some(sum as f64 / self.feedback_count as f64);
        }
    }
}

/// Selects feedback by rating range and category. Empty fields match all.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeedbackFilter {
    #[serde(default)]
    pub min_rating: Option<u8>,
    #[serde(default)]
    pub max_rating: Option<u8>,
    #[serde(default)]
    pub category: Option<FeedbackCategory>,
}

impl FeedbackFilter {
    /// Inclusive rating bounds, checked.
    pub fn rating_range(&self) -> AppResult<(u8, u8)> {
        let min = self.min_rating.unwrap_or(1);
        let max = self.max_rating.unwrap_or(5);
        if !(1..=5).contains(&min) || !(1..=5).contains(&max) || min > max {
            return Err(AppError::InvalidInput(format!(
                "Invalid rating range {}..{}: bounds must satisfy 1 <= min <= max <= 5",
                min, max
            )));
        }
        Ok((min, max))
    }

    pub fn matches(&self, feedback: &Feedback) -> bool {
        let (min, max) = self.rating_range().unwrap_or((1, 5));
        (min..=max).contains(&feedback.rating)
            && self.category.map_or(true, |c| feedback.category == Some(c))
    }
}

/// Aggregate view of the feedback selected by a [`FeedbackFilter`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackStats {
    pub total: u64,
    pub average_rating: Option<f64>,
    pub min_rating: Option<u8>,
    pub max_rating: Option<u8>,
    /// Ratings of 4 and 5
    pub positive: u64,
    pub neutral: u64,
    /// Ratings of 1 and 2
    pub negative: u64,
    pub by_rating: BTreeMap<u8, u64>,
    /// Feedback without a category is not listed
    pub by_category: BTreeMap<String, u64>,
}

impl FeedbackStats {
    fn collect(feedback: impl IntoIterator<Item = (u8, Option<FeedbackCategory>)>) -> Self {
        let mut stats = Self {
            total: 0,
            average_rating: None,
            min_rating: None,
            max_rating: None,
            positive: 0,
            neutral: 0,
            negative: 0,
            by_rating: (1..=5).map(|r| (r, 0)).collect(),
            by_category: BTreeMap::new(),
        };

        let mut sum = 0u64;
        for (rating, category) in feedback {
            stats.total += 1;
            sum += rating as u64;
            stats.min_rating = Some(stats.min_rating.map_or(rating, |m| m.min(rating)));
            stats.max_rating = Some(stats.max_rating.map_or(rating, |m| m.max(rating)));
            match rating {
                4.. => stats.positive += 1,
                3 => stats.neutral += 1,
                _ => stats.negative += 1,
            }
            *stats.by_rating.entry(rating).or_insert(0) += 1;
            if let Some(category) = category {
                *stats
                    .by_category
                    .entry(category.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }
        if stats.total > 0 {
            stats.average_rating = Some(sum as f64 / stats.total as f64);
        }
        stats
    }
}

#[async_trait::async_trait]
pub trait ConversationLog: Send + Sync {
    /// Persist a conversation and return its id.
    async fn record(&self, conversation: NewConversation) -> AppResult<i64>;

    /// Attach feedback, replacing any earlier feedback. Fails with
    /// `NotFound` for unknown conversations.
    async fn add_feedback(&self, feedback: Feedback) -> AppResult<()>;

    async fn get(&self, id: i64) -> AppResult<Option<Conversation>>;

    async fn usage_metrics(&self, period: MetricsPeriod) -> AppResult<UsageMetrics>;

    async fn feedback_stats(&self, filter: &FeedbackFilter) -> AppResult<FeedbackStats>;

    /// Conversations with feedback matching `filter`, most recent feedback
    /// first.
    async fn list_feedback(
        &self,
        filter: &FeedbackFilter,
        limit: usize,
        offset: usize,
    ) -> AppResult<Vec<Conversation>>;
}

/// Conversation log in the knowledge database.
pub struct SqliteConversationLog {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteConversationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConversationLog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteConversationLog {
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let conn = open_database(&path)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl ConversationLog for SqliteConversationLog {
    async fn record(&self, c: NewConversation) -> AppResult<i64> {
        let source_ids = serde_json::to_string(&c.source_ids)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO conversations (session_id, question, answer, confidence, source_ids,
                matched, degraded, embedding_ms, search_ms, generation_ms, total_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                c.session_id,
                c.question,
                c.answer,
                c.confidence as f64,
                source_ids,
                c.matched,
                c.degraded,
                c.latency.embedding_ms as i64,
                c.latency.search_ms as i64,
                c.latency.generation_ms as i64,
                c.latency.total_ms as i64,
                format_time(Utc::now()),
            ],
        )
        .map_err(store_err)?;

        let id = conn.last_insert_rowid();
        tracing::debug!(conversation_id = id, session_id = %c.session_id, "Recorded conversation");
        Ok(id)
    }

    async fn add_feedback(&self, feedback: Feedback) -> AppResult<()> {
        let changed = self
            .conn()
            .execute(
                "UPDATE conversations SET feedback_rating = ?1, feedback_comment = ?2,
                    feedback_suggestion = ?3, feedback_category = ?4, feedback_at = ?5
                 WHERE id = ?6",
                params![
                    feedback.rating,
                    feedback.comment,
                    feedback.suggested_answer,
                    feedback.category.map(|c| c.as_str()),
                    format_time(Utc::now()),
                    feedback.conversation_id,
                ],
            )
            .map_err(store_err)?;

        if changed == 0 {
            return Err(AppError::NotFound(format!(
                "Conversation {} not found",
                feedback.conversation_id
            )));
        }

        tracing::info!(
            conversation_id = feedback.conversation_id,
            rating = feedback.rating,
            "Recorded feedback"
        );
        Ok(())
    }

    async fn get(&self, id: i64) -> AppResult<Option<Conversation>> {
        self.conn()
            .query_row(
                "SELECT id, session_id, question, answer, confidence, source_ids, matched,
                    degraded, embedding_ms, search_ms, generation_ms, total_ms, created_at,
                    feedback_rating, feedback_comment, feedback_suggestion, feedback_category,
                    feedback_at
                 FROM conversations WHERE id = ?1",
                [id],
                row_to_conversation,
            )
            .optional()
            .map_err(store_err)?
            .transpose()
    }

    async fn usage_metrics(&self, period: MetricsPeriod) -> AppResult<UsageMetrics> {
        let since = Utc::now() - period.duration();
        let since_text = format_time(since);
        let mut metrics = UsageMetrics::new(period, since);
        let conn = self.conn();

        let mut stmt = conn
            .prepare(
                "SELECT total_ms, generation_ms, matched, degraded
                 FROM conversations WHERE created_at >= ?1",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([&since_text], |row| {
                Ok((
                    row.get::<_, i64>(0)?.max(0) as u64,
                    row.get::<_, i64>(1)?.max(0) as u64,
                    row.get::<_, bool>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            })
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        metrics.add_conversations(rows);

        let mut stmt = conn
            .prepare(
                "SELECT feedback_rating FROM conversations
                 WHERE feedback_rating IS NOT NULL AND feedback_at >= ?1",
            )
            .map_err(store_err)?;
        let ratings = stmt
            .query_map([&since_text], |row| row.get::<_, i64>(0))
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        metrics.add_ratings(ratings.into_iter().map(|r| r.clamp(0, u8::MAX as i64) as u8));

        tracing::debug!(
            period = period.as_str(),
            conversations = metrics.conversations,
            feedback = metrics.feedback_count,
            "Computed usage metrics"
        );
        Ok(metrics)
    }

    async fn feedback_stats(&self, filter: &FeedbackFilter) -> AppResult<FeedbackStats> {
        let (min, max) = filter.rating_range()?;
        let category = filter.category.map(|c| c.as_str());
        let conn = self.conn();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT feedback_rating, feedback_category FROM conversations WHERE {}",
                FEEDBACK_WHERE
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![min, max, category], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;

        let feedback = rows
            .into_iter()
            .map(|(rating, category)| {
                let category = category.as_deref().map(FeedbackCategory::parse).transpose()?;
                Ok((rating.clamp(0, u8::MAX as i64) as u8, category))
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(FeedbackStats::collect(feedback))
    }

    async fn list_feedback(
        &self,
        filter: &FeedbackFilter,
        limit: usize,
        offset: usize,
    ) -> AppResult<Vec<Conversation>> {
        let (min, max) = filter.rating_range()?;
        let category = filter.category.map(|c| c.as_str());
        let conn = self.conn();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, session_id, question, answer, confidence, source_ids, matched,
                    degraded, embedding_ms, search_ms, generation_ms, total_ms, created_at,
                    feedback_rating, feedback_comment, feedback_suggestion, feedback_category,
                    feedback_at
                 FROM conversations WHERE {}
                 ORDER BY feedback_at DESC, id DESC
                 LIMIT ?4 OFFSET ?5",
                FEEDBACK_WHERE
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(
                params![min, max, category, limit as i64, offset as i64],
                row_to_conversation,
            )
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        rows.into_iter().collect()
    }
}

const FEEDBACK_WHERE: &str = "feedback_rating IS NOT NULL
    AND feedback_rating BETWEEN ?1 AND ?2
    AND (?3 IS NULL OR feedback_category = ?3)";

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<AppResult<Conversation>> {
    let id: i64 = row.get(0)?;
    let source_ids: String = row.get(5)?;
    let created_at: String = row.get(12)?;
    let rating: Option<i64> = row.get(13)?;
    let category: Option<String> = row.get(16)?;
    let feedback_at: Option<String> = row.get(17)?;

    let record = NewConversation {
        session_id: row.get(1)?,
        question: row.get(2)?,
        answer: row.get(3)?,
        confidence: row.get::<_, f64>(4)? as f32,
        source_ids: Vec::new(),
        matched: row.get(6)?,
        degraded: row.get(7)?,
        latency: LatencyBreakdown {
            embedding_ms: row.get::<_, i64>(8)?.max(0) as u64,
            search_ms: row.get::<_, i64>(9)?.max(0) as u64,
            generation_ms: row.get::<_, i64>(10)?.max(0) as u64,
            total_ms: row.get::<_, i64>(11)?.max(0) as u64,
        },
    };
    let comment: Option<String> = row.get(14)?;
    let suggested_answer: Option<String> = row.get(15)?;

    let build = move || -> AppResult<Conversation> {
        let feedback = match rating {
            Some(rating) => Some(Feedback {
                conversation_id: id,
                rating: rating.clamp(0, u8::MAX as i64) as u8,
                comment,
                suggested_answer,
                category: category.as_deref().map(FeedbackCategory::parse).transpose()?,
            }),
            None => None,
        };

        Ok(Conversation {
            id,
            record: NewConversation {
                source_ids: serde_json::from_str(&source_ids)?,
                ..record
            },
            created_at: parse_time(&created_at)?,
            feedback,
            feedback_at: feedback_at.as_deref().map(parse_time).transpose()?,
        })
    };

    Ok(build())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory log that can be told to fail.
    #[derive(Default)]
    pub struct MemoryConversationLog {
        pub records: Mutex<Vec<NewConversation>>,
        pub feedback: Mutex<Vec<Feedback>>,
        pub failing: AtomicBool,
    }

    impl MemoryConversationLog {
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl ConversationLog for MemoryConversationLog {
        async fn record(&self, conversation: NewConversation) -> AppResult<i64> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(AppError::Store("log unavailable".to_string()));
            }
            let mut records = self.records.lock().unwrap();
            records.push(conversation);
            Ok(records.len() as i64)
        }

        async fn add_feedback(&self, feedback: Feedback) -> AppResult<()> {
            let known = feedback.conversation_id >= 1
                && feedback.conversation_id <= self.records.lock().unwrap().len() as i64;
            if !known {
                return Err(AppError::NotFound(format!(
                    "Conversation {} not found",
                    feedback.conversation_id
                )));
            }
            self.feedback.lock().unwrap().push(feedback);
            Ok(())
        }

        async fn get(&self, id: i64) -> AppResult<Option<Conversation>> {
            Ok(self.conversations().into_iter().find(|c| c.id == id))
        }

        async fn usage_metrics(&self, period: MetricsPeriod) -> AppResult<UsageMetrics> {
            let conversations = self.conversations();
            let mut metrics = UsageMetrics::new(period, Utc::now() - period.duration());
            metrics.add_conversations(conversations.iter().map(|c| {
                let r = &c.record;
                (r.latency.total_ms, r.latency.generation_ms, r.matched, r.degraded)
            }));
            metrics.add_ratings(conversations.iter().filter_map(|c| c.feedback.as_ref().map(|f| f.rating)));
            Ok(metrics)
        }

        async fn feedback_stats(&self, filter: &FeedbackFilter) -> AppResult<FeedbackStats> {
            filter.rating_range()?;
            Ok(FeedbackStats::collect(
                self.conversations()
                    .into_iter()
                    .filter_map(|c| c.feedback)
                    .filter(|f| filter.matches(f))
                    .map(|f| (f.rating, f.category)),
            ))
        }

        async fn list_feedback(
            &self,
            filter: &FeedbackFilter,
            limit: usize,
            offset: usize,
        ) -> AppResult<Vec<Conversation>> {
            filter.rating_range()?;
            let mut matching: Vec<Conversation> = self
                .conversations()
                .into_iter()
                .filter(|c| c.feedback.as_ref().is_some_and(|f| filter.matches(f)))
                .collect();
            matching.reverse();
            Ok(matching.into_iter().skip(offset).take(limit).collect())
        }
    }

    impl MemoryConversationLog {
        /// Records with their latest feedback attached.
        fn conversations(&self) -> Vec<Conversation> {
            let records = self.records.lock().unwrap();
            let feedback = self.feedback.lock().unwrap();
            records
                .iter()
                .enumerate()
                .map(|(i, record)| {
                    let id = i as i64 + 1;
                    let latest = feedback.iter().rev().find(|f| f.conversation_id == id).cloned();
                    Conversation {
                        id,
                        record: record.clone(),
                        created_at: Utc::now(),
                        feedback_at: latest.as_ref().map(|_| Utc::now()),
                        feedback: latest,
                    }
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn conversation() -> NewConversation {
        NewConversation {
            session_id: "s-1".to_string(),
            question: "Comment installer AI_licia ?".to_string(),
            answer: "Téléchargez l'installateur.".to_string(),
            confidence: 0.93,
            source_ids: vec![4, 1],
            matched: true,
            degraded: false,
            latency: LatencyBreakdown {
                embedding_ms: 12,
                search_ms: 1,
                generation_ms: 800,
                total_ms: 815,
            },
        }
    }

    #[tokio::test]
    async fn test_record_and_get() {
        let temp = TempDir::new().unwrap();
        let log = SqliteConversationLog::open(temp.path().join("knowledge.db")).unwrap();

        let id = log.record(conversation()).await.unwrap();
        let stored = log.get(id).await.unwrap().unwrap();

        assert_eq!(stored.id, id);
        assert_eq!(stored.record.source_ids, vec![4, 1]);
        assert_eq!(stored.record.latency.generation_ms, 800);
        assert!((stored.record.confidence - 0.93).abs() < 1e-6);
        assert!(stored.feedback.is_none());
        assert!(log.get(id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_feedback_replaces_previous() {
        let temp = TempDir::new().unwrap();
        let log = SqliteConversationLog::open(temp.path().join("knowledge.db")).unwrap();
        let id = log.record(conversation()).await.unwrap();

        log.add_feedback(Feedback {
            conversation_id: id,
            rating: 2,
            comment: Some("Incomplet".to_string()),
            suggested_answer: None,
            category: Some(FeedbackCategory::IncompleteAnswer),
        })
        .await
        .unwrap();
        log.add_feedback(Feedback {
            conversation_id: id,
            rating: 5,
            comment: None,
            suggested_answer: Some("Utilisez l'installateur Windows.".to_string()),
            category: None,
        })
        .await
        .unwrap();

        let feedback = log.get(id).await.unwrap().unwrap().feedback.unwrap();
        assert_eq!(feedback.rating, 5);
        assert!(feedback.comment.is_none());
        assert!(feedback.category.is_none());
        assert!(feedback.suggested_answer.is_some());
    }

    fn feedback(conversation_id: i64, rating: u8, category: Option<FeedbackCategory>) -> Feedback {
        Feedback {
            conversation_id,
            rating,
            comment: None,
            suggested_answer: None,
            category,
        }
    }

    #[test]
    fn test_metrics_period_parse() {
        assert_eq!(MetricsPeriod::parse("7d").unwrap(), MetricsPeriod::Week);
        assert_eq!(MetricsPeriod::default().as_str(), "24h");
        assert_eq!(MetricsPeriod::Month.duration(), Duration::days(30));
        let err = MetricsPeriod::parse("1y").unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn test_feedback_filter_range() {
        assert_eq!(FeedbackFilter::default().rating_range().unwrap(), (1, 5));
        let bad = FeedbackFilter {
            min_rating: Some(4),
            max_rating: Some(2),
            category: None,
        };
        assert_eq!(bad.rating_range().unwrap_err().kind(), "invalid_input");
        let zero = FeedbackFilter {
            min_rating: Some(0),
            ..FeedbackFilter::default()
        };
        assert!(zero.rating_range().is_err());
    }

    #[tokio::test]
    async fn test_usage_metrics_over_period() {
        let temp = TempDir::new().unwrap();
        let log = SqliteConversationLog::open(temp.path().join("knowledge.db")).unwrap();

        let first = log.record(conversation()).await.unwrap();
        let second = log
            .record(NewConversation {
                matched: false,
                latency: LatencyBreakdown {
                    total_ms: 185,
                    generation_ms: 0,
                    ..LatencyBreakdown::default()
                },
                ..conversation()
            })
            .await
            .unwrap();
        let old = log.record(conversation()).await.unwrap();
        log.add_feedback(feedback(first, 5, None)).await.unwrap();
        log.add_feedback(feedback(second, 2, None)).await.unwrap();
        log.add_feedback(feedback(old, 1, None)).await.unwrap();

        // Two days back: outside 24h, inside 7d.
        let two_days_ago = format_time(Utc::now() - Duration::days(2));
        log.conn()
            .execute(
                "UPDATE conversations SET created_at = ?1, feedback_at = ?1 WHERE id = ?2",
                params![two_days_ago, old],
            )
            .unwrap();

        let day = log.usage_metrics(MetricsPeriod::Day).await.unwrap();
        assert_eq!(day.period, MetricsPeriod::Day);
        assert_eq!(day.conversations, 2);
        assert!((day.avg_latency_ms - 500.0).abs() < 1e-9);
        assert!((day.avg_generation_ms - 400.0).abs() < 1e-9);
        assert!((day.matched_rate - 0.5).abs() < 1e-9);
        assert_eq!(day.degraded_rate, 0.0);
        assert_eq!(day.feedback_count, 2);
        assert_eq!(day.avg_satisfaction, Some(3.5));
        assert_eq!(day.rating_distribution.len(), 5);
        assert_eq!(day.rating_distribution[&5], 1);
        assert_eq!(day.rating_distribution[&2], 1);
        assert_eq!(day.rating_distribution[&1], 0);

        let week = log.usage_metrics(MetricsPeriod::Week).await.unwrap();
        assert_eq!(week.conversations, 3);
        assert_eq!(week.rating_distribution[&1], 1);

        let hour_before = log.usage_metrics(MetricsPeriod::Hour).await.unwrap();
        assert!(hour_before.since > week.since);
    }

    #[tokio::test]
    async fn test_usage_metrics_without_traffic() {
        let temp = TempDir::new().unwrap();
        let log = SqliteConversationLog::open(temp.path().join("knowledge.db")).unwrap();

        let metrics = log.usage_metrics(MetricsPeriod::Month).await.unwrap();
        assert_eq!(metrics.conversations, 0);
        assert_eq!(metrics.avg_latency_ms, 0.0);
        assert_eq!(metrics.avg_satisfaction, None);
        assert!(metrics.rating_distribution.values().all(|&n| n == 0));
    }

    #[tokio::test]
    async fn test_feedback_stats_and_filters() {
        let temp = TempDir::new().unwrap();
        let log = SqliteConversationLog::open(temp.path().join("knowledge.db")).unwrap();

        let ratings = [
            (5, None),
            (4, Some(FeedbackCategory::Other)),
            (3, None),
            (2, Some(FeedbackCategory::IncompleteAnswer)),
            (1, Some(FeedbackCategory::IncorrectAnswer)),
            (1, Some(FeedbackCategory::IncompleteAnswer)),
        ];
        for (rating, category) in ratings {
            let id = log.record(conversation()).await.unwrap();
            log.add_feedback(feedback(id, rating, category)).await.unwrap();
        }
        // Without feedback: never counted.
        log.record(conversation()).await.unwrap();

        let all = log.feedback_stats(&FeedbackFilter::default()).await.unwrap();
        assert_eq!(all.total, 6);
        assert_eq!((all.positive, all.neutral, all.negative), (2, 1, 3));
        assert_eq!(all.min_rating, Some(1));
        assert_eq!(all.max_rating, Some(5));
        assert!((all.average_rating.unwrap() - 16.0 / 6.0).abs() < 1e-9);
        assert_eq!(all.by_rating[&1], 2);
        assert_eq!(all.by_category["incomplete_answer"], 2);
        assert_eq!(all.by_category.len(), 3);

        let low = FeedbackFilter {
            max_rating: Some(2),
            ..FeedbackFilter::default()
        };
        let stats = log.feedback_stats(&low).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.positive, 0);

        let incomplete = FeedbackFilter {
            category: Some(FeedbackCategory::IncompleteAnswer),
            ..FeedbackFilter::default()
        };
        let stats = log.feedback_stats(&incomplete).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.average_rating, Some(1.5));

        let listed = log.list_feedback(&low, 2, 0).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|c| c.feedback.as_ref().unwrap().rating <= 2));
        let rest = log.list_feedback(&low, 10, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(listed.iter().all(|c| c.id != rest[0].id));

        let bad = FeedbackFilter {
            min_rating: Some(6),
            ..FeedbackFilter::default()
        };
        assert_eq!(log.feedback_stats(&bad).await.unwrap_err().kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_feedback_for_unknown_conversation() {
        let temp = TempDir::new().unwrap();
        let log = SqliteConversationLog::open(temp.path().join("knowledge.db")).unwrap();

        let err = log
            .add_feedback(Feedback {
                conversation_id: 99,
                rating: 4,
                comment: None,
                suggested_answer: None,
                category: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
