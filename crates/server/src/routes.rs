//! Request handlers.

use crate::error::ApiError;
use crate::health::{self, HealthReport, HealthStatus};
use crate::state::AppState;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use kbqa_core::AppError;
use kbqa_knowledge::conversation::{FeedbackFilter, FeedbackStats, MetricsPeriod, UsageMetrics};
use kbqa_knowledge::validation::{
    validate_optional_text, validate_rating, MAX_COMMENT_CHARS, MAX_SUGGESTION_CHARS,
};
use kbqa_knowledge::{
    Conversation, EvaluationReport, EvaluationSettings, Evaluator, Feedback, FeedbackCategory,
    LatencyBreakdown, RebuildReport, SourceRef, SyncStatus,
};
use serde::{Deserialize, Serialize};

const DEFAULT_FEEDBACK_PAGE: usize = 100;
const MAX_FEEDBACK_PAGE: usize = 500;
const MAX_EVALUATION_K: usize = 50;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub question: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub conversation_id: Option<i64>,
    pub session_id: String,
    pub answer: String,
    pub confidence: f32,
    /// Contributing entry ids, best first
    pub sources: Vec<i64>,
    pub source_details: Vec<SourceRef>,
    pub matched: bool,
    pub degraded: bool,
    pub latency_ms: u64,
    pub latency: LatencyBreakdown,
}

/// `POST /search` and `POST /conversation`.
pub async fn search(
    State(state): State<AppState>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Json(request) = body?;

    let session_id = request
        .session_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let answer = state
        .orchestrator
        .answer(&request.question, &session_id)
        .await?;

    Ok(Json(SearchResponse {
        conversation_id: answer.conversation_id,
        session_id,
        sources: answer.source_ids(),
        latency_ms: answer.latency.total_ms,
        latency: answer.latency,
        answer: answer.answer,
        confidence: answer.confidence,
        source_details: answer.sources,
        matched: answer.matched,
        degraded: answer.degraded,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub conversation_id: i64,
    pub rating: i64,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub suggested_answer: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub ok: bool,
    pub conversation_id: i64,
}

/// `POST /feedback`.
pub async fn feedback(
    State(state): State<AppState>,
    body: Result<Json<FeedbackRequest>, JsonRejection>,
) -> Result<Json<FeedbackResponse>, ApiError> {
    let Json(request) = body?;

    let feedback = Feedback {
        conversation_id: request.conversation_id,
        rating: validate_rating(request.rating)?,
        comment: validate_optional_text("comment", request.comment.as_deref(), MAX_COMMENT_CHARS)?,
        suggested_answer: validate_optional_text(
            "suggested_answer",
            request.suggested_answer.as_deref(),
            MAX_SUGGESTION_CHARS,
        )?,
        category: request
            .category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(FeedbackCategory::parse)
            .transpose()?,
    };

    state.conversations.add_feedback(feedback).await?;

    Ok(Json(FeedbackResponse {
        ok: true,
        conversation_id: request.conversation_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    #[serde(default)]
    pub period: Option<String>,
}

/// `GET /metrics?period=1h|24h|7d|30d`, 24h by default.
pub async fn metrics(
    State(state): State<AppState>,
    query: Result<Query<MetricsQuery>, QueryRejection>,
) -> Result<Json<UsageMetrics>, ApiError> {
    let Query(query) = query?;
    let period = match query.period.as_deref().map(str::trim) {
        None | Some("") => MetricsPeriod::default(),
        Some(period) => MetricsPeriod::parse(period)?,
    };
    Ok(Json(state.conversations.usage_metrics(period).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedbackQuery {
    #[serde(default)]
    pub min_rating: Option<u8>,
    #[serde(default)]
    pub max_rating: Option<u8>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl FeedbackQuery {
    fn filter(&self) -> Result<FeedbackFilter, ApiError> {
        let filter = FeedbackFilter {
            min_rating: self.min_rating,
            max_rating: self.max_rating,
            category: self
                .category
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(FeedbackCategory::parse)
                .transpose()?,
        };
        filter.rating_range()?;
        Ok(filter)
    }
}

/// `GET /feedback/stats`, optionally filtered by rating range and category.
pub async fn feedback_stats(
    State(state): State<AppState>,
    query: Result<Query<FeedbackQuery>, QueryRejection>,
) -> Result<Json<FeedbackStats>, ApiError> {
    let Query(query) = query?;
    let filter = query.filter()?;
    Ok(Json(state.conversations.feedback_stats(&filter).await?))
}

/// `GET /feedback`: conversations carrying matching feedback, newest
/// feedback first.
pub async fn list_feedback(
    State(state): State<AppState>,
    query: Result<Query<FeedbackQuery>, QueryRejection>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let Query(query) = query?;
    let filter = query.filter()?;
    let limit = query.limit.unwrap_or(DEFAULT_FEEDBACK_PAGE);
    if limit == 0 || limit > MAX_FEEDBACK_PAGE {
        return Err(AppError::InvalidInput(format!(
            "limit must be between 1 and {}",
            MAX_FEEDBACK_PAGE
        ))
        .into());
    }

    let conversations = state
        .conversations
        .list_feedback(&filter, limit, query.offset.unwrap_or(0))
        .await?;
    Ok(Json(conversations))
}

#[derive(Debug, Deserialize)]
pub struct EvaluationQuery {
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub sample: Option<usize>,
}

/// `GET /admin/evaluation?k=5&sample=20`: replay knowledge base questions
/// and score the ranking.
pub async fn evaluation(
    State(state): State<AppState>,
    query: Result<Query<EvaluationQuery>, QueryRejection>,
) -> Result<Json<EvaluationReport>, ApiError> {
    let Query(query) = query?;
    let defaults = EvaluationSettings::default();
    let settings = EvaluationSettings {
        k: query.k.unwrap_or(defaults.k),
        sample: query.sample.unwrap_or(defaults.sample),
    };
    if settings.k == 0 || settings.k > MAX_EVALUATION_K {
        return Err(AppError::InvalidInput(format!(
            "k must be between 1 and {}",
            MAX_EVALUATION_K
        ))
        .into());
    }

    let report = Evaluator::new(state.store.as_ref(), &state.orchestrator, settings)
        .run()
        .await?;
    Ok(Json(report))
}

/// `GET /health`. Unhealthy answers 503 so load balancers can act on it.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = health::check(&state).await;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report))
}

/// `POST /admin/index/rebuild`. Concurrent calls share one rebuild.
pub async fn rebuild_index(State(state): State<AppState>) -> Result<Json<RebuildReport>, ApiError> {
    let report = state.sync.rebuild().await?;
    Ok(Json(report))
}

/// `GET /admin/index/status`.
pub async fn index_status(State(state): State<AppState>) -> Json<SyncStatus> {
    Json(state.synchronizer.status())
}
