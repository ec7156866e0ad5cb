//! Component health aggregation for `GET /health`.

use crate::state::AppState;
use kbqa_knowledge::SyncState;
use serde::Serialize;
use std::time::Duration;

/// Upper bound for a single component check.
const CHECK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Ok,
    /// Loaded but behind the store
    Stale,
    /// Not configured
    Disabled,
    /// Nothing loaded yet
    Missing,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus) -> Self {
        Self {
            status,
            detail: None,
        }
    }

    fn with_detail(status: ComponentStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Components {
    pub knowledge_store: ComponentHealth,
    pub vector_index: ComponentHealth,
    pub generator: ComponentHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Components,
    pub index_entries: usize,
    pub uptime_secs: u64,
}

/// Check every component.
///
/// `unhealthy` when no index is loaded, since nothing can be answered;
/// `degraded` when the store or generator is unreachable or the index is
/// stale; `healthy` otherwise.
pub async fn check(state: &AppState) -> HealthReport {
    let knowledge_store = match tokio::time::timeout(CHECK_TIMEOUT, state.store.ping()).await {
        Ok(Ok(())) => ComponentHealth::new(ComponentStatus::Ok),
        Ok(Err(e)) => ComponentHealth::with_detail(ComponentStatus::Unavailable, e.to_string()),
        Err(_) => ComponentHealth::with_detail(ComponentStatus::Unavailable, "health check timed out"),
    };

    let sync_status = state.synchronizer.status();
    let index = state.synchronizer.index();
    let vector_index = if !index.is_loaded() {
        ComponentHealth::new(ComponentStatus::Missing)
    } else if sync_status.state == SyncState::Stale {
        let reason = sync_status
            .last_reason
            .map(|r| r.as_str().to_string())
            .unwrap_or_default();
        ComponentHealth::with_detail(ComponentStatus::Stale, reason)
    } else {
        ComponentHealth::new(ComponentStatus::Ok)
    };

    let generator = match &state.generator {
        None => ComponentHealth::new(ComponentStatus::Disabled),
        Some(generator) => match tokio::time::timeout(CHECK_TIMEOUT, generator.health()).await {
            Ok(Ok(())) => ComponentHealth::with_detail(ComponentStatus::Ok, generator.name()),
            Ok(Err(e)) => ComponentHealth::with_detail(ComponentStatus::Unavailable, e.to_string()),
            Err(_) => ComponentHealth::with_detail(ComponentStatus::Unavailable, "health check timed out"),
        },
    };

    let status = if vector_index.status == ComponentStatus::Missing {
        HealthStatus::Unhealthy
    } else if knowledge_store.status == ComponentStatus::Unavailable
        || generator.status == ComponentStatus::Unavailable
        || vector_index.status == ComponentStatus::Stale
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    HealthReport {
        status,
        components: Components {
            knowledge_store,
            vector_index,
            generator,
        },
        index_entries: index.len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    }
}
