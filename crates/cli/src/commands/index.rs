//! Index command handler.

use super::print_json;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use kbqa_core::{config::AppConfig, AppResult};
use kbqa_knowledge::{
    embedding_space, embeddings::create_provider, vector_index::fingerprint, Embedder, Services,
    SnapshotStore, SqliteKnowledgeStore, StaleReason, TextNormalizer,
};
use serde::Serialize;

/// Inspect or rebuild the vector index
#[derive(Args, Debug)]
pub struct IndexCommand {
    #[command(subcommand)]
    pub action: IndexAction,
}

#[derive(Subcommand, Debug)]
pub enum IndexAction {
    /// Re-embed every active entry and persist the new index
    Rebuild(IndexRebuildCommand),
    /// Compare the persisted index with the knowledge store
    Status(IndexStatusCommand),
}

impl IndexCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        match &self.action {
            IndexAction::Rebuild(cmd) => cmd.execute(config).await,
            IndexAction::Status(cmd) => cmd.execute(config).await,
        }
    }
}

#[derive(Args, Debug)]
pub struct IndexRebuildCommand {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl IndexRebuildCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        if !config.index.persist {
            tracing::warn!("index.persist is disabled; the rebuilt index will not be kept");
        }

        let services = Services::connect(config).await?;
        let report = services
            .synchronizer
            .rebuild(StaleReason::Requested)
            .await?;

        if self.json {
            return print_json(&report);
        }

        println!(
            "Indexed {} entries in {} ms (fingerprint {})",
            report.entries,
            report.duration_ms,
            short_fingerprint(&report.fingerprint)
        );
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct IndexStatusCommand {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Persisted index compared with the store, computed without loading the
/// embedding model.
#[derive(Debug, Serialize)]
struct IndexStatusReport {
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<StaleReason>,
    snapshot_path: String,
    indexed_entries: usize,
    active_entries: usize,
    dimensions: Option<usize>,
    built_at: Option<DateTime<Utc>>,
    store_modified_at: Option<DateTime<Utc>>,
    fingerprint_matches: bool,
    embedding_space: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    indexed_embedding_space: Option<String>,
}

impl IndexStatusCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        config.ensure_state_dir()?;
        let store = SqliteKnowledgeStore::open(config.store_path())?;
        let snapshots = SnapshotStore::new(config.snapshot_path());

        let entries = store.list_entries(false)?;
        let store_modified_at = store.stats()?.last_modified;
        let snapshot = snapshots.load()?;

        // The onnx provider loads its model lazily, so this stays cheap.
        let embedder = Embedder::new(
            create_provider(&config.embedding, config.model_dir())?,
            config.embedding.batch_size,
        );
        let current_space = embedding_space(&embedder, &TextNormalizer::new(&config.normalizer));

        let report = match &snapshot {
            None => IndexStatusReport {
                state: "stale",
                reason: Some(StaleReason::MissingIndex),
                snapshot_path: snapshots.path().display().to_string(),
                indexed_entries: 0,
                active_entries: entries.len(),
                dimensions: None,
                built_at: None,
                store_modified_at,
                fingerprint_matches: false,
                embedding_space: current_space,
                indexed_embedding_space: None,
            },
            Some(snapshot) => {
                let newer = match (store_modified_at, snapshot.source_watermark()) {
                    (Some(modified), Some(watermark)) => modified > watermark,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                // A snapshot from another embedding setup is discarded on load.
                let reason = if snapshot.embedding_space() != current_space {
                    Some(StaleReason::MissingIndex)
                } else {
                    newer.then_some(StaleReason::NewerModification)
                };
                IndexStatusReport {
                    state: if reason.is_some() { "stale" } else { "fresh" },
                    reason,
                    snapshot_path: snapshots.path().display().to_string(),
                    indexed_entries: snapshot.len(),
                    active_entries: entries.len(),
                    dimensions: Some(snapshot.dimensions()),
                    built_at: Some(snapshot.built_at()),
                    store_modified_at,
                    fingerprint_matches: snapshot.fingerprint() == fingerprint(&entries),
                    embedding_space: current_space,
                    indexed_embedding_space: Some(snapshot.embedding_space().to_string()),
                }
            }
        };

        if self.json {
            return print_json(&report);
        }

        println!("Index: {}", report.state);
        if let Some(reason) = report.reason {
            println!("  Reason: {}", reason);
        }
        println!("  Snapshot: {}", report.snapshot_path);
        println!(
            "  Entries: {} indexed / {} active",
            report.indexed_entries, report.active_entries
        );
        if let Some(dimensions) = report.dimensions {
            println!("  Dimensions: {}", dimensions);
        }
        if let Some(built_at) = report.built_at {
            println!("  Built: {}", built_at);
        }
        if let Some(modified) = report.store_modified_at {
            println!("  Store modified: {}", modified);
        }
        println!("  Embedding space: {}", report.embedding_space);
        if let Some(indexed) = report
            .indexed_embedding_space
            .as_deref()
            .filter(|indexed| *indexed != report.embedding_space)
        {
            println!("  Indexed with: {}", if indexed.is_empty() { "(untagged)" } else { indexed });
        }
        if snapshot.is_some() && !report.fingerprint_matches {
            println!("  Active entries differ from the indexed set");
        }
        Ok(())
    }
}

fn short_fingerprint(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
