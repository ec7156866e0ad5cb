//! Index synchronizer.
//!
//! Keeps the [`VectorIndex`] consistent with the [`KnowledgeStore`] without
//! the store pushing changes. The state machine:
//!
//! ```text
//! Unknown --rebuild ok--> Fresh --trigger--> Stale --rebuild ok--> Fresh
//! ```
//!
//! Triggers, checked in order: no index loaded, an explicit request, a
//! store modification newer than the snapshot, and a store restart (store
//! uptime shorter than the snapshot age). A rebuild embeds every active
//! entry before swapping; any failure leaves the previous snapshot serving
//! and the trigger pending for the next check.

use crate::embeddings::Embedder;
use crate::index::SnapshotStore;
use crate::normalize::TextNormalizer;
use crate::store::KnowledgeStore;
use crate::types::KnowledgeEntry;
use crate::vector_index::{fingerprint, IndexSnapshot, IndexedEntry, VectorIndex};
use chrono::{DateTime, Utc};
use kbqa_core::{AppError, AppResult};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No index loaded yet
    Unknown,
    Fresh,
    Stale,
}

/// Why the index was considered stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    MissingIndex,
    Requested,
    NewerModification,
    StoreRestarted,
}

impl StaleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingIndex => "missing_index",
            Self::Requested => "requested",
            Self::NewerModification => "newer_modification",
            Self::StoreRestarted => "store_restarted",
        }
    }

    /// Triggers caused by store changes, as opposed to the process itself.
    fn is_store_driven(&self) -> bool {
        matches!(self, Self::NewerModification | Self::StoreRestarted)
    }
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable synchronizer state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_reason: Option<StaleReason>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_rebuild_at: Option<DateTime<Utc>>,
    pub last_rebuild_ms: Option<u64>,
    pub entries: usize,
    pub fingerprint: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Unknown,
            last_reason: None,
            last_check_at: None,
            last_rebuild_at: None,
            last_rebuild_ms: None,
            entries: 0,
            fingerprint: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

/// Identifies the vector space produced by `embedder` over text from
/// `normalizer`. Vectors from different spaces are not comparable.
pub fn embedding_space(embedder: &Embedder, normalizer: &TextNormalizer) -> String {
    let signature = normalizer.signature();
    format!(
        "{}/{}/{}/{}",
        embedder.provider_name(),
        embedder.model_name(),
        embedder.dimensions(),
        signature.get(..16).unwrap_or(&signature)
    )
}

/// Outcome of a successful rebuild.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildReport {
    pub reason: StaleReason,
    pub entries: usize,
    pub duration_ms: u64,
    pub fingerprint: String,
}

pub struct IndexSynchronizer {
    store: Arc<dyn KnowledgeStore>,
    embedder: Embedder,
    normalizer: Arc<TextNormalizer>,
    index: Arc<VectorIndex>,
    snapshots: Option<SnapshotStore>,
    min_rebuild_interval: Duration,

    /// Trigger waiting for a successful rebuild
    pending: Mutex<Option<StaleReason>>,
    rebuild_lock: tokio::sync::Mutex<Option<RebuildReport>>,
    rebuilds_started: AtomicU64,
    status: watch::Sender<SyncStatus>,
    /// Tag of the vectors this synchronizer produces
    embedding_space: String,
}

impl std::fmt::Debug for IndexSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSynchronizer")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl IndexSynchronizer {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        embedder: Embedder,
        normalizer: Arc<TextNormalizer>,
        index: Arc<VectorIndex>,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        let embedding_space = embedding_space(&embedder, &normalizer);
        Self {
            store,
            embedder,
            normalizer,
            index,
            snapshots: None,
            min_rebuild_interval: Duration::ZERO,
            pending: Mutex::new(None),
            rebuild_lock: tokio::sync::Mutex::new(None),
            rebuilds_started: AtomicU64::new(0),
            status,
            embedding_space,
        }
    }

    /// Persist every successful rebuild to `snapshots`.
    pub fn with_snapshot_store(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Delay store-driven rebuilds until `interval` has passed since the
    /// previous one.
    pub fn with_min_rebuild_interval(mut self, interval: Duration) -> Self {
        self.min_rebuild_interval = interval;
        self
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn embedding_space(&self) -> &str {
        &self.embedding_space
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    fn pending(&self) -> Option<StaleReason> {
        *self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_pending(&self, reason: Option<StaleReason>) {
        *self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = reason;
    }

    fn mark_stale(&self, reason: StaleReason) {
        let previous = self.pending();
        // Keep the highest-priority pending trigger.
        let keep = match previous {
            Some(p) if (p as u8) <= (reason as u8) => p,
            _ => reason,
        };
        self.set_pending(Some(keep));

        let loaded = self.index.is_loaded();
        self.status.send_modify(|s| {
            s.state = if loaded {
                SyncState::Stale
            } else {
                SyncState::Unknown
            };
            s.last_reason = Some(keep);
        });
    }

    /// Mark the index stale so the next check rebuilds it.
    pub fn request_rebuild(&self) {
        tracing::info!("Index rebuild requested");
        self.mark_stale(StaleReason::Requested);
    }

    /// Install the persisted snapshot, if any. Returns whether one was
    /// loaded.
    ///
    /// A snapshot built by another embedder or normalizer is not installed,
    /// so the next check finds no index and rebuilds.
    pub async fn load_persisted(&self) -> AppResult<bool> {
        let Some(snapshots) = self.snapshots.clone() else {
            return Ok(false);
        };

        let loaded = tokio::task::spawn_blocking(move || snapshots.load())
            .await
            .map_err(|e| AppError::Sync(format!("Snapshot loader panicked: {}", e)))??;

        let Some(snapshot) = loaded else {
            return Ok(false);
        };

        if snapshot.embedding_space() != self.embedding_space {
            tracing::warn!(
                persisted = snapshot.embedding_space(),
                current = %self.embedding_space,
                "Persisted index was built with another embedding setup; rebuilding"
            );
            return Ok(false);
        }

        let snapshot = self.index.install(snapshot)?;
        self.status.send_modify(|s| {
            s.state = SyncState::Fresh;
            s.entries = snapshot.len();
            s.fingerprint = Some(snapshot.fingerprint().to_string());
            s.last_rebuild_at = Some(snapshot.built_at());
        });
        Ok(true)
    }

    /// Evaluate the staleness triggers. Store errors leave the state as it
    /// was and are returned to the caller.
    pub async fn check(&self) -> AppResult<Option<StaleReason>> {
        let result = self.evaluate_triggers().await;
        let now = Utc::now();

        match &result {
            Ok(Some(reason)) => {
                self.mark_stale(*reason);
                self.status.send_modify(|s| s.last_check_at = Some(now));
            }
            Ok(None) => {
                self.status.send_modify(|s| {
                    s.last_check_at = Some(now);
                    s.state = SyncState::Fresh;
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Staleness check failed; keeping current index");
                let message = e.to_string();
                self.status.send_modify(|s| {
                    s.last_check_at = Some(now);
                    s.last_error = Some(message);
                });
            }
        }

        result
    }

    async fn evaluate_triggers(&self) -> AppResult<Option<StaleReason>> {
        let Some(snapshot) = self.index.snapshot() else {
            return Ok(Some(StaleReason::MissingIndex));
        };

        if let Some(reason) = self.pending() {
            return Ok(Some(reason));
        }

        let last_modified = self.store.last_modified().await?;
        if let Some(modified) = last_modified {
            let newer = match snapshot.source_watermark() {
                Some(watermark) => modified > watermark,
                None => true,
            };
            if newer {
                tracing::info!(
                    reason = %StaleReason::NewerModification,
                    modified = %modified,
                    watermark = ?snapshot.source_watermark(),
                    "Knowledge store changed since last rebuild"
                );
                return Ok(Some(StaleReason::NewerModification));
            }
        }

        if let Some(uptime) = self.store.uptime().await? {
            let age = snapshot_age(&snapshot);
            if uptime < age {
                tracing::warn!(
                    reason = %StaleReason::StoreRestarted,
                    uptime_secs = uptime.as_secs(),
                    index_age_secs = age.as_secs(),
                    "Knowledge store restarted since last rebuild"
                );
                return Ok(Some(StaleReason::StoreRestarted));
            }
        }

        Ok(None)
    }

    /// Check and rebuild when stale. Returns the report of the rebuild, if
    /// one ran.
    pub async fn sync_once(&self) -> AppResult<Option<RebuildReport>> {
        let Some(reason) = self.check().await? else {
            return Ok(None);
        };

        if reason.is_store_driven() && !self.min_rebuild_interval.is_zero() {
            if let Some(snapshot) = self.index.snapshot() {
                let age = snapshot_age(&snapshot);
                if age < self.min_rebuild_interval {
                    tracing::debug!(
                        reason = %reason,
                        wait_secs = (self.min_rebuild_interval - age).as_secs(),
                        "Rebuild deferred"
                    );
                    return Ok(None);
                }
            }
        }

        self.rebuild(reason).await.map(Some)
    }

    /// Rebuild the index from the store's active entries.
    ///
    /// Concurrent calls are serialized; a caller that waited while another
    /// rebuild started and completed gets that rebuild's report.
    pub async fn rebuild(&self, reason: StaleReason) -> AppResult<RebuildReport> {
        let started_before = self.rebuilds_started.load(Ordering::SeqCst);
        let mut last_report = self.rebuild_lock.lock().await;

        if self.rebuilds_started.load(Ordering::SeqCst) > started_before
            && self.pending().is_none()
        {
            if let Some(report) = last_report.as_ref() {
                tracing::debug!("Coalesced with a concurrent rebuild");
                return Ok(report.clone());
            }
        }

        self.rebuilds_started.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        tracing::info!(reason = %reason, "Rebuilding index");

        match self.build_snapshot().await {
            Ok(snapshot) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                let report = RebuildReport {
                    reason,
                    entries: snapshot.len(),
                    duration_ms,
                    fingerprint: snapshot.fingerprint().to_string(),
                };

                self.set_pending(None);
                self.status.send_modify(|s| {
                    s.state = SyncState::Fresh;
                    s.last_reason = Some(reason);
                    s.last_rebuild_at = Some(snapshot.built_at());
                    s.last_rebuild_ms = Some(duration_ms);
                    s.entries = snapshot.len();
                    s.fingerprint = Some(report.fingerprint.clone());
                    s.last_error = None;
                    s.consecutive_failures = 0;
                });

                tracing::info!(
                    reason = %reason,
                    entries = report.entries,
                    elapsed_ms = duration_ms,
                    "Index rebuilt"
                );

                self.after_rebuild(&snapshot).await;
                *last_report = Some(report.clone());
                Ok(report)
            }
            Err(e) => {
                let e = match e {
                    AppError::DimensionMismatch { .. } | AppError::ModelUnavailable(_) => e,
                    other => AppError::Sync(format!("Index rebuild failed: {}", other)),
                };

                self.mark_stale(reason);
                let message = e.to_string();
                self.status.send_modify(|s| {
                    s.last_error = Some(message);
                    s.consecutive_failures += 1;
                });

                tracing::error!(
                    reason = %reason,
                    error = %e,
                    "Index rebuild failed; previous index kept"
                );
                Err(e)
            }
        }
    }

    async fn build_snapshot(&self) -> AppResult<Arc<IndexSnapshot>> {
        // Read the watermark first: changes made while listing show up as
        // newer on the next check.
        let watermark = self.store.last_modified().await?;
        let entries = self.store.list_active_entries().await?;

        for entry in &entries {
            if !entry.active {
                return Err(AppError::InvalidInput(format!(
                    "Entry {} is inactive",
                    entry.id
                )));
            }
            entry.validate()?;
        }

        let texts: Vec<String> = entries
            .iter()
            .map(|entry| self.embedding_input(entry))
            .collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let slots = entries.iter().map(IndexedEntry::from).zip(vectors).collect();
        let snapshot =
            IndexSnapshot::build(self.index.dimensions(), slots, watermark, fingerprint(&entries))?
                .with_embedding_space(self.embedding_space.clone());
        self.index.install(snapshot)
    }

    fn embedding_input(&self, entry: &KnowledgeEntry) -> String {
        self.normalizer.embedding_text(&entry.embedding_text())
    }

    /// Persistence and slot bookkeeping. Failures here do not undo the
    /// rebuild.
    async fn after_rebuild(&self, snapshot: &Arc<IndexSnapshot>) {
        if let Some(snapshots) = self.snapshots.clone() {
            let snapshot = Arc::clone(snapshot);
            let saved = tokio::task::spawn_blocking(move || snapshots.save(&snapshot)).await;
            match saved {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to persist index snapshot"),
                Err(e) => tracing::warn!(error = %e, "Snapshot writer panicked"),
            }
        }

        let slots: Vec<(i64, i64)> = snapshot
            .entries()
            .iter()
            .enumerate()
            .map(|(slot, entry)| (entry.entry_id, slot as i64))
            .collect();
        if let Err(e) = self.store.record_embedding_slots(&slots).await {
            tracing::warn!(error = %e, "Failed to record embedding slots");
        }
    }

    /// Run the periodic check loop in the background.
    ///
    /// With `period == None` only explicit rebuild commands are served.
    pub fn spawn(self: Arc<Self>, period: Option<Duration>) -> SyncHandle {
        let (commands_tx, mut commands_rx) = mpsc::channel::<SyncCommand>(16);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let status = self.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = period.map(|p| {
                let mut ticker = tokio::time::interval(p);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker
            });

            tracing::info!(
                interval_secs = period.map(|p| p.as_secs()),
                "Index synchronizer started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    Some(command) = commands_rx.recv() => match command {
                        SyncCommand::Rebuild { reply } => {
                            self.request_rebuild();
                            let result = self.rebuild(StaleReason::Requested).await;
                            let _ = reply.send(result);
                        }
                    },
                    _ = next_tick(&mut ticker) => {
                        if let Err(e) = self.sync_once().await {
                            tracing::debug!(error = %e, "Sync pass failed");
                        }
                    }
                }
            }

            tracing::info!("Index synchronizer stopped");
        });

        SyncHandle {
            commands: commands_tx,
            shutdown: shutdown_tx,
            status,
            task: Mutex::new(Some(task)),
        }
    }
}

fn snapshot_age(snapshot: &IndexSnapshot) -> Duration {
    (Utc::now() - snapshot.built_at())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Messages accepted by the synchronizer task.
#[derive(Debug)]
pub enum SyncCommand {
    Rebuild {
        reply: oneshot::Sender<AppResult<RebuildReport>>,
    },
}

/// Handle to a running synchronizer task.
#[derive(Debug)]
pub struct SyncHandle {
    commands: mpsc::Sender<SyncCommand>,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<SyncStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncHandle {
    /// Ask the synchronizer for an out-of-band rebuild and wait for it.
    pub async fn rebuild(&self) -> AppResult<RebuildReport> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SyncCommand::Rebuild { reply })
            .await
            .map_err(|_| AppError::Sync("Index synchronizer is not running".to_string()))?;
        response
            .await
            .map_err(|_| AppError::Sync("Index synchronizer stopped".to_string()))?
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Synchronizer task ended abnormally");
            }
        }
    }
}
