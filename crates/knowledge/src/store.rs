//! Knowledge store repository.
//!
//! The retrieval core reads entries through [`KnowledgeStore`]; the SQLite
//! implementation also carries the authoring operations used by the CLI.

use crate::index::{format_time, parse_time};
use crate::types::{KnowledgeEntry, NewEntry, StoreStats};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kbqa_core::{AppError, AppResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Read side of the knowledge store, as seen by the synchronizer.
#[async_trait::async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Active entries ordered by id.
    async fn list_active_entries(&self) -> AppResult<Vec<KnowledgeEntry>>;

    /// Latest modification time over all entries, active or not.
    async fn last_modified(&self) -> AppResult<Option<DateTime<Utc>>>;

    /// Time since the store backend started, when it can report one.
    async fn uptime(&self) -> AppResult<Option<Duration>>;

    /// Remember which index slot each entry landed in. Must not count as a
    /// modification.
    async fn record_embedding_slots(&self, slots: &[(i64, i64)]) -> AppResult<()>;

    /// Cheap reachability check.
    async fn ping(&self) -> AppResult<()>;
}

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    question TEXT NOT NULL,
    answer TEXT NOT NULL,
    context TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    embedding_slot INTEGER,
    created_at TEXT NOT NULL,
    modified_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_active ON entries(active);

CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    question TEXT NOT NULL,
    answer TEXT NOT NULL,
    confidence REAL NOT NULL,
    source_ids TEXT NOT NULL,
    matched INTEGER NOT NULL,
    degraded INTEGER NOT NULL,
    embedding_ms INTEGER NOT NULL,
    search_ms INTEGER NOT NULL,
    generation_ms INTEGER NOT NULL,
    total_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    feedback_rating INTEGER,
    feedback_comment TEXT,
    feedback_suggestion TEXT,
    feedback_category TEXT,
    feedback_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id);
"#;

/// Open the knowledge database at `path`, creating it and its tables.
pub(crate) fn open_database(path: &Path) -> AppResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AppError::Store(format!("Failed to create store directory: {}", e)))?;
    }

    let conn = Connection::open(path)
        .map_err(|e| AppError::Store(format!("Failed to open knowledge store: {}", e)))?;

    conn.busy_timeout(Duration::from_secs(5)).map_err(store_err)?;
    conn.execute_batch(SCHEMA)
        .map_err(|e| AppError::Store(format!("Failed to create tables: {}", e)))?;

    tracing::debug!("Opened knowledge store at {:?}", path);
    Ok(conn)
}

pub(crate) fn store_err(e: rusqlite::Error) -> AppError {
    AppError::Store(format!("Knowledge store error: {}", e))
}

/// Entries file accepted by [`SqliteKnowledgeStore::import_yaml`]: either a
/// bare list or a mapping with an `entries` key.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImportFile {
    List(Vec<NewEntry>),
    Wrapped { entries: Vec<NewEntry> },
}

/// SQLite-backed knowledge store.
pub struct SqliteKnowledgeStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteKnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteKnowledgeStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

const ENTRY_COLUMNS: &str =
    "id, category, question, answer, context, active, embedding_slot, created_at, modified_at";

impl SqliteKnowledgeStore {
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let conn = open_database(&path)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an entry.
    pub fn add_entry(&self, entry: &NewEntry) -> AppResult<KnowledgeEntry> {
        entry.validate()?;
        let conn = self.conn();
        let now = next_timestamp(&conn)?;
        let id = insert_entry(&conn, entry, now)?;
        drop(conn);

        tracing::info!(id, category = %entry.category, "Added knowledge entry");
        self.require_entry(id)
    }

    /// Replace the content of an existing entry.
    pub fn update_entry(&self, id: i64, entry: &NewEntry) -> AppResult<KnowledgeEntry> {
        entry.validate()?;
        let conn = self.conn();
        let now = next_timestamp(&conn)?;
        let changed = conn
            .execute(
                "UPDATE entries SET category = ?1, question = ?2, answer = ?3, context = ?4,
                 modified_at = ?5 WHERE id = ?6",
                params![
                    entry.category.trim(),
                    entry.question.trim(),
                    entry.answer,
                    entry.context,
                    format_time(now),
                    id
                ],
            )
            .map_err(store_err)?;
        drop(conn);

        if changed == 0 {
            return Err(AppError::NotFound(format!("Entry {} not found", id)));
        }

        tracing::info!(id, "Updated knowledge entry");
        self.require_entry(id)
    }

    /// Logically delete an entry. Its row stays for conversation history.
    pub fn deactivate_entry(&self, id: i64) -> AppResult<()> {
        let conn = self.conn();
        let now = next_timestamp(&conn)?;
        let changed = conn
            .execute(
                "UPDATE entries SET active = 0, modified_at = ?1 WHERE id = ?2 AND active = 1",
                params![format_time(now), id],
            )
            .map_err(store_err)?;

        if changed == 0 {
            let exists: bool = conn
                .query_row("SELECT 1 FROM entries WHERE id = ?1", [id], |_| Ok(true))
                .optional()
                .map_err(store_err)?
                .unwrap_or(false);
            if !exists {
                return Err(AppError::NotFound(format!("Entry {} not found", id)));
            }
            tracing::debug!(id, "Entry already inactive");
            return Ok(());
        }

        tracing::info!(id, "Deactivated knowledge entry");
        Ok(())
    }

    pub fn get_entry(&self, id: i64) -> AppResult<Option<KnowledgeEntry>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLUMNS),
            [id],
            row_to_entry,
        )
        .optional()
        .map_err(store_err)?
        .transpose()
    }

    fn require_entry(&self, id: i64) -> AppResult<KnowledgeEntry> {
        self.get_entry(id)?
            .ok_or_else(|| AppError::NotFound(format!("Entry {} not found", id)))
    }

    /// All entries ordered by id, optionally including inactive ones.
    pub fn list_entries(&self, include_inactive: bool) -> AppResult<Vec<KnowledgeEntry>> {
        let sql = if include_inactive {
            format!("SELECT {} FROM entries ORDER BY id", ENTRY_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM entries WHERE active = 1 ORDER BY id",
                ENTRY_COLUMNS
            )
        };

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt.query_map([], row_to_entry).map_err(store_err)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(store_err)??);
        }
        Ok(entries)
    }

    /// Import entries from a YAML file in one transaction.
    ///
    /// Every entry is validated before anything is written; one invalid
    /// entry rejects the whole file.
    pub fn import_yaml(&self, path: &Path) -> AppResult<usize> {
        let contents = std::fs::read_to_string(path)?;
        let entries = match serde_yaml::from_str::<ImportFile>(&contents)? {
            ImportFile::List(entries) => entries,
            ImportFile::Wrapped { entries } => entries,
        };

        for (i, entry) in entries.iter().enumerate() {
            entry
                .validate()
                .map_err(|e| AppError::InvalidInput(format!("Item {}: {}", i + 1, e)))?;
        }

        let mut conn = self.conn();
        let now = next_timestamp(&conn)?;
        let tx = conn.transaction().map_err(store_err)?;
        for entry in &entries {
            insert_entry(&tx, entry, now)?;
        }
        tx.commit().map_err(store_err)?;

        tracing::info!(
            count = entries.len(),
            file = %path.display(),
            "Imported knowledge entries"
        );
        Ok(entries.len())
    }

    pub fn stats(&self) -> AppResult<StoreStats> {
        let conn = self.conn();
        let count = |sql: &str| -> AppResult<u64> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|v| v.max(0) as u64)
                .map_err(store_err)
        };

        Ok(StoreStats {
            total_entries: count("SELECT COUNT(*) FROM entries")?,
            active_entries: count("SELECT COUNT(*) FROM entries WHERE active = 1")?,
            indexed_entries: count(
                "SELECT COUNT(*) FROM entries WHERE active = 1 AND embedding_slot IS NOT NULL",
            )?,
            conversations: count("SELECT COUNT(*) FROM conversations")?,
            last_modified: query_last_modified(&conn)?,
        })
    }
}

#[async_trait::async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    async fn list_active_entries(&self) -> AppResult<Vec<KnowledgeEntry>> {
        self.list_entries(false)
    }

    async fn last_modified(&self) -> AppResult<Option<DateTime<Utc>>> {
        query_last_modified(&self.conn())
    }

    /// The database file outlives the process, so there is no restart that
    /// could lose entries.
    async fn uptime(&self) -> AppResult<Option<Duration>> {
        Ok(None)
    }

    async fn record_embedding_slots(&self, slots: &[(i64, i64)]) -> AppResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(store_err)?;
        tx.execute("UPDATE entries SET embedding_slot = NULL", [])
            .map_err(store_err)?;
        {
            let mut stmt = tx
                .prepare("UPDATE entries SET embedding_slot = ?1 WHERE id = ?2")
                .map_err(store_err)?;
            for (entry_id, slot) in slots {
                stmt.execute(params![slot, entry_id]).map_err(store_err)?;
            }
        }
        tx.commit().map_err(store_err)
    }

    async fn ping(&self) -> AppResult<()> {
        self.conn()
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(store_err)
    }
}

fn insert_entry(conn: &Connection, entry: &NewEntry, now: DateTime<Utc>) -> AppResult<i64> {
    let ts = format_time(now);
    conn.execute(
        "INSERT INTO entries (category, question, answer, context, active, created_at, modified_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
        params![
            entry.category.trim(),
            entry.question.trim(),
            entry.answer,
            entry.context,
            ts
        ],
    )
    .map_err(store_err)?;
    Ok(conn.last_insert_rowid())
}

fn query_last_modified(conn: &Connection) -> AppResult<Option<DateTime<Utc>>> {
    let latest: Option<String> = conn
        .query_row("SELECT MAX(modified_at) FROM entries", [], |row| row.get(0))
        .map_err(store_err)?;
    latest.as_deref().map(parse_time).transpose()
}

/// A write timestamp strictly after every stored modification time, so
/// back-to-back edits are always observable as newer.
fn next_timestamp(conn: &Connection) -> AppResult<DateTime<Utc>> {
    let now = parse_time(&format_time(Utc::now()))?;
    Ok(match query_last_modified(conn)? {
        Some(latest) if latest >= now => latest + ChronoDuration::microseconds(1),
        _ => now,
    })
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<AppResult<KnowledgeEntry>> {
    let created_at: String = row.get(7)?;
    let modified_at: String = row.get(8)?;

    let (created_at, modified_at) = match (parse_time(&created_at), parse_time(&modified_at)) {
        (Ok(c), Ok(m)) => (c, m),
        (Err(e), _) | (_, Err(e)) => return Ok(Err(e)),
    };

    Ok(Ok(KnowledgeEntry {
        id: row.get(0)?,
        category: row.get(1)?,
        question: row.get(2)?,
        answer: row.get(3)?,
        context: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
        embedding_slot: row.get(6)?,
        created_at,
        modified_at,
    }))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::SubsecRound;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory store with scriptable clock, uptime and outages.
    #[derive(Default)]
    pub struct MemoryStore {
        pub entries: Mutex<Vec<KnowledgeEntry>>,
        pub last_modified: Mutex<Option<DateTime<Utc>>>,
        pub uptime: Mutex<Option<Duration>>,
        pub slots: Mutex<Vec<(i64, i64)>>,
        pub offline: AtomicBool,
    }

    impl MemoryStore {
        pub fn with_entries(entries: Vec<KnowledgeEntry>) -> Self {
            let store = Self::default();
            let latest = entries.iter().map(|e| e.modified_at).max();
            *store.entries.lock().unwrap() = entries;
            *store.last_modified.lock().unwrap() = latest;
            store
        }

        /// Replace the content and bump the modification time.
        pub fn replace(&self, entries: Vec<KnowledgeEntry>) {
            *self.entries.lock().unwrap() = entries;
            let mut last = self.last_modified.lock().unwrap();
            let next = Utc::now().trunc_subsecs(6);
            *last = Some(match *last {
                Some(prev) if prev >= next => prev + ChronoDuration::milliseconds(1),
                _ => next,
            });
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn check_online(&self) -> AppResult<()> {
            if self.offline.load(Ordering::SeqCst) {
                Err(AppError::Store("store unreachable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Timestamps are cut to microseconds like the SQLite columns.
    pub fn entry(id: i64, question: &str, answer: &str) -> KnowledgeEntry {
        let now = Utc::now().trunc_subsecs(6);
        KnowledgeEntry {
            id,
            category: "support".to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            context: None,
            active: true,
            embedding_slot: None,
            created_at: now,
            modified_at: now,
        }
    }

    #[async_trait::async_trait]
    impl KnowledgeStore for MemoryStore {
        async fn list_active_entries(&self) -> AppResult<Vec<KnowledgeEntry>> {
            self.check_online()?;
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.active)
                .cloned()
                .collect())
        }

        async fn last_modified(&self) -> AppResult<Option<DateTime<Utc>>> {
            self.check_online()?;
            Ok(*self.last_modified.lock().unwrap())
        }

        async fn uptime(&self) -> AppResult<Option<Duration>> {
            self.check_online()?;
            Ok(*self.uptime.lock().unwrap())
        }

        async fn record_embedding_slots(&self, slots: &[(i64, i64)]) -> AppResult<()> {
            self.check_online()?;
            *self.slots.lock().unwrap() = slots.to_vec();
            Ok(())
        }

        async fn ping(&self) -> AppResult<()> {
            self.check_online()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, SqliteKnowledgeStore) {
        let temp = TempDir::new().unwrap();
        let store = SqliteKnowledgeStore::open(temp.path().join("knowledge.db")).unwrap();
        (temp, store)
    }

    #[tokio::test]
    async fn test_add_and_list() {
        let (_temp, store) = open();
        let added = store
            .add_entry(&NewEntry::new(
                "installation",
                "  Comment installer AI_licia ?  ",
                "Téléchargez l'installateur.",
            ))
            .unwrap();

        assert_eq!(added.question, "Comment installer AI_licia ?");
        assert!(added.active);
        assert!(added.embedding_slot.is_none());

        let active = store.list_active_entries().await.unwrap();
        assert_eq!(active, vec![added.clone()]);
        assert_eq!(store.last_modified().await.unwrap(), Some(added.modified_at));
    }

    #[tokio::test]
    async fn test_invalid_entry_rejected() {
        let (_temp, store) = open();
        let err = store.add_entry(&NewEntry::new("", "Question ?", "R")).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(store.list_entries(true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_bumps_last_modified() {
        let (_temp, store) = open();
        let a = store.add_entry(&NewEntry::new("c", "Première question", "A")).unwrap();
        let b = store.add_entry(&NewEntry::new("c", "Deuxième question", "B")).unwrap();
        assert!(b.modified_at > a.modified_at);

        let before = store.last_modified().await.unwrap().unwrap();
        store.deactivate_entry(a.id).unwrap();
        let after = store.last_modified().await.unwrap().unwrap();
        assert!(after > before);

        let active: Vec<i64> = store
            .list_active_entries()
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(active, vec![b.id]);
        assert_eq!(store.list_entries(true).unwrap().len(), 2);

        // idempotent
        store.deactivate_entry(a.id).unwrap();
        assert_eq!(store.last_modified().await.unwrap().unwrap(), after);
    }

    #[tokio::test]
    async fn test_unknown_entry_not_found() {
        let (_temp, store) = open();
        assert_eq!(store.deactivate_entry(42).unwrap_err().kind(), "not_found");
        assert_eq!(
            store
                .update_entry(42, &NewEntry::new("c", "Question ?", "R"))
                .unwrap_err()
                .kind(),
            "not_found"
        );
        assert!(store.get_entry(42).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_entry() {
        let (_temp, store) = open();
        let entry = store.add_entry(&NewEntry::new("c", "Question ?", "Ancienne")).unwrap();
        let updated = store
            .update_entry(entry.id, &NewEntry::new("c", "Question ?", "Nouvelle"))
            .unwrap();

        assert_eq!(updated.answer, "Nouvelle");
        assert_eq!(updated.created_at, entry.created_at);
        assert!(updated.modified_at > entry.modified_at);
    }

    #[tokio::test]
    async fn test_embedding_slots_do_not_modify() {
        let (_temp, store) = open();
        let a = store.add_entry(&NewEntry::new("c", "Question A", "A")).unwrap();
        let b = store.add_entry(&NewEntry::new("c", "Question B", "B")).unwrap();
        let before = store.last_modified().await.unwrap();

        store
            .record_embedding_slots(&[(a.id, 0), (b.id, 1)])
            .await
            .unwrap();
        assert_eq!(store.get_entry(b.id).unwrap().unwrap().embedding_slot, Some(1));
        assert_eq!(store.stats().unwrap().indexed_entries, 2);

        store.record_embedding_slots(&[(b.id, 0)]).await.unwrap();
        assert_eq!(store.get_entry(a.id).unwrap().unwrap().embedding_slot, None);
        assert_eq!(store.last_modified().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_import_yaml() {
        let (temp, store) = open();
        let file = temp.path().join("entries.yaml");
        std::fs::write(
            &file,
            r#"
entries:
  - category: installation
    question: Comment installer AI_licia ?
    answer: Téléchargez l'installateur depuis le site.
  - category: tts
    question: Comment configurer le TTS ?
    answer: Ouvrez les paramètres audio.
    context: obs
"#,
        )
        .unwrap();

        assert_eq!(store.import_yaml(&file).unwrap(), 2);
        let entries = store.list_entries(false).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].context.as_deref(), Some("obs"));
    }

    #[tokio::test]
    async fn test_import_rejects_whole_file_on_invalid_entry() {
        let (temp, store) = open();
        let file = temp.path().join("entries.yaml");
        std::fs::write(
            &file,
            "- {category: a, question: \"Valide ?\", answer: oui}\n- {category: a, question: \"ab\", answer: non}\n",
        )
        .unwrap();

        let err = store.import_yaml(&file).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(err.to_string().contains("Item 2"));
        assert!(store.list_entries(true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_and_ping() {
        let (_temp, store) = open();
        store.ping().await.unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_entries, 0);
        assert!(stats.last_modified.is_none());
        assert!(store.uptime().await.unwrap().is_none());
    }
}
