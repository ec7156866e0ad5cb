//! SQLite persistence for index snapshots.
//!
//! Only the most recent snapshot is kept. It is written in one transaction,
//! so a crash mid-save leaves the previous snapshot readable.

use crate::vector_index::{IndexSnapshot, IndexedEntry};
use chrono::{DateTime, SecondsFormat, Utc};
use kbqa_core::{AppError, AppResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Snapshot database at a fixed path.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> AppResult<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Store(format!("Failed to create index directory: {}", e))
            })?;
        }

        let conn = Connection::open(&self.path)
            .map_err(|e| AppError::Store(format!("Failed to open index database: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS index_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                dimensions INTEGER NOT NULL,
                entry_count INTEGER NOT NULL,
                built_at TEXT NOT NULL,
                source_watermark TEXT,
                fingerprint TEXT NOT NULL,
                embedding_space TEXT
            );

            CREATE TABLE IF NOT EXISTS index_slots (
                slot INTEGER PRIMARY KEY,
                entry_id INTEGER NOT NULL,
                category TEXT NOT NULL,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                embedding BLOB NOT NULL
            );
            "#,
        )
        .map_err(|e| AppError::Store(format!("Failed to create index tables: {}", e)))?;

        add_embedding_space_column(&conn)?;
        Ok(conn)
    }

    /// Replace the stored snapshot with `snapshot`.
    pub fn save(&self, snapshot: &IndexSnapshot) -> AppResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction().map_err(store_err)?;

        tx.execute("DELETE FROM index_slots", []).map_err(store_err)?;
        tx.execute("DELETE FROM index_meta", []).map_err(store_err)?;

        tx.execute(
            "INSERT INTO index_meta
                 (id, dimensions, entry_count, built_at, source_watermark, fingerprint, embedding_space)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                snapshot.dimensions() as i64,
                snapshot.len() as i64,
                format_time(snapshot.built_at()),
                snapshot.source_watermark().map(format_time),
                snapshot.fingerprint(),
                snapshot.embedding_space(),
            ],
        )
        .map_err(store_err)?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO index_slots (slot, entry_id, category, question, answer, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(store_err)?;

            for (slot, entry) in snapshot.entries().iter().enumerate() {
                let vector = snapshot.vector(slot).ok_or_else(|| {
                    AppError::Store(format!("Snapshot has no vector for slot {}", slot))
                })?;
                stmt.execute(params![
                    slot as i64,
                    entry.entry_id,
                    entry.category,
                    entry.question,
                    entry.answer,
                    embedding_to_bytes(vector),
                ])
                .map_err(store_err)?;
            }
        }

        tx.commit().map_err(store_err)?;

        tracing::debug!(
            entries = snapshot.len(),
            path = %self.path.display(),
            "Persisted index snapshot"
        );
        Ok(())
    }

    /// Read the stored snapshot; `None` when nothing has been saved yet.
    pub fn load(&self) -> AppResult<Option<IndexSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let conn = self.open()?;

        let meta = conn
            .query_row(
                "SELECT dimensions, entry_count, built_at, source_watermark, fingerprint,
                        embedding_space
                 FROM index_meta WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(store_err)?;

        let Some((dimensions, entry_count, built_at, watermark, fingerprint, space)) = meta else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT entry_id, category, question, answer, embedding
                 FROM index_slots ORDER BY slot",
            )
            .map_err(store_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    IndexedEntry {
                        entry_id: row.get(0)?,
                        category: row.get(1)?,
                        question: row.get(2)?,
                        answer: row.get(3)?,
                    },
                    row.get::<_, Vec<u8>>(4)?,
                ))
            })
            .map_err(store_err)?;

        let mut slots = Vec::with_capacity(entry_count.max(0) as usize);
        for row in rows {
            let (entry, bytes) = row.map_err(store_err)?;
            slots.push((entry, bytes_to_embedding(&bytes)?));
        }

        if slots.len() as i64 != entry_count {
            return Err(AppError::Store(format!(
                "Index snapshot is incomplete: expected {} slots, found {}",
                entry_count,
                slots.len()
            )));
        }

        let snapshot = IndexSnapshot::restore(
            dimensions as usize,
            slots,
            parse_time(&built_at)?,
            watermark.as_deref().map(parse_time).transpose()?,
            fingerprint,
        )?
        .with_embedding_space(space.unwrap_or_default());

        tracing::info!(
            entries = snapshot.len(),
            path = %self.path.display(),
            "Loaded index snapshot"
        );
        Ok(Some(snapshot))
    }
}

/// Databases written before snapshots were tagged lack the column; their
/// snapshots load with an empty space and never match a live embedder.
fn add_embedding_space_column(conn: &Connection) -> AppResult<()> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info('index_meta')")
        .map_err(store_err)?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(store_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(store_err)?;

    if !columns.iter().any(|c| c == "embedding_space") {
        conn.execute("ALTER TABLE index_meta ADD COLUMN embedding_space TEXT", [])
            .map_err(store_err)?;
    }
    Ok(())
}

fn store_err(e: rusqlite::Error) -> AppError {
    AppError::Store(format!("Index database error: {}", e))
}

pub(crate) fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_time(s: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::Store(format!("Invalid timestamp '{}': {}", s, e)))
}

/// Convert embedding vector to little-endian bytes for storage.
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to embedding vector.
fn bytes_to_embedding(bytes: &[u8]) -> AppResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(AppError::Store(
            "Invalid embedding bytes length".to_string(),
        ));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
