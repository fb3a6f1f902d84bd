//! Legacy index access
//!
//! The old index kept one JSON document per page. Records are read in
//! ascending position order so a single integer is enough to resume.

use crate::errors::{IndexError, Result};
use crate::model::{Page, PageContent, VisitInteraction};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const LEGACY_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS legacy_docs (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    doc  TEXT NOT NULL
);
"#;

/// A visit as the legacy index stored it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyVisit {
    pub time: i64,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub scroll_max_perc: Option<f64>,
}

/// Page document in the legacy format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyDocument {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub visits: Vec<LegacyVisit>,
    #[serde(default)]
    pub bookmarks: Vec<i64>,
}

impl LegacyDocument {
    /// Transform to the new aggregate
    ///
    /// The latest of several legacy bookmarks becomes the bookmark time.
    pub fn into_page(self) -> Result<Page> {
        let mut page = Page::derive(
            &self.url,
            PageContent {
                title: self.title,
                text: self.content,
            },
        )?;

        for visit in &self.visits {
            page.add_visit(visit.time);
            if let Some(record) = page.visits.iter_mut().find(|v| v.time == visit.time) {
                record.interaction.merge(&VisitInteraction {
                    duration_ms: visit.duration,
                    scroll_max_perc: visit.scroll_max_perc,
                    ..VisitInteraction::default()
                });
            }
        }
        if let Some(latest) = self.bookmarks.iter().copied().max() {
            page.set_bookmark(latest);
        }

        page.validate()?;
        Ok(page)
    }
}

/// One stored legacy record with its position
#[derive(Debug, Clone)]
pub struct LegacyRecord {
    pub position: i64,
    pub raw: String,
}

impl LegacyRecord {
    pub fn document(&self) -> Result<LegacyDocument> {
        serde_json::from_str(&self.raw).map_err(|e| {
            IndexError::migration_with_source(
                format!("unreadable legacy document at {}", self.position),
                e,
            )
        })
    }
}

/// Read side of the legacy index
pub trait LegacySource: Send + Sync {
    /// Up to `limit` records with position strictly greater than `after`,
    /// ascending. An empty result means end of data.
    fn read_batch(&self, after: i64, limit: usize) -> Result<Vec<LegacyRecord>>;
}

/// SQLite-backed legacy index
pub struct LegacyIndex {
    conn: Mutex<Connection>,
}

impl LegacyIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            IndexError::store_with_source(
                format!("failed to open legacy db at {}", path.display()),
                e,
            )
        })?;
        Self::init(conn)
    }

    pub fn connect_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| IndexError::store_with_source("failed to open in-memory legacy db", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(LEGACY_SCHEMA_SQL)
            .map_err(|e| IndexError::store_with_source("failed to apply legacy schema", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| IndexError::internal("legacy index lock poisoned"))
    }

    /// Append a document, returning its position
    pub fn insert_document(&self, doc: &LegacyDocument) -> Result<i64> {
        let raw = serde_json::to_string(doc)
            .map_err(|e| IndexError::migration_with_source("failed to encode legacy document", e))?;
        self.insert_raw(&raw)
    }

    /// Append a raw document body without checking it
    pub fn insert_raw(&self, raw: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute("INSERT INTO legacy_docs (doc) VALUES (?1)", params![raw])
            .map_err(|e| IndexError::store_with_source("failed to insert legacy document", e))?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest documents whose body mentions `term` (case-insensitive)
    ///
    /// Serves reads while the legacy index is still the live one; there is
    /// no term table here, only a substring scan.
    pub fn search(&self, term: &str, limit: usize) -> Result<Vec<LegacyDocument>> {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let escaped = term.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, doc FROM legacy_docs
                WHERE lower(doc) LIKE '%' || ?1 || '%' ESCAPE '\'
                ORDER BY id DESC
                LIMIT ?2
                "#,
            )
            .map_err(|e| IndexError::store_with_source("failed to prepare legacy search", e))?;
        let rows = stmt
            .query_map(params![escaped, i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok(LegacyRecord {
                    position: row.get(0)?,
                    raw: row.get(1)?,
                })
            })
            .map_err(|e| IndexError::store_with_source("failed to run legacy search", e))?;

        let mut docs = Vec::new();
        for row in rows {
            let record =
                row.map_err(|e| IndexError::store_with_source("failed to read legacy row", e))?;
            match record.document() {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    tracing::debug!(
                        position = record.position,
                        error = %e,
                        "unreadable legacy document skipped"
                    );
                }
            }
        }
        Ok(docs)
    }

    pub fn len(&self) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row("SELECT COUNT(*) FROM legacy_docs", [], |row| row.get(0))
            .map_err(|e| IndexError::store_with_source("failed to count legacy documents", e))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl LegacySource for LegacyIndex {
    fn read_batch(&self, after: i64, limit: usize) -> Result<Vec<LegacyRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, doc FROM legacy_docs WHERE id > ?1 ORDER BY id ASC LIMIT ?2")
            .map_err(|e| IndexError::store_with_source("failed to prepare legacy read", e))?;

        let rows = stmt
            .query_map(params![after, i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok(LegacyRecord {
                    position: row.get(0)?,
                    raw: row.get(1)?,
                })
            })
            .map_err(|e| IndexError::store_with_source("failed to read legacy batch", e))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| IndexError::store_with_source("failed to read legacy row", e))
    }
}
