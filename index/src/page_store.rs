//! Transactional page/visit/favicon store
//!
//! SQLite-backed persistence for the [`Page`] aggregate. Each add-page
//! write runs in one transaction covering the page row, its terms, visits
//! and bookmark. The favicon upsert runs in a nested savepoint whose
//! failure is logged and rolled back on its own, leaving the surrounding
//! transaction intact.

use crate::config::PagetrailConfig;
use crate::errors::{IndexError, Result};
use crate::model::{
    FavIconRecord, MigrationCursor, MigrationStatus, Page, PageAddRequest, PageContent,
    VisitInteraction, VisitRecord,
};
use crate::pipeline::{normalize_url, transform_url};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Embedded schema SQL
const SCHEMA_SQL: &str = include_str!("../schema.sql");

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A row returned by term lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub url: String,
    pub hostname: String,
    pub title: Option<String>,
    /// Most recent visit, or the bookmark time for bookmark-only pages
    pub last_seen: Option<i64>,
}

/// Store wrapper
///
/// The connection sits behind a mutex so one store can be shared by every
/// tab pipeline and the migrator; SQLite serializes the writes.
pub struct PageVisitStore {
    conn: Mutex<Connection>,
}

impl PageVisitStore {
    /// Connect to the configured index database and initialize schema
    pub fn connect_and_init(cfg: &PagetrailConfig) -> Result<Self> {
        let path = cfg.resolved_db_path();
        Self::connect_and_init_at_path(&path)
    }

    /// Connect to a specific database path
    pub fn connect_and_init_at_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                IndexError::store_with_source(
                    format!("failed to create db directory: {}", parent.display()),
                    e,
                )
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            IndexError::store_with_source(format!("failed to open db at {}", path.display()), e)
        })?;

        Self::apply_schema(&conn)?;

        tracing::debug!(path = %path.display(), "page index initialized");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Connect to an in-memory database
    pub fn connect_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| IndexError::store_with_source("failed to open in-memory db", e))?;

        Self::apply_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn apply_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| IndexError::store_with_source("failed to apply schema", e))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| IndexError::internal("page store connection lock poisoned"))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Write protocol
    // ─────────────────────────────────────────────────────────────────────────────

    /// Add or update a page together with its visits and bookmark
    ///
    /// Derivation failures (unusable URL) are returned. Failures inside the
    /// write group roll the whole group back and are only logged.
    pub fn add_page(&self, req: PageAddRequest) -> Result<()> {
        let page = Page::from_request(req, now_ms())?;

        match self.commit_pages(std::slice::from_ref(&page), true) {
            Ok(()) => {
                tracing::debug!(
                    url = %page.url,
                    visits = page.visits.len(),
                    bookmarked = page.bookmark.is_some(),
                    "page added"
                );
            }
            Err(e) => {
                let err = IndexError::transaction_abort(e);
                tracing::error!(
                    url = %page.url,
                    category = err.category().as_str(),
                    error = %err,
                    "add page rolled back"
                );
            }
        }
        Ok(())
    }

    /// Update the indexed content of a page without attaching visits
    ///
    /// The page must already exist with a visit or bookmark; otherwise the
    /// write is rolled back and logged.
    pub fn add_page_terms(&self, url: &str, content: PageContent) -> Result<()> {
        let page = Page::derive(url, content)?;

        match self.commit_pages(std::slice::from_ref(&page), false) {
            Ok(()) => {
                tracing::debug!(url = %page.url, terms = page.terms.len(), "page terms updated");
            }
            Err(e) => {
                let err = IndexError::transaction_abort(e);
                tracing::error!(
                    url = %page.url,
                    category = err.category().as_str(),
                    error = %err,
                    "add page terms rolled back"
                );
            }
        }
        Ok(())
    }

    /// Write a batch of already-transformed pages in one transaction
    ///
    /// Unlike [`Self::add_page`] the error is returned, so a caller tracking
    /// progress can leave its position untouched. Every write is an upsert:
    /// replaying a batch leaves the store as a single run would.
    pub fn import_batch(&self, pages: &[Page]) -> Result<usize> {
        for page in pages {
            page.validate()?;
        }
        self.commit_pages(pages, true)?;
        Ok(pages.len())
    }

    fn commit_pages(&self, pages: &[Page], attach: bool) -> Result<()> {
        let mut conn = self.lock()?;
        let mut tx = conn
            .transaction()
            .map_err(|e| IndexError::store_with_source("failed to begin transaction", e))?;

        let now = now_ms();
        for page in pages {
            Self::write_page(&mut tx, page, attach, now)?;
        }

        tx.commit()
            .map_err(|e| IndexError::store_with_source("failed to commit transaction", e))
    }

    fn write_page(tx: &mut Transaction<'_>, page: &Page, attach: bool, now: i64) -> Result<()> {
        tx.execute(
            r#"
            INSERT INTO pages (url, hostname, title, text, bookmark, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(url) DO UPDATE SET
                hostname = excluded.hostname,
                title = COALESCE(excluded.title, pages.title),
                text = COALESCE(excluded.text, pages.text),
                bookmark = COALESCE(excluded.bookmark, pages.bookmark),
                updated_at = excluded.updated_at
            "#,
            params![
                page.url,
                page.hostname,
                page.content.title,
                page.content.text,
                page.bookmark,
                now,
            ],
        )
        .map_err(|e| IndexError::store_with_source("failed to upsert page", e))?;

        if !page.content.is_empty() {
            tx.execute("DELETE FROM page_terms WHERE url = ?1", params![page.url])
                .map_err(|e| IndexError::store_with_source("failed to clear page terms", e))?;
            let mut stmt = tx
                .prepare_cached("INSERT OR IGNORE INTO page_terms (term, url) VALUES (?1, ?2)")
                .map_err(|e| IndexError::store_with_source("failed to prepare term insert", e))?;
            for term in &page.terms {
                stmt.execute(params![term, page.url])
                    .map_err(|e| IndexError::store_with_source("failed to insert term", e))?;
            }
        }

        if let Some(uri) = &page.fav_icon_uri {
            Self::write_fav_icon_best_effort(tx, &page.hostname, uri, now);
        }

        if attach {
            let mut stmt = tx
                .prepare_cached(
                    r#"
                    INSERT INTO visits (time, url, duration_ms, scroll_px, scroll_perc,
                                        scroll_max_px, scroll_max_perc)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(time, url) DO UPDATE SET
                        duration_ms = COALESCE(excluded.duration_ms, visits.duration_ms),
                        scroll_px = COALESCE(excluded.scroll_px, visits.scroll_px),
                        scroll_perc = COALESCE(excluded.scroll_perc, visits.scroll_perc),
                        scroll_max_px = COALESCE(excluded.scroll_max_px, visits.scroll_max_px),
                        scroll_max_perc = COALESCE(excluded.scroll_max_perc, visits.scroll_max_perc)
                    "#,
                )
                .map_err(|e| IndexError::store_with_source("failed to prepare visit insert", e))?;
            for visit in &page.visits {
                let i = &visit.interaction;
                stmt.execute(params![
                    visit.time,
                    page.url,
                    i.duration_ms,
                    i.scroll_px,
                    i.scroll_perc,
                    i.scroll_max_px,
                    i.scroll_max_perc,
                ])
                .map_err(|e| IndexError::store_with_source("failed to insert visit", e))?;
            }
        }

        let anchored: bool = tx
            .query_row(
                r#"
                SELECT EXISTS(SELECT 1 FROM visits WHERE url = ?1)
                    OR (SELECT bookmark FROM pages WHERE url = ?1) IS NOT NULL
                "#,
                params![page.url],
                |row| row.get(0),
            )
            .map_err(|e| IndexError::store_with_source("failed to check page anchors", e))?;
        if !anchored {
            return Err(IndexError::validation(format!(
                "page {} would be stored without a visit or bookmark",
                page.url
            )));
        }

        Ok(())
    }

    /// Favicon upsert scoped to a savepoint; any failure rolls back only
    /// the savepoint
    fn write_fav_icon_best_effort(tx: &mut Transaction<'_>, hostname: &str, uri: &str, now: i64) {
        if let Err(e) = Self::write_fav_icon_in_savepoint(tx, hostname, uri, now) {
            tracing::warn!(
                hostname,
                category = e.category().as_str(),
                error = %e,
                "favicon not stored"
            );
        }
    }

    fn write_fav_icon_in_savepoint(
        tx: &mut Transaction<'_>,
        hostname: &str,
        uri: &str,
        now: i64,
    ) -> Result<()> {
        let record = FavIconRecord::from_data_uri(hostname, uri)?;
        let sp = tx
            .savepoint()
            .map_err(|e| IndexError::store_with_source("failed to open favicon savepoint", e))?;
        Self::upsert_fav_icon(&sp, &record, now)?;
        sp.commit()
            .map_err(|e| IndexError::store_with_source("failed to release favicon savepoint", e))
    }

    fn upsert_fav_icon(conn: &Connection, record: &FavIconRecord, now: i64) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO fav_icons (hostname, mime_type, data, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(hostname) DO UPDATE SET
                mime_type = excluded.mime_type,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
            params![record.hostname, record.mime_type, record.data, now],
        )
        .map_err(|e| IndexError::store_with_source("failed to upsert favicon", e))?;
        Ok(())
    }

    /// Attach a visit to an existing page
    ///
    /// Fails with a not-found error when no page exists for the normalized
    /// URL; a visit never creates a page.
    pub fn add_visit(&self, url: &str, time: i64) -> Result<()> {
        let normalized = normalize_url(url)?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| IndexError::store_with_source("failed to begin transaction", e))?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM pages WHERE url = ?1)",
                params![normalized],
                |row| row.get(0),
            )
            .map_err(|e| IndexError::store_with_source("failed to look up page", e))?;
        if !exists {
            return Err(IndexError::not_found(format!(
                "cannot add visit for non-existent page: {normalized}"
            )));
        }

        tx.execute(
            "INSERT OR IGNORE INTO visits (time, url) VALUES (?1, ?2)",
            params![time, normalized],
        )
        .map_err(|e| IndexError::store_with_source("failed to insert visit", e))?;

        tx.commit()
            .map_err(|e| IndexError::store_with_source("failed to commit transaction", e))?;

        tracing::debug!(url = %normalized, time, "visit added");
        Ok(())
    }

    /// Merge interaction metrics into the visit keyed by `(time, url)`
    ///
    /// Returns whether a visit matched; a missing visit is not an error.
    pub fn update_visit_interaction(
        &self,
        url: &str,
        time: i64,
        data: &VisitInteraction,
    ) -> Result<bool> {
        let normalized = normalize_url(url)?;
        let conn = self.lock()?;
        let rows = conn
            .execute(
                r#"
                UPDATE visits SET
                    duration_ms = COALESCE(?3, duration_ms),
                    scroll_px = COALESCE(?4, scroll_px),
                    scroll_perc = COALESCE(?5, scroll_perc),
                    scroll_max_px = COALESCE(?6, scroll_max_px),
                    scroll_max_perc = COALESCE(?7, scroll_max_perc)
                WHERE time = ?1 AND url = ?2
                "#,
                params![
                    time,
                    normalized,
                    data.duration_ms,
                    data.scroll_px,
                    data.scroll_perc,
                    data.scroll_max_px,
                    data.scroll_max_perc,
                ],
            )
            .map_err(|e| IndexError::store_with_source("failed to update visit", e))?;

        if rows == 0 {
            tracing::debug!(url = %normalized, time, "no visit to update");
        }
        Ok(rows > 0)
    }

    /// Store the favicon for the URL's hostname (last write wins)
    pub fn add_fav_icon(&self, url: &str, data_uri: &str) -> Result<()> {
        let transformed = transform_url(url)?;
        let record = FavIconRecord::from_data_uri(&transformed.hostname, data_uri)?;
        let conn = self.lock()?;
        Self::upsert_fav_icon(&conn, &record, now_ms())?;
        tracing::debug!(hostname = %record.hostname, "favicon stored");
        Ok(())
    }

    pub fn domain_has_fav_icon(&self, url: &str) -> Result<bool> {
        let hostname = transform_url(url)?.hostname;
        let conn = self.lock()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM fav_icons WHERE hostname = ?1)",
            params![hostname],
            |row| row.get(0),
        )
        .map_err(|e| IndexError::store_with_source("failed to look up favicon", e))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn get_fav_icon(&self, url: &str) -> Result<Option<FavIconRecord>> {
        let hostname = transform_url(url)?.hostname;
        let conn = self.lock()?;
        conn.query_row(
            "SELECT hostname, mime_type, data FROM fav_icons WHERE hostname = ?1",
            params![hostname],
            |row| {
                Ok(FavIconRecord {
                    hostname: row.get(0)?,
                    mime_type: row.get(1)?,
                    data: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| IndexError::store_with_source("failed to get favicon", e))
    }

    /// Load a page aggregate with its visits and terms
    pub fn get_page(&self, url: &str) -> Result<Option<Page>> {
        let normalized = normalize_url(url)?;
        let conn = self.lock()?;

        let row = conn
            .query_row(
                "SELECT url, hostname, title, text, bookmark FROM pages WHERE url = ?1",
                params![normalized],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| IndexError::store_with_source("failed to get page", e))?;

        let Some((url, hostname, title, text, bookmark)) = row else {
            return Ok(None);
        };

        let visits = Self::query_visits(&conn, &url)?;

        let mut stmt = conn
            .prepare("SELECT term FROM page_terms WHERE url = ?1 ORDER BY term")
            .map_err(|e| IndexError::store_with_source("failed to prepare term query", e))?;
        let terms = stmt
            .query_map(params![url], |row| row.get::<_, String>(0))
            .map_err(|e| IndexError::store_with_source("failed to query terms", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| IndexError::store_with_source("failed to read term row", e))?;

        Ok(Some(Page {
            url,
            hostname,
            content: PageContent { title, text },
            terms,
            visits,
            bookmark,
            fav_icon_uri: None,
        }))
    }

    /// Visits of a page, oldest first
    pub fn visits_for(&self, url: &str) -> Result<Vec<VisitRecord>> {
        let normalized = normalize_url(url)?;
        let conn = self.lock()?;
        Self::query_visits(&conn, &normalized)
    }

    fn query_visits(conn: &Connection, normalized: &str) -> Result<Vec<VisitRecord>> {
        let mut stmt = conn
            .prepare(
                r#"
                SELECT time, url, duration_ms, scroll_px, scroll_perc, scroll_max_px, scroll_max_perc
                FROM visits
                WHERE url = ?1
                ORDER BY time ASC
                "#,
            )
            .map_err(|e| IndexError::store_with_source("failed to prepare visit query", e))?;

        let rows = stmt
            .query_map(params![normalized], |row| {
                Ok(VisitRecord {
                    time: row.get(0)?,
                    url: row.get(1)?,
                    interaction: VisitInteraction {
                        duration_ms: row.get(2)?,
                        scroll_px: row.get(3)?,
                        scroll_perc: row.get(4)?,
                        scroll_max_px: row.get(5)?,
                        scroll_max_perc: row.get(6)?,
                    },
                })
            })
            .map_err(|e| IndexError::store_with_source("failed to query visits", e))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| IndexError::store_with_source("failed to read visit row", e))
    }

    /// Pages whose terms contain `term`, most recently seen first
    pub fn find_pages_by_term(&self, term: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT p.url, p.hostname, p.title, COALESCE(MAX(v.time), p.bookmark) AS last_seen
                FROM page_terms t
                JOIN pages p ON p.url = t.url
                LEFT JOIN visits v ON v.url = p.url
                WHERE t.term = ?1
                GROUP BY p.url
                ORDER BY last_seen DESC
                LIMIT ?2
                "#,
            )
            .map_err(|e| IndexError::store_with_source("failed to prepare term lookup", e))?;

        let rows = stmt
            .query_map(params![term, i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok(SearchHit {
                    url: row.get(0)?,
                    hostname: row.get(1)?,
                    title: row.get(2)?,
                    last_seen: row.get(3)?,
                })
            })
            .map_err(|e| IndexError::store_with_source("failed to run term lookup", e))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| IndexError::store_with_source("failed to read search row", e))
    }

    pub fn page_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM pages")
    }

    pub fn visit_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM visits")
    }

    pub fn fav_icon_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM fav_icons")
    }

    fn count(&self, sql: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row(sql, [], |row| row.get(0))
            .map_err(|e| IndexError::store_with_source("failed to count rows", e))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Migration cursor
    // ─────────────────────────────────────────────────────────────────────────────

    /// Load the persisted migration cursor, or the initial one
    pub fn load_cursor(&self) -> Result<MigrationCursor> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT position, status FROM migration_cursor WHERE id = 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| IndexError::store_with_source("failed to load migration cursor", e))?;

        let Some((position, status)) = row else {
            return Ok(MigrationCursor::default());
        };
        let status = MigrationStatus::parse(&status).ok_or_else(|| {
            IndexError::internal(format!("unknown migration status in store: {status}"))
        })?;
        Ok(MigrationCursor { position, status })
    }

    /// Move the cursor forward to `position`; it never moves back
    ///
    /// Leaves the status column alone so a concurrent status change is not
    /// overwritten. Returns the position now stored.
    pub fn advance_cursor(&self, position: i64) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row(
            r#"
            INSERT INTO migration_cursor (id, position, updated_at)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                position = MAX(migration_cursor.position, excluded.position),
                updated_at = excluded.updated_at
            RETURNING position
            "#,
            params![position, now_ms()],
            |row| row.get(0),
        )
        .map_err(|e| IndexError::store_with_source("failed to advance migration cursor", e))
    }

    /// Persist the migration status without touching the position
    ///
    /// `complete` is terminal: once stored, later status writes are ignored.
    /// Returns whether the stored status changed.
    pub fn set_cursor_status(&self, status: MigrationStatus) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                INSERT INTO migration_cursor (id, status, updated_at)
                VALUES (1, ?1, ?2)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at
                WHERE migration_cursor.status != 'complete'
                "#,
                params![status.as_str(), now_ms()],
            )
            .map_err(|e| IndexError::store_with_source("failed to save migration status", e))?;
        Ok(changed > 0)
    }
}
