use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, Transaction, ffi, params};
use tracing::{debug, info};

use crate::{
    error::IntegrityError,
    payload::ExtractedEntityPayload,
    store::{
        ContentStore, ContentSummary, RegistryStore, Rule, StoreError, ViewRegistryEntry, ViewStore,
        schema::{self, BASE_TABLES},
    },
};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern compiles"));

/// Read-only connections opened beside the writer of a file-backed store.
const READERS: usize = 4;

/// SQLite-backed implementation of every store seam.
///
/// Writes go through one connection behind a mutex. A file-backed store runs
/// in WAL mode and serves reads from a few read-only connections, so lookups
/// and row counts never queue behind a long write. An in-memory database
/// cannot be shared between connections and uses the writer for everything.
/// Each call runs on the blocking pool so it never parks an async worker.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    writer: Arc<Mutex<Connection>>,
    readers: Arc<Vec<Mutex<Connection>>>,
    next_reader: Arc<AtomicUsize>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(map_err)?;
        let journal: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(map_err)?;
        let writer = Self::init_writer(conn)?;

        let readers = (0..READERS)
            .map(|_| {
                let reader = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map_err(map_err)?;
                reader.busy_timeout(Duration::from_secs(5)).map_err(map_err)?;
                Ok(Mutex::new(reader))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        info!(path = %path.display(), %journal, readers = readers.len(), "opened sqlite store");
        Ok(Self::from_parts(writer, readers))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let writer = Self::init_writer(Connection::open_in_memory().map_err(map_err)?)?;
        Ok(Self::from_parts(writer, Vec::new()))
    }

    fn init_writer(conn: Connection) -> Result<Connection, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON").map_err(map_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(map_err)?;
        schema::migrate(&conn).map_err(map_err)?;
        Ok(conn)
    }

    fn from_parts(writer: Connection, readers: Vec<Mutex<Connection>>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(readers),
            next_reader: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn with_writer<F, T>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Database(format!("{op}: connection mutex poisoned")))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Database(format!("{op}: blocking task failed: {e}")))?
    }

    /// Run a read on the next reader in turn, or on the writer when there are none.
    async fn with_reader<F, T>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        if self.readers.is_empty() {
            return self.with_writer(op, move |conn| f(conn)).await;
        }
        let readers = Arc::clone(&self.readers);
        let slot = self.next_reader.fetch_add(1, Ordering::Relaxed) % readers.len();
        tokio::task::spawn_blocking(move || {
            let guard = readers[slot]
                .lock()
                .map_err(|_| StoreError::Database(format!("{op}: reader mutex poisoned")))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Database(format!("{op}: blocking task failed: {e}")))?
    }
}

/// Constraint failures become integrity errors; everything else is a database error.
fn map_err(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, message) = &err {
        let message = message.clone().unwrap_or_else(|| code.to_string());
        match code.extended_code {
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                return IntegrityError::UniqueViolation(message).into();
            }
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY => return IntegrityError::ForeignKeyViolation(message).into(),
            ffi::SQLITE_CONSTRAINT_CHECK | ffi::SQLITE_CONSTRAINT_NOTNULL => {
                return IntegrityError::CheckViolation(message).into();
            }
            _ => {}
        }
    }
    StoreError::Database(err.to_string())
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<Rule> {
    Ok(Rule {
        id: row.get(0)?,
        rule_code: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        sql: row.get(4)?,
        created_at: parse_ts(row.get(5)?)?,
        updated_at: parse_ts(row.get(6)?)?,
    })
}

fn view_from_row(row: &Row<'_>) -> rusqlite::Result<ViewRegistryEntry> {
    Ok(ViewRegistryEntry {
        id: row.get(0)?,
        table_name: row.get(1)?,
        rule_id: row.get(2)?,
        summary: row.get(3)?,
        created_at: parse_ts(row.get(4)?)?,
        updated_at: parse_ts(row.get(5)?)?,
    })
}

const RULE_COLUMNS: &str = "id, rule_code, name, description, sql, created_at, updated_at";
const VIEW_COLUMNS: &str = "id, table_name, rule_id, summary, created_at, updated_at";

#[async_trait]
impl RegistryStore for SqliteStore {
    #[tracing::instrument(name = "store_upsert_rule", skip(self, name, description, sql))]
    async fn upsert_rule(&self, rule_code: &str, name: &str, description: &str, sql: &str) -> Result<i64, StoreError> {
        let rule_code = rule_code.trim().to_string();
        if rule_code.is_empty() {
            return Err(StoreError::InvalidInput("rule code is empty".into()));
        }
        let (name, description, sql) = (name.to_string(), description.to_string(), sql.to_string());
        self.with_writer("upsert_rule", move |conn| {
            conn.query_row(
                "INSERT INTO rules (rule_code, name, description, sql, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(rule_code) DO UPDATE SET
                     name = excluded.name,
                     description = excluded.description,
                     sql = excluded.sql,
                     updated_at = excluded.updated_at
                 RETURNING id",
                params![rule_code, name, description, sql, now()],
                |row| row.get(0),
            )
            .map_err(map_err)
        })
        .await
    }

    #[tracing::instrument(name = "store_upsert_view", skip(self, summary))]
    async fn upsert_view(&self, table_name: &str, rule_id: i64, summary: &str) -> Result<i64, StoreError> {
        let table_name = table_name.trim().to_string();
        if table_name.is_empty() {
            return Err(StoreError::InvalidInput("view table name is empty".into()));
        }
        let summary = summary.to_string();
        self.with_writer("upsert_view", move |conn| {
            conn.query_row(
                "INSERT INTO views_registry (table_name, rule_id, summary, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(table_name) DO UPDATE SET
                     rule_id = excluded.rule_id,
                     summary = excluded.summary,
                     updated_at = excluded.updated_at
                 RETURNING id",
                params![table_name, rule_id, summary, now()],
                |row| row.get(0),
            )
            .map_err(map_err)
        })
        .await
    }

    async fn rule_by_code(&self, rule_code: &str) -> Result<Option<Rule>, StoreError> {
        let rule_code = rule_code.trim().to_string();
        self.with_reader("rule_by_code", move |conn| {
            conn.query_row(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE rule_code = ?1"),
                params![rule_code],
                rule_from_row,
            )
            .optional()
            .map_err(map_err)
        })
        .await
    }

    async fn view_by_table(&self, table_name: &str) -> Result<Option<ViewRegistryEntry>, StoreError> {
        let table_name = table_name.trim().to_string();
        self.with_reader("view_by_table", move |conn| {
            conn.query_row(
                &format!("SELECT {VIEW_COLUMNS} FROM views_registry WHERE table_name = ?1"),
                params![table_name],
                view_from_row,
            )
            .optional()
            .map_err(map_err)
        })
        .await
    }

    async fn list_rules(&self) -> Result<Vec<Rule>, StoreError> {
        self.with_reader("list_rules", |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {RULE_COLUMNS} FROM rules ORDER BY id")).map_err(map_err)?;
            let rows = stmt.query_map([], rule_from_row).map_err(map_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)
        })
        .await
    }

    async fn list_views(&self) -> Result<Vec<ViewRegistryEntry>, StoreError> {
        self.with_reader("list_views", |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {VIEW_COLUMNS} FROM views_registry ORDER BY id")).map_err(map_err)?;
            let rows = stmt.query_map([], view_from_row).map_err(map_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)
        })
        .await
    }
}

#[async_trait]
impl ViewStore for SqliteStore {
    #[tracing::instrument(name = "store_materialize_view", skip(self, sql))]
    async fn materialize_view(&self, table_name: &str, sql: &str) -> Result<u64, StoreError> {
        if !IDENTIFIER.is_match(table_name) {
            return Err(StoreError::InvalidInput(format!("`{table_name}` is not a valid view name")));
        }
        if BASE_TABLES.iter().any(|t| t.eq_ignore_ascii_case(table_name)) {
            return Err(StoreError::InvalidInput(format!("`{table_name}` is a reserved table name")));
        }
        let view = table_name.to_string();
        let table_name = table_name.to_string();
        let sql = sql.trim().trim_end_matches(';').trim_end().to_string();
        if has_unquoted_terminator(&sql) {
            return Err(StoreError::InvalidInput("view SQL must be a single statement".into()));
        }

        self.with_writer("materialize_view", move |conn| {
            {
                let stmt = conn.prepare(&sql).map_err(|e| match e {
                    rusqlite::Error::MultipleStatement => {
                        StoreError::InvalidInput("view SQL must be a single statement".into())
                    }
                    other => StoreError::InvalidInput(format!("view SQL does not compile: {other}")),
                })?;
                if !stmt.readonly() {
                    return Err(StoreError::InvalidInput("view SQL must be read-only".into()));
                }
            }

            ensure_view_or_absent(conn, &table_name)?;

            let tx = conn.transaction().map_err(map_err)?;
            tx.execute(&format!("DROP VIEW IF EXISTS \"{table_name}\""), []).map_err(map_err)?;
            tx.execute(&format!("CREATE VIEW \"{table_name}\" AS {sql}"), []).map_err(map_err)?;
            tx.commit().map_err(map_err)
        })
        .await?;

        // counted outside the write lock; the scan can be long
        let counted = view.clone();
        let rows: i64 = self
            .with_reader("count_view", move |conn| {
                conn.query_row(&format!("SELECT COUNT(*) FROM \"{counted}\""), [], |row| row.get(0))
                    .map_err(map_err)
            })
            .await?;
        debug!(%view, rows, "view materialized");
        Ok(rows.max(0) as u64)
    }

    #[tracing::instrument(name = "store_drop_view", skip(self))]
    async fn drop_view(&self, table_name: &str) -> Result<bool, StoreError> {
        if !IDENTIFIER.is_match(table_name) {
            return Err(StoreError::InvalidInput(format!("`{table_name}` is not a valid view name")));
        }
        let table_name = table_name.to_string();
        self.with_writer("drop_view", move |conn| {
            if !ensure_view_or_absent(conn, &table_name)? {
                return Ok(false);
            }
            conn.execute(&format!("DROP VIEW IF EXISTS \"{table_name}\""), []).map_err(map_err)?;
            Ok(true)
        })
        .await
    }
}

/// True when `name` is an existing view, false when nothing has that name.
/// Any other kind of object is an error.
fn ensure_view_or_absent(conn: &Connection, name: &str) -> Result<bool, StoreError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT type FROM sqlite_master WHERE name = ?1 COLLATE NOCASE",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_err)?;
    match existing.as_deref() {
        None => Ok(false),
        Some("view") => Ok(true),
        Some(_) => Err(StoreError::InvalidInput(format!("`{name}` already names a non-view object"))),
    }
}

/// A `;` outside string literals and quoted identifiers.
fn has_unquoted_terminator(sql: &str) -> bool {
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match (quote, c) {
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '[') => quote = Some(']'),
            (None, ';') => return true,
            (Some(q), c) if c == q => quote = None,
            _ => {}
        }
    }
    false
}

fn upsert_named(
    tx: &Transaction<'_>,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<i64, StoreError> {
    tx.query_row(sql, params, |row| row.get(0)).map_err(map_err)
}

fn resolve(ids: &HashMap<String, i64>, collection: &str, name: &str) -> Result<i64, StoreError> {
    ids.get(name.trim()).copied().ok_or_else(|| {
        IntegrityError::ForeignKeyViolation(format!("link references {collection} \"{name}\" missing from the payload"))
            .into()
    })
}

fn write_content(tx: &Transaction<'_>, payload: &ExtractedEntityPayload) -> Result<ContentSummary, StoreError> {
    let ts = now();
    let mut summary = ContentSummary::default();

    let mut posts = HashMap::new();
    for post in &payload.posts {
        let name = post.name.trim();
        let id = upsert_named(
            tx,
            "INSERT INTO posts (name, url, source, published, summary, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(name) DO UPDATE SET
                 url = COALESCE(excluded.url, posts.url),
                 source = COALESCE(excluded.source, posts.source),
                 published = COALESCE(excluded.published, posts.published),
                 summary = COALESCE(excluded.summary, posts.summary),
                 updated_at = excluded.updated_at
             RETURNING id",
            params![name, post.url, post.source, post.published, post.summary, ts],
        )?;
        posts.insert(name.to_string(), id);
    }
    summary.posts = posts.len();

    let mut orgs = HashMap::new();
    for org in &payload.organizations {
        let name = org.name.trim();
        let id = upsert_named(
            tx,
            "INSERT INTO organizations (name, url, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 url = COALESCE(excluded.url, organizations.url),
                 description = COALESCE(excluded.description, organizations.description),
                 updated_at = excluded.updated_at
             RETURNING id",
            params![name, org.url, org.description, ts],
        )?;
        orgs.insert(name.to_string(), id);
    }
    summary.organizations = orgs.len();

    let mut guests = HashMap::new();
    for guest in &payload.guests {
        let name = guest.name.trim();
        let id = upsert_named(
            tx,
            "INSERT INTO guests (name, organization, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 organization = COALESCE(excluded.organization, guests.organization),
                 description = COALESCE(excluded.description, guests.description),
                 updated_at = excluded.updated_at
             RETURNING id",
            params![name, guest.organization, guest.description, ts],
        )?;
        guests.insert(name.to_string(), id);
    }
    summary.guests = guests.len();

    let mut patterns = HashMap::new();
    for pattern in &payload.patterns {
        let name = pattern.name.trim();
        let id = upsert_named(
            tx,
            "INSERT INTO patterns (name, kind, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 kind = excluded.kind,
                 description = COALESCE(excluded.description, patterns.description),
                 updated_at = excluded.updated_at
             RETURNING id",
            params![name, pattern.kind.as_str(), pattern.description, ts],
        )?;
        patterns.insert(name.to_string(), id);
    }
    summary.patterns = patterns.len();

    let mut link = |sql: &str, pattern_name: &str, target: &HashMap<String, i64>, collection: &str, name: &str| {
        let pattern_id = resolve(&patterns, "patterns", pattern_name)?;
        let target_id = resolve(target, collection, name)?;
        let added = tx.execute(sql, params![pattern_id, target_id]).map_err(map_err)?;
        summary.links += 1;
        summary.links_added += added;
        Ok::<(), StoreError>(())
    };

    for l in &payload.pattern_post_link {
        link(
            "INSERT INTO pattern_post_link (pattern_id, post_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            &l.pattern_name,
            &posts,
            "posts",
            &l.post_name,
        )?;
    }
    for l in &payload.pattern_org_link {
        link(
            "INSERT INTO pattern_org_link (pattern_id, org_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            &l.pattern_name,
            &orgs,
            "organizations",
            &l.org_name,
        )?;
    }
    for l in &payload.pattern_guest_link {
        link(
            "INSERT INTO pattern_guest_link (pattern_id, guest_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            &l.pattern_name,
            &guests,
            "guests",
            &l.guest_name,
        )?;
    }

    Ok(summary)
}

fn count(conn: &Connection, table: &str) -> Result<usize, StoreError> {
    let n: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .map_err(map_err)?;
    Ok(n.max(0) as usize)
}

#[async_trait]
impl ContentStore for SqliteStore {
    #[tracing::instrument(name = "store_upsert_content", skip(self, document))]
    async fn upsert_content(&self, document: &str) -> Result<ContentSummary, StoreError> {
        let payload: ExtractedEntityPayload = serde_json::from_str(document)
            .map_err(|e| StoreError::InvalidInput(format!("content document is not a valid payload: {e}")))?;

        self.with_writer("upsert_content", move |conn| {
            let tx = conn.transaction().map_err(map_err)?;
            // dropping `tx` on error rolls everything back
            let summary = write_content(&tx, &payload)?;
            tx.commit().map_err(map_err)?;
            Ok(summary)
        })
        .await
    }

    async fn content_counts(&self) -> Result<ContentSummary, StoreError> {
        self.with_reader("content_counts", |conn| {
            let links = count(conn, "pattern_post_link")? + count(conn, "pattern_org_link")? + count(conn, "pattern_guest_link")?;
            Ok(ContentSummary {
                posts: count(conn, "posts")?,
                organizations: count(conn, "organizations")?,
                guests: count(conn, "guests")?,
                patterns: count(conn, "patterns")?,
                links,
                links_added: 0,
            })
        })
        .await
    }
}
