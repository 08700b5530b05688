//! SQLite-backed post store.
//!
//! One connection guarded by a mutex. A write transaction holds the lock
//! from `BEGIN IMMEDIATE` until commit or rollback, so concurrent ingests
//! are serialized here rather than in the pipeline.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use tracing::{error, info, warn};

use super::migrations::apply_migrations;
use super::{ContentStore, RecordQuery, StoreError, StoreResult, StoreTransaction};
use crate::domain::{Association, AssociationKind, ContentRecord};

/// SQLite implementation of [`ContentStore`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply pending migrations.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let started_at = Instant::now();

        let conn = Connection::open(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to open database");
            e
        })?;
        let store = Self::from_connection(conn)?;

        info!(
            path = %path.display(),
            duration_ms = started_at.elapsed().as_millis() as u64,
            "Database ready"
        );
        Ok(store)
    }

    /// Open a private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection, configuring it and applying migrations.
    pub fn from_connection(mut conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        apply_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ContentStore for SqliteStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE;")?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }

    fn list_records(&self, query: &RecordQuery) -> StoreResult<Vec<ContentRecord>> {
        let conn = self.lock()?;

        let mut sql = String::from(
            "SELECT
                p.id_post,
                p.date_created,
                p.date_updated,
                p.title,
                p.author,
                p.content,
                p.original_filename
             FROM post p
             WHERE 1 = 1",
        );
        let mut bind_values: Vec<Value> = Vec::new();

        if let Some(id) = query.id {
            sql.push_str(" AND p.id_post = ?");
            bind_values.push(Value::Integer(id));
        }
        if let Some(author) = query.author.as_ref() {
            sql.push_str(" AND p.author = ?");
            bind_values.push(Value::Text(author.clone()));
        }
        if let Some(from) = query.date_from.as_ref() {
            sql.push_str(" AND p.date_created >= ?");
            bind_values.push(Value::Text(format_timestamp(from)));
        }
        if let Some(to) = query.date_to.as_ref() {
            sql.push_str(" AND p.date_created <= ?");
            bind_values.push(Value::Text(format_timestamp(to)));
        }
        push_membership_filter(
            &mut sql,
            &mut bind_values,
            AssociationKind::Category,
            &query.categories,
        );
        push_membership_filter(&mut sql, &mut bind_values, AssociationKind::Tag, &query.tags);

        sql.push_str(" ORDER BY p.id_post ASC LIMIT ? OFFSET ?");
        bind_values.push(Value::Integer(i64::from(query.limit())));
        bind_values.push(Value::Integer(i64::from(query.offset())));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(bind_values), |row| {
                Ok(StoredRow {
                    id: row.get(0)?,
                    date_created: row.get(1)?,
                    date_updated: row.get(2)?,
                    title: row.get(3)?,
                    author: row.get(4)?,
                    content: row.get(5)?,
                    original_filename: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let associations = load_associations(&conn, row.id)?;
            records.push(row.into_record(&associations)?);
        }

        Ok(records)
    }

    fn associations(&self, record_id: i64) -> StoreResult<Vec<Association>> {
        let conn = self.lock()?;
        load_associations(&conn, record_id)
    }
}

/// Write transaction holding the connection lock until it finishes
struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn insert_record(&mut self, record: &ContentRecord) -> StoreResult<i64> {
        let created = record
            .created_at
            .ok_or_else(|| StoreError::InvalidData("record has no creation timestamp".into()))?;
        let updated = record
            .updated_at
            .ok_or_else(|| StoreError::InvalidData("record has no update timestamp".into()))?;

        self.conn.execute(
            "INSERT INTO post (
                date_created,
                date_updated,
                title,
                author,
                content,
                original_filename
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                format_timestamp(&created),
                format_timestamp(&updated),
                record.title,
                record.author,
                record.content,
                record.original_filename,
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    fn insert_association(&mut self, association: &Association) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO {} (id_post, name) VALUES (?1, ?2);",
            association.kind.table()
        );
        self.conn
            .execute(&sql, params![association.record_id, association.name])?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT;")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK;")?;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK;") {
            warn!(error = %e, "Rollback failed");
        }
    }
}

struct StoredRow {
    id: i64,
    date_created: String,
    date_updated: String,
    title: String,
    author: String,
    content: String,
    original_filename: String,
}

impl StoredRow {
    fn into_record(self, associations: &[Association]) -> StoreResult<ContentRecord> {
        let join = |kind: AssociationKind| {
            associations
                .iter()
                .filter(|a| a.kind == kind)
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };

        Ok(ContentRecord {
            id: Some(self.id),
            created_at: Some(parse_timestamp(&self.date_created)?),
            updated_at: Some(parse_timestamp(&self.date_updated)?),
            title: self.title,
            author: self.author,
            content: self.content,
            categories: join(AssociationKind::Category),
            tags: join(AssociationKind::Tag),
            original_filename: self.original_filename,
        })
    }
}

fn push_membership_filter(
    sql: &mut String,
    bind_values: &mut Vec<Value>,
    kind: AssociationKind,
    names: &[String],
) {
    let names: Vec<&str> = names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .collect();
    if names.is_empty() {
        return;
    }

    let placeholders = vec!["?"; names.len()].join(", ");
    sql.push_str(&format!(
        " AND EXISTS (
            SELECT 1 FROM {table} a
            WHERE a.id_post = p.id_post
              AND a.name IN ({placeholders})
        )",
        table = kind.table(),
    ));
    bind_values.extend(names.into_iter().map(|name| Value::Text(name.to_string())));
}

fn load_associations(conn: &Connection, record_id: i64) -> StoreResult<Vec<Association>> {
    let mut associations = Vec::new();
    for kind in [AssociationKind::Category, AssociationKind::Tag] {
        let mut stmt = conn.prepare(&format!(
            "SELECT name FROM {} WHERE id_post = ?1 ORDER BY rowid ASC;",
            kind.table()
        ))?;
        let names = stmt
            .query_map([record_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        associations.extend(names.into_iter().map(|name| Association {
            record_id,
            kind,
            name,
        }));
    }
    Ok(associations)
}

/// Stored as RFC 3339 UTC so text order is chronological order
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{}': {}", raw, e)))
}
