//! SQLite-backed structured record store.

use crate::adapters::{RowFilter, StructuredQuery};
use crate::types::Row;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use sift_core::{AppError, AppResult};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Structured records keyed by entity name.
///
/// `rusqlite::Connection` is blocking, so every call runs on the blocking
/// thread pool.
#[derive(Clone)]
pub struct SqliteStructuredStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStructuredStore {
    /// Open (and create if needed) a store at `db_path`.
    pub fn open(db_path: &Path) -> AppResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Storage(format!("Failed to create store directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| AppError::Storage(format!("Failed to open SQLite store: {}", e)))?;
        tracing::debug!("Opened SQLite store at {:?}", db_path);
        Self::init(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Storage(format!("Failed to open SQLite store: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                document_id TEXT,
                name TEXT NOT NULL,
                fields TEXT NOT NULL,
                updated_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_records_name ON records(name);
            CREATE INDEX IF NOT EXISTS idx_records_document ON records(document_id);
            "#,
        )
        .map_err(|e| AppError::Storage(format!("Failed to create tables: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace a row. The entity name is taken from the `name`
    /// field, falling back to `title` and then the row id.
    pub fn insert(&self, row: &Row) -> AppResult<()> {
        let name = row
            .fields
            .get("name")
            .or_else(|| row.fields.get("title"))
            .cloned()
            .unwrap_or_else(|| row.id.clone());
        let fields = serde_json::to_string(&row.fields)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO records (id, document_id, name, fields, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.id,
                row.document_id,
                name,
                fields,
                row.updated_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| AppError::Storage(format!("Failed to insert record: {}", e)))?;
        Ok(())
    }

    pub fn count(&self) -> AppResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .map_err(|e| AppError::Storage(format!("Failed to count records: {}", e)))?;
        Ok(count as usize)
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Storage("SQLite connection lock poisoned".to_string()))
    }

    fn query_sync(&self, filter: &RowFilter) -> AppResult<Vec<Row>> {
        let entities: Vec<String> = filter
            .entities
            .iter()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();

        // Structured lookups are by entity; without one there is nothing to ask.
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT id, document_id, fields, updated_at FROM records WHERE (",
        );
        let mut values: Vec<String> = Vec::new();
        for (i, entity) in entities.iter().enumerate() {
            if i > 0 {
                sql.push_str(" OR ");
            }
            sql.push_str("instr(lower(name), ?) > 0");
            values.push(entity.clone());
        }
        sql.push(')');
        push_document_scope(&mut sql, &mut values, &filter.document_ids);
        sql.push_str(" ORDER BY name, id");
        if filter.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", filter.limit));
        }

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                let fields_json: String = row.get(2)?;
                let updated_at: Option<String> = row.get(3)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    fields_json,
                    updated_at,
                ))
            })
            .map_err(|e| AppError::Storage(format!("Failed to query records: {}", e)))?;

        let mut results = Vec::new();
        for row in rows {
            let (id, document_id, fields_json, updated_at) =
                row.map_err(|e| AppError::Storage(format!("Failed to read record: {}", e)))?;
            let fields: BTreeMap<String, String> = serde_json::from_str(&fields_json)?;
            results.push(Row {
                id,
                document_id,
                fields,
                updated_at: updated_at.as_deref().and_then(parse_timestamp),
            });
        }
        Ok(results)
    }

    fn vocabulary_sync(&self, document_ids: &BTreeSet<String>) -> AppResult<Vec<String>> {
        let mut sql = String::from("SELECT DISTINCT name FROM records WHERE 1 = 1");
        let mut values: Vec<String> = Vec::new();
        push_document_scope(&mut sql, &mut values, document_ids);
        sql.push_str(" ORDER BY name");

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;
        let names = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))
            .map_err(|e| AppError::Storage(format!("Failed to query vocabulary: {}", e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to read vocabulary: {}", e)))?;
        Ok(names)
    }
}

fn push_document_scope(sql: &mut String, values: &mut Vec<String>, document_ids: &BTreeSet<String>) {
    if document_ids.is_empty() {
        return;
    }
    let placeholders = vec!["?"; document_ids.len()].join(", ");
    sql.push_str(&format!(" AND document_id IN ({})", placeholders));
    values.extend(document_ids.iter().cloned());
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

async fn run_blocking<T, F>(store: &SqliteStructuredStore, f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce(&SqliteStructuredStore) -> AppResult<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| AppError::Storage(format!("SQLite task failed: {}", e)))?
}

#[async_trait::async_trait]
impl StructuredQuery for SqliteStructuredStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn query(&self, filter: &RowFilter) -> AppResult<Vec<Row>> {
        let filter = filter.clone();
        run_blocking(self, move |store| store.query_sync(&filter)).await
    }

    async fn vocabulary(&self, document_ids: &BTreeSet<String>) -> AppResult<Vec<String>> {
        let document_ids = document_ids.clone();
        run_blocking(self, move |store| store.vocabulary_sync(&document_ids)).await
    }
}
