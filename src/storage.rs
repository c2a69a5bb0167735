//! Relational storage collaborator
//!
//! The rest of the crate talks to the database only through [`Store`]: fetch
//! one row, run one statement, apply a schema, close. [`SqliteStore`] is the
//! production implementation.

use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;

pub use rusqlite::types::Value as SqlValue;

pub type Row = Vec<SqlValue>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(rusqlite::Error),

    /// UNIQUE / FOREIGN KEY / NOT NULL violations
    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("unexpected column value: {0}")]
    Decode(String),

    #[error("store is closed")]
    Closed,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, msg) if f.code == ErrorCode::ConstraintViolation => {
                StoreError::Constraint(msg.clone().unwrap_or_else(|| f.to_string()))
            }
            _ => StoreError::Sqlite(e),
        }
    }
}

/// Result of a data-modifying statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    pub last_insert_id: i64,
    pub changes: usize,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// First row of `query`, if any
    async fn get_row(&self, query: &str, params: &[SqlValue]) -> Result<Option<Row>, StoreError>;

    async fn run(&self, statement: &str, params: &[SqlValue]) -> Result<RunResult, StoreError>;

    async fn exec_schema(&self, ddl: &str) -> Result<(), StoreError>;

    /// Every later call fails with `StoreError::Closed`
    async fn close(&self) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL so readers never block the single writer
        // Note: PRAGMA returns the new mode, so we use query_row instead of execute
        let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(SqliteStore {
            conn: Mutex::new(Some(conn)),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_row(&self, query: &str, params: &[SqlValue]) -> Result<Option<Row>, StoreError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let mut stmt = conn.prepare_cached(query)?;
        let columns = stmt.column_count();
        let row = stmt
            .query_row(params_from_iter(params.iter()), |row| {
                (0..columns)
                    .map(|i| row.get::<_, SqlValue>(i))
                    .collect::<rusqlite::Result<Row>>()
            })
            .optional()?;
        Ok(row)
    }

    async fn run(&self, statement: &str, params: &[SqlValue]) -> Result<RunResult, StoreError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let mut stmt = conn.prepare_cached(statement)?;
        let changes = stmt.execute(params_from_iter(params.iter()))?;
        Ok(RunResult {
            last_insert_id: conn.last_insert_rowid(),
            changes,
        })
    }

    async fn exec_schema(&self, ddl: &str) -> Result<(), StoreError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        conn.execute_batch(ddl)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| StoreError::from(e))?;
        }
        Ok(())
    }
}

/// Column `idx` of `row` as an integer
pub fn int_at(row: &Row, idx: usize) -> Result<i64, StoreError> {
    match row.get(idx) {
        Some(SqlValue::Integer(v)) => Ok(*v),
        other => Err(StoreError::Decode(format!(
            "column {idx}: expected integer, got {other:?}"
        ))),
    }
}

/// Column `idx` of `row` as text
pub fn text_at(row: &Row, idx: usize) -> Result<String, StoreError> {
    match row.get(idx) {
        Some(SqlValue::Text(v)) => Ok(v.clone()),
        other => Err(StoreError::Decode(format!(
            "column {idx}: expected text, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_table() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .exec_schema(
                "CREATE TABLE items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE
                );",
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_run_reports_insert_id_and_changes() {
        let store = store_with_table().await;
        let first = store
            .run("INSERT INTO items (name) VALUES (?1)", &[SqlValue::Text("a".into())])
            .await
            .unwrap();
        let second = store
            .run("INSERT INTO items (name) VALUES (?1)", &[SqlValue::Text("b".into())])
            .await
            .unwrap();
        assert_eq!(first.changes, 1);
        assert_eq!(second.last_insert_id, first.last_insert_id + 1);

        let deleted = store
            .run("DELETE FROM items WHERE id = ?1", &[SqlValue::Integer(first.last_insert_id)])
            .await
            .unwrap();
        assert_eq!(deleted.changes, 1);
    }

    #[tokio::test]
    async fn test_get_row_present_and_absent() {
        let store = store_with_table().await;
        store
            .run("INSERT INTO items (name) VALUES (?1)", &[SqlValue::Text("a".into())])
            .await
            .unwrap();

        let row = store
            .get_row("SELECT id, name FROM items WHERE name = ?1", &[SqlValue::Text("a".into())])
            .await
            .unwrap()
            .expect("row");
        assert_eq!(int_at(&row, 0).unwrap(), 1);
        assert_eq!(text_at(&row, 1).unwrap(), "a");
        assert!(text_at(&row, 0).is_err());

        let missing = store
            .get_row("SELECT id FROM items WHERE name = ?1", &[SqlValue::Text("zz".into())])
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_unique_violation_is_a_constraint_error() {
        let store = store_with_table().await;
        let params = [SqlValue::Text("dup".into())];
        store.run("INSERT INTO items (name) VALUES (?1)", &params).await.unwrap();
        let err = store
            .run("INSERT INTO items (name) VALUES (?1)", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_closed_store_refuses_work() {
        let store = store_with_table().await;
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.get_row("SELECT 1", &[]).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.exec_schema("SELECT 1;").await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite3");
        let store = SqliteStore::open(&path).unwrap();
        store.exec_schema("CREATE TABLE t (x INTEGER);").await.unwrap();
        store.close().await.unwrap();
        assert!(path.exists());

        let reopened = SqliteStore::open(&path).unwrap();
        let row = reopened
            .get_row("SELECT COUNT(*) FROM t", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(int_at(&row, 0).unwrap(), 0);
    }
}
