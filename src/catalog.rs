//! Backup catalog: users, tracked files and stored files
//!
//! A tracked file is a client path under backup; a stored file is the
//! server-side copy of it. The ingestion pipeline keeps the invariant that no
//! tracked row survives without its stored row.

use std::sync::Arc;

use crate::storage::{int_at, text_at, Row, SqlValue, Store, StoreError};

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    secretkey TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tracked_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    client_path TEXT NOT NULL,
    UNIQUE (owner_id, client_path)
);

CREATE TABLE IF NOT EXISTS stored_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tracked_file_id INTEGER NOT NULL REFERENCES tracked_files(id) ON DELETE CASCADE,
    server_path TEXT NOT NULL,
    added_at TEXT NOT NULL,
    content_hash TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stored_files_tracked ON stored_files(tracked_file_id);
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub id: i64,
    pub owner_id: i64,
    pub client_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub id: i64,
    pub tracked_file_id: i64,
    pub server_path: String,
    /// RFC 3339 timestamp
    pub added_at: String,
    /// Lowercase hex digest of the content
    pub content_hash: String,
}

fn parse_tracked_row(row: &Row) -> Result<TrackedFile, StoreError> {
    Ok(TrackedFile {
        id: int_at(row, 0)?,
        owner_id: int_at(row, 1)?,
        client_path: text_at(row, 2)?,
    })
}

fn parse_stored_row(row: &Row) -> Result<StoredFile, StoreError> {
    Ok(StoredFile {
        id: int_at(row, 0)?,
        tracked_file_id: int_at(row, 1)?,
        server_path: text_at(row, 2)?,
        added_at: text_at(row, 3)?,
        content_hash: text_at(row, 4)?,
    })
}

#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn Store>,
}

impl Catalog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Catalog { store }
    }

    /// Create any missing tables. Safe to run on every start.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        self.store.exec_schema(SCHEMA).await
    }

    pub async fn find_tracked(
        &self,
        owner_id: i64,
        client_path: &str,
    ) -> Result<Option<TrackedFile>, StoreError> {
        let row = self
            .store
            .get_row(
                "SELECT id, owner_id, client_path FROM tracked_files
                 WHERE owner_id = ?1 AND client_path = ?2",
                &[SqlValue::Integer(owner_id), SqlValue::Text(client_path.to_string())],
            )
            .await?;
        row.as_ref().map(parse_tracked_row).transpose()
    }

    /// Insert a tracked file; returns its id.
    /// A second row for the same owner and path is a `StoreError::Constraint`.
    pub async fn insert_tracked(&self, owner_id: i64, client_path: &str) -> Result<i64, StoreError> {
        let res = self
            .store
            .run(
                "INSERT INTO tracked_files (owner_id, client_path) VALUES (?1, ?2)",
                &[SqlValue::Integer(owner_id), SqlValue::Text(client_path.to_string())],
            )
            .await?;
        Ok(res.last_insert_id)
    }

    /// Returns whether a row was removed
    pub async fn delete_tracked(&self, id: i64) -> Result<bool, StoreError> {
        let res = self
            .store
            .run("DELETE FROM tracked_files WHERE id = ?1", &[SqlValue::Integer(id)])
            .await?;
        Ok(res.changes > 0)
    }

    pub async fn insert_stored(
        &self,
        tracked_file_id: i64,
        server_path: &str,
        added_at: &str,
        content_hash: &str,
    ) -> Result<i64, StoreError> {
        let res = self
            .store
            .run(
                "INSERT INTO stored_files (tracked_file_id, server_path, added_at, content_hash)
                 VALUES (?1, ?2, ?3, ?4)",
                &[
                    SqlValue::Integer(tracked_file_id),
                    SqlValue::Text(server_path.to_string()),
                    SqlValue::Text(added_at.to_string()),
                    SqlValue::Text(content_hash.to_string()),
                ],
            )
            .await?;
        Ok(res.last_insert_id)
    }

    pub async fn stored_for(&self, tracked_file_id: i64) -> Result<Option<StoredFile>, StoreError> {
        let row = self
            .store
            .get_row(
                "SELECT id, tracked_file_id, server_path, added_at, content_hash
                 FROM stored_files WHERE tracked_file_id = ?1
                 ORDER BY id DESC LIMIT 1",
                &[SqlValue::Integer(tracked_file_id)],
            )
            .await?;
        row.as_ref().map(parse_stored_row).transpose()
    }

    /// (tracked, stored) row counts
    pub async fn counts(&self) -> Result<(i64, i64), StoreError> {
        let row = self
            .store
            .get_row(
                "SELECT (SELECT COUNT(*) FROM tracked_files), (SELECT COUNT(*) FROM stored_files)",
                &[],
            )
            .await?
            .ok_or_else(|| StoreError::Decode("count query returned no row".into()))?;
        Ok((int_at(&row, 0)?, int_at(&row, 1)?))
    }

    pub async fn user_secret(&self, username: &str) -> Result<Option<String>, StoreError> {
        let row = self
            .store
            .get_row(
                "SELECT secretkey FROM users WHERE username = ?1",
                &[SqlValue::Text(username.to_string())],
            )
            .await?;
        row.as_ref().map(|r| text_at(r, 0)).transpose()
    }

    /// Create the user or replace its secret
    pub async fn upsert_user(&self, username: &str, secretkey: &str) -> Result<(), StoreError> {
        self.store
            .run(
                "INSERT INTO users (username, secretkey) VALUES (?1, ?2)
                 ON CONFLICT(username) DO UPDATE SET secretkey = excluded.secretkey",
                &[
                    SqlValue::Text(username.to_string()),
                    SqlValue::Text(secretkey.to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}
