//! Fixtures shared by unit tests across modules

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::auth::StaticCredentials;
use crate::catalog::Catalog;
use crate::checksum::HashAlgorithm;
use crate::error::BackupError;
use crate::ingest::Ingestor;
use crate::logger::NoopLogger;
use crate::protocol::Credentials;
use crate::session::Services;
use crate::storage::{Row, RunResult, SqlValue, SqliteStore, Store, StoreError};
use crate::transfer::{ChunkStream, ContentSource};

/// Serves the same chunks for every location, or fails every fetch
pub struct StaticSource {
    chunks: Option<Vec<Bytes>>,
}

impl StaticSource {
    pub fn new<C: AsRef<[u8]>>(chunks: &[C]) -> Self {
        StaticSource {
            chunks: Some(chunks.iter().map(|c| Bytes::copy_from_slice(c.as_ref())).collect()),
        }
    }

    pub fn failing() -> Self {
        StaticSource { chunks: None }
    }
}

#[async_trait]
impl ContentSource for StaticSource {
    async fn fetch(&self, location: &str) -> Result<ChunkStream, BackupError> {
        match &self.chunks {
            Some(chunks) => Ok(stream::iter(chunks.clone().into_iter().map(Ok)).boxed()),
            None => Err(BackupError::Transfer(format!("GET {location} returned 404"))),
        }
    }
}

/// Store wrapper that fails the next `n` statements containing `pattern`
pub struct FailingStore {
    inner: SqliteStore,
    pattern: &'static str,
    remaining: AtomicUsize,
}

impl FailingStore {
    pub fn new(pattern: &'static str, n: usize) -> Self {
        FailingStore {
            inner: SqliteStore::open_in_memory().unwrap(),
            pattern,
            remaining: AtomicUsize::new(n),
        }
    }

    fn should_fail(&self, statement: &str) -> bool {
        statement.contains(self.pattern)
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn get_row(&self, query: &str, params: &[SqlValue]) -> Result<Option<Row>, StoreError> {
        self.inner.get_row(query, params).await
    }

    async fn run(&self, statement: &str, params: &[SqlValue]) -> Result<RunResult, StoreError> {
        if self.should_fail(statement) {
            return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
        }
        self.inner.run(statement, params).await
    }

    async fn exec_schema(&self, ddl: &str) -> Result<(), StoreError> {
        self.inner.exec_schema(ddl).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

pub async fn memory_catalog() -> Catalog {
    catalog_over(Arc::new(SqliteStore::open_in_memory().unwrap())).await
}

pub async fn catalog_over(store: Arc<dyn Store>) -> Catalog {
    let catalog = Catalog::new(store);
    catalog.init_schema().await.unwrap();
    catalog
}

pub fn ingestor(catalog: Catalog, source: impl ContentSource + 'static, dir: &Path) -> Ingestor {
    Ingestor::new(
        catalog,
        Arc::new(source),
        dir.to_path_buf(),
        HashAlgorithm::Sha256,
        Arc::new(NoopLogger),
    )
}

pub fn server_identity() -> Credentials {
    Credentials {
        username: "serveruser".into(),
        secretkey: "otherkey".into(),
    }
}

pub fn client_credentials() -> Credentials {
    Credentials {
        username: "testuser".into(),
        secretkey: "fakekey".into(),
    }
}

/// Services knowing one client user, backed by an in-memory catalog
pub async fn services(dir: &Path, allow_skipped_handshake: bool) -> (Services, Catalog) {
    let catalog = memory_catalog().await;
    let client = client_credentials();
    let users = HashMap::from([(client.username, client.secretkey)]);
    let services = Services {
        identity: server_identity(),
        credentials: Arc::new(StaticCredentials::new(users)),
        ingestor: Arc::new(ingestor(catalog.clone(), StaticSource::new(&[b"payload"]), dir)),
        allow_skipped_handshake,
    };
    (services, catalog)
}

/// Files directly under `dir`
pub fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}
