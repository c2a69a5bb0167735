//! File ingestion pipeline
//!
//! `ADD_FILE` runs five ordered steps. Each records what it created in an
//! [`IngestContext`]; when a later step fails, [`Ingestor::rollback`] undoes
//! exactly what the context records, so a retry starts from a clean slate.
//!
//! ```text
//! duplicate check -> allocate -> retrieve -> tracked insert -> stored insert
//! ```

use chrono::Utc;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::checksum::{ContentHasher, HashAlgorithm};
use crate::error::BackupError;
use crate::logger::IngestLogger;
use crate::protocol::AddFile;
use crate::storage::StoreError;
use crate::transfer::ContentSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStep {
    DuplicateCheck,
    Allocate,
    Retrieve,
    TrackedInsert,
    StoredInsert,
}

impl std::fmt::Display for IngestStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IngestStep::DuplicateCheck => "duplicate check",
            IngestStep::Allocate => "allocate",
            IngestStep::Retrieve => "retrieve",
            IngestStep::TrackedInsert => "tracked insert",
            IngestStep::StoredInsert => "stored insert",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub tracked_file_id: i64,
    pub stored_file_id: i64,
    pub server_path: PathBuf,
    pub content_hash: String,
    pub bytes: u64,
}

/// What one ingestion attempt has done so far
#[derive(Debug)]
struct IngestContext {
    step: IngestStep,
    server_path: Option<PathBuf>,
    tracked_file_id: Option<i64>,
    stored_file_id: Option<i64>,
}

impl IngestContext {
    fn new() -> Self {
        IngestContext {
            step: IngestStep::DuplicateCheck,
            server_path: None,
            tracked_file_id: None,
            stored_file_id: None,
        }
    }
}

pub struct Ingestor {
    catalog: Catalog,
    source: Arc<dyn ContentSource>,
    storage_dir: PathBuf,
    hash: HashAlgorithm,
    logger: Arc<dyn IngestLogger>,
}

impl Ingestor {
    /// `storage_dir` must already exist
    pub fn new(
        catalog: Catalog,
        source: Arc<dyn ContentSource>,
        storage_dir: PathBuf,
        hash: HashAlgorithm,
        logger: Arc<dyn IngestLogger>,
    ) -> Self {
        Ingestor {
            catalog,
            source,
            storage_dir,
            hash,
            logger,
        }
    }

    /// Run the pipeline for one request. On failure nothing it created is left behind.
    pub async fn ingest(&self, req: &AddFile) -> Result<Ingested, BackupError> {
        let mut ctx = IngestContext::new();
        match self.run_steps(req, &mut ctx).await {
            Ok(done) => {
                info!(
                    owner_id = req.owner_id,
                    client_path = %req.client_path,
                    server_path = %done.server_path.display(),
                    bytes = done.bytes,
                    "file ingested"
                );
                self.logger
                    .tracked(req.owner_id, &req.client_path, &done.server_path, done.bytes);
                Ok(done)
            }
            Err(e) => {
                warn!(
                    owner_id = req.owner_id,
                    client_path = %req.client_path,
                    step = %ctx.step,
                    error = %e,
                    "ingestion failed"
                );
                self.rollback(req, &ctx).await;
                self.logger
                    .rejected(req.owner_id, &req.client_path, &e.to_string());
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        req: &AddFile,
        ctx: &mut IngestContext,
    ) -> Result<Ingested, BackupError> {
        let already_tracked = || BackupError::AlreadyTracked {
            owner_id: req.owner_id,
            client_path: req.client_path.clone(),
        };

        ctx.step = IngestStep::DuplicateCheck;
        if self
            .catalog
            .find_tracked(req.owner_id, &req.client_path)
            .await?
            .is_some()
        {
            return Err(already_tracked());
        }

        ctx.step = IngestStep::Allocate;
        let server_path = self.storage_dir.join(Uuid::new_v4().to_string());
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&server_path)
            .await?;
        ctx.server_path = Some(server_path.clone());

        ctx.step = IngestStep::Retrieve;
        let (content_hash, bytes) = self.retrieve(&req.source_location, &mut file).await?;
        drop(file);

        ctx.step = IngestStep::TrackedInsert;
        let tracked_file_id = match self
            .catalog
            .insert_tracked(req.owner_id, &req.client_path)
            .await
        {
            Ok(id) => id,
            // Lost a race with a concurrent ingestion of the same path
            Err(StoreError::Constraint(_)) => return Err(already_tracked()),
            Err(e) => return Err(e.into()),
        };
        ctx.tracked_file_id = Some(tracked_file_id);

        ctx.step = IngestStep::StoredInsert;
        let added_at = Utc::now().to_rfc3339();
        let stored_file_id = self
            .catalog
            .insert_stored(
                tracked_file_id,
                &server_path.to_string_lossy(),
                &added_at,
                &content_hash,
            )
            .await?;
        ctx.stored_file_id = Some(stored_file_id);

        Ok(Ingested {
            tracked_file_id,
            stored_file_id,
            server_path,
            content_hash,
            bytes,
        })
    }

    /// Stream content into `file`, hashing as it goes. Returns (hex digest, byte count).
    async fn retrieve(&self, location: &str, file: &mut File) -> Result<(String, u64), BackupError> {
        let mut stream = self.source.fetch(location).await?;
        let mut hasher = ContentHasher::new(self.hash);
        let mut bytes = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        debug!(location, bytes, "content retrieved");
        Ok((hasher.finalize_hex(), bytes))
    }

    /// Undo whatever `ctx` records. Failures here are logged; the original
    /// error is what the caller reports.
    async fn rollback(&self, req: &AddFile, ctx: &IngestContext) {
        if ctx.stored_file_id.is_some() {
            return;
        }
        let mut undone = false;

        if let Some(id) = ctx.tracked_file_id {
            match self.catalog.delete_tracked(id).await {
                Ok(_) => undone = true,
                Err(e) => warn!(tracked_file_id = id, error = %e, "failed to delete tracked row"),
            }
        }

        if let Some(path) = &ctx.server_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => undone = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial file"),
            }
        }

        if undone {
            self.logger
                .rolled_back(req.owner_id, &req.client_path, &ctx.step.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hash_bytes;
    use crate::test_support::{
        catalog_over, file_count, ingestor, memory_catalog, FailingStore, StaticSource,
    };
    use crate::transfer::ChunkStream;
    use async_trait::async_trait;

    fn request(path: &str) -> AddFile {
        AddFile {
            client_path: path.into(),
            owner_id: 1,
            source_location: "http://client.local/f".into(),
        }
    }

    #[tokio::test]
    async fn test_ingest_records_both_rows_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = memory_catalog().await;
        let ingestor = ingestor(catalog.clone(), StaticSource::new(&[&b"hello "[..], &b"world"[..]]), dir.path());

        let done = ingestor.ingest(&request("/home/u/a.txt")).await.unwrap();
        assert_eq!(done.bytes, 11);
        assert_eq!(done.content_hash, hash_bytes(HashAlgorithm::Sha256, b"hello world"));
        assert_eq!(std::fs::read(&done.server_path).unwrap(), b"hello world");
        assert!(done.server_path.starts_with(dir.path()));

        let tracked = catalog.find_tracked(1, "/home/u/a.txt").await.unwrap().unwrap();
        assert_eq!(tracked.id, done.tracked_file_id);
        let stored = catalog.stored_for(tracked.id).await.unwrap().unwrap();
        assert_eq!(stored.id, done.stored_file_id);
        assert_eq!(stored.content_hash, done.content_hash);
        assert_eq!(stored.server_path, done.server_path.to_string_lossy());
        assert!(chrono::DateTime::parse_from_rfc3339(&stored.added_at).is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_is_rejected_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = memory_catalog().await;
        let ingestor = ingestor(catalog.clone(), StaticSource::new(&[b"x"]), dir.path());

        ingestor.ingest(&request("/a")).await.unwrap();
        let err = ingestor.ingest(&request("/a")).await.unwrap_err();
        assert!(matches!(err, BackupError::AlreadyTracked { owner_id: 1, .. }), "{err}");
        assert_eq!(catalog.counts().await.unwrap(), (1, 1));
        assert_eq!(file_count(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_transfer_failure_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = memory_catalog().await;
        let ingestor = ingestor(catalog.clone(), StaticSource::failing(), dir.path());

        let err = ingestor.ingest(&request("/a")).await.unwrap_err();
        assert!(matches!(err, BackupError::Transfer(_)), "{err}");
        assert_eq!(catalog.counts().await.unwrap(), (0, 0));
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_missing_storage_dir_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = memory_catalog().await;
        let ingestor = ingestor(catalog.clone(), StaticSource::new(&[b"x"]), &dir.path().join("gone"));

        let err = ingestor.ingest(&request("/a")).await.unwrap_err();
        assert!(matches!(err, BackupError::Io(_)), "{err}");
        assert_eq!(catalog.counts().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_stored_insert_failure_rolls_back_and_retry_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_over(Arc::new(FailingStore::new("INSERT INTO stored_files", 1))).await;
        let ingestor = ingestor(catalog.clone(), StaticSource::new(&[b"abc"]), dir.path());

        let err = ingestor.ingest(&request("/a")).await.unwrap_err();
        assert!(matches!(err, BackupError::Storage(_)), "{err}");
        assert!(catalog.find_tracked(1, "/a").await.unwrap().is_none());
        assert_eq!(catalog.counts().await.unwrap(), (0, 0));
        assert_eq!(file_count(dir.path()), 0);

        let done = ingestor.ingest(&request("/a")).await.unwrap();
        assert_eq!(catalog.counts().await.unwrap(), (1, 1));
        assert_eq!(
            catalog.stored_for(done.tracked_file_id).await.unwrap().unwrap().id,
            done.stored_file_id
        );
        assert_eq!(file_count(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_tracked_insert_failure_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_over(Arc::new(FailingStore::new("INSERT INTO tracked_files", 1))).await;
        let ingestor = ingestor(catalog.clone(), StaticSource::new(&[b"abc"]), dir.path());

        assert!(matches!(
            ingestor.ingest(&request("/a")).await,
            Err(BackupError::Storage(_))
        ));
        assert_eq!(file_count(dir.path()), 0);
        assert_eq!(catalog.counts().await.unwrap(), (0, 0));
    }

    /// Inserts the same tracked row while content is in flight, like a
    /// concurrent connection ingesting the same path
    struct RacingSource {
        catalog: Catalog,
    }

    #[async_trait]
    impl ContentSource for RacingSource {
        async fn fetch(&self, location: &str) -> Result<ChunkStream, BackupError> {
            self.catalog.insert_tracked(1, "/a").await?;
            StaticSource::new(&[b"late"]).fetch(location).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_ingestion_race_is_already_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = memory_catalog().await;
        let source = RacingSource {
            catalog: catalog.clone(),
        };
        let ingestor = ingestor(catalog.clone(), source, dir.path());

        let err = ingestor.ingest(&request("/a")).await.unwrap_err();
        assert!(matches!(err, BackupError::AlreadyTracked { .. }), "{err}");
        // The winner's row survives, the loser's file does not
        assert_eq!(catalog.counts().await.unwrap(), (1, 0));
        assert!(catalog.find_tracked(1, "/a").await.unwrap().is_some());
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_blake3_digest() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = memory_catalog().await;
        let ingestor = Ingestor::new(
            catalog,
            Arc::new(StaticSource::new(&[b"data"])),
            dir.path().to_path_buf(),
            HashAlgorithm::Blake3,
            Arc::new(crate::logger::NoopLogger),
        );
        let done = ingestor.ingest(&request("/a")).await.unwrap();
        assert_eq!(done.content_hash, hash_bytes(HashAlgorithm::Blake3, b"data"));
    }
}
