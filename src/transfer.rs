//! Side-channel content retrieval
//!
//! The object protocol only names a `sourceLocation`; the bytes themselves
//! arrive over HTTP or, for clients on the same host, from the local disk.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::path::Path;
use tokio_util::io::ReaderStream;

use crate::error::BackupError;
use crate::protocol::timeouts;
use crate::url::{parse_source_location, SourceLocation};

pub type ChunkStream = BoxStream<'static, Result<Bytes, BackupError>>;

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Open `location` for reading. A failure here or in any chunk is a
    /// `BackupError::Transfer`.
    async fn fetch(&self, location: &str) -> Result<ChunkStream, BackupError>;
}

pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Result<Self, BackupError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_millis(timeouts::CONNECT_MS))
            .build()
            .map_err(|e| BackupError::Transfer(format!("http client: {e}")))?;
        Ok(HttpSource { client })
    }
}

#[async_trait]
impl ContentSource for HttpSource {
    async fn fetch(&self, location: &str) -> Result<ChunkStream, BackupError> {
        let response = self
            .client
            .get(location)
            .send()
            .await
            .map_err(|e| BackupError::Transfer(format!("GET {location}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackupError::Transfer(format!(
                "GET {location} returned {status}"
            )));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| BackupError::Transfer(format!("body: {e}"))));
        Ok(stream.boxed())
    }
}

pub struct FileSource;

impl FileSource {
    async fn open(path: &Path) -> Result<ChunkStream, BackupError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| BackupError::Transfer(format!("open {}: {e}", path.display())))?;
        let stream = ReaderStream::new(file)
            .map(|chunk| chunk.map_err(|e| BackupError::Transfer(format!("read: {e}"))));
        Ok(stream.boxed())
    }
}

#[async_trait]
impl ContentSource for FileSource {
    async fn fetch(&self, location: &str) -> Result<ChunkStream, BackupError> {
        match parse_source_location(location) {
            Some(SourceLocation::File(path)) => Self::open(&path).await,
            _ => Err(BackupError::Transfer(format!(
                "not a local file location: {location}"
            ))),
        }
    }
}

/// Dispatches on the location scheme. Local reads can be switched off.
pub struct SourceRouter {
    http: HttpSource,
    allow_local: bool,
}

impl SourceRouter {
    pub fn new(allow_local: bool) -> Result<Self, BackupError> {
        Ok(SourceRouter {
            http: HttpSource::new()?,
            allow_local,
        })
    }
}

#[async_trait]
impl ContentSource for SourceRouter {
    async fn fetch(&self, location: &str) -> Result<ChunkStream, BackupError> {
        match parse_source_location(location) {
            Some(SourceLocation::Http(_)) => self.http.fetch(location).await,
            Some(SourceLocation::File(path)) if self.allow_local => FileSource::open(&path).await,
            Some(SourceLocation::File(_)) => Err(BackupError::Transfer(
                "local file sources are disabled on this server".into(),
            )),
            None => Err(BackupError::Transfer(format!(
                "unsupported source location: {location}"
            ))),
        }
    }
}
