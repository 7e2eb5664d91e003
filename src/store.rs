//! Backup object store
//!
//! Thin wrapper over `object_store` that applies the configured key prefix
//! and a timeout to every call. Snapshots are written through
//! [`ObjectWriter`], a multipart upload whose in-flight parts are capped so
//! memory stays bounded no matter how large the snapshot is.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, WriteMultipart};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Object store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Configuration error
    #[error("store configuration error: {0}")]
    Config(String),

    /// Object store error
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid path
    #[error("invalid object path: {0}")]
    InvalidPath(String),

    /// The object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// A call exceeded the request timeout.
    #[error("object store timed out during {0}")]
    Timeout(&'static str),
}

impl StoreError {
    /// Whether a retry can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout(_) | StoreError::ObjectStore(object_store::Error::Generic { .. })
        )
    }
}

/// Object store provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreProvider {
    /// Local filesystem, rooted at `bucket`.
    #[default]
    Local,
    /// Amazon S3 or an S3-compatible endpoint.
    S3,
    /// Process memory (rehearsals and tests).
    Memory,
}

/// `[store]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Provider
    pub provider: StoreProvider,
    /// Bucket name, or root directory for `local`.
    pub bucket: String,
    /// Key prefix for all objects
    pub prefix: Option<String>,
    /// Region (S3)
    pub region: Option<String>,
    /// Custom endpoint URL (S3-compatible stores)
    pub endpoint: Option<String>,
    /// Per-call timeout.
    pub request_timeout_ms: u64,
    /// Multipart part size.
    pub part_size_bytes: usize,
    /// Parts allowed in flight before writers wait.
    pub max_inflight_parts: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            provider: StoreProvider::Local,
            bucket: "./pgshift-backups".to_string(),
            prefix: None,
            region: None,
            endpoint: None,
            request_timeout_ms: 30_000,
            part_size_bytes: 5 * 1024 * 1024,
            max_inflight_parts: 4,
        }
    }
}

/// Prefixed, timeout-bounded access to the backup bucket.
#[derive(Clone)]
pub struct BackupStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    timeout: Duration,
    part_size: usize,
    max_inflight: usize,
}

impl std::fmt::Debug for BackupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupStore")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl BackupStore {
    /// Build the store described by `config`.
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn ObjectStore> = match config.provider {
            StoreProvider::S3 => {
                if config.bucket.is_empty() {
                    return Err(StoreError::Config("store.bucket is required for s3".into()));
                }
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.bucket);
                if let Some(ref region) = config.region {
                    builder = builder.with_region(region);
                }
                if let Some(ref endpoint) = config.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                Arc::new(builder.build()?)
            }
            StoreProvider::Local => {
                let path = PathBuf::from(&config.bucket);
                std::fs::create_dir_all(&path)?;
                Arc::new(LocalFileSystem::new_with_prefix(path)?)
            }
            StoreProvider::Memory => Arc::new(InMemory::new()),
        };

        Ok(Self {
            store,
            prefix: config.prefix.clone().unwrap_or_default(),
            timeout: Duration::from_millis(config.request_timeout_ms),
            part_size: config.part_size_bytes.max(1024),
            max_inflight: config.max_inflight_parts.max(1),
        })
    }

    /// Wrap an arbitrary object store.
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        let defaults = StoreConfig::default();
        Self {
            store,
            prefix: prefix.into(),
            timeout: Duration::from_millis(defaults.request_timeout_ms),
            part_size: defaults.part_size_bytes,
            max_inflight: defaults.max_inflight_parts,
        }
    }

    /// Process-local store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "")
    }

    /// Override the multipart part size.
    pub fn with_part_size(mut self, bytes: usize) -> Self {
        self.part_size = bytes.max(1);
        self
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the full path for a key
    fn path(&self, key: &str) -> Result<ObjectPath, StoreError> {
        let full = if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), key)
        };
        ObjectPath::parse(&full).map_err(|e| StoreError::InvalidPath(e.to_string()))
    }

    fn strip_prefix(&self, location: &ObjectPath) -> String {
        let full = location.to_string();
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return full;
        }
        full.strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/').to_string())
            .unwrap_or(full)
    }

    /// Start a multipart upload to `key`.
    pub async fn writer(&self, key: &str) -> Result<ObjectWriter, StoreError> {
        let path = self.path(key)?;
        let upload = tokio::time::timeout(self.timeout, self.store.put_multipart(&path))
            .await
            .map_err(|_| StoreError::Timeout("put_multipart"))??;
        Ok(ObjectWriter {
            key: key.to_string(),
            upload: WriteMultipart::new_with_chunk_size(upload, self.part_size),
            timeout: self.timeout,
            max_inflight: self.max_inflight,
            bytes: 0,
        })
    }

    /// Stream an object's bytes.
    pub async fn get_stream(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, StoreError>>, StoreError> {
        let path = self.path(key)?;
        let result = match tokio::time::timeout(self.timeout, self.store.get(&path)).await {
            Err(_) => return Err(StoreError::Timeout("get")),
            Ok(Err(object_store::Error::NotFound { .. })) => {
                return Err(StoreError::NotFound(key.to_string()))
            }
            Ok(r) => r?,
        };
        Ok(result.into_stream().map_err(StoreError::from).boxed())
    }

    /// Per-call timeout, for callers pacing a stream themselves.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read a whole object.
    pub async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = self.path(key)?;
        let read = async {
            let result = self.store.get(&path).await?;
            result.bytes().await
        };
        match tokio::time::timeout(self.timeout, read).await {
            Err(_) => Err(StoreError::Timeout("get")),
            Ok(Err(object_store::Error::NotFound { .. })) => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Ok(r) => Ok(r?),
        }
    }

    /// Keys under `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let path = self.path(prefix)?;
        let listing = self.store.list(Some(&path)).try_collect::<Vec<_>>();
        let metas = tokio::time::timeout(self.timeout, listing)
            .await
            .map_err(|_| StoreError::Timeout("list"))??;
        let mut keys: Vec<String> = metas.iter().map(|m| self.strip_prefix(&m.location)).collect();
        keys.sort();
        Ok(keys)
    }

    /// Delete an object. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path(key)?;
        let exists = match tokio::time::timeout(self.timeout, self.store.head(&path)).await {
            Err(_) => return Err(StoreError::Timeout("head")),
            Ok(Ok(_)) => true,
            Ok(Err(object_store::Error::NotFound { .. })) => false,
            Ok(Err(e)) => return Err(e.into()),
        };
        if exists {
            tokio::time::timeout(self.timeout, self.store.delete(&path))
                .await
                .map_err(|_| StoreError::Timeout("delete"))??;
        }
        Ok(exists)
    }
}

/// Streaming multipart upload of one object.
pub struct ObjectWriter {
    key: String,
    upload: WriteMultipart,
    timeout: Duration,
    max_inflight: usize,
    bytes: u64,
}

impl ObjectWriter {
    /// Key being written.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Buffer `data`, first waiting until fewer than the configured number
    /// of parts are in flight.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), StoreError> {
        tokio::time::timeout(self.timeout, self.upload.wait_for_capacity(self.max_inflight))
            .await
            .map_err(|_| StoreError::Timeout("upload part"))??;
        self.upload.write(data);
        self.bytes += data.len() as u64;
        Ok(())
    }

    /// Flush remaining parts and complete the upload.
    pub async fn finish(self) -> Result<u64, StoreError> {
        let bytes = self.bytes;
        tokio::time::timeout(self.timeout, self.upload.finish())
            .await
            .map_err(|_| StoreError::Timeout("complete upload"))??;
        debug!(key = %self.key, bytes, "object uploaded");
        Ok(bytes)
    }

    /// Abandon the upload.
    pub async fn abort(self) {
        let key = self.key.clone();
        match tokio::time::timeout(self.timeout, self.upload.abort()).await {
            Ok(Ok(())) => debug!(key = %key, "upload aborted"),
            Ok(Err(e)) => warn!(key = %key, error = %e, "failed to abort upload"),
            Err(_) => warn!(key = %key, "timed out aborting upload"),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn test_multipart_round_trip() {
        let store = BackupStore::in_memory().with_part_size(1024);
        let mut writer = store.writer("snapshots/job/a.snap").await.unwrap();
        let payload = vec![7u8; 4000];
        writer.write(&payload[..1500]).await.unwrap();
        writer.write(&payload[1500..]).await.unwrap();
        assert_eq!(writer.finish().await.unwrap(), 4000);

        let read = store.get("snapshots/job/a.snap").await.unwrap();
        assert_eq!(read.len(), 4000);

        let mut stream = store.get_stream("snapshots/job/a.snap").await.unwrap();
        let mut total = 0;
        while let Some(piece) = stream.next().await {
            total += piece.unwrap().len();
        }
        assert_eq!(total, 4000);
    }

    #[tokio::test]
    async fn test_prefix_and_list() {
        let store = BackupStore::new(Arc::new(InMemory::new()), "backups/");
        for key in ["snapshots/j1/2.snap", "snapshots/j1/1.snap", "snapshots/j2/1.snap"] {
            let mut w = store.writer(key).await.unwrap();
            w.write(b"x").await.unwrap();
            w.finish().await.unwrap();
        }
        assert_eq!(
            store.list("snapshots/j1").await.unwrap(),
            vec!["snapshots/j1/1.snap", "snapshots/j1/2.snap"]
        );
        assert!(store.delete("snapshots/j1/1.snap").await.unwrap());
        assert!(!store.delete("snapshots/j1/1.snap").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = BackupStore::in_memory();
        assert!(matches!(
            store.get("nope").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.get_stream("nope").await.map(|_| ()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_provider() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            provider: StoreProvider::Local,
            bucket: dir.path().join("bucket").display().to_string(),
            ..Default::default()
        };
        let store = BackupStore::from_config(&config).unwrap();
        let mut w = store.writer("snapshots/j/1.snap").await.unwrap();
        w.write(b"hello").await.unwrap();
        w.finish().await.unwrap();
        assert_eq!(&store.get("snapshots/j/1.snap").await.unwrap()[..], b"hello");
    }
}
