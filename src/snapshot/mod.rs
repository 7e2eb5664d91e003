//! Snapshot Exporter
//!
//! Takes a schema-plus-data dump of the job's tables at the point where the
//! job's logical slot starts, and streams it into the backup store. The
//! driver produces [`SnapshotChunk`]s into a bounded channel while the
//! consumer frames them and feeds a multipart upload, so memory stays at
//! roughly `channel_depth` chunks plus the in-flight upload parts.
//!
//! [`import_snapshot`] is the reverse direction used when replication is
//! established: it replays a stored snapshot into the target.

pub mod format;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use self::format::{
    FormatError, Frame, ManifestHeader, SnapshotDecoder, SnapshotEncoder, SnapshotManifest,
};
use crate::db::{Database, DbError, Lsn, SnapshotChunk, SnapshotInfo};
use crate::job::JobSpec;
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::replication::ReplicationNames;
use crate::store::{BackupStore, StoreError};

/// Exporter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Chunks buffered between the database reader and the uploader.
    pub channel_depth: usize,
    /// Upper bound on one complete export.
    pub export_timeout_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            channel_depth: 8,
            export_timeout_secs: 3_600,
        }
    }
}

/// Export failures.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The export could not start because the source was unreachable.
    #[error("source unreachable: {0}")]
    SourceUnreachable(String),

    /// The dump stopped part-way or failed verification.
    #[error("snapshot export incomplete: {0}")]
    ExportIncomplete(String),

    /// The source rejected the export outright.
    #[error("source rejected snapshot export: {0}")]
    Rejected(#[source] DbError),

    /// The source connection is not usable.
    #[error(transparent)]
    Registry(RegistryError),

    /// The backup store failed.
    #[error("backup store: {0}")]
    Store(#[from] StoreError),
}

impl ExportError {
    /// Whether running the export again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceUnreachable(_) => true,
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    fn from_start(e: DbError) -> Self {
        if e.is_unreachable() {
            Self::SourceUnreachable(e.to_string())
        } else {
            Self::Rejected(e)
        }
    }

    fn from_registry(e: RegistryError) -> Self {
        if e.is_transient() {
            Self::SourceUnreachable(e.to_string())
        } else {
            Self::Registry(e)
        }
    }
}

/// Snapshot import failures.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// Reading the object failed.
    #[error("backup store: {0}")]
    Store(#[from] StoreError),

    /// The object is malformed or truncated.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// The target rejected a statement.
    #[error("target: {0}")]
    Target(#[source] DbError),

    /// The target holds a different number of rows than were exported.
    #[error("table {table}: exported {expected} rows but {loaded} were loaded")]
    RowMismatch {
        /// Table.
        table: String,
        /// Rows in the snapshot.
        expected: u64,
        /// Rows the target reported loading.
        loaded: u64,
    },

    /// The object belongs to a different export than the handle.
    #[error("snapshot {key} does not match its handle: {reason}")]
    WrongSnapshot {
        /// Object key.
        key: String,
        /// What differed.
        reason: String,
    },
}

impl ImportError {
    /// Whether retrying may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Target(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// A stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHandle {
    /// Object key in the backup store.
    pub key: String,
    /// Server snapshot identifier.
    pub snapshot_id: String,
    /// Position the anchor slot streams from.
    pub consistent_lsn: Lsn,
    /// Anchor slot.
    pub slot: String,
    /// Rows per table.
    pub tables: BTreeMap<String, u64>,
    /// Object size.
    pub bytes: u64,
    /// Completion time.
    pub exported_at: DateTime<Utc>,
}

/// Object key for an export started at `at`.
pub fn snapshot_key(job_id: &str, at: DateTime<Utc>) -> String {
    format!("snapshots/{job_id}/{}.snap", at.format("%Y%m%dT%H%M%S%3fZ"))
}

/// Exports snapshots of a job's source tables.
pub struct SnapshotExporter {
    registry: Arc<ConnectionRegistry>,
    store: Arc<BackupStore>,
    config: SnapshotConfig,
    slot_prefix: String,
}

impl SnapshotExporter {
    /// Exporter naming its slots with `slot_prefix`.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<BackupStore>,
        config: SnapshotConfig,
        slot_prefix: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            slot_prefix: slot_prefix.into(),
        }
    }

    /// Anchor the job's slot and stream a consistent snapshot to the store.
    ///
    /// A slot left behind by an earlier attempt is dropped first. On any
    /// failure the partial upload is aborted and the new slot dropped.
    pub async fn export(&self, spec: &JobSpec) -> Result<SnapshotHandle, ExportError> {
        let names = ReplicationNames::for_job(&self.slot_prefix, &spec.id);
        let source = self
            .registry
            .resolve(&spec.source)
            .await
            .map_err(ExportError::from_registry)?;

        // The publication has to predate the slot for decoding to see it.
        source
            .ensure_publication(&names.publication, &spec.tables)
            .await
            .map_err(ExportError::from_start)?;
        if source
            .drop_slot(&names.slot)
            .await
            .map_err(ExportError::from_start)?
        {
            info!(job_id = %spec.id, slot = %names.slot, "dropped slot from earlier export attempt");
        }

        let key = snapshot_key(&spec.id, Utc::now());
        let mut writer = self.store.writer(&key).await?;
        let (tx, mut rx) = mpsc::channel(self.config.channel_depth.max(1));
        let mut received = 0u64;

        let produce = source.export_snapshot(&names.slot, &spec.tables, tx);
        let consume = async {
            let mut encoder = SnapshotEncoder::new();
            writer.write(&encoder.header()).await?;
            while let Some(chunk) = rx.recv().await {
                received += 1;
                if let SnapshotChunk::TableEnd { table, rows } = &chunk {
                    debug!(job_id = %spec.id, table = %table, rows, "table exported");
                }
                let bytes = encoder
                    .encode(&chunk)
                    .map_err(|e| ExportError::ExportIncomplete(e.to_string()))?;
                writer.write(&bytes).await?;
            }
            Ok::<_, ExportError>(encoder)
        };

        let budget = Duration::from_secs(self.config.export_timeout_secs);
        let outcome = tokio::time::timeout(budget, async { tokio::join!(produce, consume) }).await;

        let failure = match outcome {
            Err(_) if received == 0 => ExportError::SourceUnreachable(format!(
                "no data within {}s",
                budget.as_secs()
            )),
            Err(_) => ExportError::ExportIncomplete(format!(
                "export exceeded {}s after {received} chunks",
                budget.as_secs()
            )),
            Ok((Ok(info), Ok(encoder))) => {
                match self.seal(spec, &names.slot, info, encoder, &mut writer).await {
                    Ok(manifest) => match writer.finish().await {
                        Ok(bytes) => {
                            let handle = SnapshotHandle {
                                key,
                                snapshot_id: manifest.snapshot_id,
                                consistent_lsn: manifest.consistent_lsn,
                                slot: manifest.slot,
                                tables: manifest.tables,
                                bytes,
                                exported_at: manifest.created_at,
                            };
                            info!(
                                job_id = %spec.id,
                                key = %handle.key,
                                lsn = %handle.consistent_lsn,
                                bytes,
                                "snapshot exported"
                            );
                            return Ok(handle);
                        }
                        Err(e) => {
                            warn!(job_id = %spec.id, key = %key, error = %e, "snapshot upload failed");
                            release_anchor(&*source, &spec.id, &names.slot).await;
                            return Err(e.into());
                        }
                    },
                    Err(e) => e,
                }
            }
            Ok((_, Err(consumer))) => consumer,
            Ok((Err(e), Ok(_))) if received == 0 && e.is_unreachable() => {
                ExportError::SourceUnreachable(e.to_string())
            }
            Ok((Err(e), Ok(_))) if received == 0 => ExportError::Rejected(e),
            Ok((Err(e), Ok(_))) => ExportError::ExportIncomplete(format!(
                "stream broke after {received} chunks: {e}"
            )),
        };

        warn!(job_id = %spec.id, key = %key, error = %failure, "snapshot export failed");
        writer.abort().await;
        release_anchor(&*source, &spec.id, &names.slot).await;
        Err(failure)
    }

    async fn seal(
        &self,
        spec: &JobSpec,
        slot: &str,
        info: SnapshotInfo,
        encoder: SnapshotEncoder,
        writer: &mut crate::store::ObjectWriter,
    ) -> Result<SnapshotManifest, ExportError> {
        let missing: Vec<&String> = spec
            .tables
            .iter()
            .filter(|t| !encoder.tables().contains_key(*t))
            .collect();
        if !missing.is_empty() {
            return Err(ExportError::ExportIncomplete(format!(
                "no table end for {missing:?}"
            )));
        }
        let (trailer, manifest) = encoder
            .trailer(ManifestHeader {
                job_id: spec.id.clone(),
                snapshot_id: info.snapshot_id,
                slot: slot.to_string(),
                consistent_lsn: info.consistent_lsn,
            })
            .map_err(|e| ExportError::ExportIncomplete(e.to_string()))?;
        writer.write(&trailer).await?;
        Ok(manifest)
    }
}

async fn release_anchor(source: &dyn Database, job_id: &str, slot: &str) {
    if let Err(e) = source.drop_slot(slot).await {
        warn!(job_id, slot, error = %e, "could not drop anchor slot");
    }
}

/// Replay a stored snapshot into `target`: create each table, empty it and
/// load its rows. Every table's loaded row count is checked against the
/// snapshot, and the trailer against `handle`.
pub async fn import_snapshot(
    store: &BackupStore,
    handle: &SnapshotHandle,
    target: &dyn Database,
) -> Result<SnapshotManifest, ImportError> {
    let mut stream = store.get_stream(&handle.key).await?;
    let mut decoder = SnapshotDecoder::new();
    let mut loaded: BTreeMap<String, u64> = BTreeMap::new();

    while let Some(bytes) = stream.next().await {
        decoder.feed(&bytes?);
        while let Some(frame) = decoder.next_frame()? {
            match frame {
                Frame::Chunk(SnapshotChunk::Schema { table, ddl }) => {
                    target
                        .apply_schema(&table, &ddl)
                        .await
                        .map_err(ImportError::Target)?;
                    target.truncate(&table).await.map_err(ImportError::Target)?;
                    loaded.insert(table, 0);
                }
                Frame::Chunk(SnapshotChunk::Rows { table, data, .. }) => {
                    let n = target
                        .copy_in(&table, data)
                        .await
                        .map_err(ImportError::Target)?;
                    *loaded.entry(table).or_default() += n;
                }
                Frame::Chunk(SnapshotChunk::TableEnd { table, rows }) => {
                    let got = loaded.get(&table).copied().unwrap_or(0);
                    if got != rows {
                        return Err(ImportError::RowMismatch {
                            table,
                            expected: rows,
                            loaded: got,
                        });
                    }
                    debug!(table = %table, rows, "table imported");
                }
                Frame::Trailer(manifest) => {
                    if manifest.slot != handle.slot || manifest.tables != handle.tables {
                        return Err(ImportError::WrongSnapshot {
                            key: handle.key.clone(),
                            reason: format!(
                                "trailer slot {} / {} tables",
                                manifest.slot,
                                manifest.tables.len()
                            ),
                        });
                    }
                }
            }
        }
    }

    let manifest = decoder.finish()?;
    info!(key = %handle.key, tables = manifest.tables.len(), "snapshot imported");
    Ok(manifest)
}
