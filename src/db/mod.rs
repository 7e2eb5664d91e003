//! Database access layer
//!
//! Everything the orchestrator needs from a source or target database goes
//! through the [`Database`] trait: health round-trips, LSN positions,
//! publications, logical slots, subscriptions, exported snapshots, `COPY`
//! import and checksum queries.
//!
//! Two drivers implement it:
//!
//! - [`postgres::PgDatabase`] speaks the PostgreSQL wire protocol via `sqlx`.
//! - [`memory::MemoryDatabase`] is an in-process simulation with a WAL,
//!   logical slots and an asynchronous subscription apply worker. It is used
//!   for rehearsals and for the test-suite.

pub mod memory;
pub mod postgres;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use memory::{FaultPoint, MemoryConnector, MemoryDatabase, MemoryNetwork};
pub use postgres::{PgConnector, PgDatabase};

/// Name of the table the write probe touches on a target.
pub const PROBE_TABLE: &str = "pgshift_probe";

// ---------------------------------------------------------------------------
// Lsn
// ---------------------------------------------------------------------------

/// Log sequence number: a monotonically increasing write-ahead position.
///
/// Rendered the way PostgreSQL prints `pg_lsn` values (`16/B374D848`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Lsn(pub u64);

impl Lsn {
    /// Byte distance from `other` up to `self`, saturating at zero.
    pub fn bytes_since(self, other: Lsn) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| DbError::Query(format!("malformed LSN '{s}'")))?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|_| DbError::Query(format!("malformed LSN '{s}'")))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|_| DbError::Query(format!("malformed LSN '{s}'")))?;
        if hi > u64::from(u32::MAX) || lo > u64::from(u32::MAX) {
            return Err(DbError::Query(format!("LSN out of range '{s}'")));
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

impl From<Lsn> for String {
    fn from(lsn: Lsn) -> Self {
        lsn.to_string()
    }
}

impl TryFrom<String> for Lsn {
    type Error = DbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by a database driver.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DbError {
    /// The server could not be reached or the connection dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// A statement exceeded its time budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The server rejected a statement.
    #[error("query failed: {0}")]
    Query(String),

    /// A named object (table, slot, publication) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An identifier failed validation before reaching the server.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The receiving side of a snapshot stream went away.
    #[error("snapshot consumer closed the stream")]
    ConsumerGone,
}

impl DbError {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Connection(_) | DbError::Timeout(_))
    }

    /// Whether the error means the server itself was unreachable.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, DbError::Connection(_) | DbError::Timeout(_))
    }
}

/// Result alias for driver calls.
pub type DbResult<T> = std::result::Result<T, DbError>;

// ---------------------------------------------------------------------------
// Driver-facing types
// ---------------------------------------------------------------------------

/// How much of a table a checksum covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sampling {
    /// Every row contributes.
    Full,
    /// Only rows whose row hash is divisible by the modulus contribute.
    Modulus(u32),
}

impl Sampling {
    /// Modulus as sent to the server (1 means "all rows").
    pub fn modulus(self) -> u32 {
        match self {
            Sampling::Full => 1,
            Sampling::Modulus(m) => m.max(1),
        }
    }

    /// Whether a row hash is part of the sample.
    pub fn includes(self, row_hash: u64) -> bool {
        row_hash % u64::from(self.modulus()) == 0
    }
}

/// Order-independent digest over a table (or its sample).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChecksum {
    /// Number of rows that went into the digest.
    pub rows_hashed: u64,
    /// Sum of row hashes modulo 2^63-1.
    pub checksum: u64,
}

/// Modulus applied to checksum sums so both drivers stay inside `i64`.
pub const CHECKSUM_MODULUS: u64 = i64::MAX as u64;

/// A logical replication slot as listed by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// Slot name.
    pub name: String,
    /// Last position the consumer confirmed as flushed.
    pub confirmed_flush_lsn: Option<Lsn>,
    /// Whether a consumer is currently attached.
    pub active: bool,
}

/// Position of one slot relative to the source's current WAL insert point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPosition {
    /// Current WAL position on the source.
    pub current_lsn: Lsn,
    /// Last position confirmed by the subscriber.
    pub confirmed_flush_lsn: Option<Lsn>,
    /// Whether a consumer is attached.
    pub active: bool,
}

impl SlotPosition {
    /// Bytes of WAL the subscriber still has to confirm.
    pub fn bytes_behind(&self) -> u64 {
        match self.confirmed_flush_lsn {
            Some(confirmed) => self.current_lsn.bytes_since(confirmed),
            None => self.current_lsn.0,
        }
    }
}

/// Parameters for a subscription created on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    /// Subscription name on the target.
    pub name: String,
    /// Connection string the target uses to reach the source.
    pub source_conninfo: String,
    /// Publication on the source.
    pub publication: String,
    /// Pre-created slot on the source to attach to.
    pub slot: String,
}

/// One unit of a streamed snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotChunk {
    /// DDL that recreates a table on the target.
    Schema {
        /// Table the DDL belongs to.
        table: String,
        /// Statement text.
        ddl: String,
    },
    /// A batch of rows in `COPY ... TEXT` format.
    Rows {
        /// Table the rows belong to.
        table: String,
        /// Raw copy payload, newline-terminated rows.
        data: Bytes,
        /// Number of rows in `data`.
        rows: u64,
    },
    /// Marks the end of one table's data.
    TableEnd {
        /// Finished table.
        table: String,
        /// Total rows emitted for the table.
        rows: u64,
    },
}

/// Identity of a snapshot anchored to a replication slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Server-side snapshot identifier.
    pub snapshot_id: String,
    /// Position from which the anchored slot streams changes.
    pub consistent_lsn: Lsn,
}

// ---------------------------------------------------------------------------
// Database trait
// ---------------------------------------------------------------------------

/// Operations the orchestrator performs against a source or target database.
#[async_trait]
pub trait Database: Send + Sync {
    /// Short driver name for logs.
    fn driver(&self) -> &'static str;

    /// Lightweight round-trip (`SELECT 1`).
    async fn ping(&self) -> DbResult<()>;

    /// Current WAL insert position.
    async fn current_lsn(&self) -> DbResult<Lsn>;

    /// Exact row count of a table.
    async fn row_count(&self, table: &str) -> DbResult<u64>;

    /// Order-independent checksum of a table or of a deterministic sample.
    async fn table_checksum(&self, table: &str, sampling: Sampling) -> DbResult<TableChecksum>;

    /// Create the publication, or reset its table list to exactly `tables`.
    async fn ensure_publication(&self, name: &str, tables: &[String]) -> DbResult<()>;

    /// Drop a publication. Returns whether it existed.
    async fn drop_publication(&self, name: &str) -> DbResult<bool>;

    /// Create logical slot `slot` and stream a snapshot of `tables` that is
    /// consistent with the slot's starting point.
    ///
    /// Chunks are pushed into `chunks`; the bounded channel is the
    /// backpressure that keeps memory flat for large tables.
    async fn export_snapshot(
        &self,
        slot: &str,
        tables: &[String],
        chunks: mpsc::Sender<SnapshotChunk>,
    ) -> DbResult<SnapshotInfo>;

    /// Drop a logical slot. Returns whether it existed.
    async fn drop_slot(&self, slot: &str) -> DbResult<bool>;

    /// List logical slots whose name starts with `prefix`.
    async fn list_slots(&self, prefix: &str) -> DbResult<Vec<SlotInfo>>;

    /// Position of a slot, or `None` if it does not exist.
    async fn slot_position(&self, slot: &str) -> DbResult<Option<SlotPosition>>;

    /// Execute DDL produced by a snapshot.
    async fn apply_schema(&self, table: &str, ddl: &str) -> DbResult<()>;

    /// Remove all rows from a table.
    async fn truncate(&self, table: &str) -> DbResult<()>;

    /// Load `COPY ... TEXT` data. Returns the number of rows loaded.
    async fn copy_in(&self, table: &str, data: Bytes) -> DbResult<u64>;

    /// Create a subscription attached to an existing slot, without initial copy.
    async fn create_subscription(&self, spec: &SubscriptionSpec) -> DbResult<()>;

    /// Whether a subscription exists.
    async fn subscription_exists(&self, name: &str) -> DbResult<bool>;

    /// Detach a subscription from its slot and drop it. Returns whether it existed.
    async fn drop_subscription(&self, name: &str) -> DbResult<bool>;

    /// Perform a small write to prove the server accepts writes.
    async fn probe_write(&self) -> DbResult<()>;

    /// Close pooled connections.
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// Identifier helpers
// ---------------------------------------------------------------------------

/// Quote a single SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name (`schema.table`).
pub fn quote_table(table: &str) -> DbResult<String> {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.is_empty() || parts.len() > 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(DbError::InvalidIdentifier(table.to_string()));
    }
    Ok(parts.iter().map(|p| quote_ident(p)).collect::<Vec<_>>().join("."))
}

/// Quote a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Hash of a row's text representation, shared by checksums and sampling.
pub fn row_hash(fields: &[String]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\t");
        }
        hasher.update(field.as_bytes());
    }
    u64::from(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_round_trip_display() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, (0x16 << 32) | 0xB374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
    }

    #[test]
    fn test_lsn_rejects_garbage() {
        assert!("nonsense".parse::<Lsn>().is_err());
        assert!("1/ZZ".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_lsn_serde_as_string() {
        let json = serde_json::to_string(&Lsn(0x1_0000_0010)).unwrap();
        assert_eq!(json, "\"1/10\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Lsn(0x1_0000_0010));
    }

    #[test]
    fn test_quote_table() {
        assert_eq!(quote_table("users").unwrap(), "\"users\"");
        assert_eq!(quote_table("app.users").unwrap(), "\"app\".\"users\"");
        assert_eq!(quote_table("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert!(quote_table("a.b.c").is_err());
        assert!(quote_table("").is_err());
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal("host=a password='x'"), "'host=a password=''x'''");
    }

    #[test]
    fn test_sampling_modulus() {
        assert!(Sampling::Full.includes(7));
        assert!(Sampling::Modulus(4).includes(8));
        assert!(!Sampling::Modulus(4).includes(9));
        assert_eq!(Sampling::Modulus(0).modulus(), 1);
    }

    #[test]
    fn test_slot_position_bytes_behind() {
        let pos = SlotPosition {
            current_lsn: Lsn(500),
            confirmed_flush_lsn: Some(Lsn(200)),
            active: true,
        };
        assert_eq!(pos.bytes_behind(), 300);
    }
}
