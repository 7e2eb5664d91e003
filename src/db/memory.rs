//! In-process database simulation
//!
//! `MemoryDatabase` models the parts of a PostgreSQL server the orchestrator
//! relies on: tables keyed by their first column, a write-ahead log with
//! monotonically increasing LSNs, logical slots that pin a position in that
//! log, publications, and subscriptions whose apply worker pulls published
//! changes from a source node on a timer.
//!
//! Nodes live in a [`MemoryNetwork`] and find each other through
//! `memory://<node>` connection strings, which is also the DSN form the
//! [`MemoryConnector`] understands.
//!
//! Every node carries fault switches (unreachable, latency, per-operation
//! failures, truncated exports, paused apply, read-only) so failure paths can
//! be exercised deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::{
    quote_ident, quote_table, row_hash, Database, DbError, DbResult, Lsn, Sampling, SlotInfo,
    SlotPosition, SnapshotChunk, SnapshotInfo, SubscriptionSpec, TableChecksum, CHECKSUM_MODULUS,
    PROBE_TABLE,
};
use crate::config::ConnectionInfo;
use crate::registry::Connector;

/// DSN scheme handled by [`MemoryConnector`].
pub const MEMORY_SCHEME: &str = "memory://";

/// First LSN handed out by a fresh node.
const INITIAL_LSN: u64 = 0x0100_0000;

/// Fixed per-record WAL overhead.
const WAL_RECORD_OVERHEAD: u64 = 64;

/// Rows per streamed snapshot chunk.
const ROWS_PER_CHUNK: usize = 256;

/// Maximum WAL records one apply tick consumes.
const APPLY_BATCH: usize = 1024;

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `ping`
    Ping,
    /// `current_lsn`
    CurrentLsn,
    /// `row_count`
    RowCount,
    /// `table_checksum`
    Checksum,
    /// `ensure_publication` / `drop_publication`
    Publication,
    /// `export_snapshot`, before the slot is created
    Export,
    /// `slot_position` / `list_slots` / `drop_slot`
    Slot,
    /// `apply_schema` / `truncate` / `copy_in`
    Import,
    /// `create_subscription` / `drop_subscription`
    Subscription,
    /// `probe_write`
    Probe,
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

type NodeMap = DashMap<String, Arc<MemoryDatabase>>;

/// A set of simulated database nodes that can replicate between each other.
#[derive(Clone)]
pub struct MemoryNetwork {
    nodes: Arc<NodeMap>,
    apply_interval: Duration,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create an empty network with a 10ms apply interval.
    pub fn new() -> Self {
        Self::with_apply_interval(Duration::from_millis(10))
    }

    /// Create an empty network whose subscriptions apply changes every `interval`.
    pub fn with_apply_interval(interval: Duration) -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
            apply_interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Get a node, creating it on first use.
    pub fn node(&self, name: &str) -> Arc<MemoryDatabase> {
        self.nodes
            .entry(name.to_string())
            .or_insert_with(|| {
                MemoryDatabase::new(name, Arc::downgrade(&self.nodes), self.apply_interval)
            })
            .value()
            .clone()
    }

    /// Get an existing node.
    pub fn get(&self, name: &str) -> Option<Arc<MemoryDatabase>> {
        self.nodes.get(name).map(|n| n.value().clone())
    }

    /// Connection string that addresses `name` on this network.
    pub fn dsn(name: &str) -> String {
        format!("{MEMORY_SCHEME}{name}")
    }
}

fn lookup(network: &Weak<NodeMap>, conninfo: &str) -> Option<Arc<MemoryDatabase>> {
    let name = node_name(conninfo)?;
    let nodes = network.upgrade()?;
    let node = nodes.get(name)?.value().clone();
    Some(node)
}

fn node_name(conninfo: &str) -> Option<&str> {
    conninfo
        .strip_prefix(MEMORY_SCHEME)
        .map(|rest| rest.split(['/', '?']).next().unwrap_or(rest))
        .filter(|name| !name.is_empty())
}

/// Connector that resolves `memory://<node>` DSNs against a [`MemoryNetwork`].
#[derive(Clone, Default)]
pub struct MemoryConnector {
    network: MemoryNetwork,
}

impl MemoryConnector {
    /// Connector bound to `network`.
    pub fn new(network: MemoryNetwork) -> Self {
        Self { network }
    }

    /// The network this connector resolves against.
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, info: &ConnectionInfo) -> DbResult<Arc<dyn Database>> {
        let name = node_name(&info.dsn).ok_or_else(|| {
            DbError::Connection(format!("not a {MEMORY_SCHEME} connection string"))
        })?;
        Ok(self.network.node(name))
    }
}

// ---------------------------------------------------------------------------
// Node state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<String>,
    rows: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
enum Change {
    Upsert { table: String, row: Vec<String> },
    Delete { table: String, key: String },
    Truncate { table: String },
}

impl Change {
    fn table(&self) -> &str {
        match self {
            Change::Upsert { table, .. }
            | Change::Delete { table, .. }
            | Change::Truncate { table } => table,
        }
    }

    fn payload_len(&self) -> u64 {
        let len = match self {
            Change::Upsert { row, .. } => row.iter().map(String::len).sum(),
            Change::Delete { key, .. } => key.len(),
            Change::Truncate { .. } => 0,
        };
        len as u64
    }
}

#[derive(Debug)]
struct WalRecord {
    lsn: Lsn,
    change: Change,
}

#[derive(Debug)]
struct Slot {
    confirmed: Lsn,
    active: bool,
}

struct Subscription {
    spec: SubscriptionSpec,
    stopped: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

struct Inner {
    tables: BTreeMap<String, Table>,
    wal: Vec<WalRecord>,
    lsn: u64,
    slots: BTreeMap<String, Slot>,
    publications: BTreeMap<String, Vec<String>>,
    subscriptions: BTreeMap<String, Subscription>,
    read_only: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            wal: Vec::new(),
            lsn: INITIAL_LSN,
            slots: BTreeMap::new(),
            publications: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            read_only: false,
        }
    }

    fn table(&self, name: &str) -> DbResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::NotFound(format!("relation \"{name}\" does not exist")))
    }

    fn apply(&mut self, change: &Change) -> DbResult<()> {
        let table = self.tables.get_mut(change.table()).ok_or_else(|| {
            DbError::NotFound(format!("relation \"{}\" does not exist", change.table()))
        })?;
        match change {
            Change::Upsert { row, .. } => {
                if row.len() != table.columns.len() {
                    return Err(DbError::Query(format!(
                        "expected {} columns, got {}",
                        table.columns.len(),
                        row.len()
                    )));
                }
                let key = row.first().cloned().unwrap_or_default();
                table.rows.insert(key, row.clone());
            }
            Change::Delete { key, .. } => {
                table.rows.remove(key);
            }
            Change::Truncate { .. } => table.rows.clear(),
        }
        Ok(())
    }

    /// Apply a change and append it to the WAL.
    fn write(&mut self, change: Change) -> DbResult<Lsn> {
        self.apply(&change)?;
        self.lsn += WAL_RECORD_OVERHEAD + change.payload_len();
        let lsn = Lsn(self.lsn);
        self.wal.push(WalRecord { lsn, change });
        Ok(lsn)
    }

    fn ensure_writable(&self) -> DbResult<()> {
        if self.read_only {
            return Err(DbError::Query(
                "cannot execute statement in a read-only transaction".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryDatabase
// ---------------------------------------------------------------------------

/// One simulated database node.
pub struct MemoryDatabase {
    name: String,
    me: Weak<MemoryDatabase>,
    network: Weak<NodeMap>,
    apply_interval: Duration,
    inner: Mutex<Inner>,
    unreachable: AtomicBool,
    apply_paused: AtomicBool,
    latency: Mutex<Duration>,
    faults: Mutex<HashMap<FaultPoint, u32>>,
    export_truncate_after: Mutex<Option<usize>>,
    snapshot_seq: AtomicU64,
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MemoryDatabase {
    fn new(name: &str, network: Weak<NodeMap>, apply_interval: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: name.to_string(),
            me: me.clone(),
            network,
            apply_interval,
            inner: Mutex::new(Inner::new()),
            unreachable: AtomicBool::new(false),
            apply_paused: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            faults: Mutex::new(HashMap::new()),
            export_truncate_after: Mutex::new(None),
            snapshot_seq: AtomicU64::new(1),
        })
    }

    /// Node name on its network.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn enter(&self, point: FaultPoint) -> DbResult<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DbError::Connection(format!(
                "{}: connection refused",
                self.name
            )));
        }
        let mut faults = self.faults.lock();
        if let Some(remaining) = faults.get_mut(&point) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DbError::Connection(format!(
                    "{}: injected failure at {point:?}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    // -- data helpers -------------------------------------------------------

    /// Create a table. The first column is the primary key.
    pub fn create_table(&self, table: &str, columns: &[&str]) {
        let mut inner = self.inner.lock();
        inner.tables.entry(table.to_string()).or_insert_with(|| Table {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: BTreeMap::new(),
        });
    }

    /// Insert a row through the WAL.
    pub fn insert(&self, table: &str, values: &[&str]) -> DbResult<Lsn> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        let key = values.first().copied().unwrap_or_default();
        if inner.table(table)?.rows.contains_key(key) {
            return Err(DbError::Query(format!(
                "duplicate key value violates unique constraint on \"{table}\""
            )));
        }
        inner.write(Change::Upsert {
            table: table.to_string(),
            row: values.iter().map(|v| v.to_string()).collect(),
        })
    }

    /// Replace the row sharing the first column's value, through the WAL.
    pub fn update(&self, table: &str, values: &[&str]) -> DbResult<Lsn> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        inner.write(Change::Upsert {
            table: table.to_string(),
            row: values.iter().map(|v| v.to_string()).collect(),
        })
    }

    /// Delete a row by key, through the WAL.
    pub fn delete(&self, table: &str, key: &str) -> DbResult<Lsn> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        inner.write(Change::Delete {
            table: table.to_string(),
            key: key.to_string(),
        })
    }

    /// Overwrite one field without logging the change, so it never replicates.
    pub fn corrupt(&self, table: &str, key: &str, column: usize, value: &str) -> DbResult<()> {
        let mut inner = self.inner.lock();
        let row = inner
            .tables
            .get_mut(table)
            .and_then(|t| t.rows.get_mut(key))
            .ok_or_else(|| DbError::NotFound(format!("{table}/{key}")))?;
        let field = row
            .get_mut(column)
            .ok_or_else(|| DbError::NotFound(format!("{table}/{key} column {column}")))?;
        *field = value.to_string();
        Ok(())
    }

    /// Rows of a table in key order. Empty if the table does not exist.
    pub fn rows(&self, table: &str) -> Vec<Vec<String>> {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a table exists.
    pub fn has_table(&self, table: &str) -> bool {
        self.inner.lock().tables.contains_key(table)
    }

    // -- fault switches -----------------------------------------------------

    /// Refuse every call while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `times` calls at `point` with a connection error.
    pub fn fail_next(&self, point: FaultPoint, times: u32) {
        self.faults.lock().insert(point, times);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Drop the connection after `chunks` snapshot chunks have been sent.
    pub fn truncate_export_after(&self, chunks: Option<usize>) {
        *self.export_truncate_after.lock() = chunks;
    }

    /// Stop (or resume) this node's subscription apply workers.
    pub fn pause_apply(&self, paused: bool) {
        self.apply_paused.store(paused, Ordering::SeqCst);
    }

    /// Reject writes while set.
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.lock().read_only = read_only;
    }

    /// Whether writes are rejected.
    pub fn is_read_only(&self) -> bool {
        self.inner.lock().read_only
    }

    // -- inspection ---------------------------------------------------------

    /// Names of all replication slots.
    pub fn slot_names(&self) -> Vec<String> {
        self.inner.lock().slots.keys().cloned().collect()
    }

    /// Whether a slot exists.
    pub fn has_slot(&self, slot: &str) -> bool {
        self.inner.lock().slots.contains_key(slot)
    }

    /// Whether a publication exists.
    pub fn has_publication(&self, name: &str) -> bool {
        self.inner.lock().publications.contains_key(name)
    }

    /// Tables covered by a publication.
    pub fn publication_tables(&self, name: &str) -> Option<Vec<String>> {
        self.inner.lock().publications.get(name).cloned()
    }

    /// Whether a subscription exists.
    pub fn has_subscription(&self, name: &str) -> bool {
        self.inner.lock().subscriptions.contains_key(name)
    }

    /// Create a slot directly, as a leftover from some earlier process would.
    pub fn create_slot(&self, slot: &str) {
        let mut inner = self.inner.lock();
        let confirmed = Lsn(inner.lsn);
        inner.slots.entry(slot.to_string()).or_insert(Slot {
            confirmed,
            active: false,
        });
    }

    // -- replication --------------------------------------------------------

    fn spawn_apply_worker(
        &self,
        spec: SubscriptionSpec,
        stopped: Arc<AtomicBool>,
    ) -> DbResult<JoinHandle<()>> {
        if node_name(&spec.source_conninfo).is_none() {
            return Err(DbError::Connection(format!(
                "cannot reach {}",
                spec.source_conninfo
            )));
        }
        let me = self.me.clone();
        let network = self.network.clone();
        let interval = self.apply_interval;

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                let Some(target) = me.upgrade() else { break };
                if target.apply_paused.load(Ordering::SeqCst)
                    || target.unreachable.load(Ordering::SeqCst)
                {
                    continue;
                }
                let Some(source) = lookup(&network, &spec.source_conninfo) else {
                    continue;
                };
                if source.unreachable.load(Ordering::SeqCst) {
                    continue;
                }
                match apply_once(&source, &target, &spec, &stopped) {
                    Ok(0) => {}
                    Ok(applied) => trace!(
                        subscription = %spec.name,
                        applied,
                        "applied replicated changes"
                    ),
                    Err(e) => warn!(
                        subscription = %spec.name,
                        error = %e,
                        "apply worker error"
                    ),
                }
            }
        }))
    }
}

/// Pull one batch of published changes from `source` and apply it to `target`.
fn apply_once(
    source: &MemoryDatabase,
    target: &MemoryDatabase,
    spec: &SubscriptionSpec,
    stopped: &AtomicBool,
) -> DbResult<usize> {
    let (batch, horizon) = {
        let mut guard = source.inner.lock();
        if stopped.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let src = &mut *guard;
        let published = src
            .publications
            .get(&spec.publication)
            .ok_or_else(|| {
                DbError::NotFound(format!("publication \"{}\" does not exist", spec.publication))
            })?
            .clone();
        let slot = src.slots.get_mut(&spec.slot).ok_or_else(|| {
            DbError::NotFound(format!("replication slot \"{}\" does not exist", spec.slot))
        })?;
        slot.active = true;

        let start = src.wal.partition_point(|r| r.lsn <= slot.confirmed);
        let end = (start + APPLY_BATCH).min(src.wal.len());
        let records = &src.wal[start..end];
        let horizon = if end < src.wal.len() {
            records.last().map(|r| r.lsn).unwrap_or(slot.confirmed)
        } else {
            Lsn(src.lsn)
        };
        let batch: Vec<Change> = records
            .iter()
            .filter(|r| published.iter().any(|t| t == r.change.table()))
            .map(|r| r.change.clone())
            .collect();
        (batch, horizon)
    };

    {
        let mut tgt = target.inner.lock();
        for change in &batch {
            tgt.write(change.clone())?;
        }
    }

    let mut src = source.inner.lock();
    if !stopped.load(Ordering::SeqCst) {
        if let Some(slot) = src.slots.get_mut(&spec.slot) {
            slot.confirmed = slot.confirmed.max(horizon);
        }
    }
    Ok(batch.len())
}

// ---------------------------------------------------------------------------
// COPY text format
// ---------------------------------------------------------------------------

fn encode_copy_row(fields: &[String], out: &mut String) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        for c in field.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '\t' => out.push_str("\\t"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                c => out.push(c),
            }
        }
    }
    out.push('\n');
}

fn decode_copy_line(line: &str) -> Vec<String> {
    line.split('\t')
        .map(|field| {
            let mut value = String::with_capacity(field.len());
            let mut chars = field.chars();
            while let Some(c) = chars.next() {
                if c != '\\' {
                    value.push(c);
                    continue;
                }
                match chars.next() {
                    Some('t') => value.push('\t'),
                    Some('n') => value.push('\n'),
                    Some('r') => value.push('\r'),
                    Some(other) => value.push(other),
                    None => value.push('\\'),
                }
            }
            value
        })
        .collect()
}

fn table_ddl(table: &str, columns: &[String]) -> DbResult<String> {
    let cols: Vec<String> = columns
        .iter()
        .map(|c| format!("{} text", quote_ident(c)))
        .collect();
    let pk = columns
        .first()
        .map(|c| format!(", PRIMARY KEY ({})", quote_ident(c)))
        .unwrap_or_default();
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({}{pk})",
        quote_table(table)?,
        cols.join(", ")
    ))
}

/// Column names from a `CREATE TABLE` statement produced by [`table_ddl`].
fn ddl_columns(ddl: &str) -> DbResult<Vec<String>> {
    let open = ddl.find('(');
    let close = ddl.rfind(')');
    let (Some(open), Some(close)) = (open, close) else {
        return Err(DbError::Query(format!("unsupported DDL: {ddl}")));
    };
    let mut columns = Vec::new();
    for part in ddl[open + 1..close].split(',') {
        let part = part.trim();
        if part.is_empty() || part.starts_with("PRIMARY KEY") {
            continue;
        }
        let name = if let Some(rest) = part.strip_prefix('"') {
            let mut name = String::new();
            let mut chars = rest.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        name.push('"');
                        continue;
                    }
                    break;
                }
                name.push(c);
            }
            name
        } else {
            part.split_whitespace().next().unwrap_or_default().to_string()
        };
        columns.push(name);
    }
    if columns.is_empty() {
        return Err(DbError::Query(format!("no columns in DDL: {ddl}")));
    }
    Ok(columns)
}

// ---------------------------------------------------------------------------
// Database impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Database for MemoryDatabase {
    fn driver(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> DbResult<()> {
        self.enter(FaultPoint::Ping).await
    }

    async fn current_lsn(&self) -> DbResult<Lsn> {
        self.enter(FaultPoint::CurrentLsn).await?;
        Ok(Lsn(self.inner.lock().lsn))
    }

    async fn row_count(&self, table: &str) -> DbResult<u64> {
        self.enter(FaultPoint::RowCount).await?;
        Ok(self.inner.lock().table(table)?.rows.len() as u64)
    }

    async fn table_checksum(&self, table: &str, sampling: Sampling) -> DbResult<TableChecksum> {
        self.enter(FaultPoint::Checksum).await?;
        let inner = self.inner.lock();
        let mut rows_hashed = 0u64;
        let mut checksum = 0u64;
        for row in inner.table(table)?.rows.values() {
            let h = row_hash(row);
            if sampling.includes(h) {
                rows_hashed += 1;
                checksum = (checksum + h) % CHECKSUM_MODULUS;
            }
        }
        Ok(TableChecksum {
            rows_hashed,
            checksum,
        })
    }

    async fn ensure_publication(&self, name: &str, tables: &[String]) -> DbResult<()> {
        self.enter(FaultPoint::Publication).await?;
        let mut inner = self.inner.lock();
        for table in tables {
            inner.table(table)?;
        }
        inner.publications.insert(name.to_string(), tables.to_vec());
        Ok(())
    }

    async fn drop_publication(&self, name: &str) -> DbResult<bool> {
        self.enter(FaultPoint::Publication).await?;
        Ok(self.inner.lock().publications.remove(name).is_some())
    }

    async fn export_snapshot(
        &self,
        slot: &str,
        tables: &[String],
        chunks: mpsc::Sender<SnapshotChunk>,
    ) -> DbResult<SnapshotInfo> {
        self.enter(FaultPoint::Export).await?;

        let (consistent_lsn, snapshot) = {
            let mut inner = self.inner.lock();
            let mut snapshot = Vec::with_capacity(tables.len());
            for table in tables {
                let t = inner.table(table)?;
                let rows: Vec<Vec<String>> = t.rows.values().cloned().collect();
                snapshot.push((table.clone(), t.columns.clone(), rows));
            }
            if inner.slots.contains_key(slot) {
                return Err(DbError::Query(format!(
                    "replication slot \"{slot}\" already exists"
                )));
            }
            let consistent_lsn = Lsn(inner.lsn);
            inner.slots.insert(
                slot.to_string(),
                Slot {
                    confirmed: consistent_lsn,
                    active: false,
                },
            );
            (consistent_lsn, snapshot)
        };
        let snapshot_id = format!(
            "{:08X}-{:08X}-1",
            self.snapshot_seq.fetch_add(1, Ordering::SeqCst),
            consistent_lsn.0 & 0xFFFF_FFFF
        );
        debug!(node = %self.name, slot, %consistent_lsn, "snapshot anchored");

        let truncate_after = *self.export_truncate_after.lock();
        let mut sent = 0usize;
        for (table, columns, rows) in snapshot {
            let total = rows.len() as u64;
            let mut stream = vec![SnapshotChunk::Schema {
                table: table.clone(),
                ddl: table_ddl(&table, &columns)?,
            }];
            for batch in rows.chunks(ROWS_PER_CHUNK) {
                let mut data = String::new();
                for row in batch {
                    encode_copy_row(row, &mut data);
                }
                stream.push(SnapshotChunk::Rows {
                    table: table.clone(),
                    data: Bytes::from(data),
                    rows: batch.len() as u64,
                });
            }
            stream.push(SnapshotChunk::TableEnd { table, rows: total });

            for chunk in stream {
                if truncate_after.is_some_and(|limit| sent >= limit) {
                    return Err(DbError::Connection(
                        "server closed the connection unexpectedly".to_string(),
                    ));
                }
                chunks.send(chunk).await.map_err(|_| DbError::ConsumerGone)?;
                sent += 1;
            }
        }

        Ok(SnapshotInfo {
            snapshot_id,
            consistent_lsn,
        })
    }

    async fn drop_slot(&self, slot: &str) -> DbResult<bool> {
        self.enter(FaultPoint::Slot).await?;
        let mut inner = self.inner.lock();
        match inner.slots.get(slot) {
            None => Ok(false),
            Some(s) if s.active => Err(DbError::Query(format!(
                "replication slot \"{slot}\" is active"
            ))),
            Some(_) => {
                inner.slots.remove(slot);
                Ok(true)
            }
        }
    }

    async fn list_slots(&self, prefix: &str) -> DbResult<Vec<SlotInfo>> {
        self.enter(FaultPoint::Slot).await?;
        Ok(self
            .inner
            .lock()
            .slots
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, slot)| SlotInfo {
                name: name.clone(),
                confirmed_flush_lsn: Some(slot.confirmed),
                active: slot.active,
            })
            .collect())
    }

    async fn slot_position(&self, slot: &str) -> DbResult<Option<SlotPosition>> {
        self.enter(FaultPoint::Slot).await?;
        let inner = self.inner.lock();
        Ok(inner.slots.get(slot).map(|s| SlotPosition {
            current_lsn: Lsn(inner.lsn),
            confirmed_flush_lsn: Some(s.confirmed),
            active: s.active,
        }))
    }

    async fn apply_schema(&self, table: &str, ddl: &str) -> DbResult<()> {
        self.enter(FaultPoint::Import).await?;
        let columns = ddl_columns(ddl)?;
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        inner
            .tables
            .entry(table.to_string())
            .or_insert_with(|| Table {
                columns,
                rows: BTreeMap::new(),
            });
        Ok(())
    }

    async fn truncate(&self, table: &str) -> DbResult<()> {
        self.enter(FaultPoint::Import).await?;
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        inner.write(Change::Truncate {
            table: table.to_string(),
        })?;
        Ok(())
    }

    async fn copy_in(&self, table: &str, data: Bytes) -> DbResult<u64> {
        self.enter(FaultPoint::Import).await?;
        let text = std::str::from_utf8(&data)
            .map_err(|e| DbError::Query(format!("invalid COPY data: {e}")))?;
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        let mut loaded = 0u64;
        for line in text.lines().filter(|l| !l.is_empty()) {
            inner.write(Change::Upsert {
                table: table.to_string(),
                row: decode_copy_line(line),
            })?;
            loaded += 1;
        }
        Ok(loaded)
    }

    async fn create_subscription(&self, spec: &SubscriptionSpec) -> DbResult<()> {
        self.enter(FaultPoint::Subscription).await?;

        let source = lookup(&self.network, &spec.source_conninfo).ok_or_else(|| {
            DbError::Connection(format!(
                "could not connect to the publisher: {}",
                spec.source_conninfo
            ))
        })?;
        if source.unreachable.load(Ordering::SeqCst) {
            return Err(DbError::Connection(
                "could not connect to the publisher: connection refused".into(),
            ));
        }
        if !source.has_slot(&spec.slot) {
            return Err(DbError::NotFound(format!(
                "replication slot \"{}\" does not exist",
                spec.slot
            )));
        }

        let mut inner = self.inner.lock();
        if inner.subscriptions.contains_key(&spec.name) {
            return Err(DbError::Query(format!(
                "subscription \"{}\" already exists",
                spec.name
            )));
        }
        let stopped = Arc::new(AtomicBool::new(false));
        let worker = self.spawn_apply_worker(spec.clone(), Arc::clone(&stopped))?;
        inner.subscriptions.insert(
            spec.name.clone(),
            Subscription {
                spec: spec.clone(),
                stopped,
                worker,
            },
        );
        Ok(())
    }

    async fn subscription_exists(&self, name: &str) -> DbResult<bool> {
        self.enter(FaultPoint::Subscription).await?;
        Ok(self.inner.lock().subscriptions.contains_key(name))
    }

    async fn drop_subscription(&self, name: &str) -> DbResult<bool> {
        self.enter(FaultPoint::Subscription).await?;
        let Some(sub) = self.inner.lock().subscriptions.remove(name) else {
            return Ok(false);
        };
        sub.stopped.store(true, Ordering::SeqCst);
        sub.worker.abort();

        if let Some(source) = lookup(&self.network, &sub.spec.source_conninfo) {
            if let Some(slot) = source.inner.lock().slots.get_mut(&sub.spec.slot) {
                slot.active = false;
            }
        }
        Ok(true)
    }

    async fn probe_write(&self) -> DbResult<()> {
        self.enter(FaultPoint::Probe).await?;
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        inner
            .tables
            .entry(PROBE_TABLE.to_string())
            .or_insert_with(|| Table {
                columns: vec!["id".to_string(), "written_at".to_string()],
                rows: BTreeMap::new(),
            });
        inner.write(Change::Upsert {
            table: PROBE_TABLE.to_string(),
            row: vec!["1".to_string(), chrono::Utc::now().to_rfc3339()],
        })?;
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn users(db: &MemoryDatabase) {
        db.create_table("users", &["id", "email"]);
        db.insert("users", &["1", "a@example.com"]).unwrap();
        db.insert("users", &["2", "b@example.com"]).unwrap();
        db.insert("users", &["3", "c@example.com"]).unwrap();
    }

    async fn drain(mut rx: mpsc::Receiver<SnapshotChunk>) -> Vec<SnapshotChunk> {
        let mut out = Vec::new();
        while let Some(c) = rx.recv().await {
            out.push(c);
        }
        out
    }

    #[test]
    fn test_copy_text_escaping() {
        let row = vec!["1".to_string(), "tab\there\nnew\\line".to_string()];
        let mut out = String::new();
        encode_copy_row(&row, &mut out);
        assert_eq!(out, "1\ttab\\there\\nnew\\\\line\n");
        assert_eq!(decode_copy_line(out.trim_end_matches('\n')), row);
    }

    #[test]
    fn test_ddl_round_trip() {
        let cols = vec!["id".to_string(), "full \"name\"".to_string()];
        let ddl = table_ddl("app.users", &cols).unwrap();
        assert_eq!(ddl_columns(&ddl).unwrap(), cols);
    }

    #[test]
    fn test_lsn_advances_with_writes() {
        let net = MemoryNetwork::new();
        let db = net.node("a");
        db.create_table("t", &["id"]);
        let first = db.insert("t", &["1"]).unwrap();
        let second = db.insert("t", &["2"]).unwrap();
        assert!(second > first);
        assert!(db.insert("t", &["1"]).is_err());
    }

    #[tokio::test]
    async fn test_export_anchors_slot_at_snapshot_point() {
        let net = MemoryNetwork::new();
        let db = net.node("src");
        users(&db);

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(drain(rx));
        let info = db
            .export_snapshot("pgshift_a", &["users".to_string()], tx)
            .await
            .unwrap();
        let chunks = handle.await.unwrap();

        assert_eq!(info.consistent_lsn, db.current_lsn().await.unwrap());
        assert!(db.has_slot("pgshift_a"));
        assert!(matches!(chunks.first(), Some(SnapshotChunk::Schema { .. })));
        assert!(matches!(chunks.last(), Some(SnapshotChunk::TableEnd { rows: 3, .. })));

        let (tx, _rx) = mpsc::channel(4);
        let err = db
            .export_snapshot("pgshift_a", &["users".to_string()], tx)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Query(_)));
    }

    #[tokio::test]
    async fn test_truncated_export_errors_mid_stream() {
        let net = MemoryNetwork::new();
        let db = net.node("src");
        users(&db);
        db.truncate_export_after(Some(1));

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(drain(rx));
        let err = db
            .export_snapshot("s", &["users".to_string()], tx)
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
        assert_eq!(handle.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_applies_published_changes() {
        let net = MemoryNetwork::with_apply_interval(Duration::from_millis(5));
        let src = net.node("src");
        let dst = net.node("dst");
        users(&src);
        src.create_table("audit", &["id"]);

        src.ensure_publication("pub", &["users".to_string()])
            .await
            .unwrap();
        src.create_slot("slot");
        dst.create_table("users", &["id", "email"]);
        dst.create_subscription(&SubscriptionSpec {
            name: "sub".into(),
            source_conninfo: MemoryNetwork::dsn("src"),
            publication: "pub".into(),
            slot: "slot".into(),
        })
        .await
        .unwrap();

        src.insert("users", &["4", "d@example.com"]).unwrap();
        src.insert("audit", &["x"]).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let pos = src.slot_position("slot").await.unwrap().unwrap();
            if pos.bytes_behind() == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "apply never caught up");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dst.rows("users").len(), 1);
        assert!(!dst.has_table("audit"));

        assert!(src.drop_slot("slot").await.is_err());
        assert!(dst.drop_subscription("sub").await.unwrap());
        assert!(src.drop_slot("slot").await.unwrap());
        assert!(!dst.drop_subscription("sub").await.unwrap());
    }

    #[tokio::test]
    async fn test_checksum_detects_corruption() {
        let net = MemoryNetwork::new();
        let a = net.node("a");
        let b = net.node("b");
        users(&a);
        users(&b);
        let ca = a.table_checksum("users", Sampling::Full).await.unwrap();
        assert_eq!(ca, b.table_checksum("users", Sampling::Full).await.unwrap());

        b.corrupt("users", "2", 1, "evil@example.com").unwrap();
        assert_ne!(ca, b.table_checksum("users", Sampling::Full).await.unwrap());
        assert_eq!(b.row_count("users").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_faults_and_read_only() {
        let net = MemoryNetwork::new();
        let db = net.node("a");
        db.fail_next(FaultPoint::Ping, 1);
        assert!(db.ping().await.is_err());
        db.ping().await.unwrap();

        db.set_read_only(true);
        assert!(db.probe_write().await.is_err());
        db.set_read_only(false);
        db.probe_write().await.unwrap();

        db.set_unreachable(true);
        assert!(db.current_lsn().await.unwrap_err().is_unreachable());
    }

    #[tokio::test]
    async fn test_connector_resolves_memory_dsn() {
        let connector = MemoryConnector::default();
        let db = connector
            .connect(&ConnectionInfo::new("memory://legacy"))
            .await
            .unwrap();
        assert_eq!(db.driver(), "memory");
        assert!(connector.network().get("legacy").is_some());
        assert!(connector
            .connect(&ConnectionInfo::new("postgres://x"))
            .await
            .is_err());
    }
}
