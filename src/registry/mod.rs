//! Connection Registry
//!
//! Maps logical connection names to pooled database handles. Pools are
//! created lazily on first use and shared by every caller resolving the same
//! name. Resolving returns a [`ConnectionHandle`], a scoped guard that
//! borrows the registry and holds one concurrency permit for the name until
//! it is dropped.

pub mod endpoints;

use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::config::{Config, ConnectionInfo};
use crate::db::memory::MEMORY_SCHEME;
use crate::db::{Database, DbError, DbResult, MemoryConnector, MemoryNetwork, PgConnector};
use crate::persist::PersistError;

pub use endpoints::{EndpointEntry, EndpointRegistry, EndpointRole, RepointOutcome};

/// Default budget for a health round-trip.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from the connection and endpoint registries.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Nothing is registered under the name.
    #[error("no connection registered as '{0}'")]
    UnresolvedRole(String),

    /// The pool for a name could not be built.
    #[error("connection '{name}' failed: {source}")]
    Connect {
        /// Connection name.
        name: String,
        /// Driver error.
        #[source]
        source: DbError,
    },

    /// Every permit for the name stayed busy past the acquire timeout.
    #[error("timed out waiting for a free '{0}' connection")]
    Saturated(String),

    /// A health round-trip failed where liveness was required.
    #[error("'{name}' is not live: {reason}")]
    NotLive {
        /// Connection name.
        name: String,
        /// Why the round-trip failed.
        reason: String,
    },

    /// A liveness proof was too old to justify a repoint.
    #[error("liveness proof for '{name}' is {age_ms}ms old")]
    StaleProof {
        /// Connection name.
        name: String,
        /// Age of the proof.
        age_ms: i64,
    },

    /// The registry was closed.
    #[error("connection registry is closed")]
    Closed,

    /// The endpoint registry file could not be read or written.
    #[error("endpoint registry persistence: {0}")]
    Persist(#[from] PersistError),
}

impl RegistryError {
    /// Whether the condition may clear up on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Connect { source, .. } => source.is_transient(),
            RegistryError::Saturated(_) | RegistryError::NotLive { .. } => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

/// Builds a database handle from connection parameters.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Create (or look up) the pooled database for `info`.
    async fn connect(&self, info: &ConnectionInfo) -> DbResult<Arc<dyn Database>>;
}

/// Dispatches on the DSN scheme: `memory://` to the simulation, anything
/// else to PostgreSQL.
#[derive(Clone, Default)]
pub struct SchemeConnector {
    postgres: PgConnector,
    memory: MemoryConnector,
}

impl SchemeConnector {
    /// Connector whose `memory://` nodes live on `network`.
    pub fn with_network(network: MemoryNetwork) -> Self {
        Self {
            postgres: PgConnector::default(),
            memory: MemoryConnector::new(network),
        }
    }
}

#[async_trait]
impl Connector for SchemeConnector {
    async fn connect(&self, info: &ConnectionInfo) -> DbResult<Arc<dyn Database>> {
        if info.dsn.starts_with(MEMORY_SCHEME) {
            self.memory.connect(info).await
        } else {
            self.postgres.connect(info).await
        }
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A resolved connection. Derefs to the [`Database`]; dropping it returns
/// the concurrency permit.
pub struct ConnectionHandle<'a> {
    name: String,
    db: Arc<dyn Database>,
    _permit: OwnedSemaphorePermit,
    _registry: PhantomData<&'a ConnectionRegistry>,
}

impl ConnectionHandle<'_> {
    /// Name the handle was resolved from.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Deref for ConnectionHandle<'_> {
    type Target = dyn Database;

    fn deref(&self) -> &Self::Target {
        self.db.as_ref()
    }
}

impl std::fmt::Debug for ConnectionHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.name)
            .field("driver", &self.db.driver())
            .finish()
    }
}

/// Proof that a connection answered a health round-trip.
///
/// Only [`ConnectionRegistry::confirm_live`] creates one, and the endpoint
/// registry refuses to repoint a role without it.
#[derive(Debug, Clone)]
pub struct LiveEndpoint {
    name: String,
    confirmed_at: DateTime<Utc>,
}

impl LiveEndpoint {
    /// Connection that was confirmed.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the round-trip succeeded.
    pub fn confirmed_at(&self) -> DateTime<Utc> {
        self.confirmed_at
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Entry {
    info: ConnectionInfo,
    db: OnceCell<Arc<dyn Database>>,
    permits: Arc<Semaphore>,
}

impl Entry {
    fn new(info: ConnectionInfo) -> Self {
        let permits = Arc::new(Semaphore::new(info.max_connections.max(1) as usize));
        Self {
            info,
            db: OnceCell::new(),
            permits,
        }
    }
}

/// Named, pooled database connections.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    entries: DashMap<String, Arc<Entry>>,
    health_timeout: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("names", &self.names())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Empty registry building pools with `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            entries: DashMap::new(),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            closed: AtomicBool::new(false),
        }
    }

    /// Registry pre-populated with every connection in `config`.
    pub fn from_config(connector: Arc<dyn Connector>, config: &Config) -> Self {
        let registry = Self::new(connector);
        for (name, info) in &config.connections {
            registry.register(name, info.clone());
        }
        registry
    }

    /// Override the health round-trip budget.
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Register (or replace) a connection. Replacing drops the old pool once
    /// its outstanding handles are gone.
    pub fn register(&self, name: &str, info: ConnectionInfo) {
        debug!(connection = name, dsn = %redact_dsn(&info.dsn), "registering connection");
        self.entries
            .insert(name.to_string(), Arc::new(Entry::new(info)));
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Connection parameters for `name`.
    pub fn info(&self, name: &str) -> Option<ConnectionInfo> {
        self.entries.get(name).map(|e| e.info.clone())
    }

    /// Resolve `name` to a pooled handle.
    pub async fn resolve(&self, name: &str) -> Result<ConnectionHandle<'_>, RegistryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        let entry = self
            .entries
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RegistryError::UnresolvedRole(name.to_string()))?;

        let permit = tokio::time::timeout(
            entry.info.connect_timeout(),
            Arc::clone(&entry.permits).acquire_owned(),
        )
        .await
        .map_err(|_| RegistryError::Saturated(name.to_string()))?
        .map_err(|_| RegistryError::Closed)?;

        let db = entry
            .db
            .get_or_try_init(|| self.connector.connect(&entry.info))
            .await
            .map_err(|source| RegistryError::Connect {
                name: name.to_string(),
                source,
            })?;

        Ok(ConnectionHandle {
            name: name.to_string(),
            db: Arc::clone(db),
            _permit: permit,
            _registry: PhantomData,
        })
    }

    /// `SELECT 1` round-trip under the health timeout. Never errors.
    pub async fn health(&self, name: &str) -> bool {
        match self.round_trip(name).await {
            Ok(()) => true,
            Err(reason) => {
                debug!(connection = name, %reason, "health check failed");
                false
            }
        }
    }

    async fn round_trip(&self, name: &str) -> Result<(), String> {
        let attempt = async {
            let handle = self.resolve(name).await.map_err(|e| e.to_string())?;
            handle.ping().await.map_err(|e| e.to_string())
        };
        match tokio::time::timeout(self.health_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "no answer within {}ms",
                self.health_timeout.as_millis()
            )),
        }
    }

    /// Health round-trip that yields a [`LiveEndpoint`] proof on success.
    pub async fn confirm_live(&self, name: &str) -> Result<LiveEndpoint, RegistryError> {
        if !self.entries.contains_key(name) {
            return Err(RegistryError::UnresolvedRole(name.to_string()));
        }
        self.round_trip(name)
            .await
            .map_err(|reason| RegistryError::NotLive {
                name: name.to_string(),
                reason,
            })?;
        Ok(LiveEndpoint {
            name: name.to_string(),
            confirmed_at: Utc::now(),
        })
    }

    /// Shut every pool down. Further `resolve` calls fail with `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<(String, Arc<Entry>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (name, entry) in entries {
            entry.permits.close();
            if let Some(db) = entry.db.get() {
                db.close().await;
                debug!(connection = %name, "pool closed");
            }
        }
        info!("connection registry closed");
    }
}

/// Mask the password in a DSN for logging.
///
/// Handles both URL (`postgres://user:pw@host/db`) and keyword
/// (`host=x password=pw`) forms.
pub fn redact_dsn(dsn: &str) -> String {
    if let Some(scheme_end) = dsn.find("://") {
        let rest = &dsn[scheme_end + 3..];
        if let Some(at) = rest.find('@') {
            let userinfo = &rest[..at];
            if let Some(colon) = userinfo.find(':') {
                return format!(
                    "{}{}:***{}",
                    &dsn[..scheme_end + 3],
                    &userinfo[..colon],
                    &rest[at..]
                );
            }
        }
        return dsn.to_string();
    }
    dsn.split_whitespace()
        .map(|kv| {
            if kv.starts_with("password=") {
                "password=***".to_string()
            } else {
                kv.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::db::FaultPoint;

    fn memory_registry() -> (MemoryNetwork, ConnectionRegistry) {
        let network = MemoryNetwork::new();
        let registry =
            ConnectionRegistry::new(Arc::new(MemoryConnector::new(network.clone())))
                .with_health_timeout(Duration::from_millis(200));
        registry.register("legacy", ConnectionInfo::new(MemoryNetwork::dsn("legacy")));
        (network, registry)
    }

    #[tokio::test]
    async fn test_resolve_unknown_name() {
        let (_net, registry) = memory_registry();
        let err = registry.resolve("nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnresolvedRole(ref n) if n == "nope"));
    }

    #[tokio::test]
    async fn test_resolve_reuses_pool() {
        let (net, registry) = memory_registry();
        {
            let handle = registry.resolve("legacy").await.unwrap();
            assert_eq!(handle.name(), "legacy");
            handle.ping().await.unwrap();
        }
        registry.resolve("legacy").await.unwrap();
        assert!(net.get("legacy").is_some());
    }

    #[tokio::test]
    async fn test_permits_bound_concurrent_handles() {
        let network = MemoryNetwork::new();
        let registry = ConnectionRegistry::new(Arc::new(MemoryConnector::new(network)));
        let mut info = ConnectionInfo::new("memory://one");
        info.max_connections = 1;
        info.connect_timeout_ms = 50;
        registry.register("one", info);

        let held = registry.resolve("one").await.unwrap();
        let err = registry.resolve("one").await.unwrap_err();
        assert!(matches!(err, RegistryError::Saturated(_)));
        drop(held);
        registry.resolve("one").await.unwrap();
    }

    #[tokio::test]
    async fn test_health_never_errors() {
        let (net, registry) = memory_registry();
        assert!(registry.health("legacy").await);
        assert!(!registry.health("missing").await);

        net.node("legacy").fail_next(FaultPoint::Ping, 1);
        assert!(!registry.health("legacy").await);

        net.node("legacy").set_latency(Duration::from_millis(500));
        assert!(!registry.health("legacy").await);
    }

    #[tokio::test]
    async fn test_confirm_live() {
        let (net, registry) = memory_registry();
        let proof = registry.confirm_live("legacy").await.unwrap();
        assert_eq!(proof.name(), "legacy");

        net.node("legacy").set_unreachable(true);
        assert!(matches!(
            registry.confirm_live("legacy").await,
            Err(RegistryError::NotLive { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_resolve() {
        let (_net, registry) = memory_registry();
        registry.resolve("legacy").await.unwrap();
        registry.close().await;
        assert!(matches!(
            registry.resolve("legacy").await,
            Err(RegistryError::Closed)
        ));
    }

    #[test]
    fn test_redact_dsn() {
        assert_eq!(
            redact_dsn("postgres://app:hunter2@db:5432/app"),
            "postgres://app:***@db:5432/app"
        );
        assert_eq!(
            redact_dsn("postgres://app@db/app"),
            "postgres://app@db/app"
        );
        assert_eq!(
            redact_dsn("host=db user=app password=hunter2"),
            "host=db user=app password=***"
        );
    }
}
