//! Orchestrator wiring
//!
//! Builds every component from a [`Config`] in dependency order: state
//! directory, connection registry, endpoint registry, backup store,
//! exporter, replication controller, validator, hooks, notifier and
//! finally the [`Coordinator`]. Tests swap pieces through the builder.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::{ClusterApi, HttpClusterApi};
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorParts};
use crate::error::Result;
use crate::failover::FailoverHarness;
use crate::hooks::{FreezeHook, NoopFreezeHook, WebhookFreezeHook};
use crate::job::{JobStore, JobStoreError, LeaseManager};
use crate::notify::{LogSink, NotificationSink, Notifier};
use crate::registry::{ConnectionRegistry, Connector, EndpointRegistry, SchemeConnector};
use crate::replication::ReplicationController;
use crate::snapshot::SnapshotExporter;
use crate::store::BackupStore;
use crate::validator::ConsistencyValidator;

/// A fully wired orchestrator.
pub struct Orchestrator {
    /// Configuration it was built from.
    pub config: Config,
    /// The state machine.
    pub coordinator: Arc<Coordinator>,
    /// Named connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Endpoint roles.
    pub endpoints: Arc<EndpointRegistry>,
    /// Transition notifications.
    pub notifier: Arc<Notifier>,
    /// Target cluster API, when configured.
    pub cluster: Option<Arc<dyn ClusterApi>>,
}

impl Orchestrator {
    /// Build with every default.
    pub async fn from_config(config: Config) -> Result<Self> {
        OrchestratorBuilder::new(config).build().await
    }

    /// Failover drill harness, if a cluster API is configured.
    pub fn failover_harness(&self) -> Option<FailoverHarness> {
        self.cluster.as_ref().map(|api| {
            FailoverHarness::new(
                Arc::clone(api),
                Arc::clone(&self.registry),
                self.config.failover.clone(),
            )
        })
    }

    /// Flush notifications and close pools.
    pub async fn shutdown(&self) {
        self.notifier.close().await;
        self.registry.close().await;
        debug!("orchestrator shut down");
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: Config,
    connector: Option<Arc<dyn Connector>>,
    hook: Option<Arc<dyn FreezeHook>>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    store: Option<Arc<BackupStore>>,
    cluster: Option<Arc<dyn ClusterApi>>,
}

impl OrchestratorBuilder {
    /// Start from `config`.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            connector: None,
            hook: None,
            sinks: Vec::new(),
            store: None,
            cluster: None,
        }
    }

    /// Use `connector` instead of dispatching on DSN schemes.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use `hook` instead of the configured webhook.
    pub fn freeze_hook(mut self, hook: Arc<dyn FreezeHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Deliver notifications to `sink` in addition to the log. Replaces the
    /// configured webhook sink.
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Use `store` instead of the configured backup store.
    pub fn store(mut self, store: Arc<BackupStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `api` instead of the configured cluster API.
    pub fn cluster(mut self, api: Arc<dyn ClusterApi>) -> Self {
        self.cluster = Some(api);
        self
    }

    /// Validate the config and assemble everything.
    pub async fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;

        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .map_err(|e| JobStoreError::Persist(e.into()))?;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(SchemeConnector::default()));
        let registry = Arc::new(ConnectionRegistry::from_config(connector, &config));
        let endpoints = Arc::new(EndpointRegistry::open(&config.state_dir, &config.endpoints).await?);

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(BackupStore::from_config(&config.store)?),
        };

        let hook: Arc<dyn FreezeHook> = match self.hook {
            Some(hook) => hook,
            None => match WebhookFreezeHook::from_config(&config.hooks)? {
                Some(webhook) => Arc::new(webhook),
                None => Arc::new(NoopFreezeHook),
            },
        };

        let notifier = if self.sinks.is_empty() {
            Arc::new(Notifier::from_config(&config.notifications))
        } else {
            let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];
            sinks.extend(self.sinks);
            Arc::new(Notifier::new(sinks, config.notifications.queue_depth))
        };

        let cluster = match self.cluster {
            Some(api) => Some(api),
            None if config.cluster.base_url.is_some() => {
                Some(Arc::new(HttpClusterApi::from_config(&config.cluster)?) as Arc<dyn ClusterApi>)
            }
            None => None,
        };

        let replication = Arc::new(ReplicationController::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            config.replication.clone(),
        ));
        let exporter = SnapshotExporter::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            config.snapshot.clone(),
            config.replication.slot_prefix.clone(),
        );
        let validator = Arc::new(ConsistencyValidator::new(
            Arc::clone(&registry),
            config.validator.clone(),
        ));

        let coordinator = Arc::new(Coordinator::new(
            config.coordinator.clone(),
            CoordinatorParts {
                registry: Arc::clone(&registry),
                endpoints: Arc::clone(&endpoints),
                jobs: JobStore::new(&config.state_dir),
                leases: LeaseManager::new(&config.state_dir, config.coordinator.lease_ttl()),
                exporter,
                replication,
                validator,
                hook,
                notifier: Arc::clone(&notifier),
            },
        ));

        info!(
            state_dir = %config.state_dir.display(),
            connections = config.connections.len(),
            cluster_api = cluster.is_some(),
            "orchestrator ready"
        );

        Ok(Orchestrator {
            config,
            coordinator,
            registry,
            endpoints,
            notifier,
            cluster,
        })
    }
}
