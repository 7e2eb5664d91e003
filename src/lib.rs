//! # pgshift
//!
//! Zero-downtime PostgreSQL migration orchestrator. Moves a set of tables
//! from a legacy server onto a new cluster using a consistent snapshot plus
//! logical replication, then cuts application writes over behind a brief
//! freeze.
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`coordinator`] | Job state machine, sync loop and cutover sequence |
//! | [`snapshot`] | Snapshot export into the backup store, and import |
//! | [`replication`] | Publication, slot and subscription lifecycle; lag; orphan sweep |
//! | [`validator`] | Row count and checksum comparison between source and target |
//! | [`rollback`] | Reverses a partial cutover |
//! | [`registry`] | Named connections and the `primary-write`/`read-only` roles |
//! | [`job`] | Job specs, persisted records and leases |
//! | [`db`] | Database driver trait, PostgreSQL and in-memory drivers |
//! | [`store`] | Object storage for snapshots |
//! | [`hooks`] | Application freeze/unfreeze hook |
//! | [`notify`] | State transition notifications |
//! | [`cluster`] | Target cluster management API |
//! | [`failover`] | Post-migration failover drill |
//! | [`metrics`] | Lag, transition and drill metrics |
//! | [`bootstrap`] | Wires everything from a [`config::Config`] |
//!
//! ## Quick Start
//!
//! ```no_run
//! use pgshift::bootstrap::Orchestrator;
//! use pgshift::config::Config;
//! use pgshift::job::JobSpec;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file("pgshift.toml".as_ref())?;
//! let orchestrator = Orchestrator::from_config(config).await?;
//! let spec = JobSpec::from_file("orders.toml".as_ref())?;
//! let job = orchestrator.coordinator.start(spec).await?;
//! println!("{} is {}", job.id(), job.state);
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod failover;
pub mod hooks;
pub mod job;
pub mod metrics;
pub mod notify;
pub mod persist;
pub mod registry;
pub mod replication;
pub mod rollback;
pub mod snapshot;
pub mod store;
pub mod validator;

pub use error::{ErrorClass, MigrationError, Result};
