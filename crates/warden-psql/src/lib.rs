//! `psql` backend: PostgreSQL clusters managed by the Zalando operator, reached
//! through `kubectl`. Snapshots are logical dumps kept in a local repository;
//! restores create a new cluster and load the dump into it.

pub mod cluster;
pub mod entity;
pub mod kubectl;
pub mod manager;
mod restore;
pub mod runner;
pub mod test_utils;

pub const PSQL_TYPE: &str = "psql";

pub use cluster::{ClusterApi, ClusterError, Postgresql, Secret};
pub use entity::PsqlEntity;
pub use kubectl::{Kubectl, KubectlClusterApi};
pub use manager::{PsqlConfig, PsqlFactory, PsqlSettings, PsqlTypeManager};
pub use restore::{destination_descriptor, destination_name};
pub use runner::{CommandRunner, CommandSpec, ProcessRunner, RunningCommand};
