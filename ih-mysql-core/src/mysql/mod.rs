//! MySQL node agent and replica-set orchestrator

pub mod instance;
pub mod marker;
pub mod replica_set;
pub mod replication;
pub mod sql;

pub use instance::{estimate_restore_timeout, MySqlInstance, NodeSettings, MYSQL_USERS};
pub use marker::{BootstrapMarker, MarkerRecord};
pub use replica_set::{BootstrapOutcome, BootstrapPhase, MySqlReplicaSet};
pub use replication::ReplicationStatus;
pub use sql::escape_string;
