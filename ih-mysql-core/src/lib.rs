pub mod abstractions;
pub mod aws;
pub mod config;
pub mod error;
pub mod mysql;
pub mod services;
pub mod types;

pub use config::BootstrapConfig;
pub use error::{BootstrapError, BootstrapResult};
pub use mysql::{BootstrapOutcome, MySqlInstance, MySqlReplicaSet};
pub use services::ClusterServices;
pub use types::{ClusterId, Credentials, NodeTags, Role};
