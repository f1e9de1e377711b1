//! Contracts of the external systems a bootstrap run talks to
//!
//! The orchestrator and node agent only see these traits. [`crate::aws`]
//! implements them on top of the `aws` command-line client; [`memory`]
//! implements them in process for tests and local experiments.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::abstractions::{Clock, CommandOutput, FileSystem, SystemClock, TokioFileSystem};
use crate::error::{BootstrapError, BootstrapResult};
use crate::types::{InstanceDescription, TableItem};

pub mod memory;

/// Key-value table shared by every fleet member, with a lease-based lock
#[async_trait]
pub trait SharedTable: Send + Sync {
    /// Point lookup by primary key; `None` when no row exists
    async fn get_item(&self, key: &str) -> BootstrapResult<Option<TableItem>>;

    /// Unconditional upsert
    async fn put_item(&self, item: TableItem) -> BootstrapResult<()>;

    /// Block up to `timeout` for the named lock
    ///
    /// Fails with [`crate::error::BootstrapError::LockNotAcquired`] when the
    /// lock stays held by someone else.
    async fn acquire_lock(&self, name: &str, timeout: Duration)
        -> BootstrapResult<Box<dyn LockLease>>;
}

/// A held lock
#[async_trait]
pub trait LockLease: Send + Sync {
    fn name(&self) -> &str;

    /// How often [`LockLease::renew`] must run to keep the lock, `None` when
    /// the lock does not expire while held
    fn renew_interval(&self) -> Option<Duration>;

    /// Push the expiry a full lease into the future
    ///
    /// Fails with [`crate::error::BootstrapError::LockLost`] when another
    /// owner has taken the lock over.
    async fn renew(&self) -> BootstrapResult<()>;

    async fn release(self: Box<Self>) -> BootstrapResult<()>;
}

/// Run `body` while holding the named lock
///
/// An expiring lease is renewed every [`LockLease::renew_interval`] for as
/// long as `body` runs. If a renewal fails, `body` is dropped and the
/// renewal error returned, so no work continues without the lock. The lease
/// is released once `body` finishes, whether it succeeded or not. A failed
/// release is logged and does not mask the body's result.
pub async fn with_lock<T, F, Fut>(
    table: &dyn SharedTable,
    clock: &dyn Clock,
    name: &str,
    timeout: Duration,
    body: F,
) -> BootstrapResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = BootstrapResult<T>>,
{
    let lease = table.acquire_lock(name, timeout).await?;
    debug!("Acquired lock {}", lease.name());

    let result = {
        let lease = lease.as_ref();
        let heartbeat = async move {
            let Some(interval) = lease.renew_interval() else {
                return std::future::pending::<BootstrapError>().await;
            };
            loop {
                clock.sleep(interval).await;
                match lease.renew().await {
                    Ok(()) => debug!("Renewed lock {}", lease.name()),
                    Err(e) => return e,
                }
            }
        };
        tokio::select! {
            biased;
            result = body() => result,
            e = heartbeat => {
                warn!("Abandoning work under lock {}: {}", lease.name(), e);
                Err(e)
            }
        }
    };

    let lock_name = lease.name().to_string();
    match lease.release().await {
        Ok(()) => debug!("Released lock {}", lock_name),
        Err(e) => warn!("Failed to release lock {}: {}", lock_name, e),
    }
    result
}

/// Membership and metadata of the cluster's Auto Scaling group
#[async_trait]
pub trait FleetDirectory: Send + Sync {
    /// Instance id of the host this process runs on
    async fn local_instance_id(&self) -> BootstrapResult<String>;

    /// Instance ids of the members of `group`
    async fn list_members(&self, group: &str) -> BootstrapResult<Vec<String>>;

    async fn describe(&self, instance_id: &str) -> BootstrapResult<InstanceDescription>;

    async fn set_tag(&self, instance_id: &str, key: &str, value: &str) -> BootstrapResult<()>;

    async fn enable_scale_in_protection(&self, instance_id: &str) -> BootstrapResult<()>;
}

/// Secret storage holding JSON documents
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `None` when the secret does not exist
    async fn get_secret(&self, name: &str) -> BootstrapResult<Option<serde_json::Value>>;
}

/// Object storage for backups and the `latest` pointer
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Object size in bytes, `None` when absent
    async fn head(&self, bucket: &str, key: &str) -> BootstrapResult<Option<u64>>;

    async fn get(&self, bucket: &str, key: &str) -> BootstrapResult<Option<Vec<u8>>>;

    /// Overwrites any existing object
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> BootstrapResult<()>;
}

/// Privileged shell execution on a fleet member
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Run a bash script on `instance_id` and wait up to `timeout`
    ///
    /// A non-zero exit is reported through [`CommandOutput::status`], not as
    /// an error; errors mean the channel itself failed.
    async fn execute(
        &self,
        instance_id: &str,
        script: &str,
        timeout: Duration,
    ) -> BootstrapResult<CommandOutput>;
}

/// Load-balancer target registration
#[async_trait]
pub trait TargetRegistry: Send + Sync {
    async fn register(&self, target_group_arn: &str, instance_id: &str) -> BootstrapResult<()>;
}

/// Every collaborator a replica set needs, bundled for cheap cloning
#[derive(Clone)]
pub struct ClusterServices {
    pub table: Arc<dyn SharedTable>,
    pub fleet: Arc<dyn FleetDirectory>,
    pub secrets: Arc<dyn SecretStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub commands: Arc<dyn CommandChannel>,
    pub targets: Arc<dyn TargetRegistry>,
    pub clock: Arc<dyn Clock>,
    pub fs: Arc<dyn FileSystem>,
}

impl ClusterServices {
    /// Bundle collaborators with the system clock and the real filesystem
    pub fn new(
        table: Arc<dyn SharedTable>,
        fleet: Arc<dyn FleetDirectory>,
        secrets: Arc<dyn SecretStore>,
        blobs: Arc<dyn BlobStore>,
        commands: Arc<dyn CommandChannel>,
        targets: Arc<dyn TargetRegistry>,
    ) -> Self {
        Self {
            table,
            fleet,
            secrets,
            blobs,
            commands,
            targets,
            clock: Arc::new(SystemClock::new()),
            fs: Arc::new(TokioFileSystem::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_filesystem(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }
}
