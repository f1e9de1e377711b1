//! Replica-set bootstrap orchestration
//!
//! The first node to take the cluster lock and find no master record becomes
//! the master; every later node becomes a replica of it. Role decision and
//! role-specific setup run under the lock; tagging, load-balancer
//! registration and scale-in protection run after it is released. The local
//! marker is written last, so a run that fails anywhere is retried from the
//! start on the next invocation.

use futures::future::try_join_all;
use std::fmt;
use tracing::{info, instrument};

use super::instance::{MySqlInstance, NodeSettings};
use super::marker::{BootstrapMarker, MarkerRecord};
use crate::config::BootstrapConfig;
use crate::error::{BootstrapError, BootstrapResult};
use crate::services::{with_lock, ClusterServices};
use crate::types::{ClusterId, Role, TableItem};

const MASTER_ATTRIBUTE: &str = "instance_id";

/// Steps of a bootstrap run, logged as they are entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    NotStarted,
    LockWait,
    RoleDecision,
    MasterSetup,
    ReplicaSetup,
    PostSetup,
    Done,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapPhase::NotStarted => "not-started",
            BootstrapPhase::LockWait => "lock-wait",
            BootstrapPhase::RoleDecision => "role-decision",
            BootstrapPhase::MasterSetup => "master-setup",
            BootstrapPhase::ReplicaSetup => "replica-setup",
            BootstrapPhase::PostSetup => "post-setup",
            BootstrapPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Result of [`MySqlReplicaSet::bootstrap`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The marker already existed; nothing was done
    AlreadyBootstrapped,
    Bootstrapped(MarkerRecord),
}

pub struct MySqlReplicaSet {
    config: BootstrapConfig,
    settings: NodeSettings,
    services: ClusterServices,
}

impl MySqlReplicaSet {
    pub fn new(config: BootstrapConfig, services: ClusterServices) -> Self {
        let settings = NodeSettings::from_config(&config);
        Self {
            config,
            settings,
            services,
        }
    }

    pub fn cluster(&self) -> &ClusterId {
        &self.settings.cluster
    }

    pub fn marker(&self) -> BootstrapMarker {
        BootstrapMarker::new(&self.config.bootstrap_marker)
    }

    /// Wrap a fleet member as a node agent
    pub async fn instance(&self, instance_id: &str) -> BootstrapResult<MySqlInstance> {
        let description = self.services.fleet.describe(instance_id).await?;
        Ok(MySqlInstance::new(
            description,
            self.settings.clone(),
            self.services.clone(),
        ))
    }

    /// Node agent for the host this process runs on
    pub async fn local_instance(&self) -> BootstrapResult<MySqlInstance> {
        let instance_id = self.services.fleet.local_instance_id().await?;
        self.instance(&instance_id).await
    }

    /// Every member of the cluster's Auto Scaling group
    pub async fn instances(&self) -> BootstrapResult<Vec<MySqlInstance>> {
        let members = self
            .services
            .fleet
            .list_members(self.cluster().as_str())
            .await?;
        try_join_all(members.iter().map(|id| self.instance(id))).await
    }

    /// First member tagged as master
    pub async fn master(&self) -> BootstrapResult<Option<MySqlInstance>> {
        Ok(self.instances_by_role(Role::Master).await?.into_iter().next())
    }

    pub async fn replicas(&self) -> BootstrapResult<Vec<MySqlInstance>> {
        self.instances_by_role(Role::Replica).await
    }

    async fn instances_by_role(&self, role: Role) -> BootstrapResult<Vec<MySqlInstance>> {
        Ok(self
            .instances()
            .await?
            .into_iter()
            .filter(|i| i.role() == Some(role))
            .collect())
    }

    /// Instance id in the master record, `None` before the first election
    pub async fn get_master_instance_id(&self) -> BootstrapResult<Option<String>> {
        let item = self
            .services
            .table
            .get_item(&self.cluster().master_key())
            .await?;
        Ok(item.and_then(|i| i.attribute(MASTER_ATTRIBUTE).map(str::to_string)))
    }

    /// Upsert the master record; callers must hold the cluster lock
    pub async fn register_master(&self, instance_id: &str) -> BootstrapResult<()> {
        self.services
            .table
            .put_item(
                TableItem::new(self.cluster().master_key())
                    .with_attribute(MASTER_ATTRIBUTE, instance_id),
            )
            .await
    }

    /// Bootstrap the local node as master or replica, once
    #[instrument(skip(self), fields(cluster = %self.cluster()))]
    pub async fn bootstrap(&self) -> BootstrapResult<BootstrapOutcome> {
        let fs = self.services.fs.as_ref();
        let marker = self.marker();
        enter(BootstrapPhase::NotStarted);
        if marker.exists(fs).await? {
            info!(
                "Bootstrap marker exists at {}, skipping bootstrap",
                marker.path().display()
            );
            return Ok(BootstrapOutcome::AlreadyBootstrapped);
        }

        let node = self.local_instance().await?;
        info!("Instance ID: {}", node.instance_id());

        enter(BootstrapPhase::LockWait);
        let lock_name = self.cluster().lock_name();
        info!("Attempting to acquire lock: {}", lock_name);
        let node_ref = &node;
        let record = with_lock(
            self.services.table.as_ref(),
            self.services.clock.as_ref(),
            &lock_name,
            self.config.lock_timeout,
            move || async move { self.decide_role(node_ref).await },
        )
        .await?;

        enter(BootstrapPhase::PostSetup);
        let role = record.role();
        node.tag_role(role).await?;
        node.register_target_groups(
            self.config.read_tg_arn.as_deref(),
            self.config.write_tg_arn.as_deref(),
            role.is_master(),
        )
        .await?;
        if role.is_master() {
            node.protect_from_scale_in().await?;
            info!("Scale-in protection enabled for master {}", node.instance_id());
        }

        marker.write(fs, &record).await?;
        enter(BootstrapPhase::Done);
        info!("Bootstrap complete, marker written to {}", marker.path().display());
        Ok(BootstrapOutcome::Bootstrapped(record))
    }

    /// Runs under the cluster lock
    async fn decide_role(&self, node: &MySqlInstance) -> BootstrapResult<MarkerRecord> {
        enter(BootstrapPhase::RoleDecision);
        info!("Checking for existing master");
        match self.get_master_instance_id().await? {
            None => {
                self.bootstrap_as_master(node).await?;
                Ok(MarkerRecord::Master)
            }
            Some(master_id) => {
                let master_ip = self.bootstrap_as_replica(node, &master_id).await?;
                Ok(MarkerRecord::Replica {
                    master_ip: Some(master_ip),
                })
            }
        }
    }

    async fn bootstrap_as_master(&self, node: &MySqlInstance) -> BootstrapResult<()> {
        enter(BootstrapPhase::MasterSetup);
        info!("No master found, becoming master");

        info!("Creating MySQL users");
        node.create_mysql_users().await?;

        match node.s3_bucket() {
            Some(bucket) => {
                info!(
                    "Taking xtrabackup and streaming to s3://{}/{}/",
                    bucket,
                    self.cluster()
                );
                node.backup_to_s3(None, None).await?;
            }
            None => info!("No percona:s3_bucket tag found, skipping backup"),
        }

        self.register_master(node.instance_id()).await?;
        info!("Registered as master");
        Ok(())
    }

    /// Returns the master's address
    async fn bootstrap_as_replica(
        &self,
        node: &MySqlInstance,
        master_instance_id: &str,
    ) -> BootstrapResult<String> {
        enter(BootstrapPhase::ReplicaSetup);
        info!("Master exists: {}, configuring as replica", master_instance_id);

        let master_ip = self.resolve_master_ip(master_instance_id).await?;
        info!("Master IP: {}", master_ip);

        match node.s3_bucket() {
            Some(bucket) => {
                info!(
                    "Restoring from backup at s3://{}/{}/",
                    bucket,
                    self.cluster()
                );
                node.restore_from_s3(None, None).await?;
            }
            None => info!("No percona:s3_bucket tag found, skipping restore"),
        }

        node.configure_replication(&master_ip).await?;
        let replication = &self.config.replication;
        node.wait_for_replication_sync(
            replication.threshold,
            replication.timeout,
            replication.poll_interval,
        )
        .await?;
        info!("Configured as replica of {}, replication caught up", master_ip);
        Ok(master_ip)
    }

    async fn resolve_master_ip(&self, master_instance_id: &str) -> BootstrapResult<String> {
        let unresolvable = || BootstrapError::MasterUnresolvable {
            instance_id: master_instance_id.to_string(),
        };
        let description = match self.services.fleet.describe(master_instance_id).await {
            Ok(description) => description,
            Err(e) if e.aws_code() == Some("InvalidInstanceID.NotFound") => {
                return Err(unresolvable())
            }
            Err(e) => return Err(e),
        };
        description
            .private_ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(unresolvable)
    }
}

fn enter(phase: BootstrapPhase) {
    tracing::debug!(%phase, "Entering bootstrap phase");
}
