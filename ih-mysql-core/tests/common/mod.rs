//! Shared fixture: an in-memory cluster that several nodes bootstrap against

#![allow(dead_code)]

use ih_mysql_core::abstractions::{CommandOutput, MockClock};
use ih_mysql_core::config::BootstrapConfig;
use ih_mysql_core::mysql::{MySqlInstance, MySqlReplicaSet, NodeSettings};
use ih_mysql_core::services::memory::{
    MemoryBlobStore, MemoryCommandChannel, MemoryFleet, MemorySecrets, MemoryTable,
    MemoryTargets, RemoteInvocation, SimulatedMySql,
};
use ih_mysql_core::services::ClusterServices;
use ih_mysql_core::types::{InstanceDescription, NodeTags, S3_BUCKET_TAG};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const CLUSTER: &str = "orders";
pub const SECRET: &str = "orders-mysql";
pub const VPC_CIDR: &str = "10.0.0.0/16";
pub const BUCKET: &str = "orders-backups";
pub const READ_TG: &str = "arn:aws:elasticloadbalancing:us-east-1:1:targetgroup/orders-read/1";
pub const WRITE_TG: &str = "arn:aws:elasticloadbalancing:us-east-1:1:targetgroup/orders-write/2";

static BACKUP_UPLOAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"aws s3 cp - '\\''s3://([^/\s']+)/([^\s']+)'\\'';").unwrap());

/// Where a backup script uploads to, if `script` is one
pub fn backup_destination(script: &str) -> Option<(String, String)> {
    let caps = BACKUP_UPLOAD.captures(script)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

pub struct TestCluster {
    pub table: Arc<MemoryTable>,
    pub fleet: MemoryFleet,
    pub secrets: Arc<MemorySecrets>,
    pub blobs: Arc<MemoryBlobStore>,
    pub channel: MemoryCommandChannel,
    pub mysql: Arc<SimulatedMySql>,
    pub targets: Arc<MemoryTargets>,
    pub clock: MockClock,
    pub dir: TempDir,
}

impl TestCluster {
    /// Cluster whose servers behave like [`SimulatedMySql`] and whose
    /// backups land in the blob store
    pub fn new() -> Self {
        let blobs = Arc::new(MemoryBlobStore::new());
        let mysql = Arc::new(SimulatedMySql::default());
        let channel = {
            let blobs = blobs.clone();
            let mysql = mysql.clone();
            MemoryCommandChannel::with_responder(move |invocation| {
                if let Some((bucket, key)) = backup_destination(&invocation.script) {
                    blobs.insert(&bucket, &key, b"xbstream-gzip".to_vec());
                }
                mysql.respond(invocation)
            })
        };
        Self::assemble(blobs, channel, mysql)
    }

    /// Cluster whose servers answer through `responder`
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&RemoteInvocation) -> CommandOutput + Send + Sync + 'static,
    {
        Self::assemble(
            Arc::new(MemoryBlobStore::new()),
            MemoryCommandChannel::with_responder(responder),
            Arc::new(SimulatedMySql::default()),
        )
    }

    fn assemble(
        blobs: Arc<MemoryBlobStore>,
        channel: MemoryCommandChannel,
        mysql: Arc<SimulatedMySql>,
    ) -> Self {
        let secrets = Arc::new(MemorySecrets::new());
        secrets.insert(
            SECRET,
            json!({"replication": "r3pl-pw", "backup": "b4ckup-pw", "monitor": "m0n-pw"}),
        );
        Self {
            table: Arc::new(MemoryTable::new()),
            fleet: MemoryFleet::new(),
            secrets,
            blobs,
            channel,
            mysql,
            targets: Arc::new(MemoryTargets::new()),
            clock: MockClock::new(),
            dir: TempDir::new().unwrap(),
        }
    }

    /// Add a member to the cluster's Auto Scaling group
    pub fn add_node(&self, instance_id: &str, private_ip: Option<&str>, with_bucket: bool) {
        let mut tags = NodeTags::new();
        if with_bucket {
            tags.insert(S3_BUCKET_TAG, BUCKET);
        }
        self.fleet.add_instance(CLUSTER, instance_id, private_ip, tags);
    }

    /// Collaborators as seen from `instance_id`
    pub fn services_for(&self, instance_id: &str) -> ClusterServices {
        ClusterServices::new(
            self.table.clone(),
            Arc::new(self.fleet.local_view(instance_id)),
            self.secrets.clone(),
            self.blobs.clone(),
            Arc::new(self.channel.clone()),
            self.targets.clone(),
        )
        .with_clock(Arc::new(self.clock.clone()))
    }

    pub fn marker_path(&self, instance_id: &str) -> PathBuf {
        self.dir.path().join(instance_id).join(".bootstrapped")
    }

    pub fn config_for(&self, instance_id: &str) -> BootstrapConfig {
        BootstrapConfig {
            credentials_secret: SECRET.to_string(),
            vpc_cidr: VPC_CIDR.to_string(),
            bootstrap_marker: self.marker_path(instance_id),
            read_tg_arn: Some(READ_TG.to_string()),
            write_tg_arn: Some(WRITE_TG.to_string()),
            ..BootstrapConfig::test(CLUSTER)
        }
    }

    pub fn replica_set(&self, instance_id: &str) -> MySqlReplicaSet {
        MySqlReplicaSet::new(self.config_for(instance_id), self.services_for(instance_id))
    }

    /// Node agent for `instance_id` with the given tags
    pub fn node(&self, instance_id: &str, tags: NodeTags) -> MySqlInstance {
        MySqlInstance::new(
            InstanceDescription {
                instance_id: instance_id.to_string(),
                private_ip: Some("10.0.1.50".to_string()),
                tags,
            },
            NodeSettings::from_config(&self.config_for(instance_id)),
            self.services_for(instance_id),
        )
    }

    pub fn marker_contents(&self, instance_id: &str) -> Option<String> {
        std::fs::read_to_string(self.marker_path(instance_id)).ok()
    }

    /// Calls made to every remote collaborator so far
    pub fn remote_calls(&self) -> usize {
        self.table.calls()
            + self.fleet.calls()
            + self.secrets.calls()
            + self.blobs.calls()
            + self.channel.calls()
            + self.targets.calls()
    }
}

/// Tags carrying only the backup bucket
pub fn bucket_tags() -> NodeTags {
    [(S3_BUCKET_TAG, BUCKET)].into_iter().collect()
}
