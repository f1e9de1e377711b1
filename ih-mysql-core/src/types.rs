//! Domain types shared by the orchestrator, the node agent and the
//! collaborator implementations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{BootstrapError, BootstrapResult};

/// EC2 tag carrying the node's MySQL role
pub const ROLE_TAG: &str = "mysql_role";
/// EC2 tag naming the xtrabackup bucket; absent means backup/restore is off
pub const S3_BUCKET_TAG: &str = "percona:s3_bucket";

/// Name of a Percona/MySQL cluster
///
/// Doubles as the Auto Scaling group name, the S3 key prefix for backups and
/// the suffix of the lock and master-record keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<cluster>-bootstrap-lock`
    pub fn lock_name(&self) -> String {
        format!("{}-bootstrap-lock", self.0)
    }

    /// `<cluster>-master`
    pub fn master_key(&self) -> String {
        format!("{}-master", self.0)
    }

    /// `<cluster>/latest`
    pub fn latest_pointer_key(&self) -> String {
        format!("{}/latest", self.0)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of a node in the replica set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Replica,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Replica => "replica",
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(Role::Master),
            "replica" => Ok(Role::Replica),
            other => Err(BootstrapError::internal(format!("unknown role '{}'", other))),
        }
    }
}

/// Tags of a fleet member
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTags(BTreeMap<String, String>);

impl NodeTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Value of the `mysql_role` tag, if it names a known role
    pub fn role(&self) -> Option<Role> {
        self.get(ROLE_TAG).and_then(|v| v.parse().ok())
    }

    /// Value of the `percona:s3_bucket` tag; an empty tag counts as absent
    pub fn s3_bucket(&self) -> Option<&str> {
        self.get(S3_BUCKET_TAG).filter(|v| !v.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for NodeTags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Live metadata of one fleet member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub private_ip: Option<String>,
    pub tags: NodeTags,
}

/// MySQL passwords from the credentials secret
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub replication: String,
    pub backup: String,
    pub monitor: String,
}

impl Credentials {
    pub const REQUIRED_KEYS: [&'static str; 3] = ["replication", "backup", "monitor"];

    /// Validate a secret value and extract the three passwords
    pub fn from_secret_value(value: &serde_json::Value) -> BootstrapResult<Self> {
        let object = value.as_object().ok_or_else(|| {
            BootstrapError::credentials("Credentials secret must be a JSON object")
        })?;

        let missing: Vec<&str> = Self::REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| !object.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(BootstrapError::credentials(format!(
                "Missing required keys in credentials: {}",
                missing.join(", ")
            )));
        }

        let field = |key: &str| -> BootstrapResult<String> {
            object
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    BootstrapError::credentials(format!("Credential '{}' must be a string", key))
                })
        };

        Ok(Self {
            replication: field("replication")?,
            backup: field("backup")?,
            monitor: field("monitor")?,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("replication", &"<redacted>")
            .field("backup", &"<redacted>")
            .field("monitor", &"<redacted>")
            .finish()
    }
}

/// One row of the shared table, keyed by `pk`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableItem {
    pub key: String,
    pub attributes: BTreeMap<String, String>,
}

impl TableItem {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}
