//! Configuration for the ih-mysql tools
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `IH_MYSQL_*` environment variables, then command-line flags applied by the
//! binary. [`BootstrapConfig::validate`] runs last.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BootstrapError, BootstrapResult};

pub mod defaults;

pub use defaults::*;

/// How commands reach the MySQL host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandChannelKind {
    /// AWS Systems Manager `send-command`
    #[default]
    Ssm,
    /// `bash -c` on the current host
    Local,
}

impl std::str::FromStr for CommandChannelKind {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssm" => Ok(Self::Ssm),
            "local" => Ok(Self::Local),
            other => Err(BootstrapError::configuration(
                "command_channel",
                format!("unknown command channel '{}', expected 'ssm' or 'local'", other),
            )),
        }
    }
}

/// AWS client settings passed to every `aws` invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: Option<String>,
    pub profile: Option<String>,
}

/// Replication catch-up polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Lag at or below which a replica counts as caught up
    #[serde(with = "humantime_serde")]
    pub threshold: Duration,
    /// Give up waiting after this long
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            threshold: duration_secs(DEFAULT_REPLICATION_THRESHOLD_SECS),
            timeout: duration_secs(DEFAULT_REPLICATION_TIMEOUT_SECS),
            poll_interval: duration_secs(DEFAULT_REPLICATION_POLL_INTERVAL_SECS),
        }
    }
}

/// Everything a bootstrap run needs to know
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Percona cluster identifier, also the Auto Scaling group name
    pub cluster_id: String,
    /// DynamoDB table used for the lock and the master record
    pub dynamodb_table: String,
    /// Secrets Manager secret holding the MySQL passwords
    pub credentials_secret: String,
    /// Host restriction for network-facing MySQL users
    pub vpc_cidr: String,
    pub bootstrap_marker: PathBuf,
    pub read_tg_arn: Option<String>,
    pub write_tg_arn: Option<String>,
    /// Overrides the instance id read from instance metadata
    pub instance_id: Option<String>,
    pub aws: AwsConfig,
    pub command_channel: CommandChannelKind,
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_lease: Duration,
    #[serde(with = "humantime_serde")]
    pub backup_timeout: Duration,
    pub replication: ReplicationConfig,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            dynamodb_table: String::new(),
            credentials_secret: String::new(),
            vpc_cidr: String::new(),
            bootstrap_marker: PathBuf::from(DEFAULT_BOOTSTRAP_MARKER),
            read_tg_arn: None,
            write_tg_arn: None,
            instance_id: None,
            aws: AwsConfig::default(),
            command_channel: CommandChannelKind::default(),
            lock_timeout: duration_secs(DEFAULT_LOCK_ACQUIRE_TIMEOUT_SECS),
            lock_lease: duration_secs(DEFAULT_LOCK_LEASE_SECS),
            backup_timeout: duration_secs(DEFAULT_BACKUP_TIMEOUT_SECS),
            replication: ReplicationConfig::default(),
        }
    }
}

impl BootstrapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document
    pub fn from_toml(contents: &str) -> BootstrapResult<Self> {
        toml::from_str(contents)
            .map_err(|e| BootstrapError::configuration("config file", e.to_string()))
    }

    /// Load a TOML configuration file
    pub fn from_file(path: &Path) -> BootstrapResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BootstrapError::configuration(
                "config file",
                format!("cannot read {}: {}", path.display(), e),
            )
        })?;
        Self::from_toml(&contents)
    }

    /// Overlay `IH_MYSQL_*` environment variables
    pub fn apply_env(&mut self) -> BootstrapResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay variables obtained from `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F) -> BootstrapResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("IH_MYSQL_CLUSTER_ID") {
            self.cluster_id = v;
        }
        if let Some(v) = lookup("IH_MYSQL_DYNAMODB_TABLE") {
            self.dynamodb_table = v;
        }
        if let Some(v) = lookup("IH_MYSQL_CREDENTIALS_SECRET") {
            self.credentials_secret = v;
        }
        if let Some(v) = lookup("IH_MYSQL_VPC_CIDR") {
            self.vpc_cidr = v;
        }
        if let Some(v) = lookup("IH_MYSQL_BOOTSTRAP_MARKER") {
            self.bootstrap_marker = PathBuf::from(v);
        }
        if let Some(v) = lookup("IH_MYSQL_READ_TG_ARN") {
            self.read_tg_arn = Some(v);
        }
        if let Some(v) = lookup("IH_MYSQL_WRITE_TG_ARN") {
            self.write_tg_arn = Some(v);
        }
        if let Some(v) = lookup("IH_MYSQL_COMMAND_CHANNEL") {
            self.command_channel = v.parse()?;
        }
        if let Some(v) = lookup("IH_MYSQL_LOCK_TIMEOUT") {
            self.lock_timeout = humantime_serde::re::humantime::parse_duration(&v).map_err(|e| {
                BootstrapError::configuration("IH_MYSQL_LOCK_TIMEOUT", e.to_string())
            })?;
        }
        Ok(())
    }

    /// Check that a bootstrap can be attempted with these values
    pub fn validate(&self) -> BootstrapResult<()> {
        let required = [
            ("cluster_id", &self.cluster_id),
            ("dynamodb_table", &self.dynamodb_table),
            ("credentials_secret", &self.credentials_secret),
            ("vpc_cidr", &self.vpc_cidr),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(BootstrapError::configuration(field, "must not be empty"));
            }
        }

        self.vpc_cidr.parse::<ipnet::IpNet>().map_err(|e| {
            BootstrapError::configuration(
                "vpc_cidr",
                format!("'{}' is not a CIDR block: {}", self.vpc_cidr, e),
            )
        })?;

        if self.bootstrap_marker.as_os_str().is_empty() {
            return Err(BootstrapError::configuration(
                "bootstrap_marker",
                "must not be empty",
            ));
        }

        let durations = [
            ("lock_timeout", self.lock_timeout),
            ("lock_lease", self.lock_lease),
            ("backup_timeout", self.backup_timeout),
            ("replication.timeout", self.replication.timeout),
            ("replication.poll_interval", self.replication.poll_interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(BootstrapError::configuration(field, "must be positive"));
            }
        }

        Ok(())
    }

    /// A valid configuration for tests
    pub fn test(cluster_id: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            dynamodb_table: "test-table".to_string(),
            credentials_secret: "test-secret".to_string(),
            vpc_cidr: "10.0.0.0/16".to_string(),
            ..Self::default()
        }
    }
}
