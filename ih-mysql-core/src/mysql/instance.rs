//! Node agent for the MySQL/Percona server on one fleet member
//!
//! Every database operation is a bash script sent through the
//! [`CommandChannel`]. Credentials are fetched from the secret store at most
//! once per agent and the replica status is cached for a second so the
//! accessors used within one polling step share a round trip.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use super::replication::{yes_no, ReplicationStatus};
use super::sql::{
    backup_script, escape_string, is_plain_object_key, mysql_script, restore_script,
};
use crate::abstractions::Instant;
use crate::config::{
    duration_ms, duration_secs, BootstrapConfig, BACKUP_FILE_EXTENSION,
    DEFAULT_COMMAND_TIMEOUT_SECS, REPLICATION_STATUS_TTL_MS, RESTORE_MIN_TIMEOUT_SECS,
    RESTORE_PREPARE_MULTIPLIER, RESTORE_THROUGHPUT_BYTES_PER_SEC,
};
use crate::error::{BootstrapError, BootstrapResult};
use crate::services::ClusterServices;
use crate::types::{ClusterId, Credentials, InstanceDescription, NodeTags, Role, ROLE_TAG};

/// MySQL user provisioned on every master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserSpec {
    pub username: &'static str,
    pub host: UserHost,
    pub grants: &'static str,
    pub password: PasswordKind,
}

/// Host part of a provisioned user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserHost {
    Localhost,
    VpcCidr,
}

/// Which credential a provisioned user authenticates with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordKind {
    Replication,
    Backup,
    Monitor,
}

/// The four accounts every cluster needs; root keeps socket authentication
pub const MYSQL_USERS: [UserSpec; 4] = [
    UserSpec {
        username: "repl",
        host: UserHost::VpcCidr,
        grants: "REPLICATION SLAVE",
        password: PasswordKind::Replication,
    },
    UserSpec {
        username: "backup",
        host: UserHost::Localhost,
        grants: "RELOAD, LOCK TABLES, PROCESS, REPLICATION CLIENT, BACKUP_ADMIN, SELECT",
        password: PasswordKind::Backup,
    },
    UserSpec {
        username: "monitor",
        host: UserHost::Localhost,
        grants: "PROCESS, REPLICATION CLIENT, SELECT",
        password: PasswordKind::Monitor,
    },
    UserSpec {
        username: "monitor",
        host: UserHost::VpcCidr,
        grants: "PROCESS, REPLICATION CLIENT, SELECT",
        password: PasswordKind::Monitor,
    },
];

/// Cluster-wide settings every node agent shares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    pub cluster: ClusterId,
    pub credentials_secret: String,
    pub vpc_cidr: String,
    /// Timeout for each SQL batch
    pub command_timeout: Duration,
    pub backup_timeout: Duration,
}

impl NodeSettings {
    pub fn from_config(config: &BootstrapConfig) -> Self {
        Self {
            cluster: ClusterId::new(config.cluster_id.clone()),
            credentials_secret: config.credentials_secret.clone(),
            vpc_cidr: config.vpc_cidr.clone(),
            command_timeout: duration_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            backup_timeout: config.backup_timeout,
        }
    }
}

/// Restore timeout for a compressed backup of `size_bytes`
///
/// Download, decompression and extraction run at the fixed throughput; the
/// prepare phase multiplies that. Never less than the floor.
pub fn estimate_restore_timeout(size_bytes: u64) -> Duration {
    let estimated = u128::from(size_bytes) * u128::from(RESTORE_PREPARE_MULTIPLIER)
        / u128::from(RESTORE_THROUGHPUT_BYTES_PER_SEC);
    let estimated = u64::try_from(estimated).unwrap_or(u64::MAX);
    Duration::from_secs(estimated.max(RESTORE_MIN_TIMEOUT_SECS))
}

pub struct MySqlInstance {
    description: InstanceDescription,
    settings: NodeSettings,
    services: ClusterServices,
    credentials: OnceCell<Credentials>,
    replication_cache: Mutex<Option<(Instant, ReplicationStatus)>>,
}

impl MySqlInstance {
    pub fn new(
        description: InstanceDescription,
        settings: NodeSettings,
        services: ClusterServices,
    ) -> Self {
        Self {
            description,
            settings,
            services,
            credentials: OnceCell::new(),
            replication_cache: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.description.instance_id
    }

    pub fn private_ip(&self) -> Option<&str> {
        self.description.private_ip.as_deref()
    }

    /// Tags as described when this agent was created
    pub fn tags(&self) -> &NodeTags {
        &self.description.tags
    }

    pub fn role(&self) -> Option<Role> {
        self.description.tags.role()
    }

    /// Backup bucket from the `percona:s3_bucket` tag
    pub fn s3_bucket(&self) -> Option<&str> {
        self.description.tags.s3_bucket()
    }

    /// MySQL passwords, fetched on first use
    pub async fn credentials(&self) -> BootstrapResult<&Credentials> {
        self.credentials
            .get_or_try_init(|| async {
                let name = &self.settings.credentials_secret;
                let value = self.services.secrets.get_secret(name).await?.ok_or_else(|| {
                    BootstrapError::credentials(format!(
                        "Failed to get credentials: secret {} not found",
                        name
                    ))
                })?;
                Credentials::from_secret_value(&value)
            })
            .await
    }

    /// Run SQL through the root client and return its stdout
    ///
    /// The SQL is sent verbatim; values interpolated into it must already be
    /// escaped with [`escape_string`].
    pub async fn execute_sql(&self, sql: &str) -> BootstrapResult<String> {
        let output = self
            .services
            .commands
            .execute(
                self.instance_id(),
                &mysql_script(sql),
                self.settings.command_timeout,
            )
            .await?;
        if !output.is_success() {
            return Err(BootstrapError::command_failed(
                "SQL execution",
                output.stderr_lossy(),
            ));
        }
        Ok(output.stdout_lossy())
    }

    pub async fn user_exists(&self, username: &str, host: &str) -> BootstrapResult<bool> {
        let sql = format!(
            "SELECT 1 FROM mysql.user WHERE user='{}' AND host='{}';",
            escape_string(username),
            escape_string(host)
        );
        Ok(self.execute_sql(&sql).await?.contains('1'))
    }

    /// Create the user, or rotate its password if it exists, then grant
    pub async fn create_user_if_not_exists(
        &self,
        username: &str,
        host: &str,
        password: &str,
        grants: &str,
    ) -> BootstrapResult<()> {
        let user = escape_string(username);
        let host_escaped = escape_string(host);
        let password = escape_string(password);

        let mut sql = if self.user_exists(username, host).await? {
            info!(
                "User '{}'@'{}' already exists, updating password and grants",
                username, host
            );
            format!(
                "ALTER USER '{}'@'{}' IDENTIFIED BY '{}';\n",
                user, host_escaped, password
            )
        } else {
            info!("Creating user '{}'@'{}'", username, host);
            format!(
                "CREATE USER '{}'@'{}' IDENTIFIED BY '{}';\n",
                user, host_escaped, password
            )
        };

        if !grants.is_empty() {
            sql.push_str(&format!(
                "GRANT {} ON *.* TO '{}'@'{}';\n",
                escape_string(grants),
                user,
                host_escaped
            ));
        }
        sql.push_str("FLUSH PRIVILEGES;\n");

        self.execute_sql(&sql).await?;
        info!("User '{}'@'{}' configured successfully", username, host);
        Ok(())
    }

    /// Provision [`MYSQL_USERS`], stopping at the first failure
    pub async fn create_mysql_users(&self) -> BootstrapResult<()> {
        let credentials = self.credentials().await?.clone();
        for spec in MYSQL_USERS {
            let host = match spec.host {
                UserHost::Localhost => "localhost",
                UserHost::VpcCidr => self.settings.vpc_cidr.as_str(),
            };
            let password = match spec.password {
                PasswordKind::Replication => &credentials.replication,
                PasswordKind::Backup => &credentials.backup,
                PasswordKind::Monitor => &credentials.monitor,
            };
            self.create_user_if_not_exists(spec.username, host, password, spec.grants)
                .await?;
        }
        Ok(())
    }

    /// Point replication at `master_ip` and start it
    pub async fn configure_replication(&self, master_ip: &str) -> BootstrapResult<()> {
        let password = escape_string(&self.credentials().await?.replication);
        let sql = format!(
            "STOP REPLICA;\n\
             CHANGE REPLICATION SOURCE TO SOURCE_HOST='{}', SOURCE_USER='repl', \
             SOURCE_PASSWORD='{}', SOURCE_AUTO_POSITION=1, SOURCE_SSL=1;\n\
             START REPLICA;",
            escape_string(master_ip),
            password
        );
        self.execute_sql(&sql).await?;
        *self.replication_cache.lock() = None;
        info!("Replication configured successfully");
        Ok(())
    }

    fn require_bucket(&self, operation: &str) -> BootstrapResult<String> {
        self.s3_bucket().map(str::to_string).ok_or_else(|| {
            BootstrapError::configuration(
                operation,
                format!("instance {} has no percona:s3_bucket tag", self.instance_id()),
            )
        })
    }

    /// Stream an xtrabackup to the backup bucket and move `latest` to it
    ///
    /// Without `backup_key` the key is `<cluster>/<UTC timestamp>.xbstream.gz`.
    #[instrument(skip(self), fields(instance_id = %self.instance_id()))]
    pub async fn backup_to_s3(
        &self,
        backup_key: Option<&str>,
        timeout: Option<Duration>,
    ) -> BootstrapResult<String> {
        let bucket = self.require_bucket("backup")?;
        let backup_key = match backup_key {
            Some(key) => checked_backup_key(key)?.to_string(),
            None => {
                let now: DateTime<Utc> = self.services.clock.system_time().into();
                format!(
                    "{}/{}.{}",
                    self.settings.cluster,
                    now.format("%Y-%m-%dT%H:%M:%S"),
                    BACKUP_FILE_EXTENSION
                )
            }
        };
        let uri = format!("s3://{}/{}", bucket, backup_key);

        let password = self.credentials().await?.backup.clone();
        let output = self
            .services
            .commands
            .execute(
                self.instance_id(),
                &backup_script(&password, &uri),
                timeout.unwrap_or(self.settings.backup_timeout),
            )
            .await?;
        if !output.is_success() {
            return Err(BootstrapError::command_failed(
                "Backup to S3",
                output.stderr_lossy(),
            ));
        }
        info!("Backup streamed to {}", uri);

        self.update_latest_pointer(&bucket, &backup_key).await?;
        Ok(backup_key)
    }

    /// Replace this server's data with a backup and restart it
    ///
    /// Without `backup_key` the `latest` pointer decides; without `timeout`
    /// it is estimated from the backup's compressed size.
    #[instrument(skip(self), fields(instance_id = %self.instance_id()))]
    pub async fn restore_from_s3(
        &self,
        backup_key: Option<&str>,
        timeout: Option<Duration>,
    ) -> BootstrapResult<()> {
        let bucket = self.require_bucket("restore")?;
        let backup_key = match backup_key {
            Some(key) => checked_backup_key(key)?.to_string(),
            None => self.read_latest_pointer(&bucket).await?,
        };
        let uri = format!("s3://{}/{}", bucket, backup_key);

        let timeout = match timeout {
            Some(timeout) => timeout,
            None => {
                let size = self
                    .services
                    .blobs
                    .head(&bucket, &backup_key)
                    .await?
                    .ok_or_else(|| {
                        BootstrapError::command_failed(
                            "Restore from S3",
                            format!("cannot access backup at {}", uri),
                        )
                    })?;
                let timeout = estimate_restore_timeout(size);
                info!(
                    "Backup size: {:.1} GB, estimated restore timeout: {}s",
                    size as f64 / (1024.0 * 1024.0 * 1024.0),
                    timeout.as_secs()
                );
                timeout
            }
        };

        let output = self
            .services
            .commands
            .execute(self.instance_id(), &restore_script(&uri), timeout)
            .await?;
        if !output.is_success() {
            return Err(BootstrapError::command_failed(
                "Restore from S3",
                output.stderr_lossy(),
            ));
        }
        info!("Restored from {}", uri);
        Ok(())
    }

    async fn read_latest_pointer(&self, bucket: &str) -> BootstrapResult<String> {
        let pointer = self.settings.cluster.latest_pointer_key();
        let body = self.services.blobs.get(bucket, &pointer).await?.ok_or_else(|| {
            BootstrapError::command_failed(
                "Restore from S3",
                format!("cannot read latest pointer at s3://{}/{}", bucket, pointer),
            )
        })?;
        let backup_key = String::from_utf8_lossy(&body).trim().to_string();
        let prefix = format!("{}/", self.settings.cluster);
        if !backup_key.starts_with(&prefix) || !is_plain_object_key(&backup_key) {
            return Err(BootstrapError::configuration(
                "backup_key",
                format!(
                    "latest pointer at s3://{}/{} holds '{}', not a key under {}",
                    bucket, pointer, backup_key, prefix
                ),
            ));
        }
        info!("Latest pointer resolves to {}", backup_key);
        Ok(backup_key)
    }

    async fn update_latest_pointer(&self, bucket: &str, backup_key: &str) -> BootstrapResult<()> {
        let pointer = self.settings.cluster.latest_pointer_key();
        self.services
            .blobs
            .put(bucket, &pointer, backup_key.as_bytes().to_vec())
            .await?;
        info!("Updated latest pointer to {}", backup_key);
        Ok(())
    }

    /// Replica status, reused for a second after each fetch
    pub async fn replication_status(&self) -> BootstrapResult<ReplicationStatus> {
        let ttl = duration_ms(REPLICATION_STATUS_TTL_MS);
        let now = self.services.clock.now();
        let cached = self
            .replication_cache
            .lock()
            .as_ref()
            .filter(|(fetched_at, _)| now.duration_since(*fetched_at) < ttl)
            .map(|(_, status)| status.clone());
        match cached {
            Some(status) => Ok(status),
            None => self.refresh_replication_status().await,
        }
    }

    /// Fetch the replica status, bypassing the cache
    pub async fn refresh_replication_status(&self) -> BootstrapResult<ReplicationStatus> {
        let output = self.execute_sql("SHOW REPLICA STATUS\\G").await?;
        let status = ReplicationStatus::parse(&output);
        *self.replication_cache.lock() = Some((self.services.clock.now(), status.clone()));
        Ok(status)
    }

    /// `None` on a master
    pub async fn replica_io_running(&self) -> BootstrapResult<Option<bool>> {
        Ok(self.replication_status().await?.io_running())
    }

    /// `None` on a master
    pub async fn replica_sql_running(&self) -> BootstrapResult<Option<bool>> {
        Ok(self.replication_status().await?.sql_running())
    }

    /// `None` on a master or while the lag reads `NULL`
    pub async fn seconds_behind_source(&self) -> BootstrapResult<Option<u64>> {
        Ok(self.replication_status().await?.seconds_behind_source())
    }

    /// Poll until replication lag is at most `threshold`
    ///
    /// Fails at once if either replication thread is stopped, and with the
    /// last observed lag once `timeout` has passed.
    #[instrument(skip(self), fields(instance_id = %self.instance_id()))]
    pub async fn wait_for_replication_sync(
        &self,
        threshold: Duration,
        timeout: Duration,
        poll_interval: Duration,
    ) -> BootstrapResult<()> {
        let clock = &self.services.clock;
        let deadline = clock.now().saturating_add(timeout);
        info!(
            "Waiting for replication lag to drop below {}s (timeout {}s)",
            threshold.as_secs(),
            timeout.as_secs()
        );

        loop {
            let status = self.refresh_replication_status().await?;
            let (io, sql) = (status.io_running(), status.sql_running());
            if io != Some(true) || sql != Some(true) {
                return Err(BootstrapError::replication(format!(
                    "Replication is not running: Replica_IO_Running={}, Replica_SQL_Running={}",
                    yes_no(io),
                    yes_no(sql)
                )));
            }

            let lag = status.seconds_behind_source();
            match lag {
                None => warn!("Seconds_Behind_Source is NULL, replication may not be active yet"),
                Some(lag) if lag <= threshold.as_secs() => {
                    info!(
                        "Replication caught up (lag {}s <= threshold {}s)",
                        lag,
                        threshold.as_secs()
                    );
                    return Ok(());
                }
                Some(lag) => info!("Replication lag: {}s", lag),
            }

            if clock.now() >= deadline {
                return Err(BootstrapError::replication(format!(
                    "Replication did not catch up within {}s (last Seconds_Behind_Source={})",
                    timeout.as_secs(),
                    lag.map_or_else(|| "NULL".to_string(), |l| l.to_string())
                )));
            }
            clock.sleep(poll_interval).await;
        }
    }

    /// Record `role` in the `mysql_role` tag
    pub async fn tag_role(&self, role: Role) -> BootstrapResult<()> {
        info!("Tagging instance {} with {}={}", self.instance_id(), ROLE_TAG, role);
        self.services
            .fleet
            .set_tag(self.instance_id(), ROLE_TAG, role.as_str())
            .await
    }

    pub async fn register_with_target_group(&self, target_group_arn: &str) -> BootstrapResult<()> {
        self.services
            .targets
            .register(target_group_arn, self.instance_id())
            .await
    }

    /// Every node joins the read group; only the master joins the write group
    pub async fn register_target_groups(
        &self,
        read_tg_arn: Option<&str>,
        write_tg_arn: Option<&str>,
        is_master: bool,
    ) -> BootstrapResult<()> {
        if let Some(arn) = read_tg_arn.filter(|a| !a.is_empty()) {
            self.register_with_target_group(arn).await?;
        }
        if let Some(arn) = write_tg_arn.filter(|a| !a.is_empty()) {
            if is_master {
                self.register_with_target_group(arn).await?;
            }
        }
        Ok(())
    }

    pub async fn protect_from_scale_in(&self) -> BootstrapResult<()> {
        self.services
            .fleet
            .enable_scale_in_protection(self.instance_id())
            .await
    }
}

/// Keys end up in shell scripts run as root; only plain keys get there
fn checked_backup_key(key: &str) -> BootstrapResult<&str> {
    if is_plain_object_key(key) {
        Ok(key)
    } else {
        Err(BootstrapError::configuration(
            "backup_key",
            format!("'{}' is not a plain object key", key),
        ))
    }
}

impl std::fmt::Debug for MySqlInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlInstance")
            .field("instance_id", &self.description.instance_id)
            .field("private_ip", &self.description.private_ip)
            .field("cluster", &self.settings.cluster)
            .finish()
    }
}
