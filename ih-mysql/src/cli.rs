use clap::{Args, Parser, Subcommand};
use ih_mysql_core::BootstrapConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ih-mysql", version)]
#[command(about = "Bootstrap and manage MySQL/Percona replica sets on AWS", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Print debug messages
    #[arg(long, global = true)]
    pub debug: bool,

    /// Print informational messages
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// AWS profile for every AWS call
    #[arg(long, global = true)]
    pub aws_profile: Option<String>,

    /// AWS region for every AWS call
    #[arg(long, global = true)]
    pub aws_region: Option<String>,

    /// TOML configuration file; environment and flags override it
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap this host as the cluster's master or as a replica
    Bootstrap(BootstrapArgs),
    /// Show cluster members and their roles
    Status(StatusArgs),
    /// Stream a backup of the master (or a given instance) to S3
    Backup(BackupArgs),
    /// Restore an instance from a backup in S3
    Restore(RestoreArgs),
}

/// Identifies the cluster and where its coordination state lives
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// Cluster identifier, also the Auto Scaling group name
    #[arg(long)]
    pub cluster_id: Option<String>,

    /// DynamoDB table holding the lock and the master record
    #[arg(long)]
    pub dynamodb_table: Option<String>,

    /// Secrets Manager secret with the MySQL passwords
    #[arg(long)]
    pub credentials_secret: Option<String>,

    /// VPC CIDR that replication and monitoring users may connect from
    #[arg(long)]
    pub vpc_cidr: Option<String>,

    /// Local instance id; read from instance metadata when omitted
    #[arg(long)]
    pub instance_id: Option<String>,

    /// How scripts reach MySQL hosts: "ssm" or "local"
    #[arg(long)]
    pub command_channel: Option<String>,
}

#[derive(Args, Debug)]
pub struct BootstrapArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Marker file written once the node is bootstrapped
    #[arg(long)]
    pub bootstrap_marker: Option<PathBuf>,

    /// Target group every node joins
    #[arg(long)]
    pub read_tg_arn: Option<String>,

    /// Target group only the master joins
    #[arg(long)]
    pub write_tg_arn: Option<String>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Also query each replica's replication threads and lag
    #[arg(long)]
    pub replication: bool,

    /// Marker file to report the local role from
    #[arg(long)]
    pub bootstrap_marker: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Instance to back up; defaults to the instance tagged master
    #[arg(long)]
    pub target: Option<String>,

    /// Object key; defaults to a timestamped key under the cluster prefix
    #[arg(long)]
    pub backup_key: Option<String>,

    /// Backup timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Instance whose data is replaced
    #[arg(long)]
    pub target: String,

    /// Object key; defaults to the cluster's latest backup
    #[arg(long)]
    pub backup_key: Option<String>,

    /// Restore timeout in seconds; estimated from the backup size when omitted
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl GlobalArgs {
    /// Filter used when `RUST_LOG` is unset
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else {
            "warn"
        }
    }

    pub fn apply_to(&self, config: &mut BootstrapConfig) {
        if let Some(profile) = &self.aws_profile {
            config.aws.profile = Some(profile.clone());
        }
        if let Some(region) = &self.aws_region {
            config.aws.region = Some(region.clone());
        }
    }
}

impl ClusterArgs {
    pub fn apply_to(&self, config: &mut BootstrapConfig) -> ih_mysql_core::BootstrapResult<()> {
        if let Some(v) = &self.cluster_id {
            config.cluster_id = v.clone();
        }
        if let Some(v) = &self.dynamodb_table {
            config.dynamodb_table = v.clone();
        }
        if let Some(v) = &self.credentials_secret {
            config.credentials_secret = v.clone();
        }
        if let Some(v) = &self.vpc_cidr {
            config.vpc_cidr = v.clone();
        }
        if let Some(v) = &self.instance_id {
            config.instance_id = Some(v.clone());
        }
        if let Some(v) = &self.command_channel {
            config.command_channel = v.parse()?;
        }
        Ok(())
    }
}
