use anyhow::{anyhow, Context, Result};
use ih_mysql_core::abstractions::{FileSystem, TokioCommandExecutor};
use ih_mysql_core::mysql::MarkerRecord;
use ih_mysql_core::types::Role;
use ih_mysql_core::{
    aws, BootstrapConfig, BootstrapOutcome, ClusterServices, MySqlReplicaSet,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cli::{BackupArgs, BootstrapArgs, ClusterArgs, Commands, GlobalArgs, RestoreArgs, StatusArgs};

pub async fn run(global: GlobalArgs, command: Commands) -> Result<()> {
    match command {
        Commands::Bootstrap(args) => bootstrap(&global, args).await,
        Commands::Status(args) => status(&global, args).await,
        Commands::Backup(args) => backup(&global, args).await,
        Commands::Restore(args) => restore(&global, args).await,
    }
}

/// File, then `IH_MYSQL_*` environment, then flags
fn load_config(
    global: &GlobalArgs,
    cluster: &ClusterArgs,
    bootstrap_marker: Option<&PathBuf>,
) -> Result<BootstrapConfig> {
    let mut config = match &global.config {
        Some(path) => BootstrapConfig::from_file(path)?,
        None => BootstrapConfig::new(),
    };
    config.apply_env()?;
    cluster.apply_to(&mut config)?;
    global.apply_to(&mut config);
    if let Some(path) = bootstrap_marker {
        config.bootstrap_marker = path.clone();
    }
    config.validate()?;
    Ok(config)
}

fn services(config: &BootstrapConfig) -> ClusterServices {
    aws::cluster_services(config, Arc::new(TokioCommandExecutor::new()))
}

async fn bootstrap(global: &GlobalArgs, args: BootstrapArgs) -> Result<()> {
    let mut config = load_config(global, &args.cluster, args.bootstrap_marker.as_ref())?;
    if args.read_tg_arn.is_some() {
        config.read_tg_arn = args.read_tg_arn;
    }
    if args.write_tg_arn.is_some() {
        config.write_tg_arn = args.write_tg_arn;
    }

    let replica_set = MySqlReplicaSet::new(config.clone(), services(&config));
    let outcome = replica_set
        .bootstrap()
        .await
        .with_context(|| format!("Bootstrap of cluster {} failed", config.cluster_id))?;

    match outcome {
        BootstrapOutcome::AlreadyBootstrapped => println!(
            "Already bootstrapped (marker {})",
            config.bootstrap_marker.display()
        ),
        BootstrapOutcome::Bootstrapped(MarkerRecord::Master) => {
            println!("Bootstrapped as master of {}", config.cluster_id)
        }
        BootstrapOutcome::Bootstrapped(MarkerRecord::Replica { master_ip }) => println!(
            "Bootstrapped as replica of {}",
            master_ip.as_deref().unwrap_or("unknown master")
        ),
    }
    Ok(())
}

async fn status(global: &GlobalArgs, args: StatusArgs) -> Result<()> {
    let config = load_config(global, &args.cluster, args.bootstrap_marker.as_ref())?;
    let services = services(&config);
    let fs = services.fs.clone();
    let replica_set = MySqlReplicaSet::new(config, services);
    write_status(&replica_set, fs.as_ref(), args.replication, &mut std::io::stdout()).await
}

/// One line per cluster member, then the local marker
async fn write_status(
    replica_set: &MySqlReplicaSet,
    fs: &dyn FileSystem,
    replication: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let master_id = replica_set.get_master_instance_id().await?;
    writeln!(
        out,
        "Cluster {}: master record {}",
        replica_set.cluster(),
        master_id.as_deref().unwrap_or("<none>")
    )?;

    for instance in replica_set.instances().await? {
        let mut line = format!(
            "{}\t{}\t{}",
            instance.instance_id(),
            instance.role().map_or("untagged", |r| r.as_str()),
            instance.private_ip().unwrap_or("-")
        );
        if replication && instance.role() != Some(Role::Master) {
            let status = instance.replication_status().await?;
            line.push('\t');
            line.push_str(&status.to_string());
        }
        writeln!(out, "{}", line)?;
    }

    let marker = replica_set.marker();
    match marker.read(fs).await? {
        Some(record) => write!(out, "Local marker {}: {}", marker.path().display(), record)?,
        None => writeln!(out, "Local marker {}: absent", marker.path().display())?,
    }
    Ok(())
}

async fn backup(global: &GlobalArgs, args: BackupArgs) -> Result<()> {
    let config = load_config(global, &args.cluster, None)?;
    let replica_set = MySqlReplicaSet::new(config.clone(), services(&config));
    let key = run_backup(
        &replica_set,
        args.target.as_deref(),
        args.backup_key.as_deref(),
        args.timeout.map(Duration::from_secs),
    )
    .await?;
    println!("{}", key);
    Ok(())
}

/// Back up `target`, or the member tagged master; returns the backup key
async fn run_backup(
    replica_set: &MySqlReplicaSet,
    target: Option<&str>,
    backup_key: Option<&str>,
    timeout: Option<Duration>,
) -> Result<String> {
    let instance = match target {
        Some(id) => replica_set.instance(id).await?,
        None => replica_set
            .master()
            .await?
            .ok_or_else(|| anyhow!("No instance in {} is tagged as master", replica_set.cluster()))?,
    };
    info!("Backing up {}", instance.instance_id());

    instance
        .backup_to_s3(backup_key, timeout)
        .await
        .with_context(|| format!("Backup of {} failed", instance.instance_id()))
}

async fn restore(global: &GlobalArgs, args: RestoreArgs) -> Result<()> {
    let config = load_config(global, &args.cluster, None)?;
    let replica_set = MySqlReplicaSet::new(config.clone(), services(&config));
    run_restore(
        &replica_set,
        &args.target,
        args.backup_key.as_deref(),
        args.timeout.map(Duration::from_secs),
    )
    .await?;
    println!("Restored {}", args.target);
    Ok(())
}

async fn run_restore(
    replica_set: &MySqlReplicaSet,
    target: &str,
    backup_key: Option<&str>,
    timeout: Option<Duration>,
) -> Result<()> {
    let instance = replica_set.instance(target).await?;
    instance
        .restore_from_s3(backup_key, timeout)
        .await
        .with_context(|| format!("Restore of {} failed", instance.instance_id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ih_mysql_core::abstractions::{CommandOutput, MockClock, MockFileSystem};
    use ih_mysql_core::services::memory::{
        MemoryBlobStore, MemoryCommandChannel, MemoryFleet, MemorySecrets, MemoryTable,
        MemoryTargets,
    };
    use ih_mysql_core::services::SharedTable;
    use ih_mysql_core::types::{NodeTags, TableItem, ROLE_TAG, S3_BUCKET_TAG};

    struct Fixture {
        table: Arc<MemoryTable>,
        blobs: Arc<MemoryBlobStore>,
        channel: MemoryCommandChannel,
        fs: Arc<MockFileSystem>,
        replica_set: MySqlReplicaSet,
    }

    fn tags(role: Option<&str>) -> NodeTags {
        let mut tags = NodeTags::new();
        tags.insert(S3_BUCKET_TAG, "orders-backups");
        if let Some(role) = role {
            tags.insert(ROLE_TAG, role);
        }
        tags
    }

    /// Three members: a master, a replica and a node not yet tagged
    fn fixture() -> Fixture {
        let fleet = MemoryFleet::new();
        fleet.add_instance("orders", "i-master", Some("10.0.1.10"), tags(Some("master")));
        fleet.add_instance("orders", "i-replica", Some("10.0.1.11"), tags(Some("replica")));
        fleet.add_instance("orders", "i-new", None, tags(None));

        let secrets = Arc::new(MemorySecrets::new());
        secrets.insert(
            "test-secret",
            serde_json::json!({"replication": "r", "backup": "b", "monitor": "m"}),
        );
        let channel = MemoryCommandChannel::with_responder(|invocation| {
            match invocation.sql() {
                Some(sql) if sql.contains("SHOW REPLICA STATUS") => CommandOutput::success(
                    "Replica_IO_Running: Yes\nReplica_SQL_Running: Yes\nSeconds_Behind_Source: 4\n",
                ),
                _ => CommandOutput::success(""),
            }
        });
        let table = Arc::new(MemoryTable::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let fs = Arc::new(MockFileSystem::new());
        let services = ClusterServices::new(
            table.clone(),
            Arc::new(fleet),
            secrets,
            blobs.clone(),
            Arc::new(channel.clone()),
            Arc::new(MemoryTargets::new()),
        )
        .with_clock(Arc::new(MockClock::new()))
        .with_filesystem(fs.clone());

        let config = BootstrapConfig {
            bootstrap_marker: PathBuf::from("/var/lib/mysql/.bootstrapped"),
            ..BootstrapConfig::test("orders")
        };
        Fixture {
            table,
            blobs,
            channel,
            fs,
            replica_set: MySqlReplicaSet::new(config, services),
        }
    }

    #[tokio::test]
    async fn test_status_lists_members_and_marker() {
        let f = fixture();
        f.table
            .put_item(TableItem::new("orders-master").with_attribute("instance_id", "i-master"))
            .await
            .unwrap();
        f.fs.add_file("/var/lib/mysql/.bootstrapped", "replica:10.0.1.10\n");

        let mut out = Vec::new();
        write_status(&f.replica_set, f.fs.as_ref(), true, &mut out)
            .await
            .unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains("Cluster orders: master record i-master\n"));
        assert!(out.contains("i-master\tmaster\t10.0.1.10\n"));
        assert!(out.contains("i-replica\treplica\t10.0.1.11\tio=Yes sql=Yes lag=4s\n"));
        assert!(out.contains("i-new\tuntagged\t-\tio=Yes sql=Yes lag=4s\n"));
        assert!(out.ends_with("Local marker /var/lib/mysql/.bootstrapped: replica:10.0.1.10\n"));
        assert_eq!(f.channel.invocations_for("i-master").len(), 0);
    }

    #[tokio::test]
    async fn test_status_without_replication_runs_no_sql() {
        let f = fixture();

        let mut out = Vec::new();
        write_status(&f.replica_set, f.fs.as_ref(), false, &mut out)
            .await
            .unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains("master record <none>"));
        assert!(out.contains("i-replica\treplica\t10.0.1.11\n"));
        assert!(out.ends_with(": absent\n"));
        assert_eq!(f.channel.calls(), 0);
    }

    #[tokio::test]
    async fn test_backup_defaults_to_tagged_master() {
        let f = fixture();

        let key = run_backup(&f.replica_set, None, Some("orders/manual.xbstream.gz"), None)
            .await
            .unwrap();

        assert_eq!(key, "orders/manual.xbstream.gz");
        assert_eq!(f.channel.invocations_for("i-master").len(), 1);
        assert!(f.channel.invocations_for("i-replica").is_empty());
        assert_eq!(
            f.blobs.object("orders-backups", "orders/latest"),
            Some(b"orders/manual.xbstream.gz".to_vec())
        );
    }

    #[tokio::test]
    async fn test_backup_of_explicit_target() {
        let f = fixture();

        run_backup(&f.replica_set, Some("i-replica"), None, Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let invocations = f.channel.invocations_for("i-replica");
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_restore_of_target_with_explicit_key() {
        let f = fixture();

        run_restore(
            &f.replica_set,
            "i-new",
            Some("orders/pinned.xbstream.gz"),
            Some(Duration::from_secs(120)),
        )
        .await
        .unwrap();

        let invocations = f.channel.invocations_for("i-new");
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].script.contains("orders/pinned.xbstream.gz"));
        assert_eq!(f.blobs.reads_of("orders-backups", "orders/latest"), 0);
    }

    #[tokio::test]
    async fn test_restore_of_unknown_instance_fails() {
        let f = fixture();

        let err = run_restore(&f.replica_set, "i-gone", None, None)
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("'i-gone' does not exist"));
        assert_eq!(f.channel.calls(), 0);
    }
}
