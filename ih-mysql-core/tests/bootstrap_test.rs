mod common;

use common::{TestCluster, BUCKET, CLUSTER, READ_TG, WRITE_TG};
use futures::future::join_all;
use ih_mysql_core::abstractions::CommandOutput;
use ih_mysql_core::mysql::{BootstrapOutcome, MarkerRecord};
use ih_mysql_core::services::SharedTable;
use ih_mysql_core::types::Role;
use ih_mysql_core::BootstrapError;
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test]
async fn test_existing_marker_skips_without_remote_calls() {
    let cluster = TestCluster::new();
    cluster.add_node("i-a", Some("10.0.1.10"), false);
    let path = cluster.marker_path("i-a");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "master\n").unwrap();

    let outcome = cluster.replica_set("i-a").bootstrap().await.unwrap();

    assert_eq!(outcome, BootstrapOutcome::AlreadyBootstrapped);
    assert_eq!(cluster.remote_calls(), 0);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let cluster = TestCluster::new();
    cluster.add_node("i-a", Some("10.0.1.10"), false);
    let replica_set = cluster.replica_set("i-a");

    replica_set.bootstrap().await.unwrap();
    let calls_after_first = cluster.remote_calls();

    let outcome = replica_set.bootstrap().await.unwrap();
    assert_eq!(outcome, BootstrapOutcome::AlreadyBootstrapped);
    assert_eq!(cluster.remote_calls(), calls_after_first);
}

#[tokio::test]
async fn test_first_node_becomes_master() {
    let cluster = TestCluster::new();
    cluster.add_node("i-a", Some("10.0.1.10"), false);

    let outcome = cluster.replica_set("i-a").bootstrap().await.unwrap();

    assert_eq!(outcome, BootstrapOutcome::Bootstrapped(MarkerRecord::Master));
    assert_eq!(cluster.marker_contents("i-a").as_deref(), Some("master\n"));
    assert_eq!(
        cluster
            .table
            .item("orders-master")
            .and_then(|i| i.attribute("instance_id").map(str::to_string)),
        Some("i-a".to_string())
    );
    assert_eq!(cluster.fleet.tags("i-a").role(), Some(Role::Master));
    assert!(cluster.fleet.is_protected("i-a"));
    assert_eq!(
        cluster.targets.registrations(),
        vec![
            (READ_TG.to_string(), "i-a".to_string()),
            (WRITE_TG.to_string(), "i-a".to_string()),
        ]
    );
    for (user, host) in [
        ("repl", "10.0.0.0/16"),
        ("backup", "localhost"),
        ("monitor", "localhost"),
        ("monitor", "10.0.0.0/16"),
    ] {
        assert!(cluster.mysql.user_exists("i-a", user, host));
    }
    // no bucket tag, so no backup
    assert!(cluster.blobs.object(BUCKET, "orders/latest").is_none());
}

#[tokio::test]
async fn test_later_node_becomes_replica_of_master() {
    let cluster = TestCluster::new();
    cluster.add_node("i-a", Some("10.0.1.10"), false);
    cluster.add_node("i-b", Some("10.0.1.11"), false);

    cluster.replica_set("i-a").bootstrap().await.unwrap();
    let outcome = cluster.replica_set("i-b").bootstrap().await.unwrap();

    assert_eq!(
        outcome,
        BootstrapOutcome::Bootstrapped(MarkerRecord::Replica {
            master_ip: Some("10.0.1.10".to_string())
        })
    );
    assert_eq!(
        cluster.marker_contents("i-b").as_deref(),
        Some("replica:10.0.1.10\n")
    );
    assert_eq!(cluster.mysql.source_of("i-b").as_deref(), Some("10.0.1.10"));
    assert_eq!(cluster.fleet.tags("i-b").role(), Some(Role::Replica));
    assert!(!cluster.fleet.is_protected("i-b"));
    assert!(cluster
        .targets
        .registrations()
        .contains(&(READ_TG.to_string(), "i-b".to_string())));
    assert!(!cluster
        .targets
        .registrations()
        .contains(&(WRITE_TG.to_string(), "i-b".to_string())));
    // replicas receive users through replication
    assert!(!cluster.mysql.user_exists("i-b", "repl", "10.0.0.0/16"));
}

#[tokio::test]
async fn test_concurrent_bootstraps_elect_exactly_one_master() {
    let cluster = TestCluster::new();
    let ids: Vec<String> = (0..5).map(|n| format!("i-{}", n)).collect();
    for (n, id) in ids.iter().enumerate() {
        cluster.add_node(id, Some(&format!("10.0.2.{}", n + 1)), false);
    }
    let sets: Vec<_> = ids.iter().map(|id| cluster.replica_set(id)).collect();

    let outcomes = join_all(sets.iter().map(|s| s.bootstrap())).await;

    let masters: Vec<&String> = ids
        .iter()
        .zip(&outcomes)
        .filter(|(_, o)| {
            matches!(o, Ok(BootstrapOutcome::Bootstrapped(MarkerRecord::Master)))
        })
        .map(|(id, _)| id)
        .collect();
    assert_eq!(masters.len(), 1);
    let master = masters[0];

    let recorded = cluster
        .table
        .item("orders-master")
        .and_then(|i| i.attribute("instance_id").map(str::to_string));
    assert_eq!(recorded.as_ref(), Some(master));

    for (id, outcome) in ids.iter().zip(&outcomes) {
        if id == master {
            continue;
        }
        assert!(
            matches!(
                outcome,
                Ok(BootstrapOutcome::Bootstrapped(MarkerRecord::Replica { .. }))
            ),
            "{} ended with {:?}",
            id,
            outcome
        );
        assert_eq!(cluster.fleet.tags(id).role(), Some(Role::Replica));
    }
}

#[tokio::test]
async fn test_two_nodes_with_backups_restore_before_replicating() {
    let cluster = TestCluster::new();
    cluster.add_node("i-a", Some("10.0.1.10"), true);
    cluster.add_node("i-b", Some("10.0.1.11"), true);
    let a = cluster.replica_set("i-a");
    let b = cluster.replica_set("i-b");

    let (ra, rb) = tokio::join!(a.bootstrap(), b.bootstrap());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    let (master, replica) = match (&ra, &rb) {
        (BootstrapOutcome::Bootstrapped(MarkerRecord::Master), _) => ("i-a", "i-b"),
        (_, BootstrapOutcome::Bootstrapped(MarkerRecord::Master)) => ("i-b", "i-a"),
        other => panic!("no master elected: {:?}", other),
    };
    let master_ip = if master == "i-a" { "10.0.1.10" } else { "10.0.1.11" };

    assert_eq!(cluster.marker_contents(master).as_deref(), Some("master\n"));
    assert_eq!(
        cluster.marker_contents(replica),
        Some(format!("replica:{}\n", master_ip))
    );
    assert_eq!(cluster.fleet.tags(master).role(), Some(Role::Master));
    assert_eq!(cluster.fleet.tags(replica).role(), Some(Role::Replica));

    // the master's backup moved the latest pointer
    let latest = cluster.blobs.object(BUCKET, "orders/latest").unwrap();
    let backup_key = String::from_utf8(latest).unwrap();
    assert!(backup_key.starts_with("orders/"));
    assert!(cluster.blobs.object(BUCKET, &backup_key).is_some());

    let scripts: Vec<String> = cluster
        .channel
        .invocations_for(replica)
        .into_iter()
        .map(|i| i.sql().unwrap_or(i.script))
        .collect();
    let restore = scripts
        .iter()
        .position(|s| s.contains("xbstream -x") && s.contains(&backup_key))
        .expect("restore ran");
    let configure = scripts
        .iter()
        .position(|s| s.contains("CHANGE REPLICATION SOURCE TO"))
        .expect("replication configured");
    assert!(restore < configure);
}

#[tokio::test]
async fn test_lock_held_elsewhere_fails_without_side_effects() {
    let cluster = TestCluster::new();
    cluster.add_node("i-a", Some("10.0.1.10"), false);
    let lease = cluster
        .table
        .acquire_lock("orders-bootstrap-lock", Duration::from_secs(1))
        .await
        .unwrap();

    let mut config = cluster.config_for("i-a");
    config.lock_timeout = Duration::from_millis(50);
    let replica_set =
        ih_mysql_core::MySqlReplicaSet::new(config, cluster.services_for("i-a"));

    let err = replica_set.bootstrap().await.unwrap_err();

    assert!(matches!(err, BootstrapError::LockNotAcquired { .. }));
    assert_eq!(cluster.marker_contents("i-a"), None);
    assert_eq!(cluster.channel.calls(), 0);
    assert!(cluster.table.item("orders-master").is_none());
    assert!(cluster.targets.registrations().is_empty());
    lease.release().await.unwrap();
}

#[tokio::test]
async fn test_unresolvable_master_is_fatal() {
    let cluster = TestCluster::new();
    cluster.add_node("i-gone", None, false);
    cluster.add_node("i-b", Some("10.0.1.11"), false);
    cluster
        .table
        .put_item(
            ih_mysql_core::types::TableItem::new(format!("{}-master", CLUSTER))
                .with_attribute("instance_id", "i-gone"),
        )
        .await
        .unwrap();

    let err = cluster.replica_set("i-b").bootstrap().await.unwrap_err();

    assert_eq!(err.to_string(), "Failed to get master IP for instance i-gone");
    assert_eq!(cluster.marker_contents("i-b"), None);
    assert_eq!(cluster.fleet.tags("i-b").role(), None);
}

#[tokio::test]
async fn test_failed_setup_releases_lock_and_writes_no_marker() {
    let cluster = TestCluster::new();
    cluster.add_node("i-a", Some("10.0.1.10"), false);
    cluster
        .secrets
        .insert(common::SECRET, serde_json::json!({"replication": "r"}));

    let err = cluster.replica_set("i-a").bootstrap().await.unwrap_err();

    assert_eq!(
        err.to_string(),
        "Credentials error: Missing required keys in credentials: backup, monitor"
    );
    assert_eq!(cluster.marker_contents("i-a"), None);
    assert!(cluster.table.item("orders-master").is_none());
    cluster
        .table
        .acquire_lock("orders-bootstrap-lock", Duration::from_millis(50))
        .await
        .expect("lock released after failure");
}

#[tokio::test]
async fn test_stopped_replication_fails_replica_bootstrap() {
    let cluster = TestCluster::with_responder(|invocation| match invocation.sql() {
        Some(sql) if sql.contains("SHOW REPLICA STATUS") => CommandOutput::success(
            "Replica_IO_Running: No\nReplica_SQL_Running: Yes\nSeconds_Behind_Source: NULL\n",
        ),
        _ => CommandOutput::success(""),
    });
    cluster.add_node("i-a", Some("10.0.1.10"), false);
    cluster.add_node("i-b", Some("10.0.1.11"), false);
    cluster.replica_set("i-a").bootstrap().await.unwrap();

    let err = cluster.replica_set("i-b").bootstrap().await.unwrap_err();

    assert!(matches!(err, BootstrapError::Replication { .. }));
    assert_eq!(cluster.marker_contents("i-b"), None);
    assert_eq!(cluster.fleet.tags("i-b").role(), None);
}

#[tokio::test]
async fn test_rerun_after_fixing_cause_succeeds() {
    let cluster = TestCluster::new();
    cluster.add_node("i-a", Some("10.0.1.10"), false);
    cluster
        .secrets
        .insert(common::SECRET, serde_json::json!("not-an-object"));

    let err = cluster.replica_set("i-a").bootstrap().await.unwrap_err();
    assert!(err.to_string().contains("must be a JSON object"));
    assert_eq!(cluster.marker_contents("i-a"), None);

    cluster.secrets.insert(
        common::SECRET,
        serde_json::json!({"replication": "r", "backup": "b", "monitor": "m"}),
    );
    let outcome = cluster.replica_set("i-a").bootstrap().await.unwrap();
    assert_eq!(outcome, BootstrapOutcome::Bootstrapped(MarkerRecord::Master));
    assert_eq!(cluster.marker_contents("i-a").as_deref(), Some("master\n"));
}

#[tokio::test]
async fn test_discovery_by_role_tag() {
    let cluster = TestCluster::new();
    cluster.add_node("i-a", Some("10.0.1.10"), false);
    cluster.add_node("i-b", Some("10.0.1.11"), false);
    cluster.add_node("i-c", Some("10.0.1.12"), false);
    for id in ["i-a", "i-b"] {
        cluster.replica_set(id).bootstrap().await.unwrap();
    }

    let replica_set = cluster.replica_set("i-c");
    let instances = replica_set.instances().await.unwrap();
    assert_eq!(instances.len(), 3);

    let master = replica_set.master().await.unwrap().unwrap();
    assert_eq!(master.instance_id(), "i-a");
    let replicas: Vec<String> = replica_set
        .replicas()
        .await
        .unwrap()
        .iter()
        .map(|r| r.instance_id().to_string())
        .collect();
    assert_eq!(replicas, vec!["i-b".to_string()]);
}
