//! In-process implementations of the collaborator contracts
//!
//! Each implementation counts the calls it receives so tests can assert that a
//! code path made no remote calls at all. [`MemoryTable`] backs its lock with
//! a real `tokio::sync::Mutex`, so concurrent bootstraps against one table
//! race exactly like fleet members racing on DynamoDB.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

use super::{
    BlobStore, CommandChannel, FleetDirectory, LockLease, SecretStore, SharedTable,
    TargetRegistry,
};
use crate::abstractions::CommandOutput;
use crate::error::{BootstrapError, BootstrapResult};
use crate::types::{InstanceDescription, NodeTags, TableItem};

/// Shared table with per-name mutex locks
#[derive(Default)]
pub struct MemoryTable {
    items: RwLock<HashMap<String, TableItem>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    calls: AtomicUsize,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn item(&self, key: &str) -> Option<TableItem> {
        self.items.read().get(key).cloned()
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl SharedTable for MemoryTable {
    async fn get_item(&self, key: &str) -> BootstrapResult<Option<TableItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.read().get(key).cloned())
    }

    async fn put_item(&self, item: TableItem) -> BootstrapResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.items.write().insert(item.key.clone(), item);
        Ok(())
    }

    async fn acquire_lock(
        &self,
        name: &str,
        timeout: Duration,
    ) -> BootstrapResult<Box<dyn LockLease>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mutex = self.lock_for(name);
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(Box::new(MemoryLease {
                name: name.to_string(),
                _guard: guard,
            })),
            Err(_) => Err(BootstrapError::LockNotAcquired {
                name: name.to_string(),
                reason: format!("still held after {:?}", timeout),
            }),
        }
    }
}

struct MemoryLease {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl LockLease for MemoryLease {
    fn name(&self) -> &str {
        &self.name
    }

    fn renew_interval(&self) -> Option<Duration> {
        None
    }

    async fn renew(&self) -> BootstrapResult<()> {
        Ok(())
    }

    async fn release(self: Box<Self>) -> BootstrapResult<()> {
        Ok(())
    }
}

/// Fleet of instances grouped by Auto Scaling group name
///
/// Clones and [`MemoryFleet::local_view`]s share state, so several nodes
/// can each see themselves as the local instance of one fleet.
#[derive(Clone, Default)]
pub struct MemoryFleet {
    instances: Arc<RwLock<BTreeMap<String, InstanceDescription>>>,
    groups: Arc<RwLock<HashMap<String, Vec<String>>>>,
    protected: Arc<RwLock<HashSet<String>>>,
    local_instance_id: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl MemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same fleet as seen from `instance_id`
    pub fn local_view(&self, instance_id: impl Into<String>) -> Self {
        Self {
            local_instance_id: Some(instance_id.into()),
            ..self.clone()
        }
    }

    /// Add a member to `group`
    pub fn add_instance(
        &self,
        group: &str,
        instance_id: &str,
        private_ip: Option<&str>,
        tags: NodeTags,
    ) {
        self.instances.write().insert(
            instance_id.to_string(),
            InstanceDescription {
                instance_id: instance_id.to_string(),
                private_ip: private_ip.map(str::to_string),
                tags,
            },
        );
        self.groups
            .write()
            .entry(group.to_string())
            .or_default()
            .push(instance_id.to_string());
    }

    pub fn tags(&self, instance_id: &str) -> NodeTags {
        self.instances
            .read()
            .get(instance_id)
            .map(|i| i.tags.clone())
            .unwrap_or_default()
    }

    pub fn is_protected(&self, instance_id: &str) -> bool {
        self.protected.read().contains(instance_id)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FleetDirectory for MemoryFleet {
    async fn local_instance_id(&self) -> BootstrapResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.local_instance_id
            .clone()
            .ok_or_else(|| BootstrapError::internal("no local instance configured"))
    }

    async fn list_members(&self, group: &str) -> BootstrapResult<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.groups.read().get(group).cloned().unwrap_or_default())
    }

    async fn describe(&self, instance_id: &str) -> BootstrapResult<InstanceDescription> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.instances
            .read()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| BootstrapError::Aws {
                operation: "ec2 describe-instances".to_string(),
                code: Some("InvalidInstanceID.NotFound".to_string()),
                message: format!("The instance ID '{}' does not exist", instance_id),
            })
    }

    async fn set_tag(&self, instance_id: &str, key: &str, value: &str) -> BootstrapResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut instances = self.instances.write();
        let instance = instances.get_mut(instance_id).ok_or_else(|| {
            BootstrapError::internal(format!("cannot tag unknown instance {}", instance_id))
        })?;
        instance.tags.insert(key, value);
        Ok(())
    }

    async fn enable_scale_in_protection(&self, instance_id: &str) -> BootstrapResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.protected.write().insert(instance_id.to_string());
        Ok(())
    }
}

/// Secrets keyed by name
#[derive(Default)]
pub struct MemorySecrets {
    secrets: RwLock<HashMap<String, serde_json::Value>>,
    calls: AtomicUsize,
}

impl MemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, value: serde_json::Value) {
        self.secrets.write().insert(name.to_string(), value);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for MemorySecrets {
    async fn get_secret(&self, name: &str) -> BootstrapResult<Option<serde_json::Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.secrets.read().get(name).cloned())
    }
}

/// Objects keyed by `(bucket, key)`
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
    sizes: RwLock<HashMap<(String, String), u64>>,
    reads: Mutex<Vec<(String, String)>>,
    calls: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    /// Report `size` from `head` regardless of the stored body
    pub fn set_size(&self, bucket: &str, key: &str, size: u64) {
        self.sizes
            .write()
            .insert((bucket.to_string(), key.to_string()), size);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of `get` calls made for one object
    pub fn reads_of(&self, bucket: &str, key: &str) -> usize {
        self.reads
            .lock()
            .iter()
            .filter(|(b, k)| b == bucket && k == key)
            .count()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn head(&self, bucket: &str, key: &str) -> BootstrapResult<Option<u64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = (bucket.to_string(), key.to_string());
        if let Some(size) = self.sizes.read().get(&id) {
            return Ok(Some(*size));
        }
        Ok(self.objects.read().get(&id).map(|body| body.len() as u64))
    }

    async fn get(&self, bucket: &str, key: &str) -> BootstrapResult<Option<Vec<u8>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reads
            .lock()
            .push((bucket.to_string(), key.to_string()));
        Ok(self.object(bucket, key))
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> BootstrapResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.insert(bucket, key, body);
        Ok(())
    }
}

/// Registrations as `(target_group_arn, instance_id)` pairs
#[derive(Default)]
pub struct MemoryTargets {
    registrations: Mutex<Vec<(String, String)>>,
}

impl MemoryTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registrations(&self) -> Vec<(String, String)> {
        self.registrations.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.registrations.lock().len()
    }
}

#[async_trait]
impl TargetRegistry for MemoryTargets {
    async fn register(&self, target_group_arn: &str, instance_id: &str) -> BootstrapResult<()> {
        self.registrations
            .lock()
            .push((target_group_arn.to_string(), instance_id.to_string()));
        Ok(())
    }
}

static BASE64_PAYLOAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"echo ([A-Za-z0-9+/=]+) \| base64 -d").expect("valid regex"));

/// A script sent through [`MemoryCommandChannel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInvocation {
    pub instance_id: String,
    pub script: String,
    pub timeout: Duration,
}

impl RemoteInvocation {
    /// Text smuggled into the script through `echo <base64> | base64 -d`
    pub fn payload(&self) -> Option<String> {
        let encoded = BASE64_PAYLOAD.captures(&self.script)?.get(1)?.as_str();
        let bytes = BASE64.decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// SQL fed to the mysql client, if this invocation runs SQL
    pub fn sql(&self) -> Option<String> {
        if self.script.contains("mysql -u root") {
            self.payload()
        } else {
            None
        }
    }
}

type ChannelResponder = dyn Fn(&RemoteInvocation) -> CommandOutput + Send + Sync;

/// Command channel that records every script and answers through a responder
#[derive(Clone)]
pub struct MemoryCommandChannel {
    invocations: Arc<Mutex<Vec<RemoteInvocation>>>,
    responder: Arc<ChannelResponder>,
}

impl Default for MemoryCommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCommandChannel {
    /// Every script succeeds with empty output
    pub fn new() -> Self {
        Self::with_responder(|_| CommandOutput::success(""))
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&RemoteInvocation) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            invocations: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(responder),
        }
    }

    /// Channel backed by [`SimulatedMySql`]
    pub fn simulated_mysql() -> (Self, Arc<SimulatedMySql>) {
        let mysql = Arc::new(SimulatedMySql::default());
        let responder = mysql.clone();
        (
            Self::with_responder(move |invocation| responder.respond(invocation)),
            mysql,
        )
    }

    pub fn invocations(&self) -> Vec<RemoteInvocation> {
        self.invocations.lock().clone()
    }

    pub fn invocations_for(&self, instance_id: &str) -> Vec<RemoteInvocation> {
        self.invocations
            .lock()
            .iter()
            .filter(|i| i.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// SQL batches sent to `instance_id`, in order
    pub fn sql_for(&self, instance_id: &str) -> Vec<String> {
        self.invocations_for(instance_id)
            .iter()
            .filter_map(RemoteInvocation::sql)
            .collect()
    }

    pub fn calls(&self) -> usize {
        self.invocations.lock().len()
    }
}

#[async_trait]
impl CommandChannel for MemoryCommandChannel {
    async fn execute(
        &self,
        instance_id: &str,
        script: &str,
        timeout: Duration,
    ) -> BootstrapResult<CommandOutput> {
        let invocation = RemoteInvocation {
            instance_id: instance_id.to_string(),
            script: script.to_string(),
            timeout,
        };
        self.invocations.lock().push(invocation.clone());
        Ok((self.responder)(&invocation))
    }
}

static CREATE_USER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"CREATE USER '((?:[^'\\]|\\.)*)'@'((?:[^'\\]|\\.)*)'").expect("valid regex")
});
static USER_LOOKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"user='((?:[^'\\]|\\.)*)' AND host='((?:[^'\\]|\\.)*)'").expect("valid regex")
});
static SOURCE_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SOURCE_HOST='((?:[^'\\]|\\.)*)'").expect("valid regex"));

/// Minimal per-instance MySQL model for end-to-end tests
///
/// Tracks created users and the replication source of each instance, answers
/// user lookups and `SHOW REPLICA STATUS`, and fails `CREATE USER` for an
/// existing user the way MySQL does. Non-SQL scripts (backup, restore)
/// succeed.
#[derive(Default)]
pub struct SimulatedMySql {
    users: Mutex<HashSet<(String, String, String)>>,
    sources: Mutex<HashMap<String, String>>,
}

impl SimulatedMySql {
    pub fn user_exists(&self, instance_id: &str, user: &str, host: &str) -> bool {
        self.users.lock().contains(&(
            instance_id.to_string(),
            user.to_string(),
            host.to_string(),
        ))
    }

    /// Address the instance replicates from
    pub fn source_of(&self, instance_id: &str) -> Option<String> {
        self.sources.lock().get(instance_id).cloned()
    }

    /// Answer one script the way the modelled servers would
    pub fn respond(&self, invocation: &RemoteInvocation) -> CommandOutput {
        let Some(sql) = invocation.sql() else {
            return CommandOutput::success("");
        };
        let instance = invocation.instance_id.clone();

        if sql.contains("SHOW REPLICA STATUS") {
            return match self.source_of(&instance) {
                Some(source) => CommandOutput::success(format!(
                    "*************************** 1. row ***************************\n\
                     \x20            Source_Host: {}\n\
                     \x20      Replica_IO_Running: Yes\n\
                     \x20     Replica_SQL_Running: Yes\n\
                     \x20   Seconds_Behind_Source: 0\n",
                    source
                )),
                None => CommandOutput::success(""),
            };
        }

        if let Some(caps) = USER_LOOKUP.captures(&sql) {
            let key = (instance, caps[1].to_string(), caps[2].to_string());
            let found = self.users.lock().contains(&key);
            return CommandOutput::success(if found { "1\n1\n" } else { "" });
        }

        if let Some(caps) = CREATE_USER.captures(&sql) {
            let key = (instance.clone(), caps[1].to_string(), caps[2].to_string());
            if !self.users.lock().insert(key) {
                return CommandOutput::failure(
                    1,
                    format!(
                        "ERROR 1396 (HY000) at line 1: Operation CREATE USER failed for '{}'@'{}'",
                        &caps[1], &caps[2]
                    ),
                );
            }
        }

        if let Some(caps) = SOURCE_HOST.captures(&sql) {
            self.sources.lock().insert(instance, caps[1].to_string());
        }

        CommandOutput::success("")
    }
}
