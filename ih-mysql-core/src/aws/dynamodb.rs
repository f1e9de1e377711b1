//! DynamoDB-backed shared table and lease lock
//!
//! The lock is a row keyed by the lock name holding an owner token and a
//! lease expiry. Acquisition is a conditional `put-item` that succeeds only
//! when the row is absent or its lease has run out. While held, the lease is
//! extended by a conditional `update-item` on the owner; release deletes the
//! row only if this process still owns it.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cli::{has_code, AwsCli};
use crate::abstractions::Clock;
use crate::config::{duration_ms, DEFAULT_LOCK_KEY_NAME, DEFAULT_LOCK_POLL_INTERVAL_MS};
use crate::error::{BootstrapError, BootstrapResult};
use crate::services::{LockLease, SharedTable};
use crate::types::TableItem;

const CONDITIONAL_CHECK_FAILED: &str = "ConditionalCheckFailedException";

/// A DynamoDB table with a string partition key
pub struct DynamoDbTable {
    cli: AwsCli,
    table_name: String,
    key_name: String,
    clock: Arc<dyn Clock>,
    lease: Duration,
    poll_interval: Duration,
}

impl DynamoDbTable {
    pub fn new(cli: AwsCli, table_name: impl Into<String>, clock: Arc<dyn Clock>, lease: Duration) -> Self {
        Self {
            cli,
            table_name: table_name.into(),
            key_name: DEFAULT_LOCK_KEY_NAME.to_string(),
            clock,
            lease,
            poll_interval: duration_ms(DEFAULT_LOCK_POLL_INTERVAL_MS),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn key_json(&self, key: &str) -> String {
        json!({ &self.key_name: { "S": key } }).to_string()
    }

    async fn try_put_lock(&self, name: &str, owner: &str) -> BootstrapResult<bool> {
        let now = epoch_secs(self.clock.as_ref());
        let expires_at = now + self.lease.as_secs();
        let item = json!({
            &self.key_name: { "S": name },
            "owner": { "S": owner },
            "expires_at": { "N": expires_at.to_string() },
        })
        .to_string();
        let names = json!({ "#k": &self.key_name }).to_string();
        let values = json!({ ":now": { "N": now.to_string() } }).to_string();

        let result = self
            .cli
            .call(
                "dynamodb",
                "put-item",
                &[
                    "--table-name",
                    &self.table_name,
                    "--item",
                    &item,
                    "--condition-expression",
                    "attribute_not_exists(#k) OR expires_at < :now",
                    "--expression-attribute-names",
                    &names,
                    "--expression-attribute-values",
                    &values,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if has_code(&e, &[CONDITIONAL_CHECK_FAILED]) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SharedTable for DynamoDbTable {
    async fn get_item(&self, key: &str) -> BootstrapResult<Option<TableItem>> {
        let key_json = self.key_json(key);
        let response = self
            .cli
            .call(
                "dynamodb",
                "get-item",
                &[
                    "--table-name",
                    &self.table_name,
                    "--key",
                    &key_json,
                    "--consistent-read",
                ],
            )
            .await?;

        match response.get("Item").and_then(Value::as_object) {
            Some(item) => Ok(Some(item_from_json(&self.key_name, key, item))),
            None => Ok(None),
        }
    }

    async fn put_item(&self, item: TableItem) -> BootstrapResult<()> {
        let mut object = Map::new();
        object.insert(self.key_name.clone(), json!({ "S": item.key }));
        for (name, value) in &item.attributes {
            object.insert(name.clone(), json!({ "S": value }));
        }
        let item_json = Value::Object(object).to_string();

        self.cli
            .call(
                "dynamodb",
                "put-item",
                &["--table-name", &self.table_name, "--item", &item_json],
            )
            .await?;
        Ok(())
    }

    async fn acquire_lock(
        &self,
        name: &str,
        timeout: Duration,
    ) -> BootstrapResult<Box<dyn LockLease>> {
        let owner = Uuid::new_v4().to_string();
        let deadline = self.clock.now().saturating_add(timeout);

        loop {
            if self.try_put_lock(name, &owner).await? {
                info!("Acquired lock {} as {}", name, owner);
                return Ok(Box::new(DynamoDbLease {
                    cli: self.cli.clone(),
                    table_name: self.table_name.clone(),
                    key_name: self.key_name.clone(),
                    name: name.to_string(),
                    owner,
                    clock: self.clock.clone(),
                    lease: self.lease,
                }));
            }

            if self.clock.now() >= deadline {
                return Err(BootstrapError::LockNotAcquired {
                    name: name.to_string(),
                    reason: format!("held by another owner for more than {:?}", timeout),
                });
            }
            debug!("Lock {} is held, retrying in {:?}", name, self.poll_interval);
            self.clock.sleep(self.poll_interval).await;
        }
    }
}

struct DynamoDbLease {
    cli: AwsCli,
    table_name: String,
    key_name: String,
    name: String,
    owner: String,
    clock: Arc<dyn Clock>,
    lease: Duration,
}

#[async_trait]
impl LockLease for DynamoDbLease {
    fn name(&self) -> &str {
        &self.name
    }

    /// A third of the lease, so two renewals can fail before it runs out
    fn renew_interval(&self) -> Option<Duration> {
        Some(self.lease / 3)
    }

    async fn renew(&self) -> BootstrapResult<()> {
        let key_json = json!({ &self.key_name: { "S": &self.name } }).to_string();
        let expires_at = epoch_secs(self.clock.as_ref()) + self.lease.as_secs();
        let values = json!({
            ":owner": { "S": &self.owner },
            ":expires_at": { "N": expires_at.to_string() },
        })
        .to_string();
        let result = self
            .cli
            .call(
                "dynamodb",
                "update-item",
                &[
                    "--table-name",
                    &self.table_name,
                    "--key",
                    &key_json,
                    "--update-expression",
                    "SET expires_at = :expires_at",
                    "--condition-expression",
                    "#o = :owner",
                    "--expression-attribute-names",
                    r##"{"#o":"owner"}"##,
                    "--expression-attribute-values",
                    &values,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if has_code(&e, &[CONDITIONAL_CHECK_FAILED]) => Err(BootstrapError::LockLost {
                name: self.name.clone(),
                reason: format!("lease of {} was taken over by another owner", self.owner),
            }),
            Err(e) => Err(e),
        }
    }

    async fn release(self: Box<Self>) -> BootstrapResult<()> {
        let key_json = json!({ &self.key_name: { "S": &self.name } }).to_string();
        let values = json!({ ":owner": { "S": &self.owner } }).to_string();
        let result = self
            .cli
            .call(
                "dynamodb",
                "delete-item",
                &[
                    "--table-name",
                    &self.table_name,
                    "--key",
                    &key_json,
                    "--condition-expression",
                    "#o = :owner",
                    "--expression-attribute-names",
                    r##"{"#o":"owner"}"##,
                    "--expression-attribute-values",
                    &values,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if has_code(&e, &[CONDITIONAL_CHECK_FAILED]) => {
                warn!("Lease on {} expired and was taken over before release", self.name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn epoch_secs(clock: &dyn Clock) -> u64 {
    clock
        .system_time()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Flatten DynamoDB's typed attribute values into strings
fn item_from_json(key_name: &str, key: &str, item: &Map<String, Value>) -> TableItem {
    let mut result = TableItem::new(key);
    for (name, typed) in item {
        if name == key_name {
            continue;
        }
        let value = typed
            .get("S")
            .or_else(|| typed.get("N"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| typed.get("BOOL").and_then(Value::as_bool).map(|b| b.to_string()));
        if let Some(value) = value {
            result.attributes.insert(name.clone(), value);
        }
    }
    result
}
