//! Secrets Manager backed secret store

use async_trait::async_trait;
use serde_json::Value;

use super::cli::{has_code, AwsCli};
use crate::error::BootstrapResult;
use crate::services::SecretStore;

pub struct SecretsManager {
    cli: AwsCli,
}

impl SecretsManager {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl SecretStore for SecretsManager {
    /// A `SecretString` that is not JSON comes back as a JSON string value
    async fn get_secret(&self, name: &str) -> BootstrapResult<Option<Value>> {
        let response = match self
            .cli
            .call("secretsmanager", "get-secret-value", &["--secret-id", name])
            .await
        {
            Ok(response) => response,
            Err(e) if has_code(&e, &["ResourceNotFoundException"]) => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(raw) = response["SecretString"].as_str() else {
            return Ok(Some(Value::Null));
        };
        Ok(Some(
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
        ))
    }
}
