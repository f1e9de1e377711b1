//! Command channels: SSM `send-command` for fleet members, `bash -c` for the
//! current host

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::cli::{has_code, AwsCli};
use crate::abstractions::{Clock, CommandExecutor, CommandOptions, CommandOutput};
use crate::config::{duration_ms, DEFAULT_SSM_POLL_INTERVAL_MS};
use crate::error::{BootstrapError, BootstrapResult};
use crate::services::CommandChannel;

const TERMINAL_STATUSES: &[&str] = &["Success", "Failed", "Cancelled", "TimedOut"];
/// Extra time allowed past the script's own timeout for SSM bookkeeping
const SSM_GRACE: Duration = Duration::from_secs(60);

/// Runs scripts through the `AWS-RunShellScript` document
pub struct SsmChannel {
    cli: AwsCli,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl SsmChannel {
    pub fn new(cli: AwsCli, clock: Arc<dyn Clock>) -> Self {
        Self {
            cli,
            clock,
            poll_interval: duration_ms(DEFAULT_SSM_POLL_INTERVAL_MS),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn send(&self, instance_id: &str, script: &str, timeout: Duration) -> BootstrapResult<String> {
        let parameters = json!({
            "commands": [script],
            "executionTimeout": [timeout.as_secs().to_string()],
        })
        .to_string();

        let response = self
            .cli
            .call(
                "ssm",
                "send-command",
                &[
                    "--document-name",
                    "AWS-RunShellScript",
                    "--instance-ids",
                    instance_id,
                    "--parameters",
                    &parameters,
                ],
            )
            .await?;

        response["Command"]["CommandId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BootstrapError::Aws {
                operation: "ssm send-command".to_string(),
                code: None,
                message: "response carries no CommandId".to_string(),
            })
    }
}

#[async_trait]
impl CommandChannel for SsmChannel {
    #[instrument(skip(self, script))]
    async fn execute(
        &self,
        instance_id: &str,
        script: &str,
        timeout: Duration,
    ) -> BootstrapResult<CommandOutput> {
        let command_id = self.send(instance_id, script, timeout).await?;
        debug!("SSM command {} sent to {}", command_id, instance_id);

        let limit = timeout + SSM_GRACE;
        let deadline = self.clock.now().saturating_add(limit);
        loop {
            self.clock.sleep(self.poll_interval).await;

            let invocation = match self
                .cli
                .call(
                    "ssm",
                    "get-command-invocation",
                    &["--command-id", &command_id, "--instance-id", instance_id],
                )
                .await
            {
                Ok(invocation) => Some(invocation),
                // The invocation is not queryable for a moment after send-command
                Err(e) if has_code(&e, &["InvocationDoesNotExist"]) => None,
                Err(e) => return Err(e),
            };

            if let Some(invocation) = invocation {
                let status = invocation["Status"].as_str().unwrap_or_default();
                if TERMINAL_STATUSES.contains(&status) {
                    debug!("SSM command {} finished with {}", command_id, status);
                    return Ok(CommandOutput {
                        status: invocation["ResponseCode"]
                            .as_i64()
                            .and_then(|c| i32::try_from(c).ok())
                            .unwrap_or(-1),
                        stdout: invocation["StandardOutputContent"]
                            .as_str()
                            .unwrap_or_default()
                            .as_bytes()
                            .to_vec(),
                        stderr: invocation["StandardErrorContent"]
                            .as_str()
                            .unwrap_or_default()
                            .as_bytes()
                            .to_vec(),
                    });
                }
            }

            if self.clock.now() >= deadline {
                return Err(BootstrapError::Timeout {
                    operation: format!("SSM command {} on {}", command_id, instance_id),
                    duration: limit,
                });
            }
        }
    }
}

/// Runs scripts on the current host with `bash -c`
///
/// Only meaningful when the target instance is the host itself; the
/// instance id is logged but not otherwise used.
pub struct LocalChannel {
    executor: Arc<dyn CommandExecutor>,
}

impl LocalChannel {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl CommandChannel for LocalChannel {
    async fn execute(
        &self,
        instance_id: &str,
        script: &str,
        timeout: Duration,
    ) -> BootstrapResult<CommandOutput> {
        debug!("Running script locally for {}", instance_id);
        self.executor
            .execute(
                "bash",
                &["-c", script],
                CommandOptions::new().with_timeout(timeout),
            )
            .await
    }
}
