//! Thin runner around the `aws` command-line client

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::abstractions::{CommandExecutor, CommandOptions, CommandOutput};
use crate::config::AwsConfig;
use crate::error::{BootstrapError, BootstrapResult};

static AWS_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"An error occurred \(([^)]+)\)(?: when calling the \w+ operation)?(?: \(.*?\))?: (.*)")
        .expect("valid regex")
});

/// Invokes `aws <service> <operation> ...` with JSON output
///
/// Region and profile are appended as global options when configured. The
/// pager is disabled so output is never held back waiting for a terminal.
#[derive(Clone)]
pub struct AwsCli {
    executor: Arc<dyn CommandExecutor>,
    region: Option<String>,
    profile: Option<String>,
}

impl AwsCli {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: &AwsConfig) -> Self {
        Self {
            executor,
            region: config.region.clone(),
            profile: config.profile.clone(),
        }
    }

    /// Run an API call and parse its JSON response
    ///
    /// Calls that print nothing on success (`put-item`, `create-tags`)
    /// yield `Value::Null`.
    pub async fn call(&self, service: &str, operation: &str, args: &[&str]) -> BootstrapResult<Value> {
        let output = self
            .run(service, operation, args, CommandOptions::new())
            .await?;
        let stdout = output.stdout_lossy();
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&stdout)?)
    }

    /// Run a command and return its raw output, failing on non-zero exit
    pub async fn run(
        &self,
        service: &str,
        operation: &str,
        args: &[&str],
        options: CommandOptions,
    ) -> BootstrapResult<CommandOutput> {
        let mut argv: Vec<&str> = vec![service, operation];
        argv.extend_from_slice(args);
        argv.extend_from_slice(&["--output", "json"]);
        if let Some(region) = &self.region {
            argv.extend_from_slice(&["--region", region]);
        }
        if let Some(profile) = &self.profile {
            argv.extend_from_slice(&["--profile", profile]);
        }

        debug!("aws {} {}", service, operation);
        let output = self
            .executor
            .execute("aws", &argv, options.with_env_var("AWS_PAGER", ""))
            .await?;

        if output.is_success() {
            Ok(output)
        } else {
            Err(parse_error(
                &format!("{} {}", service, operation),
                &output.stderr_lossy(),
            ))
        }
    }
}

/// Build an [`BootstrapError::Aws`] from the client's stderr
pub fn parse_error(operation: &str, stderr: &str) -> BootstrapError {
    let stderr = stderr.trim();
    match AWS_ERROR.captures(stderr) {
        Some(caps) => BootstrapError::Aws {
            operation: operation.to_string(),
            code: Some(caps[1].to_string()),
            message: caps[2].trim().to_string(),
        },
        None => BootstrapError::Aws {
            operation: operation.to_string(),
            code: None,
            message: stderr.to_string(),
        },
    }
}

/// Whether `err` is an AWS error carrying one of `codes`
pub fn has_code(err: &BootstrapError, codes: &[&str]) -> bool {
    err.aws_code().map_or(false, |code| codes.contains(&code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstractions::MockCommandExecutor;

    #[test]
    fn test_parse_error_with_code() {
        let err = parse_error(
            "dynamodb put-item",
            "\nAn error occurred (ConditionalCheckFailedException) when calling the PutItem operation: The conditional request failed\n",
        );
        assert_eq!(err.aws_code(), Some("ConditionalCheckFailedException"));
        assert!(err.to_string().ends_with("The conditional request failed"));
    }

    #[test]
    fn test_parse_error_without_code() {
        let err = parse_error("s3 cp", "Unable to locate credentials");
        assert_eq!(err.aws_code(), None);
        assert!(err.to_string().contains("Unable to locate credentials"));
    }

    #[test]
    fn test_parse_error_s3_fatal_prefix() {
        let err = parse_error(
            "s3 cp",
            "fatal error: An error occurred (404) when calling the HeadObject operation: Key \"c/latest\" does not exist",
        );
        assert!(has_code(&err, &["404", "NoSuchKey"]));
    }

    #[tokio::test]
    async fn test_call_appends_global_options() {
        let executor = Arc::new(MockCommandExecutor::new());
        executor.expect(
            &["aws", "ec2", "describe-instances"],
            CommandOutput::success(r#"{"Reservations": []}"#),
        );
        let cli = AwsCli::new(
            executor.clone(),
            &AwsConfig {
                region: Some("us-west-2".to_string()),
                profile: Some("ops".to_string()),
            },
        );

        let value = cli
            .call("ec2", "describe-instances", &["--instance-ids", "i-1"])
            .await
            .unwrap();
        assert!(value["Reservations"].as_array().unwrap().is_empty());

        let history = executor.history();
        assert_eq!(history[0].arg_after("--region"), Some("us-west-2"));
        assert_eq!(history[0].arg_after("--profile"), Some("ops"));
        assert_eq!(history[0].arg_after("--output"), Some("json"));
    }

    #[tokio::test]
    async fn test_empty_stdout_is_null() {
        let executor = Arc::new(MockCommandExecutor::new());
        executor.expect(&["aws", "ec2", "create-tags"], CommandOutput::success(""));
        let cli = AwsCli::new(executor, &AwsConfig::default());
        assert_eq!(cli.call("ec2", "create-tags", &[]).await.unwrap(), Value::Null);
    }
}
