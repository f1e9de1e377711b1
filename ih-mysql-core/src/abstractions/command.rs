//! Local command execution interface
//!
//! Every external program ih-mysql runs on the current host (the `aws`
//! client, `bash` for the local command channel) goes through
//! [`CommandExecutor`], so the AWS-backed collaborators can be tested
//! against [`MockCommandExecutor`].

use crate::error::{BootstrapError, BootstrapResult};

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Options for command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Environment variables to set
    pub env: Option<HashMap<String, String>>,
    /// Timeout for command execution
    pub timeout: Option<Duration>,
    /// Input to send to stdin
    pub stdin_input: Option<Vec<u8>>,
}

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single environment variable
    pub fn with_env_var<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stdin<I: Into<Vec<u8>>>(mut self, input: I) -> Self {
        self.stdin_input = Some(input.into());
        self
    }
}

/// Output from command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status code, -1 when killed by a signal
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failure(status: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs programs on the current host
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command and wait for completion
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        options: CommandOptions,
    ) -> BootstrapResult<CommandOutput>;

    /// Execute a command with default options
    async fn execute_simple(&self, program: &str, args: &[&str]) -> BootstrapResult<CommandOutput> {
        self.execute(program, args, CommandOptions::new()).await
    }
}

/// Standard implementation of CommandExecutor using tokio::process
#[derive(Debug, Clone)]
pub struct TokioCommandExecutor {
    /// Applied when the caller does not set a timeout
    pub default_timeout: Option<Duration>,
}

impl TokioCommandExecutor {
    pub fn new() -> Self {
        Self {
            default_timeout: Some(Duration::from_secs(300)),
        }
    }

    pub fn without_default_timeout() -> Self {
        Self {
            default_timeout: None,
        }
    }
}

impl Default for TokioCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for TokioCommandExecutor {
    #[instrument(skip(self, args, options), fields(args_count = args.len()))]
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        options: CommandOptions,
    ) -> BootstrapResult<CommandOutput> {
        debug!("Executing command: {} {}", program, args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(env) = &options.env {
            for (key, value) in env {
                cmd.env(key, value);
            }
        }

        if options.stdin_input.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        match options.timeout.or(self.default_timeout) {
            Some(limit) => tokio::time::timeout(limit, run_to_completion(cmd, &options))
                .await
                .map_err(|_| BootstrapError::Timeout {
                    operation: program.to_string(),
                    duration: limit,
                })?,
            None => run_to_completion(cmd, &options).await,
        }
    }
}

async fn run_to_completion(
    mut cmd: Command,
    options: &CommandOptions,
) -> BootstrapResult<CommandOutput> {
    let mut child = cmd.spawn()?;

    if let Some(stdin_data) = &options.stdin_input {
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(stdin_data).await?;
            stdin.shutdown().await?;
        }
    }

    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// A command the mock executor has seen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl ExecutedCommand {
    /// Value following `flag` in the argument list
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

type Responder = dyn Fn(&ExecutedCommand) -> BootstrapResult<CommandOutput> + Send + Sync;

/// Mock implementation for testing
///
/// Responses are looked up by prefix match on `program args...`; the first
/// registered expectation whose prefix matches wins and is consumed unless it
/// was registered with [`MockCommandExecutor::always`].
#[derive(Clone, Default)]
pub struct MockCommandExecutor {
    expectations: Arc<Mutex<Vec<MockExpectation>>>,
    history: Arc<Mutex<Vec<ExecutedCommand>>>,
}

struct MockExpectation {
    prefix: Vec<String>,
    repeat: bool,
    responder: Arc<Responder>,
}

impl MockCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond once to a command starting with `prefix`
    pub fn expect(&self, prefix: &[&str], response: CommandOutput) {
        self.push(prefix, false, Arc::new(move |_| Ok(response.clone())));
    }

    /// Respond to every command starting with `prefix`
    pub fn always<F>(&self, prefix: &[&str], responder: F)
    where
        F: Fn(&ExecutedCommand) -> BootstrapResult<CommandOutput> + Send + Sync + 'static,
    {
        self.push(prefix, true, Arc::new(responder));
    }

    fn push(&self, prefix: &[&str], repeat: bool, responder: Arc<Responder>) {
        let mut expectations = self.expectations.lock().unwrap_or_else(|e| e.into_inner());
        expectations.push(MockExpectation {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            repeat,
            responder,
        });
    }

    /// Commands executed so far
    pub fn history(&self) -> Vec<ExecutedCommand> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Verify all one-shot expectations were met
    pub fn verify(&self) -> BootstrapResult<()> {
        let expectations = self.expectations.lock().unwrap_or_else(|e| e.into_inner());
        let pending = expectations.iter().filter(|e| !e.repeat).count();
        if pending == 0 {
            Ok(())
        } else {
            Err(BootstrapError::internal(format!(
                "{} expected commands were not executed",
                pending
            )))
        }
    }
}

#[async_trait]
impl CommandExecutor for MockCommandExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        options: CommandOptions,
    ) -> BootstrapResult<CommandOutput> {
        let executed = ExecutedCommand {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            stdin: options.stdin_input,
        };
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(executed.clone());

        let line: Vec<&str> = std::iter::once(program).chain(args.iter().copied()).collect();
        let responder = {
            let mut expectations = self.expectations.lock().unwrap_or_else(|e| e.into_inner());
            let position = expectations.iter().position(|exp| {
                exp.prefix.len() <= line.len()
                    && exp.prefix.iter().zip(line.iter()).all(|(a, b)| a == b)
            });
            match position {
                Some(pos) if expectations[pos].repeat => expectations[pos].responder.clone(),
                Some(pos) => expectations.remove(pos).responder,
                None => {
                    return Err(BootstrapError::internal(format!(
                        "Unexpected command: {}",
                        line.join(" ")
                    )))
                }
            }
        };
        responder(&executed)
    }
}
