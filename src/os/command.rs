//! External Command Execution
//!
//! Every subprocess the runtime spawns (mount helpers, mkfs, vendor CLIs)
//! goes through [`CommandExecutor`], so drivers can be exercised against a
//! recording fake instead of the host.
//!
//! Secrets are only ever delivered on the child's standard input. When a
//! command is marked as a new session the child is moved into its own
//! session before exec, leaving it without a controlling terminal to
//! prompt on.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::{self, ErrorKind};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

// =============================================================================
// Command Description
// =============================================================================

/// Bytes written to a child's standard input; never logged
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// A passphrase terminated by a single newline
    pub fn line(passphrase: &str) -> Self {
        let mut bytes = passphrase.as_bytes().to_vec();
        bytes.push(b'\n');
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(******)")
    }
}

/// A command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Name reported in errors (e.g. `mkfs`, `objectivefsMount`)
    pub action: String,
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment for the child
    pub envs: Vec<(String, String)>,
    /// Start from an empty environment (keeping only `PATH`) instead of
    /// inheriting the parent's
    pub env_clear: bool,
    pub stdin: Option<Secret>,
    /// Start the child in a new session with no controlling terminal
    pub new_session: bool,
}

impl CommandSpec {
    pub fn new(action: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            env_clear: false,
            stdin: None,
            new_session: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    pub fn stdin(mut self, secret: Secret) -> Self {
        self.stdin = Some(secret);
        self
    }

    pub fn new_session(mut self) -> Self {
        self.new_session = true;
        self
    }

    /// Program followed by its arguments
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Convert a non-zero exit into [`Error::CommandFailed`]
    pub fn check(self, spec: &CommandSpec) -> Result<CommandOutput> {
        if self.success() {
            return Ok(self);
        }
        Err(Error::CommandFailed {
            action: spec.action.clone(),
            args: spec.argv(),
            stdout: self.stdout,
            stderr: self.stderr,
            status: self.status,
        })
    }
}

// =============================================================================
// Executor Port
// =============================================================================

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run to completion, returning output regardless of exit status
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run to completion, failing on a non-zero exit status
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.run(spec).await?.check(spec)
    }
}

pub type CommandExecutorRef = Arc<dyn CommandExecutor>;

// =============================================================================
// Host Executor
// =============================================================================

/// Spawns real processes on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCommands;

impl HostCommands {
    pub fn shared() -> CommandExecutorRef {
        Arc::new(HostCommands)
    }
}

#[async_trait]
impl CommandExecutor for HostCommands {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(
            action = %spec.action,
            program = %spec.program,
            args = ?spec.args,
            stdin = spec.stdin.is_some(),
            new_session = spec.new_session,
            "Running command"
        );

        let mut command = tokio::process::Command::new(&spec.program);
        if spec.env_clear {
            command.env_clear();
            if let Some(path) = std::env::var_os("PATH") {
                command.env("PATH", path);
            }
        }
        command
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        #[cfg(unix)]
        if spec.new_session {
            // SAFETY: setsid is async-signal-safe and touches no parent state.
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid().map_err(std::io::Error::from)?;
                    Ok(())
                });
            }
        }

        let mut child = command.spawn().map_err(|e| Error::CommandFailed {
            action: spec.action.clone(),
            args: spec.argv(),
            stdout: String::new(),
            stderr: e.to_string(),
            status: -1,
        })?;

        if let Some(secret) = &spec.stdin {
            if let Some(stdin) = child.stdin.take() {
                match write_secret(stdin, secret).await {
                    Ok(()) => {}
                    // The child exited without reading; its status tells why
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                        debug!(action = %spec.action, "Child closed stdin before reading it");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let output = child.wait_with_output().await?;
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        };
        debug!(action = %spec.action, status = result.status, "Command finished");
        Ok(result)
    }
}

/// Write the secret and close the pipe so the child sees EOF
async fn write_secret(mut stdin: tokio::process::ChildStdin, secret: &Secret) -> io::Result<()> {
    stdin.write_all(secret.expose()).await?;
    stdin.flush().await
}

/// Whether an executable resolves on the search path
pub fn executable_exists(name: &str) -> bool {
    which::which(name).is_ok()
}

// =============================================================================
// Recording Fake
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_secret_is_not_debug_printed() {
        let spec = CommandSpec::new("objectivefsMount", "mount")
            .args(["-t", "objectivefs", "s3://bucket", "/mnt"])
            .stdin(Secret::line("hunter2"))
            .new_session();
        let printed = format!("{:?}", spec);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("******"));
        assert_eq!(spec.stdin.as_ref().unwrap().expose(), b"hunter2\n");
        assert!(!spec.args.iter().any(|a| a.contains("hunter2")));
    }

    #[test]
    fn test_check_maps_failure() {
        let spec = CommandSpec::new("mkfs", "mkfs.ext4").args(["-F", "/dev/xvdf"]);
        let out = CommandOutput {
            stdout: String::new(),
            stderr: "device busy".into(),
            status: 1,
        };
        assert_matches!(
            out.check(&spec),
            Err(Error::CommandFailed { ref action, ref args, status: 1, .. })
                if action == "mkfs" && args[0] == "mkfs.ext4"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_command_reads_stdin() {
        if !executable_exists("cat") {
            return;
        }
        let spec = CommandSpec::new("echo", "cat")
            .stdin(Secret::line("passphrase"))
            .new_session();
        let out = HostCommands.run_checked(&spec).await.unwrap();
        assert_eq!(out.stdout, "passphrase\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unread_stdin_still_reports_exit_status() {
        if !executable_exists("sh") {
            return;
        }
        // Larger than a pipe buffer, so the write outlives the child
        let secret = Secret::new(vec![b'x'; 1 << 20]);
        let spec = CommandSpec::new("objectivefsCreate", "sh")
            .args(["-c", "echo refused >&2; exit 4"])
            .stdin(secret);
        let err = HostCommands.run_checked(&spec).await.unwrap_err();
        assert_matches!(
            err,
            Error::CommandFailed { ref action, ref stderr, status: 4, .. }
                if action == "objectivefsCreate" && stderr.trim() == "refused"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_clear_drops_parent_environment() {
        if !executable_exists("sh") {
            return;
        }
        let spec = CommandSpec::new("env", "sh")
            .args(["-c", "echo ${HOME:-none} ${CARGO_PKG_NAME:-none} $ONLY"])
            .env("ONLY", "kept")
            .env_clear();
        let out = HostCommands.run_checked(&spec).await.unwrap();
        assert_eq!(out.stdout.trim(), "none none kept");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_command_failure_captures_output() {
        if !executable_exists("sh") {
            return;
        }
        let spec = CommandSpec::new("fail", "sh").args(["-c", "echo oops >&2; exit 3"]);
        let err = HostCommands.run_checked(&spec).await.unwrap_err();
        assert_matches!(
            err,
            Error::CommandFailed { ref stderr, status: 3, .. } if stderr.trim() == "oops"
        );
    }
}
