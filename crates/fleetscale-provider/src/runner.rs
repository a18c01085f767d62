//! Remote exec and file-copy primitives used by the node updater.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use fleet_core::AuthConfig;
use fleet_core::bootstrap::shell_quote;

use crate::error::RunnerError;

/// Outcome of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` in the node's shell. A non-zero exit is reported
    /// in the output, not as an error.
    async fn run(&self, command: &str) -> Result<CommandOutput, RunnerError>;

    /// Copy a local file or directory to `target` on the node.
    async fn sync_files(&self, source: &Path, target: &str) -> Result<(), RunnerError>;
}

/// Runs commands over `ssh` and copies files with `rsync`.
#[derive(Debug, Clone)]
pub struct SshCommandRunner {
    address: String,
    auth: AuthConfig,
    connect_timeout_s: u64,
}

impl SshCommandRunner {
    pub fn new(address: impl Into<String>, auth: AuthConfig) -> Self {
        Self {
            address: address.into(),
            auth,
            connect_timeout_s: 10,
        }
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_s = secs;
        self
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_s),
            "-p".to_string(),
            self.auth.ssh_port.to_string(),
        ];
        if let Some(key) = &self.auth.ssh_private_key {
            opts.push("-i".to_string());
            opts.push(key.display().to_string());
        }
        opts
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.auth.ssh_user, self.address)
    }
}

#[async_trait]
impl CommandRunner for SshCommandRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput, RunnerError> {
        debug!(address = %self.address, %command, "running remote command");
        let output = remote_command("ssh")
            .args(self.ssh_options())
            .arg(self.destination())
            .arg(command)
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                program: "ssh".to_string(),
                source,
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn sync_files(&self, source: &Path, target: &str) -> Result<(), RunnerError> {
        let parent = Path::new(target)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        let mkdir = self.run(&format!("mkdir -p {}", shell_quote(&parent))).await?;
        if !mkdir.success() {
            return Err(RunnerError::Exit {
                program: "mkdir".to_string(),
                code: mkdir.exit_code,
                stderr: mkdir.stderr,
            });
        }

        // A trailing slash copies a directory's contents into `target`.
        let mut src = source.display().to_string();
        if source.is_dir() && !src.ends_with('/') {
            src.push('/');
        }
        let ssh = format!("ssh {}", self.ssh_options().join(" "));
        let dest = format!("{}:{}", self.destination(), target);

        debug!(address = %self.address, source = %src, %target, "syncing files");
        let output = remote_command("rsync")
            .args(["-az", "--delete", "-e"])
            .arg(ssh)
            .arg(&src)
            .arg(&dest)
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                program: "rsync".to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(RunnerError::Exit {
                program: "rsync".to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// The child is killed when its handle is dropped, so a timed-out or
/// aborted update does not leave ssh or rsync running against the node.
fn remote_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    cmd
}
