//! Remote command channel and liveness probe
//!
//! The core never opens sockets for command execution itself; it goes through
//! the [`RemoteChannel`] and [`LivenessProbe`] capabilities. The process-backed
//! implementations here shell out to `ssh` (optionally through `sshpass`) and
//! `ping`, always bounded by an explicit timeout.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to spawn remote command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Runs a command on a fleet unit.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn execute(
        &self,
        address: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ChannelError>;
}

/// Network liveness check. Never fails: anything but a reply within the
/// timeout means unreachable.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_reachable(&self, address: &str, timeout: Duration) -> bool;
}

/// Login used by the SSH channel.
#[derive(Debug, Clone, Default)]
pub struct SshCredentials {
    pub user: String,
    /// Without a password the channel relies on key-based authentication.
    pub password: Option<String>,
}

impl SshCredentials {
    /// Reads `ROS_MASTER_USER` and `ROS_MASTER_PASSWD`.
    pub fn from_env() -> Self {
        let user = std::env::var("ROS_MASTER_USER").unwrap_or_else(|_| "root".to_string());
        let password = std::env::var("ROS_MASTER_PASSWD")
            .ok()
            .filter(|p| !p.is_empty());
        if password.is_none() {
            warn!("ROS_MASTER_PASSWD not set, using key-based ssh authentication");
        }
        Self { user, password }
    }
}

/// `ssh` backed channel with a connection timeout nested inside the total
/// command timeout given to [`RemoteChannel::execute`].
pub struct SshChannel {
    credentials: SshCredentials,
    connect_timeout: Duration,
    options: Vec<String>,
}

pub const DEFAULT_SSH_OPTIONS: &str = "-o StrictHostKeyChecking=no -o ServerAliveInterval=5 \
     -o ServerAliveCountMax=3 -o LogLevel=ERROR";

impl SshChannel {
    pub fn new(credentials: SshCredentials, connect_timeout: Duration) -> Self {
        let options = shell_words::split(DEFAULT_SSH_OPTIONS).unwrap_or_default();
        Self {
            credentials,
            connect_timeout,
            options,
        }
    }

    /// Replaces the extra `ssh` options, given as one shell-quoted string.
    pub fn with_options(mut self, options: &str) -> Result<Self, shell_words::ParseError> {
        self.options = shell_words::split(options)?;
        Ok(self)
    }

    /// Full argument vector, program first.
    fn argv(&self, address: &str, command: &str) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(password) = &self.credentials.password {
            argv.extend(["sshpass".to_string(), "-p".to_string(), password.clone()]);
        }
        argv.push("ssh".to_string());
        argv.push("-o".to_string());
        argv.push(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        argv.extend(self.options.iter().cloned());
        if self.credentials.password.is_some() {
            argv.extend(["-o".to_string(), "BatchMode=no".to_string()]);
        } else {
            argv.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        argv.push(format!("{}@{}", self.credentials.user, address));
        argv.push(command.to_string());
        argv
    }

    /// Printable command line with the password masked.
    pub fn describe(&self, address: &str, command: &str) -> String {
        let argv = self.argv(address, command);
        let masked: Vec<&str> = argv
            .iter()
            .map(|arg| match &self.credentials.password {
                Some(p) if arg == p => "****",
                _ => arg.as_str(),
            })
            .collect();
        shell_words::join(masked)
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn execute(
        &self,
        address: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ChannelError> {
        let argv = self.argv(address, command);
        debug!(address, cmd = %self.describe(address, command), "ssh exec");

        let (program, args) = argv.split_first().ok_or_else(|| {
            ChannelError::Spawn(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command line",
            ))
        })?;

        let child = AsyncCommand::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ChannelError::Timeout(timeout))??;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// ICMP echo through the system `ping` binary.
#[derive(Debug, Clone, Default)]
pub struct PingProbe;

#[async_trait]
impl LivenessProbe for PingProbe {
    async fn is_reachable(&self, address: &str, timeout: Duration) -> bool {
        let wait = timeout.as_secs().max(1).to_string();
        let child = AsyncCommand::new("ping")
            .args(["-c", "1", "-W", &wait, address])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        // ping's own -W is not trusted to bound the whole call
        match tokio::time::timeout(timeout + Duration::from_secs(1), child).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!(address, error = %e, "ping could not be started");
                false
            }
            Err(_) => {
                debug!(address, "ping timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(password: Option<&str>) -> SshChannel {
        SshChannel::new(
            SshCredentials {
                user: "robot".to_string(),
                password: password.map(str::to_string),
            },
            Duration::from_secs(15),
        )
    }

    #[test]
    fn test_argv_with_password_uses_sshpass() {
        let argv = channel(Some("secret")).argv("10.0.0.5", "uptime");
        assert_eq!(&argv[..3], &["sshpass", "-p", "secret"]);
        assert!(argv.contains(&"ConnectTimeout=15".to_string()));
        assert!(argv.contains(&"BatchMode=no".to_string()));
        assert_eq!(argv[argv.len() - 2], "robot@10.0.0.5");
        assert_eq!(argv[argv.len() - 1], "uptime");
    }

    #[test]
    fn test_argv_without_password_is_plain_ssh() {
        let argv = channel(None).argv("10.0.0.5", "uptime");
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn test_describe_masks_password() {
        let line = channel(Some("secret")).describe("10.0.0.5", "echo a && echo b");
        assert!(!line.contains("secret"));
        assert!(line.contains("****"));
        assert!(line.ends_with("'echo a && echo b'"));
    }

    #[test]
    fn test_custom_options_are_split() {
        let ssh = channel(None).with_options("-o Port=2222 -i '/keys/my key'").unwrap();
        let argv = ssh.argv("h", "true");
        assert!(argv.contains(&"/keys/my key".to_string()));
        assert!(argv.contains(&"Port=2222".to_string()));
        assert!(channel(None).with_options("-o 'unterminated").is_err());
    }
}
