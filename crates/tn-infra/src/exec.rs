//! Subprocess execution: local commands, `ssh`, and shell quoting.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::types::ExecOutput;
use crate::{Error, Result};

/// Run a program to completion, capturing output.
///
/// A non-zero exit is not an error here; the caller inspects `exit_code`.
pub async fn run_command(program: &str, args: &[String], timeout: Duration) -> Result<ExecOutput> {
    debug!(program, ?args, "running command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(Error::Timeout {
                op: "command",
                target: program.to_string(),
                secs: timeout.as_secs(),
            });
        }
    };

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Run `command` through `sudo sh -c`.
pub fn with_sudo(command: &str) -> String {
    format!("sudo sh -c {}", shell_quote(command))
}

/// How to reach machines over `ssh`.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub user: String,
    pub key_path: Option<PathBuf>,
    pub sudo: bool,
    pub connect_timeout_secs: u64,
    pub exec_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".into(),
            key_path: None,
            sudo: false,
            connect_timeout_secs: 10,
            exec_timeout: Duration::from_secs(600),
        }
    }
}

impl SshConfig {
    /// Arguments for `ssh` running `command` on `host`.
    pub fn args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        if let Some(key) = &self.key_path {
            args.push("-i".into());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{host}", self.user));
        args.push("--".into());
        if self.sudo {
            args.push(with_sudo(command));
        } else {
            args.push(command.to_string());
        }
        args
    }

    /// Execute `command` on `host` (`machine` names it in errors).
    pub async fn exec(&self, machine: &str, host: &str, command: &str) -> Result<ExecOutput> {
        let output = run_command("ssh", &self.args(host, command), self.exec_timeout)
            .await
            .map_err(|e| match e {
                Error::Timeout { .. } => e,
                other => Error::RemoteExec {
                    machine: machine.to_string(),
                    reason: other.to_string(),
                },
            })?;

        // ssh reserves 255 for its own failures (connection refused, auth).
        if output.exit_code == 255 {
            return Err(Error::RemoteExec {
                machine: machine.to_string(),
                reason: format!("ssh connection failed: {}", output.stderr.trim()),
            });
        }

        Ok(output)
    }

    /// Poll until `check` exits zero on `host`, e.g. until the container
    /// runtime is up after first boot.
    pub async fn wait_until(
        &self,
        machine: &str,
        host: &str,
        check: &str,
        attempts: u32,
        interval: Duration,
    ) -> Result<()> {
        for attempt in 1..=attempts {
            match self.exec(machine, host, check).await {
                Ok(out) if out.success() => return Ok(()),
                Ok(out) => debug!(machine, attempt, stderr = %out.stderr.trim(), "machine not ready yet"),
                Err(e) => debug!(machine, attempt, error = %e, "machine not reachable yet"),
            }
            tokio::time::sleep(interval).await;
        }

        Err(Error::Timeout {
            op: "readiness check",
            target: machine.to_string(),
            secs: interval.as_secs() * u64::from(attempts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn ssh_args_wrap_sudo_and_key() {
        let cfg = SshConfig {
            user: "testnet".into(),
            key_path: Some(PathBuf::from("/keys/id_ed25519")),
            sudo: true,
            ..Default::default()
        };

        let args = cfg.args("35.1.2.3", "docker info");
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/id_ed25519"));
        assert!(args.contains(&"testnet@35.1.2.3".to_string()));
        assert_eq!(args.last().unwrap(), "sudo sh -c 'docker info'");
    }

    #[tokio::test]
    async fn run_command_captures_exit_code_and_output() {
        let out = run_command(
            "sh",
            &["-c".into(), "echo hello; echo oops >&2; exit 3".into()],
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn run_command_times_out() {
        let err = run_command(
            "sh",
            &["-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout { op: "command", .. }));
    }

    #[tokio::test]
    async fn missing_program_is_io_not_found() {
        let err = run_command("definitely-not-a-real-binary-xyz", &[], Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
        assert!(!err.is_retryable());
    }
}
