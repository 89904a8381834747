//! Shell-out adapter.
//!
//! Every call to LVM, DRBD, `dd`, `virsh`, `openssl` and friends goes
//! through a [`CommandRunner`], so that the daemon's engines can be
//! exercised against a scripted fake.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use mcvirt_proto::{McvError, McvResult};

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status; -1 when the process was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            status: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: &str) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Render a command line for logs and error messages.
pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Run `program` with `args` and capture its output. Only fails if the
    /// process could not be spawned; a non-zero exit is reported in the
    /// output.
    async fn run(&self, program: &str, args: &[&str]) -> McvResult<CommandOutput>;

    /// Run a command that must succeed, returning its stdout.
    async fn run_ok(&self, program: &str, args: &[&str]) -> McvResult<String> {
        let output = self.run(program, args).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(McvError::ExternalStorageCommandError(format!(
                "{} exited with {}: {}",
                command_line(program, args),
                output.status,
                output.stderr.trim()
            )))
        }
    }
}

/// Runs commands on the host.
#[derive(Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> McvResult<CommandOutput> {
        debug!("exec: {}", command_line(program, args));
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                warn!("failed to spawn {}: {}", program, e);
                McvError::Io(format!("spawn {}: {}", program, e))
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner;
        let out = runner.run("sh", &["-c", "echo hello; echo oops >&2; exit 3"]).await.unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_run_ok_maps_failure() {
        let runner = SystemRunner;
        assert_eq!(runner.run_ok("sh", &["-c", "printf 12"]).await.unwrap(), "12");
        let err = runner.run_ok("sh", &["-c", "echo nope >&2; exit 5"]).await.unwrap_err();
        match err {
            McvError::ExternalStorageCommandError(msg) => {
                assert!(msg.contains("exited with 5"));
                assert!(msg.contains("nope"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = SystemRunner;
        let err = runner.run("/nonexistent/mcvirt-test-binary", &[]).await.unwrap_err();
        assert!(matches!(err, McvError::Io(_)));
    }

    #[test]
    fn test_command_line() {
        assert_eq!(command_line("lvs", &["--noheadings", "vg"]), "lvs --noheadings vg");
    }
}
