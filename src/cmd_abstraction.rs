//! Firewall tool invocation behind a mockable trait.
//!
//! Both enforcement backends drive the kernel through userspace tools (`nft`,
//! `iptables`, `ip6tables`). Routing every invocation through
//! [`CommandExecutor`] lets the backends be exercised in unit tests with a
//! scripted mock instead of a privileged kernel.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

#[cfg(test)]
use mockall::automock;

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status was zero
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Stdout on success, an error carrying stderr otherwise.
    pub fn into_stdout(self, program: &str) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            anyhow::bail!("{} failed: {}", program, self.stderr.trim())
        }
    }
}

/// Runs external programs.
///
/// Arguments are `&[String]` rather than `&[&str]` so that mockall can
/// generate expectations without lifetime trouble.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Run with `stdin` piped into the child (used for `nft -f -` batches).
    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;
}

/// Executor that spawns real processes.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

fn capture(output: std::process::Output) -> CommandOutput {
    CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
        code: output.status.code(),
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute {}", cmd))?;
        Ok(capture(output))
    }

    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd))?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin.as_bytes())
                .with_context(|| format!("Failed to write to {} stdin", cmd))?;
        }

        Ok(capture(child.wait_with_output()?))
    }
}

pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// First existing path among `candidates`, else the bare program name
/// (resolved through `PATH` at spawn time).
pub fn resolve_program(name: &'static str, candidates: &[&'static str]) -> &'static str {
    candidates
        .iter()
        .copied()
        .find(|p| Path::new(p).exists())
        .unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_to_strings() {
        assert_eq!(
            args_to_strings(&["-j", "list", "tables"]),
            vec!["-j", "list", "tables"]
        );
        assert!(args_to_strings(&[]).is_empty());
    }

    #[test]
    fn test_into_stdout() {
        let ok = CommandOutput {
            stdout: "listing".into(),
            success: true,
            code: Some(0),
            ..Default::default()
        };
        assert_eq!(ok.into_stdout("nft").unwrap(), "listing");

        let failed = CommandOutput {
            stderr: "Error: No such file or directory\n".into(),
            code: Some(1),
            ..Default::default()
        };
        let err = failed.into_stdout("nft").unwrap_err();
        assert_eq!(err.to_string(), "nft failed: Error: No such file or directory");
    }

    #[test]
    fn test_resolve_program_falls_back_to_name() {
        assert_eq!(
            resolve_program("nft", &["/nonexistent/sbin/nft", "/also/missing/nft"]),
            "nft"
        );
    }

    #[test]
    fn test_real_executor_echo() {
        let output = RealCommandExecutor::new()
            .execute("echo", &args_to_strings(&["-n", "hello"]))
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "hello");
    }

    #[test]
    fn test_real_executor_with_stdin() {
        let output = RealCommandExecutor::new()
            .execute_with_stdin("cat", &[], "add table inet autoban\n")
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "add table inet autoban\n");
    }

    #[test]
    fn test_mock_executor() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute_with_stdin()
            .withf(|cmd, args, stdin| cmd == "nft" && args == ["-f", "-"] && stdin.contains("add"))
            .times(1)
            .returning(|_, _, _| {
                Ok(CommandOutput {
                    success: true,
                    code: Some(0),
                    ..Default::default()
                })
            });

        let result = mock.execute_with_stdin("nft", &args_to_strings(&["-f", "-"]), "add table");
        assert!(result.unwrap().success);
    }
}
