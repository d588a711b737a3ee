//! Host command helpers used by the container backends

use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

use crate::common::{Error, Result};
use crate::session::{ExecuteResult, InteractiveSession};

/// Run a host program to completion
///
/// The program gets an empty input and is killed with its process group when
/// `timeout` elapses (exit code 137).
pub async fn run(program: &str, args: &[String], timeout: Duration) -> Result<ExecuteResult> {
    let mut command = Command::new(program);
    command.args(args);
    tracing::debug!(command = %command_line(program, args), "Running");

    let mut session = InteractiveSession::spawn(program, command)?;
    session.close_input();
    session.wait(timeout).await
}

/// Run a host program and fail unless it exits with 0
pub async fn run_checked(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<ExecuteResult> {
    let result = run(program, args, timeout).await?;
    if !result.success() {
        return Err(Error::CommandFailed {
            command: command_line(program, args),
            code: result.exit_code,
            stderr: last_lines(&result.stderr, 20),
        });
    }
    Ok(result)
}

/// Locate a required host tool
pub fn require(tool: &str) -> Result<PathBuf> {
    which::which(tool).map_err(|_| {
        Error::provisioning(tool, format!("'{}' not found on PATH, is it installed?", tool))
    })
}

/// Quote a string for a POSIX shell
pub fn quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Build an owned argument list from string slices
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items.into_iter().map(|s| s.as_ref().to_string()).collect()
}

fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| quote(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("simple"), "simple");
        assert_eq!(quote("/home/ubuntu/launcher.checkbox"), "/home/ubuntu/launcher.checkbox");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_command_line() {
        assert_eq!(
            command_line("lxc", &args(["exec", "box", "--", "bash", "-c", "echo hi"])),
            "lxc exec box -- bash -c 'echo hi'"
        );
    }

    #[test]
    fn test_last_lines() {
        assert_eq!(last_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(last_lines("a", 5), "a");
    }

    #[tokio::test]
    async fn test_run_checked_reports_failure() {
        let err = run_checked("sh", &args(["-c", "echo broken >&2; exit 4"]), Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, 4);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_collects_output() {
        let result = run("sh", &args(["-c", "printf 'hi'"]), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hi");
    }
}
