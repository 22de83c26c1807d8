//! Child process helpers for external tools and command stages.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use seqflow_core::tools::ToolError;

/// Captured output of a successful tool run.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Run `tool` with `args` to completion.
///
/// A non-zero exit becomes `ToolError::Failed` carrying trimmed stderr.
/// The child is killed if the returned future is dropped.
pub async fn run_tool<I, S>(tool: &str, args: I) -> Result<ToolOutput, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = tokio::process::Command::new(tool);
    command.args(args);
    run_command(tool, command).await
}

/// Run a shell command line through `sh -c`, optionally in `cwd`.
pub async fn run_shell(command_line: &str, cwd: Option<&Path>) -> Result<ToolOutput, ToolError> {
    let mut command = tokio::process::Command::new("sh");
    command.arg("-c").arg(command_line);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    run_command("sh", command).await
}

/// Run a prepared command to completion, reporting failures as `tool`.
pub async fn run_command(
    tool: &str,
    mut command: tokio::process::Command,
) -> Result<ToolOutput, ToolError> {
    tracing::debug!(tool, command = ?command.as_std(), "running external tool");
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ToolError::Spawn {
            tool: tool.to_string(),
            source,
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !output.status.success() {
        return Err(ToolError::Failed {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr,
        });
    }
    Ok(ToolOutput {
        stdout: output.stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_captures_stdout() {
        let out = run_shell("printf 'a\\nb'", None).await.unwrap();
        assert_eq!(out.stdout_lossy(), "a\nb");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let err = run_shell("echo broken >&2; exit 3", None).await.unwrap_err();
        match err {
            ToolError::Failed { tool, stderr, .. } => {
                assert_eq!(tool, "sh");
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let err = run_tool("seqflow-no-such-tool", ["--version"]).await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_shell_respects_cwd() {
        let tmp = tempfile::TempDir::new().unwrap();
        run_shell("echo hi > marker.txt", Some(tmp.path())).await.unwrap();
        assert!(tmp.path().join("marker.txt").exists());
    }
}
