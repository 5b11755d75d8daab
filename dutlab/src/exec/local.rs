//! Local command execution

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::LabError;
use crate::exec::LocalExec;

/// Execute `command` and return its combined output.
///
/// The child is killed when the timeout expires or the future is dropped.
pub async fn execute(
    command: &[&str],
    timeout: Duration,
    ignore_codes: &[i32],
) -> Result<String, LabError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| LabError::Internal("Empty command".to_string()))?;
    let printable = command.join(" ");
    debug!("Executing: {}", printable);

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| LabError::CommandFailed {
            command: printable.clone(),
            code: None,
            output: e.to_string(),
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(LabError::CommandTimeout {
                command: printable,
                timeout,
            })
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    let code = output.status.code();
    let ignored = code.map(|c| ignore_codes.contains(&c)).unwrap_or(false);
    if output.status.success() || ignored {
        Ok(combined)
    } else {
        Err(LabError::CommandFailed {
            command: printable,
            code,
            output: combined,
        })
    }
}

/// [`LocalExec`] backed by real processes
#[derive(Debug, Clone, Default)]
pub struct SystemExec;

#[async_trait]
impl LocalExec for SystemExec {
    async fn run(&self, command: &[&str], timeout: Duration) -> Result<String, LabError> {
        execute(command, timeout, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_collects_output() {
        let output = execute(&["sh", "-c", "echo out; echo err >&2"], Duration::from_secs(5), &[])
            .await
            .unwrap();
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[tokio::test]
    async fn test_execute_failure_and_ignored_codes() {
        let result = execute(&["sh", "-c", "exit 32"], Duration::from_secs(5), &[]).await;
        match result {
            Err(LabError::CommandFailed { code, .. }) => assert_eq!(code, Some(32)),
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(execute(&["sh", "-c", "exit 32"], Duration::from_secs(5), &[32])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let result = execute(&["sleep", "5"], Duration::from_millis(100), &[]).await;
        assert!(matches!(result, Err(LabError::CommandTimeout { .. })));
    }
}
