//! Engine process execution with a hard deadline.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use mathsheet_core::CompileError;

use crate::engine::EnginePass;

/// Diagnostics kept per stream. TeX reports errors near the end of its log.
const DIAGNOSTIC_TAIL_BYTES: usize = 8 * 1024;

/// Result of one finished pass.
#[derive(Debug, Clone)]
pub struct PassOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl PassOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `pass` inside `workdir`, killing its whole process group if it is
/// still running at `deadline`.
pub async fn run_pass(
    pass: &EnginePass,
    workdir: &Path,
    search_path: Option<&OsStr>,
    deadline: Instant,
    timeout_secs: u64,
) -> Result<PassOutput, CompileError> {
    let start = Instant::now();

    let mut command = Command::new(&pass.program);
    command
        .args(&pass.args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(path) = search_path {
        command.env("PATH", path);
    }
    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(|source| CompileError::Spawn {
        program: pass.program.clone(),
        source,
    })?;
    let pid = child.id();

    let output = match tokio::time::timeout_at(deadline, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid).await;
            }
            warn!(pass = %pass.name, timeout_secs, "engine pass timed out");
            return Err(CompileError::Timeout { timeout_secs });
        }
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    let exit_code = output.status.code().unwrap_or(-1);
    debug!(pass = %pass.name, exit_code, duration_ms, "engine pass finished");

    Ok(PassOutput {
        exit_code,
        stdout: tail(&String::from_utf8_lossy(&output.stdout), DIAGNOSTIC_TAIL_BYTES),
        stderr: tail(&String::from_utf8_lossy(&output.stderr), DIAGNOSTIC_TAIL_BYTES),
        duration_ms,
    })
}

/// Best effort: the group leader was already killed on drop, this reaches
/// helpers it spawned.
#[cfg(unix)]
async fn kill_process_group(pid: u32) {
    let result = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{}", pid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        debug!(pid, error = %e, "process group kill failed");
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: u32) {}

/// Last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_short_text() {
        assert_eq!(tail("abc", 10), "abc");
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let text = "ああああ";
        let cut = tail(text, 4);
        assert_eq!(cut, "...あ");
    }

    #[test]
    fn test_pass_output_success() {
        let ok = PassOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
        };
        assert!(ok.success());
        assert!(!PassOutput { exit_code: 1, ..ok }.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_pass_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let pass = EnginePass::new("echo", "sh", &["-c", "echo out; echo err >&2; exit 3"], "none");
        let deadline = Instant::now() + std::time::Duration::from_secs(10);
        let output = run_pass(&pass, dir.path(), None, deadline, 10).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }
}
