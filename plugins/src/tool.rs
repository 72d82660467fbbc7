//! Boundary to the external attack tools.
//!
//! Capture, cracking and AP emulation are delegated to black-box programs.
//! A [`ToolJob`] runs one of them to completion and reports either the
//! artifact it produced or why it did not.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobParams {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub timeout: Duration,
    /// File that must exist after a successful exit.
    pub expected_artifact: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success {
        artifact: Option<PathBuf>,
        stdout: String,
    },
    Failure {
        error: String,
    },
}

impl JobOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        JobOutcome::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success { .. })
    }
}

#[async_trait]
pub trait ToolJob: Send + Sync {
    /// Runs the job until it exits, times out or `cancel` flips to true.
    async fn submit(&self, params: JobParams, cancel: watch::Receiver<bool>) -> JobOutcome;
}

/// Runs jobs as child processes. Children are killed when the job is
/// abandoned.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandJob;

const STDERR_TAIL: usize = 400;

#[async_trait]
impl ToolJob for CommandJob {
    async fn submit(&self, params: JobParams, mut cancel: watch::Receiver<bool>) -> JobOutcome {
        if let Err(e) = tokio::fs::create_dir_all(&params.work_dir).await {
            return JobOutcome::failure(format!(
                "cannot prepare {}: {e}",
                params.work_dir.display()
            ));
        }
        let work_dir = match std::path::absolute(&params.work_dir) {
            Ok(dir) => dir,
            Err(e) => {
                return JobOutcome::failure(format!(
                    "cannot resolve {}: {e}",
                    params.work_dir.display()
                ));
            }
        };
        // Relative artifact paths are relative to the tool's directory.
        let expected_artifact = params.expected_artifact.as_ref().map(|a| work_dir.join(a));

        let child = Command::new(&params.program)
            .args(&params.args)
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => return JobOutcome::failure(format!("failed to start {}: {e}", params.program)),
        };
        debug!(program = %params.program, pid = ?child.id(), "tool started");

        let output = tokio::select! {
            res = tokio::time::timeout(params.timeout, child.wait_with_output()) => res,
            _ = wait_for_cancel(&mut cancel) => {
                warn!(program = %params.program, "tool cancelled");
                return JobOutcome::failure("cancelled");
            }
        };

        let output = match output {
            Err(_) => {
                return JobOutcome::failure(format!(
                    "{} timed out after {:?}",
                    params.program, params.timeout
                ));
            }
            Ok(Err(e)) => return JobOutcome::failure(format!("{} failed: {e}", params.program)),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .trim()
                .chars()
                .rev()
                .take(STDERR_TAIL)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            return JobOutcome::failure(format!("{} exited with {}: {tail}", params.program, output.status));
        }

        if let Some(expected) = &expected_artifact {
            if !expected.exists() {
                return JobOutcome::failure(format!(
                    "{} produced no artifact at {}",
                    params.program,
                    expected.display()
                ));
            }
        }

        JobOutcome::Success {
            artifact: expected_artifact,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        }
    }
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
