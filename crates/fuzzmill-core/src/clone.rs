//! Repository materialization.
//!
//! The project under fuzz is obtained with a shallow single-branch
//! `git clone` subprocess. All git interaction is non-interactive: prompts
//! are disabled and system git configuration is not read.

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::util::sanitize_url;

/// Errors from repository materialization.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CloneError {
    /// The git subprocess could not be spawned or awaited.
    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),

    /// git exited unsuccessfully.
    #[error("git clone failed ({status}): {stderr}")]
    Failed {
        /// Exit status of the git subprocess.
        status: std::process::ExitStatus,
        /// Captured stderr, with the repository URL masked.
        stderr: String,
    },

    /// The clone was interrupted by cancellation. Not a failure.
    #[error("clone cancelled")]
    Cancelled,
}

/// Clones `url` into `dest` with `--depth 1 --single-branch`.
///
/// The subprocess is killed if `cancel` fires, in which case
/// [`CloneError::Cancelled`] is returned so callers can distinguish shutdown
/// from a real clone failure.
///
/// # Errors
///
/// Returns [`CloneError::Failed`] when git exits non-zero and
/// [`CloneError::Io`] when the subprocess cannot be driven at all.
pub async fn clone_repo(
    url: &str,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<(), CloneError> {
    let mut cmd = Command::new("git");
    cmd.arg("clone")
        .arg("--depth")
        .arg("1")
        .arg("--single-branch")
        .arg(url)
        .arg(dest)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let mut stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        () = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(CloneError::Cancelled);
        }
    };

    let stderr = stderr_task.await.unwrap_or_default();
    if !status.success() {
        // git echoes the remote URL (credentials included) in its errors.
        let stderr = stderr.replace(url, &sanitize_url(url)).trim().to_string();
        return Err(CloneError::Failed { status, stderr });
    }

    info!(
        repo_url = %sanitize_url(url),
        local_path = %dest.display(),
        "repository cloned"
    );
    Ok(())
}
