//! Per-cycle workspace lifecycle.
//!
//! Every fuzzing cycle runs inside a unique temporary directory holding the
//! cloned project and the hydrated corpus. The workspace is created at cycle
//! start and removed on every exit path, so no state leaks between cycles.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::error;

use crate::config::{CORPUS_SUBDIR, PROJECT_SUBDIR};

/// A unique temporary directory scoped to one fuzzing cycle.
///
/// Layout:
///
/// ```text
/// <root>/
///   project/      cloned repository
///   corpus/       extracted corpus
///   corpus.zip    downloaded corpus archive
/// ```
#[derive(Debug)]
pub struct Workspace {
    root: TempDir,
}

impl Workspace {
    /// Creates a fresh workspace root.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary directory cannot be created.
    pub fn create() -> std::io::Result<Self> {
        let root = tempfile::Builder::new().prefix("fuzzmill-").tempdir()?;
        Ok(Self { root })
    }

    /// Absolute path of the workspace root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Directory the project repository is cloned into.
    #[must_use]
    pub fn project_dir(&self) -> PathBuf {
        self.root.path().join(PROJECT_SUBDIR)
    }

    /// Directory the corpus archive is extracted into.
    #[must_use]
    pub fn corpus_dir(&self) -> PathBuf {
        self.root.path().join(CORPUS_SUBDIR)
    }

    /// Local path of the downloaded corpus archive.
    #[must_use]
    pub fn corpus_zip_path(&self) -> PathBuf {
        self.root.path().join("corpus.zip")
    }

    /// Removes the workspace recursively. Removal failures are logged but do
    /// not stop execution.
    pub fn cleanup(self) {
        let path = self.root.path().to_path_buf();
        if let Err(err) = self.root.close() {
            error!(path = %path.display(), error = %err, "workspace cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_layout() {
        let workspace = Workspace::create().unwrap();
        assert!(workspace.root().exists());
        assert_eq!(workspace.project_dir(), workspace.root().join("project"));
        assert_eq!(workspace.corpus_dir(), workspace.root().join("corpus"));
        assert_eq!(
            workspace.corpus_zip_path(),
            workspace.root().join("corpus.zip")
        );
    }

    #[test]
    fn test_cleanup_removes_root() {
        let workspace = Workspace::create().unwrap();
        let root = workspace.root().to_path_buf();
        std::fs::create_dir_all(workspace.project_dir().join("pkg")).unwrap();
        std::fs::write(workspace.corpus_zip_path(), b"zip").unwrap();

        workspace.cleanup();
        assert!(!root.exists());
    }
}
