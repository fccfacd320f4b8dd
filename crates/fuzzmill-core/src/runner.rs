//! Fuzz toolchain invocation: target discovery and the per-task process
//! driver.
//!
//! The concrete command lines come from the [`FuzzToolchain`] capability so
//! tests can substitute a fake that replays canned output through a shell.
//! The production implementation is [`GoToolchain`], which drives `go test`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::parser::FuzzOutputParser;
use crate::queue::Task;
use crate::report::CrashReporter;

/// Everything needed to build one fuzz-run command.
#[derive(Debug)]
pub struct FuzzSpec<'a> {
    /// Absolute path of the package directory inside the cloned project.
    pub package_dir: &'a Path,
    /// Fuzz target to run, matched exactly.
    pub target: &'a str,
    /// Directory the fuzzer caches generated inputs into.
    pub cache_dir: &'a Path,
    /// Wall-clock budget for this run.
    pub fuzz_time: Duration,
}

/// Capability for building fuzz toolchain command lines.
///
/// Implementations only construct the [`Command`]; the driver owns stdio
/// wiring, spawning, cancellation, and teardown.
pub trait FuzzToolchain: Send + Sync {
    /// Command listing the fuzz targets available in `package_dir`.
    fn list_command(&self, package_dir: &Path) -> Command;

    /// Command running one fuzz target according to `spec`.
    fn fuzz_command(&self, spec: &FuzzSpec<'_>) -> Command;
}

/// The Go toolchain.
#[derive(Debug, Default, Clone, Copy)]
pub struct GoToolchain;

impl FuzzToolchain for GoToolchain {
    fn list_command(&self, package_dir: &Path) -> Command {
        let mut cmd = Command::new("go");
        cmd.args(["test", "-list=^Fuzz", "."])
            .current_dir(package_dir);
        cmd
    }

    fn fuzz_command(&self, spec: &FuzzSpec<'_>) -> Command {
        let mut cmd = Command::new("go");
        cmd.arg("test")
            .arg(format!("-fuzz=^{}$", spec.target))
            .arg(format!(
                "-test.fuzzcachedir={}",
                spec.cache_dir.display()
            ))
            .arg(format!("-fuzztime={}s", spec.fuzz_time.as_secs()))
            .arg("-parallel=1")
            .current_dir(spec.package_dir);
        cmd
    }
}

/// Errors from toolchain invocation. Target crashes are *not* errors; they
/// are routed to the reporter.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DriverError {
    /// Target discovery could not be spawned or awaited.
    #[error("failed to run target discovery for {package}: {source}")]
    DiscoveryIo {
        /// Package being listed.
        package: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Target discovery exited unsuccessfully.
    #[error("fuzz target listing failed for {package}: {stderr}")]
    Discovery {
        /// Package being listed.
        package: String,
        /// Captured stderr of the listing command.
        stderr: String,
    },

    /// The fuzz subprocess could not be spawned.
    #[error("failed to spawn fuzz process for {package}/{target}: {source}")]
    Spawn {
        /// Package under fuzz.
        package: String,
        /// Fuzz target.
        target: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The fuzz subprocess stdout pipe was unavailable.
    #[error("fuzz process stdout unavailable for {package}/{target}")]
    OutputCapture {
        /// Package under fuzz.
        package: String,
        /// Fuzz target.
        target: String,
    },

    /// Waiting on the fuzz subprocess failed.
    #[error("fuzz process wait failed for {package}/{target}: {source}")]
    Wait {
        /// Package under fuzz.
        package: String,
        /// Fuzz target.
        target: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The fuzz subprocess failed without a target crash and without being
    /// cancelled: an infrastructure fault.
    #[error("fuzz execution failed for {package}/{target} ({status})")]
    Execution {
        /// Package under fuzz.
        package: String,
        /// Fuzz target.
        target: String,
        /// Subprocess exit status.
        status: std::process::ExitStatus,
    },

    /// Removing the persisted failing input after a crash failed.
    #[error("failing input cleanup failed for {package}/{target}: {source}")]
    Cleanup {
        /// Package under fuzz.
        package: String,
        /// Fuzz target.
        target: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The parser task panicked or was aborted.
    #[error("fuzz output parser task failed: {0}")]
    ParserJoin(#[from] tokio::task::JoinError),
}

/// Drives one fuzz subprocess per [`Task`]: spawn, stream-parse, enforce the
/// per-target cutoff, report crashes, and clean persisted failing inputs out
/// of the working tree.
pub struct FuzzDriver {
    toolchain: Arc<dyn FuzzToolchain>,
    reporter: Arc<CrashReporter>,
    project_dir: PathBuf,
    corpus_dir: PathBuf,
}

impl FuzzDriver {
    /// Creates a driver rooted at this cycle's project and corpus
    /// directories.
    #[must_use]
    pub fn new(
        toolchain: Arc<dyn FuzzToolchain>,
        reporter: Arc<CrashReporter>,
        project_dir: PathBuf,
        corpus_dir: PathBuf,
    ) -> Self {
        Self {
            toolchain,
            reporter,
            project_dir,
            corpus_dir,
        }
    }

    /// Lists the fuzz targets of one package: runs the toolchain's list
    /// command and keeps stdout tokens beginning with `Fuzz`.
    ///
    /// Cancellation kills the listing command and returns an empty list; the
    /// caller decides what cancellation means for the cycle.
    ///
    /// # Errors
    ///
    /// Returns an error when the listing command cannot be run or exits
    /// unsuccessfully.
    pub async fn list_targets(
        &self,
        package: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, DriverError> {
        info!(package, "discovering fuzz targets");

        let mut cmd = self.toolchain.list_command(&self.project_dir.join(package));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let io_err = |source| DriverError::DiscoveryIo {
            package: package.to_string(),
            source,
        };

        let mut child = cmd.spawn().map_err(io_err)?;
        let stdout_task = drain_pipe(child.stdout.take());
        let stderr_task = drain_pipe(child.stderr.take());

        let status = tokio::select! {
            status = child.wait() => status.map_err(io_err)?,
            () = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Ok(Vec::new());
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        if !status.success() {
            let stderr = stderr_task.await.unwrap_or_default();
            return Err(DriverError::Discovery {
                package: package.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let targets: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with("Fuzz"))
            .map(ToString::to_string)
            .collect();

        if targets.is_empty() {
            warn!(package, "no valid fuzz targets found");
        }
        Ok(targets)
    }

    /// Runs one fuzz target for at most `per_target`, parsing its output and
    /// reporting any crash.
    ///
    /// A crash is expected behavior: the crash is reported and `Ok(())` is
    /// returned after the persisted failing input is removed from the
    /// working tree. A non-zero exit without a crash and without
    /// cancellation is an infrastructure fault.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`] for infrastructure faults only.
    pub async fn execute(
        &self,
        task: &Task,
        per_target: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        info!(
            package = %task.package,
            fuzz_target = %task.target,
            timeout = ?per_target,
            "executing fuzz target"
        );

        let package_dir = self.project_dir.join(&task.package);
        let cache_dir = self
            .corpus_dir
            .join(&task.package)
            .join("testdata")
            .join("fuzz");
        // The fuzzer persists crash inputs under the package's own testdata
        // tree, not under the corpus cache.
        let failing_input_dir = package_dir.join("testdata").join("fuzz");

        let spec = FuzzSpec {
            package_dir: &package_dir,
            target: &task.target,
            cache_dir: &cache_dir,
            fuzz_time: per_target,
        };
        let mut cmd = self.toolchain.fuzz_command(&spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
            package: task.package.clone(),
            target: task.target.clone(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| DriverError::OutputCapture {
            package: task.package.clone(),
            target: task.target.clone(),
        })?;
        let stderr_task = echo_stderr(child.stderr.take(), task.clone());

        let parser = FuzzOutputParser::new(
            task.package.clone(),
            task.target.clone(),
            failing_input_dir.clone(),
        );
        let parse_task = tokio::spawn(parser.consume(stdout));

        // Race completion against the per-task cutoff and cycle
        // cancellation. Either interruption kills the subprocess, which
        // closes its pipes and lets the parser reach EOF. `status` stays
        // `None` for interrupted runs, which are never treated as failures.
        let status = tokio::select! {
            status = child.wait() => Some(status.map_err(|source| DriverError::Wait {
                package: task.package.clone(),
                target: task.target.clone(),
                source,
            })?),
            () = cancel.cancelled() => {
                terminate(&mut child).await;
                None
            }
            () = tokio::time::sleep(per_target) => {
                warn!(
                    package = %task.package,
                    fuzz_target = %task.target,
                    "per-target timeout reached, terminating fuzz process"
                );
                terminate(&mut child).await;
                None
            }
        };

        let outcome = parse_task.await?;
        stderr_task.await.unwrap_or_default();

        if let Some(crash) = &outcome.crash {
            if let Err(err) = self.reporter.report(crash).await {
                warn!(
                    package = %task.package,
                    fuzz_target = %task.target,
                    error = %err,
                    "failed to report crash"
                );
            }
        }

        if let Some(status) = status {
            if !status.success() && !outcome.target_failed && !cancel.is_cancelled() {
                return Err(DriverError::Execution {
                    package: task.package.clone(),
                    target: task.target.clone(),
                    status,
                });
            }
        }

        if outcome.target_failed {
            // The fuzzer saved the crashing input into the package's
            // testdata tree; remove it so unrelated later runs in this tree
            // do not trip over it.
            let persisted = failing_input_dir.join(&task.target);
            if let Err(source) = tokio::fs::remove_dir_all(&persisted).await {
                if source.kind() != std::io::ErrorKind::NotFound {
                    return Err(DriverError::Cleanup {
                        package: task.package.clone(),
                        target: task.target.clone(),
                        source,
                    });
                }
            }
        }

        info!(
            package = %task.package,
            fuzz_target = %task.target,
            "fuzzing completed"
        );
        Ok(())
    }
}

/// Kills the subprocess and reaps it.
async fn terminate(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Reads a pipe to completion in the background.
fn drain_pipe<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    })
}

/// Echoes the fuzzer's stderr into the log line by line.
fn echo_stderr<R>(pipe: Option<R>, task: Task) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(pipe) = pipe else { return };
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(
                package = %task.package,
                fuzz_target = %task.target,
                "{line}"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::report_file_name;

    /// Replays canned output through a shell instead of running the real
    /// toolchain.
    struct FakeToolchain {
        list_script: String,
        fuzz_script: String,
    }

    impl FuzzToolchain for FakeToolchain {
        fn list_command(&self, package_dir: &Path) -> Command {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", &self.list_script]).current_dir(package_dir);
            cmd
        }

        fn fuzz_command(&self, spec: &FuzzSpec<'_>) -> Command {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", &self.fuzz_script])
                .current_dir(spec.package_dir);
            cmd
        }
    }

    struct Fixture {
        _workspace: tempfile::TempDir,
        results: tempfile::TempDir,
        driver: FuzzDriver,
        package_dir: PathBuf,
    }

    fn fixture(list_script: &str, fuzz_script: &str) -> Fixture {
        let workspace = tempfile::tempdir().unwrap();
        let results = tempfile::tempdir().unwrap();
        let project_dir = workspace.path().join("project");
        let corpus_dir = workspace.path().join("corpus");
        let package_dir = project_dir.join("pkg");
        std::fs::create_dir_all(&package_dir).unwrap();
        std::fs::create_dir_all(&corpus_dir).unwrap();

        let driver = FuzzDriver::new(
            Arc::new(FakeToolchain {
                list_script: list_script.to_string(),
                fuzz_script: fuzz_script.to_string(),
            }),
            Arc::new(CrashReporter::Disk {
                results_dir: results.path().to_path_buf(),
            }),
            project_dir,
            corpus_dir,
        );

        Fixture {
            _workspace: workspace,
            results,
            driver,
            package_dir,
        }
    }

    fn task() -> Task {
        Task {
            package: "pkg".to_string(),
            target: "FuzzX".to_string(),
        }
    }

    #[tokio::test]
    async fn test_list_targets_filters_fuzz_prefix() {
        let fix = fixture(
            "printf 'FuzzAlpha\\nFuzzBeta\\nTestGamma\\nok example.com/pkg 0.01s\\n'",
            "true",
        );
        let targets = fix
            .driver
            .list_targets("pkg", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(targets, vec!["FuzzAlpha", "FuzzBeta"]);
    }

    #[tokio::test]
    async fn test_list_targets_failure_is_error() {
        let fix = fixture("echo 'build failed' >&2; exit 1", "true");
        let err = fix
            .driver
            .list_targets("pkg", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DriverError::Discovery { package, stderr } => {
                assert_eq!(package, "pkg");
                assert_eq!(stderr, "build failed");
            }
            other => panic!("expected discovery error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_passing_target() {
        let fix = fixture("true", "printf 'fuzz: elapsed 1s\\nPASS\\n'");
        fix.driver
            .execute(&task(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(fix.results.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_execute_crashing_target_reports_and_cleans_up() {
        let fix = fixture(
            "true",
            "printf -- '--- FAIL: FuzzX (0.01s)\\n    x_test.go:42: boom\\nFAIL\\n'; exit 1",
        );

        // Simulate the fuzzer having persisted a failing input.
        let persisted = fix
            .package_dir
            .join("testdata")
            .join("fuzz")
            .join("FuzzX");
        std::fs::create_dir_all(&persisted).unwrap();
        std::fs::write(persisted.join("deadbeef"), b"input").unwrap();

        fix.driver
            .execute(&task(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        // The crash landed in the results directory and the persisted input
        // is gone.
        let reports: Vec<_> = std::fs::read_dir(fix.results.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].starts_with("pkg_FuzzX_"));
        assert!(reports[0].ends_with("_failure.md"));
        assert!(!persisted.exists());
    }

    #[tokio::test]
    async fn test_execute_repeated_crash_deduplicates() {
        let fix = fixture(
            "true",
            "printf -- '--- FAIL: FuzzX (0.01s)\\n    x_test.go:42: boom\\nFAIL\\n'; exit 1",
        );

        fix.driver
            .execute(&task(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        fix.driver
            .execute(&task(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read_dir(fix.results.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_execute_infrastructure_failure_is_error() {
        let fix = fixture("true", "echo 'no Go files in directory'; exit 2");
        let err = fix
            .driver
            .execute(&task(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Execution { .. }));
    }

    #[tokio::test]
    async fn test_execute_cancellation_is_not_an_error() {
        let fix = fixture("true", "sleep 30");
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        fix.driver
            .execute(&task(), Duration::from_secs(30), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_execute_timeout_kills_process_silently() {
        let fix = fixture("true", "sleep 30");
        let started = std::time::Instant::now();
        fix.driver
            .execute(
                &task(),
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_crash_report_filename_matches_signature() {
        let fix = fixture(
            "true",
            "printf -- '--- FAIL: FuzzX (0.01s)\\n    x_test.go:42: boom\\nFAIL\\n'; exit 1",
        );
        fix.driver
            .execute(&task(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        let record = crate::parser::CrashRecord {
            package: "pkg".to_string(),
            target: "FuzzX".to_string(),
            error_log: String::new(),
            failing_input: crate::parser::FailingInput::SeedCorpus,
            trace: "x_test.go:42\n".to_string(),
            signature: crate::util::compute_signature("pkg", "FuzzX", "x_test.go:42\n"),
        };
        assert!(fix
            .results
            .path()
            .join(report_file_name(&record))
            .exists());
    }
}
