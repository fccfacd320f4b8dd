//! The cycle engine.
//!
//! [`CycleController`] runs an unbounded sequence of fuzzing cycles until
//! the root cancellation token fires. Each cycle clones the project,
//! hydrates the corpus, discovers fuzz targets, fans them out over a worker
//! pool for one wall-clock window, publishes the augmented corpus, and
//! scrubs the workspace.
//!
//! Cancellation shape: the root token covers the whole process; each cycle
//! derives a child token for its workers; each task additionally races a
//! per-target timeout. Deadline expiry cancels only the cycle scope, global
//! cancellation cancels everything and skips the corpus upload (a cycle cut
//! short may leave the corpus tree inconsistent).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clone::{self, CloneError};
use crate::config::{Config, CORPUS_KEY};
use crate::queue::{Task, TaskQueue};
use crate::report::CrashReporter;
use crate::runner::{DriverError, FuzzDriver, FuzzToolchain};
use crate::storage::{archive, CorpusStore, StorageError};
use crate::util;
use crate::workspace::Workspace;

/// Fatal cycle errors. Everything here terminates the process; expected
/// events (target crashes, reporter hiccups, publish failures) never become
/// a `CycleError`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CycleError {
    /// The per-cycle workspace could not be created or written.
    #[error("cycle workspace I/O failed: {0}")]
    Workspace(#[from] std::io::Error),

    /// Repository materialization failed.
    #[error("repository sync failed: {0}")]
    Clone(#[from] CloneError),

    /// Corpus hydration failed (other than a missing corpus object).
    #[error("corpus hydration failed: {0}")]
    Storage(#[from] StorageError),

    /// Target discovery or a fuzz subprocess hit an infrastructure fault.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The computed per-target budget is not positive.
    #[error("invalid per-target fuzz duration: {seconds} seconds")]
    InvalidBudget {
        /// The non-positive budget that was computed.
        seconds: f64,
    },

    /// A worker task panicked or was aborted.
    #[error("fuzz worker task failed: {0}")]
    WorkerJoin(#[from] tokio::task::JoinError),
}

/// How a single cycle ended.
enum CycleOutcome {
    /// Normal completion; run the next cycle.
    Continue,
    /// No fuzz targets exist; stop cleanly.
    NoTargets,
    /// Global cancellation fired; stop cleanly.
    Shutdown,
}

/// Composes clone, hydration, discovery, scheduling, publication, and
/// cleanup into a cancellation-safe loop.
pub struct CycleController {
    config: Arc<Config>,
    store: CorpusStore,
    toolchain: Arc<dyn FuzzToolchain>,
    reporter: Arc<CrashReporter>,
}

impl CycleController {
    /// Creates a controller over the given collaborators.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        store: CorpusStore,
        toolchain: Arc<dyn FuzzToolchain>,
        reporter: Arc<CrashReporter>,
    ) -> Self {
        Self {
            config,
            store,
            toolchain,
            reporter,
        }
    }

    /// Runs fuzzing cycles until `shutdown` fires or a fatal error occurs.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`CycleError`]; the workspace of the failing
    /// cycle has already been cleaned up.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), CycleError> {
        loop {
            if shutdown.is_cancelled() {
                info!("shutdown requested, stopping fuzz cycles");
                return Ok(());
            }

            match self.run_cycle(&shutdown).await? {
                CycleOutcome::Continue => {}
                CycleOutcome::NoTargets | CycleOutcome::Shutdown => return Ok(()),
            }
        }
    }

    /// Runs one cycle inside a fresh workspace, removing the workspace on
    /// every exit path.
    async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<CycleOutcome, CycleError> {
        let workspace = Workspace::create()?;
        let outcome = self.run_cycle_inner(&workspace, shutdown).await;
        workspace.cleanup();
        outcome
    }

    async fn run_cycle_inner(
        &self,
        workspace: &Workspace,
        shutdown: &CancellationToken,
    ) -> Result<CycleOutcome, CycleError> {
        // 1. Materialize the repository.
        info!(
            repo_url = %util::sanitize_url(&self.config.project_src_path),
            local_path = %workspace.project_dir().display(),
            "syncing project repository"
        );
        match clone::clone_repo(
            &self.config.project_src_path,
            &workspace.project_dir(),
            shutdown,
        )
        .await
        {
            Ok(()) => {}
            Err(CloneError::Cancelled) => return Ok(CycleOutcome::Shutdown),
            Err(err) => return Err(err.into()),
        }

        // 2. Hydrate the corpus. A missing object is an empty corpus.
        let corpus_zip = workspace.corpus_zip_path();
        let empty = self.store.download(CORPUS_KEY, &corpus_zip).await?;
        tokio::fs::create_dir_all(workspace.corpus_dir()).await?;
        if !empty {
            archive::unzip(&corpus_zip, &workspace.corpus_dir()).map_err(StorageError::from)?;
        }
        if shutdown.is_cancelled() {
            return Ok(CycleOutcome::Shutdown);
        }

        // 3. Discover fuzz targets across all configured packages.
        let driver = Arc::new(FuzzDriver::new(
            Arc::clone(&self.toolchain),
            Arc::clone(&self.reporter),
            workspace.project_dir(),
            workspace.corpus_dir(),
        ));
        let mut pkg_targets: Vec<(String, Vec<String>)> = Vec::new();
        let mut total_targets = 0usize;
        for package in &self.config.fuzz_pkgs_path {
            let targets = driver.list_targets(package, shutdown).await?;
            total_targets += targets.len();
            pkg_targets.push((package.clone(), targets));
        }
        if shutdown.is_cancelled() {
            return Ok(CycleOutcome::Shutdown);
        }
        if total_targets == 0 {
            warn!("no fuzz targets found, stopping - please add some fuzz targets");
            return Ok(CycleOutcome::NoTargets);
        }

        // 4. Apportion the cycle budget across targets.
        let fuzz_seconds = util::calculate_fuzz_seconds(
            self.config.sync_frequency,
            self.config.num_workers,
            total_targets,
        );
        if fuzz_seconds <= 0.0 {
            return Err(CycleError::InvalidBudget {
                seconds: fuzz_seconds,
            });
        }
        let per_target = Duration::from_secs(fuzz_seconds as u64);
        info!(
            total_targets,
            per_target = ?per_target,
            "per-target fuzz timeout calculated"
        );

        // 5. Schedule: pre-load the queue, start the workers, then race
        //    drain vs. deadline vs. global cancellation.
        let queue = Arc::new(TaskQueue::new());
        for (package, targets) in &pkg_targets {
            for target in targets {
                queue.enqueue(Task {
                    package: package.clone(),
                    target: target.clone(),
                });
            }
        }

        let cycle_token = shutdown.child_token();
        let mut handles = Vec::with_capacity(self.config.num_workers);
        for worker_id in 1..=self.config.num_workers {
            handles.push(tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&queue),
                Arc::clone(&driver),
                per_target,
                cycle_token.clone(),
            )));
        }

        let drain = join_workers(handles);
        tokio::pin!(drain);

        let outcome = tokio::select! {
            result = &mut drain => {
                result?;
                info!("all workers completed early, cleaning up cycle");
                self.publish_corpus(workspace).await;
                CycleOutcome::Continue
            }
            () = tokio::time::sleep(self.config.sync_frequency) => {
                info!("cycle duration complete, initiating cleanup");
                cycle_token.cancel();
                drain.await?;
                self.publish_corpus(workspace).await;
                CycleOutcome::Continue
            }
            () = shutdown.cancelled() => {
                info!("shutdown initiated during fuzzing cycle, performing final cleanup");
                cycle_token.cancel();
                // The corpus may be mid-write; do not publish it.
                if let Err(err) = drain.await {
                    warn!(error = %err, "worker error during shutdown drain");
                }
                CycleOutcome::Shutdown
            }
        };

        Ok(outcome)
    }

    /// Zips and uploads the corpus. Failures are logged and swallowed; the
    /// cycle still cleans up and proceeds.
    async fn publish_corpus(&self, workspace: &Workspace) {
        let corpus_dir = workspace.corpus_dir();
        info!(source_dir = %corpus_dir.display(), "publishing corpus");

        let bytes = match archive::zip_dir(&corpus_dir) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "corpus zip failed");
                return;
            }
        };

        if let Err(err) = self.store.upload(CORPUS_KEY, bytes).await {
            error!(error = %err, "corpus upload failed");
        }
    }
}

/// One fuzzing worker: drain the queue, running each task under the shared
/// cycle scope. A worker that hits an infrastructure fault cancels its
/// siblings through the shared token before returning the error.
async fn run_worker(
    worker_id: usize,
    queue: Arc<TaskQueue>,
    driver: Arc<FuzzDriver>,
    per_target: Duration,
    cycle_token: CancellationToken,
) -> Result<(), DriverError> {
    loop {
        if cycle_token.is_cancelled() {
            info!(worker_id, "cycle cancelled, stopping worker");
            return Ok(());
        }

        let Some(task) = queue.dequeue() else {
            info!(worker_id, "no more tasks in queue, stopping worker");
            return Ok(());
        };

        info!(
            worker_id,
            package = %task.package,
            fuzz_target = %task.target,
            timeout = ?per_target,
            "worker starting fuzz target"
        );

        if let Err(err) = driver.execute(&task, per_target, &cycle_token).await {
            cycle_token.cancel();
            return Err(err);
        }

        info!(
            worker_id,
            package = %task.package,
            fuzz_target = %task.target,
            "worker completed fuzz target"
        );
    }
}

/// Awaits every worker and surfaces the first failure.
async fn join_workers(
    handles: Vec<JoinHandle<Result<(), DriverError>>>,
) -> Result<(), CycleError> {
    let mut first_err: Option<CycleError> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                first_err.get_or_insert(err.into());
            }
            Err(join_err) => {
                first_err.get_or_insert(CycleError::WorkerJoin(join_err));
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}
