//! Runtime configuration.
//!
//! The configuration is populated from command-line flags and environment
//! variables by the CLI and threaded explicitly through component
//! constructors; there is no process-global state.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::util;

/// Object key under which the corpus archive is stored.
pub const CORPUS_KEY: &str = "corpus.zip";

/// Name of the per-cycle workspace subdirectory holding the cloned project.
pub const PROJECT_SUBDIR: &str = "project";

/// Name of the per-cycle workspace subdirectory holding the corpus.
pub const CORPUS_SUBDIR: &str = "corpus";

/// Configuration errors. These surface before any side effect occurs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The requested worker count is outside the allowed range.
    #[error("invalid number of workers: {requested}, allowed range is [1, {max}]")]
    InvalidWorkerCount {
        /// Worker count requested by the user.
        requested: usize,
        /// Host logical CPU count.
        max: usize,
    },

    /// No fuzz package paths were supplied.
    #[error("at least one fuzz package path must be configured")]
    NoPackages,

    /// The project source URL does not parse.
    #[error("invalid project source URL {url}: {source}")]
    InvalidProjectUrl {
        /// Sanitized form of the offending URL.
        url: String,
        /// Parse failure reported by the URL parser.
        source: url::ParseError,
    },
}

/// Immutable runtime configuration for the fuzzing system.
#[derive(Debug, Clone)]
pub struct Config {
    /// Git repo URL of the project to fuzz. May carry a forge credential in
    /// its userinfo section; always pass through [`util::sanitize_url`]
    /// before logging.
    pub project_src_path: String,

    /// Name of the S3 bucket where the seed corpus is stored.
    pub s3_bucket_name: String,

    /// Directory receiving on-disk crash reports when no forge credential is
    /// present.
    pub fuzz_results_path: PathBuf,

    /// Package paths to fuzz, relative to the project root, in the order
    /// they were configured.
    pub fuzz_pkgs_path: Vec<String>,

    /// Total wall-clock budget of one fuzzing cycle.
    pub sync_frequency: Duration,

    /// Number of concurrent fuzzing workers.
    pub num_workers: usize,
}

impl Config {
    /// Builds and validates a configuration.
    ///
    /// The results path has a leading `~` expanded against `$HOME`. The
    /// worker count must lie in `[1, NCPU]`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when validation fails.
    pub fn new(
        project_src_path: String,
        s3_bucket_name: String,
        fuzz_results_path: &str,
        fuzz_pkgs_path: Vec<String>,
        sync_frequency: Duration,
        num_workers: usize,
    ) -> Result<Self, ConfigError> {
        Url::parse(&project_src_path).map_err(|source| ConfigError::InvalidProjectUrl {
            url: util::sanitize_url(&project_src_path),
            source,
        })?;

        let max_workers = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
        if num_workers == 0 || num_workers > max_workers {
            return Err(ConfigError::InvalidWorkerCount {
                requested: num_workers,
                max: max_workers,
            });
        }

        let fuzz_pkgs_path: Vec<String> = fuzz_pkgs_path
            .into_iter()
            .map(|pkg| pkg.trim().to_string())
            .filter(|pkg| !pkg.is_empty())
            .collect();
        if fuzz_pkgs_path.is_empty() {
            return Err(ConfigError::NoPackages);
        }

        Ok(Self {
            project_src_path,
            s3_bucket_name,
            fuzz_results_path: util::expand_home(fuzz_results_path),
            fuzz_pkgs_path,
            sync_frequency,
            num_workers,
        })
    }
}
