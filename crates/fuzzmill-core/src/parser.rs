//! Fuzzer output parsing.
//!
//! The fuzz subprocess prints human-readable progress lines; this module
//! consumes that stream, mirrors every line into the log, and switches into
//! failure capture when the `--- FAIL:` marker appears. Everything after the
//! marker is collected into a [`CrashRecord`]: the raw error log, the
//! `file:line` trace that keys deduplication, and (when the fuzzer persisted
//! one) the failing input itself.
//!
//! The two regexes below are a contract with the fuzzing toolchain's output
//! format; their exact patterns are pinned by tests.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::info;

use crate::util;

/// Literal marking the start of a failure section in the fuzzer output.
const FAILURE_MARKER: &str = "--- FAIL:";

/// Matches lines reporting a persisted failing input, e.g.
/// `Failing input written to testdata/fuzz/FuzzFoo/771e938e4458e983`,
/// capturing the target name and the hexadecimal input id.
static FAILING_INPUT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Failing input written to testdata/fuzz/(?P<target>[^/]+)/(?P<id>[0-9a-f]+)")
        .expect("failing-input regex should compile")
});

/// Matches stack-trace lines carrying a Go source location, e.g.
/// `    stringutils_test.go:17: Reverse produced invalid UTF-8`,
/// capturing the file base name and line number.
static FILE_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*(?P<file>[^/]+\.go):(?P<line>[0-9]+)").expect("file-line regex should compile")
});

/// The failing input associated with a crash, as far as it could be
/// recovered from the fuzzer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailingInput {
    /// The fuzzer persisted an input file and it was read back.
    Captured {
        /// Fuzz target the input belongs to.
        target: String,
        /// Input file contents.
        data: String,
    },

    /// The fuzzer reported an input file but it could not be read.
    Unreadable {
        /// Fuzz target the input belongs to.
        target: String,
        /// Relative path of the input file.
        path: String,
        /// Read error.
        error: String,
    },

    /// The crash came from replaying the seed corpus; no input was
    /// persisted.
    SeedCorpus,
}

/// A fully-assembled crash, ready for the reporter.
#[derive(Debug, Clone)]
pub struct CrashRecord {
    /// Package the crashing target lives in.
    pub package: String,
    /// Crashing fuzz target.
    pub target: String,
    /// Raw output lines captured after the failure marker.
    pub error_log: String,
    /// Recovered failing input.
    pub failing_input: FailingInput,
    /// Sequence of `file:line` hits feeding the signature.
    pub trace: String,
    /// 16-hex-char deduplication signature.
    pub signature: String,
}

impl CrashRecord {
    /// Title used for forge issues; doubles as the forge-side dedup key.
    #[must_use]
    pub fn report_title(&self) -> String {
        format!("[fuzz/{}] Fuzzing crash in {}", self.signature, self.target)
    }
}

/// Result of consuming one fuzz run's output stream.
#[derive(Debug)]
pub struct ParseOutcome {
    /// Whether the run hit a target failure (a crash, not an infrastructure
    /// problem).
    pub target_failed: bool,
    /// The assembled crash, when a failure section was seen.
    pub crash: Option<CrashRecord>,
}

/// Line-oriented state machine over a single fuzz run's output.
#[derive(Debug)]
pub struct FuzzOutputParser {
    package: String,
    target: String,
    /// Directory the fuzzer writes failing inputs into
    /// (`<project>/<package>/testdata/fuzz`).
    failing_input_dir: PathBuf,
}

impl FuzzOutputParser {
    /// Creates a parser for one `(package, target)` run.
    #[must_use]
    pub fn new(package: String, target: String, failing_input_dir: PathBuf) -> Self {
        Self {
            package,
            target,
            failing_input_dir,
        }
    }

    /// Consumes the output stream to EOF and reports whether the target
    /// failed, together with the assembled [`CrashRecord`] when it did.
    ///
    /// Read errors are treated as end-of-stream: a killed subprocess closes
    /// its pipe mid-line, and that must never be confused with a crash.
    pub async fn consume<R>(self, stream: R) -> ParseOutcome
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(stream).lines();

        // Scan until the failure marker; every line is echoed.
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    self.echo(&line);
                    if line.contains(FAILURE_MARKER) {
                        break;
                    }
                }
                Ok(None) | Err(_) => {
                    return ParseOutcome {
                        target_failed: false,
                        crash: None,
                    };
                }
            }
        }

        // Failure section: capture everything after the marker line.
        let mut error_log = String::new();
        let mut trace = String::new();
        let mut failing_input: Option<FailingInput> = None;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            };
            self.echo(&line);

            error_log.push_str(&line);
            error_log.push('\n');

            if let Some(hit) = parse_file_line(&line) {
                trace.push_str(&hit);
                trace.push('\n');
            }

            // Only the first persisted-input line counts.
            if failing_input.is_none() {
                if let Some((target, id)) = parse_failing_input_line(&line) {
                    failing_input = Some(self.read_failing_input(&target, &id).await);
                }
            }
        }

        let signature = util::compute_signature(&self.package, &self.target, &trace);
        let crash = CrashRecord {
            package: self.package,
            target: self.target,
            error_log,
            failing_input: failing_input.unwrap_or(FailingInput::SeedCorpus),
            trace,
            signature,
        };

        ParseOutcome {
            target_failed: true,
            crash: Some(crash),
        }
    }

    fn echo(&self, line: &str) {
        info!(
            package = %self.package,
            fuzz_target = %self.target,
            "{line}"
        );
    }

    async fn read_failing_input(&self, target: &str, id: &str) -> FailingInput {
        let rel = format!("{target}/{id}");
        let path = self.failing_input_dir.join(target).join(id);
        match tokio::fs::read(&path).await {
            Ok(data) => FailingInput::Captured {
                target: target.to_string(),
                data: String::from_utf8_lossy(&data).into_owned(),
            },
            Err(err) => FailingInput::Unreadable {
                target: target.to_string(),
                path: rel,
                error: err.to_string(),
            },
        }
    }
}

/// Extracts a `file:line` pair from a stack-trace line, if present.
fn parse_file_line(line: &str) -> Option<String> {
    let captures = FILE_LINE_REGEX.captures(line)?;
    Some(format!("{}:{}", &captures["file"], &captures["line"]))
}

/// Extracts `(target, id)` from a persisted-failing-input line, if present.
fn parse_failing_input_line(line: &str) -> Option<(String, String)> {
    let captures = FAILING_INPUT_REGEX.captures(line)?;
    Some((captures["target"].to_string(), captures["id"].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(failing_input_dir: PathBuf) -> FuzzOutputParser {
        FuzzOutputParser::new("parser".to_string(), "FuzzX".to_string(), failing_input_dir)
    }

    #[tokio::test]
    async fn test_passing_stream_yields_no_crash() {
        let stream = b"fuzz: elapsed 3s, execs: 12345\nPASS\nok \texample.com/parser\t3.2s\n";
        let outcome = parser(PathBuf::from("/nonexistent"))
            .consume(&stream[..])
            .await;
        assert!(!outcome.target_failed);
        assert!(outcome.crash.is_none());
    }

    #[tokio::test]
    async fn test_failure_with_persisted_input() {
        let dir = tempfile::tempdir().unwrap();
        let input_dir = dir.path().join("FuzzX");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::write(input_dir.join("abcdef0123456789"), b"payload").unwrap();

        let stream = b"--- FAIL: FuzzX (0.04s)\n    x_test.go:42: boom\n    Failing input written to testdata/fuzz/FuzzX/abcdef0123456789\n";
        let outcome = parser(dir.path().to_path_buf()).consume(&stream[..]).await;

        assert!(outcome.target_failed);
        let crash = outcome.crash.unwrap();
        assert_eq!(crash.trace, "x_test.go:42\n");
        assert_eq!(
            crash.signature,
            util::compute_signature("parser", "FuzzX", "x_test.go:42\n")
        );
        assert_eq!(
            crash.failing_input,
            FailingInput::Captured {
                target: "FuzzX".to_string(),
                data: "payload".to_string(),
            }
        );
        // The trigger line itself is not part of the captured error log.
        assert!(!crash.error_log.contains("--- FAIL:"));
        assert!(crash.error_log.contains("x_test.go:42: boom"));
    }

    #[tokio::test]
    async fn test_seed_corpus_failure_uses_placeholder() {
        let stream = b"--- FAIL: FuzzX (0.00s)\n    failure while testing seed corpus entry: FuzzX/seed#0\n    x_test.go:17: unexpected length\n";
        let outcome = parser(PathBuf::from("/nonexistent"))
            .consume(&stream[..])
            .await;

        let crash = outcome.crash.unwrap();
        assert_eq!(crash.failing_input, FailingInput::SeedCorpus);
        assert_eq!(crash.trace, "x_test.go:17\n");
    }

    #[tokio::test]
    async fn test_unreadable_input_is_noted() {
        let dir = tempfile::tempdir().unwrap();
        let stream =
            b"--- FAIL: FuzzX (0.04s)\n    Failing input written to testdata/fuzz/FuzzX/deadbeef\n";
        let outcome = parser(dir.path().to_path_buf()).consume(&stream[..]).await;

        match outcome.crash.unwrap().failing_input {
            FailingInput::Unreadable { target, path, .. } => {
                assert_eq!(target, "FuzzX");
                assert_eq!(path, "FuzzX/deadbeef");
            }
            other => panic!("expected unreadable input, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_only_first_persisted_input_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let input_dir = dir.path().join("FuzzX");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::write(input_dir.join("aaaa"), b"first").unwrap();
        std::fs::write(input_dir.join("bbbb"), b"second").unwrap();

        let stream = b"--- FAIL: FuzzX (0.04s)\n    Failing input written to testdata/fuzz/FuzzX/aaaa\n    Failing input written to testdata/fuzz/FuzzX/bbbb\n";
        let outcome = parser(dir.path().to_path_buf()).consume(&stream[..]).await;

        assert_eq!(
            outcome.crash.unwrap().failing_input,
            FailingInput::Captured {
                target: "FuzzX".to_string(),
                data: "first".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_trace_accumulates_in_stream_order() {
        let stream = b"--- FAIL: FuzzX (0.01s)\n    fuzz.go:322: assertion failed\n    stringutils_test.go:17: helper blew up\nFAIL\n";
        let outcome = parser(PathBuf::from("/nonexistent"))
            .consume(&stream[..])
            .await;

        let crash = outcome.crash.unwrap();
        assert_eq!(crash.trace, "fuzz.go:322\nstringutils_test.go:17\n");
    }

    #[test]
    fn test_file_line_regex_contract() {
        assert_eq!(
            parse_file_line("    stringutils_test.go:17: Reverse produced invalid UTF-8"),
            Some("stringutils_test.go:17".to_string())
        );
        // Only the base name after the last slash is captured.
        assert_eq!(
            parse_file_line("\t/home/user/project/fuzz.go:322: oops"),
            Some("fuzz.go:322".to_string())
        );
        assert_eq!(parse_file_line("FAIL\texample.com/parser\t0.04s"), None);
    }

    #[test]
    fn test_failing_input_regex_contract() {
        assert_eq!(
            parse_failing_input_line(
                "    Failing input written to testdata/fuzz/FuzzFoo/771e938e4458e983"
            ),
            Some(("FuzzFoo".to_string(), "771e938e4458e983".to_string()))
        );
        assert_eq!(
            parse_failing_input_line("failure while testing seed corpus entry: FuzzFoo/seed#0"),
            None
        );
    }

    #[test]
    fn test_report_title_format() {
        let record = CrashRecord {
            package: "parser".to_string(),
            target: "FuzzX".to_string(),
            error_log: String::new(),
            failing_input: FailingInput::SeedCorpus,
            trace: String::new(),
            signature: "033fec7be7cb79a4".to_string(),
        };
        assert_eq!(
            record.report_title(),
            "[fuzz/033fec7be7cb79a4] Fuzzing crash in FuzzX"
        );
    }
}
