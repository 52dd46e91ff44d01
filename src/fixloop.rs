//! Bounded test-fix loop with baseline failure diffing.
//!
//! The first test run of a workflow captures the failures that already
//! exist. Later runs only fail on failures outside that baseline, and ask an
//! agent to fix them a bounded number of times.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::vcs::VersionControl;

/// Failures considered pre-existing for the rest of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineFailureSet {
    /// Failures reported by the baseline test run.
    pub observed: BTreeSet<String>,
    /// Failures listed in the known-failures file.
    pub known: BTreeSet<String>,
}

impl BaselineFailureSet {
    pub fn new(observed: Vec<String>, known: Vec<String>) -> Self {
        Self {
            observed: observed.into_iter().collect(),
            known: known.into_iter().collect(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.observed.contains(id) || self.known.contains(id)
    }

    pub fn len(&self) -> usize {
        self.observed.union(&self.known).count()
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty() && self.known.is_empty()
    }
}

/// Extracts failure identifiers from candidate failure lines.
///
/// Recognises pytest (summary and `-v` progress), Go, cargo and jest/vitest
/// formats. Other lines are kept verbatim. Results are de-duplicated in first-seen order.
pub fn extract_failure_ids<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut ids = Vec::new();

    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() {
            continue;
        }
        let id = parse_failure_line(line);
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    ids
}

fn parse_failure_line(line: &str) -> String {
    // pytest: "FAILED path::test - reason"
    if let Some(rest) = line.strip_prefix("FAILED ") {
        let id = rest.split(" - ").next().unwrap_or(rest);
        return id.trim().to_string();
    }
    // go: "--- FAIL: Name (0.01s)"
    if let Some(rest) = line.strip_prefix("--- FAIL: ") {
        let id = rest.split(" (").next().unwrap_or(rest);
        return id.trim().to_string();
    }
    // cargo: "test a::b ... FAILED"
    if let Some(rest) = line.strip_prefix("test ") {
        if let Some(id) = rest.strip_suffix(" ... FAILED") {
            return id.trim().to_string();
        }
    }
    // jest/vitest: "FAIL src/x.test.js > Suite > name"
    if let Some(rest) = line.strip_prefix("FAIL ") {
        return rest.trim().to_string();
    }
    // pytest -v: "path::test FAILED [ 50%]"
    let progress = match line.rfind(" [") {
        Some(i) if line.ends_with("%]") => line[..i].trim_end(),
        _ => line,
    };
    if let Some(id) = progress.strip_suffix(" FAILED") {
        return id.trim().to_string();
    }
    line.to_string()
}

/// Picks the lines of raw test output that describe failures.
pub fn failure_lines(output: &str) -> Vec<&str> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with("test result:"))
        .filter(|l| {
            l.contains("FAILED")
                || l.contains("FAIL ")
                || l.contains("--- FAIL:")
                || l.contains("Error:")
        })
        .collect()
}

/// Result of one run of the verification command.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRun {
    /// Exit code, `None` if the process was killed or timed out.
    pub exit_code: Option<i32>,
    pub output: String,
    /// Parsed failure ids. Always empty for a successful exit.
    pub failures: Vec<String>,
}

impl TestRun {
    pub fn from_output(output: CommandOutput) -> Self {
        let failures = if output.success() {
            Vec::new()
        } else {
            extract_failure_ids(&failure_lines(&output.output))
        };
        Self {
            exit_code: output.exit_code,
            output: output.output,
            failures,
        }
    }

    pub fn exit_ok(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Comparison of a test run against the baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDiff {
    /// No failures outside the baseline.
    Clean { preexisting: Vec<String> },
    /// Failures outside the baseline.
    New {
        new: Vec<String>,
        preexisting: Vec<String>,
    },
    /// Non-zero exit with nothing parseable. Never tolerated.
    Unparseable { exit_code: Option<i32> },
}

/// Splits a run's failures into new and pre-existing.
pub fn diff_failures(run: &TestRun, baseline: &BaselineFailureSet) -> FailureDiff {
    if !run.exit_ok() && run.failures.is_empty() {
        return FailureDiff::Unparseable {
            exit_code: run.exit_code,
        };
    }

    let (preexisting, new): (Vec<String>, Vec<String>) = run
        .failures
        .iter()
        .cloned()
        .partition(|id| baseline.contains(id));

    if new.is_empty() {
        FailureDiff::Clean { preexisting }
    } else {
        FailureDiff::New { new, preexisting }
    }
}

/// Reads a known-failures file: one id per line, `#` comments allowed.
pub fn load_known_failures(path: &Path) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Output of a shell command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs project commands such as tests, lints and builds.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, dir: &Path, timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellCommandRunner;

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command: &str, dir: &Path, timeout: Duration) -> Result<CommandOutput> {
        tracing::info!(command = %command, dir = ?dir, "running command");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(output) => {
                let output = output?;
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                tracing::debug!(command = %command, code = ?output.status.code(), "command finished");
                Ok(CommandOutput {
                    exit_code: output.status.code(),
                    output: text,
                })
            }
            Err(_) => {
                tracing::warn!(command = %command, timeout_secs = timeout.as_secs(), "command timed out");
                Ok(CommandOutput {
                    exit_code: None,
                    output: format!("command timed out after {} seconds", timeout.as_secs()),
                })
            }
        }
    }
}

/// Result of asking an agent to fix failures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixAttempt {
    pub cost: f64,
    pub success: bool,
    pub session_id: Option<String>,
}

/// Something that tries to fix new test failures.
#[async_trait]
pub trait FailureFixer: Send + Sync {
    async fn fix(&self, new_failures: &[String], test_output: &str, iteration: u32)
        -> Result<FixAttempt>;
}

/// Outcome of a fix-loop run.
#[derive(Debug)]
pub struct FixLoopReport {
    /// Fix attempts made.
    pub iterations: u32,
    /// Total cost of the fix attempts.
    pub cost: f64,
    /// Baseline failures still present in the last run.
    pub preexisting: Vec<String>,
    /// Output of the last test run.
    pub last_output: String,
    /// Last session id reported by the fixer.
    pub session_id: Option<String>,
    /// Set when the loop did not pass.
    pub failure: Option<Error>,
}

impl FixLoopReport {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    /// Warnings describing tolerated pre-existing failures.
    pub fn warnings(&self) -> Vec<String> {
        if self.preexisting.is_empty() {
            return Vec::new();
        }
        vec![format!(
            "{} pre-existing test failure(s) tolerated: {}",
            self.preexisting.len(),
            self.preexisting.join(", ")
        )]
    }
}

/// Runs the verification command against a baseline, retrying fixes.
pub struct FixLoopController {
    phase: String,
    runner: Arc<dyn CommandRunner>,
    command: String,
    working_dir: PathBuf,
    timeout: Duration,
    max_iterations: u32,
}

impl FixLoopController {
    pub fn new(
        phase: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            phase: phase.into(),
            runner,
            command: command.into(),
            working_dir: working_dir.into(),
            timeout: Duration::from_secs(1800),
            max_iterations: 5,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    async fn run_once(&self) -> Result<TestRun> {
        let output = self
            .runner
            .run(&self.command, &self.working_dir, self.timeout)
            .await?;
        Ok(TestRun::from_output(output))
    }

    /// Runs the command once against a clean tree and records its failures.
    ///
    /// Uncommitted changes are stashed for the run when `vcs` is given and
    /// restored afterwards.
    pub async fn capture_baseline(
        &self,
        vcs: Option<&dyn VersionControl>,
        known: Vec<String>,
    ) -> Result<BaselineFailureSet> {
        let stashed = match vcs {
            Some(vcs) => vcs.stash(&self.working_dir).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "could not stash changes, capturing baseline on dirty tree");
                false
            }),
            None => false,
        };

        let run = self.run_once().await;

        if stashed {
            if let Some(vcs) = vcs {
                vcs.unstash(&self.working_dir)?;
            }
        }

        let run = run?;
        if !run.exit_ok() && run.failures.is_empty() {
            tracing::warn!(
                exit = ?run.exit_code,
                "baseline run failed without parseable failures, baseline is empty"
            );
        }

        let baseline = BaselineFailureSet::new(run.failures, known);
        tracing::info!(
            phase = %self.phase,
            observed = baseline.observed.len(),
            known = baseline.known.len(),
            "baseline captured"
        );
        Ok(baseline)
    }

    /// Verifies once against the baseline without attempting fixes.
    pub async fn check(&self, baseline: &BaselineFailureSet) -> Result<FixLoopReport> {
        self.run_loop(baseline, None).await
    }

    /// Runs the loop, invoking `fixer` on new failures up to the limit.
    pub async fn run(
        &self,
        baseline: &BaselineFailureSet,
        fixer: &dyn FailureFixer,
    ) -> Result<FixLoopReport> {
        self.run_loop(baseline, Some(fixer)).await
    }

    async fn run_loop(
        &self,
        baseline: &BaselineFailureSet,
        fixer: Option<&dyn FailureFixer>,
    ) -> Result<FixLoopReport> {
        let max_iterations = if fixer.is_some() { self.max_iterations } else { 0 };
        let mut report = FixLoopReport {
            iterations: 0,
            cost: 0.0,
            preexisting: Vec::new(),
            last_output: String::new(),
            session_id: None,
            failure: None,
        };

        loop {
            let run = match self.run_once().await {
                Ok(run) => run,
                Err(e) => {
                    tracing::error!(phase = %self.phase, error = %e, iterations = report.iterations, "test command could not run");
                    report.failure = Some(e);
                    return Ok(report);
                }
            };
            let diff = diff_failures(&run, baseline);
            report.last_output = run.output;

            match diff {
                FailureDiff::Clean { preexisting } => {
                    tracing::info!(
                        phase = %self.phase,
                        iterations = report.iterations,
                        preexisting = preexisting.len(),
                        "no new test failures"
                    );
                    report.preexisting = preexisting;
                    return Ok(report);
                }
                FailureDiff::Unparseable { exit_code } => {
                    tracing::error!(phase = %self.phase, exit = ?exit_code, "test command failed without parseable failures");
                    report.failure = Some(Error::PhaseFailed {
                        phase: self.phase.clone(),
                        reason: format!(
                            "test command exited with {} but no failure identifiers could be parsed",
                            exit_code.map_or("no exit code".to_string(), |c| format!("code {}", c))
                        ),
                    });
                    return Ok(report);
                }
                FailureDiff::New { new, preexisting } => {
                    report.preexisting = preexisting;
                    if report.iterations >= max_iterations {
                        tracing::error!(
                            phase = %self.phase,
                            iterations = report.iterations,
                            remaining = ?new,
                            "new test failures remain"
                        );
                        report.failure = Some(Error::TestsFailingAfterRetries {
                            phase: self.phase.clone(),
                            remaining: new,
                        });
                        return Ok(report);
                    }

                    let Some(fixer) = fixer else {
                        return Ok(report);
                    };
                    report.iterations += 1;
                    tracing::info!(
                        phase = %self.phase,
                        iteration = report.iterations,
                        new_failures = ?new,
                        "attempting fix"
                    );
                    match fixer.fix(&new, &report.last_output, report.iterations).await {
                        Ok(attempt) => {
                            report.cost += attempt.cost;
                            if attempt.session_id.is_some() {
                                report.session_id = attempt.session_id;
                            }
                            if !attempt.success {
                                tracing::warn!(iteration = report.iterations, "fix attempt reported failure");
                            }
                        }
                        Err(e) => {
                            report.failure = Some(e);
                            return Ok(report);
                        }
                    }
                }
            }
        }
    }
}

/// Keeps the last `max` bytes of `s`, on a char boundary.
pub fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
