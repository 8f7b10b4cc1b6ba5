//! Downstream trigger: the external transformation tool run after an upload.
//!
//! Three steps, strictly ordered. A failure of the first two aborts the rest;
//! a failure of the tests step is only reported. Nothing here retries.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::{DownstreamError, DownstreamErrorKind};
use crate::storage::UploadReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamStep {
    ExternalSource,
    Models,
    Tests,
}

impl DownstreamStep {
    pub const ALL: [DownstreamStep; 3] = [
        DownstreamStep::ExternalSource,
        DownstreamStep::Models,
        DownstreamStep::Tests,
    ];

    /// Whether a failure of this step stops the sequence.
    pub fn is_blocking(self) -> bool {
        !matches!(self, DownstreamStep::Tests)
    }
}

impl fmt::Display for DownstreamStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DownstreamStep::ExternalSource => "ensure-external-source",
            DownstreamStep::Models => "run-models",
            DownstreamStep::Tests => "run-tests",
        })
    }
}

/// Runs one step of the transformation tool.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, step: DownstreamStep) -> Result<(), DownstreamError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed(String),
    Skipped,
}

/// Per-step result of one trigger run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamReport {
    pub steps: Vec<(DownstreamStep, StepStatus)>,
}

impl DownstreamReport {
    pub fn status(&self, step: DownstreamStep) -> Option<&StepStatus> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, st)| st)
    }

    /// External source and models both succeeded. Test failures don't count.
    pub fn is_success(&self) -> bool {
        DownstreamStep::ALL
            .iter()
            .filter(|s| s.is_blocking())
            .all(|s| self.status(*s) == Some(&StepStatus::Succeeded))
    }
}

pub struct DownstreamTrigger {
    runner: Arc<dyn StepRunner>,
}

impl DownstreamTrigger {
    pub fn new(runner: Arc<dyn StepRunner>) -> Self {
        Self { runner }
    }

    /// Runs the step sequence after a successful upload.
    ///
    /// `reference` is only required to exist; its content is not inspected.
    #[tracing::instrument(skip(self), fields(uri = %reference))]
    pub async fn trigger(&self, reference: &UploadReference) -> DownstreamReport {
        self.run_sequence().await
    }

    /// Runs the step sequence without a preceding upload.
    pub async fn run_sequence(&self) -> DownstreamReport {
        let mut steps = Vec::with_capacity(DownstreamStep::ALL.len());
        let mut aborted = false;

        for step in DownstreamStep::ALL {
            if aborted {
                steps.push((step, StepStatus::Skipped));
                continue;
            }

            info!(%step, "Running downstream step");
            match self.runner.run(step).await {
                Ok(()) => {
                    info!(%step, "Downstream step succeeded");
                    steps.push((step, StepStatus::Succeeded));
                }
                Err(e) if step.is_blocking() => {
                    error!(%step, error = %e, "Downstream step failed, aborting remaining steps");
                    steps.push((step, StepStatus::Failed(e.kind.to_string())));
                    aborted = true;
                }
                Err(e) => {
                    warn!(%step, error = %e, "Data quality tests failed");
                    steps.push((step, StepStatus::Failed(e.kind.to_string())));
                }
            }
        }

        DownstreamReport { steps }
    }
}

/// Drives the `dbt` CLI (or a compatible wrapper) as a child process.
pub struct DbtRunner {
    program: String,
    prefix_args: Vec<String>,
    project_dir: PathBuf,
    profiles_dir: PathBuf,
    env: BTreeMap<String, String>,
    generate_docs: bool,
    timeout: Duration,
}

/// Marker in the tool's output meaning the external source is already there.
const ALREADY_EXISTS: &str = "Already Exists";

/// Wrapper lines dbt prints above the actual database error.
const ERROR_HEADERS: &[&str] = &["Encountered an error", "Database Error"];

/// Output kept in error messages and debug logs.
const OUTPUT_TAIL: usize = 2_000;

impl DbtRunner {
    /// `command` is split on whitespace: the first word is the program, the
    /// rest are passed before every step's arguments (e.g. `uv run dbt`).
    pub fn new(command: &str, project_dir: impl Into<PathBuf>) -> Self {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words.next().unwrap_or_else(|| "dbt".to_string());
        let project_dir = project_dir.into();
        Self {
            program,
            prefix_args: words.collect(),
            profiles_dir: project_dir.clone(),
            project_dir,
            env: BTreeMap::new(),
            generate_docs: true,
            timeout: Duration::from_secs(900),
        }
    }

    pub fn profiles_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profiles_dir = dir.into();
        self
    }

    /// Exports `key=value` into every child process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn generate_docs(mut self, enabled: bool) -> Self {
        self.generate_docs = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exec(&self, step: DownstreamStep, args: &[&str]) -> Result<String, DownstreamError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .args(args)
            .arg("--profiles-dir")
            .arg(&self.profiles_dir)
            .current_dir(&self.project_dir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(%step, program = %self.program, ?args, "Spawning transformation tool");
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| DownstreamError::new(step, e))?,
            Err(_) => {
                return Err(DownstreamError::new(
                    step,
                    DownstreamErrorKind::Timeout(self.timeout),
                ));
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!(%step, output = %tail(&text), "Transformation tool finished");

        if output.status.success() {
            Ok(text)
        } else {
            Err(DownstreamError::new(
                step,
                DownstreamErrorKind::ExitStatus {
                    code: output.status.code(),
                    output: tail(&text).to_string(),
                },
            ))
        }
    }
}

#[async_trait]
impl StepRunner for DbtRunner {
    async fn run(&self, step: DownstreamStep) -> Result<(), DownstreamError> {
        match step {
            DownstreamStep::ExternalSource => {
                match self.exec(step, &["run-operation", "stage_external_sources"]).await {
                    Ok(_) => Ok(()),
                    Err(DownstreamError {
                        kind: DownstreamErrorKind::ExitStatus { output, .. },
                        ..
                    }) if only_already_exists(&output) => {
                        info!("External source already exists");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            DownstreamStep::Models => {
                self.exec(step, &["run"]).await?;
                if self.generate_docs {
                    if let Err(e) = self.exec(step, &["docs", "generate"]).await {
                        warn!(error = %e, "Docs generation failed");
                    }
                }
                Ok(())
            }
            DownstreamStep::Tests => self.exec(step, &["test"]).await.map(|_| ()),
        }
    }
}

/// Whether every error line in `output` is an "Already Exists" conflict.
///
/// dbt prints a generic header (`Encountered an error ... Database Error`)
/// before the database message, so a header followed by the marker counts
/// as explained too.
fn only_already_exists(output: &str) -> bool {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if !lines.iter().any(|line| line.contains(ALREADY_EXISTS)) {
        return false;
    }

    lines.iter().enumerate().all(|(i, line)| {
        if !reports_error(line) || line.contains(ALREADY_EXISTS) {
            return true;
        }
        let is_header = ERROR_HEADERS.iter().any(|h| line.contains(h));
        is_header && lines.get(i + 1).is_some_and(|next| next.contains(ALREADY_EXISTS))
    })
}

fn reports_error(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    ["error", "denied", "failed", "exception"]
        .iter()
        .any(|word| lower.contains(word))
}

/// Last `OUTPUT_TAIL` bytes of `text`, on a char boundary.
fn tail(text: &str) -> &str {
    let mut start = text.len().saturating_sub(OUTPUT_TAIL);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
