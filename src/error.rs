//! Typed errors for each pipeline stage.
//!
//! Every stage boundary returns its own error kind so the orchestrator can
//! turn it into a skip-and-continue decision. Only [`ConfigError`] is fatal,
//! and only at startup.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::downstream::DownstreamStep;

/// Failure of a single feed poll.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Network error, timeout or non-2xx response.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// The response body could not be decoded into records.
    #[error("parse error: {0}")]
    Parse(String),
}

/// Failure of [`AggregationBuffer::flush`](crate::buffer::AggregationBuffer::flush).
#[derive(Debug, Error)]
pub enum FlushError {
    /// Nothing buffered. Recoverable, signals a skip.
    #[error("buffer is empty, nothing to flush")]
    EmptyBuffer,

    #[error("failed to write artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize artifact: {0}")]
    Csv(#[from] csv::Error),
}

/// Failure to persist an artifact to object storage.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The local artifact does not exist. Never retried.
    #[error("artifact not found: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("failed to read artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Storage(String),

    /// The retry budget ran out; carries the last cause.
    #[error("upload failed after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        last: Box<UploadError>,
    },
}

impl UploadError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            UploadError::MissingArtifact(_) | UploadError::Exhausted { .. }
        )
    }
}

/// Failure of one downstream transformation step.
#[derive(Debug, Error)]
#[error("downstream step {step} failed: {kind}")]
pub struct DownstreamError {
    pub step: DownstreamStep,
    pub kind: DownstreamErrorKind,
}

#[derive(Debug, Error)]
pub enum DownstreamErrorKind {
    #[error("could not start transformation tool: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("exited with {code:?}: {output}")]
    ExitStatus { code: Option<i32>, output: String },
}

impl DownstreamError {
    pub fn new(step: DownstreamStep, kind: impl Into<DownstreamErrorKind>) -> Self {
        Self {
            step,
            kind: kind.into(),
        }
    }
}

/// Missing or malformed configuration, discovered at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
