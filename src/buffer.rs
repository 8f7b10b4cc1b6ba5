//! Aggregation buffer: accumulates poll batches into a window and flushes the
//! window to a CSV artifact.
//!
//! Window state sits behind a mutex. `flush` holds the lock across snapshot,
//! write and clear, so a batch added concurrently lands either in the flushed
//! artifact or in the next window, never both and never neither.

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::FlushError;
use crate::output::write_artifact;
use crate::record::PositionRecord;

/// Subdirectory of the data dir holding the artifacts that get uploaded.
pub const SILVER_DIR: &str = "silver";
/// Subdirectory holding the untouched copy of every artifact.
pub const BRONZE_DIR: &str = "bronze";

/// Observable state of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Accumulating,
    Full,
}

/// Read-only snapshot returned by [`AggregationBuffer::status`].
#[derive(Debug, Clone, PartialEq)]
pub struct BufferStatus {
    pub batch_count: usize,
    pub target_batch_count: usize,
    pub record_count: usize,
    pub window_started_at: Option<DateTime<Utc>>,
    pub elapsed_since_window_start: Option<Duration>,
    pub is_complete: bool,
}

impl BufferStatus {
    pub fn state(&self) -> BufferState {
        if self.is_complete {
            BufferState::Full
        } else {
            BufferState::Accumulating
        }
    }
}

/// A flushed window on local disk. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: PathBuf,
    pub file_name: String,
    pub row_count: usize,
    pub batch_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Window {
    batches: Vec<Vec<PositionRecord>>,
    started: Option<(DateTime<Utc>, Instant)>,
}

impl Window {
    fn record_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

pub struct AggregationBuffer {
    target_batch_count: usize,
    silver_dir: PathBuf,
    bronze_dir: PathBuf,
    window: Mutex<Window>,
}

impl AggregationBuffer {
    /// Creates an empty buffer writing artifacts under `data_dir/silver`, with
    /// a copy under `data_dir/bronze`. Both directories are created.
    ///
    /// A `target_batch_count` of zero is treated as one.
    pub fn new(target_batch_count: usize, data_dir: impl AsRef<Path>) -> io::Result<Self> {
        let silver_dir = data_dir.as_ref().join(SILVER_DIR);
        let bronze_dir = data_dir.as_ref().join(BRONZE_DIR);
        fs::create_dir_all(&silver_dir)?;
        fs::create_dir_all(&bronze_dir)?;

        info!(
            target_batch_count,
            data_dir = %data_dir.as_ref().display(),
            "Aggregation buffer initialized"
        );

        Ok(Self {
            target_batch_count: target_batch_count.max(1),
            silver_dir,
            bronze_dir,
            window: Mutex::new(Window::default()),
        })
    }

    pub fn target_batch_count(&self) -> usize {
        self.target_batch_count
    }

    /// Appends one poll's records as a batch and returns whether the window
    /// is complete.
    ///
    /// An empty `records` is a no-op: it neither counts toward the window nor
    /// starts it.
    pub fn add_batch(&self, records: Vec<PositionRecord>) -> bool {
        let mut window = self.lock();

        if records.is_empty() {
            debug!("Empty batch ignored");
            return window.batches.len() >= self.target_batch_count;
        }

        if window.started.is_none() {
            let now = Utc::now();
            window.started = Some((now, Instant::now()));
            info!(window_start = %now, "Starting new window");
        }

        let rows = records.len();
        window.batches.push(records);

        let batch_count = window.batches.len();
        let is_complete = batch_count >= self.target_batch_count;
        info!(
            rows,
            batch_count,
            target = self.target_batch_count,
            "Batch added to window"
        );
        if is_complete {
            let elapsed = window.started.map(|(_, at)| at.elapsed().as_secs_f64());
            info!(batch_count, elapsed_secs = elapsed, "Window complete");
        }
        is_complete
    }

    pub fn status(&self) -> BufferStatus {
        let window = self.lock();
        let batch_count = window.batches.len();
        BufferStatus {
            batch_count,
            target_batch_count: self.target_batch_count,
            record_count: window.record_count(),
            window_started_at: window.started.map(|(at, _)| at),
            elapsed_since_window_start: window.started.map(|(_, at)| at.elapsed()),
            is_complete: batch_count >= self.target_batch_count,
        }
    }

    /// Writes every buffered record, batches in arrival order, to a new
    /// artifact and resets the window.
    ///
    /// # Errors
    ///
    /// [`FlushError::EmptyBuffer`] if nothing is buffered. On a write error
    /// the window is left untouched so the next flush can try again.
    #[tracing::instrument(skip(self))]
    pub fn flush(&self) -> Result<Artifact, FlushError> {
        let mut window = self.lock();
        if window.batches.is_empty() {
            return Err(FlushError::EmptyBuffer);
        }

        let created_at = Utc::now();
        let file_name = self.unique_name(created_at);
        let path = self.silver_dir.join(&file_name);

        let row_count = match write_artifact(&path, window.batches.iter().flatten()) {
            Ok(rows) => rows,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };

        let bronze_path = self.bronze_dir.join(&file_name);
        if let Err(e) = fs::copy(&path, &bronze_path) {
            warn!(path = %bronze_path.display(), error = %e, "Failed to write bronze copy");
        }

        let batch_count = window.batches.len();
        *window = Window::default();
        drop(window);

        info!(
            path = %path.display(),
            rows = row_count,
            batches = batch_count,
            "Window flushed to artifact"
        );

        Ok(Artifact {
            path,
            file_name,
            row_count,
            batch_count,
            created_at,
        })
    }

    /// `brt_data_YYYYmmdd_HHMMSS.csv`, suffixed `-N` if that name is taken.
    fn unique_name(&self, at: DateTime<Utc>) -> String {
        let stem = format!("brt_data_{}", at.format("%Y%m%d_%H%M%S"));
        let mut name = format!("{stem}.csv");
        let mut n = 1;
        while self.silver_dir.join(&name).exists() {
            name = format!("{stem}-{n}.csv");
            n += 1;
        }
        name
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
