//! Artifact serialization: a flat CSV table with a header row.

use csv::{ReaderBuilder, WriterBuilder};
use std::fs::File;
use std::path::Path;
use tracing::debug;

use crate::error::FlushError;
use crate::record::PositionRecord;

/// Writes `records` to a new CSV file at `path`, replacing any existing file.
///
/// Returns the number of rows written. The header row is always present,
/// even for an empty input.
pub fn write_artifact<'a, I>(path: &Path, records: I) -> Result<usize, FlushError>
where
    I: IntoIterator<Item = &'a PositionRecord>,
{
    let file = File::create(path)?;
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
    writer.write_record(crate::record::COLUMNS)?;

    let mut rows = 0;
    for record in records {
        writer.serialize(record)?;
        rows += 1;
    }
    writer.flush()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

    debug!(path = %path.display(), rows, "Artifact written");
    Ok(rows)
}

/// Parses an artifact back into records, in file order.
pub fn read_artifact(path: &Path) -> Result<Vec<PositionRecord>, csv::Error> {
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
    reader.deserialize().collect()
}
