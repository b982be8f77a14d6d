//! Destinations for result rows.
//!
//! Unlike a temp-file-and-rename writer, these write straight to the
//! destination and flush after every batch, so an interrupted run leaves every
//! completed batch on disk.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use csv::Writer;

use crate::batch::operation::ResultRow;
use crate::error::AppError;

/// Header of the result CSV.
pub const RESULT_HEADER: [&str; 2] = ["SupporterID", "Result"];

/// Header of a bare identifier list.
pub const ID_HEADER: [&str; 1] = ["SupporterID"];

/// Receives result rows from concurrent workers.
///
/// `write_rows` is called once per batch and must write the whole slice
/// without interleaving rows from another call.
pub trait ResultSink: Send + Sync {
    fn write_rows(&self, rows: &[ResultRow]) -> Result<(), AppError>;

    fn flush(&self) -> Result<(), AppError> {
        Ok(())
    }
}

fn create_writer(path: &Path) -> Result<Writer<BufWriter<File>>, AppError> {
    let file = File::create(path).map_err(|e| {
        AppError::Io(format!("Failed to create {}: {}", path.display(), e))
    })?;
    Ok(Writer::from_writer(BufWriter::new(file)))
}

// ─────────────────────────────────────────────────────────────────────────────
// CsvResultSink
// ─────────────────────────────────────────────────────────────────────────────

/// Writes `SupporterID,Result` rows to a CSV file.
///
/// The file is truncated and the header written on creation. The `detail`
/// of error rows is not written.
pub struct CsvResultSink {
    writer: Mutex<Writer<BufWriter<File>>>,
    path: PathBuf,
}

impl CsvResultSink {
    /// Creates (or truncates) `path` and writes the header.
    ///
    /// # Errors
    ///
    /// `AppError::Io` if the file cannot be created, `AppError::Csv` if the
    /// header cannot be written.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        let mut writer = create_writer(&path)?;
        writer.write_record(RESULT_HEADER)?;
        writer.flush()?;

        Ok(Self {
            writer: Mutex::new(writer),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Writer<BufWriter<File>>>, AppError> {
        // A writer poisoned mid-batch may hold a partial record.
        self.writer
            .lock()
            .map_err(|_| AppError::Internal("result writer poisoned".to_string()))
    }
}

impl ResultSink for CsvResultSink {
    fn write_rows(&self, rows: &[ResultRow]) -> Result<(), AppError> {
        let mut writer = self.lock()?;
        for row in rows {
            writer.write_record([row.identifier.as_str(), row.status.as_str()])?;
        }
        writer.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AppError> {
        self.lock()?.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for CsvResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvResultSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemorySink
// ─────────────────────────────────────────────────────────────────────────────

/// Collects rows in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<Vec<ResultRow>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the rows written so far, in write order.
    pub fn rows(&self) -> Vec<ResultRow> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ResultSink for MemorySink {
    fn write_rows(&self, rows: &[ResultRow]) -> Result<(), AppError> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(rows);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CsvIdWriter
// ─────────────────────────────────────────────────────────────────────────────

/// Writes a one-column `SupporterID` list, appended page by page.
pub struct CsvIdWriter {
    writer: Writer<BufWriter<File>>,
    written: u64,
}

impl CsvIdWriter {
    /// Creates (or truncates) `path` and writes the header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let mut writer = create_writer(path.as_ref())?;
        writer.write_record(ID_HEADER)?;
        writer.flush()?;
        Ok(Self { writer, written: 0 })
    }

    /// Appends `ids` and flushes.
    pub fn append<I, S>(&mut self, ids: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            self.writer.write_record([id.as_ref()])?;
            self.written += 1;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes and closes the file, returning the number of ids written.
    pub fn finish(mut self) -> Result<u64, AppError> {
        self.writer.flush()?;
        Ok(self.written)
    }
}
