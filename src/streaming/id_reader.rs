//! Reading supporter identifiers from a CSV file.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use csv::ReaderBuilder;
use tracing::{info, warn};

use crate::error::AppError;

/// Length of a supporter UUID in its canonical text form.
pub const IDENTIFIER_LEN: usize = 36;

/// Identifiers read from a file, plus what was skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierList {
    pub identifiers: Vec<String>,
    /// Rows whose first column was missing or not a 36-character identifier.
    /// Includes the header row when there is one.
    pub skipped: usize,
}

/// Reads the first column of every row of `path`, keeping values that are
/// exactly 36 characters long after trimming. Order and duplicates are kept.
///
/// Rows may have differing numbers of columns. Any header row is skipped
/// by the length filter.
///
/// # Errors
///
/// `AppError::Io` if the file cannot be opened, `AppError::Csv` if it is not
/// valid CSV.
pub fn read_identifiers(path: impl AsRef<Path>) -> Result<IdentifierList, AppError> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| AppError::Io(format!("Failed to open {}: {}", path.display(), e)))?;

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let mut list = IdentifierList::default();
    for record in reader.records() {
        let record = record?;
        match record.get(0).map(str::trim) {
            Some(id) if id.chars().count() == IDENTIFIER_LEN => {
                list.identifiers.push(id.to_string())
            }
            _ => list.skipped += 1,
        }
    }

    if list.skipped > 0 {
        warn!(
            "[SINK] {}: skipped {} rows without a valid identifier",
            path.display(),
            list.skipped
        );
    }
    info!(
        "[SINK] Read {} identifiers from {}",
        list.identifiers.len(),
        path.display()
    );

    Ok(list)
}
