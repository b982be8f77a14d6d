//! File input and output for runs.
//!
//! Identifier lists are read from the first column of a CSV file; results are
//! written as `SupporterID,Result` rows, flushed after every batch so partial
//! results survive an interrupted run.

mod id_reader;
mod sink;

pub use id_reader::{read_identifiers, IdentifierList, IDENTIFIER_LEN};
pub use sink::{CsvIdWriter, CsvResultSink, MemorySink, ResultSink, ID_HEADER, RESULT_HEADER};
