//! Bulk supporter operations against the Engage Integration API.
//!
//! The pieces, bottom up:
//!
//! - [`engage::RateLimitedClient`] sends one request and absorbs rate limiting
//!   by sleeping and retrying.
//! - [`batch::BatchProcessor`] splits an identifier list into batches and
//!   runs a [`batch::BatchOperation`] over them with a fixed worker pool.
//! - [`streaming`] reads identifier files and writes result CSVs.
//! - [`commands`] wires these together for the `engage-bulk` binary.

pub mod batch;
pub mod commands;
pub mod config;
pub mod engage;
pub mod error;
pub mod streaming;
