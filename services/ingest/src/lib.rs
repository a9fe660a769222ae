//! ingest: the managed time-series write path.
//!
//! Exposes [`IngestWriter`] for in-process callers (the agent's managed
//! backend) and a thin standalone binary for running the write path behind
//! its own connection pool.

pub mod db;
pub mod error;
pub mod ingest;
pub mod repo;

pub use error::IngestError;
pub use ingest::{EntityRecord, EntityType, EventRecord, IngestOutcome, IngestWriter};
