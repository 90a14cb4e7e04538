//! Resumable subtitle translation.
//!
//! Entries are segmented into sentence-aligned units, sent through a retrying
//! translation client, checkpointed per chunk and rebuilt into timed entries.

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod job;
pub mod model;
pub mod reconstruct;
pub mod segment;
pub mod srt;
pub mod translate;
