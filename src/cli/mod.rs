//! CLI commands
//!
//! - `serve`: run the HTTP API
//! - `health`: run every probe once and print the snapshot
//! - `init-db`: create the catalog schema, optionally with sample rows

pub mod commands;
