// ABOUTME: Library module for molt
// ABOUTME: Exports the fetch and verify pipelines for use in the binary and tests

pub mod commands;
pub mod config;
pub mod datum;
pub mod dbconn;
pub mod dbtable;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod rowiterator;
pub mod utils;
pub mod verify;
