//! LOAN-CYCLE: scheduled margin loan runner.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod plan;
pub mod exchange;
pub mod engine;
