//! dump-keeper - Backend Library
//!
//! Metadata for database dump artifacts: a record model, two interchangeable
//! stores (JSON file and SQLite), migration between them, and a recovery
//! scanner that rebuilds records from the artifacts themselves.

#[macro_use]
mod macros;

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
