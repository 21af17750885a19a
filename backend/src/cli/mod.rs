//! CLI modules for dump-keeper.

pub mod commands;
pub mod runner;

pub use commands::{Cli, Command};
pub use runner::{load_config, run};
