//! Command-line interface for annotation-validator.
//!
//! Provides the `run` command that migrates a local project into a
//! validated copy.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Action, Cli, Commands, RunArgs};
