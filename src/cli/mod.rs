//! CLI module for streamrelay
//!
//! Provides command-line interface for:
//! - serve: run the relay until Ctrl-C
//! - bench: load-test a running relay

mod args;
pub mod bench;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{run_command, serve};
pub use errors::{CliError, CliResult};

/// Parse arguments and run the selected command
pub async fn run() -> CliResult<()> {
    run_command(Cli::parse_args().command).await
}
