//! streamrelay entry point
//!
//! Parses arguments, runs the command, prints errors to stderr and exits
//! non-zero on failure. Everything else lives in the `cli` module.

use streamrelay::cli;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run().await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
