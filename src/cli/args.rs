//! CLI argument definitions using clap
//!
//! Commands:
//! - streamrelay serve [--config <path>]
//! - streamrelay bench --api-key <key> [--url <url>] [--users N] [--messages N]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// streamrelay - durable real-time stream relay
#[derive(Parser, Debug)]
#[command(name = "streamrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay
    Serve {
        /// Path to a JSON configuration file
        #[arg(long, env = "STREAMRELAY_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Load-test a running relay
    Bench {
        /// Base URL of the relay
        #[arg(long, default_value = "http://localhost:8000")]
        url: String,

        /// API key sent in the X-API-Key header
        #[arg(long, env = "API_KEY")]
        api_key: String,

        /// Concurrent simulated users, one stream each
        #[arg(long, default_value_t = 1000)]
        users: usize,

        /// Messages sent by each user
        #[arg(long, default_value_t = 10)]
        messages: usize,

        /// Attempts per message before counting it as failed
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
