//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for a DHT node
#[derive(Debug, Parser)]
#[command(name = "kademlia-node")]
#[command(about = "A Kademlia distributed hash table node", long_about = None)]
pub struct CliArgs {
    /// Node ID as 40 hex characters (random when omitted)
    #[arg(long, value_name = "HEX", conflicts_with = "name")]
    pub id: Option<String>,

    /// Derive the node ID from a name
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,

    /// Listener URL, e.g. udp://0.0.0.0:7400 (repeatable)
    #[arg(short, long, value_name = "URL")]
    pub listen: Vec<String>,

    /// Listener URL announced to peers (repeatable)
    #[arg(short, long, value_name = "URL")]
    pub advertise: Vec<String>,

    /// Seed peer as <hex id>@<url>[,<url>...] (repeatable)
    #[arg(short, long, value_name = "PEER")]
    pub bootstrap: Vec<String>,

    /// JSON configuration file; flags override its values
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Bucket size
    #[arg(short)]
    pub k: Option<usize>,

    /// Per-request timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub rpc_timeout_ms: Option<u64>,

    /// Deadline for --get in milliseconds
    #[arg(long, value_name = "MS")]
    pub get_timeout_ms: Option<u64>,

    /// Bucket refresh period in seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    pub refresh_interval_secs: Option<u64>,

    /// Key republish period in seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    pub republish_interval_secs: Option<u64>,

    /// Store a value after bootstrapping, as key=value (repeatable)
    #[arg(long, value_name = "KEY=VALUE")]
    pub put: Vec<String>,

    /// Look up a value after bootstrapping (repeatable)
    #[arg(long, value_name = "KEY")]
    pub get: Vec<String>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// `--put` arguments split into key and value
    pub fn puts(&self) -> anyhow::Result<Vec<(String, String)>> {
        self.put
            .iter()
            .map(|entry| {
                entry
                    .split_once('=')
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .ok_or_else(|| anyhow::anyhow!("Expected key=value, got {:?}", entry))
            })
            .collect()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
