//! CLI module
//!
//! Command-line interface and configuration for a DHT node.

pub mod args;
pub mod config;

pub use args::CliArgs;
pub use config::Configuration;
