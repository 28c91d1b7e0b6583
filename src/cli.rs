//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::operation::Priority;

/// Backpressure-controlled operation queue for key-value stores
#[derive(Parser, Debug)]
#[command(name = "kv-backpressure")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "KV_BACKPRESSURE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "KV_BACKPRESSURE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "KV_BACKPRESSURE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drive the queue with set operations against the in-memory store
    LoadTest {
        /// Target submissions per second
        #[arg(long, default_value_t = 100)]
        rps: u32,

        /// Seconds to keep submitting
        #[arg(long, default_value_t = 60)]
        duration: u64,

        /// Priority of generated requests
        #[arg(long, value_enum, default_value_t = CliPriority::Normal)]
        priority: CliPriority,
    },

    /// Run a single health round-trip against the in-memory store
    Probe,

    /// Print the effective configuration as YAML
    Config,
}

/// Priority tier accepted on the command line
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliPriority {
    /// Lowest tier
    Low,
    /// Default tier
    Normal,
    /// Ahead of normal traffic
    High,
    /// Ahead of everything
    Critical,
}

impl From<CliPriority> for Priority {
    fn from(p: CliPriority) -> Self {
        match p {
            CliPriority::Low => Self::Low,
            CliPriority::Normal => Self::Normal,
            CliPriority::High => Self::High,
            CliPriority::Critical => Self::Critical,
        }
    }
}
