//! Command-line interface

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Origin Guard - TLS origin protection behind a CDN
#[derive(Parser, Debug)]
#[command(name = "origin-guard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "ORIGIN_GUARD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "ORIGIN_GUARD_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "ORIGIN_GUARD_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "ORIGIN_GUARD_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "ORIGIN_GUARD_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the origin server (default)
    Serve,

    /// Fetch and print the CDN edge ranges
    Ranges {
        /// Report whether this address is inside the ranges
        #[arg(long)]
        check: Option<IpAddr>,
    },
}
