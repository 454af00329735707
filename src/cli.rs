use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "transcoded")]
#[command(author, version, about = "Request-scoped media transcoding service")]
pub struct Cli {
    /// Path to config file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP transcoding server
    Start {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config and $PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Check that ffmpeg is available
    CheckTools,

    /// Validate a configuration file
    Validate {
        /// Config file to validate (uses --config or defaults if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
