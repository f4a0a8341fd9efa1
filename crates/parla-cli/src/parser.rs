//! Root CLI parser and global options.

use clap::Parser;

use crate::commands::Commands;

/// Speak text through a streaming speech server.
#[derive(Parser)]
#[command(name = "parla")]
#[command(about = "Speak text through an OpenAI-compatible speech server")]
#[command(version)]
pub struct Cli {
    /// Synthesis endpoint (overrides PARLA_TTS_ENDPOINT)
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Enable verbose/debug output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}
