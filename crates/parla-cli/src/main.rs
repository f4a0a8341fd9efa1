//! CLI entry point - the composition root.
//!
//! Resolves configuration (`.env`, `PARLA_TTS_*` variables, then flags)
//! and dispatches to the command handlers.

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use parla_cli::commands::apply_overrides;
use parla_cli::{Cli, Commands, handlers};
use parla_tts::TtsConfig;

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "parla_cli=debug,parla_tts=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = TtsConfig::from_env().context("invalid PARLA_TTS_* environment")?;

    match cli.command {
        Commands::Say(args) => {
            let config = apply_overrides(config, cli.endpoint, args.format, args.buffered);
            config.validate()?;
            handlers::say::execute(config, args).await
        }
        Commands::Fetch(args) => {
            let config = apply_overrides(config, cli.endpoint, args.format, false);
            config.validate()?;
            handlers::fetch::execute(config, args).await
        }
    }
}
