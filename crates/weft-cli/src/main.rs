//! Weft command-line entry point.
//!
//! Binary name: `weft`
//!
//! Parses CLI arguments, sets up tracing, then dispatches to the command
//! handler.

mod cli;

use clap::Parser;
use weft_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        json: cli.log_json,
        otel: cli.otel,
        ..TracingOptions::for_verbosity(cli.verbose)
    };
    init_tracing(&options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let outcome = match cli.command {
        Commands::Run {
            file,
            input,
            context,
            config,
        } => cli::run::handle_run(&file, input.as_deref(), &context, &config, cli.json).await,
        Commands::Validate { file } => cli::inspect::handle_validate(&file, cli.json).await,
        Commands::Inspect { file } => cli::inspect::handle_inspect(&file, cli.json).await,
    };

    shutdown_tracing();
    outcome
}
