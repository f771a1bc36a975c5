//! Strata CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use strata::cli::Cli;

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // Initialize tracing, logs go to stderr so stdout stays machine readable
    let filter =
        EnvFilter::from_default_env().add_directive(format!("strata={}", config.log_level).parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }

    // Execute command
    cli.execute(config)
}
