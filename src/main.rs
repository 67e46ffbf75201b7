//! Kolosal Deploy - Main Entry Point
//!
//! Simulates traffic through the routing and monitoring engine.

use clap::Parser;
use kolosal_deploy::cli::{cmd_config, cmd_simulate, load_config, Cli, Commands, SimulateOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kolosal_deploy=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            requests,
            features,
            reference,
            shift,
            shift_after,
            concept_drift,
            strategy,
            candidate,
            retrain,
            min_samples,
            seed,
            json,
        } => {
            let opts = SimulateOptions {
                requests,
                features,
                reference,
                shift,
                shift_after,
                concept_drift,
                strategy,
                candidate,
                retrain,
                min_samples,
                seed,
                json,
            };
            cmd_simulate(config, opts).await?;
        }
        Commands::Config => {
            cmd_config(&config)?;
        }
    }

    Ok(())
}
