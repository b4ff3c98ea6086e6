//! Main binary entry point for the `junknas` command-line interface.

use clap::Parser;
use junknas_core::cli::{Cli, Commands};
use junknas_core::Result;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Mount(args) => junknas_core::cli::mount::run(args),
        Commands::GcDryRun(args) => junknas_core::cli::gc_dry_run::run(args),
        Commands::Stat(args) => junknas_core::cli::stat::run(args),
    }
}