//! nestfs - browse files inside nested archives
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use nestfs::cli::{commands, Cli, Commands};
use nestfs::config::{Config, ConfigManager};
use nestfs::error::NestResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> NestResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // A broken file must not block `config init --force`
    let config = match config_manager.load().await {
        Ok(config) => config,
        Err(e) if matches!(cli.command, Commands::Config(_)) && e.is_configuration() => {
            init_logging(cli.verbose, &Config::default());
            tracing::warn!("Ignoring invalid configuration: {}", e);
            return commands::config(config_args(cli.command)?, &Config::default(), &config_manager)
                .await;
        }
        Err(e) => return Err(e),
    };
    init_logging(cli.verbose, &config);

    match cli.command {
        Commands::Cat(args) => commands::cat(args, &cli.root, &config).await,
        Commands::Ls(args) => commands::ls(args, &cli.root, &config).await,
        Commands::Stat(args) => commands::stat(args, &cli.root, &config).await,
        Commands::Inspect(args) => commands::inspect(args, &cli.root, &config).await,
        Commands::Config(args) => commands::config(args, &config, &config_manager).await,
    }
}

fn config_args(command: Commands) -> NestResult<nestfs::cli::args::ConfigArgs> {
    match command {
        Commands::Config(args) => Ok(args),
        _ => Err(nestfs::error::NestError::Internal("expected config command".into())),
    }
}

/// 0 = warn, 1 = info, 2+ = debug
fn init_logging(verbose: u8, config: &Config) {
    let filter = match verbose {
        0 => EnvFilter::new("nestfs=warn"),
        1 => EnvFilter::new("nestfs=info"),
        _ => EnvFilter::new("nestfs=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();
    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
