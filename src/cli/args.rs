//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// nestfs - browse files inside nested archives
///
/// Paths are flat: `bundle.zip/lib/inner.tar.gz/inner.tar/README` walks
/// through every archive on the way.
#[derive(Parser, Debug)]
#[command(name = "nestfs")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "NESTFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory the paths are resolved against
    #[arg(short, long, global = true, default_value = ".")]
    pub root: PathBuf,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a file to stdout
    Cat(CatArgs),

    /// List a directory or package
    Ls(LsArgs),

    /// Show file information
    Stat(StatArgs),

    /// Open packages and show their cache state
    Inspect(InspectArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the cat command
#[derive(Parser, Debug)]
pub struct CatArgs {
    /// File path, possibly inside packages
    pub path: String,
}

/// Arguments for the ls command
#[derive(Parser, Debug)]
pub struct LsArgs {
    /// Directory or package to list (defaults to the root)
    #[arg(default_value = "")]
    pub path: String,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the stat command
#[derive(Parser, Debug)]
pub struct StatArgs {
    /// Path to describe
    pub path: String,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the inspect command
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Package paths to open
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., cache.eviction_secs)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_cat() {
        let cli = Cli::parse_from(["nestfs", "cat", "a.zip/b.txt"]);
        match cli.command {
            Commands::Cat(args) => assert_eq!(args.path, "a.zip/b.txt"),
            _ => panic!("expected Cat command"),
        }
        assert_eq!(cli.root, PathBuf::from("."));
    }

    #[test]
    fn cli_parses_ls_defaults() {
        let cli = Cli::parse_from(["nestfs", "ls"]);
        match cli.command {
            Commands::Ls(args) => {
                assert_eq!(args.path, "");
                assert!(matches!(args.format, OutputFormat::Table));
            }
            _ => panic!("expected Ls command"),
        }
    }

    #[test]
    fn cli_parses_global_flags_after_command() {
        let cli = Cli::parse_from(["nestfs", "stat", "x.tar", "-f", "json", "-vv", "-r", "/data"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.root, PathBuf::from("/data"));
        match cli.command {
            Commands::Stat(args) => assert!(matches!(args.format, OutputFormat::Json)),
            _ => panic!("expected Stat command"),
        }
    }

    #[test]
    fn cli_requires_inspect_paths() {
        assert!(Cli::try_parse_from(["nestfs", "inspect"]).is_err());
        let cli = Cli::parse_from(["nestfs", "inspect", "a.zip", "b.zip/c.tar"]);
        match cli.command {
            Commands::Inspect(args) => assert_eq!(args.paths.len(), 2),
            _ => panic!("expected Inspect command"),
        }
    }

    #[test]
    fn cli_parses_config_set() {
        let cli = Cli::parse_from(["nestfs", "config", "set", "cache.eviction_secs", "30"]);
        match cli.command {
            Commands::Config(ConfigArgs {
                action: Some(ConfigAction::Set { key, value }),
            }) => {
                assert_eq!(key, "cache.eviction_secs");
                assert_eq!(value, "30");
            }
            _ => panic!("expected Config Set command"),
        }
    }
}
