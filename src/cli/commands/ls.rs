//! Ls command - list a directory or package

use super::{format_size, kind};
use crate::cli::args::{LsArgs, OutputFormat};
use crate::cli::{blocking, open_cache};
use crate::config::Config;
use crate::error::{NestError, NestResult};
use crate::provider::{FileInfo, FileProvider};
use crate::ui::{self, UiContext};
use console::style;
use std::path::Path;

/// Execute the ls command
pub async fn execute(args: LsArgs, root: &Path, config: &Config) -> NestResult<()> {
    let root = root.to_path_buf();
    let config = config.clone();
    let path = args.path.clone();
    let entries = blocking(move || {
        let cache = open_cache(&root, &config)?;
        let contents = cache.directory_contents(&path)?;
        cache.dispose()?;
        if !contents.exists {
            return Err(NestError::NotFound(path));
        }
        Ok(contents.entries)
    })
    .await?;

    match args.format {
        OutputFormat::Table => print_table(&args.path, &entries),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.path);
            }
        }
    }
    Ok(())
}

fn print_table(path: &str, entries: &[FileInfo]) {
    let ctx = UiContext::detect();
    let title = if path.is_empty() { "/" } else { path };
    ui::intro(&ctx, title);

    if entries.is_empty() {
        ui::step_info(&ctx, "Empty directory");
        return;
    }

    println!(
        "{:<40} {:<8} {:>10} {:<17}",
        style("NAME").bold(),
        style("TYPE").bold(),
        style("SIZE").bold(),
        style("MODIFIED").bold()
    );
    println!("{}", "-".repeat(78));

    for entry in entries {
        let kind_styled = match kind(entry) {
            "package" => style("package").cyan(),
            "dir" => style("dir").blue(),
            other => style(other),
        };
        let modified = entry
            .last_modified
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let size = if entry.is_package || !entry.is_directory {
            format_size(entry.length)
        } else {
            "-".to_string()
        };
        println!(
            "{:<40} {:<8} {:>10} {:<17}",
            entry.name, kind_styled, size, modified
        );
    }

    println!();
    println!("{} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
}
