//! Inspect command - open packages and show the cache snapshot

use super::format_size;
use crate::cache::{PackageInfo, PackageState};
use crate::cli::args::{InspectArgs, OutputFormat};
use crate::cli::{blocking, open_cache};
use crate::config::Config;
use crate::error::{NestError, NestResult};
use crate::ui::{self, UiContext};
use console::style;
use std::path::Path;

/// Execute the inspect command
pub async fn execute(args: InspectArgs, root: &Path, config: &Config) -> NestResult<()> {
    let root = root.to_path_buf();
    let config = config.clone();
    let paths = args.paths.clone();
    let (infos, failures) = blocking(move || {
        let cache = open_cache(&root, &config)?;
        let mut handles = Vec::new();
        let mut failures = Vec::new();
        for path in &paths {
            match cache.open_package(path) {
                Ok(Some(handle)) => handles.push(handle),
                Ok(None) => {}
                Err(e) => failures.push((path.clone(), e)),
            }
        }

        // ancestors opened on the way show up too
        let mut infos = cache.package_infos();
        for path in &paths {
            let info = cache.package_info(path);
            if !infos.iter().any(|i| i.path() == info.path()) {
                infos.push(info);
            }
        }
        drop(handles);
        cache.dispose()?;
        Ok((infos, failures))
    })
    .await?;

    match args.format {
        OutputFormat::Table => print_table(&infos),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&infos)?),
        OutputFormat::Plain => {
            for info in &infos {
                println!("{}\t{}", info.path(), info.state);
            }
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    let ctx = UiContext::detect();
    for (path, error) in &failures {
        if matches!(args.format, OutputFormat::Table) {
            ui::step_error_detail(&ctx, path, &error.to_string());
        }
    }
    Err(NestError::User(format!(
        "{} package(s) failed to open",
        failures.len()
    )))
}

fn print_table(infos: &[PackageInfo]) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, "Packages");

    println!(
        "{:<40} {:<12} {:>10} {:<20}",
        style("PATH").bold(),
        style("STATE").bold(),
        style("ESTIMATE").bold(),
        style("LOADED").bold()
    );
    println!("{}", "-".repeat(85));

    for info in infos {
        let state = info.state.to_string();
        let state_styled = match info.state {
            PackageState::Opened => style(state).green(),
            PackageState::Error => style(state).red(),
            PackageState::NotPackage => style(state).yellow(),
            _ => style(state).dim(),
        };
        let loaded = info
            .load_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:<12} {:>10} {:<20}",
            info.path(),
            state_styled,
            format_size(Some(info.size_estimate)),
            loaded
        );
        if let Some(error) = &info.error {
            ui::remark(&ctx, &error.to_string());
        }
    }

    println!();
    println!("{} package(s)", infos.len());
}
