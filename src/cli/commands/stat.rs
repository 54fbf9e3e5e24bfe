//! Stat command - describe one path

use super::{format_size, kind};
use crate::cli::args::{OutputFormat, StatArgs};
use crate::cli::{blocking, open_cache};
use crate::config::Config;
use crate::error::{NestError, NestResult};
use crate::provider::FileProvider;
use crate::ui::{self, UiContext};
use std::path::Path;

/// Execute the stat command
pub async fn execute(args: StatArgs, root: &Path, config: &Config) -> NestResult<()> {
    let root = root.to_path_buf();
    let config = config.clone();
    let path = args.path.clone();
    let info = blocking(move || {
        let cache = open_cache(&root, &config)?;
        let info = cache.file_info(&path)?;
        cache.dispose()?;
        Ok(info)
    })
    .await?;

    if !info.exists {
        return Err(NestError::NotFound(args.path));
    }

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
        OutputFormat::Plain => println!("{}\t{}\t{}", info.path, kind(&info), info.length.unwrap_or(0)),
        OutputFormat::Table => {
            let ctx = UiContext::detect();
            ui::intro(&ctx, &info.path);
            ui::key_value(&ctx, "Name", &info.name);
            ui::key_value(&ctx, "Type", kind(&info));
            ui::key_value(&ctx, "Size", &format_size(info.length));
            if let Some(modified) = info.last_modified {
                ui::key_value(&ctx, "Modified", &modified.to_rfc3339());
            }
            if let Some(physical) = &info.physical_path {
                ui::key_value(&ctx, "On disk", &physical.display().to_string());
            }
        }
    }
    Ok(())
}
