//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{ClassifierKind, Config, ConfigManager};
use crate::error::{NestError, NestResult};
use crate::ui::{self, UiContext};
use std::path::PathBuf;

/// Keys accepted by `config set`
const VALID_KEYS: &[&str] = &[
    "general.log_format",
    "cache.allow_direct_open",
    "cache.reuse_failed_result",
    "cache.max_memory_snapshot_bytes",
    "cache.max_temp_snapshot_bytes",
    "cache.eviction_secs",
    "cache.check_interval_secs",
    "cache.open_retry_limit",
    "cache.classifier",
    "paths.normalize_separators",
    "paths.case_insensitive_root",
    "temp.enabled",
    "temp.dir",
    "loaders.enabled",
];

/// Execute the config command
pub async fn execute(args: ConfigArgs, config: &Config, manager: &ConfigManager) -> NestResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => set_value(manager, config, &key, &value).await?,
    }
    Ok(())
}

fn show_config(config: &Config) -> NestResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> NestResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok(&ctx, &format!("Configuration initialized at {}", path.display()));
    Ok(())
}

async fn set_value(manager: &ConfigManager, config: &Config, key: &str, value: &str) -> NestResult<()> {
    let ctx = UiContext::detect();
    let mut config = config.clone();

    if let Err(e) = apply(&mut config, key, value) {
        if !VALID_KEYS.contains(&key) {
            ui::step_error_detail(&ctx, "Unknown config key", key);
            ui::remark(&ctx, &format!("Valid keys: {}", VALID_KEYS.join(", ")));
        }
        return Err(e);
    }
    config.validate(manager.path())?;

    manager.save(&config).await?;
    ui::step_ok(&ctx, &format!("Set {} = {}", key, value));
    Ok(())
}

/// Assign one dotted key
fn apply(config: &mut Config, key: &str, value: &str) -> NestResult<()> {
    let parts: Vec<&str> = key.split('.').collect();
    match parts.as_slice() {
        ["general", "log_format"] => config.general.log_format = value.to_string(),

        ["cache", "allow_direct_open"] => config.cache.allow_direct_open = parse_bool(value)?,
        ["cache", "reuse_failed_result"] => config.cache.reuse_failed_result = parse_bool(value)?,
        ["cache", "max_memory_snapshot_bytes"] => {
            config.cache.max_memory_snapshot_bytes = parse_number(value)?
        }
        ["cache", "max_temp_snapshot_bytes"] => {
            config.cache.max_temp_snapshot_bytes = optional(value, parse_number)?
        }
        ["cache", "eviction_secs"] => config.cache.eviction_secs = parse_number(value)?,
        ["cache", "check_interval_secs"] => {
            config.cache.check_interval_secs = optional(value, parse_number)?
        }
        ["cache", "open_retry_limit"] => config.cache.open_retry_limit = parse_number(value)?,
        ["cache", "classifier"] => {
            config.cache.classifier = match value {
                "suppress-unsuitable" => ClassifierKind::SuppressUnsuitable,
                "always-throw" => ClassifierKind::AlwaysThrow,
                _ => {
                    return Err(NestError::User(format!(
                        "Invalid classifier: {value}. Use suppress-unsuitable or always-throw"
                    )))
                }
            }
        }

        ["paths", "normalize_separators"] => config.paths.normalize_separators = parse_bool(value)?,
        ["paths", "case_insensitive_root"] => {
            config.paths.case_insensitive_root = parse_bool(value)?
        }

        ["temp", "enabled"] => config.temp.enabled = parse_bool(value)?,
        ["temp", "dir"] => config.temp.dir = optional(value, |v| Ok(PathBuf::from(v)))?,

        ["loaders", "enabled"] => {
            config.loaders.enabled = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        _ => return Err(NestError::User(format!("Unknown config key: {key}"))),
    }
    Ok(())
}

/// Empty string or `none` clears an optional key
fn optional<T>(value: &str, parse: impl FnOnce(&str) -> NestResult<T>) -> NestResult<Option<T>> {
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        parse(value).map(Some)
    }
}

fn parse_bool(value: &str) -> NestResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(NestError::User(format!(
            "Invalid boolean value: {value}. Use true/false"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> NestResult<T> {
    value
        .parse()
        .map_err(|_| NestError::User(format!("Invalid number: {value}")))
}
