//! Configuration schema for nestfs
//!
//! Configuration is stored at `~/.config/nestfs/config.toml`

use crate::error::{NestError, NestResult};
use crate::loader::STANDARD_LOADERS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Package cache behavior
    pub cache: CacheConfig,

    /// Root path normalization
    pub paths: PathsConfig,

    /// Temp-file snapshots
    pub temp: TempConfig,

    /// Package formats
    pub loaders: LoadersConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Error classifier presets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassifierKind {
    /// Unreadable packages behave like plain files
    #[default]
    SuppressUnsuitable,
    /// Every load failure is raised and cached
    AlwaysThrow,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Let loaders open physical files and parent streams directly
    pub allow_direct_open: bool,

    /// Replay cached failures instead of retrying the load
    pub reuse_failed_result: bool,

    /// Largest package copied into memory before loading
    pub max_memory_snapshot_bytes: u64,

    /// Largest package copied to a temp file (unset = unlimited)
    pub max_temp_snapshot_bytes: Option<u64>,

    /// Idle time before an unreferenced package is evicted (0 = never)
    pub eviction_secs: f64,

    /// Sweep interval (unset = eviction_secs / 3)
    pub check_interval_secs: Option<f64>,

    /// Attempts before giving up on an entry that keeps being evicted
    pub open_retry_limit: u32,

    /// How load failures are classified
    pub classifier: ClassifierKind,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            allow_direct_open: true,
            reuse_failed_result: true,
            max_memory_snapshot_bytes: 1024 * 1024 * 1024,
            max_temp_snapshot_bytes: None,
            eviction_secs: 15.0,
            check_interval_secs: None,
            open_retry_limit: 16,
            classifier: ClassifierKind::default(),
        }
    }
}

/// Root path normalization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Rewrite `\` to `/` in the outermost segment
    pub normalize_separators: bool,

    /// Lowercase the outermost segment
    pub case_insensitive_root: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            normalize_separators: true,
            case_insensitive_root: false,
        }
    }
}

/// Temp-file snapshot settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TempConfig {
    pub enabled: bool,

    /// Directory for snapshots (unset = system temp dir)
    pub dir: Option<PathBuf>,
}

/// Loader selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadersConfig {
    /// Loader names, in matching priority order
    pub enabled: Vec<String>,
}

impl Default for LoadersConfig {
    fn default() -> Self {
        Self {
            enabled: STANDARD_LOADERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn check_secs(path: &Path, key: &str, value: f64) -> NestResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(NestError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: format!("{key} must be a non-negative number of seconds, got {value}"),
        });
    }
    Ok(())
}

impl Config {
    /// Check values serde cannot. `path` names the file in errors.
    pub fn validate(&self, path: &Path) -> NestResult<()> {
        let invalid = |reason: String| NestError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        };

        if self.loaders.enabled.is_empty() {
            return Err(NestError::NoLoaders);
        }
        if let Some(unknown) = self
            .loaders
            .enabled
            .iter()
            .find(|name| !STANDARD_LOADERS.contains(&name.as_str()))
        {
            return Err(invalid(format!(
                "unknown loader '{unknown}' (available: {})",
                STANDARD_LOADERS.join(", ")
            )));
        }

        check_secs(path, "cache.eviction_secs", self.cache.eviction_secs)?;
        if let Some(interval) = self.cache.check_interval_secs {
            check_secs(path, "cache.check_interval_secs", interval)?;
        }
        if self.cache.open_retry_limit == 0 {
            return Err(invalid("cache.open_retry_limit must be at least 1".into()));
        }
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(invalid(format!(
                "general.log_format must be \"text\" or \"json\", got {:?}",
                self.general.log_format
            )));
        }
        Ok(())
    }
}
