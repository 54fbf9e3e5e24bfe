//! Engine options and the load-failure classifier

use crate::config::{ClassifierKind, Config};
use crate::error::{NestError, NestResult};
use crate::loader::{self, PackageLoader};
use crate::reference::RootCanonicalization;
use crate::temp::{TempDirProvider, TempFileProvider};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Sweep interval used while eviction is disabled, so turning it back on
/// takes effect without restarting the scheduler
pub const DISABLED_EVICTION_TICK: Duration = Duration::from_secs(15);

type ClassifyFn = dyn Fn(&str, &NestError) -> bool + Send + Sync;

/// Decides whether a load failure is "expected".
///
/// Expected failures turn the entry into a plain file (`NotPackage`);
/// anything else is cached and raised.
#[derive(Clone)]
pub struct ErrorClassifier(Arc<ClassifyFn>);

impl ErrorClassifier {
    pub fn new(f: impl Fn(&str, &NestError) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Missing capabilities and malformed content are expected
    pub fn suppress_unsuitable() -> Self {
        Self::new(|_, e| {
            matches!(
                e,
                NestError::NoSuitableLoadCapability { .. } | NestError::Load { .. }
            )
        })
    }

    /// Nothing is expected
    pub fn always_throw() -> Self {
        Self::new(|_, _| false)
    }

    /// Run the classifier. A panic counts as "not expected".
    pub fn is_expected(&self, path: &str, error: &NestError) -> bool {
        match catch_unwind(AssertUnwindSafe(|| (self.0)(path, error))) {
            Ok(expected) => expected,
            Err(_) => {
                warn!("Error classifier panicked on {}", path);
                false
            }
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::suppress_unsuitable()
    }
}

impl From<ClassifierKind> for ErrorClassifier {
    fn from(kind: ClassifierKind) -> Self {
        match kind {
            ClassifierKind::SuppressUnsuitable => Self::suppress_unsuitable(),
            ClassifierKind::AlwaysThrow => Self::always_throw(),
        }
    }
}

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorClassifier")
    }
}

/// Options of a [`super::PackageFileProvider`]. Replaceable at runtime.
#[derive(Clone)]
pub struct CacheOptions {
    /// Loaders in matching priority order
    pub loaders: Arc<[Arc<dyn PackageLoader>]>,

    /// Allow strategies that hand the loader a physical file or the
    /// parent's own stream
    pub allow_direct_open: bool,

    pub reuse_failed_result: bool,
    pub max_memory_snapshot_bytes: u64,
    pub max_temp_snapshot_bytes: u64,

    /// Idle time before eviction, `None` disables it
    pub eviction: Option<Duration>,

    /// Sweep interval, defaults to a third of `eviction`
    pub check_interval: Option<Duration>,

    pub open_retry_limit: u32,
    pub canonicalization: RootCanonicalization,
    pub classifier: ErrorClassifier,
    pub temp: Option<Arc<dyn TempFileProvider>>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        let loaders: Vec<Arc<dyn PackageLoader>> = loader::standard_loaders();
        Self {
            loaders: loaders.into(),
            allow_direct_open: true,
            reuse_failed_result: true,
            max_memory_snapshot_bytes: 1024 * 1024 * 1024,
            max_temp_snapshot_bytes: u64::MAX,
            eviction: Some(Duration::from_secs(15)),
            check_interval: None,
            open_retry_limit: 16,
            canonicalization: RootCanonicalization::default(),
            classifier: ErrorClassifier::default(),
            temp: None,
        }
    }
}

fn seconds(secs: f64) -> Option<Duration> {
    (secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

impl CacheOptions {
    /// Replace the loader list
    pub fn with_loaders(mut self, loaders: Vec<Arc<dyn PackageLoader>>) -> Self {
        self.loaders = loaders.into();
        self
    }

    /// Time between eviction sweeps
    pub fn tick_interval(&self) -> Duration {
        match (self.check_interval, self.eviction) {
            (Some(interval), _) => interval,
            (None, Some(eviction)) => eviction / 3,
            (None, None) => DISABLED_EVICTION_TICK,
        }
    }

    /// Reject option sets the engine cannot run with
    pub fn validate(&self) -> NestResult<()> {
        if self.loaders.is_empty() {
            return Err(NestError::NoLoaders);
        }
        if self.open_retry_limit == 0 {
            return Err(NestError::OptionsInvalid(
                "open_retry_limit must be at least 1".into(),
            ));
        }
        if self.check_interval == Some(Duration::ZERO) {
            return Err(NestError::OptionsInvalid(
                "check_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Build engine options from the configuration file
    pub fn from_config(config: &Config) -> NestResult<Self> {
        let mut loaders = Vec::with_capacity(config.loaders.enabled.len());
        for name in &config.loaders.enabled {
            let loader = loader::by_name(name)
                .ok_or_else(|| NestError::OptionsInvalid(format!("unknown loader '{name}'")))?;
            loaders.push(loader);
        }

        let cache = &config.cache;
        let temp: Option<Arc<dyn TempFileProvider>> = if config.temp.enabled {
            Some(Arc::new(match &config.temp.dir {
                Some(dir) => TempDirProvider::new(dir),
                None => TempDirProvider::system(),
            }))
        } else {
            None
        };

        let options = Self {
            loaders: loaders.into(),
            allow_direct_open: cache.allow_direct_open,
            reuse_failed_result: cache.reuse_failed_result,
            max_memory_snapshot_bytes: cache.max_memory_snapshot_bytes,
            max_temp_snapshot_bytes: cache.max_temp_snapshot_bytes.unwrap_or(u64::MAX),
            eviction: seconds(cache.eviction_secs),
            check_interval: cache.check_interval_secs.and_then(seconds),
            open_retry_limit: cache.open_retry_limit,
            canonicalization: RootCanonicalization {
                normalize_separators: config.paths.normalize_separators,
                case_insensitive: config.paths.case_insensitive_root,
            },
            classifier: cache.classifier.into(),
            temp,
        };
        options.validate()?;
        Ok(options)
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loaders: Vec<&str> = self.loaders.iter().map(|l| l.name()).collect();
        f.debug_struct("CacheOptions")
            .field("loaders", &loaders)
            .field("allow_direct_open", &self.allow_direct_open)
            .field("reuse_failed_result", &self.reuse_failed_result)
            .field("max_memory_snapshot_bytes", &self.max_memory_snapshot_bytes)
            .field("max_temp_snapshot_bytes", &self.max_temp_snapshot_bytes)
            .field("eviction", &self.eviction)
            .field("check_interval", &self.check_interval)
            .field("open_retry_limit", &self.open_retry_limit)
            .field("canonicalization", &self.canonicalization)
            .field("temp", &self.temp.is_some())
            .finish()
    }
}
