//! Package resolution cache
//!
//! Opens nested packages on demand, keeps them while they are in use and
//! evicts them once idle. Paths are flat: `outer.zip/inner.tar/file.txt`.
//!
//! # Package States
//!
//! | State | Meaning |
//! |-------|---------|
//! | NotOpened | Entry created, no load finished yet |
//! | Opened | Provider available, handles can be taken |
//! | Error | Load failed; the error is cached |
//! | NotPackage | Name matched but content is not a package |
//! | Evicted | Torn down; a fresh entry replaces it |

mod entry;
mod events;
mod evict;
mod options;
mod resolve;

pub use entry::{CacheEntry, PackageHandle, PackageInfo, PackageState};
pub use events::{EventBus, PackageEvent, PackageObserver, Subscription};
pub use evict::EvictionScheduler;
pub use options::{CacheOptions, ErrorClassifier, DISABLED_EVICTION_TICK};

use crate::dispose::Resource;
use crate::error::{NestError, NestResult};
use crate::provider::{join_path, ChangeToken, ContentStream, DirectoryContents, FileInfo, FileProvider};
use crate::reference::{PackageMatcher, PackageReference};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Options plus the matcher built from their loaders
struct Settings {
    options: CacheOptions,
    matcher: PackageMatcher,
}

fn build_matcher(options: &CacheOptions) -> NestResult<PackageMatcher> {
    PackageMatcher::new(
        options.loaders.iter().map(|l| l.extension_pattern()),
        options.canonicalization,
    )
}

/// The package cache, itself usable as a [`FileProvider`] over flat
/// nested paths
pub struct PackageFileProvider {
    root: Arc<dyn FileProvider>,
    settings: RwLock<Arc<Settings>>,
    entries: RwLock<HashMap<PackageReference, Arc<CacheEntry>>>,
    events: EventBus,
    scheduler: Mutex<Option<EvictionScheduler>>,
    disposing: AtomicBool,
}

impl PackageFileProvider {
    /// Create a cache over `root` and start its eviction scheduler
    pub fn new(root: Arc<dyn FileProvider>, options: CacheOptions) -> NestResult<Arc<Self>> {
        options.validate()?;
        let matcher = build_matcher(&options)?;
        let first_wait = options.tick_interval();
        let events = EventBus::new().map_err(|e| NestError::io("starting event dispatcher", e))?;

        let cache = Arc::new(Self {
            root,
            settings: RwLock::new(Arc::new(Settings { options, matcher })),
            entries: RwLock::new(HashMap::new()),
            events,
            scheduler: Mutex::new(None),
            disposing: AtomicBool::new(false),
        });

        let scheduler = EvictionScheduler::start(Arc::downgrade(&cache), first_wait)
            .map_err(|e| NestError::io("starting eviction scheduler", e))?;
        *cache
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(scheduler);
        Ok(cache)
    }

    fn settings(&self) -> Arc<Settings> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current options
    pub fn options(&self) -> CacheOptions {
        self.settings().options.clone()
    }

    /// Replace the options. The path matcher is rebuilt only when the
    /// loader list (by identity) or root canonicalization changed.
    pub fn set_options(&self, options: CacheOptions) -> NestResult<()> {
        options.validate()?;
        let current = self.settings();
        let matcher = if Arc::ptr_eq(&current.options.loaders, &options.loaders)
            && current.options.canonicalization == options.canonicalization
        {
            current.matcher.clone()
        } else {
            debug!("Loader set changed, rebuilding package matcher");
            build_matcher(&options)?
        };
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(Settings { options, matcher });
        Ok(())
    }

    /// Backing provider
    pub fn root(&self) -> &Arc<dyn FileProvider> {
        &self.root
    }

    /// Parse a flat path. `None` is the backing provider itself.
    pub fn parse(&self, path: &str) -> Option<PackageReference> {
        self.settings().matcher.parse(path)
    }

    /// Whether a file name would be treated as a package
    pub fn is_package_name(&self, name: &str) -> bool {
        self.settings().matcher.is_package_name(name)
    }

    /// Non-owning handle on the backing provider
    pub fn root_handle(&self) -> PackageHandle {
        PackageHandle::root(self.root.clone())
    }

    /// Open the package at `path`. The empty path is the backing
    /// provider; a path that does not name a package yields `None`.
    pub fn open_package(&self, path: &str) -> NestResult<Option<PackageHandle>> {
        match self.parse(path) {
            None => Ok(Some(self.root_handle())),
            Some(reference) => self.try_open(&reference),
        }
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> NestResult<()> {
        if self.is_disposing() {
            return Err(NestError::Disposed("package cache".into()));
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<CacheEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn remove_entry(&self, entry: &Arc<CacheEntry>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries
            .get(entry.reference())
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(entry.reference());
        }
    }

    /// Tear down one entry unless it has handles, or (with `max_idle`)
    /// is not an opened package idle for that long
    fn evict_entry(&self, entry: &Arc<CacheEntry>, max_idle: Option<Duration>) -> NestResult<bool> {
        if entry.handles() > 0 {
            return Ok(false);
        }
        let result = {
            let mut state = entry.lock();
            if entry.is_evicted() {
                drop(state);
                self.remove_entry(entry);
                return Ok(true);
            }
            if entry.handles() > 0 {
                return Ok(false);
            }
            if let Some(max_idle) = max_idle {
                if state.status != PackageState::Opened || entry.idle_for(Utc::now()) < max_idle {
                    return Ok(false);
                }
            }
            let result = state.teardown();
            let old = entry.transition(&mut state, PackageState::Evicted);
            let reference = entry.reference().clone();
            self.events
                .publish(|| PackageEvent::new(reference, old, PackageState::Evicted));
            result
        };
        self.remove_entry(entry);

        info!("Evicted {}", entry.reference());
        result.map(|()| true)
    }

    /// Evict the package at `path`.
    ///
    /// Returns `false` when it is still in use or the path names no
    /// package, `true` when it is gone (or was never cached).
    pub fn evict(&self, path: &str) -> NestResult<bool> {
        let Some(reference) = self.parse(path) else {
            return Ok(false);
        };
        if !reference.is_package() {
            return Ok(false);
        }
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&reference)
            .cloned();
        match entry {
            Some(entry) => self.evict_entry(&entry, None),
            None => Ok(true),
        }
    }

    fn evict_many(&self, max_idle: Option<Duration>) -> NestResult<usize> {
        let mut entries = self.snapshot();
        // nested packages pin their parents, so go deepest first
        entries.sort_by_key(|e| std::cmp::Reverse(e.reference().depth()));

        let mut evicted = 0;
        let mut errors = Vec::new();
        for entry in &entries {
            match self.evict_entry(entry, max_idle) {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => errors.push(e),
            }
        }
        NestError::aggregate(errors).map(|()| evicted)
    }

    /// Evict every entry without handles
    pub fn evict_all(&self) -> NestResult<usize> {
        self.evict_many(None)
    }

    /// Evict opened packages without handles that have been idle longer
    /// than the eviction time
    pub fn evict_expired(&self) -> NestResult<usize> {
        match self.settings().options.eviction {
            Some(max_idle) => self.evict_many(Some(max_idle)),
            None => Ok(0),
        }
    }

    /// Snapshot of every live entry, sorted by path
    pub fn package_infos(&self) -> Vec<PackageInfo> {
        let mut infos: Vec<PackageInfo> = self
            .snapshot()
            .iter()
            .filter(|e| !e.is_evicted())
            .map(|e| e.info())
            .collect();
        infos.sort_by(|a, b| a.path().cmp(b.path()));
        infos
    }

    /// Snapshot of the entry for `path`
    pub fn package_info(&self, path: &str) -> PackageInfo {
        let Some(reference) = self.parse(path) else {
            return PackageInfo::detached(None, PackageState::Opened);
        };
        if !reference.is_package() {
            return PackageInfo::detached(Some(reference), PackageState::NotPackage);
        }
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&reference)
            .cloned();
        match entry {
            Some(entry) if !entry.is_evicted() => entry.info(),
            _ => PackageInfo::detached(Some(reference), PackageState::NotOpened),
        }
    }

    /// Receive state-change events until the subscription is dropped
    pub fn subscribe(&self, observer: impl PackageObserver + 'static) -> Subscription {
        self.events.subscribe(observer)
    }

    /// Shut the cache down: stop the scheduler, tear down every entry and
    /// complete the observers. Streams already handed out stay readable.
    pub fn dispose(&self) -> NestResult<()> {
        if self.disposing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Disposing package cache");

        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }

        let mut entries: Vec<_> = std::mem::take(
            &mut *self.entries.write().unwrap_or_else(PoisonError::into_inner),
        )
        .into_values()
        .collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.reference().depth()));

        let mut errors = Vec::new();
        for entry in entries {
            let mut state = entry.lock();
            if entry.is_evicted() {
                continue;
            }
            if let Err(e) = state.teardown() {
                errors.push(e);
            }
            let old = entry.transition(&mut state, PackageState::Evicted);
            let reference = entry.reference().clone();
            self.events
                .publish(|| PackageEvent::new(reference, old, PackageState::Evicted));
        }
        self.events.complete();

        if let Some(temp) = self.settings().options.temp.as_ref() {
            if let Err(e) = temp.dispose() {
                errors.push(e);
            }
        }
        NestError::aggregate(errors)
    }

    fn rebase(&self, contents: DirectoryContents, dir: &str) -> DirectoryContents {
        let settings = self.settings();
        let entries = contents
            .entries
            .into_iter()
            .map(|entry| {
                let path = join_path(dir, &entry.name);
                let is_package = entry.exists
                    && !entry.is_directory
                    && settings.matcher.is_package_name(&entry.name);
                let entry = entry.with_path(path);
                if is_package {
                    entry.into_package()
                } else {
                    entry
                }
            })
            .collect();
        DirectoryContents {
            exists: contents.exists,
            entries,
        }
    }
}

impl FileProvider for PackageFileProvider {
    fn file_info(&self, path: &str) -> NestResult<FileInfo> {
        self.ensure_live()?;
        let Some(reference) = self.parse(path) else {
            return self.root.file_info("");
        };
        let (handle, name) = self.nearest_ancestor(&reference)?;
        let info = handle
            .file_info(&name)?
            .with_path(reference.canonical_path().to_string());
        if reference.is_package() && info.exists && !info.is_directory {
            Ok(info.into_package())
        } else {
            Ok(info)
        }
    }

    fn directory_contents(&self, path: &str) -> NestResult<DirectoryContents> {
        self.ensure_live()?;
        let Some(reference) = self.parse(path) else {
            let contents = self.root.directory_contents("")?;
            return Ok(self.rebase(contents, ""));
        };
        let dir = reference.canonical_path().to_string();
        if let Some(handle) = self.try_open(&reference)? {
            let contents = handle.directory_contents("")?;
            return Ok(self.rebase(contents, &dir));
        }
        let (handle, name) = self.nearest_ancestor(&reference)?;
        let contents = handle.directory_contents(&name)?;
        Ok(self.rebase(contents, &dir))
    }

    fn open(&self, path: &str) -> NestResult<ContentStream> {
        self.ensure_live()?;
        let Some(reference) = self.parse(path) else {
            return self.root.open("");
        };
        let (handle, name) = self.nearest_ancestor(&reference)?;
        let stream = handle.open(&name)?;
        Ok(stream.with_hold(Resource::from(handle)))
    }

    /// Watch through the backing provider. Content inside a package
    /// changes only when the package file does, so the filter is cut at
    /// the first package (or at a `**` that comes before it).
    fn watch(&self, filter: &str) -> Arc<dyn ChangeToken> {
        let Some(end) = self.settings().matcher.first_package_end(filter) else {
            return self.root.watch(filter);
        };
        match filter.find("**") {
            Some(ix) if ix < end => self.root.watch(&filter[..ix + 2]),
            _ => self.root.watch(&filter[..end]),
        }
    }

    fn dispose(&self) -> NestResult<()> {
        PackageFileProvider::dispose(self)
    }
}

impl Drop for PackageFileProvider {
    fn drop(&mut self) {
        if let Err(e) = PackageFileProvider::dispose(self) {
            warn!("Package cache teardown failed: {}", e);
        }
    }
}

impl fmt::Debug for PackageFileProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageFileProvider")
            .field("entries", &self.snapshot().len())
            .field("disposing", &self.is_disposing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{
        LoadResult, LoaderCapabilities, PackageLoadInfo, PackageLoader, ZipLoader,
    };
    use crate::provider::PhysicalFileProvider;
    use crossbeam_channel::unbounded;
    use serial_test::serial;
    use std::io::{Cursor, Read, Write};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::CompressionMethod;

    fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::<()>::default().compression_method(CompressionMethod::Stored);
        for (name, data) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    /// Zip loader that counts loads and can be slowed down
    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
        delay: Duration,
    }

    impl PackageLoader for CountingLoader {
        fn name(&self) -> &str {
            "counting"
        }

        fn extension_pattern(&self) -> &str {
            r"\.zip"
        }

        fn capabilities(&self) -> LoaderCapabilities {
            LoaderCapabilities {
                open_file: true,
                ..LoaderCapabilities::default()
            }
        }

        fn open_file(&self, path: &Path, info: &PackageLoadInfo) -> LoadResult {
            self.loads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            ZipLoader.open_file(path, info)
        }
    }

    struct Fixture {
        dir: TempDir,
        cache: Arc<PackageFileProvider>,
        loader: Arc<CountingLoader>,
    }

    fn fixture(delay: Duration, tweak: impl FnOnce(&mut CacheOptions)) -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.zip"),
            zip_bytes(&[("x.txt", b"from a"), ("sub/y.txt", b"nested")]),
        )
        .unwrap();
        std::fs::write(dir.path().join("plain.txt"), b"plain").unwrap();

        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
            delay,
        });
        let mut options =
            CacheOptions::default().with_loaders(vec![loader.clone() as Arc<dyn PackageLoader>]);
        tweak(&mut options);
        let root: Arc<dyn FileProvider> = Arc::new(PhysicalFileProvider::new(dir.path()));
        let cache = PackageFileProvider::new(root, options).unwrap();
        Fixture {
            dir,
            cache,
            loader,
        }
    }

    fn read(cache: &PackageFileProvider, path: &str) -> String {
        let mut s = String::new();
        cache.open(path).unwrap().read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn concurrent_opens_load_once() {
        let f = fixture(Duration::from_millis(50), |_| {});
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let cache = f.cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let handle = cache.open_package("a.zip").unwrap().unwrap();
                    assert!(handle.file_info("x.txt").unwrap().exists);
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(f.loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(f.cache.package_info("a.zip").handles, 0);
    }

    #[test]
    fn handle_count_tracks_release() {
        let f = fixture(Duration::ZERO, |_| {});
        let first = f.cache.open_package("a.zip").unwrap().unwrap();
        let second = f.cache.open_package("/a.zip/").unwrap().unwrap();
        assert_eq!(f.cache.package_info("a.zip").handles, 2);

        first.release();
        first.release();
        assert_eq!(f.cache.package_info("a.zip").handles, 1);
        drop(first);
        drop(second);
        assert_eq!(f.cache.package_info("a.zip").handles, 0);
    }

    #[test]
    fn evict_refused_while_handle_held() {
        let f = fixture(Duration::ZERO, |_| {});
        let handle = f.cache.open_package("a.zip").unwrap().unwrap();
        assert!(!f.cache.evict("a.zip").unwrap());
        assert_eq!(f.cache.package_info("a.zip").state, PackageState::Opened);

        drop(handle);
        assert!(f.cache.evict("a.zip").unwrap());
        assert_eq!(f.cache.package_info("a.zip").state, PackageState::NotOpened);
        assert!(f.cache.evict("a.zip").unwrap());
        assert!(!f.cache.evict("").unwrap());
        assert!(!f.cache.evict("plain.txt").unwrap());
    }

    #[test]
    fn open_stream_pins_package() {
        let f = fixture(Duration::ZERO, |_| {});
        let stream = f.cache.open("a.zip/x.txt").unwrap();
        assert!(!f.cache.evict("a.zip").unwrap());
        drop(stream);
        assert!(f.cache.evict("a.zip").unwrap());
    }

    #[test]
    fn evicted_package_is_reloaded() {
        let f = fixture(Duration::ZERO, |_| {});
        assert_eq!(read(&f.cache, "a.zip/x.txt"), "from a");
        assert!(f.cache.evict("a.zip").unwrap());
        assert_eq!(read(&f.cache, "a.zip/sub/y.txt"), "nested");
        assert_eq!(f.loader.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn plain_paths_pass_through() {
        let f = fixture(Duration::ZERO, |_| {});
        assert_eq!(read(&f.cache, "plain.txt"), "plain");
        assert!(f.cache.open_package("plain.txt").unwrap().is_none());
        assert!(f.cache.open_package("").unwrap().unwrap().is_root());
        assert_eq!(
            f.cache.package_info("plain.txt").state,
            PackageState::NotPackage
        );
        assert_eq!(f.cache.package_info("").state, PackageState::Opened);
    }

    #[test]
    fn listing_marks_packages() {
        let f = fixture(Duration::ZERO, |_| {});
        let root = f.cache.directory_contents("").unwrap();
        let zip = root.entries.iter().find(|e| e.name == "a.zip").unwrap();
        assert!(zip.is_package && zip.is_directory);

        let inside = f.cache.directory_contents("a.zip").unwrap();
        let paths: Vec<_> = inside.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.zip/sub", "a.zip/x.txt"]);

        let sub = f.cache.directory_contents("a.zip/sub").unwrap();
        assert_eq!(sub.entries[0].path, "a.zip/sub/y.txt");

        assert!(f.cache.file_info("a.zip").unwrap().is_package);
        let info = f.cache.file_info("a.zip/sub/y.txt").unwrap();
        assert_eq!(info.length, Some(6));
        assert_eq!(info.path, "a.zip/sub/y.txt");
    }

    #[test]
    fn missing_package_is_not_a_package() {
        let f = fixture(Duration::ZERO, |_| {});
        assert!(f.cache.open_package("missing.zip").unwrap().is_none());
        assert_eq!(
            f.cache.package_info("missing.zip").state,
            PackageState::NotPackage
        );
        assert_eq!(f.loader.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn classifier_decides_failure_mode() {
        let f = fixture(Duration::ZERO, |_| {});
        std::fs::write(f.dir.path().join("bad.zip"), b"not a zip at all").unwrap();

        assert!(f.cache.open_package("bad.zip").unwrap().is_none());
        assert_eq!(
            f.cache.package_info("bad.zip").state,
            PackageState::NotPackage
        );

        let mut options = f.cache.options();
        options.classifier = ErrorClassifier::always_throw();
        f.cache.set_options(options).unwrap();
        assert!(f.cache.evict("bad.zip").unwrap());

        let first = f.cache.open_package("bad.zip").unwrap_err();
        assert!(matches!(first, NestError::Load { .. }));
        let info = f.cache.package_info("bad.zip");
        assert_eq!(info.state, PackageState::Error);
        assert!(info.error.is_some());

        let loads = f.loader.loads.load(Ordering::SeqCst);
        let replay = f.cache.open_package("bad.zip").unwrap_err();
        assert_eq!(first.to_string(), replay.to_string());
        assert_eq!(f.loader.loads.load(Ordering::SeqCst), loads);
    }

    #[test]
    fn failed_result_retried_without_reuse() {
        let f = fixture(Duration::ZERO, |o| {
            o.reuse_failed_result = false;
            o.classifier = ErrorClassifier::always_throw();
        });
        let bad = f.dir.path().join("bad.zip");
        std::fs::write(&bad, b"garbage").unwrap();

        assert!(f.cache.open_package("bad.zip").is_err());
        std::fs::write(&bad, zip_bytes(&[("ok.txt", b"ok")])).unwrap();
        assert!(f.cache.open_package("bad.zip").unwrap().is_some());
    }

    #[test]
    fn events_follow_transitions() {
        let f = fixture(Duration::ZERO, |_| {});
        let (tx, rx) = unbounded();
        let _sub = f.cache.subscribe(move |e: &PackageEvent| {
            tx.send((e.reference.to_string(), e.old_state, e.new_state))
                .unwrap();
        });

        drop(f.cache.open_package("a.zip").unwrap());
        f.cache.evict("a.zip").unwrap();

        let wait = Duration::from_secs(5);
        assert_eq!(
            rx.recv_timeout(wait).unwrap(),
            ("a.zip".to_string(), PackageState::NotOpened, PackageState::Opened)
        );
        assert_eq!(
            rx.recv_timeout(wait).unwrap(),
            ("a.zip".to_string(), PackageState::Opened, PackageState::Evicted)
        );
    }

    #[test]
    fn set_options_rebuilds_matcher() {
        let f = fixture(Duration::ZERO, |_| {});
        assert!(f.cache.parse("a.zip").unwrap().is_package());

        let mut options = f.cache.options();
        options.loaders = vec![crate::loader::by_name("tar").unwrap()].into();
        f.cache.set_options(options).unwrap();
        assert!(!f.cache.parse("a.zip").unwrap().is_package());
        assert!(f.cache.parse("a.tar").unwrap().is_package());

        let mut options = f.cache.options();
        options.loaders = Vec::new().into();
        assert!(matches!(
            f.cache.set_options(options),
            Err(NestError::NoLoaders)
        ));
    }

    #[test]
    fn dispose_keeps_open_streams_readable() {
        let f = fixture(Duration::ZERO, |_| {});
        let mut stream = f.cache.open("a.zip/x.txt").unwrap();
        f.cache.dispose().unwrap();
        f.cache.dispose().unwrap();

        assert!(matches!(
            f.cache.open_package("a.zip"),
            Err(NestError::Disposed(_))
        ));
        assert!(f.cache.package_infos().is_empty());

        let mut s = String::new();
        stream.read_to_string(&mut s).unwrap();
        assert_eq!(s, "from a");
    }

    #[test]
    fn watch_cuts_filter_at_first_package() {
        let f = fixture(Duration::ZERO, |_| {});
        // only checks the delegation does not panic on each shape
        for filter in ["*.txt", "a.zip/**", "a.zip/x.txt", "**/a.zip/x.txt"] {
            assert!(!f.cache.watch(filter).has_changed());
        }
    }

    #[test]
    fn mixed_case_root_opens_with_folding_on() {
        let f = fixture(Duration::ZERO, |o| o.canonicalization.case_insensitive = true);
        std::fs::create_dir(f.dir.path().join("Data")).unwrap();
        std::fs::write(
            f.dir.path().join("Data/Outer.zip"),
            zip_bytes(&[("x.txt", b"mixed case")]),
        )
        .unwrap();

        assert_eq!(read(&f.cache, "Data/Outer.zip/x.txt"), "mixed case");
        assert_eq!(f.cache.file_info("Data/Outer.zip/x.txt").unwrap().length, Some(10));

        let handle = f.cache.open_package("DATA/outer.ZIP").unwrap().unwrap();
        assert!(handle.file_info("x.txt").unwrap().exists);
        assert_eq!(f.loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(f.cache.package_infos().len(), 1);
        assert_eq!(f.cache.package_info("data/outer.zip").handles, 1);
    }

    /// Lock the live entry for `path`, then let an opener run into it
    /// and evict the entry before the opener gets the lock
    fn evict_under_opener(
        f: &Fixture,
        path: &str,
    ) -> (Arc<CacheEntry>, NestResult<bool>) {
        let reference = f.cache.parse(path).unwrap();
        let entry = f.cache.entry_for(&reference);
        let mut state = entry.lock();

        let cache = f.cache.clone();
        let opener = thread::spawn(move || cache.try_open(&reference).map(|h| h.is_some()));

        // map + this frame + the opener's lookup
        let deadline = Instant::now() + Duration::from_secs(5);
        while Arc::strong_count(&entry) < 3 {
            assert!(Instant::now() < deadline, "opener never looked the entry up");
            thread::sleep(Duration::from_millis(2));
        }
        entry.transition(&mut state, PackageState::Evicted);
        drop(state);
        f.cache.remove_entry(&entry);

        (entry, opener.join().unwrap())
    }

    #[test]
    fn evicted_entry_is_retried_on_its_successor() {
        let f = fixture(Duration::ZERO, |_| {});
        let (stale, opened) = evict_under_opener(&f, "a.zip");
        assert!(opened.unwrap());

        let reference = f.cache.parse("a.zip").unwrap();
        let current = f.cache.entry_for(&reference);
        assert!(!Arc::ptr_eq(&stale, &current));
        assert_eq!(current.state(), PackageState::Opened);
        assert_eq!(f.loader.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_retries_report_contention() {
        let f = fixture(Duration::ZERO, |o| o.open_retry_limit = 1);
        let (_, opened) = evict_under_opener(&f, "a.zip");
        match opened {
            Err(NestError::Contended { path, attempts }) => {
                assert_eq!(path, "a.zip");
                assert_eq!(attempts, 1);
            }
            other => panic!("expected contention, got {other:?}"),
        }
        assert_eq!(f.loader.loads.load(Ordering::SeqCst), 0);
        assert!(f.cache.open_package("a.zip").unwrap().is_some());
    }

    #[test]
    fn opens_survive_concurrent_eviction() {
        let f = fixture(Duration::ZERO, |_| {});
        let stop = Arc::new(AtomicBool::new(false));

        let evictor = {
            let cache = f.cache.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut rounds = 0usize;
                while !stop.load(Ordering::Acquire) {
                    cache.evict_all().unwrap();
                    rounds += 1;
                }
                rounds
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = f.cache.clone();
                thread::spawn(move || {
                    for _ in 0..300 {
                        assert_eq!(read(&cache, "a.zip/x.txt"), "from a");
                    }
                })
            })
            .collect();
        for r in readers {
            r.join().unwrap();
        }
        stop.store(true, Ordering::Release);
        assert!(evictor.join().unwrap() > 0);
        assert!(f.loader.loads.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn failed_teardown_is_reported_not_counted() {
        let f = fixture(Duration::ZERO, |_| {});
        std::fs::write(f.dir.path().join("b.zip"), zip_bytes(&[("y.txt", b"b")])).unwrap();
        drop(f.cache.open_package("a.zip").unwrap());
        drop(f.cache.open_package("b.zip").unwrap());

        let entry = f.cache.entry_for(&f.cache.parse("a.zip").unwrap());
        entry
            .lock()
            .disposables
            .push(Resource::new(|| Err(NestError::Internal("stuck".into()))));

        assert!(f.cache.evict_all().is_err());
        assert!(f.cache.package_infos().is_empty());
        assert_eq!(f.cache.evict_all().unwrap(), 0);
    }

    #[test]
    #[serial]
    fn scheduler_evicts_idle_packages() {
        let f = fixture(Duration::ZERO, |o| {
            o.eviction = Some(Duration::from_millis(100));
            o.check_interval = Some(Duration::from_millis(25));
        });
        drop(f.cache.open_package("a.zip").unwrap());
        assert_eq!(f.cache.package_infos().len(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !f.cache.package_infos().is_empty() {
            assert!(Instant::now() < deadline, "package was never evicted");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    #[serial]
    fn scheduler_keeps_held_packages() {
        let f = fixture(Duration::ZERO, |o| {
            o.eviction = Some(Duration::from_millis(20));
            o.check_interval = Some(Duration::from_millis(10));
        });
        let handle = f.cache.open_package("a.zip").unwrap().unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(f.cache.package_info("a.zip").state, PackageState::Opened);
        drop(handle);
    }

    #[test]
    #[serial]
    fn dropping_cache_stops_scheduler_promptly() {
        let f = fixture(Duration::ZERO, |o| {
            o.eviction = Some(Duration::from_secs(3600));
        });
        let started = Instant::now();
        drop(f.cache);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
