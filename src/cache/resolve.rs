//! Package resolution: open, cache and hand out nested packages
//!
//! A package is loaded from raw bytes supplied by its nearest ancestor
//! that opens as a package (or the backing provider). Each load runs
//! under its entry's lock, so a reference is loaded at most once at a
//! time; concurrent callers wait on the lock and see the final state.
//!
//! The map lock is only ever held for lookups and inserts. It is never
//! held while waiting on an entry lock, so taking it below an entry lock
//! (when a load opens its parent) cannot deadlock.

use super::entry::{CacheEntry, PackageHandle, PackageState};
use super::events::PackageEvent;
use super::{PackageFileProvider, Settings};
use crate::dispose::Resource;
use crate::error::{NestError, NestResult};
use crate::loader::{LoadResult, LoaderError, PackageLoadInfo, PackageLoader};
use crate::provider::{ContentStream, FileInfo, FileProvider};
use crate::reference::PackageReference;
use chrono::Utc;
use std::fs::File;
use std::io::{self, Cursor};
use std::path::Path;
use std::sync::{Arc, PoisonError};
use tracing::{debug, warn};

/// Estimate divisor for packages served from a file or stream rather
/// than memory
const STREAMED_ESTIMATE_DIVISOR: u64 = 25;

enum Attempt {
    Handle(PackageHandle),
    NotPackage,
    /// The entry was evicted under us; look it up again
    Retry,
}

/// A provider fresh out of a loader, plus what must be released with it
struct Loaded {
    provider: Arc<dyn FileProvider>,
    size_estimate: u64,
    disposables: Vec<Resource>,
    strategy: &'static str,
}

fn accept(result: LoadResult, path: &str) -> NestResult<Option<Arc<dyn FileProvider>>> {
    match result {
        Ok(provider) => Ok(Some(provider)),
        Err(LoaderError::Unsupported) => Ok(None),
        Err(e) => Err(e.into_nest_error(path)),
    }
}

fn close(stream: ContentStream, path: &str) {
    if let Err(e) = stream.close() {
        warn!("Closing source stream of {} failed: {}", path, e);
    }
}

/// Everything a strategy needs to know about the package being loaded
struct Source<'a> {
    parent: &'a PackageHandle,
    name: &'a str,
    info: &'a FileInfo,
    load: PackageLoadInfo,
}

impl Source<'_> {
    fn path(&self) -> &str {
        &self.load.path
    }

    fn open(&self) -> NestResult<ContentStream> {
        self.parent.open(self.name)
    }

    fn fits(&self, limit: u64) -> bool {
        self.info.length.is_some_and(|len| len <= limit)
    }

    fn streamed_estimate(&self) -> u64 {
        self.info.length.unwrap_or(0) / STREAMED_ESTIMATE_DIVISOR
    }

    fn snapshot(&self) -> NestResult<Vec<u8>> {
        let mut stream = self.open()?;
        let bytes = stream
            .read_all()
            .map_err(|e| NestError::io(format!("reading {}", self.path()), e));
        close(stream, self.path());
        bytes
    }
}

impl PackageFileProvider {
    /// Open the package `reference` points at.
    ///
    /// Returns `Ok(None)` when the reference is not a package, or when
    /// loading it failed in a way the classifier deems expected.
    pub fn try_open(&self, reference: &PackageReference) -> NestResult<Option<PackageHandle>> {
        if !reference.is_package() {
            return Ok(None);
        }
        self.ensure_live()?;

        let settings = self.settings();
        let limit = settings.options.open_retry_limit;
        for attempt in 1..=limit {
            let entry = self.entry_for(reference);
            match self.open_entry(&entry, &settings)? {
                Attempt::Handle(handle) => return Ok(Some(handle)),
                Attempt::NotPackage => return Ok(None),
                Attempt::Retry => debug!(
                    "{} was evicted while opening (attempt {}/{})",
                    reference, attempt, limit
                ),
            }
        }
        Err(NestError::Contended {
            path: reference.canonical_path().to_string(),
            attempts: limit,
        })
    }

    /// Live entry for `reference`, replacing an evicted one
    pub(super) fn entry_for(&self, reference: &PackageReference) -> Arc<CacheEntry> {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
        {
            if !entry.is_evicted() {
                return entry.clone();
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get(reference) {
            Some(entry) if !entry.is_evicted() => entry.clone(),
            _ => {
                let entry = CacheEntry::new(reference.clone());
                entries.insert(reference.clone(), entry.clone());
                entry
            }
        }
    }

    /// Nearest ancestor of `reference` that opens as a package, and the
    /// name of `reference` inside it. Falls back to the backing provider.
    pub(super) fn nearest_ancestor(
        &self,
        reference: &PackageReference,
    ) -> NestResult<(PackageHandle, String)> {
        for ancestor in reference.ancestors().filter(|a| a.is_package()) {
            if let Some(handle) = self.try_open(ancestor)? {
                return Ok((handle, reference.relative_to(Some(ancestor))));
            }
        }
        Ok((self.root_handle(), reference.relative_to(None)))
    }

    fn open_entry(&self, entry: &Arc<CacheEntry>, settings: &Settings) -> NestResult<Attempt> {
        let mut state = entry.lock();
        if entry.is_evicted() {
            return Ok(Attempt::Retry);
        }

        let reuse = settings.options.reuse_failed_result;
        match state.status {
            PackageState::Opened => {
                if let Some(provider) = state.provider.clone() {
                    return Ok(Attempt::Handle(entry.acquire(provider)));
                }
            }
            PackageState::NotPackage if reuse => return Ok(Attempt::NotPackage),
            PackageState::Error if reuse => {
                if let Some(error) = state.error.clone() {
                    return Err(error);
                }
            }
            PackageState::Evicted => return Ok(Attempt::Retry),
            _ => {}
        }

        self.ensure_live()?;
        let reference = entry.reference().clone();
        let path = reference.canonical_path().to_string();
        state.error = None;

        // blocks eviction until the load is settled
        let reservation = entry.reserve();
        let result = self.load(&reference, settings);

        match result {
            Ok(Some(loaded)) => {
                if self.is_disposing() {
                    let mut errors = Vec::new();
                    if let Err(e) = loaded.provider.dispose() {
                        errors.push(e);
                    }
                    errors.extend(loaded.disposables.into_iter().filter_map(|r| r.dispose().err()));
                    if let Err(e) = NestError::aggregate(errors) {
                        warn!("Discarding {} during shutdown: {}", path, e);
                    }
                    return Err(NestError::Disposed(path));
                }

                let barrier = loaded.provider.belated_dispose();
                for resource in loaded.disposables {
                    match barrier {
                        Some(barrier) => {
                            if let Err(e) = barrier.add_belated(resource) {
                                warn!("Releasing resource of {} failed: {}", path, e);
                            }
                        }
                        None => state.disposables.push(resource),
                    }
                }

                debug!(
                    "Opened {} via {} (estimate {} bytes)",
                    path, loaded.strategy, loaded.size_estimate
                );
                state.provider = Some(loaded.provider.clone());
                state.size_estimate = loaded.size_estimate;
                state.load_time = Some(Utc::now());
                let old = entry.transition(&mut state, PackageState::Opened);
                self.events
                    .publish(|| PackageEvent::new(reference, old, PackageState::Opened));
                Ok(Attempt::Handle(reservation.into_handle(loaded.provider)))
            }
            Ok(None) => {
                debug!("{} is not a package", path);
                let old = entry.transition(&mut state, PackageState::NotPackage);
                self.events
                    .publish(|| PackageEvent::new(reference, old, PackageState::NotPackage));
                Ok(Attempt::NotPackage)
            }
            Err(error) if settings.options.classifier.is_expected(&path, &error) => {
                debug!("Treating {} as a plain file: {}", path, error);
                let old = entry.transition(&mut state, PackageState::NotPackage);
                self.events.publish(|| {
                    PackageEvent::new(reference, old, PackageState::NotPackage).with_error(error)
                });
                Ok(Attempt::NotPackage)
            }
            Err(error) => {
                debug!("Failed to open {}: {}", path, error);
                state.error = Some(error.clone());
                let old = entry.transition(&mut state, PackageState::Error);
                let event_error = error.clone();
                self.events.publish(|| {
                    PackageEvent::new(reference, old, PackageState::Error).with_error(event_error)
                });
                Err(error)
            }
        }
    }

    /// One load attempt. `Ok(None)` means the name is not a file in its
    /// parent.
    fn load(&self, reference: &PackageReference, settings: &Settings) -> NestResult<Option<Loaded>> {
        let path = reference.canonical_path();
        let loader = settings
            .matcher
            .pattern_index(reference.name())
            .and_then(|i| settings.options.loaders.get(i).cloned())
            .ok_or_else(|| NestError::no_capability(path, "no loader matches the name"))?;

        let (parent, name) = self.nearest_ancestor(reference)?;
        let info = parent.file_info(&name)?;
        if !info.exists || info.is_directory {
            return Ok(None);
        }

        let source = Source {
            parent: &parent,
            name: &name,
            info: &info,
            load: PackageLoadInfo {
                path: path.to_string(),
                length: info.length,
                last_modified: info.last_modified,
            },
        };

        let loaded = match self.load_direct(loader.as_ref(), &source, settings)? {
            Some(loaded) => Some(loaded),
            None => match self.load_snapshot(loader.as_ref(), &source, settings)? {
                Some(loaded) => Some(loaded),
                None => self.load_temp(loader.as_ref(), &source, settings)?,
            },
        };
        if let Some(loaded) = loaded {
            return Ok(Some(loaded));
        }

        let estimate = source.streamed_estimate();
        let load = source.load;
        self.load_parent_stream(loader.as_ref(), parent, &name, load, estimate, settings)?
            .map(Some)
            .ok_or_else(|| NestError::no_capability(path, "no load strategy applies"))
    }

    /// Physical file opened by the loader itself
    fn load_direct(
        &self,
        loader: &dyn PackageLoader,
        source: &Source<'_>,
        settings: &Settings,
    ) -> NestResult<Option<Loaded>> {
        let Some(physical) = source.info.physical_path.as_deref() else {
            return Ok(None);
        };
        if !settings.options.allow_direct_open {
            return Ok(None);
        }
        let caps = loader.capabilities();
        let mut provider = None;
        if caps.open_file {
            provider = accept(loader.open_file(physical, &source.load), source.path())?;
        }
        if provider.is_none() && caps.use_stream {
            let stream = open_file_stream(physical, source.path())?;
            provider = accept(loader.use_stream(stream, &source.load), source.path())?;
        }
        Ok(provider.map(|provider| Loaded {
            provider,
            size_estimate: source.streamed_estimate(),
            disposables: Vec::new(),
            strategy: "direct file",
        }))
    }

    /// Whole package copied into memory
    fn load_snapshot(
        &self,
        loader: &dyn PackageLoader,
        source: &Source<'_>,
        settings: &Settings,
    ) -> NestResult<Option<Loaded>> {
        if !source.fits(settings.options.max_memory_snapshot_bytes) {
            return Ok(None);
        }
        let caps = loader.capabilities();
        let path = source.path();
        let mut provider = None;

        if caps.load_file {
            if let Some(physical) = source.info.physical_path.as_deref() {
                provider = accept(loader.load_file(physical, &source.load), path)?;
            }
        }
        if provider.is_none() && caps.load_from_stream {
            let mut stream = source.open()?;
            let result = loader.load_from_stream(&mut stream, &source.load);
            close(stream, path);
            provider = accept(result, path)?;
        }
        if provider.is_none() && (caps.use_bytes || caps.use_stream) {
            let bytes: Arc<[u8]> = source.snapshot()?.into();
            if caps.use_bytes {
                provider = accept(loader.use_bytes(bytes.clone(), &source.load), path)?;
            }
            if provider.is_none() && caps.use_stream {
                let len = bytes.len() as u64;
                let stream = ContentStream::seekable(Cursor::new(bytes)).with_length(len);
                provider = accept(loader.use_stream(stream, &source.load), path)?;
            }
        }
        Ok(provider.map(|provider| Loaded {
            provider,
            size_estimate: source.info.length.unwrap_or(0),
            disposables: Vec::new(),
            strategy: "memory snapshot",
        }))
    }

    /// Package copied to a temp file
    fn load_temp(
        &self,
        loader: &dyn PackageLoader,
        source: &Source<'_>,
        settings: &Settings,
    ) -> NestResult<Option<Loaded>> {
        let Some(temp) = settings.options.temp.as_ref() else {
            return Ok(None);
        };
        let caps = loader.capabilities();
        if !source.fits(settings.options.max_temp_snapshot_bytes)
            || !(caps.open_file || caps.use_stream)
        {
            return Ok(None);
        }

        let path = source.path();
        let handle = temp.create_temp_file()?;
        let filename = handle.filename().to_path_buf();
        {
            let mut stream = source.open()?;
            let copied = File::create(&filename)
                .and_then(|mut file| io::copy(&mut stream, &mut file).and_then(|_| file.sync_all()))
                .map_err(|e| NestError::io(format!("copying {path} to {}", filename.display()), e));
            close(stream, path);
            copied?;
        }

        let mut provider = None;
        if caps.open_file {
            provider = accept(loader.open_file(&filename, &source.load), path)?;
        }
        if provider.is_none() && caps.use_stream {
            let stream = open_file_stream(&filename, path)?;
            provider = accept(loader.use_stream(stream, &source.load), path)?;
        }
        Ok(provider.map(|provider| Loaded {
            provider,
            size_estimate: source.streamed_estimate(),
            disposables: vec![Resource::from(handle)],
            strategy: "temp snapshot",
        }))
    }

    /// The parent's own stream, handed over together with the parent
    /// handle
    fn load_parent_stream(
        &self,
        loader: &dyn PackageLoader,
        parent: PackageHandle,
        name: &str,
        load: PackageLoadInfo,
        estimate: u64,
        settings: &Settings,
    ) -> NestResult<Option<Loaded>> {
        if !settings.options.allow_direct_open || !loader.capabilities().use_stream {
            return Ok(None);
        }
        let stream = parent.open(name)?;
        if !stream.is_seekable() {
            close(stream, &load.path);
            return Ok(None);
        }
        let stream = stream.with_hold(Resource::from(parent));
        Ok(accept(loader.use_stream(stream, &load), &load.path)?.map(|provider| Loaded {
            provider,
            size_estimate: estimate,
            disposables: Vec::new(),
            strategy: "parent stream",
        }))
    }
}

fn open_file_stream(path: &Path, package: &str) -> NestResult<ContentStream> {
    let file = File::open(path)
        .map_err(|e| NestError::io(format!("opening {package} at {}", path.display()), e))?;
    let len = file
        .metadata()
        .map_err(|e| NestError::io(format!("reading metadata of {}", path.display()), e))?
        .len();
    Ok(ContentStream::seekable(file).with_length(len))
}
