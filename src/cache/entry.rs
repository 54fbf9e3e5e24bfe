//! Cache entries, package states and handles

use crate::dispose::{DisposeList, Resource};
use crate::error::{NestError, NestResult};
use crate::provider::FileProvider;
use crate::reference::PackageReference;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;
use tracing::error;

/// Lifecycle of a cached package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    NotOpened,
    Opened,
    Error,
    NotPackage,
    /// Terminal: the entry is never reused
    Evicted,
}

impl PackageState {
    fn as_u8(self) -> u8 {
        match self {
            Self::NotOpened => 0,
            Self::Opened => 1,
            Self::Error => 2,
            Self::NotPackage => 3,
            Self::Evicted => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Opened,
            2 => Self::Error,
            3 => Self::NotPackage,
            4 => Self::Evicted,
            _ => Self::NotOpened,
        }
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotOpened => "not opened",
            Self::Opened => "opened",
            Self::Error => "error",
            Self::NotPackage => "not a package",
            Self::Evicted => "evicted",
        };
        f.write_str(s)
    }
}

/// Snapshot of one cache entry
#[derive(Debug, Clone, Serialize)]
pub struct PackageInfo {
    /// `None` for the backing provider itself
    pub reference: Option<PackageReference>,
    pub state: PackageState,
    pub load_time: Option<DateTime<Utc>>,
    pub last_access: Option<DateTime<Utc>>,
    #[serde(serialize_with = "error_as_string")]
    pub error: Option<NestError>,
    pub size_estimate: u64,
    pub handles: usize,
}

fn error_as_string<S: Serializer>(error: &Option<NestError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

impl PackageInfo {
    /// Record for a path the cache holds no entry for
    pub fn detached(reference: Option<PackageReference>, state: PackageState) -> Self {
        Self {
            reference,
            state,
            load_time: None,
            last_access: None,
            error: None,
            size_estimate: 0,
            handles: 0,
        }
    }

    /// Canonical path, empty for the root
    pub fn path(&self) -> &str {
        self.reference
            .as_ref()
            .map_or("", PackageReference::canonical_path)
    }
}

/// Fields guarded by the entry lock
pub(crate) struct EntryState {
    pub status: PackageState,
    pub provider: Option<Arc<dyn FileProvider>>,
    pub load_time: Option<DateTime<Utc>>,
    pub error: Option<NestError>,
    pub size_estimate: u64,
    pub disposables: DisposeList,
}

impl EntryState {
    /// Release the provider and ancillary resources
    pub fn teardown(&mut self) -> NestResult<()> {
        let mut errors = Vec::new();
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.dispose() {
                errors.push(e);
            }
        }
        if let Err(e) = self.disposables.dispose_all() {
            errors.push(e);
        }
        NestError::aggregate(errors)
    }
}

/// One package in the cache.
///
/// Mutable fields change only under the entry lock. The handle count, the
/// evicted flag, a mirror of the state and the last access time are
/// atomics, so scans and handle release never wait on a load.
pub struct CacheEntry {
    reference: PackageReference,
    handles: AtomicUsize,
    evicted: AtomicBool,
    status: AtomicU8,
    last_access_ms: AtomicI64,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    pub(crate) fn new(reference: PackageReference) -> Arc<Self> {
        Arc::new(Self {
            reference,
            handles: AtomicUsize::new(0),
            evicted: AtomicBool::new(false),
            status: AtomicU8::new(PackageState::NotOpened.as_u8()),
            last_access_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            state: Mutex::new(EntryState {
                status: PackageState::NotOpened,
                provider: None,
                load_time: None,
                error: None,
                size_estimate: 0,
                disposables: DisposeList::new(),
            }),
        })
    }

    pub fn reference(&self) -> &PackageReference {
        &self.reference
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, EntryState>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Change state under the lock, returning the previous one
    pub(crate) fn transition(&self, state: &mut EntryState, to: PackageState) -> PackageState {
        let from = std::mem::replace(&mut state.status, to);
        self.status.store(to.as_u8(), Ordering::Release);
        if to == PackageState::Evicted {
            self.evicted.store(true, Ordering::Release);
        }
        from
    }

    /// Lock-free view of the state
    pub fn state(&self) -> PackageState {
        PackageState::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Outstanding handles
    pub fn handles(&self) -> usize {
        self.handles.load(Ordering::Acquire)
    }

    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.last_access_ms.load(Ordering::Acquire))
    }

    /// Time since the last acquire or release
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let last = self.last_access_ms.load(Ordering::Acquire);
        let idle = now.timestamp_millis().saturating_sub(last);
        Duration::from_millis(u64::try_from(idle).unwrap_or(0))
    }

    fn touch(&self) {
        self.last_access_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Hand out a handle. Call with the entry lock held and the state
    /// checked to be `Opened`.
    pub(crate) fn acquire(self: &Arc<Self>, provider: Arc<dyn FileProvider>) -> PackageHandle {
        self.reserve().into_handle(provider)
    }

    /// Hold the handle count up while a load runs
    pub(crate) fn reserve(self: &Arc<Self>) -> Reservation {
        self.handles.fetch_add(1, Ordering::AcqRel);
        self.touch();
        Reservation {
            entry: Some(self.clone()),
        }
    }

    fn release_one(&self) {
        let released = self
            .handles
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            error!(
                "Handle count of {} would go negative; release ignored",
                self.reference
            );
        }
        self.touch();
    }

    /// Snapshot without waiting on an in-progress load
    pub fn info(&self) -> PackageInfo {
        let mut info = match self.try_lock() {
            Some(state) => PackageInfo {
                reference: Some(self.reference.clone()),
                state: state.status,
                load_time: state.load_time,
                last_access: None,
                error: state.error.clone(),
                size_estimate: state.size_estimate,
                handles: 0,
            },
            None => PackageInfo::detached(Some(self.reference.clone()), self.state()),
        };
        info.last_access = self.last_access();
        info.handles = self.handles();
        info
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("reference", &self.reference)
            .field("state", &self.state())
            .field("handles", &self.handles())
            .finish()
    }
}

/// A handle slot taken before the provider exists
pub(crate) struct Reservation {
    entry: Option<Arc<CacheEntry>>,
}

impl Reservation {
    pub fn into_handle(mut self, provider: Arc<dyn FileProvider>) -> PackageHandle {
        PackageHandle {
            provider,
            entry: self.entry.take(),
            released: AtomicBool::new(false),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.release_one();
        }
    }
}

/// Access to an opened package.
///
/// While a handle is live its package cannot be evicted. Releasing is
/// idempotent and also happens on drop.
pub struct PackageHandle {
    provider: Arc<dyn FileProvider>,
    entry: Option<Arc<CacheEntry>>,
    released: AtomicBool,
}

impl PackageHandle {
    /// Handle on the backing provider, which is never cached
    pub fn root(provider: Arc<dyn FileProvider>) -> Self {
        Self {
            provider,
            entry: None,
            released: AtomicBool::new(false),
        }
    }

    pub fn provider(&self) -> &Arc<dyn FileProvider> {
        &self.provider
    }

    /// Package this handle pins, `None` for the root
    pub fn reference(&self) -> Option<&PackageReference> {
        self.entry.as_ref().map(|e| e.reference())
    }

    pub fn is_root(&self) -> bool {
        self.entry.is_none()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Give the handle back. Later calls do nothing.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(entry) = &self.entry {
            entry.release_one();
        }
    }
}

impl Deref for PackageHandle {
    type Target = dyn FileProvider;

    fn deref(&self) -> &Self::Target {
        self.provider.as_ref()
    }
}

impl Drop for PackageHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PackageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageHandle")
            .field("reference", &self.reference())
            .field("released", &self.is_released())
            .finish()
    }
}

impl From<PackageHandle> for Resource {
    fn from(handle: PackageHandle) -> Self {
        Resource::new(move || {
            handle.release();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::PhysicalFileProvider;

    fn entry() -> Arc<CacheEntry> {
        CacheEntry::new(PackageReference::new(None, "a.zip", true))
    }

    fn provider() -> Arc<dyn FileProvider> {
        Arc::new(PhysicalFileProvider::new(std::env::temp_dir()))
    }

    #[test]
    fn double_release_decrements_once() {
        let entry = entry();
        let first = entry.acquire(provider());
        let second = entry.acquire(provider());
        assert_eq!(entry.handles(), 2);

        first.release();
        first.release();
        assert_eq!(entry.handles(), 1);
        drop(first);
        assert_eq!(entry.handles(), 1);

        drop(second);
        assert_eq!(entry.handles(), 0);
    }

    #[test]
    fn count_never_goes_negative() {
        let entry = entry();
        entry.release_one();
        assert_eq!(entry.handles(), 0);
    }

    #[test]
    fn reservation_converts_or_releases() {
        let entry = entry();
        drop(entry.reserve());
        assert_eq!(entry.handles(), 0);

        let handle = entry.reserve().into_handle(provider());
        assert_eq!(entry.handles(), 1);
        assert_eq!(handle.reference().unwrap().canonical_path(), "a.zip");
        Resource::from(handle).dispose().unwrap();
        assert_eq!(entry.handles(), 0);
    }

    #[test]
    fn transitions_mirror_state() {
        let entry = entry();
        let mut state = entry.lock();
        assert_eq!(
            entry.transition(&mut state, PackageState::Opened),
            PackageState::NotOpened
        );
        drop(state);
        assert_eq!(entry.state(), PackageState::Opened);
        assert!(!entry.is_evicted());

        let mut state = entry.lock();
        entry.transition(&mut state, PackageState::Evicted);
        drop(state);
        assert!(entry.is_evicted());
    }

    #[test]
    fn info_does_not_wait_on_a_busy_entry() {
        let entry = entry();
        let mut state = entry.lock();
        entry.transition(&mut state, PackageState::Opened);
        state.size_estimate = 42;

        let busy = entry.info();
        assert_eq!(busy.state, PackageState::Opened);
        assert_eq!(busy.size_estimate, 0);
        drop(state);

        let idle = entry.info();
        assert_eq!(idle.size_estimate, 42);
        assert_eq!(idle.path(), "a.zip");
    }

    #[test]
    fn root_handle_has_no_entry() {
        let handle = PackageHandle::root(provider());
        assert!(handle.is_root());
        handle.release();
        assert!(handle.is_released());
    }

    #[test]
    fn info_serializes_error_as_text() {
        let mut info = PackageInfo::detached(None, PackageState::Error);
        info.error = Some(NestError::load("a.zip", "bad"));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["error"], "Failed to load package a.zip: bad");
    }
}
