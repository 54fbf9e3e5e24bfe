//! Deferred ("belated") disposal
//!
//! An opened package's backing resource must outlive every content stream
//! derived from it, even when the package itself has already been torn
//! down by eviction or cache shutdown. [`BelatedDispose`] is the owner side
//! of a shared countdown; [`DeferToken`]s are the holds handed out to
//! streams. The queued resources are released by whichever decrement takes
//! the count to zero, on whatever thread that happens.

use crate::error::{NestError, NestResult};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// A releasable resource. Dropping it without calling `dispose` still
/// drops whatever it captured.
pub struct Resource {
    release: Box<dyn FnOnce() -> NestResult<()> + Send>,
}

impl Resource {
    /// Wrap a release action
    pub fn new(release: impl FnOnce() -> NestResult<()> + Send + 'static) -> Self {
        Self {
            release: Box::new(release),
        }
    }

    /// Keep `value` alive until this resource is disposed
    pub fn hold<T: Send + 'static>(value: T) -> Self {
        Self::new(move || {
            drop(value);
            Ok(())
        })
    }

    /// Run the release action
    pub fn dispose(self) -> NestResult<()> {
        (self.release)()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Resource")
    }
}

/// Ordered list of resources disposed together
#[derive(Debug, Default)]
pub struct DisposeList {
    items: Vec<Resource>,
}

impl DisposeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: Resource) {
        self.items.push(resource);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Dispose every resource in insertion order, collecting all errors
    pub fn dispose_all(&mut self) -> NestResult<()> {
        dispose_each(std::mem::take(&mut self.items))
    }
}

fn dispose_each(items: Vec<Resource>) -> NestResult<()> {
    let errors: Vec<NestError> = items
        .into_iter()
        .filter_map(|r| r.dispose().err())
        .collect();
    NestError::aggregate(errors)
}

struct Barrier {
    label: String,
    count: AtomicUsize,
    // `None` once released
    queued: Mutex<Option<Vec<Resource>>>,
}

impl Barrier {
    fn decrement(&self) -> NestResult<()> {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.release()
        } else {
            Ok(())
        }
    }

    fn release(&self) -> NestResult<()> {
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!("Releasing belated resources of {}", self.label);
        dispose_each(queued.unwrap_or_default())
    }
}

/// Owner guard of a deferred-disposal barrier.
///
/// The count starts at 1 for the owner. [`BelatedDispose::dispose`]
/// (or dropping the guard) gives that 1 back exactly once.
pub struct BelatedDispose {
    barrier: Arc<Barrier>,
    // `None` once the owner has disposed
    with_owner: Mutex<Option<Vec<Resource>>>,
    owner_released: AtomicBool,
}

impl BelatedDispose {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            barrier: Arc::new(Barrier {
                label: label.into(),
                count: AtomicUsize::new(1),
                queued: Mutex::new(Some(Vec::new())),
            }),
            with_owner: Mutex::new(Some(Vec::new())),
            owner_released: AtomicBool::new(false),
        }
    }

    /// Take a hold that postpones release of the queued resources
    pub fn defer(&self) -> NestResult<DeferToken> {
        self.barrier
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .map_err(|_| NestError::Disposed(self.barrier.label.clone()))?;
        Ok(DeferToken {
            barrier: Some(self.barrier.clone()),
        })
    }

    /// Queue a resource for release when the count reaches zero.
    ///
    /// Returns `Ok(false)` when the barrier had already released; the
    /// resource is then disposed right away.
    pub fn add_belated(&self, resource: Resource) -> NestResult<bool> {
        {
            let mut queued = self
                .barrier
                .queued
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = queued.as_mut() {
                list.push(resource);
                return Ok(true);
            }
        }
        resource.dispose().map(|()| false)
    }

    /// Register a resource released synchronously by the owner's dispose
    pub fn add_with_owner(&self, resource: Resource) -> NestResult<bool> {
        {
            let mut owned = self
                .with_owner
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = owned.as_mut() {
                list.push(resource);
                return Ok(true);
            }
        }
        resource.dispose().map(|()| false)
    }

    /// Whether the owner has requested teardown
    pub fn is_disposing(&self) -> bool {
        self.owner_released.load(Ordering::Acquire)
    }

    /// Whether the queued resources have been released
    pub fn is_released(&self) -> bool {
        self.barrier.count.load(Ordering::Acquire) == 0
    }

    /// Outstanding holds, including the owner's own until it disposes
    pub fn pending(&self) -> usize {
        self.barrier.count.load(Ordering::Acquire)
    }

    /// Owner teardown. Idempotent.
    pub fn dispose(&self) -> NestResult<()> {
        if self.owner_released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let owned = self
            .with_owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut errors = Vec::new();
        if let Err(e) = dispose_each(owned.unwrap_or_default()) {
            errors.push(e);
        }
        if let Err(e) = self.barrier.decrement() {
            errors.push(e);
        }
        NestError::aggregate(errors)
    }
}

impl Drop for BelatedDispose {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!("Dispose of {} failed: {}", self.barrier.label, e);
        }
    }
}

impl fmt::Debug for BelatedDispose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BelatedDispose")
            .field("label", &self.barrier.label)
            .field("pending", &self.pending())
            .field("disposing", &self.is_disposing())
            .finish()
    }
}

/// A hold on a [`BelatedDispose`] barrier, released once
pub struct DeferToken {
    barrier: Option<Arc<Barrier>>,
}

impl DeferToken {
    /// Give the hold back. Later calls do nothing.
    pub fn release(&mut self) -> NestResult<()> {
        match self.barrier.take() {
            Some(barrier) => barrier.decrement(),
            None => Ok(()),
        }
    }
}

impl Drop for DeferToken {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Belated dispose failed: {}", e);
        }
    }
}

impl fmt::Debug for DeferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferToken")
            .field("released", &self.barrier.is_none())
            .finish()
    }
}

impl From<DeferToken> for Resource {
    fn from(mut token: DeferToken) -> Self {
        Resource::new(move || token.release())
    }
}
