//! Package state-change notifications
//!
//! Events are delivered on a dedicated dispatcher thread, so observers
//! never run under a cache lock and a slow observer never stalls a load.

use super::entry::PackageState;
use crate::error::NestError;
use crate::reference::PackageReference;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Sender};
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// One state transition of a cached package
#[derive(Debug, Clone, Serialize)]
pub struct PackageEvent {
    pub reference: PackageReference,
    pub old_state: PackageState,
    pub new_state: PackageState,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub error: Option<NestError>,
}

impl PackageEvent {
    pub fn new(reference: PackageReference, old_state: PackageState, new_state: PackageState) -> Self {
        Self {
            reference,
            old_state,
            new_state,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: NestError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Receives package events
pub trait PackageObserver: Send + Sync {
    fn on_event(&self, event: &PackageEvent);

    /// Called once when the cache shuts down
    fn on_completed(&self) {}
}

impl<F> PackageObserver for F
where
    F: Fn(&PackageEvent) + Send + Sync,
{
    fn on_event(&self, event: &PackageEvent) {
        self(event)
    }
}

type Observers = Arc<Vec<(u64, Arc<dyn PackageObserver>)>>;

enum Message {
    Event(PackageEvent, Observers),
    Completed(Observers),
}

struct Registry {
    observers: RwLock<Observers>,
    next_id: AtomicU64,
    panics: AtomicUsize,
}

impl Registry {
    fn snapshot(&self) -> Observers {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remove(&self, id: u64) {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let remaining: Vec<_> = observers
            .iter()
            .filter(|(other, _)| *other != id)
            .cloned()
            .collect();
        *observers = Arc::new(remaining);
    }

    fn guarded(&self, what: &str, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            let total = self.panics.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("Package observer panicked in {} ({} so far)", what, total);
        }
    }
}

/// Fan-out of package events to subscribed observers
pub struct EventBus {
    registry: Arc<Registry>,
    sender: Mutex<Option<Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> std::io::Result<Self> {
        let registry = Arc::new(Registry {
            observers: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            panics: AtomicUsize::new(0),
        });
        let (sender, receiver) = unbounded::<Message>();
        let dispatch = registry.clone();
        let worker = thread::Builder::new()
            .name("nestfs-events".into())
            .spawn(move || {
                for message in receiver {
                    match message {
                        Message::Event(event, observers) => {
                            for (_, observer) in observers.iter() {
                                dispatch.guarded("on_event", || observer.on_event(&event));
                            }
                        }
                        Message::Completed(observers) => {
                            for (_, observer) in observers.iter() {
                                dispatch.guarded("on_completed", || observer.on_completed());
                            }
                            break;
                        }
                    }
                }
                debug!("Event dispatcher stopped");
            })?;

        Ok(Self {
            registry,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Register an observer until the returned subscription is dropped
    pub fn subscribe(&self, observer: impl PackageObserver + 'static) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let mut observers = self
            .registry
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(observers.len() + 1);
        next.extend(observers.iter().cloned());
        next.push((id, Arc::new(observer) as Arc<dyn PackageObserver>));
        *observers = Arc::new(next);
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id: Some(id),
        }
    }

    pub fn has_observers(&self) -> bool {
        !self.registry.snapshot().is_empty()
    }

    /// Observer panics caught so far
    pub fn panics(&self) -> usize {
        self.registry.panics.load(Ordering::Relaxed)
    }

    /// Queue an event. `make` only runs when someone is listening.
    pub fn publish(&self, make: impl FnOnce() -> PackageEvent) {
        let observers = self.registry.snapshot();
        if observers.is_empty() {
            return;
        }
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = sender.as_ref() {
            let event = make();
            debug!(
                "{}: {} -> {}",
                event.reference, event.old_state, event.new_state
            );
            if sender.send(Message::Event(event, observers)).is_err() {
                debug!("Event dispatcher already gone");
            }
        }
    }

    /// Signal completion to every observer and stop the dispatcher.
    /// Events published afterwards are dropped.
    pub fn complete(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sender) = sender else {
            return;
        };
        let observers = std::mem::take(
            &mut *self
                .registry
                .observers
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if sender.send(Message::Completed(observers)).is_err() {
            debug!("Event dispatcher already gone");
        }
        drop(sender);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("Event dispatcher thread panicked");
            }
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.complete();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.registry.snapshot().len())
            .field("panics", &self.panics())
            .finish()
    }
}

/// Keeps an observer registered. Dropping it unsubscribes.
pub struct Subscription {
    registry: Weak<Registry>,
    id: Option<u64>,
}

impl Subscription {
    pub fn unsubscribe(&mut self) {
        if let (Some(id), Some(registry)) = (self.id.take(), self.registry.upgrade()) {
            registry.remove(id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
