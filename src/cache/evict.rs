//! Background eviction of idle packages

use super::PackageFileProvider;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::fmt;
use std::sync::{Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Periodic sweep over the cache.
///
/// The worker only holds a `Weak` to the cache between ticks, so the
/// scheduler never keeps the cache alive by itself.
pub struct EvictionScheduler {
    stop: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EvictionScheduler {
    /// Start the worker. The first sweep runs after `first_wait`.
    pub fn start(cache: Weak<PackageFileProvider>, first_wait: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let worker = thread::Builder::new()
            .name("nestfs-evict".into())
            .spawn(move || {
                let mut wait = first_wait;
                loop {
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    let Some(cache) = cache.upgrade() else {
                        break;
                    };
                    let started = Instant::now();
                    match cache.evict_expired() {
                        Ok(0) => {}
                        Ok(n) => info!("Evicted {} idle package(s)", n),
                        Err(e) => warn!("Eviction sweep failed: {}", e),
                    }
                    wait = cache
                        .options()
                        .tick_interval()
                        .saturating_sub(started.elapsed());
                    // may run the cache's teardown on this thread
                    drop(cache);
                }
                debug!("Eviction scheduler stopped");
            })?;

        Ok(Self {
            stop: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop the worker once. Joins unless called from the worker itself.
    pub fn stop(&self) {
        drop(
            self.stop
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                warn!("Eviction scheduler thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }
}

impl Drop for EvictionScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for EvictionScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictionScheduler")
            .field("running", &self.is_running())
            .finish()
    }
}
