//! Services: the host-side schedulers that drive stream drains.
//!
//! A service owns a spin-locked registry of streams and a policy for when
//! to call [`ServiceCore::run`]. Streams register themselves on
//! construction and deregister on drop; the registry is expected to stay
//! small, so O(n) scans under the lock are fine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::ErrorHandler;
use crate::stream::StreamCore;
use crate::sync::SpinMutex;

/// A drain scheduler. Implementations decide *when* the registry is
/// drained; the registry itself decides *what* a drain does.
pub trait Service: Send + Sync {
    /// The stream registry this service drains.
    fn registry(&self) -> &ServiceCore;

    /// Producer-side notification that a submit just happened. Policies
    /// whose drain loop is self-timed leave this a no-op.
    fn work_available(&self);
}

/// The registry every service policy drives.
pub struct ServiceCore {
    streams: SpinMutex<Vec<Arc<StreamCore>>>,
    handler: Arc<dyn ErrorHandler>,
}

impl ServiceCore {
    pub fn new(handler: Arc<dyn ErrorHandler>) -> Self {
        Self {
            streams: SpinMutex::new(Vec::new()),
            handler,
        }
    }

    pub fn handler(&self) -> &Arc<dyn ErrorHandler> {
        &self.handler
    }

    pub(crate) fn add(&self, stream: Arc<StreamCore>) {
        self.streams.lock().push(stream);
    }

    pub(crate) fn remove(&self, stream: &Arc<StreamCore>) {
        let mut streams = self.streams.lock();
        if let Some(index) = streams.iter().position(|s| Arc::ptr_eq(s, stream)) {
            streams.remove(index);
        }
    }

    /// Whether any registered stream still has unconsumed inserts. A
    /// `run` that drained nothing can leave this true when it raced a
    /// producer mid-commit, so wait-style policies must check it before
    /// going idle.
    pub fn has_pending(&self) -> bool {
        self.streams.lock().iter().any(|s| s.has_pending())
    }

    /// Drains every registered stream once; if anything was drained,
    /// flushes every stream. Apply failures went to the error handler, so
    /// this never propagates them.
    pub fn run(&self) -> bool {
        let streams = self.streams.lock();
        let mut drained = false;
        for stream in streams.iter() {
            if stream.try_drain() {
                drained = true;
            }
        }
        if drained {
            for stream in streams.iter() {
                stream.flush();
            }
        }
        drained
    }
}

/// Lowest submit latency: a worker thread that polls the registry and
/// sleeps for a fixed period whenever a pass drains nothing.
/// Notifications are suppressed; the poll will find the work.
pub struct PollingService {
    shared: Arc<PollingShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct PollingShared {
    core: ServiceCore,
    period: Duration,
    stop: AtomicBool,
    stopped: AtomicBool,
}

impl PollingService {
    pub const DEFAULT_PERIOD: Duration = Duration::from_millis(10);

    pub fn new(handler: Arc<dyn ErrorHandler>) -> Arc<Self> {
        Self::with_period(Self::DEFAULT_PERIOD, handler)
    }

    pub fn with_period(period: Duration, handler: Arc<dyn ErrorHandler>) -> Arc<Self> {
        let shared = Arc::new(PollingShared {
            core: ServiceCore::new(handler),
            period,
            stop: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("swapstream-poll".into())
                .spawn(move || {
                    debug!(period_ms = shared.period.as_millis() as u64, "polling worker up");
                    while !shared.stop.load(Ordering::Acquire) {
                        if !shared.core.run() {
                            thread::sleep(shared.period);
                        }
                    }
                    // We may have slept through the stop request while
                    // work arrived; one last pass flushes the tail.
                    shared.core.run();
                    shared.stopped.store(true, Ordering::Release);
                    debug!("polling worker down");
                })
                .expect("failed to spawn polling worker")
        };
        Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Requests the worker to terminate after its next pass.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Blocks until the worker has terminated.
    pub fn join(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    /// Whether the worker has confirmed termination. Non-blocking.
    pub fn stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

impl Service for PollingService {
    fn registry(&self) -> &ServiceCore {
        &self.shared.core
    }

    fn work_available(&self) {}
}

impl Drop for PollingService {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

/// Lowest power draw: a worker thread that waits on a condition variable
/// and is notified by submits. Spurious wakes are harmless; the loop
/// just runs the registry again.
pub struct WaitingService {
    shared: Arc<WaitingShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct WaitingShared {
    core: ServiceCore,
    stop: AtomicBool,
    stopped: AtomicBool,
    // Set by `work_available` before notifying; swapped off before a
    // wait. Closes the window where a notify lands between a drain pass
    // and the wait and would otherwise be lost.
    pending: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl WaitingService {
    pub fn new(handler: Arc<dyn ErrorHandler>) -> Arc<Self> {
        let shared = Arc::new(WaitingShared {
            core: ServiceCore::new(handler),
            stop: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        });
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("swapstream-wait".into())
                .spawn(move || {
                    debug!("waiting worker up");
                    while !shared.stop.load(Ordering::Acquire) {
                        if !shared.core.run() {
                            let mut guard = shared.mutex.lock();
                            if shared.pending.swap(false, Ordering::AcqRel)
                                || shared.core.has_pending()
                            {
                                // A notify raced our drain pass, or a
                                // producer was mid-commit; go around.
                                drop(guard);
                                thread::yield_now();
                            } else if !shared.stop.load(Ordering::Acquire) {
                                shared.condvar.wait(&mut guard);
                            }
                        }
                    }
                    shared.core.run();
                    shared.stopped.store(true, Ordering::Release);
                    debug!("waiting worker down");
                })
                .expect("failed to spawn waiting worker")
        };
        Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let _guard = self.shared.mutex.lock();
        self.shared.condvar.notify_all();
    }

    pub fn join(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    pub fn stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

impl Service for WaitingService {
    fn registry(&self) -> &ServiceCore {
        &self.shared.core
    }

    fn work_available(&self) {
        self.shared.pending.store(true, Ordering::Release);
        let _guard = self.shared.mutex.lock();
        self.shared.condvar.notify_all();
    }
}

impl Drop for WaitingService {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

/// No background thread at all: every drain happens inside stream
/// destructors (or explicit `try_drain` calls). Deterministic and
/// single-threaded, meant for debugging.
pub struct IdleService {
    core: ServiceCore,
}

impl IdleService {
    pub fn new(handler: Arc<dyn ErrorHandler>) -> Arc<Self> {
        Arc::new(Self {
            core: ServiceCore::new(handler),
        })
    }
}

impl Service for IdleService {
    fn registry(&self) -> &ServiceCore {
        &self.core
    }

    fn work_available(&self) {}
}
