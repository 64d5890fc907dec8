//! Shared scaffolding for unit and integration tests: a small threaded
//! [`Executor`], an error-handler that captures what it sees, and a few
//! helpers.

use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::arena::Arena;
use crate::error::{ErrorHandler, WorkError};
use crate::executor::{Executor, Task};
use crate::queue::SwapQueue;

/// Error handler that records everything it is told.
#[derive(Default)]
pub struct CountingHandler {
    errors: Mutex<Vec<String>>,
    generics: Mutex<Vec<String>>,
    panics: AtomicUsize,
}

impl CountingHandler {
    pub fn errors(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn generics(&self) -> usize {
        self.generics.lock().len()
    }

    pub fn panics(&self) -> usize {
        self.panics.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.errors() + self.generics() + self.panics()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn generic_messages(&self) -> Vec<String> {
        self.generics.lock().clone()
    }
}

impl ErrorHandler for CountingHandler {
    fn on_error(&self, err: &WorkError) {
        self.errors.lock().push(err.to_string());
    }

    fn on_generic(&self, err: &(dyn std::error::Error + Send + Sync)) {
        self.generics.lock().push(err.to_string());
    }

    fn on_panic(&self) {
        self.panics.fetch_add(1, Ordering::SeqCst);
    }
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// A [`SwapQueue`] together with the two arenas it swaps; owns the pages
/// so queue-level tests do not have to.
pub struct QueuePair {
    page_a: *mut Arena,
    page_b: *mut Arena,
    queue: SwapQueue,
}

// SAFETY: the pages are only reachable through the queue's protocol.
unsafe impl Send for QueuePair {}
unsafe impl Sync for QueuePair {}

impl QueuePair {
    #[allow(clippy::new_without_default)]
    pub fn new() -> QueuePair {
        let page_a = Box::into_raw(Box::new(Arena::new()));
        let page_b = Box::into_raw(Box::new(Arena::new()));
        // SAFETY: fresh, distinct boxes, freed after the queue in Drop.
        let queue = unsafe { SwapQueue::new(page_a, page_b) };
        QueuePair {
            page_a,
            page_b,
            queue,
        }
    }

    pub fn queue(&self) -> &SwapQueue {
        &self.queue
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        // SAFETY: the queue holds no open transactions once `self` is
        // being dropped, and the pointers came from Box::into_raw.
        unsafe {
            drop(Box::from_raw(self.page_a));
            drop(Box::from_raw(self.page_b));
        }
    }
}

struct TimedTask {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

struct ExecState {
    ready: VecDeque<Task>,
    timers: BinaryHeap<TimedTask>,
    next_seq: u64,
}

struct ExecutorInner {
    state: Mutex<ExecState>,
    condvar: Condvar,
    stop: AtomicBool,
    stopped: AtomicBool,
}

/// A single worker thread with a ready queue and a timer heap, just
/// enough executor to host the executor-backed drain policies.
pub struct ThreadExecutor {
    inner: Arc<ExecutorInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadExecutor {
    pub fn new() -> Arc<Self> {
        let inner = Arc::new(ExecutorInner {
            state: Mutex::new(ExecState {
                ready: VecDeque::new(),
                timers: BinaryHeap::new(),
                next_seq: 0,
            }),
            condvar: Condvar::new(),
            stop: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });
        let worker = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("test-executor".into())
                .spawn(move || Self::run_worker(&inner))
                .expect("failed to spawn test executor")
        };
        Arc::new(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn run_worker(inner: &ExecutorInner) {
        loop {
            let task = {
                let mut state = inner.state.lock();
                loop {
                    if inner.stop.load(Ordering::Acquire) {
                        break None;
                    }
                    let now = Instant::now();
                    while state
                        .timers
                        .peek()
                        .is_some_and(|timed| timed.deadline <= now)
                    {
                        let timed = state.timers.pop().expect("peeked timer");
                        state.ready.push_back(timed.task);
                    }
                    if let Some(task) = state.ready.pop_front() {
                        break Some(task);
                    }
                    match state.timers.peek().map(|timed| timed.deadline) {
                        Some(deadline) => {
                            let _ = inner.condvar.wait_until(&mut state, deadline);
                        }
                        None => inner.condvar.wait(&mut state),
                    }
                }
            };
            match task {
                Some(task) => task(),
                None => break,
            }
        }
        inner.stopped.store(true, Ordering::Release);
    }

    /// Stops the worker; queued and timed tasks that have not run are
    /// abandoned.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        {
            let _state = self.inner.state.lock();
            self.inner.condvar.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Executor for ThreadExecutor {
    fn post(&self, task: Task) {
        let mut state = self.inner.state.lock();
        state.ready.push_back(task);
        self.inner.condvar.notify_all();
    }

    fn post_at(&self, deadline: Instant, task: Task) {
        let mut state = self.inner.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.timers.push(TimedTask {
            deadline,
            seq,
            task,
        });
        self.inner.condvar.notify_all();
    }

    fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}
