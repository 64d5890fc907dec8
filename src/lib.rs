//! Asynchronous stream offload engine.
//!
//! Formatted write and read operations are submitted by a *producer* thread
//! through [`Stream`] and executed against a synchronous [`Sink`] /
//! [`Source`] on a *consumer* thread. The submission path is the
//! latency-sensitive hot path; all formatting and I/O is deferred.
//!
//! The hand-off between producer and consumer is a two-page swap queue
//! ([`SwapQueue`]): exactly two arena pages that the two sides alternate
//! between, coordinated by sequence numbers and two try-acquired spin
//! locks. Work items are laid out inline in a page-chained bump arena
//! ([`arena::Arena`]) and applied in FIFO order when the consumer drains a
//! page.
//!
//! Draining is driven by a [`Service`]: a background thread that polls
//! ([`PollingService`]) or sleeps on a condition variable
//! ([`WaitingService`]), a purely synchronous debug mode
//! ([`IdleService`]), or a wrapper over an injected task [`Executor`]
//! under one of three scheduling policies ([`SchedPolicy`]).

pub mod arena;
pub mod error;
pub mod executor;
pub mod queue;
pub mod service;
pub mod sink;
pub mod stream;
pub mod sync;
pub mod test_support;
pub mod work;

pub use error::{ErrorHandler, LogErrorHandler, WorkError, WorkResult};
pub use executor::{Executor, SchedPolicy, Task};
pub use queue::{Consume, ConsumeGuard, InsertGuard, SwapQueue};
pub use service::{IdleService, PollingService, Service, ServiceCore, WaitingService};
pub use sink::{Extract, IoSink, MemorySink, MemorySource, Sink, Source, StreamState};
pub use stream::Stream;
pub use work::{ApplyCtx, PageBreak, ParseTarget, Record};
