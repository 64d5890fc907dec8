//! Error taxonomy and the drain-side error handler.

use std::io;

use tracing::error;

/// A specialized error type for work-item application.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// An I/O error surfaced by the sink or source.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A value failed to format into the sink.
    #[error("format error")]
    Fmt(#[from] std::fmt::Error),
    /// A token could not be parsed into the requested type.
    #[error("parse error: {0}")]
    Parse(String),
    /// A write-side work item ran on a stream with no sink bound.
    /// Programmer error; debug builds assert before this is constructed,
    /// release builds report it and skip the item.
    #[error("no sink bound to this stream")]
    NoSink,
    /// A read-side work item ran on a stream with no source bound.
    /// Programmer error; debug builds assert before this is constructed,
    /// release builds report it and skip the item.
    #[error("no source bound to this stream")]
    NoSource,
    /// An error raised by user code inside a work item.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl WorkError {
    /// Wrap an arbitrary user error.
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Box::new(err))
    }

    /// Create a parse error from a displayable value.
    pub fn parse<T: std::fmt::Display>(msg: T) -> Self {
        Self::Parse(msg.to_string())
    }
}

/// A Result type alias for work-item application.
pub type WorkResult<T> = Result<T, WorkError>;

/// Receives failures raised while draining work items.
///
/// Every failure is reported exactly once and the drain continues with the
/// next item, so a handler sees errors in submission order. All three
/// callbacks run on the consumer thread.
///
/// Implementations must not submit into the stream being drained: the
/// drainer thread is the one invoking the handler, and a submit that needs
/// the page being drained would deadlock.
pub trait ErrorHandler: Send + Sync {
    /// A work item failed with one of the crate's own error variants.
    fn on_error(&self, err: &WorkError);

    /// A work item failed with a user-supplied error ([`WorkError::Other`]).
    fn on_generic(&self, err: &(dyn std::error::Error + Send + Sync));

    /// A work item panicked; the payload was discarded.
    fn on_panic(&self);
}

/// Default handler: logs every failure through `tracing` and moves on.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorHandler;

impl ErrorHandler for LogErrorHandler {
    fn on_error(&self, err: &WorkError) {
        error!(error = %err, "work item failed");
    }

    fn on_generic(&self, err: &(dyn std::error::Error + Send + Sync)) {
        error!(error = %err, "work item failed with user error");
    }

    fn on_panic(&self) {
        error!("work item panicked");
    }
}

/// Routes a work error to the matching handler callback.
pub(crate) fn report(handler: &dyn ErrorHandler, err: &WorkError) {
    match err {
        WorkError::Other(inner) => handler.on_generic(inner.as_ref()),
        other => handler.on_error(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_preserves_message() {
        let err = WorkError::other(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn parse_helper() {
        let err = WorkError::parse("bad digit");
        assert!(matches!(err, WorkError::Parse(msg) if msg == "bad digit"));
    }
}
