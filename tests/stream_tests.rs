//! End-to-end stream scenarios: submission on one thread, application on
//! another, nothing lost and nothing reordered.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use swapstream::test_support::{CountingHandler, wait_until};
use swapstream::{
    ApplyCtx, IdleService, MemorySink, MemorySource, ParseTarget, PollingService, Record, Sink,
    Stream, StreamState, WaitingService, WorkError, WorkResult,
};

fn counting() -> Arc<CountingHandler> {
    init_tracing();
    Arc::new(CountingHandler::default())
}

/// Honors `RUST_LOG` so a failing run can be rerun with the engine's
/// trace output.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

#[test]
fn three_formatters_drain_to_123() {
    let handler = counting();
    let service = PollingService::with_period(Duration::from_millis(1), handler.clone());
    let observer = MemorySink::new();
    let stream = Stream::writer(observer.clone(), service.clone());
    stream.write(1);
    stream.write(2);
    stream.write(3);
    assert!(wait_until(Duration::from_secs(5), || {
        observer.contents_string() == "123"
    }));
    assert_eq!(handler.total(), 0);
    drop(stream);
}

#[test]
fn raw_write_then_completion_callback_in_order() {
    let observer = MemorySink::new();
    let stream = Stream::writer(observer.clone(), IdleService::new(counting()));
    let at_callback = Arc::new(Mutex::new(None));
    let slot = at_callback.clone();
    let sink_view = observer.clone();
    stream.write_bytes(b"hello");
    stream.when_done(move || {
        *slot.lock() = Some(sink_view.contents_string());
    });
    stream.try_drain();
    assert_eq!(observer.contents_string(), "hello");
    // The callback ran after the write, not before.
    assert_eq!(at_callback.lock().as_deref(), Some("hello"));
}

#[test]
fn two_producers_keep_their_own_order() {
    let handler = counting();
    let service = PollingService::with_period(Duration::from_millis(1), handler.clone());
    let observer = MemorySink::new();
    {
        let stream = Stream::writer(observer.clone(), service.clone());
        std::thread::scope(|scope| {
            for tag in ["A", "B"] {
                let stream = &stream;
                scope.spawn(move || {
                    for i in 0..500 {
                        stream.write_str(&format!("{tag}{i:03}"));
                    }
                });
            }
        });
    }
    // The stream is dropped: everything submitted has been applied.
    let contents = observer.contents_string();
    assert_eq!(contents.len(), 1000 * 4);
    for tag in ["A", "B"] {
        let mine: Vec<&str> = contents
            .as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).unwrap())
            .filter(|chunk| chunk.starts_with(tag))
            .collect();
        assert_eq!(mine.len(), 500);
        for (i, chunk) in mine.iter().enumerate() {
            assert_eq!(*chunk, format!("{tag}{i:03}"));
        }
    }
    assert_eq!(handler.total(), 0);
}

#[test]
fn async_write_reports_state_and_count() {
    let observer = MemorySink::new();
    let stream = Stream::writer(observer.clone(), IdleService::new(counting()));
    let report = Arc::new(Mutex::new(None));
    let slot = report.clone();
    stream.async_write(b"data", move |state, written| {
        *slot.lock() = Some((state, written));
    });
    stream.try_drain();
    let (state, written) = report.lock().take().expect("handler must run");
    assert!(state.is_good());
    assert_eq!(written, 4);
    assert_eq!(observer.contents_string(), "data");
}

struct Explodes;

#[derive(Debug, thiserror::Error)]
#[error("user work exploded")]
struct UserError;

impl Record for Explodes {
    fn apply(&mut self, _ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
        Err(WorkError::other(UserError))
    }
}

#[test]
fn failing_item_is_reported_once_and_drain_continues() {
    let handler = counting();
    let observer = MemorySink::new();
    let stream = Stream::writer(observer.clone(), IdleService::new(handler.clone()));
    stream.submit(Explodes);
    stream.write_str("ok");
    stream.try_drain();
    assert_eq!(observer.contents_string(), "ok");
    assert_eq!(handler.generics(), 1);
    assert_eq!(handler.generic_messages(), vec!["user work exploded"]);
    assert_eq!(handler.errors(), 0);
}

#[test]
fn dropping_a_stream_applies_pending_work_exactly_once() {
    let applied = Arc::new(AtomicUsize::new(0));
    let observer = MemorySink::new();
    {
        let stream = Stream::writer(observer.clone(), IdleService::new(counting()));
        stream.write(7);
        let applied = applied.clone();
        stream.when_done(move || {
            applied.fetch_add(1, Ordering::SeqCst);
        });
        // No explicit drain: the destructor must do it.
    }
    assert_eq!(observer.contents_string(), "7");
    assert_eq!(applied.load(Ordering::SeqCst), 1);
}

#[test]
fn parse_and_async_parse_fill_their_targets() {
    let handler = counting();
    let observer = MemorySink::new();
    let source = MemorySource::new("311 622 ");
    let stream = Stream::duplex(observer.clone(), source, IdleService::new(handler.clone()));

    let first = ParseTarget::new(0u32);
    stream.read_into(&first);

    let second = ParseTarget::new(0u32);
    let report = Arc::new(Mutex::new(None));
    let slot = report.clone();
    stream.async_parse(&second, move |state, n| {
        *slot.lock() = Some((state, n));
    });

    stream.try_drain();
    assert_eq!(first.get(), 311);
    assert_eq!(second.get(), 622);
    let (state, n) = report.lock().take().expect("handler must run");
    assert!(!state.contains(StreamState::FAIL));
    // The wrapped reader does not report progress.
    assert_eq!(n, 0);
    assert_eq!(handler.total(), 0);
}

#[test]
fn waiting_service_drains_a_burst_from_another_thread() {
    let handler = counting();
    let service = WaitingService::new(handler.clone());
    let observer = MemorySink::new();
    let stream = Stream::writer(observer.clone(), service.clone());
    std::thread::scope(|scope| {
        let stream = &stream;
        scope.spawn(move || {
            for i in 0..100 {
                stream.write(i % 10);
            }
        });
    });
    assert!(wait_until(Duration::from_secs(5), || observer.len() == 100));
    drop(stream);
    service.stop();
    service.join();
    assert!(service.stopped());
    assert_eq!(handler.total(), 0);
}

#[test]
fn state_manipulators_round_trip_through_the_queue() {
    let observer = MemorySink::new();
    let stream = Stream::writer(observer.clone(), IdleService::new(counting()));
    stream.set_state(StreamState::FAIL);
    stream.clear_state(StreamState::GOOD);
    stream.write_str("after");
    stream.try_drain();
    assert!(observer.state().is_good());
    assert_eq!(observer.contents_string(), "after");
}

#[test]
fn with_sink_runs_in_submission_order() {
    let observer = MemorySink::new();
    let stream = Stream::writer(observer.clone(), IdleService::new(counting()));
    stream.write_str("x");
    stream.with_sink(|sink| {
        sink.write_all(b"-configured-")?;
        Ok(())
    });
    stream.write_str("y");
    stream.try_drain();
    assert_eq!(observer.contents_string(), "x-configured-y");
}

#[test]
fn large_payloads_cross_arena_pages_intact() {
    // Bigger than the first arena page, so the record chain must grow and
    // page-break while the queue is live.
    let blob: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let observer = MemorySink::new();
    let stream = Stream::writer(observer.clone(), IdleService::new(counting()));
    stream.write_bytes(&blob);
    stream.write_str("tail");
    stream.try_drain();
    let contents = observer.contents();
    assert_eq!(&contents[..blob.len()], &blob[..]);
    assert_eq!(&contents[blob.len()..], b"tail");
}
