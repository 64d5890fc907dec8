//! The two-page swap queue: an SPSC hand-off over exactly two arena pages.
//!
//! A stripped-down cousin of the LMAX disruptor with just two buffer
//! pages. The producer appends work items into the *inserter* page while
//! the consumer drains the *consumer* page; the pages trade places when
//! both short spin locks can be held at once. Sequence numbers stamped on
//! the pages decide emptiness and hand-off order.
//!
//! Field placement is part of the protocol, not a tuning knob: the
//! producer-written, consumer-written, coordination, and rarely-written
//! fields each sit on their own cache line so the two hot paths never
//! false-share.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::arena::Arena;
use crate::sync::SpinLock;

/// Fields only the producer writes.
///
/// `seq_gen` and `switched_pages` use `UnsafeCell` instead of atomics
/// because they are only ever touched while `inserting` is held; the lock
/// acquire/release pairs provide the ordering.
struct ProducerSide {
    inserting: SpinLock,
    last_inserted: AtomicU64,
    switched_pages: UnsafeCell<u64>,
    seq_gen: UnsafeCell<u64>,
}

/// Fields only the consumer writes.
struct ConsumerSide {
    consuming: SpinLock,
    last_consumed: AtomicU64,
}

/// Fields written by whichever side performs a swap.
struct CoordSide {
    inserter: AtomicPtr<Arena>,
    consumer: AtomicPtr<Arena>,
    last_enqueued: AtomicU64,
}

/// Touched only when the consumer finds the producer mid-insert.
struct ColdSide {
    consumer_couldnt_switch: AtomicU64,
}

/// Two-page swap queue over a pair of [`Arena`] pages.
///
/// Multiple producers are tolerated (they serialize at the inserting
/// lock); at most one consumer may drain at a time. A second contender
/// gets [`Consume::Busy`] and should back off.
pub struct SwapQueue {
    producer: CachePadded<ProducerSide>,
    consumer: CachePadded<ConsumerSide>,
    coord: CachePadded<CoordSide>,
    cold: CachePadded<ColdSide>,
}

// SAFETY: the UnsafeCell fields are only accessed under `inserting`; the
// arena pointers are only dereferenced by the side that owns them per the
// swap protocol; everything else is atomic.
unsafe impl Send for SwapQueue {}
unsafe impl Sync for SwapQueue {}

impl SwapQueue {
    /// Binds the queue to its two pages.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid, distinct, and outlive the queue, and
    /// the pages must not be touched except through this queue's guards.
    pub unsafe fn new(page_a: *mut Arena, page_b: *mut Arena) -> Self {
        debug_assert!(!page_a.is_null() && !page_b.is_null());
        debug_assert!(page_a != page_b);
        unsafe {
            (*page_a).set_sequence_number(0);
            (*page_b).set_sequence_number(0);
        }
        SwapQueue {
            producer: CachePadded::new(ProducerSide {
                inserting: SpinLock::new(),
                last_inserted: AtomicU64::new(1),
                switched_pages: UnsafeCell::new(0),
                seq_gen: UnsafeCell::new(1),
            }),
            consumer: CachePadded::new(ConsumerSide {
                consuming: SpinLock::new(),
                last_consumed: AtomicU64::new(1),
            }),
            coord: CachePadded::new(CoordSide {
                inserter: AtomicPtr::new(page_a),
                consumer: AtomicPtr::new(page_b),
                last_enqueued: AtomicU64::new(1),
            }),
            cold: CachePadded::new(ColdSide {
                consumer_couldnt_switch: AtomicU64::new(0),
            }),
        }
    }

    /// Opens a producer transaction, blocking on the inserting lock.
    ///
    /// If the inserter page came back from the consumer since the last
    /// insert, it is cleared here, on the producer thread. That keeps the
    /// page's cache lines owned by the producer instead of bouncing them
    /// from the drain thread.
    pub fn begin_insert(&self) -> InsertGuard<'_> {
        self.producer.inserting.lock();
        // SAFETY: producer-only cell, inserting lock held.
        let sn = unsafe {
            let generator = &mut *self.producer.seq_gen.get();
            *generator += 1;
            *generator
        };
        let page = self.coord.inserter.load(Ordering::Relaxed);
        // SAFETY: holding `inserting` makes us the page's owner.
        let isn = unsafe { (*page).sequence_number() };
        let esn = self.coord.last_enqueued.load(Ordering::Acquire);
        let mut fresh = false;
        if isn <= esn {
            fresh = true;
            if isn < esn {
                unsafe { (*page).clear() };
            }
        }
        unsafe { (*page).set_sequence_number(sn) };
        self.producer.last_inserted.store(sn, Ordering::Release);
        InsertGuard {
            queue: self,
            page,
            fresh,
        }
    }

    /// Pre-pays the page clear a future [`begin_insert`](Self::begin_insert)
    /// would otherwise do, so the first hot-path insert is cheaper.
    pub fn warmup_before_inserting(&self) {
        self.producer.inserting.lock();
        let page = self.coord.inserter.load(Ordering::Relaxed);
        // SAFETY: holding `inserting` makes us the page's owner.
        unsafe {
            let isn = (*page).sequence_number();
            let esn = self.coord.last_enqueued.load(Ordering::Acquire);
            if isn < esn {
                (*page).clear();
                (*page).set_sequence_number(esn);
            }
        }
        self.producer.inserting.unlock();
    }

    /// Attempts to open a consumer transaction. Never blocks.
    pub fn try_consume(&self) -> Consume<'_> {
        if self.coord.last_enqueued.load(Ordering::Acquire)
            <= self.consumer.last_consumed.load(Ordering::Acquire)
        {
            // Nothing handed off yet; swapping is normally our job.
            if !self.producer.inserting.try_lock() {
                // Producer is mid-insert, so we cannot swap. Complain and
                // the producer will swap for us on its way out.
                self.cold
                    .consumer_couldnt_switch
                    .fetch_add(1, Ordering::AcqRel);
                return Consume::Retry;
            }
            if self.producer.last_inserted.load(Ordering::Acquire)
                > self.coord.last_enqueued.load(Ordering::Acquire)
            {
                // Something is waiting on the other page.
                // SAFETY: both locks held (we are the consumer side).
                unsafe { self.switch_pages() };
                self.producer.inserting.unlock();
            } else {
                self.producer.inserting.unlock();
                return Consume::Empty;
            }
            if self.coord.last_enqueued.load(Ordering::Acquire)
                <= self.consumer.last_consumed.load(Ordering::Acquire)
            {
                return Consume::Empty;
            }
        }

        if !self.consumer.consuming.try_lock() {
            return Consume::Busy;
        }
        let page = self.coord.consumer.load(Ordering::Relaxed);
        // SAFETY: holding `consuming` makes us the page's owner.
        let sn = unsafe { (*page).sequence_number() };
        self.consumer.last_consumed.store(sn, Ordering::Release);
        Consume::Consumed(ConsumeGuard { queue: self, page })
    }

    /// Number of inserts not consumed yet. A dirty read: the consumed
    /// sequence number is loaded first so the value never goes negative.
    pub fn len(&self) -> u64 {
        let consumed = self.consumer.last_consumed.load(Ordering::Acquire);
        let inserted = self.producer.last_inserted.load(Ordering::Acquire);
        inserted.wrapping_sub(consumed)
    }

    pub fn is_empty(&self) -> bool {
        self.producer.last_inserted.load(Ordering::Acquire)
            == self.consumer.last_consumed.load(Ordering::Acquire)
    }

    /// Generation stamped on the page most recently handed to the
    /// consumer. Dirty read, for introspection and tests.
    pub fn last_enqueued_sn(&self) -> u64 {
        self.coord.last_enqueued.load(Ordering::Acquire)
    }

    pub fn last_inserted_sn(&self) -> u64 {
        self.producer.last_inserted.load(Ordering::Acquire)
    }

    pub fn last_consumed_sn(&self) -> u64 {
        self.consumer.last_consumed.load(Ordering::Acquire)
    }

    /// Trades the inserter and consumer pages and exposes the new consumer
    /// page's generation.
    ///
    /// # Safety
    ///
    /// Both `inserting` and `consuming` must be held.
    unsafe fn switch_pages(&self) {
        let inserter = self.coord.inserter.load(Ordering::Relaxed);
        let consumer = self.coord.consumer.load(Ordering::Relaxed);
        self.coord.inserter.store(consumer, Ordering::Relaxed);
        self.coord.consumer.store(inserter, Ordering::Relaxed);
        // SAFETY: caller holds both locks; the page is quiescent.
        let sn = unsafe { (*inserter).sequence_number() };
        debug_assert!(
            sn > self.coord.last_enqueued.load(Ordering::Relaxed),
            "page generations must be handed off in increasing order"
        );
        self.coord.last_enqueued.store(sn, Ordering::Release);
    }
}

/// Outcome of [`SwapQueue::try_consume`].
pub enum Consume<'q> {
    /// A page was acquired; the queue was provably non-empty.
    Consumed(ConsumeGuard<'q>),
    /// Nothing to do.
    Empty,
    /// The producer was mid-insert so the hand-off could not happen yet;
    /// the queue is not empty, try again soon.
    Retry,
    /// Another consumer holds the consuming lock; the queue is not empty
    /// but there is no shortage of drainers.
    Busy,
}

impl Consume<'_> {
    pub fn consumed(&self) -> bool {
        matches!(self, Consume::Consumed(_))
    }

    pub fn queue_not_empty(&self) -> bool {
        !matches!(self, Consume::Empty)
    }
}

/// Producer transaction: insert into [`arena`](Self::arena), then drop to
/// commit.
///
/// Commit normally leaves swapping to the consumer, but if the consumer
/// signalled that it could not swap because this producer held the lock,
/// the commit takes responsibility and swaps on the way out. That is what
/// keeps the consumer live under a dominant producer.
pub struct InsertGuard<'q> {
    queue: &'q SwapQueue,
    page: *mut Arena,
    fresh: bool,
}

impl InsertGuard<'_> {
    /// Whether this transaction is the first to touch a freshly recycled
    /// page (as opposed to appending to one already in flight).
    pub fn fresh_page(&self) -> bool {
        self.fresh
    }

    pub fn arena(&mut self) -> &mut Arena {
        // SAFETY: the guard holds `inserting`, making it the page owner.
        unsafe { &mut *self.page }
    }
}

impl Drop for InsertGuard<'_> {
    fn drop(&mut self) {
        let q = self.queue;
        // SAFETY: producer-only cell, inserting lock still held.
        let switched = unsafe { *q.producer.switched_pages.get() };
        let couldnt = q.cold.consumer_couldnt_switch.load(Ordering::Acquire);
        if switched != couldnt {
            if q.consumer.consuming.try_lock() {
                if q.coord.last_enqueued.load(Ordering::Acquire)
                    <= q.consumer.last_consumed.load(Ordering::Acquire)
                {
                    // SAFETY: both locks held.
                    unsafe {
                        q.switch_pages();
                        *q.producer.switched_pages.get() = couldnt;
                    }
                }
                q.consumer.consuming.unlock();
            }
        }
        q.producer.inserting.unlock();
    }
}

/// Consumer transaction: drain [`arena`](Self::arena), then drop to
/// commit. Commit tries to swap so the next generation is exposed without
/// waiting for another `try_consume`.
pub struct ConsumeGuard<'q> {
    queue: &'q SwapQueue,
    page: *mut Arena,
}

impl ConsumeGuard<'_> {
    pub fn arena(&mut self) -> &mut Arena {
        // SAFETY: the guard holds `consuming`, making it the page owner.
        unsafe { &mut *self.page }
    }

    /// Address identity of the acquired page; lets callers observe the
    /// two pages alternating.
    pub fn page_id(&self) -> usize {
        self.page as usize
    }
}

impl Drop for ConsumeGuard<'_> {
    fn drop(&mut self) {
        let q = self.queue;
        if q.producer.inserting.try_lock() {
            if q.producer.last_inserted.load(Ordering::Acquire)
                > q.coord.last_enqueued.load(Ordering::Acquire)
            {
                // SAFETY: both locks held.
                unsafe { q.switch_pages() };
            }
            q.producer.inserting.unlock();
        }
        q.consumer.consuming.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::QueuePair;

    #[test]
    fn starts_empty() {
        let pair = QueuePair::new();
        let q = pair.queue();
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
        assert!(matches!(q.try_consume(), Consume::Empty));
    }

    #[test]
    fn insert_then_consume_round_trip() {
        let pair = QueuePair::new();
        let q = pair.queue();

        {
            let mut txn = q.begin_insert();
            assert!(txn.fresh_page());
            txn.arena().push(crate::work::PageBreak);
        }
        assert!(!q.is_empty());
        assert_eq!(q.len(), 1);

        match q.try_consume() {
            Consume::Consumed(mut txn) => {
                assert!(!txn.arena().is_empty());
            }
            _ => panic!("expected a consumable page"),
        }
        assert!(q.is_empty());
        assert!(matches!(q.try_consume(), Consume::Empty));
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let pair = QueuePair::new();
        let q = pair.queue();
        let mut previous = (q.last_inserted_sn(), q.last_enqueued_sn(), q.last_consumed_sn());
        for _ in 0..20 {
            drop(q.begin_insert());
            let _ = q.try_consume();
            let now = (q.last_inserted_sn(), q.last_enqueued_sn(), q.last_consumed_sn());
            assert!(now.0 >= previous.0);
            assert!(now.1 >= previous.1);
            assert!(now.2 >= previous.2);
            assert!(now.0 >= now.1 && now.1 >= now.2);
            previous = now;
        }
        assert!(q.is_empty());
    }

    #[test]
    fn pages_alternate_between_generations() {
        let pair = QueuePair::new();
        let q = pair.queue();
        let mut seen = Vec::new();
        for _ in 0..6 {
            drop(q.begin_insert());
            match q.try_consume() {
                Consume::Consumed(txn) => seen.push(txn.page_id()),
                other => panic!("expected consumed, got empty={}", !other.queue_not_empty()),
            }
        }
        for pair_ids in seen.windows(2) {
            assert_ne!(pair_ids[0], pair_ids[1], "consumer must alternate pages");
        }
    }

    #[test]
    fn second_consumer_is_turned_away() {
        let pair = QueuePair::new();
        let q = pair.queue();
        drop(q.begin_insert());
        let first = q.try_consume();
        assert!(first.consumed());
        // More work lands while the first transaction is still open; a
        // contender sees a non-empty queue but must not also get a page.
        drop(q.begin_insert());
        let second = q.try_consume();
        assert!(matches!(second, Consume::Busy));
        assert!(second.queue_not_empty());
        assert!(!second.consumed());
        drop(first);
        // Once the first drainer commits, the new generation is
        // consumable.
        assert!(q.try_consume().consumed());
    }

    #[test]
    fn consumer_blocked_by_open_insert_reports_retry() {
        let pair = QueuePair::new();
        let q = pair.queue();
        let txn = q.begin_insert();
        // The producer holds the inserting lock, so the consumer can
        // neither prove emptiness nor swap.
        let result = q.try_consume();
        assert!(matches!(result, Consume::Retry));
        assert!(result.queue_not_empty());
        drop(txn);
        // After the commit (which swaps on the consumer's behalf), the
        // page is consumable.
        assert!(q.try_consume().consumed());
    }

    #[test]
    fn warmup_is_idempotent_and_keeps_the_queue_empty() {
        let pair = QueuePair::new();
        let q = pair.queue();
        q.warmup_before_inserting();
        q.warmup_before_inserting();
        assert!(q.is_empty());
        drop(q.begin_insert());
        assert!(q.try_consume().consumed());
        q.warmup_before_inserting();
        assert!(q.is_empty());
    }
}
