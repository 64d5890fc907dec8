//! Page-chained bump arena holding deferred work items inline.
//!
//! Each page stores a run of records `[next_word | vtable | payload…]`
//! where `next_word` is the page-relative byte offset of the successor
//! record's header, `0` for end-of-list, or [`NEXT_PAGE`] meaning the walk
//! continues at offset 0 of the following page. Offsets rather than
//! addresses keep the encoding position-independent. The cursor always
//! points at a zeroed `next_word`; every page is allocated with enough
//! slack past its capacity that a full record header fits there, which is
//! what lets a page-break record terminate a full page.

use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::error::{self, ErrorHandler, WorkResult};
use crate::work::{ApplyCtx, PageBreak, Record};

/// Natural word size; records and payloads are aligned to it.
pub(crate) const WORD: usize = mem::size_of::<usize>();

/// `next_word` sentinel: the chain continues on the following page.
const NEXT_PAGE: usize = usize::MAX;

const HEADER_BYTES: usize = mem::size_of::<RecordHeader>();

/// First page capacity; growth is geometric from here.
const FIRST_PAGE_BYTES: usize = 4096 - HEADER_BYTES;

pub(crate) const fn align_up(n: usize) -> usize {
    (n + WORD - 1) & !(WORD - 1)
}

#[repr(C)]
struct RecordHeader {
    next: usize,
    vtable: *const RecordVTable,
}

/// Type-erased entry points for one record. A static pair of function
/// pointers per concrete type stands in for a per-item vtable allocation,
/// so heterogeneous items share one buffer.
pub(crate) struct RecordVTable {
    pub(crate) apply: unsafe fn(*mut u8, &mut ApplyCtx<'_>) -> WorkResult<()>,
    pub(crate) drop_in_place: unsafe fn(*mut u8),
}

unsafe fn apply_erased<W: Record>(payload: *mut u8, ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
    unsafe { (*payload.cast::<W>()).apply(ctx) }
}

unsafe fn drop_erased<W>(payload: *mut u8) {
    unsafe { ptr::drop_in_place(payload.cast::<W>()) }
}

struct VTableFor<W>(PhantomData<W>);

impl<W: Record> VTableFor<W> {
    const VTABLE: RecordVTable = RecordVTable {
        apply: apply_erased::<W>,
        drop_in_place: drop_erased::<W>,
    };
}

fn vtable_for<W: Record>() -> &'static RecordVTable {
    &VTableFor::<W>::VTABLE
}

struct Page {
    data: *mut u8,
    layout: Layout,
    capacity: usize,
    next: Option<Box<Page>>,
}

impl Page {
    fn new(capacity: usize) -> Box<Page> {
        let capacity = align_up(capacity);
        // Slack for the header of a terminating page-break record.
        let layout = Layout::from_size_align(capacity + HEADER_BYTES, WORD)
            .expect("arena page layout");
        let data = unsafe { alloc(layout) };
        if data.is_null() {
            handle_alloc_error(layout);
        }
        // Terminator at offset 0: the page starts out empty.
        unsafe { *data.cast::<usize>() = 0 };
        Box::new(Page {
            data,
            layout,
            capacity,
            next: None,
        })
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        unsafe { dealloc(self.data, self.layout) };
    }
}

/// A chained bump allocator whose records form a forward-linked list of
/// work items. One arena is one swap-queue page; the sequence-number tag
/// identifies which generation of content it currently holds.
pub struct Arena {
    first: *mut Page,
    tail: *mut Page,
    cursor: usize,
    seq: AtomicU64,
}

// SAFETY: the swap queue hands an arena to exactly one thread at a time
// (whichever side currently owns the page pointer), and the sequence tag
// is atomic. Cross-thread hand-off is ordered by the queue's locks.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new() -> Self {
        Self::with_page_size(FIRST_PAGE_BYTES)
    }

    /// An arena whose head page has the given capacity. Mainly useful for
    /// exercising page growth with small payloads.
    pub fn with_page_size(bytes: usize) -> Self {
        let first = Box::into_raw(Page::new(bytes.max(HEADER_BYTES + WORD)));
        Arena {
            first,
            tail: first,
            cursor: 0,
            seq: AtomicU64::new(0),
        }
    }

    /// Generation tag, read and written by the swap queue.
    pub fn sequence_number(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn set_sequence_number(&self, sn: u64) {
        self.seq.store(sn, Ordering::Release);
    }

    /// True if the record chain holds no items.
    pub fn is_empty(&self) -> bool {
        unsafe { *(*self.first).data.cast::<usize>() == 0 }
    }

    /// Appends a work item to the record chain.
    pub fn push<W: Record>(&mut self, item: W) {
        self.push_with(&[], move |_| item);
    }

    /// Appends a work item together with a byte payload copied into the
    /// same record. The builder receives the address of the copied bytes,
    /// which stay valid until the item is dropped at [`clear`](Self::clear).
    pub fn push_with<W, F>(&mut self, tail_bytes: &[u8], build: F)
    where
        W: Record,
        F: FnOnce(NonNull<u8>) -> W,
    {
        const {
            assert!(
                mem::align_of::<W>() <= WORD,
                "work items must not need more than word alignment"
            );
        }
        let item_bytes = align_up(mem::size_of::<W>());
        let needed = HEADER_BYTES + item_bytes + align_up(tail_bytes.len());
        unsafe {
            if self.cursor + needed > (*self.tail).capacity {
                self.grow(needed);
            }
            let page = self.tail;
            let slot = (*page).data.add(self.cursor);
            let payload = slot.add(HEADER_BYTES);
            let tail_ptr = payload.add(item_bytes);
            ptr::copy_nonoverlapping(tail_bytes.as_ptr(), tail_ptr, tail_bytes.len());
            let item = build(NonNull::new_unchecked(tail_ptr));
            ptr::write(payload.cast::<W>(), item);
            let header = slot.cast::<RecordHeader>();
            (*header).vtable = vtable_for::<W>();
            // Zero the new terminator first, then link the record in.
            let next_cursor = self.cursor + needed;
            *(*page).data.add(next_cursor).cast::<usize>() = 0;
            (*header).next = next_cursor;
            self.cursor = next_cursor;
        }
    }

    /// The record at the cursor would not fit: terminate this page with a
    /// page-break record and chain a fresh page.
    unsafe fn grow(&mut self, needed: usize) {
        unsafe {
            let slot = (*self.tail).data.add(self.cursor).cast::<RecordHeader>();
            (*slot).vtable = vtable_for::<PageBreak>();
            (*slot).next = NEXT_PAGE;

            let capacity = (2 * (*self.tail).capacity).max(2 * needed);
            trace!(capacity, "arena chaining a new page");
            let mut page = Page::new(capacity);
            let raw: *mut Page = &mut *page;
            (*self.tail).next = Some(page);
            self.tail = raw;
            self.cursor = 0;
        }
    }

    /// Walks the record chain in insertion order.
    unsafe fn for_each(&mut self, mut visit: impl FnMut(*const RecordVTable, *mut u8)) {
        unsafe {
            let mut page = self.first;
            let mut offset = 0usize;
            loop {
                let slot = (*page).data.add(offset);
                let next = *slot.cast::<usize>();
                if next == 0 {
                    break;
                }
                let header = slot.cast::<RecordHeader>();
                visit((*header).vtable, slot.add(HEADER_BYTES));
                if next == NEXT_PAGE {
                    debug_assert!((*page).next.is_some(), "dangling page link");
                    page = match (*page).next {
                        Some(ref mut boxed) => &mut **boxed as *mut Page,
                        None => break,
                    };
                    offset = 0;
                } else {
                    offset = next;
                }
            }
        }
    }

    /// Applies every work item in insertion order against the bound sink
    /// and source. Failures and panics are routed to the error handler and
    /// the walk continues; items are *not* dropped and pages are *not*
    /// freed; both happen at the next [`clear`](Self::clear).
    pub fn drain(&mut self, ctx: &mut ApplyCtx<'_>, handler: &dyn ErrorHandler) {
        unsafe {
            self.for_each(|vtable, payload| {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| ((*vtable).apply)(payload, ctx)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error::report(handler, &err),
                    Err(_) => handler.on_panic(),
                }
            });
        }
    }

    /// Drops every work item in chain order, frees all pages except the
    /// head, and resets the cursors. Idempotent. The head page is kept as
    /// a hot starting point for the next generation.
    pub fn clear(&mut self) {
        unsafe {
            self.for_each(|vtable, payload| ((*vtable).drop_in_place)(payload));
            *(*self.first).data.cast::<usize>() = 0;
            (*self.first).next = None;
            self.tail = self.first;
            self.cursor = 0;
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.clear();
        unsafe { drop(Box::from_raw(self.first)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkError;
    use crate::test_support::CountingHandler;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct Note {
        log: Arc<parking_lot::Mutex<Vec<u32>>>,
        id: u32,
    }

    impl Record for Note {
        fn apply(&mut self, _ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
            self.log.lock().push(self.id);
            Ok(())
        }
    }

    struct DropProbe {
        drops: Arc<AtomicUsize>,
    }

    impl Record for DropProbe {
        fn apply(&mut self, _ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
            Ok(())
        }
    }

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fails;

    impl Record for Fails {
        fn apply(&mut self, _ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
            Err(WorkError::parse("intentional"))
        }
    }

    struct Panics;

    impl Record for Panics {
        fn apply(&mut self, _ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
            panic!("intentional");
        }
    }

    fn drain_all(arena: &mut Arena, handler: &CountingHandler) {
        let mut ctx = ApplyCtx::new(None, None);
        arena.drain(&mut ctx, handler);
    }

    #[test]
    fn records_apply_in_insertion_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut arena = Arena::new();
        for id in 0..100 {
            arena.push(Note {
                log: log.clone(),
                id,
            });
        }
        let handler = CountingHandler::default();
        drain_all(&mut arena, &handler);
        assert_eq!(*log.lock(), (0..100).collect::<Vec<_>>());
        assert_eq!(handler.total(), 0);
    }

    #[test]
    fn growth_chains_pages_and_preserves_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        // Tiny head page so almost every push crosses a page boundary.
        let mut arena = Arena::with_page_size(64);
        let blob = [0xAAu8; 48];
        for id in 0..50 {
            arena.push_with(&blob, |_ptr| Note {
                log: log.clone(),
                id,
            });
        }
        let handler = CountingHandler::default();
        drain_all(&mut arena, &handler);
        assert_eq!(*log.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn tail_bytes_are_copied_into_the_record() {
        struct Echo {
            ptr: NonNull<u8>,
            len: usize,
            seen: Arc<parking_lot::Mutex<Vec<u8>>>,
        }
        unsafe impl Send for Echo {}
        impl Record for Echo {
            fn apply(&mut self, _ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
                let bytes =
                    unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) };
                self.seen.lock().extend_from_slice(bytes);
                Ok(())
            }
        }

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut arena = Arena::new();
        let mut scratch = *b"hello";
        arena.push_with(&scratch, |ptr| Echo {
            ptr,
            len: 5,
            seen: seen.clone(),
        });
        // Clobber the caller's buffer; the record must hold its own copy.
        scratch = *b"XXXXX";
        let _ = scratch;
        let handler = CountingHandler::default();
        drain_all(&mut arena, &handler);
        assert_eq!(seen.lock().as_slice(), b"hello");
    }

    #[test]
    fn clear_drops_items_and_keeps_the_head_page() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut arena = Arena::with_page_size(64);
        for _ in 0..20 {
            arena.push(DropProbe {
                drops: drops.clone(),
            });
        }
        assert!(!arena.is_empty());
        arena.clear();
        assert_eq!(drops.load(Ordering::SeqCst), 20);
        assert!(arena.is_empty());
        // Idempotent.
        arena.clear();
        assert_eq!(drops.load(Ordering::SeqCst), 20);
        // The head page is still usable.
        arena.push(DropProbe {
            drops: drops.clone(),
        });
        arena.clear();
        assert_eq!(drops.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn drop_without_clear_still_drops_items() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let mut arena = Arena::new();
            for _ in 0..5 {
                arena.push(DropProbe {
                    drops: drops.clone(),
                });
            }
        }
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn failures_are_reported_and_do_not_stop_the_drain() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut arena = Arena::new();
        arena.push(Fails);
        arena.push(Note {
            log: log.clone(),
            id: 7,
        });
        arena.push(Panics);
        arena.push(Note {
            log: log.clone(),
            id: 8,
        });
        let handler = CountingHandler::default();
        drain_all(&mut arena, &handler);
        assert_eq!(*log.lock(), vec![7, 8]);
        assert_eq!(handler.errors(), 1);
        assert_eq!(handler.panics(), 1);
    }

    #[test]
    fn sequence_number_round_trips() {
        let arena = Arena::new();
        assert_eq!(arena.sequence_number(), 0);
        arena.set_sequence_number(41);
        assert_eq!(arena.sequence_number(), 41);
    }
}
