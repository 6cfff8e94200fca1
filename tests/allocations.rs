//! Allocation accounting for ledgers and payloads
//!
//! Every test thread keeps its own counts, so tests running in parallel do not
//! see each other's allocations.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::Cell,
    ptr,
};
use tether::{AllocError, Shared, Weak};

struct Counting;

thread_local! {
    static ALLOCS: Cell<usize> = const { Cell::new(0) };
    static DEALLOCS: Cell<usize> = const { Cell::new(0) };
    static FAIL_NEXT: Cell<bool> = const { Cell::new(false) };
    static FAILED: Cell<Option<Layout>> = const { Cell::new(None) };
}

fn bump(counter: &'static std::thread::LocalKey<Cell<usize>>) {
    let _ = counter.try_with(|count| count.set(count.get() + 1));
}

/// Whether this allocation was told to fail, recording its layout if so
fn should_fail(layout: Layout) -> bool {
    let fail = FAIL_NEXT.try_with(|fail| fail.replace(false)).unwrap_or(false);
    if fail {
        let _ = FAILED.try_with(|failed| failed.set(Some(layout)));
    }

    fail
}

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if should_fail(layout) {
            return ptr::null_mut();
        }

        bump(&ALLOCS);
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if should_fail(layout) {
            return ptr::null_mut();
        }

        bump(&ALLOCS);
        System.alloc_zeroed(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        bump(&DEALLOCS);
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: Counting = Counting;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stats {
    allocs: usize,
    deallocs: usize,
}

fn snapshot() -> Stats {
    Stats {
        allocs: ALLOCS.with(Cell::get),
        deallocs: DEALLOCS.with(Cell::get),
    }
}

/// Run `f` and report how many allocations and deallocations it performed
fn measure<R>(f: impl FnOnce() -> R) -> (R, Stats) {
    let before = snapshot();
    let result = f();
    let after = snapshot();

    let stats = Stats {
        allocs: after.allocs - before.allocs,
        deallocs: after.deallocs - before.deallocs,
    };

    (result, stats)
}

/// Make the next allocation on this thread return null
fn fail_next_allocation() {
    FAILED.with(|failed| failed.set(None));
    FAIL_NEXT.with(|fail| fail.set(true));
}

/// The layout of the allocation that was made to fail, if any
fn failed_layout() -> Option<Layout> {
    FAILED.with(Cell::get)
}

const NONE: Stats = Stats {
    allocs: 0,
    deallocs: 0,
};

#[test]
fn combined_construction_is_one_allocation() {
    let (shared, stats) = measure(|| Shared::<u64>::new(10));
    assert_eq!(stats, Stats { allocs: 1, deallocs: 0 });
    assert_eq!(*shared, 10);

    let ((), stats) = measure(|| drop(shared));
    assert_eq!(stats, Stats { allocs: 0, deallocs: 1 });
}

#[test]
fn boxed_construction_allocates_only_the_ledger() {
    let payload = Box::new(10_u64);

    let (shared, stats) = measure(|| Shared::<u64>::from_box(payload));
    assert_eq!(stats, Stats { allocs: 1, deallocs: 0 });

    // Both the payload box and the ledger go
    let ((), stats) = measure(|| drop(shared));
    assert_eq!(stats, Stats { allocs: 0, deallocs: 2 });
}

#[test]
fn handles_never_allocate() {
    let shared = Shared::<String>::new(String::from("payload"));

    let ((), stats) = measure(|| {
        let copy = shared.clone();
        let observer = Weak::from(&copy);
        let observer_copy = observer.clone();
        let locked = observer_copy.lock();
        assert_eq!(locked.use_count(), 3);

        let mut moved = copy;
        let taken = Shared::take(&mut moved);
        assert!(moved.is_empty());
        drop(taken);
    });

    assert_eq!(stats, NONE);

    let ((), stats) = measure(|| {
        let empty = Shared::<String>::default();
        let observer = Weak::from(&empty);
        assert!(observer.lock().is_empty());
    });

    assert_eq!(stats, NONE);
}

#[test]
fn inline_block_outlives_payload_until_last_observer() {
    let shared = Shared::<String>::new(String::from("inline"));
    let observer = Shared::downgrade(&shared);
    let second = observer.clone();

    // Only the payload's own heap buffer goes, the block stays for the observers
    let ((), stats) = measure(|| drop(shared));
    assert_eq!(stats, Stats { allocs: 0, deallocs: 1 });
    assert!(observer.expired());

    let ((), stats) = measure(|| drop(observer));
    assert_eq!(stats, NONE);

    let ((), stats) = measure(|| drop(second));
    assert_eq!(stats, Stats { allocs: 0, deallocs: 1 });
}

#[test]
fn detached_ledger_outlives_payload_until_last_observer() {
    let shared = Shared::<u64>::from_box(Box::new(3));
    let observer = Shared::downgrade(&shared);

    let ((), stats) = measure(|| drop(shared));
    assert_eq!(stats, Stats { allocs: 0, deallocs: 1 });

    let ((), stats) = measure(|| drop(observer));
    assert_eq!(stats, Stats { allocs: 0, deallocs: 1 });
}

#[test]
fn failed_initializer_releases_the_block() {
    #[derive(Debug)]
    enum Error {
        Alloc,
        Rejected,
    }

    impl From<AllocError> for Error {
        fn from(_: AllocError) -> Self {
            Self::Alloc
        }
    }

    let (result, stats) = measure(|| Shared::<u64>::try_new_with(|| Err(Error::Rejected)));
    assert!(matches!(result, Err(Error::Rejected)));
    assert_eq!(stats, Stats { allocs: 1, deallocs: 1 });
}

#[test]
fn unwrapping_releases_block_once_observers_are_gone() {
    let shared = Shared::<u64>::new(8);
    let observer = Weak::from(&shared);

    let (value, stats) = measure(|| Shared::try_unwrap(shared));
    assert_eq!(value.ok(), Some(8));
    assert_eq!(stats, NONE);
    assert!(observer.expired());

    let ((), stats) = measure(|| drop(observer));
    assert_eq!(stats, Stats { allocs: 0, deallocs: 1 });
}

#[test]
fn zeroed_is_one_allocation() {
    let (shared, stats) = measure(Shared::<[u8; 64]>::zeroed);
    assert_eq!(stats, Stats { allocs: 1, deallocs: 0 });
    assert!(shared.iter().all(|&byte| byte == 0));
}

#[test]
fn allocation_failure_is_reported_without_partial_state() {
    fail_next_allocation();
    let (result, stats) = measure(|| Shared::<u64>::try_new(1));

    let error = result.unwrap_err();
    assert_eq!(Some(error.layout()), failed_layout());
    assert!(error.layout().size() > std::mem::size_of::<u64>());
    assert_eq!(stats, NONE);
}

#[test]
fn allocation_failure_converts_into_initializer_error() {
    #[derive(Debug)]
    enum Error {
        Alloc(AllocError),
        Rejected,
    }

    impl From<AllocError> for Error {
        fn from(error: AllocError) -> Self {
            Self::Alloc(error)
        }
    }

    let mut ran = false;
    fail_next_allocation();
    let (result, stats) = measure(|| {
        Shared::<u64>::try_new_with(|| {
            ran = true;
            Err(Error::Rejected)
        })
    });

    // The initializer never runs without a block to write into
    assert!(!ran);
    match result {
        Err(Error::Alloc(error)) => assert_eq!(Some(error.layout()), failed_layout()),
        other => panic!("expected an allocation error, got {other:?}"),
    }
    assert_eq!(stats, NONE);
}

#[test]
fn zeroed_allocation_failure_is_reported() {
    fail_next_allocation();
    let (result, stats) = measure(Shared::<[u8; 64]>::try_zeroed);

    let error = result.unwrap_err();
    assert_eq!(Some(error.layout()), failed_layout());
    assert!(error.to_string().starts_with("failed to allocate"));
    assert_eq!(stats, NONE);
}
