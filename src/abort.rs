/// Bail out of a ledger counter that is about to overflow
///
/// A wrapped counter would hand out a dangling payload, so there is nothing
/// to recover here. We log which counter tripped and take the process down.
#[inline(never)]
#[cold]
pub(crate) fn refcount_overflow(counter: &'static str, observed: u64) -> ! {
    log::error!("{counter} count overflowed at {observed}, aborting");
    abort()
}

#[cfg(feature = "std")]
fn abort() -> ! {
    std::process::abort()
}

/// A `no_std`-compatible abort by forcing a panic while already panicking
#[cfg(not(feature = "std"))]
fn abort() -> ! {
    struct PanicOnDrop;

    impl Drop for PanicOnDrop {
        fn drop(&mut self) {
            panic!("ledger counter overflow")
        }
    }

    let _panic_twice = PanicOnDrop;
    panic!("ledger counter overflow")
}
