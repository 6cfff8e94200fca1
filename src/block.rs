//! Combined allocation of a ledger and its payload
//!
//! The block is a single `#[repr(C)]` allocation with the ledger first and
//! the payload right after it, so the ledger pointer doubles as the block
//! pointer. The payload slot is `MaybeUninit`: nothing about the block type
//! itself ever runs the payload's destructor, that is left to the ledger.

use crate::{
    error::AllocError,
    ledger::{Ledger, Parts, Placement},
    Atomic,
};
use alloc::alloc::{alloc, alloc_zeroed, dealloc};
use bytemuck::Zeroable;
use core::{
    alloc::Layout,
    mem::{self, MaybeUninit},
    ptr::{addr_of_mut, NonNull},
};

#[repr(C)]
pub(crate) struct Block<T, A> {
    ledger: Ledger<A>,
    payload: MaybeUninit<T>,
}

impl<T, A: Atomic> Block<T, A> {
    const LAYOUT: Layout = Layout::new::<Self>();

    /// Allocate a block and write its ledger, leaving the payload slot untouched
    ///
    /// The block is never zero-sized since the ledger isn't, so it is always
    /// valid to hand the layout to the global allocator.
    fn allocate(zeroed: bool) -> Result<NonNull<Self>, AllocError> {
        let raw = unsafe {
            if zeroed {
                alloc_zeroed(Self::LAYOUT)
            } else {
                alloc(Self::LAYOUT)
            }
        };

        let Some(block) = NonNull::new(raw.cast::<Self>()) else {
            log::warn!("allocating a {} byte ledger block failed", Self::LAYOUT.size());
            return Err(AllocError::new(Self::LAYOUT));
        };

        unsafe {
            addr_of_mut!((*block.as_ptr()).ledger)
                .write(Ledger::create(Placement::Inline(Self::LAYOUT)));
        }

        Ok(block)
    }

    #[inline]
    fn payload_slot(block: NonNull<Self>) -> NonNull<T> {
        // The payload field is in bounds of a live allocation, so never null
        unsafe { NonNull::new_unchecked(addr_of_mut!((*block.as_ptr()).payload).cast::<T>()) }
    }

    /// Allocate a block and fill its payload slot with whatever `init` produces
    ///
    /// If allocation fails the [`AllocError`] is converted into `E`. If `init`
    /// returns an error or unwinds, the block is deallocated before the error
    /// or panic propagates and no handle is ever built.
    pub(crate) fn try_emplace<F, E>(init: F) -> Result<Parts<T, A>, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<AllocError>,
    {
        let block = Self::allocate(false)?;
        let unfilled = Unfilled(block);

        let value = init()?;

        let payload = Self::payload_slot(block);
        unsafe { payload.as_ptr().write(value) };
        mem::forget(unfilled);

        Ok(Parts {
            payload,
            ledger: block.cast(),
        })
    }

    /// Allocate a block whose payload is the all-zero bit pattern
    pub(crate) fn try_zeroed() -> Result<Parts<T, A>, AllocError>
    where
        T: Zeroable,
    {
        // The ledger is written over the zeroed prefix, the payload keeps its
        // zeroes, which `Zeroable` promises is a valid `T`
        let block = Self::allocate(true)?;

        Ok(Parts {
            payload: Self::payload_slot(block),
            ledger: block.cast(),
        })
    }
}

/// Owns a block whose payload has not been written yet
struct Unfilled<T, A: Atomic>(NonNull<Block<T, A>>);

impl<T, A: Atomic> Drop for Unfilled<T, A> {
    #[cold]
    fn drop(&mut self) {
        log::trace!("payload construction failed, releasing block {:p}", self.0);

        // Only the ledger was written and it has no drop glue
        unsafe { dealloc(self.0.as_ptr().cast(), Block::<T, A>::LAYOUT) }
    }
}

#[cfg(test)]
mod tests {
    use super::Block;
    use crate::{error::AllocError, ledger::Ledger};
    use core::{
        mem::{align_of, size_of},
        sync::atomic::{AtomicU8, AtomicUsize},
    };

    #[repr(align(64))]
    struct Aligned([u8; 3]);

    #[test]
    fn payload_follows_ledger() {
        let parts = Block::<u64, AtomicUsize>::try_emplace(|| Ok::<_, AllocError>(42)).unwrap();

        unsafe {
            let offset = parts.payload.as_ptr() as usize - parts.ledger.as_ptr() as usize;
            assert!(offset >= size_of::<Ledger<AtomicUsize>>());
            assert_eq!(*parts.payload.as_ptr(), 42);

            Ledger::drop_owner(parts.ledger, parts.payload);
        }
    }

    #[test]
    fn over_aligned_payload() {
        let parts =
            Block::<Aligned, AtomicU8>::try_emplace(|| Ok::<_, AllocError>(Aligned([1, 2, 3])))
                .unwrap();

        assert_eq!(parts.payload.as_ptr() as usize % align_of::<Aligned>(), 0);
        unsafe {
            assert_eq!((*parts.payload.as_ptr()).0, [1, 2, 3]);
            Ledger::drop_owner(parts.ledger, parts.payload);
        }
    }

    #[test]
    fn failed_init_is_returned() {
        #[derive(Debug, PartialEq)]
        enum InitError {
            Alloc,
            Rejected,
        }

        impl From<AllocError> for InitError {
            fn from(_: AllocError) -> Self {
                Self::Alloc
            }
        }

        let result = Block::<u64, AtomicUsize>::try_emplace(|| Err(InitError::Rejected));
        assert_eq!(result.err(), Some(InitError::Rejected));
    }

    #[test]
    fn zeroed_payload() {
        let parts = Block::<[u32; 8], AtomicUsize>::try_zeroed().unwrap();

        unsafe {
            assert_eq!(*parts.payload.as_ptr(), [0; 8]);
            assert_eq!(parts.ledger.as_ref().read_owner_count(), 1);
            Ledger::drop_owner(parts.ledger, parts.payload);
        }
    }
}
