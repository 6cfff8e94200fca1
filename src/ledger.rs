//! The control block shared by every [`Shared`] and [`Weak`] pointing at one payload
//!
//! A ledger carries two counters. `owners` is the number of live [`Shared`]
//! handles. `observers` is the number of live [`Weak`] handles *plus one*:
//! the owners collectively hold a single observer unit, so the ledger itself
//! always outlives the payload and the last owner can still touch it after
//! the payload is gone. That unit is released exactly once, by whichever
//! [`Ledger::drop_owner`] brings `owners` to zero.
//!
//! [`Shared`]: crate::Shared
//! [`Weak`]: crate::Weak

use crate::{abort::refcount_overflow, atomic::Atomic};
use alloc::{alloc::dealloc, boxed::Box};
use core::{
    alloc::Layout,
    ptr::{self, NonNull},
    sync::atomic::Ordering,
};

/// Where the payload lives relative to its ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// The payload sits in its own `Box` and the ledger was boxed separately
    Detached,
    /// Ledger and payload share one block allocated with this layout
    Inline(Layout),
}

#[repr(C)]
pub(crate) struct Ledger<A> {
    owners: A,
    observers: A,
    placement: Placement,
}

impl<A: Atomic> Ledger<A> {
    /// A fresh ledger for a payload that has exactly one owner
    #[inline]
    pub(crate) fn create(placement: Placement) -> Self {
        Self {
            owners: A::ONE,
            // The implicit unit held by the owners
            observers: A::ONE,
            placement,
        }
    }

    #[inline]
    pub(crate) fn add_owner(&self) {
        // Relaxed is enough: a new owner can only be made from an existing
        // one, and handing that one to another thread already synchronized.
        let old = self.owners.fetch_add(1, Ordering::Relaxed);

        // Racily saturate, on the assumption that there aren't billions of
        // threads cloning at once.
        if old > A::MAX_REFCOUNT {
            refcount_overflow("owner", old);
        }
    }

    /// Claim an owner share only if the payload is still alive
    ///
    /// The check and the increment are one compare-and-swap, so a concurrent
    /// final [`Ledger::drop_owner`] either happens before us (and we fail) or
    /// after us (and it is no longer final).
    #[inline]
    pub(crate) fn try_add_owner(&self) -> bool {
        let mut owners = self.owners.load(Ordering::Relaxed);

        loop {
            if owners == 0 {
                return false;
            }

            if owners > A::MAX_REFCOUNT {
                refcount_overflow("owner", owners);
            }

            // Acquire pairs with the release half of the decrements so the
            // payload we are about to hand out is fully visible.
            match self.owners.compare_exchange_weak(
                owners,
                owners + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => owners = observed,
            }
        }
    }

    #[inline]
    pub(crate) fn add_observer(&self) {
        // Relaxed for the same reason as `add_owner`: observers are only made
        // from a handle the caller already holds.
        let old = self.observers.fetch_add(1, Ordering::Relaxed);
        if old > A::MAX_REFCOUNT {
            refcount_overflow("observer", old);
        }
    }

    /// Advisory only, the count may change as soon as it has been read
    #[inline]
    pub(crate) fn read_owner_count(&self) -> u64 {
        self.owners.load(Ordering::Acquire)
    }

    /// Includes the implicit unit while any owner is alive
    #[inline]
    pub(crate) fn read_observer_count(&self) -> u64 {
        self.observers.load(Ordering::Acquire)
    }

    /// Move the owner count from 1 straight to 0 if the caller is the only owner
    ///
    /// On success the payload is the caller's to move out of, and the caller
    /// inherits the duty of releasing the implicit observer unit.
    #[inline]
    pub(crate) fn try_claim_unique(&self) -> bool {
        self.owners
            .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release one owner share, destroying the payload if it was the last
    ///
    /// # Safety
    ///
    /// `this` must point to a live ledger on which the caller holds an owner
    /// share, and `payload` must be the payload registered with it. Neither
    /// pointer may be used by the caller afterwards.
    #[inline]
    pub(crate) unsafe fn drop_owner<T: ?Sized>(this: NonNull<Self>, payload: NonNull<T>) {
        // AcqRel: every use of the payload through this handle happens before
        // the decrement, and the thread that destroys the payload observes
        // all of those uses.
        if this.as_ref().owners.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        Self::destroy_payload(this, payload);
    }

    // Non-inlined part of `drop_owner`
    #[inline(never)]
    #[cold]
    unsafe fn destroy_payload<T: ?Sized>(this: NonNull<Self>, payload: NonNull<T>) {
        // Hand back the owners' implicit unit even if the payload's destructor
        // unwinds, otherwise the ledger would leak.
        struct ReleaseImplicitUnit<A: Atomic>(NonNull<Ledger<A>>);

        impl<A: Atomic> Drop for ReleaseImplicitUnit<A> {
            #[inline]
            fn drop(&mut self) {
                unsafe { Ledger::drop_observer(self.0) }
            }
        }

        let _release = ReleaseImplicitUnit(this);
        log::trace!("last owner of ledger {:p} released, destroying payload", this);

        match this.as_ref().placement {
            Placement::Detached => drop(Box::from_raw(payload.as_ptr())),
            Placement::Inline(_) => ptr::drop_in_place(payload.as_ptr()),
        }
    }

    /// Move the payload out after a successful [`Ledger::try_claim_unique`]
    ///
    /// # Safety
    ///
    /// The caller must have just won `try_claim_unique` on `this`, `payload`
    /// must be the payload registered with it, and neither pointer may be used
    /// afterwards.
    pub(crate) unsafe fn unwrap_payload<T>(this: NonNull<Self>, payload: NonNull<T>) -> T {
        let value = match this.as_ref().placement {
            Placement::Detached => *Box::from_raw(payload.as_ptr()),
            Placement::Inline(_) => ptr::read(payload.as_ptr()),
        };

        Self::drop_observer(this);
        value
    }

    /// Release one observer unit, freeing the ledger if it was the last
    ///
    /// # Safety
    ///
    /// `this` must point to a live ledger on which the caller holds an
    /// observer unit (explicit, or the owners' implicit one), and the caller
    /// may not touch the ledger afterwards.
    #[inline]
    pub(crate) unsafe fn drop_observer(this: NonNull<Self>) {
        if this.as_ref().observers.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        Self::free(this);
    }

    // Non-inlined part of `drop_observer`
    #[inline(never)]
    #[cold]
    unsafe fn free(this: NonNull<Self>) {
        log::trace!("last observer of ledger {:p} released, freeing it", this);

        match this.as_ref().placement {
            Placement::Detached => drop(Box::from_raw(this.as_ptr())),
            // The payload was already destroyed in place, all that is left is
            // the memory of the block. The ledger sits at its start.
            Placement::Inline(layout) => dealloc(this.as_ptr().cast(), layout),
        }
    }
}

/// The pointer pair carried by every non-empty handle
pub(crate) struct Parts<T: ?Sized, A> {
    pub(crate) payload: NonNull<T>,
    pub(crate) ledger: NonNull<Ledger<A>>,
}

impl<T: ?Sized, A: Atomic> Parts<T, A> {
    /// Box a standalone ledger for an already boxed payload
    #[inline]
    pub(crate) fn detached(payload: Box<T>) -> Self {
        let ledger = Box::new(Ledger::<A>::create(Placement::Detached));

        unsafe {
            Self {
                payload: NonNull::new_unchecked(Box::into_raw(payload)),
                ledger: NonNull::new_unchecked(Box::into_raw(ledger)),
            }
        }
    }

    /// Whether both pairs belong to the same ledger
    #[inline]
    pub(crate) fn same_ledger(&self, other: &Self) -> bool {
        self.ledger == other.ledger
    }
}

impl<T: ?Sized, A> Clone for Parts<T, A> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized, A> Copy for Parts<T, A> {}
