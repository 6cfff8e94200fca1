use crate::{
    ledger::{Ledger, Parts},
    shared::Shared,
    Atomic,
};
use core::{fmt, sync::atomic::AtomicUsize};

/// A non-owning observer of a [`Shared`] payload
///
/// A `Weak` keeps the ledger alive but not the payload. It never hands out a
/// reference to the payload directly; [`Weak::lock`] or [`Weak::upgrade`]
/// must first turn it back into a [`Shared`], which fails once the last owner
/// is gone.
///
/// ```
/// # use tether::{Shared, Weak};
/// let owner = Shared::<u32>::new(10);
/// let observer = Weak::from(&owner);
/// assert!(!observer.expired());
///
/// drop(owner);
/// assert!(observer.expired());
/// assert!(observer.lock().is_empty());
/// ```
pub struct Weak<T: ?Sized, A: Atomic = AtomicUsize> {
    /// The payload and its ledger, `None` for an empty observer
    parts: Option<Parts<T, A>>,
}

impl<T: ?Sized, A: Atomic> Weak<T, A> {
    /// An empty [`Weak`] which observes nothing and never upgrades
    #[inline]
    pub const fn new() -> Self {
        Self { parts: None }
    }

    /// Start observing whatever `owner` owns, dropping the current observation
    #[inline]
    pub fn assign(&mut self, owner: &Shared<T, A>) {
        *self = Self::from(owner);
    }

    #[inline]
    fn ledger(&self) -> Option<&Ledger<A>> {
        // Our observer unit keeps the ledger allocated, even after the payload
        // it tracks has been destroyed.
        self.parts.map(|parts| unsafe { &*parts.ledger.as_ptr() })
    }

    /// Whether this observer was never attached to a payload
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parts.is_none()
    }

    /// Gets the number of [`Shared`]s owning the observed payload
    ///
    /// This is a snapshot, other threads may change it right after.
    #[inline]
    pub fn use_count(&self) -> u64 {
        self.ledger().map_or(0, Ledger::read_owner_count)
    }

    /// Gets the number of [`Weak`]s observing the payload, including this one
    ///
    /// Once the payload is gone this reports 0, like the standard library's `Weak::weak_count`.
    #[inline]
    pub fn weak_count(&self) -> u64 {
        self.ledger().map_or(0, |ledger| {
            if ledger.read_owner_count() == 0 {
                0
            } else {
                // Owners still hold their implicit unit. It can be released
                // between the two loads, hence the saturation.
                ledger.read_observer_count().saturating_sub(1)
            }
        })
    }

    /// Whether the observed payload has been destroyed
    ///
    /// Advisory under concurrency: a `false` may already be stale by the time
    /// it is inspected. Use [`Weak::lock`] to actually get at the payload.
    #[inline]
    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    /// Try to become an owner of the observed payload
    ///
    /// Returns an empty [`Shared`] if the payload has already been destroyed
    /// or if this observer is empty.
    #[inline]
    pub fn lock(&self) -> Shared<T, A> {
        match self.parts {
            // The owner share is claimed with a single compare-and-swap that
            // refuses to move the count off zero
            Some(parts) if unsafe { parts.ledger.as_ref() }.try_add_owner() => unsafe {
                Shared::from_parts(parts)
            },
            _ => Shared::empty(),
        }
    }

    /// Like [`Weak::lock`], with the failure spelled as `None`
    #[inline]
    pub fn upgrade(&self) -> Option<Shared<T, A>> {
        let shared = self.lock();
        if shared.is_empty() {
            None
        } else {
            Some(shared)
        }
    }

    /// Whether both observers track the same ledger. Two empty observers are equal.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.parts, &other.parts) {
            (Some(this), Some(other)) => this.same_ledger(other),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: ?Sized, A: Atomic> From<&Shared<T, A>> for Weak<T, A> {
    #[inline]
    fn from(owner: &Shared<T, A>) -> Self {
        if let Some(parts) = owner.parts {
            // The owner keeps the ledger alive while we register ourselves
            unsafe { parts.ledger.as_ref() }.add_observer();
        }

        Self { parts: owner.parts }
    }
}

impl<T: ?Sized, A: Atomic> Clone for Weak<T, A> {
    #[inline]
    fn clone(&self) -> Self {
        if let Some(ledger) = self.ledger() {
            ledger.add_observer();
        }

        Self { parts: self.parts }
    }

    #[inline]
    fn clone_from(&mut self, source: &Self) {
        if !self.ptr_eq(source) {
            *self = source.clone();
        }
    }
}

impl<T: ?Sized, A: Atomic> Drop for Weak<T, A> {
    #[inline]
    fn drop(&mut self) {
        if let Some(parts) = self.parts.take() {
            unsafe { Ledger::drop_observer(parts.ledger) }
        }
    }
}

impl<T: ?Sized, A: Atomic> Default for Weak<T, A> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized, A: Atomic> fmt::Debug for Weak<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("(Weak)")
    }
}

// No `T` is ever owned, only observed
unsafe impl<T: ?Sized + Sync + Send, A: Atomic + Send + Sync> Send for Weak<T, A> {}
unsafe impl<T: ?Sized + Sync + Send, A: Atomic + Send + Sync> Sync for Weak<T, A> {}
