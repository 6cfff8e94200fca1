use crate::{
    block::Block,
    error::AllocError,
    ledger::{Ledger, Parts},
    weak::Weak,
    Atomic,
};
use alloc::{alloc::handle_alloc_error, boxed::Box};
use bytemuck::Zeroable;
use core::{
    borrow::Borrow,
    cmp, fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ops::Deref,
    pin::Pin,
    ptr,
    sync::atomic::AtomicUsize,
};
#[cfg(feature = "serde")]
use serde::{
    de::{Deserialize, Deserializer},
    ser::{Error as _, Serialize, Serializer},
};

/// An atomically reference counted shared pointer that can be observed by [`Weak`]s
///
/// See the documentation for [`Arc`] in the standard library. Unlike the
/// standard library `Arc`, a `Shared` may be empty: [`Shared::default`] and
/// [`Shared::take`] produce handles that own nothing. Dereferencing an empty
/// handle panics, use [`Shared::get`] when emptiness is a possibility.
///
/// The payload is destroyed as soon as the last `Shared` goes away. The
/// ledger holding the counts stays around until every [`Weak`] is gone too.
///
/// [`Arc`]: std::sync::Arc
pub struct Shared<T: ?Sized, A: Atomic = AtomicUsize> {
    /// The payload and its ledger, `None` for an empty handle
    pub(crate) parts: Option<Parts<T, A>>,
    /// A PhantomData that conveys ownership of a `T` to the drop checker
    pub(crate) __type: PhantomData<T>,
}

impl<T: ?Sized, A: Atomic> Shared<T, A> {
    /// An empty [`Shared`] which owns nothing and allocates nothing
    #[inline]
    pub const fn empty() -> Self {
        Self {
            parts: None,
            __type: PhantomData,
        }
    }

    /// Construct a [`Shared`] with the ledger and `data` in a single allocation
    ///
    /// Aborts through [`handle_alloc_error`] if the allocation fails, see
    /// [`Shared::try_new`] for a fallible version.
    #[inline]
    pub fn new(data: T) -> Self
    where
        T: Sized,
    {
        Self::new_with(move || data)
    }

    /// Construct a [`Shared`] whose payload is built by `init` once the block exists
    ///
    /// `init` only runs once the combined allocation exists, its result is
    /// moved into the payload slot. If it panics the block is released before
    /// the panic carries on.
    ///
    /// ```
    /// # use tether::Shared;
    /// let shared: Shared<Vec<u8>> = Shared::new_with(|| Vec::with_capacity(10));
    /// assert!(shared.capacity() >= 10);
    /// ```
    #[inline]
    pub fn new_with<F>(init: F) -> Self
    where
        T: Sized,
        F: FnOnce() -> T,
    {
        match Block::try_emplace(move || Ok::<_, AllocError>(init())) {
            Ok(parts) => unsafe { Self::from_parts(parts) },
            Err(error) => handle_alloc_error(error.layout()),
        }
    }

    /// Construct a [`Shared`] in a single allocation, returning an error if
    /// the allocation fails
    #[inline]
    pub fn try_new(data: T) -> Result<Self, AllocError>
    where
        T: Sized,
    {
        Self::try_new_with(move || Ok(data))
    }

    /// Construct a [`Shared`] from a fallible initializer
    ///
    /// Both allocation failure and a failing `init` come back as `E`, and in
    /// either case nothing stays allocated.
    ///
    /// ```
    /// # use tether::{AllocError, Shared};
    /// #[derive(Debug)]
    /// enum Error {
    ///     Alloc(AllocError),
    ///     Parse(std::num::ParseIntError),
    /// }
    ///
    /// impl From<AllocError> for Error {
    ///     fn from(error: AllocError) -> Self {
    ///         Self::Alloc(error)
    ///     }
    /// }
    ///
    /// let parsed: Result<Shared<u32>, Error> =
    ///     Shared::try_new_with(|| "10".parse().map_err(Error::Parse));
    /// assert_eq!(*parsed.unwrap(), 10);
    ///
    /// let failed: Result<Shared<u32>, Error> =
    ///     Shared::try_new_with(|| "ten".parse().map_err(Error::Parse));
    /// assert!(matches!(failed, Err(Error::Parse(_))));
    /// ```
    #[inline]
    pub fn try_new_with<F, E>(init: F) -> Result<Self, E>
    where
        T: Sized,
        F: FnOnce() -> Result<T, E>,
        E: From<AllocError>,
    {
        let parts = Block::try_emplace(init)?;
        Ok(unsafe { Self::from_parts(parts) })
    }

    /// Construct a [`Shared`] whose payload is all zeroes, without ever
    /// building the payload on the stack
    #[inline]
    pub fn zeroed() -> Self
    where
        T: Zeroable,
    {
        match Self::try_zeroed() {
            Ok(shared) => shared,
            Err(error) => handle_alloc_error(error.layout()),
        }
    }

    /// Fallible version of [`Shared::zeroed`]
    #[inline]
    pub fn try_zeroed() -> Result<Self, AllocError>
    where
        T: Zeroable,
    {
        let parts = Block::try_zeroed()?;
        Ok(unsafe { Self::from_parts(parts) })
    }

    /// Take shared ownership of an already boxed payload
    ///
    /// The payload is not moved or copied, a standalone ledger is allocated
    /// next to it. This also works for unsized payloads.
    ///
    /// ```
    /// # use tether::Shared;
    /// let shared: Shared<str> = Shared::from_box("hello".into());
    /// assert_eq!(&*shared, "hello");
    /// ```
    #[inline]
    pub fn from_box(data: Box<T>) -> Self {
        unsafe { Self::from_parts(Parts::detached(data)) }
    }

    /// Constructs a new `Pin<Shared<T>>`. If `T` does not implement [`Unpin`](core::marker::Unpin),
    /// then `data` will be pinned in memory and unable to be moved.
    #[inline]
    pub fn pin(data: T) -> Pin<Self>
    where
        T: Sized,
    {
        unsafe { Pin::new_unchecked(Self::new(data)) }
    }

    /// Wrap parts that already carry one owner share for the caller
    #[inline]
    pub(crate) unsafe fn from_parts(parts: Parts<T, A>) -> Self {
        Self {
            parts: Some(parts),
            __type: PhantomData,
        }
    }

    #[inline]
    fn ledger(&self) -> Option<&Ledger<A>> {
        // This unsafety is ok because while this handle is alive it holds an
        // owner share, and through it the implicit observer unit, so the
        // ledger cannot be freed under us.
        self.parts.map(|parts| unsafe { &*parts.ledger.as_ptr() })
    }

    /// A reference to the payload, or `None` if the handle is empty
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // While we hold an owner share the payload cannot be destroyed
        self.parts.map(|parts| unsafe { &*parts.payload.as_ptr() })
    }

    /// Whether this handle owns nothing
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parts.is_none()
    }

    /// Gets the number of [`Shared`]s owning this payload, 0 for an empty handle
    #[inline]
    pub fn use_count(&self) -> u64 {
        self.ledger().map_or(0, Ledger::read_owner_count)
    }

    /// Gets the number of [`Weak`]s observing this payload, 0 for an empty handle
    #[inline]
    pub fn weak_count(&self) -> u64 {
        // We are an owner, so the implicit unit is still in the count
        self.ledger()
            .map_or(0, |ledger| ledger.read_observer_count() - 1)
    }

    /// Moves out of `this`, leaving it empty
    ///
    /// No count changes: ownership is transferred, not duplicated.
    #[inline]
    pub fn take(this: &mut Self) -> Self {
        mem::take(this)
    }

    /// Create a [`Weak`] observing this payload
    #[inline]
    pub fn downgrade(this: &Self) -> Weak<T, A> {
        Weak::from(this)
    }

    /// Test pointer equality between the two [`Shared`]s, i.e. they must share
    /// the *same* ledger. Two empty handles are equal.
    #[inline]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        match (&this.parts, &other.parts) {
            (Some(this), Some(other)) => this.same_ledger(other),
            (None, None) => true,
            _ => false,
        }
    }

    /// Returns the address on the heap of the ledger -- not the T it tracks
    /// -- for memory reporting. Null for an empty handle.
    #[inline]
    pub fn heap_ptr(&self) -> *const () {
        self.parts
            .map_or(ptr::null(), |parts| parts.ledger.as_ptr() as *const ())
    }

    /// Returns the payload if this is its only [`Shared`], otherwise gives
    /// `this` back
    ///
    /// Outstanding [`Weak`]s are fine, they will report the payload as expired.
    #[inline]
    pub fn try_unwrap(this: Self) -> Result<T, Self>
    where
        T: Sized,
    {
        let Some(parts) = this.parts else {
            return Err(this);
        };

        if !unsafe { parts.ledger.as_ref() }.try_claim_unique() {
            return Err(this);
        }

        // The owner share was consumed by the claim
        let _this = ManuallyDrop::new(this);
        Ok(unsafe { Ledger::unwrap_payload(parts.ledger, parts.payload) })
    }
}

impl<T: ?Sized, A: Atomic> Clone for Shared<T, A> {
    #[inline]
    fn clone(&self) -> Self {
        if let Some(ledger) = self.ledger() {
            ledger.add_owner();
        }

        Self {
            parts: self.parts,
            __type: PhantomData,
        }
    }

    #[inline]
    fn clone_from(&mut self, source: &Self) {
        if !Self::ptr_eq(self, source) {
            *self = source.clone();
        }
    }
}

impl<T: ?Sized, A: Atomic> Deref for Shared<T, A> {
    type Target = T;

    #[inline]
    #[track_caller]
    fn deref(&self) -> &T {
        match self.get() {
            Some(data) => data,
            None => empty_deref(),
        }
    }
}

#[cold]
#[track_caller]
fn empty_deref() -> ! {
    panic!("dereferenced an empty `Shared`")
}

impl<T: ?Sized, A: Atomic> Drop for Shared<T, A> {
    #[inline]
    fn drop(&mut self) {
        if let Some(parts) = self.parts.take() {
            unsafe { Ledger::drop_owner(parts.ledger, parts.payload) }
        }
    }
}

impl<T: ?Sized, A: Atomic> Default for Shared<T, A> {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized + PartialEq, A: Atomic> PartialEq for Shared<T, A> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other) || self.get() == other.get()
    }
}

impl<T: ?Sized + PartialOrd, A: Atomic> PartialOrd for Shared<T, A> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        self.get().partial_cmp(&other.get())
    }
}

impl<T: ?Sized + Ord, A: Atomic> Ord for Shared<T, A> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.get().cmp(&other.get())
    }
}

impl<T: ?Sized + Eq, A: Atomic> Eq for Shared<T, A> {}

impl<T: ?Sized + fmt::Display, A: Atomic> fmt::Display for Shared<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.get() {
            Some(data) => fmt::Display::fmt(data, f),
            None => f.write_str("Empty"),
        }
    }
}

impl<T: ?Sized + fmt::Debug, A: Atomic> fmt::Debug for Shared<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.get() {
            Some(data) => fmt::Debug::fmt(data, f),
            None => f.write_str("Empty"),
        }
    }
}

impl<T: ?Sized, A: Atomic> fmt::Pointer for Shared<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Pointer::fmt(&self.heap_ptr(), f)
    }
}

impl<T: ?Sized + Hash, A: Atomic> Hash for Shared<T, A> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hashes exactly like the payload so lookups through `Borrow<T>` work
        if let Some(data) = self.get() {
            data.hash(state);
        }
    }
}

impl<T, A: Atomic> From<T> for Shared<T, A> {
    #[inline]
    fn from(val: T) -> Self {
        Self::new(val)
    }
}

impl<T: ?Sized, A: Atomic> From<Box<T>> for Shared<T, A> {
    #[inline]
    fn from(val: Box<T>) -> Self {
        Self::from_box(val)
    }
}

impl<T: ?Sized, A: Atomic> Borrow<T> for Shared<T, A> {
    #[inline]
    fn borrow(&self) -> &T {
        self
    }
}

impl<T: ?Sized, A: Atomic> AsRef<T> for Shared<T, A> {
    #[inline]
    fn as_ref(&self) -> &T {
        self
    }
}

#[cfg(feature = "serde")]
impl<'de, T: Deserialize<'de>, A: Atomic> Deserialize<'de> for Shared<T, A> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        T::deserialize(deserializer).map(Self::new)
    }
}

#[cfg(feature = "serde")]
impl<T: ?Sized + Serialize, A: Atomic> Serialize for Shared<T, A> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.get() {
            Some(data) => data.serialize(serializer),
            None => Err(S::Error::custom("cannot serialize an empty `Shared`")),
        }
    }
}

impl<T: ?Sized, A: Atomic> Unpin for Shared<T, A> {}

unsafe impl<T: ?Sized + Sync + Send, A: Atomic + Send + Sync> Send for Shared<T, A> {}
unsafe impl<T: ?Sized + Sync + Send, A: Atomic + Send + Sync> Sync for Shared<T, A> {}
