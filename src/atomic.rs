use crate::sealed::Sealed;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// An atomic integer usable as a ledger counter
///
/// Every counter operation is widened to `u64` so the ledger logic can be
/// written once for all widths. Narrow counters trade headroom for a smaller
/// ledger; an increment past [`Atomic::MAX_REFCOUNT`] aborts the process.
pub trait Atomic: Sealed {
    /// The maximum allowed count for the current [`Atomic`]
    const MAX_REFCOUNT: u64;

    /// An [`Atomic`] with a value of 1
    const ONE: Self;

    /// Atomically load the current value
    fn load(&self, order: Ordering) -> u64;

    /// Atomically add to the current value, returning the previous value
    fn fetch_add(&self, val: u64, order: Ordering) -> u64;

    /// Atomically subtract from the current value, returning the previous value
    fn fetch_sub(&self, val: u64, order: Ordering) -> u64;

    /// Store `new` if the current value is `current`, possibly failing spuriously
    ///
    /// On failure the freshly observed value is returned in `Err`
    fn compare_exchange_weak(
        &self,
        current: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u64, u64>;

    /// Store `new` if the current value is `current`
    fn compare_exchange(
        &self,
        current: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u64, u64>;
}

macro_rules! impl_atomic {
    ($($atomic:ty => $max_refcount:expr),* $(,)?) => {
        $(
            impl Atomic for $atomic {
                const MAX_REFCOUNT: u64 = $max_refcount as u64;

                #[allow(clippy::declare_interior_mutable_const)]
                const ONE: Self = Self::new(1);

                #[inline]
                fn load(&self, order: Ordering) -> u64 {
                    <$atomic>::load(self, order) as u64
                }

                #[inline]
                fn fetch_add(&self, val: u64, order: Ordering) -> u64 {
                    <$atomic>::fetch_add(self, val as _, order) as u64
                }

                #[inline]
                fn fetch_sub(&self, val: u64, order: Ordering) -> u64 {
                    <$atomic>::fetch_sub(self, val as _, order) as u64
                }

                #[inline]
                fn compare_exchange_weak(
                    &self,
                    current: u64,
                    new: u64,
                    success: Ordering,
                    failure: Ordering,
                ) -> Result<u64, u64> {
                    <$atomic>::compare_exchange_weak(self, current as _, new as _, success, failure)
                        .map(|value| value as u64)
                        .map_err(|value| value as u64)
                }

                #[inline]
                fn compare_exchange(
                    &self,
                    current: u64,
                    new: u64,
                    success: Ordering,
                    failure: Ordering,
                ) -> Result<u64, u64> {
                    <$atomic>::compare_exchange(self, current as _, new as _, success, failure)
                        .map(|value| value as u64)
                        .map_err(|value| value as u64)
                }
            }

            impl Sealed for $atomic {}
        )*
    };
}

impl_atomic! {
    AtomicUsize => isize::MAX,
    AtomicU64 => i64::MAX,
    AtomicU32 => i32::MAX,
    AtomicU16 => i16::MAX,
    AtomicU8 => i8::MAX,
}

#[cfg(test)]
mod tests {
    use super::Atomic;
    use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

    #[test]
    fn widened_operations() {
        let count = <AtomicU8 as Atomic>::ONE;
        assert_eq!(Atomic::fetch_add(&count, 2, Ordering::Relaxed), 1);
        assert_eq!(Atomic::fetch_sub(&count, 1, Ordering::Relaxed), 3);
        assert_eq!(Atomic::load(&count, Ordering::Relaxed), 2);
        assert_eq!(<AtomicU8 as Atomic>::MAX_REFCOUNT, 127);
    }

    #[test]
    fn compare_exchange_reports_observed_value() {
        let count = <AtomicUsize as Atomic>::ONE;
        assert_eq!(
            Atomic::compare_exchange(&count, 2, 3, Ordering::Acquire, Ordering::Relaxed),
            Err(1),
        );
        assert_eq!(
            Atomic::compare_exchange(&count, 1, 0, Ordering::Acquire, Ordering::Relaxed),
            Ok(1),
        );
    }
}
