use core::alloc::Layout;
use thiserror::Error;

/// The allocator refused to hand out memory for a ledger or a combined block
///
/// Returned by the fallible constructors ([`Shared::try_new`] and friends).
/// Nothing is left allocated when this is returned.
///
/// [`Shared::try_new`]: crate::Shared::try_new
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to allocate {} bytes aligned to {}", .layout.size(), .layout.align())]
pub struct AllocError {
    layout: Layout,
}

impl AllocError {
    #[inline]
    pub(crate) const fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// The layout of the allocation that failed
    #[inline]
    pub const fn layout(&self) -> Layout {
        self.layout
    }
}
